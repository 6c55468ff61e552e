//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (accept loop, hyper HTTP/1.1, work tracking)
//!     → workload.rs (axum Router: hello handler, /status)
//!     → Send to client
//! ```

pub mod server;
pub mod workload;

pub use server::{HttpServer, ServingHandle};
pub use workload::{router, Workload};
