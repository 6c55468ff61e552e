//! Zero-downtime listener handoff between process generations.

#[cfg(not(unix))]
compile_error!("graceful-handoff passes descriptors across exec and requires a Unix target");

pub mod cli;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;

pub use config::schema::HandoffConfig;
pub use http::{HttpServer, ServingHandle};
pub use lifecycle::Coordinator;
