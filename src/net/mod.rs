//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Startup
//!     → listener.rs (fresh bind, or adopt inherited descriptor)
//!     → listener.rs (bounded accept loop, connection limits)
//!     → connection.rs (unit-of-work tracking per connection)
//!     → Hand off to HTTP layer
//!
//! Work States:
//!     Started → Idle → Started → ... → Completed | Aborted
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Every unit of work is tracked so drain knows when to exit
//! - The listener descriptor is duplicated, never moved, during handoff

pub mod connection;
pub mod listener;

pub use connection::{ConnectionId, ConnectionTracker, WorkEvent, WorkGuard};
pub use listener::{acquire, AcquireError, AcquireMode, AddressFamily, ListenerHandle, ListenerOrigin};
