//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events with pid/instance fields)
//!     → metrics.rs (counters, gauges)
//!
//! Consumers:
//!     → stderr (shared by predecessor and successor)
//!     → Metrics endpoint (Prometheus scrape, optional)
//! ```

pub mod logging;
pub mod metrics;
