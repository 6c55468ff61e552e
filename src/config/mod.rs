//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML, optional)
//!     → loader.rs (parse & deserialize)
//!     → cli.rs overrides (flags and environment markers)
//!     → validation.rs (semantic checks)
//!     → HandoffConfig (validated, immutable)
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; a successor re-reads it at startup
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, read_config, ConfigError};
pub use schema::{
    DrainConfig, HandoffConfig, ListenerConfig, ObservabilityConfig, RestartConfig, TimeoutConfig,
    WorkloadConfig,
};
pub use validation::{validate_config, ValidationError};
