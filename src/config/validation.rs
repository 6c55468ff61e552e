//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, addresses parse)
//! - Check cross-field constraints (request timeout outlives slow work)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: HandoffConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::HandoffConfig;

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field}: {value:?} is not a socket address")]
    InvalidAddress { field: &'static str, value: String },
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("timeouts.request_secs ({request_secs}) must exceed workload.work_duration_secs ({work_duration_secs})")]
    RequestTimeoutTooShort {
        request_secs: u64,
        work_duration_secs: u64,
    },
}

/// Check a configuration, collecting every problem.
pub fn validate_config(config: &HandoffConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field: "listener.bind_address",
            value: config.listener.bind_address.clone(),
        });
    }

    let positive = [
        ("listener.max_connections", config.listener.max_connections as u64),
        ("restart.handshake_timeout_secs", config.restart.handshake_timeout_secs),
        ("drain.deadline_secs", config.drain.deadline_secs),
        ("drain.poll_interval_ms", config.drain.poll_interval_ms),
        ("timeouts.request_secs", config.timeouts.request_secs),
    ];
    errors.extend(
        positive
            .into_iter()
            .filter(|(_, value)| *value == 0)
            .map(|(field, _)| ValidationError::Zero { field }),
    );

    let workload = &config.workload;
    if workload.slow_every_n > 0 {
        if workload.heartbeat_interval_secs == 0 {
            errors.push(ValidationError::Zero {
                field: "workload.heartbeat_interval_secs",
            });
        }
        if config.timeouts.request_secs <= workload.work_duration_secs {
            errors.push(ValidationError::RequestTimeoutTooShort {
                request_secs: config.timeouts.request_secs,
                work_duration_secs: workload.work_duration_secs,
            });
        }
    }

    let observability = &config.observability;
    if observability.metrics_enabled && observability.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field: "observability.metrics_address",
            value: observability.metrics_address.clone(),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
