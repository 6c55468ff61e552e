//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the service.
//! All types derive Serde traits for deserialization from config files.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct HandoffConfig {
    /// Listener configuration (bind address, limits).
    pub listener: ListenerConfig,

    /// Restart (upgrade) settings.
    pub restart: RestartConfig,

    /// Drain settings.
    pub drain: DrainConfig,

    /// Demo workload shape.
    pub workload: WorkloadConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address for a fresh start (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_connections: 10_000,
        }
    }
}

/// Restart configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RestartConfig {
    /// Executable launched on upgrade. Defaults to the running executable.
    pub successor_binary: Option<PathBuf>,

    /// How long to wait for the successor's ready sentinel.
    pub handshake_timeout_secs: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            successor_binary: None,
            handshake_timeout_secs: 10,
        }
    }
}

/// Drain configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DrainConfig {
    /// Forced exit after this long, regardless of outstanding work.
    pub deadline_secs: u64,

    /// Active-work polling cadence.
    pub poll_interval_ms: u64,

    /// Time allowed for connections to flush once work reaches zero.
    pub flush_grace_ms: u64,

    /// Time an accepted connection with no request yet may take to send one.
    pub first_request_grace_ms: u64,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            deadline_secs: 60,
            poll_interval_ms: 1_000,
            flush_grace_ms: 2_000,
            first_request_grace_ms: 1_000,
        }
    }
}

/// Demo workload configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Every Nth request is slow; 0 disables the slow path.
    pub slow_every_n: u64,

    /// Duration of a slow unit of work in seconds.
    pub work_duration_secs: u64,

    /// Heartbeat log cadence during slow work in seconds.
    pub heartbeat_interval_secs: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            slow_every_n: 3,
            work_duration_secs: 10,
            heartbeat_interval_secs: 1,
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Request timeout (total time for request/response) in seconds.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { request_secs: 30 }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Fallback tracing filter when `RUST_LOG` is unset.
    pub log_filter: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_filter: "graceful_handoff=info,tower_http=info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
