//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define handoff metrics (active work, restart attempts, drains, requests)
//! - Expose Prometheus-compatible metrics endpoint when enabled
//!
//! # Metrics
//! - `handoff_active_work` (gauge): in-flight units of work in this process
//! - `handoff_restart_attempts_total` (counter): attempts by terminal outcome
//! - `handoff_drains_total` (counter): drains by reason and outcome
//! - `handoff_requests_total` (counter): requests handled by this process
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op
//! - Exporter install failure is logged, never fatal
//! - A successor starts while its predecessor still holds the scrape port, so
//!   the install is retried until the predecessor exits

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Pause between exporter install attempts.
pub const EXPORTER_RETRY_INTERVAL: Duration = Duration::from_secs(1);
/// Install attempts before giving up; covers a predecessor's default drain deadline.
pub const EXPORTER_RETRY_ATTEMPTS: u32 = 90;

fn install(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    describe();
    tracing::info!(metrics_address = %addr, "Prometheus exporter listening");
    Ok(())
}

/// Install the Prometheus exporter with an HTTP scrape listener on `addr`.
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> bool {
    match install(addr) {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(metrics_address = %addr, error = %e, "Failed to install metrics exporter");
            false
        }
    }
}

/// Install the exporter, retrying every `interval` while `addr` is taken.
pub async fn init_metrics_with_retry(addr: SocketAddr, interval: Duration, attempts: u32) -> bool {
    for attempt in 1..=attempts {
        match install(addr) {
            Ok(()) => return true,
            Err(e) if attempt < attempts => {
                tracing::debug!(
                    metrics_address = %addr,
                    attempt,
                    error = %e,
                    "Metrics exporter not installed yet; retrying"
                );
                tokio::time::sleep(interval).await;
            }
            Err(e) => {
                tracing::error!(
                    metrics_address = %addr,
                    attempts,
                    error = %e,
                    "Failed to install metrics exporter"
                );
            }
        }
    }
    false
}

fn describe() {
    metrics::describe_gauge!("handoff_active_work", "In-flight units of work");
    metrics::describe_counter!(
        "handoff_restart_attempts_total",
        "Restart attempts by terminal outcome"
    );
    metrics::describe_counter!("handoff_drains_total", "Drains by reason and outcome");
    metrics::describe_counter!("handoff_requests_total", "Requests handled");
}

pub fn set_active_work(active: usize) {
    metrics::gauge!("handoff_active_work").set(active as f64);
}

pub fn record_restart_attempt(outcome: &'static str) {
    metrics::counter!("handoff_restart_attempts_total", "outcome" => outcome).increment(1);
}

pub fn record_drain(reason: &'static str, outcome: &'static str) {
    metrics::counter!("handoff_drains_total", "reason" => reason, "outcome" => outcome)
        .increment(1);
}

pub fn record_request() {
    metrics::counter!("handoff_requests_total").increment(1);
}
