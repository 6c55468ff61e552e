//! Demo workload served by the binary.
//!
//! Every Nth request is a slow unit of work that logs a heartbeat while it
//! runs, so a handoff can be observed with work in flight.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use tokio::time::{interval_at, sleep_until, Instant};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::WorkloadConfig;
use crate::lifecycle::startup::{ProcessIdentity, ProcessRole};
use crate::net::connection::ConnectionTracker;
use crate::observability::metrics;

/// Shape of the demo work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Workload {
    /// Every Nth request is slow; 0 disables the slow path.
    pub slow_every_n: u64,
    pub work_duration: Duration,
    pub heartbeat_interval: Duration,
}

impl Workload {
    pub fn is_slow(&self, sequence: u64) -> bool {
        self.slow_every_n > 0 && sequence % self.slow_every_n == 0
    }
}

impl From<&WorkloadConfig> for Workload {
    fn from(config: &WorkloadConfig) -> Self {
        Self {
            slow_every_n: config.slow_every_n,
            work_duration: Duration::from_secs(config.work_duration_secs),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs),
        }
    }
}

#[derive(Clone)]
struct AppState {
    identity: Arc<ProcessIdentity>,
    workload: Workload,
    tracker: ConnectionTracker,
    requests: Arc<AtomicU64>,
}

#[derive(Debug, Serialize)]
struct StatusBody {
    pid: u32,
    instance: String,
    role: ProcessRole,
    requests_served: u64,
    active_work: usize,
}

/// Build the demo router: `/status` reports process state, anything else is
/// the hello handler.
#[allow(deprecated)]
pub fn router(
    identity: ProcessIdentity,
    workload: Workload,
    tracker: ConnectionTracker,
    request_timeout: Duration,
) -> Router {
    let state = AppState {
        identity: Arc::new(identity),
        workload,
        tracker,
        requests: Arc::new(AtomicU64::new(0)),
    };

    Router::new()
        .route("/status", get(status_handler))
        .fallback(hello_handler)
        .with_state(state)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
}

async fn hello_handler(State(state): State<AppState>) -> String {
    let sequence = state.requests.fetch_add(1, Ordering::Relaxed) + 1;
    metrics::record_request();

    if state.workload.is_slow(sequence) {
        slow_work(&state, sequence).await;
    }

    format!(
        "hello world from pid={} instance={} req={}\n",
        state.identity.pid(),
        state.identity.instance(),
        sequence
    )
}

async fn slow_work(state: &AppState, sequence: u64) {
    let Workload {
        work_duration,
        heartbeat_interval,
        ..
    } = state.workload;

    tracing::info!(
        pid = state.identity.pid(),
        req = sequence,
        duration_secs = work_duration.as_secs(),
        "Slow unit of work started"
    );

    let started = Instant::now();
    let done = sleep_until(started + work_duration);
    tokio::pin!(done);

    if heartbeat_interval.is_zero() {
        done.await;
    } else {
        let mut heartbeat = interval_at(started + heartbeat_interval, heartbeat_interval);
        loop {
            tokio::select! {
                _ = &mut done => break,
                _ = heartbeat.tick() => tracing::info!(
                    pid = state.identity.pid(),
                    req = sequence,
                    elapsed_secs = started.elapsed().as_secs(),
                    active = state.tracker.active_count(),
                    "Slow unit of work heartbeat"
                ),
            }
        }
    }

    tracing::info!(pid = state.identity.pid(), req = sequence, "Slow unit of work finished");
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusBody> {
    Json(StatusBody {
        pid: state.identity.pid(),
        instance: state.identity.instance().to_string(),
        role: state.identity.role(),
        requests_served: state.requests.load(Ordering::Relaxed),
        active_work: state.tracker.active_count(),
    })
}
