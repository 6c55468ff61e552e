//! Drain-and-exit sequencing.
//!
//! # Responsibilities
//! - Stop accepting (closes this process's listener descriptor)
//! - Ask open connections to finish their current request and close
//! - Poll until in-flight work reaches zero and no accepted connection is
//!   still waiting on its first request, or the deadline passes
//! - Produce a [`DrainReport`] the binary turns into an exit code
//!
//! # Design Decisions
//! - `DrainController::run` consumes the controller, so a drain cannot restart
//! - A drain that hits its deadline still exits with code 0; the outstanding
//!   count is surfaced as a warning and in the report

use std::fmt;
use std::time::Duration;

use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};

use crate::config::DrainConfig;
use crate::http::server::ServingHandle;
use crate::lifecycle::startup::ProcessIdentity;
use crate::net::connection::ConnectionTracker;
use crate::observability::metrics;

/// Exit code for both drain outcomes.
pub const EXIT_DRAINED: i32 = 0;

/// Timing of a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainPolicy {
    pub deadline: Duration,
    pub poll_interval: Duration,
    pub flush_grace: Duration,
}

impl Default for DrainPolicy {
    fn default() -> Self {
        Self::from(&DrainConfig::default())
    }
}

impl From<&DrainConfig> for DrainPolicy {
    fn from(config: &DrainConfig) -> Self {
        Self {
            deadline: Duration::from_secs(config.deadline_secs),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            flush_grace: Duration::from_millis(config.flush_grace_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainReason {
    /// A successor signalled readiness and owns the listener.
    Handoff,
    /// Shutdown was requested; there is no successor.
    Shutdown,
}

impl DrainReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DrainReason::Handoff => "handoff",
            DrainReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for DrainReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// All in-flight work finished.
    Drained,
    /// The deadline passed with work still in flight.
    DeadlineElapsed { outstanding: usize },
}

impl DrainOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            DrainOutcome::Drained => "drained",
            DrainOutcome::DeadlineElapsed { .. } => "deadline_elapsed",
        }
    }
}

/// Result of a completed drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub reason: DrainReason,
    pub outcome: DrainOutcome,
    pub elapsed: Duration,
}

impl DrainReport {
    pub fn exit_code(&self) -> i32 {
        EXIT_DRAINED
    }
}

/// Drives one drain to completion.
pub struct DrainController {
    tracker: ConnectionTracker,
    policy: DrainPolicy,
    identity: ProcessIdentity,
}

impl DrainController {
    pub fn new(tracker: ConnectionTracker, policy: DrainPolicy, identity: ProcessIdentity) -> Self {
        Self {
            tracker,
            policy,
            identity,
        }
    }

    pub async fn run(self, reason: DrainReason, serving: &mut ServingHandle) -> DrainReport {
        let started = Instant::now();
        tracing::info!(
            pid = self.identity.pid(),
            instance = %self.identity.instance(),
            %reason,
            active = self.tracker.active_count(),
            deadline_secs = self.policy.deadline.as_secs(),
            "Drain started"
        );

        serving.stop_accepting().await;
        serving.close_connections();

        let deadline = sleep_until(started + self.policy.deadline);
        tokio::pin!(deadline);
        let mut poll = interval_at(started + self.policy.poll_interval, self.policy.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            if self.tracker.active_count() == 0 && serving.awaiting_first_request() == 0 {
                break DrainOutcome::Drained;
            }
            tokio::select! {
                biased;
                _ = &mut deadline => {
                    break match self.tracker.active_count() {
                        0 => DrainOutcome::Drained,
                        outstanding => DrainOutcome::DeadlineElapsed { outstanding },
                    };
                }
                _ = poll.tick() => {
                    let active = self.tracker.active_count();
                    metrics::set_active_work(active);
                    tracing::info!(
                        pid = self.identity.pid(),
                        instance = %self.identity.instance(),
                        active,
                        awaiting_first_request = serving.awaiting_first_request(),
                        "Waiting for in-flight work"
                    );
                }
            }
        };

        match outcome {
            DrainOutcome::Drained => {
                if !serving.wait_connections(self.policy.flush_grace).await {
                    tracing::debug!(
                        open_connections = serving.open_connections(),
                        "Connections still flushing at exit"
                    );
                }
            }
            DrainOutcome::DeadlineElapsed { outstanding } => tracing::warn!(
                pid = self.identity.pid(),
                instance = %self.identity.instance(),
                outstanding,
                "Drain deadline elapsed; exiting with work in flight"
            ),
        }

        let report = DrainReport {
            reason,
            outcome,
            elapsed: started.elapsed(),
        };
        metrics::record_drain(reason.as_str(), outcome.as_str());
        tracing::info!(
            pid = self.identity.pid(),
            instance = %self.identity.instance(),
            %reason,
            outcome = outcome.as_str(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Drain complete"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::server::HttpServer;
    use crate::net::listener::{acquire, AcquireMode};
    use axum::routing::get;
    use axum::Router;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn policy(deadline_ms: u64) -> DrainPolicy {
        DrainPolicy {
            deadline: Duration::from_millis(deadline_ms),
            poll_interval: Duration::from_millis(10),
            flush_grace: Duration::from_millis(100),
        }
    }

    async fn serving(tracker: &ConnectionTracker) -> ServingHandle {
        let listener = acquire(AcquireMode::Fresh("127.0.0.1:0".parse().unwrap()))
            .await
            .unwrap();
        HttpServer::new(Router::new(), tracker.clone(), 8, ProcessIdentity::fresh()).start(listener)
    }

    #[tokio::test]
    async fn idle_process_drains_immediately() {
        let tracker = ConnectionTracker::new();
        let mut serving = serving(&tracker).await;
        let addr = serving.local_addr();

        let controller = DrainController::new(tracker, policy(5_000), ProcessIdentity::fresh());
        let report = controller.run(DrainReason::Shutdown, &mut serving).await;

        assert_eq!(report.outcome, DrainOutcome::Drained);
        assert_eq!(report.exit_code(), 0);
        assert!(report.elapsed < Duration::from_secs(1));
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn waits_for_work_to_finish() {
        let tracker = ConnectionTracker::new();
        let mut serving = serving(&tracker).await;

        let guards: Vec<_> = (0..3)
            .map(|_| tracker.begin(tracker.next_connection_id()))
            .collect();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            guards.into_iter().for_each(|guard| guard.finish());
        });

        let controller = DrainController::new(tracker.clone(), policy(5_000), ProcessIdentity::fresh());
        let report = controller.run(DrainReason::Handoff, &mut serving).await;

        assert_eq!(report.reason, DrainReason::Handoff);
        assert_eq!(report.outcome, DrainOutcome::Drained);
        assert!(report.elapsed >= Duration::from_millis(100));
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn deadline_reports_outstanding_work() {
        let tracker = ConnectionTracker::new();
        let mut serving = serving(&tracker).await;
        let _stuck: Vec<_> = (0..3)
            .map(|_| tracker.begin(tracker.next_connection_id()))
            .collect();

        let controller = DrainController::new(tracker.clone(), policy(150), ProcessIdentity::fresh());
        let report = controller.run(DrainReason::Shutdown, &mut serving).await;

        assert_eq!(report.outcome, DrainOutcome::DeadlineElapsed { outstanding: 3 });
        assert_eq!(report.exit_code(), 0);
        assert!(report.elapsed >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn connection_accepted_before_drain_gets_its_response() {
        let tracker = ConnectionTracker::new();
        let listener = acquire(AcquireMode::Fresh("127.0.0.1:0".parse().unwrap()))
            .await
            .unwrap();
        let router = Router::new().route("/", get(|| async { "late" }));
        let mut serving =
            HttpServer::new(router, tracker.clone(), 8, ProcessIdentity::fresh()).start(listener);

        let mut stream = tokio::net::TcpStream::connect(serving.local_addr())
            .await
            .unwrap();
        while serving.awaiting_first_request() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let controller = DrainController::new(tracker, policy(5_000), ProcessIdentity::fresh());
        let client = async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stream
                .write_all(b"GET / HTTP/1.1\r\nhost: test\r\nconnection: close\r\n\r\n")
                .await
                .unwrap();
            let mut response = String::new();
            stream.read_to_string(&mut response).await.unwrap();
            response
        };
        let (report, response) =
            tokio::join!(controller.run(DrainReason::Handoff, &mut serving), client);

        assert!(response.ends_with("late"), "{response:?}");
        assert_eq!(report.outcome, DrainOutcome::Drained);
        assert!(report.elapsed >= Duration::from_millis(100));
    }
}
