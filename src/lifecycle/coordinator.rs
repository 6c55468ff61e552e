//! Lifecycle coordinator.
//!
//! # Responsibilities
//! - Consume lifecycle events from one queue
//! - Run at most one restart attempt at a time, on its own task
//! - Start the drain on Shutdown, or once a successor is Ready
//!
//! # Data Flow
//! ```text
//! Upgrade ──▶ restart task ──Ready──▶ drain (Handoff)
//!               │ TimedOut/Failed
//!               ▼
//!         keep serving
//!
//! Shutdown / queue closed ──▶ drain (Shutdown)
//! ```
//!
//! # Design Decisions
//! - The coordinator returns the drain report; exiting is the caller's job
//! - Events that arrive while draining are logged and ignored

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};

use crate::http::server::ServingHandle;
use crate::lifecycle::restart::{RestartReport, RestartStatus, Restarter};
use crate::lifecycle::shutdown::{DrainController, DrainPolicy, DrainReason, DrainReport};
use crate::lifecycle::signals::LifecycleEvent;
use crate::lifecycle::spawner::SuccessorLauncher;
use crate::lifecycle::startup::ProcessIdentity;
use crate::net::connection::ConnectionTracker;

pub struct Coordinator {
    identity: ProcessIdentity,
    serving: ServingHandle,
    tracker: ConnectionTracker,
    restarter: Restarter,
    drain_policy: DrainPolicy,
    attempts: u64,
}

impl Coordinator {
    pub fn new(
        identity: ProcessIdentity,
        serving: ServingHandle,
        tracker: ConnectionTracker,
        launcher: Arc<dyn SuccessorLauncher>,
        handshake_timeout: Duration,
        drain_policy: DrainPolicy,
    ) -> Self {
        let restarter = Restarter::new(
            launcher,
            serving.listener(),
            handshake_timeout,
            identity.clone(),
        );
        Self {
            identity,
            serving,
            tracker,
            restarter,
            drain_policy,
            attempts: 0,
        }
    }

    /// Observe restart attempts as they progress.
    pub fn restart_status(&self) -> watch::Receiver<Option<RestartStatus>> {
        self.restarter.subscribe()
    }

    pub fn serving(&self) -> &ServingHandle {
        &self.serving
    }

    /// Handle events until a drain completes.
    pub async fn run(mut self, mut events: mpsc::Receiver<LifecycleEvent>) -> DrainReport {
        let mut restart: Option<JoinHandle<RestartReport>> = None;

        let reason = loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(LifecycleEvent::Upgrade) if restart.is_some() => {
                        tracing::info!(
                            pid = self.identity.pid(),
                            instance = %self.identity.instance(),
                            attempt = self.attempts,
                            "Restart already in progress; ignoring upgrade"
                        );
                    }
                    Some(LifecycleEvent::Upgrade) => {
                        self.attempts += 1;
                        let restarter = self.restarter.clone();
                        let id = self.attempts;
                        restart = Some(tokio::spawn(async move { restarter.run(id).await }));
                    }
                    Some(LifecycleEvent::Shutdown) => break DrainReason::Shutdown,
                    None => {
                        tracing::info!(
                            pid = self.identity.pid(),
                            "Lifecycle event queue closed; shutting down"
                        );
                        break DrainReason::Shutdown;
                    }
                },
                joined = join_restart(&mut restart), if restart.is_some() => {
                    restart = None;
                    match joined {
                        Ok(report) if report.is_ready() => break DrainReason::Handoff,
                        Ok(_) => {}
                        Err(e) => tracing::error!(
                            pid = self.identity.pid(),
                            error = %e,
                            "Restart task terminated abnormally"
                        ),
                    }
                }
            }
        };

        if let Some(task) = restart.take() {
            task.abort();
            tracing::warn!(
                pid = self.identity.pid(),
                instance = %self.identity.instance(),
                attempt = self.attempts,
                "Abandoning in-flight restart; a launched successor may keep running"
            );
        }

        let controller = DrainController::new(
            self.tracker.clone(),
            self.drain_policy,
            self.identity.clone(),
        );
        let drain = controller.run(reason, &mut self.serving);
        tokio::pin!(drain);

        loop {
            tokio::select! {
                report = &mut drain => return report,
                event = events.recv() => match event {
                    Some(event) => tracing::info!(
                        pid = self.identity.pid(),
                        %event,
                        "Already draining; ignoring event"
                    ),
                    None => return drain.await,
                },
            }
        }
    }
}

async fn join_restart(
    restart: &mut Option<JoinHandle<RestartReport>>,
) -> Result<RestartReport, JoinError> {
    match restart.as_mut() {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}
