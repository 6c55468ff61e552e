//! Restart attempts.
//!
//! # State Machine
//! ```text
//! Spawning ──launch ok──▶ AwaitingReady ──sentinel──▶ Ready
//!    │                         ├──────timeout──────▶ TimedOut
//!    └──launch failed──▶ Failed ◀──closed/garbage──┘
//! ```
//!
//! All terminal states are final; an attempt never reactivates.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::watch;

use crate::lifecycle::handshake::HandshakeOutcome;
use crate::lifecycle::spawner::{LaunchedSuccessor, SpawnError, SuccessorLauncher};
use crate::lifecycle::startup::ProcessIdentity;
use crate::net::listener::ListenerHandle;
use crate::observability::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RestartState {
    Spawning,
    AwaitingReady,
    Ready,
    TimedOut,
    Failed,
}

impl RestartState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::TimedOut | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Spawning => "spawning",
            Self::AwaitingReady => "awaiting_ready",
            Self::Ready => "ready",
            Self::TimedOut => "timed_out",
            Self::Failed => "failed",
        }
    }

    /// Whether `next` is a legal forward step from this state.
    pub fn can_transition_to(self, next: RestartState) -> bool {
        matches!(
            (self, next),
            (Self::Spawning, Self::AwaitingReady)
                | (Self::Spawning, Self::Failed)
                | (Self::AwaitingReady, Self::Ready)
                | (Self::AwaitingReady, Self::TimedOut)
                | (Self::AwaitingReady, Self::Failed)
        )
    }
}

impl fmt::Display for RestartState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid restart transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: RestartState,
    pub to: RestartState,
}

/// One attempt to hand the listener to a successor.
#[derive(Debug, Clone)]
pub struct RestartAttempt {
    id: u64,
    state: RestartState,
    started: Instant,
}

impl RestartAttempt {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            state: RestartState::Spawning,
            started: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> RestartState {
        self.state
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Move forward. Backward or repeated transitions are rejected.
    pub fn advance(&mut self, next: RestartState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    pub fn status(&self) -> RestartStatus {
        RestartStatus {
            attempt: self.id,
            state: self.state,
        }
    }
}

/// Last published state of the most recent attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartStatus {
    pub attempt: u64,
    pub state: RestartState,
}

/// Error type for a restart attempt. Never escapes the attempt's task.
#[derive(Debug, Error)]
pub enum RestartError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("successor {successor_pid} did not signal readiness within {timeout:?}")]
    HandshakeTimeout { successor_pid: u32, timeout: Duration },
    #[error("successor {successor_pid} closed the handshake without signalling readiness")]
    SuccessorExited { successor_pid: u32 },
    #[error("successor {successor_pid} sent an invalid handshake: {reason}")]
    InvalidHandshake { successor_pid: u32, reason: String },
}

impl RestartError {
    /// Terminal state this error leaves the attempt in.
    pub fn state(&self) -> RestartState {
        match self {
            Self::HandshakeTimeout { .. } => RestartState::TimedOut,
            _ => RestartState::Failed,
        }
    }
}

/// How a restart attempt ended.
#[derive(Debug)]
pub struct RestartReport {
    pub attempt: u64,
    pub state: RestartState,
    pub successor_pid: Option<u32>,
    pub error: Option<RestartError>,
    pub elapsed: Duration,
}

impl RestartReport {
    pub fn is_ready(&self) -> bool {
        self.state == RestartState::Ready
    }
}

/// Drives restart attempts for one process.
///
/// Cheap to clone; the coordinator moves a clone into each attempt's task.
#[derive(Clone)]
pub struct Restarter {
    launcher: Arc<dyn SuccessorLauncher>,
    listener: Weak<ListenerHandle>,
    handshake_timeout: Duration,
    status: Arc<watch::Sender<Option<RestartStatus>>>,
    identity: ProcessIdentity,
}

impl Restarter {
    pub fn new(
        launcher: Arc<dyn SuccessorLauncher>,
        listener: Weak<ListenerHandle>,
        handshake_timeout: Duration,
        identity: ProcessIdentity,
    ) -> Self {
        let (status, _) = watch::channel(None);
        Self {
            launcher,
            listener,
            handshake_timeout,
            status: Arc::new(status),
            identity,
        }
    }

    /// Observe the state of the latest attempt.
    pub fn subscribe(&self) -> watch::Receiver<Option<RestartStatus>> {
        self.status.subscribe()
    }

    /// Run one attempt to completion.
    pub async fn run(&self, id: u64) -> RestartReport {
        let mut attempt = RestartAttempt::new(id);
        self.publish(&attempt);
        tracing::info!(
            pid = self.identity.pid(),
            instance = %self.identity.instance(),
            attempt = id,
            "Restart attempt started"
        );

        let launched = match self.listener.upgrade() {
            Some(listener) => self.launcher.launch(&listener),
            None => Err(SpawnError::ListenerClosed),
        };
        let LaunchedSuccessor { process, mut ready } = match launched {
            Ok(launched) => launched,
            Err(e) => return self.conclude(attempt, None, Some(e.into())),
        };

        let successor_pid = process.pid();
        self.advance(&mut attempt, RestartState::AwaitingReady);
        tracing::info!(
            pid = self.identity.pid(),
            instance = %self.identity.instance(),
            attempt = id,
            successor_pid,
            timeout_ms = self.handshake_timeout.as_millis() as u64,
            "Successor launched; awaiting readiness"
        );

        let outcome = ready.wait_ready(self.handshake_timeout).await;
        drop(ready);

        let error = match outcome {
            HandshakeOutcome::Ready => None,
            HandshakeOutcome::TimedOut => Some(RestartError::HandshakeTimeout {
                successor_pid,
                timeout: self.handshake_timeout,
            }),
            HandshakeOutcome::Closed => Some(RestartError::SuccessorExited { successor_pid }),
            HandshakeOutcome::Invalid(reason) => Some(RestartError::InvalidHandshake {
                successor_pid,
                reason,
            }),
        };
        let report = self.conclude(attempt, Some(successor_pid), error);
        process.reap(report.state).await;
        report
    }

    fn conclude(
        &self,
        mut attempt: RestartAttempt,
        successor_pid: Option<u32>,
        error: Option<RestartError>,
    ) -> RestartReport {
        let terminal = error.as_ref().map_or(RestartState::Ready, RestartError::state);
        self.advance(&mut attempt, terminal);
        metrics::record_restart_attempt(terminal.as_str());

        match &error {
            None => tracing::info!(
                pid = self.identity.pid(),
                instance = %self.identity.instance(),
                attempt = attempt.id(),
                successor_pid,
                elapsed_ms = attempt.elapsed().as_millis() as u64,
                "Successor is ready"
            ),
            Some(e) => tracing::warn!(
                pid = self.identity.pid(),
                instance = %self.identity.instance(),
                attempt = attempt.id(),
                successor_pid,
                state = %terminal,
                error = %e,
                "Restart attempt failed; continuing to serve"
            ),
        }

        RestartReport {
            attempt: attempt.id(),
            state: attempt.state(),
            successor_pid,
            error,
            elapsed: attempt.elapsed(),
        }
    }

    fn advance(&self, attempt: &mut RestartAttempt, next: RestartState) {
        match attempt.advance(next) {
            Ok(()) => self.publish(attempt),
            Err(e) => tracing::error!(attempt = attempt.id(), error = %e, "Restart state not advanced"),
        }
    }

    fn publish(&self, attempt: &RestartAttempt) {
        self.status.send_replace(Some(attempt.status()));
    }
}
