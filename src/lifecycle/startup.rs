//! Startup orchestration.
//!
//! # Responsibilities
//! - Decide whether this process binds fresh, adopts a listener from its
//!   predecessor, or adopts one passed by the service manager
//! - Give the process an identity for responses and lifecycle logs
//! - Tell the predecessor we are accepting, once, after the server is up
//!
//! # Design Decisions
//! - Fail fast: a successor with a malformed inheritance exits with code 2
//! - The ready sentinel is only sent after the accept loop is running
//! - The restart marker wins over socket activation; activation wins over
//!   a fresh bind

use std::fmt;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use serde::Serialize;

use crate::lifecycle::handshake::{HandshakeError, PipeReadyNotifier, ReadyNotifier};
use crate::net::listener::{AcquireError, AcquireMode};

/// Exit code for bind or configuration failures at startup.
pub const EXIT_STARTUP_FAILURE: i32 = 1;
/// Exit code for a successor whose inherited descriptors are unusable.
pub const EXIT_INVALID_INHERITANCE: i32 = 2;

/// First descriptor a service manager passes (`SD_LISTEN_FDS_START`).
pub const LISTEN_FDS_START: RawFd = 3;

/// Listening sockets passed by a service manager through `LISTEN_PID`/`LISTEN_FDS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketActivation {
    pub listen_fds: u32,
}

impl SocketActivation {
    /// Interpret the activation variables for process `pid`. They only apply
    /// when `LISTEN_PID` names this process and at least one fd was passed.
    pub fn from_vars(listen_pid: Option<&str>, listen_fds: Option<&str>, pid: u32) -> Option<Self> {
        let target: u32 = listen_pid?.trim().parse().ok()?;
        if target != pid {
            return None;
        }
        let listen_fds: u32 = listen_fds?.trim().parse().ok()?;
        (listen_fds > 0).then_some(Self { listen_fds })
    }

    /// The endpoint this process serves on. Only one is used.
    pub fn listener_fd(&self) -> RawFd {
        LISTEN_FDS_START
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessRole {
    Fresh,
    Activated,
    Successor,
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessRole::Fresh => f.write_str("fresh"),
            ProcessRole::Activated => f.write_str("activated"),
            ProcessRole::Successor => f.write_str("successor"),
        }
    }
}

/// Who this process is, as seen in responses and logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessIdentity {
    pid: u32,
    instance: String,
    role: ProcessRole,
}

impl ProcessIdentity {
    pub fn new(role: ProcessRole) -> Self {
        let mut instance = uuid::Uuid::new_v4().simple().to_string();
        instance.truncate(8);
        Self {
            pid: std::process::id(),
            instance,
            role,
        }
    }

    pub fn fresh() -> Self {
        Self::new(ProcessRole::Fresh)
    }

    pub fn successor() -> Self {
        Self::new(ProcessRole::Successor)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Random tag distinguishing instances that share a pid (e.g. in tests).
    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn role(&self) -> ProcessRole {
        self.role
    }
}

impl fmt::Display for ProcessIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid={} instance={} role={}", self.pid, self.instance, self.role)
    }
}

/// How this process came to life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupMode {
    Fresh {
        bind: SocketAddr,
    },
    Activated {
        listener_fd: RawFd,
    },
    Successor {
        listener_fd: RawFd,
        handshake_fd: Option<RawFd>,
    },
}

impl StartupMode {
    /// Resolve from the restart marker, socket activation and inherited ordinals.
    pub fn detect(
        restart_marker: bool,
        activation: Option<SocketActivation>,
        bind: SocketAddr,
        listener_fd: RawFd,
        handshake_fd: Option<RawFd>,
    ) -> Self {
        if restart_marker {
            return StartupMode::Successor {
                listener_fd,
                handshake_fd,
            };
        }
        match activation {
            Some(activation) => {
                if activation.listen_fds > 1 {
                    tracing::warn!(
                        listen_fds = activation.listen_fds,
                        "Service manager passed several sockets; serving on the first"
                    );
                }
                StartupMode::Activated {
                    listener_fd: activation.listener_fd(),
                }
            }
            None => StartupMode::Fresh { bind },
        }
    }

    pub fn role(&self) -> ProcessRole {
        match self {
            StartupMode::Fresh { .. } => ProcessRole::Fresh,
            StartupMode::Activated { .. } => ProcessRole::Activated,
            StartupMode::Successor { .. } => ProcessRole::Successor,
        }
    }

    pub fn acquire_mode(&self) -> AcquireMode {
        match *self {
            StartupMode::Fresh { bind } => AcquireMode::Fresh(bind),
            StartupMode::Activated { listener_fd } => AcquireMode::Inherited(listener_fd),
            StartupMode::Successor { listener_fd, .. } => AcquireMode::Inherited(listener_fd),
        }
    }

    /// Adopt the inherited handshake write end, if one was passed.
    pub fn ready_notifier(&self) -> Result<Option<PipeReadyNotifier>, HandshakeError> {
        match *self {
            StartupMode::Successor {
                handshake_fd: Some(fd),
                ..
            } => PipeReadyNotifier::from_inherited(fd).map(Some),
            _ => Ok(None),
        }
    }
}

/// Exit code for a failed listener acquisition.
pub fn acquire_exit_code(error: &AcquireError) -> i32 {
    match error {
        AcquireError::Bind { .. } => EXIT_STARTUP_FAILURE,
        AcquireError::InvalidDescriptor { .. } => EXIT_INVALID_INHERITANCE,
    }
}

/// Send the ready sentinel. A failed write means the predecessor already
/// gave up on us; we keep serving either way.
pub fn announce_ready(notifier: &mut dyn ReadyNotifier, identity: &ProcessIdentity) -> bool {
    match notifier.notify_ready() {
        Ok(()) => {
            tracing::info!(
                pid = identity.pid(),
                instance = %identity.instance(),
                "Signalled readiness to predecessor"
            );
            true
        }
        Err(e) => {
            tracing::warn!(
                pid = identity.pid(),
                instance = %identity.instance(),
                error = %e,
                "Predecessor did not receive readiness signal"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::handshake::{memory_channel, HandshakeOutcome, ReadyWaiter};
    use std::time::Duration;

    fn bind() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    #[test]
    fn marker_selects_successor_mode() {
        let mode = StartupMode::detect(true, None, bind(), 3, Some(4));
        assert_eq!(mode.role(), ProcessRole::Successor);
        assert_eq!(mode.acquire_mode(), AcquireMode::Inherited(3));

        let mode = StartupMode::detect(false, None, bind(), 3, Some(4));
        assert_eq!(mode.role(), ProcessRole::Fresh);
        assert_eq!(mode.acquire_mode(), AcquireMode::Fresh(bind()));
        assert!(mode.ready_notifier().unwrap().is_none());
    }

    #[test]
    fn activation_applies_only_to_the_named_process() {
        assert_eq!(
            SocketActivation::from_vars(Some("42"), Some("2"), 42),
            Some(SocketActivation { listen_fds: 2 })
        );
        assert_eq!(SocketActivation::from_vars(Some("41"), Some("1"), 42), None);
        assert_eq!(SocketActivation::from_vars(Some("42"), Some("0"), 42), None);
        assert_eq!(SocketActivation::from_vars(Some("42"), None, 42), None);
        assert_eq!(SocketActivation::from_vars(None, Some("1"), 42), None);
        assert_eq!(SocketActivation::from_vars(Some("x"), Some("1"), 42), None);
    }

    #[test]
    fn activation_adopts_first_passed_socket() {
        let activation = SocketActivation::from_vars(Some("7"), Some("1"), 7);
        let mode = StartupMode::detect(false, activation, bind(), 3, None);
        assert_eq!(mode, StartupMode::Activated { listener_fd: 3 });
        assert_eq!(mode.role(), ProcessRole::Activated);
        assert_eq!(mode.acquire_mode(), AcquireMode::Inherited(LISTEN_FDS_START));
        assert!(mode.ready_notifier().unwrap().is_none());

        let mode = StartupMode::detect(true, activation, bind(), 3, Some(4));
        assert_eq!(mode.role(), ProcessRole::Successor);
    }

    #[test]
    fn identities_are_distinct() {
        let a = ProcessIdentity::fresh();
        let b = ProcessIdentity::successor();
        assert_eq!(a.pid(), b.pid());
        assert_ne!(a.instance(), b.instance());
        assert_eq!(a.instance().len(), 8);
        assert!(b.to_string().ends_with("role=successor"));
    }

    #[test]
    fn inheritance_errors_exit_with_two() {
        let err = AcquireError::InvalidDescriptor {
            fd: 3,
            reason: "not a socket".to_string(),
        };
        assert_eq!(acquire_exit_code(&err), EXIT_INVALID_INHERITANCE);
    }

    #[tokio::test]
    async fn announce_ready_reports_late_predecessor() {
        let identity = ProcessIdentity::successor();

        let (mut notifier, mut waiter) = memory_channel();
        assert!(announce_ready(&mut notifier, &identity));
        assert_eq!(
            waiter.wait_ready(Duration::from_millis(50)).await,
            HandshakeOutcome::Ready
        );

        let (mut notifier, waiter) = memory_channel();
        drop(waiter);
        assert!(!announce_ready(&mut notifier, &identity));
    }
}
