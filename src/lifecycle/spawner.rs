//! Successor process launch.
//!
//! # Responsibilities
//! - Duplicate the listener so the predecessor's copy stays valid
//! - Create the readiness pipe
//! - Launch the successor with both descriptors at fixed ordinals and the
//!   restart markers in its environment
//! - Reap (or deliberately abandon) the successor once the attempt is decided
//!
//! # Successor Outcomes
//! ```text
//! Ready     detached, keeps running
//! TimedOut  abandoned without a signal; tokio reaps it whenever it exits
//! Failed    SIGTERM, then SIGKILL after FAILED_SUCCESSOR_GRACE, then waited
//! ```
//!
//! # Descriptor Contract
//! ```text
//! fd 3  listening socket      GRACEFUL_FD=3
//! fd 4  handshake write end   READY_PIPE_FD=4
//!       restart marker        GRACEFUL_RESTART=1
//! ```
//!
//! # Design Decisions
//! - Sources are duplicated close-on-exec above fd 10, then `dup2`ed onto their
//!   ordinals between fork and exec; nothing else leaks into the child
//! - Any launch failure is returned to the restart attempt and never touches
//!   the running listener

use std::ffi::OsString;
use std::io;
use std::os::unix::io::{AsFd, AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::{Child, Command};

use crate::lifecycle::handshake::{self, ReadyWaiter};
use crate::lifecycle::restart::RestartState;
use crate::net::listener::{duplicate_above, ListenerHandle, DUPLICATE_FLOOR};

/// Ordinal of the listening socket in the successor.
pub const LISTENER_ORDINAL: RawFd = 3;
/// Ordinal of the handshake write end in the successor.
pub const HANDSHAKE_ORDINAL: RawFd = 4;

pub const RESTART_MARKER_ENV: &str = "GRACEFUL_RESTART";
pub const LISTENER_FD_ENV: &str = "GRACEFUL_FD";
pub const READY_PIPE_FD_ENV: &str = "READY_PIPE_FD";

/// Service-manager activation variables; a successor must not see them.
const SOCKET_ACTIVATION_ENV: [&str; 3] = ["LISTEN_PID", "LISTEN_FDS", "LISTEN_FDNAMES"];

/// How long a failed successor gets to exit after SIGTERM before SIGKILL.
pub const FAILED_SUCCESSOR_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    Listener,
    Handshake,
}

/// A descriptor handed to the successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassedDescriptor {
    pub ordinal: RawFd,
    pub kind: DescriptorKind,
}

/// The fixed descriptor layout every successor receives.
pub fn descriptor_contract() -> Vec<PassedDescriptor> {
    vec![
        PassedDescriptor {
            ordinal: LISTENER_ORDINAL,
            kind: DescriptorKind::Listener,
        },
        PassedDescriptor {
            ordinal: HANDSHAKE_ORDINAL,
            kind: DescriptorKind::Handshake,
        },
    ]
}

/// Environment markers identifying a restarted instance.
pub fn restart_markers() -> Vec<(String, String)> {
    vec![
        (RESTART_MARKER_ENV.to_string(), "1".to_string()),
        (LISTENER_FD_ENV.to_string(), LISTENER_ORDINAL.to_string()),
        (READY_PIPE_FD_ENV.to_string(), HANDSHAKE_ORDINAL.to_string()),
    ]
}

/// Error type for successor launch.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("listener is already closed")]
    ListenerClosed,
    #[error("failed to duplicate {kind:?} descriptor: {source}")]
    Descriptor {
        kind: DescriptorKind,
        #[source]
        source: io::Error,
    },
    #[error("failed to create handshake channel: {0}")]
    Handshake(#[source] io::Error),
    #[error("failed to launch successor {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// A launched successor and what was handed to it.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    descriptors: Vec<PassedDescriptor>,
    markers: Vec<(String, String)>,
    child: Option<Child>,
}

impl ProcessHandle {
    /// Describe a successor this process did not fork (e.g. one hosted in-process).
    pub fn new(pid: u32, descriptors: Vec<PassedDescriptor>, markers: Vec<(String, String)>) -> Self {
        Self {
            pid,
            descriptors,
            markers,
            child: None,
        }
    }

    fn from_child(child: Child) -> Self {
        Self {
            pid: child.id().unwrap_or_default(),
            descriptors: descriptor_contract(),
            markers: restart_markers(),
            child: Some(child),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn descriptors(&self) -> &[PassedDescriptor] {
        &self.descriptors
    }

    /// Whether the successor was told it is a restarted instance.
    pub fn is_restarted_instance(&self) -> bool {
        self.markers
            .iter()
            .any(|(key, value)| key == RESTART_MARKER_ENV && value == "1")
    }

    /// Release the handle once the attempt's outcome is known.
    ///
    /// A Ready successor is detached and keeps running. A TimedOut successor is
    /// abandoned without being signalled. A Failed successor is terminated if
    /// it is still running and waited on, so it never lingers as a zombie or
    /// keeps accepting on the shared listener.
    pub async fn reap(self, outcome: RestartState) {
        let pid = self.pid;
        match outcome {
            RestartState::Ready => {
                tracing::info!(successor_pid = pid, "Successor owns the listener; detaching");
            }
            RestartState::TimedOut => {
                tracing::warn!(
                    successor_pid = pid,
                    "Abandoning unresponsive successor without terminating it"
                );
            }
            RestartState::Failed => {
                if let Some(child) = self.child {
                    terminate_failed(child, pid).await;
                }
            }
            RestartState::Spawning | RestartState::AwaitingReady => {
                tracing::debug!(successor_pid = pid, state = %outcome, "Released undecided successor");
            }
        }
    }
}

async fn terminate_failed(mut child: Child, pid: u32) {
    match child.try_wait() {
        Ok(Some(status)) => {
            tracing::warn!(successor_pid = pid, %status, "Failed successor exited");
            return;
        }
        Ok(None) => {}
        Err(e) => {
            tracing::warn!(successor_pid = pid, error = %e, "Could not query failed successor");
        }
    }

    // Exited-but-unreaped children accept the signal harmlessly.
    if unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) } != 0 {
        tracing::debug!(
            successor_pid = pid,
            error = %io::Error::last_os_error(),
            "SIGTERM to failed successor not delivered"
        );
    }

    let status = match tokio::time::timeout(FAILED_SUCCESSOR_GRACE, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            tracing::warn!(successor_pid = pid, "Failed successor ignored SIGTERM; killing it");
            if let Err(e) = child.start_kill() {
                tracing::debug!(successor_pid = pid, error = %e, "SIGKILL not delivered");
            }
            child.wait().await
        }
    };
    match status {
        Ok(status) => tracing::warn!(successor_pid = pid, %status, "Failed successor reaped"),
        Err(e) => tracing::error!(successor_pid = pid, error = %e, "Could not reap failed successor"),
    }
}

/// A launched successor with the predecessor's end of the handshake.
pub struct LaunchedSuccessor {
    pub process: ProcessHandle,
    pub ready: Box<dyn ReadyWaiter>,
}

/// Launches a successor that inherits the listener.
pub trait SuccessorLauncher: Send + Sync {
    fn launch(&self, listener: &ListenerHandle) -> Result<LaunchedSuccessor, SpawnError>;
}

/// Launches an executable as the successor, following the descriptor contract.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: PathBuf,
    args: Vec<OsString>,
}

impl CommandLauncher {
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Re-launch with this process's arguments, using `successor_binary` or
    /// the current executable.
    pub fn for_current_process(successor_binary: Option<&Path>) -> io::Result<Self> {
        let program = match successor_binary {
            Some(path) => path.to_path_buf(),
            None => std::env::current_exe()?,
        };
        Ok(Self::new(program, std::env::args_os().skip(1)))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl SuccessorLauncher for CommandLauncher {
    fn launch(&self, listener: &ListenerHandle) -> Result<LaunchedSuccessor, SpawnError> {
        let listener_fd = listener
            .duplicate_for_child()
            .map_err(|source| SpawnError::Descriptor {
                kind: DescriptorKind::Listener,
                source,
            })?;

        let (writer, waiter) = handshake::pipe_channel().map_err(SpawnError::Handshake)?;
        let handshake_fd =
            duplicate_above(writer.as_fd(), DUPLICATE_FLOOR).map_err(|source| {
                SpawnError::Descriptor {
                    kind: DescriptorKind::Handshake,
                    source,
                }
            })?;
        drop(writer);

        let remap = [
            (listener_fd.as_raw_fd(), LISTENER_ORDINAL),
            (handshake_fd.as_raw_fd(), HANDSHAKE_ORDINAL),
        ];

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(restart_markers())
            .stdin(Stdio::null());
        for name in SOCKET_ACTIVATION_ENV {
            command.env_remove(name);
        }
        // SAFETY: the hook only calls dup2, which is async-signal-safe.
        unsafe {
            command.pre_exec(move || remap_descriptors(&remap));
        }

        let child = command.spawn().map_err(|source| SpawnError::Launch {
            program: self.program.display().to_string(),
            source,
        })?;

        // The child holds its own copies now.
        drop(listener_fd);
        drop(handshake_fd);

        tracing::debug!(
            successor_pid = child.id().unwrap_or_default(),
            program = %self.program.display(),
            "Successor process started"
        );

        Ok(LaunchedSuccessor {
            process: ProcessHandle::from_child(child),
            ready: Box::new(waiter),
        })
    }
}

fn remap_descriptors(pairs: &[(RawFd, RawFd)]) -> io::Result<()> {
    for &(source, target) in pairs {
        if unsafe { libc::dup2(source, target) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
