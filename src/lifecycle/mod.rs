//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Detect mode → Acquire listener → Start serving → Signal readiness (successor)
//!
//! Upgrade (signals.rs → coordinator.rs → restart.rs):
//!     SIGHUP → spawner.rs launches successor (fd 3 listener, fd 4 handshake)
//!            → handshake.rs waits for "ready\n" with timeout
//!            → Ready: drain (Handoff); TimedOut/Failed: keep serving
//!
//! Shutdown (signals.rs → coordinator.rs → shutdown.rs):
//!     SIGTERM/SIGINT → Stop accepting → Drain work → Exit
//! ```
//!
//! # Design Decisions
//! - Predecessor closes its listener only after observing Ready
//! - Restart failures never reach the serving path
//! - Drain has a deadline: forced exit after it elapses

pub mod coordinator;
pub mod handshake;
pub mod restart;
pub mod shutdown;
pub mod signals;
pub mod spawner;
pub mod startup;

pub use coordinator::Coordinator;
pub use handshake::{HandshakeOutcome, ReadyNotifier, ReadyWaiter};
pub use restart::{RestartError, RestartState, RestartStatus};
pub use shutdown::{DrainController, DrainOutcome, DrainPolicy, DrainReason, DrainReport};
pub use signals::{event_queue, install_os_signals, EventSender, LifecycleEvent};
pub use spawner::{CommandLauncher, LaunchedSuccessor, ProcessHandle, SpawnError, SuccessorLauncher};
pub use startup::{ProcessIdentity, ProcessRole, StartupMode};
