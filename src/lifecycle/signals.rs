//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGTERM, SIGINT, SIGHUP)
//! - Translate signals to lifecycle events on a bounded queue
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - SIGHUP means upgrade, not reload
//! - OS signals are one producer among many; tests push events directly

use std::fmt;
use std::io;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Default capacity of the lifecycle event queue.
pub const EVENT_QUEUE_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Hand the listener to a new process (SIGHUP).
    Upgrade,
    /// Drain and exit without a successor (SIGTERM, SIGINT).
    Shutdown,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleEvent::Upgrade => f.write_str("UPGRADE"),
            LifecycleEvent::Shutdown => f.write_str("SHUTDOWN"),
        }
    }
}

/// Producer side of the lifecycle queue.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<LifecycleEvent>,
}

impl EventSender {
    /// Enqueue an event. Returns false once the coordinator is gone.
    pub async fn send(&self, event: LifecycleEvent) -> bool {
        tracing::debug!(%event, "Lifecycle event queued");
        self.tx.send(event).await.is_ok()
    }

    pub async fn request_upgrade(&self) -> bool {
        self.send(LifecycleEvent::Upgrade).await
    }

    pub async fn request_shutdown(&self) -> bool {
        self.send(LifecycleEvent::Shutdown).await
    }
}

/// Create the queue feeding the coordinator.
pub fn event_queue(capacity: usize) -> (EventSender, mpsc::Receiver<LifecycleEvent>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSender { tx }, rx)
}

/// Register OS signal handlers and forward them as lifecycle events.
///
/// Handlers are registered before this returns, so the default signal
/// dispositions no longer apply once it succeeds.
pub fn install_os_signals(events: EventSender) -> io::Result<JoinHandle<()>> {
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tracing::info!("OS signal handlers installed (SIGHUP, SIGTERM, SIGINT)");

    Ok(tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                Some(()) = sighup.recv() => {
                    tracing::info!("Received SIGHUP - requesting upgrade");
                    LifecycleEvent::Upgrade
                }
                Some(()) = sigterm.recv() => {
                    tracing::info!("Received SIGTERM - requesting shutdown");
                    LifecycleEvent::Shutdown
                }
                Some(()) = sigint.recv() => {
                    tracing::info!("Received SIGINT - requesting shutdown");
                    LifecycleEvent::Shutdown
                }
                else => break,
            };
            if !events.send(event).await {
                break;
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn events_arrive_in_order() {
        let (events, mut rx) = event_queue(EVENT_QUEUE_CAPACITY);
        assert!(events.request_upgrade().await);
        assert!(events.request_shutdown().await);
        assert_eq!(rx.recv().await, Some(LifecycleEvent::Upgrade));
        assert_eq!(rx.recv().await, Some(LifecycleEvent::Shutdown));
    }

    #[tokio::test]
    async fn send_fails_once_receiver_is_gone() {
        let (events, rx) = event_queue(1);
        drop(rx);
        assert!(!events.request_shutdown().await);
    }

    #[tokio::test]
    async fn sighup_becomes_upgrade() {
        let (events, mut rx) = event_queue(EVENT_QUEUE_CAPACITY);
        let task = install_os_signals(events).unwrap();

        unsafe {
            libc::kill(libc::getpid(), libc::SIGHUP);
        }

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(event, Some(LifecycleEvent::Upgrade));
        task.abort();
    }
}
