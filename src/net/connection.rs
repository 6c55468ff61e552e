//! Unit-of-work tracking for drain decisions.
//!
//! # Responsibilities
//! - Allocate connection IDs for tracing (per tracker, not process-wide)
//! - Count in-flight units of work (Started → Idle/Completed/Aborted)
//! - Prevent double counting of re-entrant transitions on keep-alive connections
//!
//! # Design Decisions
//! - Count is read lock-free; membership mutation happens under a mutex
//! - The count is only written while the membership lock is held, so it always
//!   matches the set's cardinality once the lock is released
//! - `WorkGuard` reports `Aborted` on drop, so a cancelled handler never leaks a unit

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::observability::metrics;

/// Unique identifier for a connection within one tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle notification for one unit of work on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkEvent {
    /// A request started processing.
    Started,
    /// The response was produced; the connection is idle (keep-alive).
    Idle,
    /// The connection closed normally.
    Completed,
    /// The unit of work was abandoned (client gone, task cancelled).
    Aborted,
}

#[derive(Debug, Default)]
struct TrackerInner {
    next_id: AtomicU64,
    active: AtomicUsize,
    members: Mutex<HashSet<ConnectionId>>,
}

/// Tracks in-flight units of work for graceful drain.
///
/// Cloning is cheap; all clones observe the same counter.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    inner: Arc<TrackerInner>,
}

impl ConnectionTracker {
    /// Create a new tracker with a zero count.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an identity for a newly accepted connection.
    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Apply a lifecycle notification.
    pub fn observe(&self, id: ConnectionId, event: WorkEvent) {
        let mut members = self.members();
        let changed = match event {
            WorkEvent::Started => members.insert(id),
            WorkEvent::Idle | WorkEvent::Completed | WorkEvent::Aborted => members.remove(&id),
        };
        if changed {
            self.inner.active.store(members.len(), Ordering::Release);
            metrics::set_active_work(members.len());
            tracing::trace!(connection_id = %id, ?event, active = members.len(), "Work state changed");
        }
    }

    /// Record the start of a unit of work. The returned guard reports its end.
    pub fn begin(&self, id: ConnectionId) -> WorkGuard {
        self.observe(id, WorkEvent::Started);
        WorkGuard {
            tracker: self.clone(),
            id,
            finished: false,
        }
    }

    /// Current number of in-flight units of work.
    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Count and membership cardinality read under the same lock.
    pub fn snapshot(&self) -> (usize, usize) {
        let members = self.members();
        (self.inner.active.load(Ordering::Acquire), members.len())
    }

    fn members(&self) -> MutexGuard<'_, HashSet<ConnectionId>> {
        self.inner
            .members
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Guard for one unit of work.
/// Reports `Idle` via [`WorkGuard::finish`], or `Aborted` when dropped unfinished.
#[derive(Debug)]
pub struct WorkGuard {
    tracker: ConnectionTracker,
    id: ConnectionId,
    finished: bool,
}

impl WorkGuard {
    /// Mark the unit of work as done; the connection goes idle.
    pub fn finish(mut self) {
        self.finished = true;
        self.tracker.observe(self.id, WorkEvent::Idle);
    }
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.tracker.observe(self.id, WorkEvent::Aborted);
        }
    }
}
