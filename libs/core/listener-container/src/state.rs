//! Lifecycle state, per-slot bookkeeping and the read-only snapshot.
//!
//! The slot table is shared between the controller, the supervisor and the
//! workers. Every mutation names the generation it belongs to; updates from a
//! generation other than the current one are dropped.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use strum::{AsRefStr, Display};
use tracing::debug;

use crate::config::AcknowledgeMode;

/// Container lifecycle state.
///
/// ```text
/// NEW ──start──> RUNNING ──stop──> STOPPING ──drained──> STOPPED
///                   ^                                       │
///                   └─────────────────start─────────────────┘
/// any ──shutdown──> SHUTDOWN (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, AsRefStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    /// Registered, never started.
    New,
    /// Workers are consuming.
    Running,
    /// Stop requested, in-flight deliveries are draining.
    Stopping,
    /// All workers of the last generation completed.
    Stopped,
    /// Terminal; the container cannot be used again.
    Shutdown,
}

impl LifecycleState {
    /// Whether `start()` is allowed from this state.
    pub fn can_start(&self) -> bool {
        matches!(self, LifecycleState::New | LifecycleState::Stopped)
    }

    /// Whether the container can never run again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Shutdown)
    }
}

/// What a worker slot is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Channel acquired, loop not entered yet.
    Starting,
    /// Blocked waiting for the next delivery.
    Idle,
    /// A delivery is in flight.
    Processing,
    /// Waiting to reacquire a channel after a failure or a fatal delivery.
    Recovering,
    /// Exited on request.
    Stopped,
    /// Exited on a transport error or panic.
    Failed,
}

/// Per-slot record exposed through the snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SlotRecord {
    pub slot: usize,
    pub status: WorkerStatus,
    /// Last terminal failure of this slot, kept across restarts.
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    /// Deliveries settled by this slot in the current generation.
    pub processed: u64,
    /// Times the slot was recreated in the current generation.
    pub restarts: u32,
}

impl SlotRecord {
    fn new(slot: usize) -> Self {
        Self {
            slot,
            status: WorkerStatus::Starting,
            last_error: None,
            last_error_at: None,
            processed: 0,
            restarts: 0,
        }
    }

    /// Record a terminal failure for the slot.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = WorkerStatus::Failed;
        self.last_error = Some(error.into());
        self.last_error_at = Some(Utc::now());
    }
}

/// Read-only view of a container for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerSnapshot {
    pub queue: String,
    pub state: LifecycleState,
    pub generation: u64,
    pub concurrency: usize,
    pub active_workers: usize,
    pub transactional: bool,
    pub acknowledge_mode: AcknowledgeMode,
    pub workers: Vec<SlotRecord>,
}

struct SharedInner {
    generation: u64,
    active: usize,
    slots: Vec<SlotRecord>,
}

/// Generation-guarded slot table.
pub(crate) struct ContainerShared {
    inner: Mutex<SharedInner>,
}

impl ContainerShared {
    pub(crate) fn new(concurrency: usize) -> Self {
        Self {
            inner: Mutex::new(SharedInner {
                generation: 0,
                active: 0,
                slots: (0..concurrency).map(SlotRecord::new).collect(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SharedInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Open a new generation. Slot counters reset, last errors are kept.
    pub(crate) fn begin_generation(&self) -> u64 {
        let mut inner = self.lock();
        inner.generation += 1;
        inner.active = 0;
        for record in inner.slots.iter_mut() {
            record.status = WorkerStatus::Starting;
            record.processed = 0;
            record.restarts = 0;
        }
        inner.generation
    }

    /// Apply `update` to a slot if `generation` is still current.
    ///
    /// Returns `false` when the update came from a stale generation.
    pub(crate) fn update_slot(
        &self,
        generation: u64,
        slot: usize,
        update: impl FnOnce(&mut SlotRecord),
    ) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation {
            debug!(
                generation,
                current = inner.generation,
                slot,
                "Ignoring slot update from stale generation"
            );
            return false;
        }
        match inner.slots.get_mut(slot) {
            Some(record) => {
                update(record);
                true
            }
            None => false,
        }
    }

    pub(crate) fn worker_spawned(&self, generation: u64) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation {
            return false;
        }
        inner.active += 1;
        true
    }

    pub(crate) fn worker_exited(&self, generation: u64) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation {
            debug!(generation, "Ignoring worker exit from stale generation");
            return false;
        }
        inner.active = inner.active.saturating_sub(1);
        true
    }

    /// Force the active count of `generation` to zero.
    pub(crate) fn clear_active(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation == generation {
            inner.active = 0;
        }
    }

    pub(crate) fn active_workers(&self) -> usize {
        self.lock().active
    }

    pub(crate) fn slots(&self) -> Vec<SlotRecord> {
        self.lock().slots.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_state_display() {
        assert_eq!(LifecycleState::New.to_string(), "NEW");
        assert_eq!(LifecycleState::Stopping.as_ref(), "STOPPING");
        assert_eq!(LifecycleState::Shutdown.to_string(), "SHUTDOWN");
    }

    #[test]
    fn test_can_start() {
        assert!(LifecycleState::New.can_start());
        assert!(LifecycleState::Stopped.can_start());
        assert!(!LifecycleState::Running.can_start());
        assert!(!LifecycleState::Stopping.can_start());
        assert!(!LifecycleState::Shutdown.can_start());
        assert!(LifecycleState::Shutdown.is_terminal());
    }

    #[test]
    fn test_generation_strictly_increases() {
        let shared = ContainerShared::new(2);
        assert_eq!(shared.generation(), 0);
        let first = shared.begin_generation();
        let second = shared.begin_generation();
        assert!(second > first);
        assert_eq!(shared.generation(), second);
    }

    #[test]
    fn test_stale_generation_updates_are_ignored() {
        let shared = ContainerShared::new(1);
        let old = shared.begin_generation();
        assert!(shared.worker_spawned(old));

        let current = shared.begin_generation();
        assert!(shared.worker_spawned(current));

        assert!(!shared.update_slot(old, 0, |record| record.fail("late failure")));
        assert!(!shared.worker_exited(old));

        assert_eq!(shared.active_workers(), 1);
        assert!(shared.slots()[0].last_error.is_none());
    }

    #[test]
    fn test_last_error_survives_generation_change() {
        let shared = ContainerShared::new(1);
        let generation = shared.begin_generation();
        shared.update_slot(generation, 0, |record| {
            record.processed = 3;
            record.fail("channel closed");
        });

        shared.begin_generation();
        let record = &shared.slots()[0];
        assert_eq!(record.status, WorkerStatus::Starting);
        assert_eq!(record.processed, 0);
        assert_eq!(record.last_error.as_deref(), Some("channel closed"));
    }
}
