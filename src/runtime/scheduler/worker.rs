//! Worker bookkeeping.
//!
//! Each scheduler thread that runs continuations (pool workers and affine
//! workers) owns a [`WorkerSlot`] in the [`WorkerRegistry`]. The slot records
//! what the worker is doing so the stall detector can see blocked workers.

use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use super::context::ContextId;
use super::task::{TaskHeader, TaskId};

/// Identifier of a worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub usize);

impl std::fmt::Display for WorkerId {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "Worker({})", self.0)
    }
}

/// Which context a worker serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    /// Member of the pool; serves the global ready-queue.
    Pooled,
    /// Bound to one affine context.
    Affine(ContextId),
}

/// What a worker is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Waiting for a continuation.
    Idle,
    /// Running a continuation; `Some` while polling a task span.
    Running(Option<TaskId>),
    /// Halted inside `block_until_complete` on the given task.
    Blocked(TaskId),
}

/// A blocked worker, as seen by the stall detector.
#[derive(Debug, Clone)]
pub struct BlockedOn {
    /// The task being waited on.
    pub task: Arc<TaskHeader>,
    /// When the worker blocked.
    pub since: Instant,
}

impl BlockedOn {
    /// How long the worker has been blocked.
    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.since.elapsed()
    }
}

#[derive(Debug)]
struct SlotStatus {
    state: WorkerState,
    blocked: Option<BlockedOn>,
}

/// Per-worker status record.
#[derive(Debug)]
pub struct WorkerSlot {
    id: WorkerId,
    name: String,
    kind: WorkerKind,
    status: Mutex<SlotStatus>,
}

impl WorkerSlot {
    /// Get the worker ID.
    #[inline]
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Get the worker (thread) name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the worker kind.
    #[inline]
    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    /// Get the current state.
    #[inline]
    pub fn state(&self) -> WorkerState {
        self.status.lock().state
    }

    /// What the worker is blocked on, if it is blocked.
    pub fn blocked_on(&self) -> Option<BlockedOn> {
        self.status.lock().blocked.clone()
    }

    pub(crate) fn set_state(
        &self,
        state: WorkerState,
    ) {
        self.status.lock().state = state;
    }

    /// Mark the worker Blocked until the returned guard drops.
    pub(crate) fn block_on(
        self: &Arc<Self>,
        task: Arc<TaskHeader>,
    ) -> BlockedGuard {
        let mut status = self.status.lock();
        let previous = status.state;
        status.state = WorkerState::Blocked(task.id());
        status.blocked = Some(BlockedOn {
            task,
            since: Instant::now(),
        });
        BlockedGuard {
            slot: self.clone(),
            previous,
        }
    }
}

/// Restores the worker's previous state when a blocking wait ends.
pub(crate) struct BlockedGuard {
    slot: Arc<WorkerSlot>,
    previous: WorkerState,
}

impl Drop for BlockedGuard {
    fn drop(&mut self) {
        let mut status = self.slot.status.lock();
        status.state = self.previous;
        status.blocked = None;
    }
}

/// All workers of one scheduler.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    slots: RwLock<Vec<Arc<WorkerSlot>>>,
    next_id: AtomicUsize,
}

impl WorkerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a slot for a new worker.
    pub fn register(
        &self,
        name: impl Into<String>,
        kind: WorkerKind,
    ) -> Arc<WorkerSlot> {
        let slot = Arc::new(WorkerSlot {
            id: WorkerId(self.next_id.fetch_add(1, Ordering::SeqCst)),
            name: name.into(),
            kind,
            status: Mutex::new(SlotStatus {
                state: WorkerState::Idle,
                blocked: None,
            }),
        });
        self.slots.write().push(slot.clone());
        slot
    }

    /// Look up a worker by ID.
    pub fn get(
        &self,
        id: WorkerId,
    ) -> Option<Arc<WorkerSlot>> {
        self.slots.read().iter().find(|slot| slot.id == id).cloned()
    }

    /// Snapshot of every registered worker.
    pub fn snapshot(&self) -> Vec<Arc<WorkerSlot>> {
        self.slots.read().clone()
    }

    /// Number of registered workers.
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    /// Check if no worker is registered.
    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }
}

thread_local! {
    static CURRENT_WORKER: RefCell<Option<Arc<WorkerSlot>>> = const { RefCell::new(None) };
}

/// Bind the calling thread to a worker slot for the rest of its life.
pub(crate) fn bind_current(slot: Arc<WorkerSlot>) {
    CURRENT_WORKER.with(|current| *current.borrow_mut() = Some(slot));
}

pub(crate) fn unbind_current() {
    CURRENT_WORKER.with(|current| current.borrow_mut().take());
}

/// The slot of the worker running on this thread, if any.
pub(crate) fn current_slot() -> Option<Arc<WorkerSlot>> {
    CURRENT_WORKER.with(|current| current.borrow().clone())
}

/// ID of the scheduler worker running on this thread, if any.
pub fn current_worker() -> Option<WorkerId> {
    current_slot().map(|slot| slot.id())
}

/// Record that this thread is polling `task`. No-op off a worker thread.
pub(crate) fn set_running(task: Option<TaskId>) {
    if let Some(slot) = current_slot() {
        slot.set_state(WorkerState::Running(task));
    }
}
