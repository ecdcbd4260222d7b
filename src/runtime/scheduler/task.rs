//! Task definitions for the scheduler.
//!
//! A task is a `Future` driven one span at a time: every `poll` runs the body
//! up to its next suspension point. When the body suspends, whatever it waits
//! on keeps the task's waker; waking posts the next span onto the task's
//! current [`ExecutionContext`]. That is what makes affinity observable: an
//! affine task can only resume when its bound worker is free to run it.
//!
//! The pieces:
//!
//! - [`TaskHeader`]: the type-erased part (id, state, `observed`, context).
//! - `TaskCore<T>`: outcome slot, registered continuations, handle count.
//! - `Runnable<T, F>`: owns the body future and implements [`Wake`].
//! - [`TaskHandle<T>`]: what callers hold; awaiting it or blocking on it marks
//!   the task observed.

use std::cell::RefCell;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Wake, Waker};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use tracing::{debug, warn};

use super::context::ExecutionContext;
use super::error::{TaskError, TaskResult, WaitError};
use super::sink::{UnobservedFailure, UnobservedFailureSink};
use super::worker;
use super::Shared;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the inner value.
    #[inline]
    pub fn inner(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

/// Task state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Submitted, first span not started yet.
    Pending,
    /// A span is executing on some worker.
    Running,
    /// Parked at a suspension point.
    Suspended,
    /// Finished with a result.
    Completed,
    /// Finished with an error.
    Failed,
    /// Dropped before finishing (scheduler shutdown).
    Cancelled,
}

impl TaskState {
    /// Convert from u8 (for atomic storage).
    #[inline]
    pub fn from_u8(val: u8) -> Self {
        match val {
            0 => TaskState::Pending,
            1 => TaskState::Running,
            2 => TaskState::Suspended,
            3 => TaskState::Completed,
            4 => TaskState::Failed,
            _ => TaskState::Cancelled,
        }
    }

    /// Convert to u8 (for atomic storage).
    #[inline]
    pub fn as_u8(&self) -> u8 {
        match self {
            TaskState::Pending => 0,
            TaskState::Running => 1,
            TaskState::Suspended => 2,
            TaskState::Completed => 3,
            TaskState::Failed => 4,
            TaskState::Cancelled => 5,
        }
    }

    /// Completed, Failed and Cancelled are final.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed | TaskState::Cancelled)
    }
}

/// Whether a task hands out a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Submitted with [`submit`](super::Handle::submit); observable through its handle.
    Tracked,
    /// Submitted with [`fire_and_forget`](super::Handle::fire_and_forget); never observable.
    FireAndForget,
}

/// Type-erased task data shared by the scheduler, workers and handles.
pub struct TaskHeader {
    id: TaskId,
    name: String,
    kind: TaskKind,
    state: AtomicU8,
    observed: AtomicBool,
    context: Mutex<ExecutionContext>,
}

impl std::fmt::Debug for TaskHeader {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("TaskHeader")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("observed", &self.is_observed())
            .field("context", &self.context.lock().to_string())
            .finish()
    }
}

impl TaskHeader {
    pub(crate) fn new(
        name: Option<String>,
        kind: TaskKind,
        context: ExecutionContext,
    ) -> Self {
        let id = TaskId::next();
        Self {
            id,
            name: name.unwrap_or_else(|| id.to_string()),
            kind,
            state: AtomicU8::new(TaskState::Pending.as_u8()),
            observed: AtomicBool::new(false),
            context: Mutex::new(context),
        }
    }

    /// Get the task ID.
    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Get the task name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the task kind.
    #[inline]
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Get the current state.
    #[inline]
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Whether some caller has awaited or blocked on the task.
    #[inline]
    pub fn is_observed(&self) -> bool {
        self.observed.load(Ordering::SeqCst)
    }

    /// The context the task's next continuation will be posted to.
    pub fn context(&self) -> ExecutionContext {
        self.context.lock().clone()
    }

    pub(crate) fn set_context(
        &self,
        context: ExecutionContext,
    ) -> ExecutionContext {
        std::mem::replace(&mut *self.context.lock(), context)
    }

    /// Move to `to` unless the task is already terminal.
    pub(crate) fn transition(
        &self,
        to: TaskState,
    ) -> bool {
        self.state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                if TaskState::from_u8(current).is_terminal() {
                    None
                } else {
                    Some(to.as_u8())
                }
            })
            .is_ok()
    }

    fn mark_observed(&self) {
        self.observed.store(true, Ordering::SeqCst);
    }
}

struct CoreInner<T> {
    outcome: Option<TaskResult<T>>,
    continuations: SmallVec<[Waker; 2]>,
    handles: usize,
    reported: bool,
}

/// Outcome slot and continuation list of a task.
pub(crate) struct TaskCore<T> {
    header: Arc<TaskHeader>,
    inner: Mutex<CoreInner<T>>,
    done: Condvar,
    sink: Arc<UnobservedFailureSink>,
}

impl<T> TaskCore<T> {
    fn new(
        header: Arc<TaskHeader>,
        sink: Arc<UnobservedFailureSink>,
    ) -> Self {
        let handles = match header.kind() {
            TaskKind::Tracked => 1,
            TaskKind::FireAndForget => 0,
        };
        Self {
            header,
            inner: Mutex::new(CoreInner {
                outcome: None,
                continuations: SmallVec::new(),
                handles,
                reported: false,
            }),
            done: Condvar::new(),
            sink,
        }
    }

    /// Store the outcome and release every observer. Ignored once terminal.
    fn complete(
        &self,
        outcome: TaskResult<T>,
    ) -> bool {
        let to = match &outcome {
            Ok(_) => TaskState::Completed,
            Err(TaskError::Cancelled) => TaskState::Cancelled,
            Err(_) => TaskState::Failed,
        };

        let (continuations, unobserved) = {
            let mut inner = self.inner.lock();
            if !self.header.transition(to) {
                return false;
            }
            inner.outcome = Some(outcome);
            let unobserved = self.take_unobserved(&mut inner);
            (std::mem::take(&mut inner.continuations), unobserved)
        };

        debug!(task = %self.header.id, state = ?to, "task finished");
        self.done.notify_all();
        for waker in continuations {
            waker.wake();
        }
        if let Some(failure) = unobserved {
            self.sink.report(failure);
        }
        true
    }

    /// Decide, under the core lock, whether the failure can no longer be observed.
    fn take_unobserved(
        &self,
        inner: &mut CoreInner<T>,
    ) -> Option<UnobservedFailure> {
        if inner.reported || inner.handles > 0 || self.header.is_observed() {
            return None;
        }
        match &inner.outcome {
            Some(Err(error)) if error.is_failure() => {
                inner.reported = true;
                Some(UnobservedFailure {
                    task: Some(self.header.id),
                    name: self.header.name.clone(),
                    origin: self.header.kind.into(),
                    error: error.clone(),
                })
            },
            _ => None,
        }
    }
}

/// Scheduler-side view of a task, independent of its output type.
pub(crate) trait Schedulable: Send + Sync {
    fn header(&self) -> &Arc<TaskHeader>;

    /// Post the next span onto the task's context.
    fn schedule(self: Arc<Self>);

    /// Finish the task as Cancelled and drop its body.
    fn cancel(&self);
}

/// Owns the task body and polls it one span at a time.
pub(crate) struct Runnable<T, F> {
    core: Arc<TaskCore<T>>,
    future: Mutex<Option<Pin<Box<F>>>>,
    scheduled: AtomicBool,
    runtime: Weak<Shared>,
}

impl<T, F> Runnable<T, F>
where
    T: Send + 'static,
    F: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    /// Create the header, core and runnable for a new task.
    pub(crate) fn create(
        name: Option<String>,
        kind: TaskKind,
        context: ExecutionContext,
        work: F,
        shared: &Arc<Shared>,
    ) -> (Arc<Self>, Arc<TaskCore<T>>) {
        let header = Arc::new(TaskHeader::new(name, kind, context));
        let core = Arc::new(TaskCore::new(header, shared.sink.clone()));
        let runnable = Arc::new(Self {
            core: core.clone(),
            future: Mutex::new(Some(Box::pin(work))),
            scheduled: AtomicBool::new(false),
            runtime: Arc::downgrade(shared),
        });
        (runnable, core)
    }

    /// Poll one span on the calling thread.
    pub(crate) fn run(self: Arc<Self>) {
        self.scheduled.store(false, Ordering::SeqCst);
        let header = self.core.header.clone();

        let mut slot = self.future.lock();
        if header.state().is_terminal() {
            *slot = None;
            return;
        }
        let Some(future) = slot.as_mut() else {
            return;
        };

        header.transition(TaskState::Running);
        worker::set_running(Some(header.id));

        let waker = Waker::from(self.clone());
        let mut cx = Context::from_waker(&waker);
        let scope = CurrentTask::enter(header.clone(), self.runtime.clone());
        let polled = panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)));

        let outcome = match polled {
            Ok(Poll::Pending) => {
                header.transition(TaskState::Suspended);
                if header.state().is_terminal() {
                    // Cancelled while this span was running.
                    *slot = None;
                }
                return;
            },
            Ok(Poll::Ready(Ok(value))) => Ok(value),
            Ok(Poll::Ready(Err(err))) => Err(TaskError::faulted(err)),
            Err(payload) => Err(TaskError::from_panic(payload)),
        };

        *slot = None;
        drop(slot);
        drop(scope);
        self.finish(outcome);
    }

    fn finish(
        &self,
        outcome: TaskResult<T>,
    ) {
        if self.core.complete(outcome) {
            if let Some(shared) = self.runtime.upgrade() {
                shared.on_terminal(&self.core.header);
            }
        }
    }
}

impl<T, F> Schedulable for Runnable<T, F>
where
    T: Send + 'static,
    F: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    fn header(&self) -> &Arc<TaskHeader> {
        &self.core.header
    }

    fn schedule(self: Arc<Self>) {
        if self.core.header.state().is_terminal() {
            return;
        }
        if self.scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let context = self.core.header.context();
        context.schedule_continuation(Box::new(move || self.run()));
    }

    fn cancel(&self) {
        self.finish(Err(TaskError::Cancelled));
        // A span blocked inside its body keeps the lock; `run` drops the body then.
        if let Some(mut slot) = self.future.try_lock() {
            *slot = None;
        }
    }
}

impl<T, F> Wake for Runnable<T, F>
where
    T: Send + 'static,
    F: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    fn wake(self: Arc<Self>) {
        Schedulable::schedule(self);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        Schedulable::schedule(self.clone());
    }
}

/// Handle to a tracked task.
///
/// Awaiting the handle (inside another task) or calling
/// [`block_until_complete`](Self::block_until_complete) (outside) observes the
/// outcome. A task that fails while nobody observes it and whose last handle is
/// dropped goes to the unobserved-failure sink.
pub struct TaskHandle<T> {
    core: Arc<TaskCore<T>>,
}

impl<T> TaskHandle<T> {
    /// Wrap a freshly created tracked core; takes over its initial handle count.
    pub(crate) fn from_core(core: Arc<TaskCore<T>>) -> Self {
        Self { core }
    }

    /// Get the task ID.
    #[inline]
    pub fn id(&self) -> TaskId {
        self.core.header.id
    }

    /// Get the task name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.core.header.name
    }

    /// Get the current state.
    #[inline]
    pub fn state(&self) -> TaskState {
        self.core.header.state()
    }

    /// Whether the task reached a terminal state.
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Whether the outcome has been observed.
    #[inline]
    pub fn is_observed(&self) -> bool {
        self.core.header.is_observed()
    }

    /// The context the task's continuations run on.
    pub fn context(&self) -> ExecutionContext {
        self.core.header.context()
    }

    /// Type-erased header.
    pub fn header(&self) -> &Arc<TaskHeader> {
        &self.core.header
    }
}

impl<T: Clone> TaskHandle<T> {
    /// Halt the calling thread until the task is terminal.
    ///
    /// On a worker thread the worker is recorded as Blocked for the duration.
    /// If the task needs that same worker to make progress this never returns
    /// (until shutdown cancels the task).
    pub fn block_until_complete(&self) -> TaskResult<T> {
        self.warn_if_inside_task();
        let _blocked = worker::current_slot().map(|slot| slot.block_on(self.core.header.clone()));

        let mut inner = self.core.inner.lock();
        self.core.header.mark_observed();
        loop {
            if let Some(outcome) = &inner.outcome {
                return outcome.clone();
            }
            self.core.done.wait(&mut inner);
        }
    }

    /// Like [`block_until_complete`](Self::block_until_complete) but gives up after `timeout`.
    pub fn block_until_complete_timeout(
        &self,
        timeout: Duration,
    ) -> Result<T, WaitError> {
        self.warn_if_inside_task();
        let _blocked = worker::current_slot().map(|slot| slot.block_on(self.core.header.clone()));
        let deadline = Instant::now() + timeout;

        let mut inner = self.core.inner.lock();
        self.core.header.mark_observed();
        loop {
            if let Some(outcome) = &inner.outcome {
                return outcome.clone().map_err(WaitError::from);
            }
            if self.core.done.wait_until(&mut inner, deadline).timed_out() && inner.outcome.is_none() {
                return Err(WaitError::TimedOut(timeout));
            }
        }
    }

    fn warn_if_inside_task(&self) {
        if let Some(current) = current_task() {
            warn!(
                task = %current,
                waiting_on = %self.id(),
                "blocking wait inside a task body"
            );
        }
    }
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        self.core.inner.lock().handles += 1;
        Self {
            core: self.core.clone(),
        }
    }
}

impl<T> Drop for TaskHandle<T> {
    fn drop(&mut self) {
        let unobserved = {
            let mut inner = self.core.inner.lock();
            inner.handles = inner.handles.saturating_sub(1);
            self.core.take_unobserved(&mut inner)
        };
        if let Some(failure) = unobserved {
            self.core.sink.report(failure);
        }
    }
}

impl<T: Clone> Future for TaskHandle<T> {
    type Output = TaskResult<T>;

    fn poll(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        let mut inner = self.core.inner.lock();
        self.core.header.mark_observed();
        if let Some(outcome) = &inner.outcome {
            return Poll::Ready(outcome.clone());
        }
        if !inner.continuations.iter().any(|waker| waker.will_wake(cx.waker())) {
            inner.continuations.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("header", &self.core.header)
            .finish()
    }
}

struct TaskScope {
    header: Arc<TaskHeader>,
    runtime: Weak<Shared>,
}

thread_local! {
    static CURRENT_TASK: RefCell<Option<TaskScope>> = const { RefCell::new(None) };
}

/// Marks the task being polled on this thread; restores the previous one on drop.
struct CurrentTask {
    previous: Option<TaskScope>,
}

impl CurrentTask {
    fn enter(
        header: Arc<TaskHeader>,
        runtime: Weak<Shared>,
    ) -> Self {
        let previous = CURRENT_TASK.with(|current| current.borrow_mut().replace(TaskScope { header, runtime }));
        Self { previous }
    }
}

impl Drop for CurrentTask {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_TASK.with(|current| *current.borrow_mut() = previous);
    }
}

/// ID of the task whose span is running on this thread, if any.
pub fn current_task() -> Option<TaskId> {
    CURRENT_TASK.with(|current| current.borrow().as_ref().map(|scope| scope.header.id))
}

pub(crate) fn current_header() -> Option<Arc<TaskHeader>> {
    CURRENT_TASK.with(|current| current.borrow().as_ref().map(|scope| scope.header.clone()))
}

pub(crate) fn current_runtime() -> Option<Arc<Shared>> {
    CURRENT_TASK.with(|current| current.borrow().as_ref().and_then(|scope| scope.runtime.upgrade()))
}

/// Future adapter returned by [`ConfigureAwait::configure_await`].
pub struct Configured<F: Future> {
    inner: Pin<Box<F>>,
    continue_on_captured_context: bool,
}

impl<F: Future> Future for Configured<F> {
    type Output = F::Output;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        if self.continue_on_captured_context {
            return self.inner.as_mut().poll(cx);
        }

        // Switch before polling so a wake racing with this poll already targets the pool.
        let switched = match (current_header(), current_runtime()) {
            (Some(header), Some(runtime)) => {
                let previous = header.set_context(runtime.pooled_context());
                Some((header, previous))
            },
            _ => None,
        };

        let poll = self.inner.as_mut().poll(cx);
        if poll.is_ready() {
            // Completed synchronously: nothing was posted, stay where we are.
            if let Some((header, previous)) = switched {
                header.set_context(previous);
            }
        }
        poll
    }
}

/// Choose where the rest of the current task runs after an await.
///
/// `configure_await(false)` moves the task to the pooled context at its next
/// suspension, so its continuation does not need the (possibly blocked)
/// context it started on. `configure_await(true)` keeps the captured context.
pub trait ConfigureAwait: Future + Sized {
    /// Wrap the future with the given continuation policy.
    fn configure_await(
        self,
        continue_on_captured_context: bool,
    ) -> Configured<Self> {
        Configured {
            inner: Box::pin(self),
            continue_on_captured_context,
        }
    }
}

impl<F: Future> ConfigureAwait for F {}
