//! Task scheduler with execution-context affinity
//!
//! This module provides the [`Scheduler`]: a fixed pool of worker threads
//! serving the pooled context, one dedicated worker per affine context, a timer
//! thread for delays, a registry of live tasks, the unobserved-failure sink and
//! an optional stall detector.
//!
//! # Example
//!
//! ```no_run
//! use taskctx::runtime::scheduler::{delay, Scheduler};
//! use std::time::Duration;
//!
//! let scheduler = Scheduler::new();
//! let pool = scheduler.pooled_context();
//! let task = scheduler.submit(async {
//!     delay(Duration::from_millis(10)).await;
//!     anyhow::Ok(21 * 2)
//! }, &pool);
//! assert_eq!(task.block_until_complete().unwrap(), 42);
//! ```

pub mod context;
pub mod error;
pub mod queue;
pub mod sink;
pub mod task;
pub mod timer;
pub mod watchdog;
pub mod worker;

pub use context::{AffineContext, ContextId, ContextKind, ExecutionContext, PoolContext};
pub use error::{TaskError, TaskResult, WaitError};
pub use queue::{Continuation, ContinuationQueue};
pub use sink::{Escalation, FailureCallback, FailureOrigin, UnobservedFailure, UnobservedFailureSink};
pub use task::{current_task, ConfigureAwait, Configured, TaskHandle, TaskHeader, TaskId, TaskKind, TaskState};
pub use timer::{delay, yield_now, Delay, TimerThread, YieldNow};
pub use watchdog::{StallCallback, StallDetector, StallReport};
pub use worker::{current_worker, WorkerId, WorkerKind, WorkerRegistry, WorkerSlot, WorkerState};

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use task::{Runnable, Schedulable};

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of pool worker threads.
    pub num_workers: usize,
    /// How long an idle worker waits for work before re-checking shutdown.
    pub idle_timeout: Duration,
    /// Enables the stall detector: report workers blocked this long on a task
    /// only they can resume.
    pub stall_timeout: Option<Duration>,
    /// How often the stall detector scans the workers.
    pub stall_poll_interval: Duration,
    /// Prefix of every thread the scheduler spawns.
    pub thread_name_prefix: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let num_cpus = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            num_workers: num_cpus,
            idle_timeout: Duration::from_millis(10),
            stall_timeout: None,
            stall_poll_interval: Duration::from_millis(50),
            thread_name_prefix: "taskctx".to_string(),
        }
    }
}

/// Scheduler statistics.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    /// Total tasks submitted.
    pub tasks_submitted: AtomicUsize,
    /// Tasks finished as Completed.
    pub tasks_completed: AtomicUsize,
    /// Tasks finished as Failed.
    pub tasks_failed: AtomicUsize,
    /// Tasks finished as Cancelled.
    pub tasks_cancelled: AtomicUsize,
    /// Continuations executed by all workers.
    pub continuations_run: AtomicUsize,
}

impl SchedulerStats {
    /// Record a submitted task.
    #[inline]
    pub fn record_submitted(&self) {
        self.tasks_submitted.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a terminal transition.
    #[inline]
    pub fn record_terminal(
        &self,
        state: TaskState,
    ) {
        let counter = match state {
            TaskState::Completed => &self.tasks_completed,
            TaskState::Failed => &self.tasks_failed,
            TaskState::Cancelled => &self.tasks_cancelled,
            _ => return,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    /// Record an executed continuation.
    #[inline]
    pub fn record_continuation(&self) {
        self.continuations_run.fetch_add(1, Ordering::SeqCst);
    }

    /// Tasks submitted but not yet terminal.
    pub fn in_flight(&self) -> usize {
        let finished = self.tasks_completed.load(Ordering::SeqCst)
            + self.tasks_failed.load(Ordering::SeqCst)
            + self.tasks_cancelled.load(Ordering::SeqCst);
        self.tasks_submitted
            .load(Ordering::SeqCst)
            .saturating_sub(finished)
    }
}

/// State shared by the scheduler, its threads, its tasks and every [`Handle`].
pub(crate) struct Shared {
    config: SchedulerConfig,
    running: AtomicBool,
    ready: ContinuationQueue,
    registry: RwLock<HashMap<TaskId, Arc<dyn Schedulable>>>,
    workers: Arc<WorkerRegistry>,
    affine: Mutex<Vec<AffineContext>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    pub(crate) timer: Arc<TimerThread>,
    pub(crate) sink: Arc<UnobservedFailureSink>,
    stall_detector: Option<Arc<StallDetector>>,
    stats: SchedulerStats,
}

impl Shared {
    #[inline]
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn pooled_context(&self) -> ExecutionContext {
        ExecutionContext::Pooled(PoolContext::new(self.ready.clone()))
    }

    /// Called exactly once per task, after its terminal transition.
    pub(crate) fn on_terminal(
        &self,
        header: &TaskHeader,
    ) {
        self.registry.write().remove(&header.id());
        self.stats.record_terminal(header.state());
    }

    fn thread_name(
        &self,
        suffix: &str,
    ) -> String {
        format!("{}-{}", self.config.thread_name_prefix, suffix)
    }
}

/// How the first span of a new task is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Launch {
    /// Queued on the task's context.
    Posted,
    /// Polled immediately on the submitting thread.
    Inline,
}

/// Cloneable access to a running scheduler, usable from inside task bodies.
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

impl Handle {
    /// The handle of the scheduler running the current task, if any.
    pub fn current() -> Option<Handle> {
        task::current_runtime().map(|shared| Handle { shared })
    }

    /// Submit work; its first span is scheduled immediately on `context`.
    pub fn submit<T, F>(
        &self,
        work: F,
        context: &ExecutionContext,
    ) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.spawn(None, TaskKind::Tracked, work, context)
    }

    /// Submit work and run its first span right here, on the calling thread.
    ///
    /// Later spans are posted to `context` (or wherever the task moved with
    /// [`configure_await(false)`](ConfigureAwait)). This is how an `async`
    /// function call behaves when invoked from code already running on a
    /// context: it executes synchronously up to its first suspension point.
    pub fn start<T, F>(
        &self,
        work: F,
        context: &ExecutionContext,
    ) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        TaskHandle::from_core(self.create(None, TaskKind::Tracked, Launch::Inline, work, context))
    }

    /// Submit named work.
    pub fn submit_named<T, F>(
        &self,
        name: impl Into<String>,
        work: F,
        context: &ExecutionContext,
    ) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.spawn(Some(name.into()), TaskKind::Tracked, work, context)
    }

    /// Submit work nobody can observe. A failure goes straight to the
    /// unobserved-failure sink.
    pub fn fire_and_forget<F>(
        &self,
        work: F,
        context: &ExecutionContext,
    ) where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let core = self.create(None, TaskKind::FireAndForget, Launch::Posted, work, context);
        drop(core);
    }

    /// Named variant of [`fire_and_forget`](Self::fire_and_forget).
    pub fn fire_and_forget_named<F>(
        &self,
        name: impl Into<String>,
        work: F,
        context: &ExecutionContext,
    ) where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let core = self.create(Some(name.into()), TaskKind::FireAndForget, Launch::Posted, work, context);
        drop(core);
    }

    fn spawn<T, F>(
        &self,
        name: Option<String>,
        kind: TaskKind,
        work: F,
        context: &ExecutionContext,
    ) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        TaskHandle::from_core(self.create(name, kind, Launch::Posted, work, context))
    }

    fn create<T, F>(
        &self,
        name: Option<String>,
        kind: TaskKind,
        launch: Launch,
        work: F,
        context: &ExecutionContext,
    ) -> Arc<task::TaskCore<T>>
    where
        T: Send + 'static,
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let (runnable, core) = Runnable::create(name, kind, context.clone(), work, &self.shared);
        let header = runnable.header().clone();
        self.shared.stats.record_submitted();

        if !self.shared.is_running() {
            warn!(task = %header.id(), "submitted after shutdown; cancelling");
            runnable.cancel();
            return core;
        }

        self.shared
            .registry
            .write()
            .insert(header.id(), runnable.clone() as Arc<dyn Schedulable>);
        debug!(task = %header.id(), name = header.name(), context = %context, kind = ?kind, "task submitted");
        match launch {
            Launch::Posted => runnable.schedule(),
            Launch::Inline => {
                let slot = worker::current_slot();
                let previous = slot.as_ref().map(|slot| slot.state());
                runnable.run();
                if let (Some(slot), Some(state)) = (slot, previous) {
                    slot.set_state(state);
                }
            },
        }
        core
    }

    /// The pooled context: continuations run on any pool worker.
    pub fn pooled_context(&self) -> ExecutionContext {
        self.shared.pooled_context()
    }

    /// Create an affine context served by a new dedicated worker thread.
    pub fn affine_context(
        &self,
        name: impl Into<String>,
    ) -> std::io::Result<ExecutionContext> {
        let name = name.into();
        let thread_name = self.shared.thread_name(&name);
        let id = ContextId::next();
        let slot = self.shared.workers.register(thread_name.clone(), WorkerKind::Affine(id));
        let affine = AffineContext::new(id, name, slot.id());

        let shared = self.shared.clone();
        let queue_owner = affine.clone();
        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let queue = queue_owner.queue().clone();
                worker_loop(&shared, slot, &queue);
            })?;

        self.shared.affine.lock().push(affine.clone());
        self.shared.threads.lock().push(handle);
        debug!(context = %affine.id(), worker = %affine.bound_worker(), "affine context created");
        Ok(ExecutionContext::Affine(affine))
    }

    /// Register a callback for unobserved failures.
    pub fn on_unobserved_failure<F>(
        &self,
        callback: F,
    ) where
        F: Fn(&UnobservedFailure) -> Escalation + Send + Sync + 'static,
    {
        self.shared.sink.register(callback);
    }

    /// Register a callback for stall reports. No-op when the stall detector is disabled.
    pub fn on_stall<F>(
        &self,
        callback: F,
    ) where
        F: Fn(&StallReport) + Send + Sync + 'static,
    {
        match &self.shared.stall_detector {
            Some(detector) => detector.on_stall(Box::new(callback)),
            None => warn!("stall callback registered but the stall detector is disabled"),
        }
    }

    /// Every stall reported so far.
    pub fn stall_reports(&self) -> Vec<StallReport> {
        self.shared
            .stall_detector
            .as_ref()
            .map(|detector| detector.reports())
            .unwrap_or_default()
    }

    /// The unobserved-failure sink.
    #[inline]
    pub fn sink(&self) -> &Arc<UnobservedFailureSink> {
        &self.shared.sink
    }

    /// Get statistics.
    #[inline]
    pub fn stats(&self) -> &SchedulerStats {
        &self.shared.stats
    }

    /// All workers (pool and affine).
    #[inline]
    pub fn workers(&self) -> &Arc<WorkerRegistry> {
        &self.shared.workers
    }

    /// Number of tasks not yet terminal.
    pub fn pending_tasks(&self) -> usize {
        self.shared.registry.read().len()
    }

    /// Get the number of pool workers.
    #[inline]
    pub fn num_workers(&self) -> usize {
        self.shared.config.num_workers
    }

    /// Check if the scheduler is running.
    #[inline]
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("running", &self.is_running())
            .field("num_workers", &self.num_workers())
            .field("pending_tasks", &self.pending_tasks())
            .finish()
    }
}

/// The runtime: owns every scheduler thread. Dropping it shuts down.
#[derive(Debug)]
pub struct Scheduler {
    handle: Handle,
}

impl Scheduler {
    /// Create a scheduler with default config and the default (aborting) sink.
    #[inline]
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    /// Create a scheduler with custom configuration.
    pub fn with_config(config: SchedulerConfig) -> Self {
        Self::with_config_and_sink(config, UnobservedFailureSink::new())
    }

    /// Create a scheduler with custom configuration and sink.
    ///
    /// # Panics
    ///
    /// Panics if the operating system refuses to spawn the scheduler threads.
    pub fn with_config_and_sink(
        config: SchedulerConfig,
        sink: UnobservedFailureSink,
    ) -> Self {
        match Self::try_with_config_and_sink(config, sink) {
            Ok(scheduler) => scheduler,
            Err(err) => panic!("failed to start scheduler threads: {}", err),
        }
    }

    /// Fallible constructor.
    pub fn try_with_config_and_sink(
        config: SchedulerConfig,
        sink: UnobservedFailureSink,
    ) -> std::io::Result<Self> {
        let stall_detector = config
            .stall_timeout
            .map(|timeout| StallDetector::new(timeout, config.stall_poll_interval));

        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            ready: ContinuationQueue::new(),
            registry: RwLock::new(HashMap::new()),
            workers: Arc::new(WorkerRegistry::new()),
            affine: Mutex::new(Vec::new()),
            threads: Mutex::new(Vec::new()),
            timer: TimerThread::new(),
            sink: Arc::new(sink),
            stall_detector,
            stats: SchedulerStats::default(),
            config,
        });
        let scheduler = Self {
            handle: Handle {
                shared: shared.clone(),
            },
        };

        shared.timer.start(shared.thread_name("timer"))?;
        if let Some(detector) = &shared.stall_detector {
            detector.start(shared.thread_name("watchdog"), shared.workers.clone())?;
        }
        scheduler.spawn_workers()?;

        info!(
            workers = shared.config.num_workers,
            stall_detector = shared.stall_detector.is_some(),
            "scheduler started"
        );
        Ok(scheduler)
    }

    /// Spawn the pool worker threads.
    fn spawn_workers(&self) -> std::io::Result<()> {
        let shared = &self.handle.shared;
        for index in 0..shared.config.num_workers {
            let name = shared.thread_name(&format!("worker-{}", index));
            let slot = shared.workers.register(name.clone(), WorkerKind::Pooled);
            let worker_shared = shared.clone();
            let handle = thread::Builder::new().name(name).spawn(move || {
                let queue = worker_shared.ready.clone();
                worker_loop(&worker_shared, slot, &queue);
            })?;
            shared.threads.lock().push(handle);
        }
        Ok(())
    }

    /// A cloneable handle for use inside tasks.
    #[inline]
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Shut down: cancel every unfinished task (which releases blocked
    /// threads), stop the timer and stall detector, join every worker.
    pub fn shutdown(&self) {
        let shared = &self.handle.shared;
        if !shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(pending = self.pending_tasks(), "scheduler shutting down");

        cancel_all(shared);
        shared.timer.stop();
        if let Some(detector) = &shared.stall_detector {
            detector.stop();
        }

        let threads: Vec<_> = shared.threads.lock().drain(..).collect();
        let current = thread::current().id();
        for handle in threads {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("scheduler thread panicked");
            }
        }

        // Tasks submitted by spans that were still running during the first pass.
        cancel_all(shared);
        let dropped = shared.ready.drain()
            + shared
                .affine
                .lock()
                .iter()
                .map(|affine| affine.queue().drain())
                .sum::<usize>();
        debug!(dropped, "scheduler stopped");
    }
}

impl std::ops::Deref for Scheduler {
    type Target = Handle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.is_running() {
            self.shutdown();
        }
    }
}

fn cancel_all(shared: &Shared) {
    let pending: Vec<Arc<dyn Schedulable>> = shared.registry.read().values().cloned().collect();
    for task in pending {
        task.cancel();
    }
}

/// Main loop of every worker thread: drain `queue` until shutdown.
fn worker_loop(
    shared: &Arc<Shared>,
    slot: Arc<WorkerSlot>,
    queue: &ContinuationQueue,
) {
    worker::bind_current(slot.clone());
    debug!(worker = %slot.id(), name = slot.name(), "worker started");

    while shared.is_running() {
        let Some(continuation) = queue.pop_timeout(shared.config.idle_timeout) else {
            continue;
        };

        slot.set_state(WorkerState::Running(None));
        shared.stats.record_continuation();
        // Task spans catch their own panics and the sink never unwinds, so anything
        // reaching here came from a posted closure.
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(continuation)) {
            shared.sink.report(UnobservedFailure {
                task: None,
                name: slot.name().to_string(),
                origin: FailureOrigin::Posted,
                error: TaskError::from_panic(payload),
            });
        }
        slot.set_state(WorkerState::Idle);
    }

    worker::unbind_current();
    debug!(worker = %slot.id(), "worker stopped");
}

#[cfg(test)]
mod tests;
