//! Stall detector
//!
//! Reports, but never resolves, the affinity deadlock: a worker blocked in
//! `block_until_complete(T)` for longer than the configured timeout, where
//! `T`'s continuations are bound to an affine context served by that same
//! worker. Each (worker, task) pair is reported once.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use hashbrown::HashSet;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::warn;

use super::task::TaskId;
use super::worker::{WorkerId, WorkerRegistry, WorkerSlot};

/// A suspected deadlock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StallReport {
    /// The blocked worker.
    pub worker: WorkerId,
    /// Its thread name.
    pub worker_name: String,
    /// The task it is blocked on.
    pub task: TaskId,
    /// The affine context the task needs.
    pub context: String,
    /// How long the worker had been blocked when detected.
    pub blocked_for: Duration,
    /// Continuations queued on the context that cannot run.
    pub stranded: usize,
}

impl std::fmt::Display for StallReport {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(
            f,
            "{} ({}) blocked for {:?} on {} whose continuations need {} ({} stranded)",
            self.worker, self.worker_name, self.blocked_for, self.task, self.context, self.stranded
        )
    }
}

/// Callback invoked with every stall report.
pub type StallCallback = Box<dyn Fn(&StallReport) + Send + Sync>;

/// Inspect one worker; `Some` if it is blocked on a task only it can resume.
pub fn inspect(
    slot: &WorkerSlot,
    timeout: Duration,
) -> Option<StallReport> {
    let blocked = slot.blocked_on()?;
    let blocked_for = blocked.elapsed();
    if blocked_for < timeout || blocked.task.state().is_terminal() {
        return None;
    }

    let context = blocked.task.context();
    if context.bound_worker() != Some(slot.id()) {
        return None;
    }

    Some(StallReport {
        worker: slot.id(),
        worker_name: slot.name().to_string(),
        task: blocked.task.id(),
        context: context.to_string(),
        blocked_for,
        stranded: context.pending(),
    })
}

/// Background thread polling the worker registry.
pub struct StallDetector {
    timeout: Duration,
    interval: Duration,
    reports: Mutex<Vec<StallReport>>,
    seen: Mutex<HashSet<(WorkerId, TaskId)>>,
    callbacks: RwLock<Vec<StallCallback>>,
    stop: Mutex<bool>,
    wake: Condvar,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl StallDetector {
    /// Create a detector (not started).
    pub fn new(
        timeout: Duration,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            timeout,
            interval,
            reports: Mutex::new(Vec::new()),
            seen: Mutex::new(HashSet::new()),
            callbacks: RwLock::new(Vec::new()),
            stop: Mutex::new(false),
            wake: Condvar::new(),
            handle: Mutex::new(None),
        })
    }

    /// Stall threshold.
    #[inline]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Start polling `workers` on a dedicated thread.
    pub fn start(
        self: &Arc<Self>,
        name: String,
        workers: Arc<WorkerRegistry>,
    ) -> std::io::Result<()> {
        let detector = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || detector.run_loop(&workers))?;
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// Stop the polling thread.
    pub fn stop(&self) {
        *self.stop.lock() = true;
        self.wake.notify_all();
        if let Some(handle) = self.handle.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    /// Register a callback for new reports.
    pub fn on_stall(
        &self,
        callback: StallCallback,
    ) {
        self.callbacks.write().push(callback);
    }

    /// All reports so far.
    pub fn reports(&self) -> Vec<StallReport> {
        self.reports.lock().clone()
    }

    /// Inspect every worker once and publish new reports.
    pub fn scan(
        &self,
        workers: &WorkerRegistry,
    ) -> usize {
        let mut published = 0;
        for slot in workers.snapshot() {
            let Some(report) = inspect(&slot, self.timeout) else {
                continue;
            };
            if !self.seen.lock().insert((report.worker, report.task)) {
                continue;
            }

            warn!("suspected deadlock: {}", report);
            for callback in self.callbacks.read().iter() {
                callback(&report);
            }
            self.reports.lock().push(report);
            published += 1;
        }
        published
    }

    fn run_loop(
        &self,
        workers: &WorkerRegistry,
    ) {
        loop {
            {
                let mut stop = self.stop.lock();
                if *stop {
                    break;
                }
                self.wake.wait_for(&mut stop, self.interval);
                if *stop {
                    break;
                }
            }
            self.scan(workers);
        }
    }
}

impl std::fmt::Debug for StallDetector {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("StallDetector")
            .field("timeout", &self.timeout)
            .field("interval", &self.interval)
            .field("reports", &self.reports.lock().len())
            .finish()
    }
}
