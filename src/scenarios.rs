//! Demonstration scenarios
//!
//! Each scenario drives the scheduler as an external caller and records what
//! happened in a [`Transcript`]. Nothing here prints; the `taskctx` binary
//! attaches a listener to the transcript and renders the lines.
//!
//! | Scenario | Shows |
//! |----------|-------|
//! | [`captured`] | an awaited failure is caught by the awaiting task |
//! | [`fire_and_forget`] | a fire-and-forget failure can only reach the sink |
//! | [`pooled_wait`] | blocking on a pooled task from outside returns its error |
//! | [`affine_deadlock`] | blocking an affine worker on its own task never returns |
//! | [`try_finally`] | blocking in a cleanup path survives with `configure_await(false)` |
//! | [`compute`] | a fire-and-forget driver awaiting a chain of computations |

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context as _};
use crossbeam::channel;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

use crate::runtime::scheduler::{
    delay, ConfigureAwait, Escalation, ExecutionContext, Handle, Scheduler, SchedulerConfig, StallReport,
    TaskError, TaskResult, UnobservedFailure, UnobservedFailureSink, WaitError,
};

/// Error raised by scenario task bodies.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScenarioError {
    /// The simulated failure.
    #[error("{0}")]
    InvalidOperation(String),
}

/// Timing and sizing of the scenarios.
#[derive(Debug, Clone)]
pub struct ScenarioOptions {
    /// Base simulated I/O latency.
    pub step: Duration,
    /// Number of actions (try-finally) and computations (compute).
    pub iterations: usize,
    /// Stall threshold used by the affine-deadlock scenario.
    pub stall_timeout: Duration,
    /// Let the cleanup task of try-finally resume on its captured context.
    pub finally_on_captured_context: bool,
}

impl Default for ScenarioOptions {
    fn default() -> Self {
        Self {
            step: Duration::from_millis(200),
            iterations: 4,
            stall_timeout: Duration::from_millis(300),
            finally_on_captured_context: false,
        }
    }
}

impl ScenarioOptions {
    /// Upper bound for waiting on one scenario step.
    fn patience(&self) -> Duration {
        self.step.saturating_mul(10).saturating_add(Duration::from_secs(2))
    }
}

type Listener = Arc<dyn Fn(&str) + Send + Sync>;

/// Ordered record of what a scenario observed.
#[derive(Clone, Default)]
pub struct Transcript {
    lines: Arc<Mutex<Vec<String>>>,
    listener: Option<Listener>,
}

impl Transcript {
    /// Create an empty transcript.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transcript that also forwards every line to `listener`.
    pub fn with_listener<F>(listener: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        Self {
            lines: Arc::default(),
            listener: Some(Arc::new(listener)),
        }
    }

    /// Append a line.
    pub fn record(
        &self,
        line: impl Into<String>,
    ) {
        let line = line.into();
        debug!(line = %line, "transcript");
        if let Some(listener) = &self.listener {
            listener(&line);
        }
        self.lines.lock().push(line);
    }

    /// Snapshot of all lines.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    /// Whether any line contains `needle`.
    pub fn contains(
        &self,
        needle: &str,
    ) -> bool {
        self.lines.lock().iter().any(|line| line.contains(needle))
    }

    /// Number of lines containing `needle`.
    pub fn count(
        &self,
        needle: &str,
    ) -> usize {
        self.lines.lock().iter().filter(|line| line.contains(needle)).count()
    }
}

impl std::fmt::Debug for Transcript {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Transcript")
            .field("lines", &self.lines.lock().len())
            .field("listener", &self.listener.is_some())
            .finish()
    }
}

fn invalid_operation(message: String) -> anyhow::Error {
    ScenarioError::InvalidOperation(message).into()
}

const YEAR: Duration = Duration::from_secs(365 * 24 * 3600);

/// `unit * factor`, saturating instead of truncating or overflowing.
fn scaled(
    unit: Duration,
    factor: i64,
) -> Duration {
    unit.saturating_mul(u32::try_from(factor.max(0)).unwrap_or(u32::MAX))
}

fn thread_label() -> String {
    thread::current().name().unwrap_or("unnamed").to_string()
}

/// Delay, then fail.
async fn some_async(
    step: Duration,
    transcript: Transcript,
) -> anyhow::Result<()> {
    delay(step).await;
    transcript.record("Some Async completed.");
    Err(invalid_operation("Operation is not valid due to the current state of the object.".to_string()))
}

/// A task awaits a failing task and catches the failure.
pub fn captured(
    handle: &Handle,
    transcript: &Transcript,
) -> anyhow::Result<TaskError> {
    let pool = handle.pooled_context();
    let inner = handle.clone();
    let inner_pool = pool.clone();
    let t = transcript.clone();

    let outer = handle.submit_named(
        "async-task-exception-caught",
        async move {
            let failing = inner.submit_named(
                "throw-exception-async-task",
                async { Err::<(), _>(invalid_operation("thrown before the first await".to_string())) },
                &inner_pool,
            );
            match failing.await {
                Ok(()) => Ok(None),
                Err(err) => {
                    t.record(format!("Exception of ThrowExceptionAsyncTask caught here: {}", err));
                    anyhow::Ok(Some(err))
                },
            }
        },
        &pool,
    );

    match outer.block_until_complete()? {
        Some(err) => {
            transcript.record("Async Task Exception not caught here. It is caught in invoked method.");
            Ok(err)
        },
        None => bail!("the failing task completed successfully"),
    }
}

/// Name given to the failing fire-and-forget task.
pub const FIRE_AND_FORGET_TASK: &str = "throw-exception-async-void";

/// A fire-and-forget task fails; the caller has nothing to catch and the
/// failure reaches the sink.
///
/// Registers a sink callback that marks this scenario's failure as handled,
/// so the process survives. Any other failure still escalates.
pub fn fire_and_forget(
    handle: &Handle,
    transcript: &Transcript,
    options: &ScenarioOptions,
) -> anyhow::Result<UnobservedFailure> {
    let (tx, rx) = channel::unbounded();
    handle.on_unobserved_failure(move |failure| {
        if failure.name != FIRE_AND_FORGET_TASK {
            return Escalation::Terminate;
        }
        let _ = tx.send(failure.clone());
        Escalation::Handled
    });

    let pool = handle.pooled_context();
    handle.fire_and_forget_named(
        FIRE_AND_FORGET_TASK,
        async { Err(invalid_operation("thrown inside a fire-and-forget task".to_string())) },
        &pool,
    );
    transcript.record("fire_and_forget returned; there is no handle and nothing to catch here.");

    let failure = rx
        .recv_timeout(options.patience())
        .context("fire-and-forget failure never reached the sink")?;
    transcript.record(format!("Unobserved failure reached the sink: {}", failure.error));
    Ok(failure)
}

/// The external caller blocks on a pooled task that delays and then fails.
/// The continuation runs on another pool worker, so the wait returns.
pub fn pooled_wait(
    handle: &Handle,
    transcript: &Transcript,
    options: &ScenarioOptions,
) -> anyhow::Result<TaskError> {
    let pool = handle.pooled_context();
    let task = handle.submit_named("some-async", some_async(options.step, transcript.clone()), &pool);

    match task.block_until_complete_timeout(options.patience()) {
        Ok(()) => bail!("some-async completed successfully"),
        Err(WaitError::Task(err)) => {
            transcript.record(format!("Async Task Exception caught here: {}", err));
            Ok(err)
        },
        Err(err) => Err(err).context("blocking on a pooled task did not return"),
    }
}

/// Result of [`affine_deadlock`].
#[derive(Debug)]
pub struct DeadlockOutcome {
    /// What the stall detector reported.
    pub report: StallReport,
    /// How the blocked wait ended once the scheduler shut down.
    pub released: TaskResult<()>,
}

/// Code running on an affine "ui" context blocks on a task whose continuations
/// need that same context.
///
/// Runs on a private scheduler with the stall detector enabled. After the
/// stall is reported the scheduler is shut down, which cancels the task and
/// releases the blocked worker.
pub fn affine_deadlock(
    base: &SchedulerConfig,
    transcript: &Transcript,
    options: &ScenarioOptions,
) -> anyhow::Result<DeadlockOutcome> {
    let config = SchedulerConfig {
        stall_timeout: Some(options.stall_timeout),
        stall_poll_interval: (options.stall_timeout / 4).max(Duration::from_millis(5)),
        ..base.clone()
    };
    let scheduler = Scheduler::try_with_config_and_sink(config, UnobservedFailureSink::new())
        .context("failed to start the deadlock scheduler")?;
    let ui = scheduler.affine_context("ui").context("failed to start the ui worker")?;

    let (stall_tx, stall_rx) = channel::bounded(1);
    scheduler.on_stall(move |report| {
        let _ = stall_tx.try_send(report.clone());
    });

    let (done_tx, done_rx) = channel::bounded(1);
    let handle = scheduler.handle();
    let target = ui.clone();
    let step = options.step;
    let t = transcript.clone();
    ui.post(move || {
        t.record(format!("ui handler running on {}", thread_label()));
        let task = handle.submit_named("some-async", some_async(step, t.clone()), &target);
        let outcome = task.block_until_complete();
        let _ = done_tx.send(outcome);
    });

    let report = stall_rx
        .recv_timeout(options.stall_timeout.saturating_add(options.patience()))
        .context("the stall detector did not report the blocked ui worker")?;
    transcript.record(format!("Deadlock!!! {}", report));

    if done_rx.try_recv().is_ok() {
        bail!("the blocked ui handler returned before shutdown");
    }
    transcript.record("the ui handler is still blocked; shutting the scheduler down");

    scheduler.shutdown();
    let released = done_rx
        .recv_timeout(options.patience())
        .context("shutdown did not release the blocked ui worker")?;
    match &released {
        Err(err) => transcript.record(format!("blocked wait released: {}", err)),
        Ok(()) => transcript.record("blocked wait released with a result"),
    }

    Ok(DeadlockOutcome { report, released })
}

/// One part of an action: delay, and fail on part 2.
async fn action_task(
    task_id: usize,
    part: usize,
    step: Duration,
) -> anyhow::Result<()> {
    delay(step).await;
    if part == 2 {
        return Err(invalid_operation(format!(
            "Task '{}' part '{}' throw an exception.",
            task_id, part
        )));
    }
    Ok(())
}

/// Cleanup work started from a `finally` path. Handles its own failure.
async fn action_finally_task(
    task_id: usize,
    part: usize,
    step: Duration,
    on_captured_context: bool,
    transcript: Transcript,
) -> anyhow::Result<()> {
    let attempt = async {
        delay(step).configure_await(on_captured_context).await;
        if task_id % 2 == 0 {
            bail!("Task '{}' part '{}' throw an exception.", task_id, part);
        }
        transcript.record(format!("Task '{}' part '{}' completed...", task_id, part));
        anyhow::Ok(())
    }
    .await;

    if let Err(err) = attempt {
        transcript.record(format!("FINALLY BLOCK: {}", err));
    }
    Ok(())
}

/// The body of one action, running on `ui`.
async fn do_some_action(
    task_id: usize,
    handle: Handle,
    ui: ExecutionContext,
    options: ScenarioOptions,
    transcript: Transcript,
) -> anyhow::Result<()> {
    let step = options.step;
    let attempt = async {
        handle.start(action_task(task_id, 1, step), &ui).await?;
        handle.start(action_task(task_id, 2, step), &ui).await?;
        anyhow::Ok(())
    }
    .await;

    if let Err(err) = attempt {
        transcript.record(format!("TRY BLOCK: {}", err));
    }

    // finally: block the ui worker until the cleanup finishes
    let cleanup = handle.start(
        action_finally_task(
            task_id,
            3,
            step,
            options.finally_on_captured_context,
            transcript.clone(),
        ),
        &ui,
    );
    cleanup.block_until_complete()?;

    transcript.record(format!("Task '{}' completed.", task_id));
    Ok(())
}

/// Actions on an affine "ui" context that block in their cleanup path.
///
/// The cleanup task resumes on the pool (`configure_await(false)`) unless
/// [`ScenarioOptions::finally_on_captured_context`] is set, in which case the
/// first action deadlocks the ui worker and this returns an error after the
/// patience window. Returns the number of completed actions.
pub fn try_finally(
    handle: &Handle,
    transcript: &Transcript,
    options: &ScenarioOptions,
) -> anyhow::Result<usize> {
    let ui = handle.affine_context("ui").context("failed to start the ui worker")?;

    let actions: Vec<_> = (0..options.iterations)
        .map(|task_id| {
            transcript.record(format!("ActionTask '{}' - before started.", task_id));
            let action = handle.submit_named(
                format!("do-some-action-{}", task_id),
                do_some_action(task_id, handle.clone(), ui.clone(), options.clone(), transcript.clone()),
                &ui,
            );
            transcript.record(format!("ActionTask '{}' - after started.", task_id));
            action
        })
        .collect();

    let rounds = i64::try_from(options.iterations.max(1)).unwrap_or(i64::MAX);
    let now = Instant::now();
    let deadline = now.checked_add(scaled(options.patience(), rounds)).unwrap_or(now + YEAR);
    let mut completed = 0;
    for action in &actions {
        let remaining = deadline.saturating_duration_since(Instant::now());
        action
            .block_until_complete_timeout(remaining)
            .with_context(|| format!("action '{}' did not finish", action.name()))?;
        completed += 1;
    }
    info!(completed, "try-finally actions finished");
    Ok(completed)
}

/// Double `number` after a simulated I/O delay.
async fn calculate(
    number: i64,
    unit: Duration,
    transcript: Transcript,
) -> anyhow::Result<i64> {
    let doubled = number.saturating_mul(2);
    delay(scaled(unit, doubled)).await;
    transcript.record(format!(
        "In continuation of calculateFunc for number:{} in thread:{}",
        doubled,
        thread_label()
    ));
    Ok(doubled)
}

/// A fire-and-forget driver awaits a chain of computations on the pool and
/// hands the results back over a channel.
pub fn compute(
    handle: &Handle,
    transcript: &Transcript,
    options: &ScenarioOptions,
) -> anyhow::Result<Vec<i64>> {
    let pool = handle.pooled_context();
    let (tx, rx) = channel::bounded(1);
    let inner = handle.clone();
    let t = transcript.clone();
    let iterations = i64::try_from(options.iterations).unwrap_or(i64::MAX);
    let unit = (options.step / 10).max(Duration::from_millis(1));

    handle.fire_and_forget_named(
        "compute-some-async",
        async move {
            let pool = inner.pooled_context();
            let mut results = Vec::new();
            for i in 0..iterations {
                let result = inner.submit(calculate(i, unit, t.clone()), &pool).await?;
                t.record(format!(
                    "In continuation of ComputeSomeAsync for result:{} in thread:{}",
                    result,
                    thread_label()
                ));
                results.push(result);
            }
            let _ = tx.send(results);
            anyhow::Ok(())
        },
        &pool,
    );

    transcript.record(format!(
        "Main thread other work finished. Waiting for ComputeSomeAsync in thread:{}",
        thread_label()
    ));
    let patience = options
        .patience()
        .saturating_add(scaled(unit, iterations.saturating_mul(iterations).saturating_mul(2)));
    rx.recv_timeout(patience).context("compute driver did not finish")
}

/// A scenario selectable from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    Captured,
    FireAndForget,
    PooledWait,
    AffineDeadlock,
    TryFinally,
    Compute,
}

impl Scenario {
    /// Every scenario, in the order `all` runs them.
    pub const ALL: [Scenario; 6] = [
        Scenario::Captured,
        Scenario::FireAndForget,
        Scenario::PooledWait,
        Scenario::TryFinally,
        Scenario::Compute,
        Scenario::AffineDeadlock,
    ];

    /// Command-line name.
    pub fn name(&self) -> &'static str {
        match self {
            Scenario::Captured => "captured",
            Scenario::FireAndForget => "fire-and-forget",
            Scenario::PooledWait => "pooled-wait",
            Scenario::AffineDeadlock => "affine-deadlock",
            Scenario::TryFinally => "try-finally",
            Scenario::Compute => "compute",
        }
    }
}

impl std::fmt::Display for Scenario {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Run one scenario. `handle` serves every scenario except
/// [`Scenario::AffineDeadlock`], which starts its own scheduler from `base`.
pub fn run(
    scenario: Scenario,
    handle: &Handle,
    base: &SchedulerConfig,
    transcript: &Transcript,
    options: &ScenarioOptions,
) -> anyhow::Result<()> {
    info!(scenario = %scenario, "running scenario");
    match scenario {
        Scenario::Captured => captured(handle, transcript).map(drop),
        Scenario::FireAndForget => fire_and_forget(handle, transcript, options).map(drop),
        Scenario::PooledWait => pooled_wait(handle, transcript, options).map(drop),
        Scenario::AffineDeadlock => affine_deadlock(base, transcript, options).map(drop),
        Scenario::TryFinally => try_finally(handle, transcript, options).map(drop),
        Scenario::Compute => compute(handle, transcript, options).map(drop),
    }
    .with_context(|| format!("scenario '{}' failed", scenario))
}
