//! Unobserved-failure sink
//!
//! Failures nobody can observe are escalated here instead of unwinding any
//! caller:
//!
//! - a fire-and-forget task that fails,
//! - a tracked task that fails and whose handles were all dropped without the
//!   outcome ever being awaited or blocked on,
//! - a panic escaping a closure posted directly to an execution context.
//!
//! With no callback registered the sink logs the failure and terminates the
//! process. Registered callbacks decide through [`Escalation`]; the process is
//! terminated after the callbacks return if any of them asks for it. A
//! callback that panics counts as asking for it; `report` itself never
//! unwinds.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::error;

use super::error::TaskError;
use super::task::{TaskId, TaskKind};

/// Where an unobserved failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOrigin {
    /// A fire-and-forget task; there was never a handle to observe it.
    FireAndForget,
    /// A tracked task whose handles were dropped unobserved.
    Unobserved,
    /// A closure posted straight to an execution context.
    Posted,
}

impl From<TaskKind> for FailureOrigin {
    fn from(kind: TaskKind) -> Self {
        match kind {
            TaskKind::FireAndForget => FailureOrigin::FireAndForget,
            TaskKind::Tracked => FailureOrigin::Unobserved,
        }
    }
}

/// A failure delivered to the sink.
#[derive(Debug, Clone)]
pub struct UnobservedFailure {
    /// The failed task, `None` for posted closures.
    pub task: Option<TaskId>,
    /// Task or worker name.
    pub name: String,
    /// How the failure became unobservable.
    pub origin: FailureOrigin,
    /// The stored error.
    pub error: TaskError,
}

impl std::fmt::Display for UnobservedFailure {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        match self.task {
            Some(id) => write!(f, "{} '{}' ({:?}): {}", id, self.name, self.origin, self.error),
            None => write!(f, "'{}' ({:?}): {}", self.name, self.origin, self.error),
        }
    }
}

/// Decision returned by a failure callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// Terminate the process once all callbacks have run.
    Terminate,
    /// The failure was handled; keep running.
    Handled,
}

/// Callback invoked with every unobserved failure.
pub type FailureCallback = Arc<dyn Fn(&UnobservedFailure) -> Escalation + Send + Sync>;

type Terminator = Box<dyn Fn(&UnobservedFailure) + Send + Sync>;

/// Process-wide (per scheduler) destination of unobserved failures.
pub struct UnobservedFailureSink {
    callbacks: RwLock<Vec<FailureCallback>>,
    terminator: Terminator,
    reported: AtomicUsize,
}

impl UnobservedFailureSink {
    /// Sink whose fatal path aborts the process.
    pub fn new() -> Self {
        Self::with_terminator(|failure| {
            error!("terminating process after unobserved failure: {}", failure);
            std::process::abort();
        })
    }

    /// Sink with a custom fatal path, used instead of aborting.
    pub fn with_terminator<F>(terminator: F) -> Self
    where
        F: Fn(&UnobservedFailure) + Send + Sync + 'static,
    {
        Self {
            callbacks: RwLock::new(Vec::new()),
            terminator: Box::new(terminator),
            reported: AtomicUsize::new(0),
        }
    }

    /// Register a callback. Registering any callback replaces the default
    /// "always terminate" behavior with the callbacks' decisions.
    pub fn register<F>(
        &self,
        callback: F,
    ) where
        F: Fn(&UnobservedFailure) -> Escalation + Send + Sync + 'static,
    {
        self.callbacks.write().push(Arc::new(callback));
    }

    /// Number of callbacks registered.
    pub fn callback_count(&self) -> usize {
        self.callbacks.read().len()
    }

    /// Number of failures delivered so far.
    pub fn reported_count(&self) -> usize {
        self.reported.load(Ordering::SeqCst)
    }

    /// Deliver a failure. Callers guarantee each failure is reported once.
    pub fn report(
        &self,
        failure: UnobservedFailure,
    ) {
        self.reported.fetch_add(1, Ordering::SeqCst);
        error!("unobserved failure: {}", failure);

        // Callbacks may register further callbacks; do not hold the lock while calling them.
        let callbacks: Vec<FailureCallback> = self.callbacks.read().clone();
        let terminate = callbacks.is_empty()
            || callbacks
                .iter()
                .map(|callback| Self::decide(callback, &failure))
                .fold(false, |acc, escalation| acc || escalation == Escalation::Terminate);

        if terminate {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| (self.terminator)(&failure))) {
                error!(
                    "unobserved-failure terminator panicked: {}",
                    TaskError::from_panic(payload)
                );
            }
        }
    }

    fn decide(
        callback: &FailureCallback,
        failure: &UnobservedFailure,
    ) -> Escalation {
        match panic::catch_unwind(AssertUnwindSafe(|| callback(failure))) {
            Ok(escalation) => escalation,
            Err(payload) => {
                error!(
                    "unobserved-failure callback panicked: {}",
                    TaskError::from_panic(payload)
                );
                Escalation::Terminate
            },
        }
    }
}

impl Default for UnobservedFailureSink {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for UnobservedFailureSink {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("UnobservedFailureSink")
            .field("callbacks", &self.callback_count())
            .field("reported", &self.reported_count())
            .finish()
    }
}
