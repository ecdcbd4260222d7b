//! Error types for task outcomes and blocking waits.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// The error stored in a task that did not complete successfully.
///
/// Cloneable so that every observer of a failed task (each awaiting task and
/// each blocked thread) receives its own copy of the same failure.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// The task body returned an error.
    #[error("task faulted: {0}")]
    Faulted(Arc<anyhow::Error>),

    /// The task body panicked.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The task was cancelled before reaching a result (scheduler shutdown).
    #[error("task was cancelled")]
    Cancelled,
}

impl TaskError {
    /// Wrap an error returned by a task body.
    pub fn faulted(err: anyhow::Error) -> Self {
        TaskError::Faulted(Arc::new(err))
    }

    /// Build from a panic payload caught with `catch_unwind`.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        TaskError::Panicked(message)
    }

    /// Whether this error came from the task body (not from cancellation).
    #[inline]
    pub fn is_failure(&self) -> bool {
        !matches!(self, TaskError::Cancelled)
    }

    /// Try to view the underlying body error as a concrete type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        match self {
            TaskError::Faulted(err) => err.downcast_ref::<E>(),
            _ => None,
        }
    }
}

/// Error returned by [`TaskHandle::block_until_complete_timeout`].
///
/// [`TaskHandle::block_until_complete_timeout`]: super::TaskHandle::block_until_complete_timeout
#[derive(Debug, Clone, Error)]
pub enum WaitError {
    /// The task reached a terminal state other than Completed.
    #[error(transparent)]
    Task(#[from] TaskError),

    /// The task did not reach a terminal state in time.
    #[error("task did not complete within {0:?}")]
    TimedOut(Duration),
}

/// Result type for task outcomes.
pub type TaskResult<T> = Result<T, TaskError>;
