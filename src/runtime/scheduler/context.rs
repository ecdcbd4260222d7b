//! Execution contexts
//!
//! An execution context decides where the continuations of a task run.
//!
//! - [`ExecutionContext::Pooled`]: continuations go to the scheduler's global
//!   ready-queue and any idle pool worker may run them, concurrently and in no
//!   particular order.
//! - [`ExecutionContext::Affine`]: continuations go to the context's private
//!   FIFO and only its bound worker runs them, one at a time, in submission
//!   order. While that worker is blocked nothing on the context makes progress.
//!
//! Every task carries its context as data, fixed at submission time (and only
//! changed by [`configure_await(false)`](super::ConfigureAwait)).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::queue::{Continuation, ContinuationQueue};
use super::worker::WorkerId;

static NEXT_CONTEXT_ID: AtomicUsize = AtomicUsize::new(1);

/// Identifier of an affine context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(usize);

impl ContextId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the inner value.
    #[inline]
    pub fn inner(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "Context({})", self.0)
    }
}

/// Affinity rule of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    /// Any pool worker.
    Pooled,
    /// One designated worker.
    Affine,
}

/// The pooled context: a handle onto the global ready-queue.
#[derive(Clone, Debug)]
pub struct PoolContext {
    queue: ContinuationQueue,
}

impl PoolContext {
    pub(crate) fn new(queue: ContinuationQueue) -> Self {
        Self { queue }
    }
}

/// A context bound to a single worker thread.
#[derive(Clone)]
pub struct AffineContext {
    inner: Arc<AffineInner>,
}

struct AffineInner {
    id: ContextId,
    name: String,
    worker: WorkerId,
    queue: ContinuationQueue,
}

impl AffineContext {
    pub(crate) fn new(
        id: ContextId,
        name: impl Into<String>,
        worker: WorkerId,
    ) -> Self {
        Self {
            inner: Arc::new(AffineInner {
                id,
                name: name.into(),
                worker,
                queue: ContinuationQueue::new(),
            }),
        }
    }

    /// Get the context ID.
    #[inline]
    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    /// Get the context name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The only worker allowed to run this context's continuations.
    #[inline]
    pub fn bound_worker(&self) -> WorkerId {
        self.inner.worker
    }

    /// Number of continuations waiting for the bound worker.
    #[inline]
    pub fn pending(&self) -> usize {
        self.inner.queue.len()
    }

    pub(crate) fn queue(&self) -> &ContinuationQueue {
        &self.inner.queue
    }
}

impl std::fmt::Debug for AffineContext {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("AffineContext")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("worker", &self.inner.worker)
            .field("pending", &self.pending())
            .finish()
    }
}

/// Where a task's continuations run.
#[derive(Clone, Debug)]
pub enum ExecutionContext {
    /// Any available pool worker.
    Pooled(PoolContext),
    /// One designated worker, strictly FIFO.
    Affine(AffineContext),
}

impl ExecutionContext {
    /// Enqueue a continuation according to this context's affinity rule.
    pub fn schedule_continuation(
        &self,
        continuation: Continuation,
    ) {
        match self {
            ExecutionContext::Pooled(pool) => pool.queue.push(continuation),
            ExecutionContext::Affine(affine) => affine.queue().push(continuation),
        }
    }

    /// Run a plain closure on this context, e.g. an event handler on a UI-like
    /// affine worker. A panic escaping `f` is reported as an unobserved failure.
    pub fn post<F>(
        &self,
        f: F,
    ) where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_continuation(Box::new(f));
    }

    /// Get the affinity rule.
    #[inline]
    pub fn kind(&self) -> ContextKind {
        match self {
            ExecutionContext::Pooled(_) => ContextKind::Pooled,
            ExecutionContext::Affine(_) => ContextKind::Affine,
        }
    }

    /// Check if this is an affine context.
    #[inline]
    pub fn is_affine(&self) -> bool {
        self.kind() == ContextKind::Affine
    }

    /// ID of the affine context, if any.
    #[inline]
    pub fn affine_id(&self) -> Option<ContextId> {
        match self {
            ExecutionContext::Affine(affine) => Some(affine.id()),
            ExecutionContext::Pooled(_) => None,
        }
    }

    /// The worker an affine context is bound to.
    #[inline]
    pub fn bound_worker(&self) -> Option<WorkerId> {
        match self {
            ExecutionContext::Affine(affine) => Some(affine.bound_worker()),
            ExecutionContext::Pooled(_) => None,
        }
    }

    /// Human-readable name.
    pub fn name(&self) -> &str {
        match self {
            ExecutionContext::Pooled(_) => "pool",
            ExecutionContext::Affine(affine) => affine.name(),
        }
    }

    /// Continuations queued on this context and not yet started.
    pub fn pending(&self) -> usize {
        match self {
            ExecutionContext::Pooled(pool) => pool.queue.len(),
            ExecutionContext::Affine(affine) => affine.pending(),
        }
    }

    /// Whether two values name the same context.
    pub fn same_as(
        &self,
        other: &ExecutionContext,
    ) -> bool {
        match (self, other) {
            (ExecutionContext::Pooled(_), ExecutionContext::Pooled(_)) => true,
            (ExecutionContext::Affine(a), ExecutionContext::Affine(b)) => a.id() == b.id(),
            _ => false,
        }
    }
}

impl std::fmt::Display for ExecutionContext {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        match self {
            ExecutionContext::Pooled(_) => write!(f, "pool"),
            ExecutionContext::Affine(affine) => write!(f, "{}#{}", affine.name(), affine.id().inner()),
        }
    }
}
