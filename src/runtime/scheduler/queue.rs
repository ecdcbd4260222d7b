//! Continuation queues for the scheduler
//!
//! Multi-producer, multi-consumer FIFO of continuations. The pooled context
//! shares one queue between all pool workers; every affine context owns a
//! private queue drained only by its bound worker.

use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};

/// A unit of work posted to an execution context: either one span of a task
/// body or a plain closure posted by a driver.
pub type Continuation = Box<dyn FnOnce() + Send + 'static>;

/// A thread-safe FIFO of continuations.
pub struct ContinuationQueue {
    tx: Sender<Continuation>,
    rx: Receiver<Continuation>,
}

impl ContinuationQueue {
    /// Create a new empty queue.
    #[inline]
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self { tx, rx }
    }

    /// Push a continuation to the back of the queue.
    #[inline]
    pub fn push(
        &self,
        continuation: Continuation,
    ) {
        // Both ends live in `self`, so the channel can never be disconnected here.
        let _ = self.tx.send(continuation);
    }

    /// Pop the front continuation without waiting.
    #[inline]
    pub fn try_pop(&self) -> Option<Continuation> {
        self.rx.try_recv().ok()
    }

    /// Pop the front continuation, waiting up to `timeout` for one to arrive.
    pub fn pop_timeout(
        &self,
        timeout: Duration,
    ) -> Option<Continuation> {
        match self.rx.recv_timeout(timeout) {
            Ok(continuation) => Some(continuation),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Drop every queued continuation, returning how many were discarded.
    pub fn drain(&self) -> usize {
        self.rx.try_iter().count()
    }

    /// Get the number of queued continuations.
    #[inline]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Check if the queue is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Clone for ContinuationQueue {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl Default for ContinuationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ContinuationQueue {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("ContinuationQueue")
            .field("len", &self.len())
            .finish()
    }
}
