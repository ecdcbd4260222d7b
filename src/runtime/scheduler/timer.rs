//! Timer thread and suspension primitives
//!
//! Instead of parking a worker for a delay, a task registers its waker with the
//! timer thread and suspends. The timer thread waits on a condvar for the
//! earliest deadline and wakes the registered tasks, which posts their next
//! span onto their own execution context.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use super::task::current_runtime;

/// Entry in the timer heap
struct TimerEntry {
    /// When to wake
    deadline: Instant,
    /// Tie-breaker keeping registration order for equal deadlines
    seq: u64,
    /// Waker of the suspended task
    waker: Waker,
}

// Reverse ordering for min-heap (earliest deadline first)
impl Ord for TimerEntry {
    fn cmp(
        &self,
        other: &Self,
    ) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(
        &self,
        other: &Self,
    ) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

/// Timer thread for delay handling
pub struct TimerThread {
    heap: Mutex<BinaryHeap<TimerEntry>>,
    notify: Condvar,
    shutdown: AtomicBool,
    next_seq: AtomicU64,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimerThread {
    /// Create a timer (not started).
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Condvar::new(),
            shutdown: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
            handle: Mutex::new(None),
        })
    }

    /// Start the timer thread.
    pub fn start(
        self: &Arc<Self>,
        name: String,
    ) -> std::io::Result<()> {
        let timer = Arc::clone(self);
        let handle = thread::Builder::new().name(name).spawn(move || timer.run_loop())?;
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// Stop the timer thread. Pending wakers are dropped without firing.
    pub fn stop(&self) {
        {
            let _heap = self.heap.lock();
            self.shutdown.store(true, AtomicOrdering::SeqCst);
        }
        self.notify.notify_one();

        if let Some(handle) = self.handle.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        self.heap.lock().clear();
    }

    /// Wake `waker` at `deadline`.
    pub fn register(
        &self,
        deadline: Instant,
        waker: Waker,
    ) {
        let seq = self.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
        let mut heap = self.heap.lock();
        heap.push(TimerEntry { deadline, seq, waker });
        // The new entry may be earlier than the one the thread is waiting for.
        self.notify.notify_one();
    }

    /// Number of registered, not yet fired timers.
    pub fn pending(&self) -> usize {
        self.heap.lock().len()
    }

    fn run_loop(&self) {
        let mut heap = self.heap.lock();
        loop {
            if self.shutdown.load(AtomicOrdering::SeqCst) {
                break;
            }

            let now = Instant::now();
            let mut due = Vec::new();
            while let Some(entry) = heap.peek() {
                if entry.deadline > now {
                    break;
                }
                if let Some(entry) = heap.pop() {
                    due.push(entry.waker);
                }
            }

            if !due.is_empty() {
                // Waking posts continuations; do it without holding the heap.
                drop(heap);
                for waker in due {
                    waker.wake();
                }
                heap = self.heap.lock();
                continue;
            }

            match heap.peek().map(|entry| entry.deadline) {
                Some(deadline) => {
                    self.notify.wait_until(&mut heap, deadline);
                },
                None => self.notify.wait(&mut heap),
            }
        }
        debug!("timer thread shutting down");
    }
}

/// Future returned by [`delay`].
#[derive(Debug)]
pub struct Delay {
    deadline: Instant,
    registered: Option<Waker>,
}

/// Suspend the current task for `duration`.
///
/// Inside a scheduler task the wake-up is served by the scheduler's timer
/// thread; anywhere else a sleeper thread is used.
/// Durations past what `Instant` can represent are capped at one year.
pub fn delay(duration: Duration) -> Delay {
    let now = Instant::now();
    Delay {
        deadline: now
            .checked_add(duration)
            .unwrap_or(now + Duration::from_secs(365 * 24 * 3600)),
        registered: None,
    }
}

impl Delay {
    /// When the delay elapses.
    #[inline]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

impl Future for Delay {
    type Output = ();

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<()> {
        if Instant::now() >= self.deadline {
            return Poll::Ready(());
        }

        let already = self
            .registered
            .as_ref()
            .is_some_and(|waker| waker.will_wake(cx.waker()));
        if !already {
            let waker = cx.waker().clone();
            match current_runtime() {
                Some(runtime) => runtime.timer.register(self.deadline, waker.clone()),
                None => {
                    let deadline = self.deadline;
                    let sleeper = waker.clone();
                    thread::spawn(move || {
                        let now = Instant::now();
                        if deadline > now {
                            thread::sleep(deadline - now);
                        }
                        sleeper.wake();
                    });
                },
            }
            self.registered = Some(waker);
        }
        Poll::Pending
    }
}

/// Future returned by [`yield_now`].
#[derive(Debug, Default)]
pub struct YieldNow {
    yielded: bool,
}

/// Give the worker back: the current task is re-posted to the back of its
/// context's queue.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

impl Future for YieldNow {
    type Output = ();

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
