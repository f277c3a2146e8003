//! Flush scheduling and the "current computation" scope.
//!
//! A [`Scheduler`] is the context object one session (or one request) owns.
//! It is cheap to clone; clones share state. It holds:
//!
//! - the computation currently re-executing, used for automatic dependency
//!   capture ([`run_with`](Scheduler::run_with) sets and restores it),
//! - the flush queue and the post-flush queue, drained by
//!   [`flush`](Scheduler::flush),
//! - the reentrancy flag that turns nested flushes into no-ops,
//! - the global event collectors.
//!
//! ## Flush cycle
//!
//! ```text
//! loop {
//!     drain flush queue (FIFO, including entries queued while draining)
//!     run ONE post-flush callback
//!     stop when both queues are empty
//! }
//! ```
//!
//! Post-flush callbacks therefore always observe the state settled by every
//! flush listener queued before them, and anything a post-flush callback
//! invalidates is settled before the next post-flush callback runs.
//!
//! The scheduler is not meant to be driven from several threads at once:
//! the handles are `Send + Sync`, but callers must serialize flush cycles.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::computation::Computation;
use crate::error::Result;
use crate::listener::{ListenerRegistry, Subscription};
use crate::router::ReactiveEvent;

/// One-shot callback queued on a flush queue.
pub type FlushListener = Box<dyn FnOnce() -> Result<()> + Send>;

/// Listener type of the global event collectors.
pub type EventCollector = dyn Fn(&dyn ReactiveEvent) + Send + Sync;

/// Shared reactive context. See the module docs.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    current: Mutex<Option<Computation>>,
    flush_queue: Mutex<VecDeque<FlushListener>>,
    post_flush_queue: Mutex<VecDeque<FlushListener>>,
    flushing: AtomicBool,
    event_collectors: ListenerRegistry<EventCollector>,
}

/// RAII guard that restores the current computation when dropped,
/// even if the body panics.
struct CurrentComputationGuard<'a> {
    scheduler: &'a SchedulerInner,
    previous: Option<Computation>,
}

impl<'a> CurrentComputationGuard<'a> {
    fn new(scheduler: &'a SchedulerInner, computation: Option<Computation>) -> Self {
        let previous = std::mem::replace(&mut *scheduler.current.lock(), computation);
        Self {
            scheduler,
            previous,
        }
    }
}

impl Drop for CurrentComputationGuard<'_> {
    fn drop(&mut self) {
        *self.scheduler.current.lock() = self.previous.take();
    }
}

/// Clears the flushing flag on every exit path out of `flush`.
struct FlushingGuard<'a>(&'a AtomicBool);

impl Drop for FlushingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Scheduler {
    /// Create an idle scheduler with empty queues.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                current: Mutex::new(None),
                flush_queue: Mutex::new(VecDeque::new()),
                post_flush_queue: Mutex::new(VecDeque::new()),
                flushing: AtomicBool::new(false),
                event_collectors: ListenerRegistry::new(),
            }),
        }
    }

    /// The computation whose body is running right now, if any.
    pub fn current_computation(&self) -> Option<Computation> {
        self.inner.current.lock().clone()
    }

    /// Run `body` with `computation` as the current computation.
    ///
    /// Every reactive source read inside `body` registers itself as a
    /// dependency of `computation`. The previous current computation is
    /// restored afterwards, also when `body` panics.
    pub fn run_with<R>(&self, computation: &Computation, body: impl FnOnce() -> R) -> R {
        let _guard = CurrentComputationGuard::new(&self.inner, Some(computation.clone()));
        body()
    }

    /// Run `body` without a current computation, so reads inside it are not
    /// tracked.
    pub fn untracked<R>(&self, body: impl FnOnce() -> R) -> R {
        let _guard = CurrentComputationGuard::new(&self.inner, None);
        body()
    }

    /// Queue a one-shot callback for the next flush.
    pub fn add_flush_listener<F>(&self, listener: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.inner.flush_queue.lock().push_back(Box::new(listener));
    }

    /// Queue a one-shot callback that runs after the flush queue is drained.
    pub fn add_post_flush_listener<F>(&self, listener: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.inner.post_flush_queue.lock().push_back(Box::new(listener));
    }

    /// True while a flush cycle is running.
    pub fn is_flushing(&self) -> bool {
        self.inner.flushing.load(Ordering::Acquire)
    }

    /// True if either queue holds a callback.
    pub fn has_pending_work(&self) -> bool {
        !self.inner.flush_queue.lock().is_empty() || !self.inner.post_flush_queue.lock().is_empty()
    }

    fn pop_flush_listener(&self) -> Option<FlushListener> {
        self.inner.flush_queue.lock().pop_front()
    }

    fn pop_post_flush_listener(&self) -> Option<FlushListener> {
        self.inner.post_flush_queue.lock().pop_front()
    }

    /// Run queued callbacks until both queues are empty.
    ///
    /// A call made while a flush is already running returns `Ok(())`
    /// immediately; the running flush picks up whatever the nested caller
    /// queued. If a callback fails, the error is returned and the callbacks
    /// that did not run yet stay queued for the next flush.
    pub fn flush(&self) -> Result<()> {
        if self.inner.flushing.swap(true, Ordering::AcqRel) {
            cov_mark::hit!(nested_flush_skipped);
            tracing::debug!("flush already running, nested call ignored");
            return Ok(());
        }
        let _guard = FlushingGuard(&self.inner.flushing);

        let mut flush_runs = 0usize;
        let mut post_flush_runs = 0usize;

        // Fixed-point iteration: keep going until neither queue has work
        loop {
            while let Some(listener) = self.pop_flush_listener() {
                flush_runs += 1;
                listener()?;
            }

            match self.pop_post_flush_listener() {
                Some(listener) => {
                    post_flush_runs += 1;
                    listener()?;
                }
                None => {
                    if self.inner.flush_queue.lock().is_empty() {
                        break;
                    }
                }
            }
        }

        tracing::trace!(flush_runs, post_flush_runs, "flush cycle complete");
        Ok(())
    }

    /// Register a listener that sees every event fired through any router
    /// bound to this scheduler.
    pub fn add_event_collector<F>(&self, collector: F) -> Subscription
    where
        F: Fn(&dyn ReactiveEvent) + Send + Sync + 'static,
    {
        self.inner.event_collectors.add(Arc::new(collector))
    }

    /// Deliver `event` to the collectors registered when this call began.
    pub fn notify_event_collectors(&self, event: &dyn ReactiveEvent) {
        self.inner
            .event_collectors
            .dispatch(|collector| collector(event));
    }

    /// Create a computation that runs `body` on the next flush and again
    /// whenever a source `body` read changes.
    pub fn run_when_dependencies_change<F>(&self, body: F) -> Computation
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        Computation::new(self, body)
    }

    /// Clear the current computation, both queues, the flushing flag and
    /// every event collector.
    ///
    /// Test isolation only. Production code must never call this; it drops
    /// queued recomputes on the floor.
    pub fn reset(&self) {
        *self.inner.current.lock() = None;
        self.inner.flush_queue.lock().clear();
        self.inner.post_flush_queue.lock().clear();
        self.inner.flushing.store(false, Ordering::Release);
        self.inner.event_collectors.clear();
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("flushing", &self.is_flushing())
            .field("flush_queue", &self.inner.flush_queue.lock().len())
            .field("post_flush_queue", &self.inner.post_flush_queue.lock().len())
            .field("event_collectors", &self.inner.event_collectors.len())
            .finish()
    }
}
