use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::hash::FastIndexMap;
use crate::listener::Subscription;
use crate::router::{ReactiveEvent, ReactiveSource, SourceId};
use crate::scheduler::Scheduler;

/// User logic a computation re-runs.
pub type RecomputeBody = Box<dyn FnMut() -> Result<()> + Send>;

type InvalidateListener = Box<dyn FnOnce(&InvalidateEvent) + Send>;

/// Observable lifecycle state of a [`Computation`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComputationStatus {
    /// Created, first recompute still pending
    Fresh,
    /// Dependencies are current
    Valid,
    /// A dependency changed, recompute pending
    Invalidated,
    /// Terminal
    Stopped,
}

/// Passed to [`Computation::on_next_invalidate`] listeners.
#[derive(Debug)]
pub struct InvalidateEvent {
    computation: Computation,
}

impl InvalidateEvent {
    /// The computation that was invalidated.
    pub fn computation(&self) -> &Computation {
        &self.computation
    }
}

/// Re-evaluable unit of logic that tracks what it reads.
///
/// A computation is created invalidated, with its first recompute already
/// queued on the scheduler. Every reactive source read while its body runs
/// becomes a dependency; when any dependency changes the computation is
/// invalidated, drops all of its dependencies and queues one recompute.
/// Further changes before that recompute are ignored, so N changes between
/// two flushes cost one recompute.
///
/// # Example
/// ```ignore
/// let scheduler = Scheduler::new();
/// let count = ReactiveValue::new(&scheduler, 1);
///
/// let c = count.clone();
/// let printer = scheduler.run_when_dependencies_change(move || {
///     println!("count is {}", c.get());  // registers the dependency
///     Ok(())
/// });
///
/// scheduler.flush()?;   // prints "count is 1"
/// count.set(2);
/// count.set(3);
/// scheduler.flush()?;   // prints "count is 3" once
///
/// printer.stop();       // never runs again
/// ```
///
/// The handle is cheap to clone; clones refer to the same computation.
#[derive(Clone)]
pub struct Computation {
    inner: Arc<ComputationInner>,
}

struct ComputationInner {
    scheduler: Scheduler,
    /// Taken out while the body runs and put back by `BodyGuard`.
    body: Mutex<Option<RecomputeBody>>,
    state: Mutex<ComputationState>,
}

#[derive(Default)]
struct ComputationState {
    invalidated: bool,
    stopped: bool,
    has_run: bool,
    dependencies: FastIndexMap<SourceId, Subscription>,
    invalidate_listeners: Vec<InvalidateListener>,
}

/// Restores the body after it ran and clears the invalidated flag, also
/// when the body panics.
struct BodyGuard<'a> {
    inner: &'a ComputationInner,
    body: Option<RecomputeBody>,
}

impl Drop for BodyGuard<'_> {
    fn drop(&mut self) {
        let stopped = {
            let mut state = self.inner.state.lock();
            state.invalidated = false;
            state.has_run = true;
            state.stopped
        };
        // A computation stopped from inside its own body releases the body here
        if !stopped {
            if let Some(body) = self.body.take() {
                *self.inner.body.lock() = Some(body);
            }
        }
    }
}

impl Computation {
    /// Create a computation and queue its first recompute on `scheduler`.
    pub fn new<F>(scheduler: &Scheduler, body: F) -> Self
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        let computation = Self {
            inner: Arc::new(ComputationInner {
                scheduler: scheduler.clone(),
                body: Mutex::new(Some(Box::new(body))),
                state: Mutex::new(ComputationState {
                    invalidated: true,
                    ..Default::default()
                }),
            }),
        };
        computation.schedule_recompute();
        computation
    }

    fn schedule_recompute(&self) {
        let computation = self.clone();
        self.inner
            .scheduler
            .add_flush_listener(move || computation.recompute());
    }

    /// Mark the computation invalidated.
    ///
    /// Dependencies are released immediately. Unless stopped, a recompute is
    /// queued (once: invalidating an already invalidated computation does not
    /// queue a second one). Pending invalidate listeners fire once each and are
    /// forgotten; a listener that registers again while firing waits for the
    /// next invalidation.
    pub fn invalidate(&self) {
        let (dependencies, listeners, schedule) = {
            let mut state = self.inner.state.lock();
            let schedule = !state.invalidated && !state.stopped;
            state.invalidated = true;
            (
                std::mem::take(&mut state.dependencies),
                std::mem::take(&mut state.invalidate_listeners),
                schedule,
            )
        };

        for (_, subscription) in dependencies {
            subscription.remove();
        }

        if schedule {
            self.schedule_recompute();
        }

        if !listeners.is_empty() {
            let event = InvalidateEvent {
                computation: self.clone(),
            };
            for listener in listeners {
                listener(&event);
            }
        }
    }

    /// Run the body if the computation is invalidated and not stopped.
    ///
    /// The body runs as the scheduler's current computation, so every source
    /// it reads is recorded as a dependency. The invalidated flag is cleared
    /// whether the body succeeds, fails or panics. Errors are returned to the
    /// caller untouched; the computation keeps no dependencies from the failed
    /// run beyond those it registered before failing.
    pub fn recompute(&self) -> Result<()> {
        {
            let state = self.inner.state.lock();
            if !state.invalidated || state.stopped {
                return Ok(());
            }
        }

        let Some(body) = self.inner.body.lock().take() else {
            // Body is already running further up the stack
            cov_mark::hit!(reentrant_recompute_ignored);
            return Ok(());
        };
        let mut guard = BodyGuard {
            inner: &self.inner,
            body: Some(body),
        };

        let result = match guard.body.as_mut() {
            Some(body) => self.inner.scheduler.run_with(self, || body()),
            None => Ok(()),
        };
        drop(guard);

        if let Err(err) = &result {
            tracing::debug!(error = %err, "recompute body failed");
        }
        result
    }

    /// Subscribe to `source` on behalf of this computation.
    ///
    /// Meant to be called by reactive sources for the scheduler's current
    /// computation, not by application code. Ignored once stopped; a source
    /// that is already a dependency is not subscribed twice.
    pub fn add_dependency(&self, source: &dyn ReactiveSource) {
        let source_id = source.source_id();
        {
            let state = self.inner.state.lock();
            if state.stopped {
                cov_mark::hit!(dependency_ignored_after_stop);
                tracing::trace!(source = %source_id, "dependency on stopped computation ignored");
                return;
            }
            if state.dependencies.contains_key(&source_id) {
                return;
            }
        }

        // The source keeps its dependents alive until they invalidate or stop,
        // which removes this subscription again
        let computation = self.clone();
        let subscription = source.add_change_listener(Arc::new(move |event: &dyn ReactiveEvent| {
            computation.on_value_change(event);
        }));

        let mut state = self.inner.state.lock();
        if state.stopped {
            drop(state);
            subscription.remove();
            return;
        }
        if let Some(previous) = state.dependencies.insert(source_id, subscription) {
            // Registered concurrently through another path; keep one
            previous.remove();
        }
    }

    /// Called when a dependency reports a change.
    pub fn on_value_change(&self, event: &dyn ReactiveEvent) {
        let ignore = {
            let state = self.inner.state.lock();
            state.invalidated || state.stopped
        };
        if ignore {
            cov_mark::hit!(change_on_invalidated_computation_ignored);
            return;
        }
        tracing::trace!(source = %event.source(), "dependency changed, invalidating");
        self.invalidate();
    }

    /// Stop the computation for good.
    ///
    /// Pending invalidate listeners fire one last time, then the body,
    /// dependencies and listeners are released. A body that calls `stop` on
    /// its own computation still finishes its current run.
    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
        }

        self.invalidate();

        let (dependencies, listeners) = {
            let mut state = self.inner.state.lock();
            (
                std::mem::take(&mut state.dependencies),
                std::mem::take(&mut state.invalidate_listeners),
            )
        };
        for (_, subscription) in dependencies {
            subscription.remove();
        }
        drop(listeners);

        let body = self.inner.body.lock().take();
        drop(body);
    }

    /// Register a one-shot listener for the next invalidation. Ignored once
    /// stopped.
    pub fn on_next_invalidate<F>(&self, listener: F)
    where
        F: FnOnce(&InvalidateEvent) + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        if state.stopped {
            tracing::trace!("invalidate listener on stopped computation ignored");
            return;
        }
        state.invalidate_listeners.push(Box::new(listener));
    }

    /// True if a recompute is pending.
    pub fn is_invalidated(&self) -> bool {
        self.inner.state.lock().invalidated
    }

    /// True once [`stop`](Self::stop) was called.
    pub fn is_stopped(&self) -> bool {
        self.inner.state.lock().stopped
    }

    /// Current lifecycle state.
    pub fn status(&self) -> ComputationStatus {
        let state = self.inner.state.lock();
        if state.stopped {
            ComputationStatus::Stopped
        } else if !state.invalidated {
            ComputationStatus::Valid
        } else if state.has_run {
            ComputationStatus::Invalidated
        } else {
            ComputationStatus::Fresh
        }
    }

    /// Number of sources this computation currently listens to.
    pub fn dependency_count(&self) -> usize {
        self.inner.state.lock().dependencies.len()
    }

    /// Sources this computation currently listens to, in registration order.
    pub fn dependencies(&self) -> Vec<SourceId> {
        self.inner.state.lock().dependencies.keys().copied().collect()
    }

    /// True if `source` is currently a dependency.
    pub fn depends_on(&self, source: SourceId) -> bool {
        self.inner.state.lock().dependencies.contains_key(&source)
    }

    /// The scheduler this computation queues its recomputes on.
    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }
}

impl PartialEq for Computation {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Computation {}

impl fmt::Debug for Computation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Computation")
            .field("invalidated", &state.invalidated)
            .field("stopped", &state.stopped)
            .field("dependencies", &state.dependencies.len())
            .finish()
    }
}
