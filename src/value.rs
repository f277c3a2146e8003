use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

use crate::listener::Subscription;
use crate::router::{ReactiveEventRouter, SourceId, ValueChangeEvent};
use crate::scheduler::Scheduler;

/// A single reactive value.
///
/// Reading with [`get`](Self::get) or [`with`](Self::with) inside a
/// computation makes the computation depend on the value; [`set`](Self::set)
/// invalidates every dependent computation. Clones share the same value.
///
/// # Usage
/// ```ignore
/// let scheduler = Scheduler::new();
/// let name = ReactiveValue::new(&scheduler, String::from("world"));
///
/// let n = name.clone();
/// scheduler.run_when_dependencies_change(move || {
///     println!("hello {}", n.get());
///     Ok(())
/// });
///
/// scheduler.flush()?;         // hello world
/// name.set("there".into());
/// scheduler.flush()?;         // hello there
/// ```
pub struct ReactiveValue<T> {
    inner: Arc<ValueInner<T>>,
}

struct ValueInner<T> {
    value: Mutex<T>,
    router: ReactiveEventRouter<ValueChangeEvent>,
}

impl<T: Send + 'static> ReactiveValue<T> {
    /// Create a value bound to `scheduler`.
    pub fn new(scheduler: &Scheduler, value: T) -> Self {
        Self {
            inner: Arc::new(ValueInner {
                value: Mutex::new(value),
                router: ReactiveEventRouter::new(scheduler),
            }),
        }
    }

    /// Read the value, tracking the read.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.with(T::clone)
    }

    /// Read the value without tracking.
    pub fn get_untracked(&self) -> T
    where
        T: Clone,
    {
        self.inner.value.lock().clone()
    }

    /// Borrow the value, tracking the read.
    ///
    /// The value stays locked while `f` runs, so `f` must not write to this
    /// same value.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.inner.router.register_read();
        f(&self.inner.value.lock())
    }

    /// Replace the value and notify dependents.
    pub fn set(&self, value: T) {
        *self.inner.value.lock() = value;
        self.notify();
    }

    /// Modify the value in place and notify dependents.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        f(&mut self.inner.value.lock());
        self.notify();
    }

    fn notify(&self) {
        let source = self.inner.router.owner();
        if let Some(computation) = self.inner.router.scheduler().current_computation() {
            if computation.depends_on(source) {
                // The running computation is still marked invalidated, so it
                // does not see this write
                tracing::warn!(%source, "computation both reads and writes the same value");
            }
        }
        self.inner.router.notify(&ValueChangeEvent { source });
    }

    /// Register a listener for changes of this value.
    pub fn add_listener<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ValueChangeEvent) + Send + Sync + 'static,
    {
        self.inner.router.add_listener(listener)
    }

    /// Identity of this value as a reactive source.
    pub fn source_id(&self) -> SourceId {
        self.inner.router.owner()
    }

    /// Number of listeners, dependent computations included.
    pub fn listener_count(&self) -> usize {
        self.inner.router.listener_count()
    }

    /// The router backing this value.
    pub fn router(&self) -> &ReactiveEventRouter<ValueChangeEvent> {
        &self.inner.router
    }
}

impl<T> Clone for ReactiveValue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ReactiveValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactiveValue")
            .field("source", &self.inner.router.owner())
            .field("value", &*self.inner.value.lock())
            .finish()
    }
}
