//! Reactive sources and the event router they are built from.
//!
//! A reactive source is anything a computation can depend on. It has two
//! sides:
//!
//! - the read side, [`ReactiveEventRouter::register_read`], which records the
//!   source as a dependency of the scheduler's current computation;
//! - the write side, [`ReactiveEventRouter::fire_event`], which tells every
//!   listener (dependent computations included) that the source changed.
//!
//! Stateful types embed a router instead of implementing this by hand; see
//! [`ReactiveValue`](crate::ReactiveValue) for the smallest example and the
//! state tree features for a larger one.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::listener::{ListenerRegistry, Subscription};
use crate::scheduler::Scheduler;

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a reactive source.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SourceId(u64);

impl SourceId {
    /// Allocate a fresh id.
    pub fn next() -> Self {
        SourceId(NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value, for logging.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An event fired by a reactive source.
pub trait ReactiveEvent: Any + Send + Sync + 'static {
    /// The source that fired the event.
    fn source(&self) -> SourceId;
}

impl dyn ReactiveEvent {
    /// Downcast to a concrete event type.
    pub fn downcast_ref<T: ReactiveEvent>(&self) -> Option<&T> {
        let any: &dyn Any = self;
        any.downcast_ref()
    }
}

/// Type-erased change listener, as stored by computations.
pub type ChangeListener = Arc<dyn Fn(&dyn ReactiveEvent) + Send + Sync>;

/// Something a computation can depend on.
pub trait ReactiveSource: Send + Sync {
    /// Identity used to deduplicate dependencies.
    fn source_id(&self) -> SourceId;

    /// Register a listener for every change of this source.
    fn add_change_listener(&self, listener: ChangeListener) -> Subscription;
}

/// Event fired by [`ReactiveValue`](crate::ReactiveValue) on every write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ValueChangeEvent {
    /// The value that changed.
    pub source: SourceId,
}

impl ReactiveEvent for ValueChangeEvent {
    fn source(&self) -> SourceId {
        self.source
    }
}

type EventListener<E> = dyn Fn(&E) + Send + Sync;

/// Broadcast point for events of type `E`, wired into dependency tracking.
pub struct ReactiveEventRouter<E> {
    owner: SourceId,
    scheduler: Scheduler,
    listeners: ListenerRegistry<EventListener<E>>,
}

impl<E: ReactiveEvent> ReactiveEventRouter<E> {
    /// Create a router owning a fresh [`SourceId`].
    pub fn new(scheduler: &Scheduler) -> Self {
        Self::with_owner(scheduler, SourceId::next())
    }

    /// Create a router for an existing source id.
    pub fn with_owner(scheduler: &Scheduler, owner: SourceId) -> Self {
        Self {
            owner,
            scheduler: scheduler.clone(),
            listeners: ListenerRegistry::new(),
        }
    }

    /// The source every event fired through this router must declare.
    pub fn owner(&self) -> SourceId {
        self.owner
    }

    /// The scheduler this router reports reads and events to.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Register a listener.
    ///
    /// When called while a computation is running, the listener is also
    /// removed at that computation's next invalidation, so listeners set up
    /// inside a computation never outlive the run that created them.
    pub fn add_listener<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let subscription = self.listeners.add(Arc::new(listener));
        if let Some(computation) = self.scheduler.current_computation() {
            let scoped = subscription.clone();
            computation.on_next_invalidate(move |_| {
                scoped.remove();
            });
        }
        subscription
    }

    /// Deliver `event` to the current listeners, then to the scheduler's
    /// event collectors.
    pub fn fire_event(&self, event: &E) -> Result<()> {
        let event_source = event.source();
        if event_source != self.owner {
            tracing::warn!(%event_source, router_owner = %self.owner, "event fired through a foreign router");
            return Err(Error::ForeignEventSource {
                event_source,
                router_owner: self.owner,
            });
        }
        self.notify(event);
        Ok(())
    }

    /// `fire_event` for callers that build the event from [`owner`](Self::owner)
    /// themselves.
    pub(crate) fn notify(&self, event: &E) {
        self.listeners.dispatch(|listener| listener(event));
        self.scheduler.notify_event_collectors(event);
    }

    /// Record a read of the owning source by the current computation, if any.
    pub fn register_read(&self) {
        if let Some(computation) = self.scheduler.current_computation() {
            computation.add_dependency(self);
        }
    }

    /// Number of registered listeners, dependent computations included.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl<E: ReactiveEvent> ReactiveSource for ReactiveEventRouter<E> {
    fn source_id(&self) -> SourceId {
        self.owner
    }

    fn add_change_listener(&self, listener: ChangeListener) -> Subscription {
        // Not scoped to the current computation: the computation itself owns
        // this subscription
        self.listeners
            .add(Arc::new(move |event: &E| listener(event as &dyn ReactiveEvent)))
    }
}

impl<E: ReactiveEvent> fmt::Debug for ReactiveEventRouter<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactiveEventRouter")
            .field("owner", &self.owner)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
