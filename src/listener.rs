// Listener registry - the publish/subscribe leaf every reactive source builds on
//
// Listeners live in a slab so add and remove are O(1). Each slot carries a
// generation counter; a Subscription remembers the generation it was issued
// for, so removing through a stale handle can never take out a listener that
// reused the slot.
//
// Dispatch never iterates the slab itself. It clones the listener Arcs into a
// snapshot under the lock, releases the lock, then calls the snapshot. Listeners
// added or removed while a dispatch is running therefore do not affect it, and a
// listener may freely call back into the registry.

use parking_lot::Mutex;
use slab::Slab;
use std::fmt;
use std::sync::{Arc, Weak};

/// Key of a registered listener.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ListenerKey {
    index: u32,
    generation: u32,
}

struct Slot<L: ?Sized> {
    generation: u32,
    listener: Arc<L>,
}

struct RegistryState<L: ?Sized> {
    slots: Slab<Slot<L>>,
    next_generation: u32,
}

impl<L: ?Sized> RegistryState<L> {
    /// The removed listener is handed back so the caller can drop it after
    /// releasing the lock; it may own the last handle of a computation.
    fn remove(&mut self, key: ListenerKey) -> Option<Arc<L>> {
        let index = key.index as usize;
        match self.slots.get(index) {
            Some(slot) if slot.generation == key.generation => {
                Some(self.slots.remove(index).listener)
            }
            _ => None,
        }
    }
}

/// Type-erased removal, so a [`Subscription`] does not need to know the
/// listener type of the registry it came from.
trait Unsubscribe: Send + Sync {
    fn unsubscribe(&self, key: ListenerKey) -> bool;
}

impl<L: ?Sized + Send + Sync> Unsubscribe for Mutex<RegistryState<L>> {
    fn unsubscribe(&self, key: ListenerKey) -> bool {
        let removed = self.lock().remove(key);
        removed.is_some()
    }
}

/// Handle to a registered listener.
///
/// Dropping the handle does not unregister anything; call
/// [`remove`](Self::remove). Removal is idempotent and a no-op once the
/// registry itself is gone.
#[derive(Clone)]
pub struct Subscription {
    registry: Weak<dyn Unsubscribe>,
    key: ListenerKey,
}

impl Subscription {
    /// Unregister the listener. Returns false if it was already removed.
    pub fn remove(&self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.unsubscribe(self.key),
            None => false,
        }
    }

    /// Key of the listener inside its registry.
    pub fn key(&self) -> ListenerKey {
        self.key
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("live", &(self.registry.strong_count() > 0))
            .finish()
    }
}

/// A set of listeners of type `L` (usually a `dyn Fn(&Event)`).
pub struct ListenerRegistry<L: ?Sized> {
    state: Arc<Mutex<RegistryState<L>>>,
}

impl<L: ?Sized + Send + Sync + 'static> ListenerRegistry<L> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RegistryState {
                slots: Slab::new(),
                next_generation: 0,
            })),
        }
    }

    /// Register a listener.
    pub fn add(&self, listener: Arc<L>) -> Subscription {
        let key = {
            let mut state = self.state.lock();
            let generation = state.next_generation;
            state.next_generation = state.next_generation.wrapping_add(1);
            let index = state.slots.insert(Slot {
                generation,
                listener,
            });
            ListenerKey {
                index: index as u32,
                generation,
            }
        };
        let registry: Weak<dyn Unsubscribe> = Arc::downgrade(&self.state) as Weak<dyn Unsubscribe>;
        Subscription { registry, key }
    }

    /// Unregister by key. Returns false if the key is stale.
    pub fn remove(&self, key: ListenerKey) -> bool {
        let removed = self.state.lock().remove(key);
        removed.is_some()
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// True if no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every listener.
    pub fn clear(&self) {
        let slots = std::mem::take(&mut self.state.lock().slots);
        drop(slots);
    }

    /// Point-in-time copy of the registered listeners.
    pub fn snapshot(&self) -> Vec<Arc<L>> {
        let state = self.state.lock();
        state
            .slots
            .iter()
            .map(|(_, slot)| slot.listener.clone())
            .collect()
    }

    /// Call `f` for every listener registered when dispatch began.
    pub fn dispatch<F>(&self, mut f: F)
    where
        F: FnMut(&L),
    {
        for listener in self.snapshot() {
            f(&listener);
        }
    }
}

impl<L: ?Sized + Send + Sync + 'static> Default for ListenerRegistry<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: ?Sized> fmt::Debug for ListenerRegistry<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.state.lock().slots.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Callback = dyn Fn(usize) + Send + Sync;

    #[test]
    fn dispatch_reaches_every_listener() {
        let registry: ListenerRegistry<Callback> = ListenerRegistry::new();
        let total = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let total = total.clone();
            let _ = registry.add(Arc::new(move |n: usize| {
                total.fetch_add(n, Ordering::Relaxed);
            }));
        }

        registry.dispatch(|listener| listener(2));
        assert_eq!(total.load(Ordering::Relaxed), 6);
    }

    #[test]
    fn removed_listener_is_not_called() {
        let registry: ListenerRegistry<Callback> = ListenerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let subscription = registry.add(Arc::new(move |_: usize| {
            calls_clone.fetch_add(1, Ordering::Relaxed);
        }));

        assert!(subscription.remove());
        assert!(!subscription.remove());
        registry.dispatch(|listener| listener(0));
        assert_eq!(calls.load(Ordering::Relaxed), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn stale_handle_does_not_remove_reused_slot() {
        let registry: ListenerRegistry<Callback> = ListenerRegistry::new();
        let first = registry.add(Arc::new(|_: usize| {}));
        assert!(first.remove());

        // The slab hands the freed index to the next listener
        let second = registry.add(Arc::new(|_: usize| {}));
        assert_eq!(first.key().index, second.key().index);

        assert!(!first.remove());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn listeners_added_during_dispatch_wait_for_next_dispatch() {
        let registry: Arc<ListenerRegistry<Callback>> = Arc::new(ListenerRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let registry_clone = registry.clone();
        let calls_clone = calls.clone();
        let _ = registry.add(Arc::new(move |_: usize| {
            calls_clone.fetch_add(1, Ordering::Relaxed);
            let calls_inner = calls_clone.clone();
            let _ = registry_clone.add(Arc::new(move |_: usize| {
                calls_inner.fetch_add(100, Ordering::Relaxed);
            }));
        }));

        registry.dispatch(|listener| listener(0));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn listener_removed_during_dispatch_still_runs_this_round() {
        let registry: Arc<ListenerRegistry<Callback>> = Arc::new(ListenerRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let victim_calls = calls.clone();
        let victim = registry.add(Arc::new(move |_: usize| {
            victim_calls.fetch_add(1, Ordering::Relaxed);
        }));
        let _ = registry.add(Arc::new(move |_: usize| {
            victim.remove();
        }));

        registry.dispatch(|listener| listener(0));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        registry.dispatch(|listener| listener(0));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn subscription_outliving_registry_is_inert() {
        let registry: ListenerRegistry<Callback> = ListenerRegistry::new();
        let subscription = registry.add(Arc::new(|_: usize| {}));
        drop(registry);
        assert!(!subscription.remove());
    }
}
