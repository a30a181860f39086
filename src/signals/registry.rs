//! Listener sets with explicit unsubscribe tokens
//!
//! Dispatch clones the listener list under a read lock and invokes the
//! listeners after releasing it. A listener removed while a dispatch is in
//! flight may still see that one event, but never a later one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct ListenerSet<T> {
    listeners: RwLock<Vec<(u64, Listener<T>)>>,
}

trait Removable: Send + Sync {
    fn remove(&self, id: u64) -> bool;
}

impl<T: 'static> Removable for ListenerSet<T> {
    fn remove(&self, id: u64) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }
}

/// Disposer returned by `add`
///
/// Dropping the token does not remove the listener; call
/// [`Subscription::unsubscribe`]. Tokens outliving their registry are inert.
pub struct Subscription {
    id: u64,
    registry: Weak<dyn Removable>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the listener. Returns false if it was already gone.
    pub fn unsubscribe(self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.remove(self.id),
            None => false,
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

pub struct SubscriberRegistry<T> {
    next_id: AtomicU64,
    inner: Arc<ListenerSet<T>>,
}

impl<T: 'static> SubscriberRegistry<T> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            inner: Arc::new(ListenerSet {
                listeners: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn add<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.write().push((id, Arc::new(listener)));

        let registry: Arc<dyn Removable> = self.inner.clone();
        Subscription {
            id,
            registry: Arc::downgrade(&registry),
        }
    }

    /// Deliver `event` to every listener; returns how many were called
    pub fn dispatch(&self, event: &T) -> usize {
        let snapshot: Vec<Listener<T>> = {
            let listeners = self.inner.listeners.read().unwrap_or_else(|poisoned| poisoned.into_inner());
            listeners.iter().map(|(_, l)| l.clone()).collect()
        };

        for listener in &snapshot {
            listener(event);
        }
        snapshot.len()
    }

    pub fn len(&self) -> usize {
        self.inner
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<(u64, Listener<T>)>> {
        self.inner.listeners.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T: 'static> Default for SubscriberRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_add_dispatch_unsubscribe() {
        let registry: SubscriberRegistry<u32> = SubscriberRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let sub = registry.add(move |v| sink.lock().unwrap().push(*v));
        assert_eq!(registry.dispatch(&1), 1);

        assert!(sub.unsubscribe());
        assert_eq!(registry.dispatch(&2), 0);
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_removal_during_dispatch_is_harmless() {
        let registry: Arc<SubscriberRegistry<u32>> = Arc::new(SubscriberRegistry::new());
        let victim: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let calls = Arc::new(AtomicU64::new(0));

        let slot = victim.clone();
        registry.add(move |_| {
            if let Some(sub) = slot.lock().unwrap().take() {
                sub.unsubscribe();
            }
        });
        let counter = calls.clone();
        *victim.lock().unwrap() = Some(registry.add(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        // The second listener is removed by the first mid-dispatch
        registry.dispatch(&1);
        registry.dispatch(&2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_poisoned_lock_keeps_reporting_listeners() {
        let registry: SubscriberRegistry<u32> = SubscriberRegistry::new();
        let _a = registry.add(|_| {});
        let _b = registry.add(|_| {});

        let poisoned = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = registry.write();
            panic!("listener set poisoned");
        }));
        assert!(poisoned.is_err());
        assert!(registry.inner.listeners.is_poisoned());

        assert_eq!(registry.len(), 2);
        assert!(!registry.is_empty());
        assert_eq!(registry.dispatch(&7), 2);
    }

    #[test]
    fn test_token_outliving_registry() {
        let registry: SubscriberRegistry<u32> = SubscriberRegistry::new();
        let sub = registry.add(|_| {});
        drop(registry);
        assert!(!sub.unsubscribe());
    }
}
