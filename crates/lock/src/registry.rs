use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Notify;

use exclave_store::SubscriberControl;

/// Waiters currently parked on one lock key.
struct KeyWaiters {
    count: usize,
    notify: Arc<Notify>,
}

/// Registry of in-flight wait operations, keyed by lock key.
///
/// The subscriber control half lives behind the same guard as the waiter
/// map, so the first-waiter SUBSCRIBE and last-waiter UNSUBSCRIBE stay
/// ordered with the registrations that justify them; without that a late
/// unsubscribe could race a fresh subscribe and strand a waiter.
#[derive(Default)]
pub(crate) struct WaiterRegistry {
    waiters: HashMap<String, KeyWaiters>,
    pub(crate) control: Option<Box<dyn SubscriberControl>>,
}

impl WaiterRegistry {
    /// Register one waiter for `key`. Returns the key's shared wake handle
    /// and whether this is the first waiter (the caller then subscribes to
    /// the key's release channel).
    pub(crate) fn register(&mut self, key: &str) -> (Arc<Notify>, bool) {
        let first = !self.waiters.contains_key(key);
        let entry = self
            .waiters
            .entry(key.to_owned())
            .or_insert_with(|| KeyWaiters {
                count: 0,
                notify: Arc::new(Notify::new()),
            });
        entry.count += 1;
        (Arc::clone(&entry.notify), first)
    }

    /// Unregister one waiter for `key`. Returns `true` if it was the last
    /// (the caller then unsubscribes). Unregistering a key with no entry is
    /// a no-op; a drop-guard cleanup can race the normal path.
    pub(crate) fn unregister(&mut self, key: &str) -> bool {
        match self.waiters.get_mut(key) {
            Some(entry) => {
                entry.count -= 1;
                if entry.count == 0 {
                    self.waiters.remove(key);
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    /// Wake every waiter currently parked on `key`. Broadcast-to-all: the
    /// retry of the conditional set, not the wake, decides who wins.
    pub(crate) fn wake(&self, key: &str) {
        if let Some(entry) = self.waiters.get(key) {
            entry.notify.notify_waiters();
        }
    }

    /// Number of keys with at least one registered waiter.
    pub(crate) fn waiting_keys(&self) -> usize {
        self.waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_and_last_waiter_flags() {
        let mut registry = WaiterRegistry::default();

        let (_, first) = registry.register("k");
        assert!(first, "first registration should be flagged");
        let (_, first) = registry.register("k");
        assert!(!first, "second registration should not be flagged");
        assert_eq!(registry.waiting_keys(), 1);

        assert!(!registry.unregister("k"), "one waiter remains");
        assert!(registry.unregister("k"), "last waiter should be flagged");
        assert_eq!(registry.waiting_keys(), 0);
    }

    #[test]
    fn unregister_unknown_key_is_noop() {
        let mut registry = WaiterRegistry::default();
        assert!(!registry.unregister("missing"));
    }

    #[test]
    fn waiters_share_one_notify_per_key() {
        let mut registry = WaiterRegistry::default();
        let (a, _) = registry.register("k");
        let (b, _) = registry.register("k");
        assert!(Arc::ptr_eq(&a, &b));

        let (c, _) = registry.register("other");
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn wake_on_empty_registry_is_noop() {
        let registry = WaiterRegistry::default();
        registry.wake("nobody");
    }
}
