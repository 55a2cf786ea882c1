//! Callback registries shared by terminals and watches.

use std::fmt;
use std::sync::Arc;

/// Identifies a registered listener so it can be removed later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

pub(crate) type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Ordered set of callbacks. Every listener sees every event.
pub(crate) struct ListenerRegistry<E> {
    next_id: u64,
    entries: Vec<(ListenerId, Listener<E>)>,
}

impl<E> Default for ListenerRegistry<E> {
    fn default() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
        }
    }
}

impl<E> ListenerRegistry<E> {
    pub(crate) fn add(&mut self, listener: Listener<E>) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.entries.push((id, listener));
        id
    }

    pub(crate) fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry, _)| *entry != id);
        self.entries.len() != before
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Listeners registered right now, in registration order.
    ///
    /// Dispatch iterates the snapshot so no lock is held while callbacks run.
    pub(crate) fn snapshot(&self) -> Vec<Listener<E>> {
        self.entries.iter().map(|(_, listener)| Arc::clone(listener)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_ids_are_unique_and_removal_is_targeted() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ListenerRegistry::<u32>::default();

        let first = {
            let seen = Arc::clone(&seen);
            registry.add(Arc::new(move |n: &u32| seen.lock().unwrap().push(("first", *n))))
        };
        let second = {
            let seen = Arc::clone(&seen);
            registry.add(Arc::new(move |n: &u32| seen.lock().unwrap().push(("second", *n))))
        };
        assert_ne!(first, second);

        assert!(registry.remove(first));
        assert!(!registry.remove(first));
        for listener in registry.snapshot() {
            listener(&7);
        }
        assert_eq!(*seen.lock().unwrap(), vec![("second", 7)]);
    }

    #[test]
    fn test_clear() {
        let mut registry = ListenerRegistry::<()>::default();
        registry.add(Arc::new(|_: &()| {}));
        registry.add(Arc::new(|_: &()| {}));
        assert_eq!(registry.len(), 2);
        registry.clear();
        assert!(registry.snapshot().is_empty());
    }
}
