//! Listener registration for atoms.
//!
//! Every atom owns a listener set: value-change callbacks invoked
//! synchronously, in registration order, on every observable update.
//! Subscribers (a UI binding, a devtools relay) add a callback and must pair
//! it with a matching remove to avoid leaking listeners past their lifetime.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use smallvec::SmallVec;

/// Unique identifier for a registered listener.
///
/// Returned by `StateAtom::add` and consumed by `StateAtom::remove`.
/// Uses an atomic counter to ensure uniqueness across threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

pub(crate) type ListenerFn<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A registration-ordered collection of listeners.
///
/// Most atoms carry at most a couple of listeners, so entries live inline.
pub(crate) struct ListenerSet<T> {
    entries: RwLock<SmallVec<[(ListenerId, ListenerFn<T>); 2]>>,
}

impl<T> ListenerSet<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: RwLock::new(SmallVec::new()),
        }
    }

    pub(crate) fn add(&self, listener: ListenerFn<T>) -> ListenerId {
        let id = ListenerId::next();
        self.entries.write().push((id, listener));
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) {
        self.entries.write().retain(|(entry, _)| *entry != id);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Clone the listeners out so no lock is held while they are invoked.
    /// Listeners may add or remove other listeners from within a callback.
    pub(crate) fn snapshot(&self) -> SmallVec<[ListenerFn<T>; 2]> {
        self.entries
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }
}
