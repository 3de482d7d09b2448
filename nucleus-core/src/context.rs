//! Atom Registry
//!
//! A `Context` owns the live set of atom instances for one graph lifetime.
//! It resolves references into instances lazily, memoizing them by key, and
//! detects circular construction with an in-progress slot marker: a key that
//! is looked up again while its own construction is still on the call stack
//! fails immediately with [`AtomError::CircularReference`].
//!
//! The context also carries the graph's ambient machinery:
//!
//! - the hydration map (`key -> Value`) consulted on first load and replaced
//!   wholesale by [`Context::update`],
//! - the deferred-task queue that decouples effect execution from the state
//!   write that triggered it (a bridge attaches a processor and drains the
//!   queue at its commit point),
//! - the optional observer hook mirroring updates out of process.
//!
//! Contexts are cheap handles over shared state; clone freely. Teardown is
//! one-shot: [`Context::cleanup`] releases every instantiated atom and
//! empties the registry.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::atom::{AnyAtom, AtomRef, AtomValue, RefInner};
use crate::error::AtomError;
use crate::observer::{AtomEvent, ObserverFn};
use crate::state::{AtomInner, StateAtom};

type Task = Box<dyn FnOnce() + Send>;
type ProcessorFn = Arc<dyn Fn() + Send + Sync>;

/// One entry in the registry map.
///
/// `Pending` marks a construction in progress on the current call stack and
/// exists only transiently; once construction completes the slot is `Ready`.
enum Slot {
    Pending,
    Ready(Arc<dyn AnyAtom>),
}

pub(crate) struct ContextInner {
    atoms: Mutex<IndexMap<String, Slot>>,
    state: RwLock<HashMap<String, Value>>,
    queue: Mutex<Vec<Task>>,
    processor: RwLock<Option<ProcessorFn>>,
    observer: RwLock<Option<ObserverFn>>,
}

/// The per-lifetime owner of all atom instances and the task queue.
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Clone for Context {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Non-owning context handle, held by atoms and queued tasks so the registry
/// is not kept alive by its own contents.
#[derive(Clone)]
pub(crate) struct WeakContext(Weak<ContextInner>);

impl WeakContext {
    pub(crate) fn upgrade(&self) -> Option<Context> {
        self.0.upgrade().map(|inner| Context { inner })
    }
}

impl Context {
    /// Create an empty registry with no hydrated state.
    pub fn new() -> Self {
        Self::with_state(HashMap::new())
    }

    /// Create a registry seeded with a hydration map.
    ///
    /// Atoms whose key appears in the map take that value instead of their
    /// own default when first loaded; all other atoms fall back to their
    /// defaults.
    pub fn with_state(state: HashMap<String, Value>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                atoms: Mutex::new(IndexMap::new()),
                state: RwLock::new(state),
                queue: Mutex::new(Vec::new()),
                processor: RwLock::new(None),
                observer: RwLock::new(None),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakContext {
        WeakContext(Arc::downgrade(&self.inner))
    }

    /// Resolve a reference into its live instance, constructing it on first
    /// access.
    ///
    /// Construction is re-entrant: a construction function may load other
    /// references (or transitively re-enter this registry), so arbitrary
    /// dependency graphs resolve depth-first. A key re-entered while its own
    /// construction is in progress fails with
    /// [`AtomError::CircularReference`].
    pub fn load<T: AtomValue>(&self, atom_ref: &AtomRef<T>) -> Result<StateAtom<T>, AtomError> {
        let erased = self.load_erased(&atom_ref.inner)?;
        erased
            .as_any()
            .downcast::<AtomInner<T>>()
            .map(StateAtom::from_inner)
            .map_err(|_| AtomError::TypeMismatch {
                key: atom_ref.key().to_owned(),
            })
    }

    pub(crate) fn load_erased(
        &self,
        atom_ref: &Arc<RefInner>,
    ) -> Result<Arc<dyn AnyAtom>, AtomError> {
        {
            let mut atoms = self.inner.atoms.lock();
            match atoms.get(atom_ref.key.as_str()) {
                Some(Slot::Ready(atom)) => return Ok(Arc::clone(atom)),
                Some(Slot::Pending) => {
                    return Err(AtomError::CircularReference {
                        key: atom_ref.key.clone(),
                    })
                }
                None => {
                    atoms.insert(atom_ref.key.clone(), Slot::Pending);
                }
            }
        }

        // The lock is released while the construction function runs so it
        // can load other atoms through this same registry.
        let hydrated = self.inner.state.read().get(&atom_ref.key).cloned();
        match (atom_ref.construct)(self, hydrated) {
            Ok(atom) => {
                self.inner
                    .atoms
                    .lock()
                    .insert(atom_ref.key.clone(), Slot::Ready(Arc::clone(&atom)));
                Ok(atom)
            }
            Err(error) => {
                // Drop the in-progress marker so a later load of this key is
                // not misreported as a cycle.
                self.inner.atoms.lock().shift_remove(&atom_ref.key);
                Err(error)
            }
        }
    }

    /// Look up an already-constructed instance without building anything.
    pub(crate) fn loaded(&self, key: &str) -> Option<Arc<dyn AnyAtom>> {
        match self.inner.atoms.lock().get(key) {
            Some(Slot::Ready(atom)) => Some(Arc::clone(atom)),
            _ => None,
        }
    }

    /// Whether an instance for this key has been constructed.
    pub fn contains(&self, key: &str) -> bool {
        matches!(self.inner.atoms.lock().get(key), Some(Slot::Ready(_)))
    }

    /// Replace the hydration map and push the new values into every
    /// already-instantiated atom whose key appears in it.
    ///
    /// Atoms not yet loaded are unaffected; they pick up the new value on
    /// their first load. A value that fails to deserialize for its atom is
    /// skipped with a warning; rehydration is bulk and one bad key does not
    /// abort the rest.
    pub fn update(&self, state: HashMap<String, Value>) {
        let entries: Vec<(String, Value)> = state
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        *self.inner.state.write() = state;

        for (key, value) in entries {
            if let Some(atom) = self.loaded(&key) {
                if let Err(error) = atom.hydrate(&value) {
                    tracing::warn!(key = %key, %error, "skipping rehydration of atom");
                }
            }
        }
    }

    /// Append a task to the deferred queue.
    ///
    /// If a processor has been attached it is invoked synchronously after
    /// the push, letting the bridge schedule a drain at its own commit
    /// point.
    pub fn enqueue(&self, task: impl FnOnce() + Send + 'static) {
        self.inner.queue.lock().push(Box::new(task));
        let processor = self.inner.processor.read().clone();
        if let Some(processor) = processor {
            processor();
        }
    }

    /// Attach the queue processor called after every enqueue.
    pub fn set_queue_processor(&self, processor: impl Fn() + Send + Sync + 'static) {
        *self.inner.processor.write() = Some(Arc::new(processor));
    }

    /// Number of tasks currently awaiting a flush.
    pub fn queue_len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Drain the queue and run every task in first-in-first-out order.
    ///
    /// Tasks enqueued by running tasks are drained in the same call, so one
    /// flush settles the whole cycle. The queue is left empty.
    pub fn flush(&self) {
        loop {
            let tasks: Vec<Task> = std::mem::take(&mut *self.inner.queue.lock());
            if tasks.is_empty() {
                break;
            }
            for task in tasks {
                task();
            }
        }
    }

    /// Install the observer hook receiving `(key, event, snapshot)` on every
    /// observable atom update.
    pub fn set_observer(&self, observer: impl Fn(&str, AtomEvent, Value) + Send + Sync + 'static) {
        *self.inner.observer.write() = Some(Arc::new(observer));
    }

    pub(crate) fn has_observer(&self) -> bool {
        self.inner.observer.read().is_some()
    }

    pub(crate) fn notify_observer(&self, key: &str, event: AtomEvent, snapshot: Value) {
        let observer = self.inner.observer.read().clone();
        if let Some(observer) = observer {
            observer(key, event, snapshot);
        }
    }

    /// Tear down the registry: run cleanup on every instantiated atom in
    /// insertion order and empty the map.
    pub fn cleanup(&self) {
        let slots: IndexMap<String, Slot> = std::mem::take(&mut *self.inner.atoms.lock());
        for (_, slot) in slots {
            if let Slot::Ready(atom) = slot {
                atom.cleanup();
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Global fallback registry
// ----------------------------------------------------------------------------

static GLOBAL: OnceLock<RwLock<Context>> = OnceLock::new();

fn global_cell() -> &'static RwLock<Context> {
    GLOBAL.get_or_init(|| RwLock::new(Context::new()))
}

/// The process-wide fallback registry.
///
/// Starts as an empty context with no atoms, so code that runs before a real
/// registry is supplied still has somewhere to resolve against. Replace it
/// with [`set_global`] once the owning scope exists.
pub fn global() -> Context {
    global_cell().read().clone()
}

/// Replace the process-wide fallback registry.
pub fn set_global(context: Context) {
    *global_cell().write() = context;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateAtomBuilder;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[test]
    fn construction_is_lazy() {
        let constructed = Arc::new(AtomicBool::new(false));
        let constructed_clone = Arc::clone(&constructed);

        let atom = StateAtomBuilder::with_default_fn("lazy", move |_| {
            constructed_clone.store(true, Ordering::SeqCst);
            Ok(0)
        })
        .build();

        let context = Context::new();
        assert!(!constructed.load(Ordering::SeqCst));

        context.load(&atom).unwrap();
        assert!(constructed.load(Ordering::SeqCst));
    }

    #[test]
    fn load_memoizes_instances() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = Arc::clone(&runs);

        let atom = StateAtomBuilder::with_default_fn("memo", move |_| {
            runs_clone.fetch_add(1, Ordering::SeqCst);
            Ok(0)
        })
        .build();

        let context = Context::new();
        let first = context.load(&atom).unwrap();
        first.set_state(42);

        // The second load returns the same instance, not a rebuilt one.
        let second = context.load(&atom).unwrap();
        assert_eq!(second.state(), 42);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn default_factory_can_read_sibling_atoms() {
        let base = StateAtomBuilder::new("base", 20).build();
        let base_clone = base.clone();
        let doubled =
            StateAtomBuilder::with_default_fn("doubled", move |api| Ok(api.get(&base_clone)? * 2))
                .build();

        let context = Context::new();
        assert_eq!(context.load(&doubled).unwrap().state(), 40);
    }

    #[test]
    fn self_referential_default_is_a_cycle() {
        // The atom reads itself while its own construction is in progress.
        let cyclic: AtomRef<i32> = {
            let slot: Arc<RwLock<Option<AtomRef<i32>>>> = Arc::new(RwLock::new(None));
            let slot_clone = Arc::clone(&slot);
            let atom = StateAtomBuilder::with_default_fn("ouroboros", move |api| {
                let me = slot_clone.read().clone().expect("ref installed");
                api.get(&me)
            })
            .build();
            *slot.write() = Some(atom.clone());
            atom
        };

        let context = Context::new();
        let error = context.load(&cyclic).unwrap_err();
        assert!(
            matches!(&error, AtomError::CircularReference { key } if key == "ouroboros"),
            "unexpected error: {error}"
        );
    }

    #[test]
    fn failed_construction_does_not_poison_the_key() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = Arc::clone(&attempts);

        let flaky = StateAtomBuilder::with_default_fn("flaky", move |_| {
            if attempts_clone.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(AtomError::TypeMismatch {
                    key: "flaky".to_owned(),
                })
            } else {
                Ok(1)
            }
        })
        .build();

        let context = Context::new();
        assert!(context.load(&flaky).is_err());
        // A retry constructs instead of reporting a phantom cycle.
        assert_eq!(context.load(&flaky).unwrap().state(), 1);
    }

    #[test]
    fn mismatched_state_type_is_reported() {
        let as_int = StateAtomBuilder::new("shape", 1).build();
        let as_string: AtomRef<String> =
            StateAtomBuilder::new("shape", String::new()).build();

        let context = Context::new();
        context.load(&as_int).unwrap();

        let error = context.load(&as_string).unwrap_err();
        assert!(matches!(&error, AtomError::TypeMismatch { key } if key == "shape"));
    }

    #[test]
    fn hydrated_state_overrides_the_default() {
        let ran_default = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran_default);

        let name = StateAtomBuilder::with_default_fn("name", move |_| {
            ran_clone.store(true, Ordering::SeqCst);
            Ok(String::new())
        })
        .build();

        let mut state = HashMap::new();
        state.insert("name".to_owned(), json!("Ken"));
        let context = Context::with_state(state);

        assert_eq!(context.load(&name).unwrap().state(), "Ken");
        assert!(!ran_default.load(Ordering::SeqCst));
    }

    #[test]
    fn update_pushes_into_loaded_atoms_only() {
        let loaded = StateAtomBuilder::new("loaded", 0).build();
        let untouched = StateAtomBuilder::new("untouched", 0).build();

        let context = Context::new();
        let instance = context.load(&loaded).unwrap();

        let mut state = HashMap::new();
        state.insert("loaded".to_owned(), json!(5));
        state.insert("untouched".to_owned(), json!(9));
        context.update(state);

        assert_eq!(instance.state(), 5);
        // Unloaded atoms are not constructed by update; they pick up the
        // new value on first load.
        assert!(!context.contains("untouched"));
        assert_eq!(context.load(&untouched).unwrap().state(), 9);
    }

    #[test]
    fn queue_runs_tasks_in_order() {
        let context = Context::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in 0..3 {
            let order = Arc::clone(&order);
            context.enqueue(move || order.lock().push(tag));
        }
        assert_eq!(context.queue_len(), 3);

        context.flush();
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert_eq!(context.queue_len(), 0);
    }

    #[test]
    fn flush_settles_tasks_enqueued_by_tasks() {
        let context = Context::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let context_clone = context.clone();
        let ran_clone = Arc::clone(&ran);
        context.enqueue(move || {
            let ran = Arc::clone(&ran_clone);
            ran_clone.fetch_add(1, Ordering::SeqCst);
            context_clone.enqueue(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        });

        context.flush();
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn processor_is_invoked_after_each_enqueue() {
        let context = Context::new();
        let pings = Arc::new(AtomicUsize::new(0));

        let pings_clone = Arc::clone(&pings);
        context.set_queue_processor(move || {
            pings_clone.fetch_add(1, Ordering::SeqCst);
        });

        context.enqueue(|| {});
        context.enqueue(|| {});
        assert_eq!(pings.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cleanup_empties_the_registry() {
        let atom = StateAtomBuilder::new("gone", 0).build();
        let context = Context::new();
        context.load(&atom).unwrap();
        assert!(context.contains("gone"));

        context.cleanup();
        assert!(!context.contains("gone"));
    }

    #[test]
    fn global_registry_can_be_replaced() {
        let atom = StateAtomBuilder::new("global-probe", 0).build();

        let fresh = Context::new();
        fresh.load(&atom).unwrap();
        set_global(fresh);

        assert!(global().contains("global-probe"));
        set_global(Context::new());
        assert!(!global().contains("global-probe"));
    }
}
