//! State Atom
//!
//! The mutable leaf unit of the graph: a keyed cell holding a current value,
//! a listener set, and an equality-gated state writer. An atom is built from
//! a [`StateAtomBuilder`] into an [`AtomRef`], and instantiated lazily the
//! first time a [`Context`](crate::Context) resolves that reference.
//!
//! # Lifecycle
//!
//! An instance starts uninitialized; the very first state write during
//! construction is what populates it (hydrated value winning over the
//! default), so any startup effect observes a proper transition into the
//! initial value instead of reading nothing. From then on every write is
//! gated on equality: a write that does not change the value notifies
//! nobody. Teardown is terminal: a cleaned-up atom ignores further writes.
//!
//! # Reactive setup
//!
//! An optional `setup` routine runs once at construction with the atom
//! handle and a [`SetupApi`] exposing cross-atom reads and writes plus two
//! subscription primitives:
//!
//! - [`SetupApi::watch`] is invoked synchronously, inline with the update
//!   that triggered it;
//! - [`SetupApi::effect`] is deferred onto the context's task queue, running
//!   at the bridge's commit point, decoupled from propagation.
//!
//! Both chain cleanups: whatever a callback invocation returns runs before
//! the next invocation and again on teardown.

use std::any::Any;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::atom::{AnyAtom, AtomDep, AtomRef, AtomValue, ErasedListener};
use crate::context::{Context, WeakContext};
use crate::dequal::deep_equal;
use crate::error::AtomError;
use crate::listener::{ListenerId, ListenerSet};
use crate::observer::AtomEvent;

/// A teardown routine returned by effects, watches, and setup functions.
pub type Cleanup = Box<dyn FnOnce() + Send>;

/// How a state write decides it is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Equality {
    /// `PartialEq` on the state type.
    Strict,
    /// Structural comparison of the serialized values; two states with the
    /// same shape and content are the same even when `PartialEq` disagrees.
    Deep,
}

pub(crate) type EffectFn<T> =
    Arc<dyn Fn(&T, &StateAtom<T>) -> Option<Cleanup> + Send + Sync>;
type SetupFn<T> =
    Arc<dyn Fn(&StateAtom<T>, &SetupApi) -> Result<Option<Cleanup>, AtomError> + Send + Sync>;
type DefaultFn<T> = Arc<dyn Fn(&AtomApi) -> Result<T, AtomError> + Send + Sync>;
pub(crate) type WriteFn<T> = Arc<dyn Fn(T, &AtomApi) -> Result<(), AtomError> + Send + Sync>;

// ----------------------------------------------------------------------------
// Instance
// ----------------------------------------------------------------------------

/// The live state cell behind an atom handle.
pub(crate) struct AtomInner<T: AtomValue> {
    key: String,
    ctx: WeakContext,
    equality: Equality,
    weak_self: Weak<AtomInner<T>>,

    /// `None` strictly before the first state write.
    value: RwLock<Option<T>>,
    listeners: ListenerSet<T>,

    /// Teardown routines registered by setup, watch, and effect wiring.
    cleanups: Mutex<Vec<Cleanup>>,

    /// The per-atom deferred effect and the cleanup its last run returned.
    effect: Option<EffectFn<T>>,
    effect_cleanup: Mutex<Option<Cleanup>>,

    /// Interception for external writes; installed by derived atoms that
    /// redirect writes upstream instead of storing a value.
    write_override: Mutex<Option<WriteFn<T>>>,

    created: AtomicBool,
    torn_down: AtomicBool,
}

impl<T: AtomValue> AtomInner<T> {
    pub(crate) fn new(
        key: String,
        ctx: WeakContext,
        equality: Equality,
        effect: Option<EffectFn<T>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            key,
            ctx,
            equality,
            weak_self: weak_self.clone(),
            value: RwLock::new(None),
            listeners: ListenerSet::new(),
            cleanups: Mutex::new(Vec::new()),
            effect,
            effect_cleanup: Mutex::new(None),
            write_override: Mutex::new(None),
            created: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
        })
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    fn state(&self) -> T {
        self.value
            .read()
            .clone()
            .expect("atom state read before initialization")
    }

    fn handle(&self) -> StateAtom<T> {
        StateAtom {
            inner: self.weak_self.upgrade().expect("atom instance alive"),
        }
    }

    /// External write path. Honors the write override when one is installed.
    fn set_state(&self, next: T) {
        let write = self.write_override.lock().clone();
        if let Some(write) = write {
            let Some(ctx) = self.ctx.upgrade() else { return };
            if let Err(error) = write(next, &AtomApi::new(ctx)) {
                tracing::error!(key = %self.key, %error, "state write rejected");
            }
            return;
        }
        self.apply(next);
    }

    fn set_state_with(&self, update: impl FnOnce(&T) -> T) {
        let prev = match self.value.read().clone() {
            Some(prev) => prev,
            None => {
                tracing::warn!(key = %self.key, "functional update on an uninitialized atom ignored");
                return;
            }
        };
        self.set_state(update(&prev));
    }

    /// Internal write path: equality gate, store, notify, observe, defer the
    /// per-atom effect. Derived recomputation lands here directly so a write
    /// override never sees its own forwarded values.
    pub(crate) fn apply(&self, next: T) {
        if self.torn_down.load(Ordering::SeqCst) {
            return;
        }

        let changed = match self.value.read().as_ref() {
            None => true, // the transition into the initial value
            Some(prev) => !self.values_equal(prev, &next),
        };
        if !changed {
            return;
        }

        #[cfg(debug_assertions)]
        self.verify_round_trip(&next);

        *self.value.write() = Some(next.clone());

        let event = if self.created.swap(true, Ordering::SeqCst) {
            AtomEvent::Updated
        } else {
            AtomEvent::Created
        };

        let ctx = self.ctx.upgrade();

        // The observer hears about this update before listeners cascade it
        // into further ones, keeping the mirrored stream causally ordered.
        if let Some(ctx) = &ctx {
            if ctx.has_observer() {
                if let Some(snapshot) = crate::observer::snapshot(&self.key, &next) {
                    ctx.notify_observer(&self.key, event, snapshot);
                }
            }
        }

        // Synchronous notification, registration order, no lock held.
        for listener in self.listeners.snapshot() {
            listener(&next);
        }

        if self.effect.is_some() {
            if let Some(ctx) = &ctx {
                let weak = self.weak_self.clone();
                ctx.enqueue(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.run_deferred_effect(next);
                    }
                });
            }
        }
    }

    fn values_equal(&self, a: &T, b: &T) -> bool {
        match self.equality {
            Equality::Strict => a == b,
            Equality::Deep => match (serde_json::to_value(a), serde_json::to_value(b)) {
                (Ok(x), Ok(y)) => deep_equal(&x, &y),
                _ => {
                    tracing::warn!(
                        key = %self.key,
                        "deep equality check could not serialize state; treating as changed"
                    );
                    false
                }
            },
        }
    }

    /// Development-time guard: state that loses information through its
    /// serialized form would silently corrupt hydration and observer
    /// snapshots later.
    #[cfg(debug_assertions)]
    fn verify_round_trip(&self, value: &T) {
        if let Ok(snapshot) = serde_json::to_value(value) {
            match serde_json::from_value::<T>(snapshot) {
                Ok(back) if &back == value => {}
                _ => tracing::warn!(
                    key = %self.key,
                    "atom state does not survive a serialization round trip"
                ),
            }
        }
    }

    fn run_deferred_effect(&self, value: T) {
        if self.torn_down.load(Ordering::SeqCst) {
            return;
        }
        let Some(effect) = self.effect.clone() else { return };
        if let Some(cleanup) = self.effect_cleanup.lock().take() {
            cleanup();
        }
        let next_cleanup = effect(&value, &self.handle());
        *self.effect_cleanup.lock() = next_cleanup;
    }

    pub(crate) fn set_write_override(&self, write: WriteFn<T>) {
        *self.write_override.lock() = Some(write);
    }
}

impl<T: AtomValue> AnyAtom for AtomInner<T> {
    fn key(&self) -> &str {
        &self.key
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn add_listener_erased(&self, listener: ErasedListener) -> ListenerId {
        self.listeners.add(Arc::new(move |_: &T| listener()))
    }

    fn remove_listener_erased(&self, id: ListenerId) {
        self.listeners.remove(id);
    }

    fn hydrate(&self, value: &Value) -> Result<(), AtomError> {
        let next: T = serde_json::from_value(value.clone()).map_err(|source| {
            AtomError::Hydration {
                key: self.key.clone(),
                source,
            }
        })?;
        // Stores through the internal path: rehydration seeds the value
        // even on atoms whose external writes are redirected or rejected.
        self.apply(next);
        Ok(())
    }

    fn push_cleanup(&self, cleanup: Cleanup) {
        self.cleanups.lock().push(cleanup);
    }

    fn cleanup(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(cleanup) = self.effect_cleanup.lock().take() {
            cleanup();
        }
        let cleanups: Vec<Cleanup> = std::mem::take(&mut *self.cleanups.lock());
        for cleanup in cleanups {
            cleanup();
        }
    }
}

/// Handle to a live atom instance.
///
/// Cheap to clone; every clone shares the same cell. Obtained from
/// [`Context::load`](crate::Context::load).
pub struct StateAtom<T: AtomValue> {
    inner: Arc<AtomInner<T>>,
}

impl<T: AtomValue> Clone for StateAtom<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: AtomValue> StateAtom<T> {
    pub(crate) fn from_inner(inner: Arc<AtomInner<T>>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<AtomInner<T>> {
        &self.inner
    }

    /// The atom's unique key.
    pub fn key(&self) -> &str {
        self.inner.key()
    }

    /// The current value.
    pub fn state(&self) -> T {
        self.inner.state()
    }

    /// Write a new value.
    ///
    /// No-op when the value is equal to the current one under the atom's
    /// equality mode; otherwise stores it and notifies every listener
    /// synchronously, in registration order.
    pub fn set_state(&self, next: T) {
        self.inner.set_state(next);
    }

    /// Write a new value computed from the current one.
    pub fn set_state_with(&self, update: impl FnOnce(&T) -> T) {
        self.inner.set_state_with(update);
    }

    /// Register a value-change listener. Pair with [`StateAtom::remove`].
    pub fn add(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> ListenerId {
        self.inner.listeners.add(Arc::new(listener))
    }

    /// Unregister a listener.
    pub fn remove(&self, id: ListenerId) {
        self.inner.listeners.remove(id);
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Run every outstanding teardown routine. Terminal: the atom ignores
    /// state writes afterwards.
    pub fn cleanup(&self) {
        AnyAtom::cleanup(&*self.inner);
    }
}

impl<T: AtomValue + Debug> Debug for StateAtom<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateAtom")
            .field("key", &self.inner.key)
            .field("state", &*self.inner.value.read())
            .field("listener_count", &self.listener_count())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Cross-atom APIs
// ----------------------------------------------------------------------------

/// Cross-atom reads and writes, handed to default factories, write
/// overrides, and anything else that runs outside an atom's own setup.
pub struct AtomApi {
    ctx: Context,
}

impl AtomApi {
    pub(crate) fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Resolve an atom and return its current value.
    pub fn get<S: AtomValue>(&self, atom_ref: &AtomRef<S>) -> Result<S, AtomError> {
        Ok(self.ctx.load(atom_ref)?.state())
    }

    /// Resolve an atom and write a new value into it.
    pub fn set<S: AtomValue>(&self, atom_ref: &AtomRef<S>, next: S) -> Result<(), AtomError> {
        self.ctx.load(atom_ref)?.set_state(next);
        Ok(())
    }

    /// The registry behind this api.
    pub fn context(&self) -> &Context {
        &self.ctx
    }
}

struct WatchState {
    callback: Box<dyn FnMut() -> Option<Cleanup> + Send>,
    cleanup: Option<Cleanup>,
}

/// Shared cell for one watch/effect registration. Taken out of the slot for
/// the duration of an invocation, which doubles as the re-entrancy guard.
type WatchSlot = Arc<Mutex<Option<WatchState>>>;

fn invoke_watch_slot(slot: &WatchSlot) {
    let Some(mut state) = slot.lock().take() else {
        // Either the callback synchronously re-triggered itself or the atom
        // was torn down; both are dropped, not recursed into.
        #[cfg(debug_assertions)]
        tracing::warn!("re-entrant watch invocation skipped");
        return;
    };
    if let Some(cleanup) = state.cleanup.take() {
        cleanup();
    }
    state.cleanup = (state.callback)();
    *slot.lock() = Some(state);
}

/// The api handed to an atom's setup routine.
///
/// Reads and writes resolve any atom, the atom under construction included
/// (self-access does not trip the registry's cycle detection). Clone it into
/// callbacks that need graph access later.
#[derive(Clone)]
pub struct SetupApi {
    ctx: Context,
    self_atom: Arc<dyn AnyAtom>,
    registering: Arc<AtomicBool>,
}

impl SetupApi {
    fn new(ctx: Context, self_atom: Arc<dyn AnyAtom>) -> Self {
        Self {
            ctx,
            self_atom,
            registering: Arc::new(AtomicBool::new(false)),
        }
    }

    fn resolve(&self, dep: &AtomDep) -> Result<Arc<dyn AnyAtom>, AtomError> {
        if dep.key() == self.self_atom.key() {
            Ok(Arc::clone(&self.self_atom))
        } else {
            self.ctx.load_erased(&dep.0)
        }
    }

    /// Resolve an atom handle, the atom under construction included.
    pub fn load<S: AtomValue>(&self, atom_ref: &AtomRef<S>) -> Result<StateAtom<S>, AtomError> {
        if atom_ref.key() == self.self_atom.key() {
            Arc::clone(&self.self_atom)
                .as_any()
                .downcast::<AtomInner<S>>()
                .map(StateAtom::from_inner)
                .map_err(|_| AtomError::TypeMismatch {
                    key: atom_ref.key().to_owned(),
                })
        } else {
            self.ctx.load(atom_ref)
        }
    }

    /// Current value of any atom.
    pub fn get<S: AtomValue>(&self, atom_ref: &AtomRef<S>) -> Result<S, AtomError> {
        Ok(self.load(atom_ref)?.state())
    }

    /// Write into any atom.
    pub fn set<S: AtomValue>(&self, atom_ref: &AtomRef<S>, next: S) -> Result<(), AtomError> {
        self.load(atom_ref)?.set_state(next);
        Ok(())
    }

    /// Register a synchronous dependency-triggered callback.
    ///
    /// The callback is registered as a listener on every atom in `deps`
    /// (resolving each through the registry; the atom itself listens on its
    /// own set) and invoked once immediately. Every later notification on
    /// any dependency re-invokes it inline with the triggering update. A
    /// cleanup returned by one invocation runs before the next, and on
    /// teardown.
    pub fn watch(
        &self,
        deps: &[AtomDep],
        callback: impl FnMut() -> Option<Cleanup> + Send + 'static,
    ) -> Result<(), AtomError> {
        self.register(deps, callback, false)
    }

    /// Register a deferred dependency-triggered callback.
    ///
    /// Identical wiring to [`SetupApi::watch`], but every invocation,
    /// including the first, is pushed onto the context's task queue instead of
    /// running inline, giving commit-phase timing decoupled from the
    /// triggering update.
    pub fn effect(
        &self,
        deps: &[AtomDep],
        callback: impl FnMut() -> Option<Cleanup> + Send + 'static,
    ) -> Result<(), AtomError> {
        self.register(deps, callback, true)
    }

    fn register(
        &self,
        deps: &[AtomDep],
        callback: impl FnMut() -> Option<Cleanup> + Send + 'static,
        deferred: bool,
    ) -> Result<(), AtomError> {
        if self.registering.swap(true, Ordering::SeqCst) {
            #[cfg(debug_assertions)]
            tracing::warn!(
                key = %self.self_atom.key(),
                "watch/effect registrations should not be nested"
            );
        }

        // Resolve every dependency before wiring anything, so a failed
        // resolution leaves no half-registered listeners behind.
        let atoms: Result<Vec<_>, AtomError> =
            deps.iter().map(|dep| self.resolve(dep)).collect();
        let atoms = match atoms {
            Ok(atoms) => atoms,
            Err(error) => {
                self.registering.store(false, Ordering::SeqCst);
                return Err(error);
            }
        };

        let slot: WatchSlot = Arc::new(Mutex::new(Some(WatchState {
            callback: Box::new(callback),
            cleanup: None,
        })));

        // Teardown drains the slot: the pending cleanup runs and the
        // callback is dropped with it.
        {
            let slot = Arc::clone(&slot);
            self.self_atom.push_cleanup(Box::new(move || {
                if let Some(state) = slot.lock().take() {
                    if let Some(cleanup) = state.cleanup {
                        cleanup();
                    }
                }
            }));
        }

        let trigger: ErasedListener = if deferred {
            let slot = Arc::clone(&slot);
            let ctx = self.ctx.downgrade();
            Arc::new(move || {
                if let Some(ctx) = ctx.upgrade() {
                    let slot = Arc::clone(&slot);
                    ctx.enqueue(move || invoke_watch_slot(&slot));
                }
            })
        } else {
            let slot = Arc::clone(&slot);
            Arc::new(move || invoke_watch_slot(&slot))
        };

        for atom in atoms {
            atom.add_listener_erased(Arc::clone(&trigger));
        }

        // First invocation: inline for watch, queued for effect.
        trigger();

        self.registering.store(false, Ordering::SeqCst);
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Builder
// ----------------------------------------------------------------------------

/// Builder for a state atom reference.
///
/// ```rust
/// use nucleus_core::{Context, StateAtomBuilder};
///
/// let count = StateAtomBuilder::new("count", 0).build();
///
/// let context = Context::new();
/// let atom = context.load(&count).unwrap();
/// atom.set_state(5);
/// assert_eq!(atom.state(), 5);
/// ```
pub struct StateAtomBuilder<T: AtomValue> {
    key: String,
    default: DefaultFn<T>,
    setup: Option<SetupFn<T>>,
    effect: Option<EffectFn<T>>,
    equality: Equality,
}

impl<T: AtomValue> StateAtomBuilder<T> {
    /// A state atom with a literal default value.
    pub fn new(key: impl Into<String>, default: T) -> Self {
        Self::with_default_fn(key, move |_| Ok(default.clone()))
    }

    /// A state atom whose default is computed at first load. The factory
    /// receives an [`AtomApi`] so defaults can derive from sibling atoms.
    pub fn with_default_fn(
        key: impl Into<String>,
        default: impl Fn(&AtomApi) -> Result<T, AtomError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            key: key.into(),
            default: Arc::new(default),
            setup: None,
            effect: None,
            equality: Equality::Strict,
        }
    }

    /// Gate updates on structural equality of the serialized state instead
    /// of `PartialEq`.
    pub fn deep_equality(mut self) -> Self {
        self.equality = Equality::Deep;
        self
    }

    /// Attach a deferred effect run after every observable update, with the
    /// new value and the atom handle. A returned cleanup runs before the
    /// next invocation and on teardown.
    ///
    /// Writing to the atom from its own effect without a stopping condition
    /// creates an infinite update loop.
    pub fn effect(
        mut self,
        effect: impl Fn(&T, &StateAtom<T>) -> Option<Cleanup> + Send + Sync + 'static,
    ) -> Self {
        self.effect = Some(Arc::new(effect));
        self
    }

    /// Attach a setup routine run once at construction, after the initial
    /// state write. A returned cleanup runs on teardown.
    pub fn setup(
        mut self,
        setup: impl Fn(&StateAtom<T>, &SetupApi) -> Result<Option<Cleanup>, AtomError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.setup = Some(Arc::new(setup));
        self
    }

    /// Finish into a reference resolvable by any context.
    pub fn build(self) -> AtomRef<T> {
        let key = self.key.clone();
        let config = Arc::new(self);
        AtomRef::new(
            key,
            Box::new(move |ctx, hydrated| {
                construct_state_atom(ctx, &config, hydrated)
                    .map(|inner| inner as Arc<dyn AnyAtom>)
            }),
        )
    }
}

fn construct_state_atom<T: AtomValue>(
    ctx: &Context,
    config: &Arc<StateAtomBuilder<T>>,
    hydrated: Option<Value>,
) -> Result<Arc<AtomInner<T>>, AtomError> {
    let inner = AtomInner::new(
        config.key.clone(),
        ctx.downgrade(),
        config.equality,
        config.effect.clone(),
    );

    let initial: T = match hydrated {
        Some(value) => {
            serde_json::from_value(value).map_err(|source| AtomError::Hydration {
                key: config.key.clone(),
                source,
            })?
        }
        None => (config.default)(&AtomApi::new(ctx.clone()))?,
    };

    // The first write populates the state and fires the startup effect.
    inner.apply(initial);

    if let Some(setup) = &config.setup {
        let api = SetupApi::new(ctx.clone(), Arc::clone(&inner) as Arc<dyn AnyAtom>);
        if let Some(cleanup) = setup(&inner.handle(), &api)? {
            inner.push_cleanup(cleanup);
        }
    }

    Ok(inner)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
