//! Derived Atom
//!
//! A derived atom computes its value from other atoms instead of storing an
//! independent one. Dependencies are discovered by tracking: every read the
//! derivation function performs through its [`DerivedApi`] subscribes the
//! derived atom to that dependency, and any later change to a subscribed
//! dependency recomputes the derivation synchronously. The recomputed value
//! goes through the ordinary equality gate, so a recomputation that lands on
//! an equal value propagates nothing downstream.
//!
//! Dependency sets are re-tracked on every recomputation. A dependency the
//! latest run did not read is unsubscribed, so conditional derivations only
//! wake up for the branch they currently depend on.
//!
//! By default a derived atom rejects external writes. A builder-supplied
//! `set` routine opts in: it receives the written value and an [`AtomApi`]
//! and forwards the write upstream however it sees fit; the derived value
//! itself still only ever changes through recomputation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;

use crate::atom::{AnyAtom, AtomRef, AtomValue, ErasedListener};
use crate::context::{Context, WeakContext};
use crate::error::AtomError;
use crate::listener::ListenerId;
use crate::state::{AtomApi, AtomInner, Cleanup, EffectFn, Equality, StateAtom, WriteFn};

type DeriveFn<T> = Arc<dyn Fn(&DerivedApi) -> Result<T, AtomError> + Send + Sync>;

/// Tracked read access, handed to a derivation function on every run.
pub struct DerivedApi {
    ctx: Context,
    trigger: ErasedListener,
    touched: Mutex<HashSet<String>>,
    deps: Arc<Mutex<HashMap<String, ListenerId>>>,
}

impl DerivedApi {
    /// Read another atom's value and subscribe the derivation to it.
    ///
    /// The subscription persists until a later run stops reading the atom,
    /// or the derived atom is torn down.
    pub fn get<S: AtomValue>(&self, atom_ref: &AtomRef<S>) -> Result<S, AtomError> {
        let atom = self.ctx.load(atom_ref)?;
        let key = atom_ref.key().to_owned();
        self.touched.lock().insert(key.clone());

        let mut deps = self.deps.lock();
        if !deps.contains_key(&key) {
            let id = atom.inner().add_listener_erased(Arc::clone(&self.trigger));
            deps.insert(key, id);
        }
        Ok(atom.state())
    }
}

/// The recomputation engine behind one derived atom instance.
///
/// Holds the atom weakly; dependency listeners reach the derivation through
/// a weak reference too, so the only strong owner is the teardown closure
/// registered on the atom itself.
struct Derivation<T: AtomValue> {
    atom: Weak<AtomInner<T>>,
    ctx: WeakContext,
    derive: DeriveFn<T>,
    deps: Arc<Mutex<HashMap<String, ListenerId>>>,
}

impl<T: AtomValue> Derivation<T> {
    /// One tracked run of the derivation function.
    ///
    /// Reads performed by this run subscribe as they happen; dependencies
    /// from previous runs that went unread are unsubscribed afterwards. On
    /// failure nothing is pruned, so the atom keeps recomputing when any
    /// previously known dependency changes again.
    fn compute(this: &Arc<Self>, ctx: &Context) -> Result<T, AtomError> {
        let weak = Arc::downgrade(this);
        let trigger: ErasedListener = Arc::new(move || {
            if let Some(derivation) = weak.upgrade() {
                derivation.recompute();
            }
        });

        let api = DerivedApi {
            ctx: ctx.clone(),
            trigger,
            touched: Mutex::new(HashSet::new()),
            deps: Arc::clone(&this.deps),
        };
        let value = (this.derive)(&api)?;

        let touched = api.touched.into_inner();
        let mut deps = this.deps.lock();
        let stale: Vec<String> = deps
            .keys()
            .filter(|key| !touched.contains(*key))
            .cloned()
            .collect();
        for key in stale {
            if let Some(id) = deps.remove(&key) {
                if let Some(atom) = ctx.loaded(&key) {
                    atom.remove_listener_erased(id);
                }
            }
        }
        Ok(value)
    }

    fn recompute(self: Arc<Self>) {
        let Some(ctx) = self.ctx.upgrade() else { return };
        let Some(atom) = self.atom.upgrade() else { return };
        match Self::compute(&self, &ctx) {
            Ok(value) => atom.apply(value),
            Err(error) => {
                tracing::error!(
                    key = %AnyAtom::key(&*atom),
                    %error,
                    "derived recomputation failed; keeping the previous value"
                );
            }
        }
    }
}

/// Builder for a derived atom reference.
///
/// ```rust
/// use nucleus_core::{Context, DerivedAtomBuilder, StateAtomBuilder};
///
/// let celsius = StateAtomBuilder::new("celsius", 0.0_f64).build();
///
/// let celsius_dep = celsius.clone();
/// let fahrenheit = DerivedAtomBuilder::new("fahrenheit", move |api| {
///     Ok(api.get(&celsius_dep)? * 9.0 / 5.0 + 32.0)
/// })
/// .build();
///
/// let context = Context::new();
/// let fahrenheit = context.load(&fahrenheit).unwrap();
/// assert_eq!(fahrenheit.state(), 32.0);
///
/// context.load(&celsius).unwrap().set_state(100.0);
/// assert_eq!(fahrenheit.state(), 212.0);
/// ```
pub struct DerivedAtomBuilder<T: AtomValue> {
    key: String,
    derive: DeriveFn<T>,
    write: Option<WriteFn<T>>,
    effect: Option<EffectFn<T>>,
    equality: Equality,
}

impl<T: AtomValue> DerivedAtomBuilder<T> {
    /// A derived atom computing its value through `derive` on first load and
    /// on every change to a tracked dependency.
    pub fn new(
        key: impl Into<String>,
        derive: impl Fn(&DerivedApi) -> Result<T, AtomError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            key: key.into(),
            derive: Arc::new(derive),
            write: None,
            effect: None,
            equality: Equality::Strict,
        }
    }

    /// Attach a deferred effect run after every observable recomputation,
    /// with the new value and the atom handle. A returned cleanup runs
    /// before the next invocation and on teardown.
    pub fn effect(
        mut self,
        effect: impl Fn(&T, &StateAtom<T>) -> Option<Cleanup> + Send + Sync + 'static,
    ) -> Self {
        self.effect = Some(Arc::new(effect));
        self
    }

    /// Accept external writes by forwarding them upstream.
    ///
    /// Without this, `set_state` on the derived atom is rejected with an
    /// error log; the derived value only changes through recomputation
    /// either way.
    pub fn set(
        mut self,
        write: impl Fn(T, &AtomApi) -> Result<(), AtomError> + Send + Sync + 'static,
    ) -> Self {
        self.write = Some(Arc::new(write));
        self
    }

    /// Gate recomputed values on structural equality of the serialized state
    /// instead of `PartialEq`.
    pub fn deep_equality(mut self) -> Self {
        self.equality = Equality::Deep;
        self
    }

    /// Finish into a reference resolvable by any context.
    pub fn build(self) -> AtomRef<T> {
        let key = self.key.clone();
        let config = Arc::new(self);
        AtomRef::new(
            key,
            Box::new(move |ctx, hydrated| {
                construct_derived_atom(ctx, &config, hydrated)
                    .map(|inner| inner as Arc<dyn AnyAtom>)
            }),
        )
    }
}

fn construct_derived_atom<T: AtomValue>(
    ctx: &Context,
    config: &Arc<DerivedAtomBuilder<T>>,
    _hydrated: Option<Value>,
) -> Result<Arc<AtomInner<T>>, AtomError> {
    let write = match &config.write {
        Some(write) => Arc::clone(write),
        None => {
            let key = config.key.clone();
            Arc::new(move |_, _: &AtomApi| {
                Err(AtomError::ReadOnly { key: key.clone() })
            }) as WriteFn<T>
        }
    };

    let inner = AtomInner::new(
        config.key.clone(),
        ctx.downgrade(),
        config.equality,
        config.effect.clone(),
    );
    inner.set_write_override(write);

    let derivation = Arc::new(Derivation {
        atom: Arc::downgrade(&inner),
        ctx: ctx.downgrade(),
        derive: Arc::clone(&config.derive),
        deps: Arc::new(Mutex::new(HashMap::new())),
    });

    // The first run both produces the initial value and tracks the initial
    // dependency set. A hydrated snapshot for this key is ignored at
    // construction; derived values come from the derivation, and a bulk
    // rehydration reaches the atom only after it exists.
    let initial = Derivation::compute(&derivation, ctx)?;
    inner.apply(initial);

    // Teardown detaches every dependency listener. The closure is also the
    // derivation's only strong owner, tying its lifetime to the atom's.
    {
        let derivation = Arc::clone(&derivation);
        let ctx = ctx.downgrade();
        inner.push_cleanup(Box::new(move || {
            let deps = std::mem::take(&mut *derivation.deps.lock());
            if let Some(ctx) = ctx.upgrade() {
                for (key, id) in deps {
                    if let Some(atom) = ctx.loaded(&key) {
                        atom.remove_listener_erased(id);
                    }
                }
            }
        }));
    }

    Ok(inner)
}
