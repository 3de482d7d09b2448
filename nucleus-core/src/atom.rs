//! Atom references and the erased instance surface.
//!
//! An `AtomRef` is the durable identity of an atom: a globally-unique string
//! key paired with a construction function. References are cheap to clone and
//! carry no state of their own; all live state belongs to the instance a
//! registry builds from the reference on first resolution.
//!
//! Two references denote the same atom exactly when their keys are equal.
//! Keys must be unique across a single registry's lifetime.

use std::any::Any;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::context::Context;
use crate::error::AtomError;
use crate::listener::ListenerId;

/// Bounds every atom state type must satisfy.
///
/// `Serialize + DeserializeOwned` back hydration and observer snapshots;
/// `PartialEq` backs the strict equality gate; `Clone` because reads hand
/// out owned values.
pub trait AtomValue:
    Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> AtomValue for T where
    T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Construction function stored inside a reference.
///
/// All inputs reach it through the registry handle and the optional hydrated
/// value; construction must not depend on any other outside state.
pub(crate) type ConstructFn =
    Box<dyn Fn(&Context, Option<Value>) -> Result<Arc<dyn AnyAtom>, AtomError> + Send + Sync>;

pub(crate) struct RefInner {
    pub(crate) key: String,
    pub(crate) construct: ConstructFn,
}

/// A typed, cheaply-cloneable reference to an atom.
///
/// Built by [`crate::StateAtomBuilder`] or [`crate::DerivedAtomBuilder`];
/// resolved into a live instance by [`Context::load`](crate::Context::load).
pub struct AtomRef<T> {
    pub(crate) inner: Arc<RefInner>,
    _state: PhantomData<fn() -> T>,
}

impl<T> Clone for AtomRef<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _state: PhantomData,
        }
    }
}

impl<T: AtomValue> AtomRef<T> {
    pub(crate) fn new(key: String, construct: ConstructFn) -> Self {
        Self {
            inner: Arc::new(RefInner { key, construct }),
            _state: PhantomData,
        }
    }

    /// The atom's unique key.
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Erase the state type, for heterogeneous dependency lists.
    pub fn dep(&self) -> AtomDep {
        AtomDep(Arc::clone(&self.inner))
    }
}

impl<T> Debug for AtomRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomRef").field("key", &self.inner.key).finish()
    }
}

/// A type-erased atom reference.
///
/// Used wherever atoms of different state types appear in one list, such as
/// the dependency arrays of `watch` and `effect`.
#[derive(Clone)]
pub struct AtomDep(pub(crate) Arc<RefInner>);

impl AtomDep {
    pub fn key(&self) -> &str {
        &self.0.key
    }
}

impl<T: AtomValue> From<&AtomRef<T>> for AtomDep {
    fn from(atom_ref: &AtomRef<T>) -> Self {
        atom_ref.dep()
    }
}

impl Debug for AtomDep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomDep").field("key", &self.0.key).finish()
    }
}

pub(crate) type ErasedListener = Arc<dyn Fn() + Send + Sync>;

/// The registry-facing surface of a live atom instance, with the state type
/// erased. The typed instance is recovered through `as_any` + downcast.
pub(crate) trait AnyAtom: Send + Sync {
    fn key(&self) -> &str;

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// Register a zero-argument listener, used for dependency wiring where
    /// the dependent does not care about the dependency's state type.
    fn add_listener_erased(&self, listener: ErasedListener) -> ListenerId;

    fn remove_listener_erased(&self, id: ListenerId);

    /// Push an externally supplied value into the atom. Deserializes and
    /// stores through the internal write path, equality gate included; a
    /// derived atom's write override is not consulted.
    fn hydrate(&self, value: &Value) -> Result<(), AtomError>;

    /// Register a teardown routine to run when the atom is cleaned up.
    fn push_cleanup(&self, cleanup: Box<dyn FnOnce() + Send>);

    /// Release every resource the atom's setup or derivation acquired.
    fn cleanup(&self);
}
