//! Nucleus Core
//!
//! This crate provides the core runtime for the Nucleus reactive state
//! graph. It implements:
//!
//! - Keyed atom references, instantiated lazily and memoized per context
//! - State atoms with equality-gated writes, listeners, watches, and
//!   deferred effects
//! - Derived atoms with tracked dependencies and automatic recomputation
//! - Hydration of atom state from serialized snapshots
//! - An observer hook for mirroring updates out of process
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `atom`: Atom references and the shared state-type bounds
//! - `state`: The state atom, its builder, and the setup apis
//! - `derived`: Derived atoms and dependency tracking
//! - `context`: The registry owning instances, hydration, and the task queue
//! - `observer`: The update-mirroring hook
//!
//! # Example
//!
//! ```rust
//! use nucleus_core::{Context, DerivedAtomBuilder, StateAtomBuilder};
//!
//! // An independent piece of state.
//! let count = StateAtomBuilder::new("count", 0).build();
//!
//! // A value computed from it, recomputed on every change.
//! let count_dep = count.clone();
//! let doubled = DerivedAtomBuilder::new("doubled", move |api| {
//!     Ok(api.get(&count_dep)? * 2)
//! })
//! .build();
//!
//! let context = Context::new();
//! let doubled = context.load(&doubled).unwrap();
//! assert_eq!(doubled.state(), 0);
//!
//! context.load(&count).unwrap().set_state(5);
//! assert_eq!(doubled.state(), 10);
//! ```

mod atom;
mod context;
mod dequal;
mod derived;
mod error;
mod listener;
mod observer;
mod state;

pub use atom::{AtomDep, AtomRef, AtomValue};
pub use context::{global, set_global, Context};
pub use dequal::deep_equal;
pub use derived::{DerivedApi, DerivedAtomBuilder};
pub use error::AtomError;
pub use listener::ListenerId;
pub use observer::AtomEvent;
pub use state::{AtomApi, Cleanup, SetupApi, StateAtom, StateAtomBuilder};
