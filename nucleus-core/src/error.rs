//! Error types for the atom graph.

use thiserror::Error;

/// Errors surfaced while resolving or hydrating atoms.
///
/// `CircularReference` is the only fatal graph condition: it is raised the
/// moment a load re-enters a key whose construction is already in progress
/// on the current call stack, and it propagates untouched to whatever
/// initiated the outermost load. Graphs with genuine cycles are unsupported.
#[derive(Debug, Error)]
pub enum AtomError {
    /// An atom's construction ended up resolving itself, directly or through
    /// a chain of other atoms.
    #[error("detected circular reference from {key}")]
    CircularReference { key: String },

    /// The same key was resolved with two different state types.
    #[error("atom {key} was loaded with a different state type")]
    TypeMismatch { key: String },

    /// A write was directed at a derived atom with no `set` routine.
    #[error("derived atom {key} does not accept writes")]
    ReadOnly { key: String },

    /// A hydrated value could not be deserialized into the atom's state type.
    #[error("failed to hydrate atom {key}")]
    Hydration {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}
