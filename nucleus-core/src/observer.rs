//! Observer hook for out-of-process mirrors.
//!
//! A registry can carry a single observer: a callback receiving
//! `(key, event, snapshot)` tuples on every observable atom update. This is
//! the seam a devtools relay or a telemetry collector plugs into. Snapshots
//! are serialized JSON values, never live references, so consumers are free
//! to retain or forward them.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

/// The kind of update an observer is told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomEvent {
    /// The atom's very first successful state write, during construction.
    Created,
    /// Any later successful state write.
    Updated,
}

pub(crate) type ObserverFn = Arc<dyn Fn(&str, AtomEvent, Value) + Send + Sync>;

/// Serialize a state value into an observer snapshot.
///
/// Values that cannot be serialized are skipped with a warning rather than
/// interrupting propagation; the observer is a mirror, not a participant.
pub(crate) fn snapshot<T: Serialize>(key: &str, value: &T) -> Option<Value> {
    match serde_json::to_value(value) {
        Ok(snapshot) => Some(snapshot),
        Err(error) => {
            tracing::warn!(key, %error, "atom state could not be snapshotted for the observer");
            None
        }
    }
}
