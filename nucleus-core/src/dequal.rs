//! Structural Equality
//!
//! Deep comparison of dynamic JSON values, used by atoms configured for
//! deep equality checking. A state write whose value is structurally equal
//! to the current one is treated as a no-op and never notifies listeners.
//!
//! The comparison is pure and recursion depth is bounded by the input depth;
//! `serde_json::Value` trees are acyclic by construction, so no cycle guard
//! is needed.

use serde_json::Value;

/// Compare two values structurally.
///
/// - Arrays are equal when they have the same length and every element is
///   deeply equal, in order.
/// - Objects are equal when they hold exactly the same keys (order ignored)
///   and every value is deeply equal.
/// - Numbers compare exactly when both sides are integral, and as f64
///   otherwise. Two self-unequal (NaN) numbers are defined equal.
/// - Values of different shapes are unequal.
pub fn deep_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(i), Some(j)) = (x.as_i64(), y.as_i64()) {
                return i == j;
            }
            if let (Some(i), Some(j)) = (x.as_u64(), y.as_u64()) {
                return i == j;
            }
            match (x.as_f64(), y.as_f64()) {
                (Some(f), Some(g)) => f == g || (f != f && g != g),
                _ => x == y,
            }
        }
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| deep_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            // Equal key counts plus full membership of one side gives
            // symmetric key membership.
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, v)| ys.get(k).map_or(false, |w| deep_equal(v, w)))
        }
        _ => a == b,
    }
}
