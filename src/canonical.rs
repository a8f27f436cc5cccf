//! Canonical JSON encoding — deterministic bytes for hashing.
//!
//! All checksums and chain hashes in this crate are computed over canonical
//! JSON: object keys sorted bytewise-ascending at every depth, no
//! insignificant whitespace, numbers in shortest round-trippable form with
//! no trailing `.0`, strings minimally escaped with UTF-8 passthrough, and
//! arrays in their logical order.
//!
//! Sorting falls out of `serde_json::Map` being backed by a `BTreeMap`
//! (the `preserve_order` feature is not enabled), so canonicalization is:
//! convert to a [`Value`] (struct field order collapses into sorted map
//! keys), normalize numbers, and serialize compactly.

use serde::Serialize;
use serde_json::Value;

use crate::error::Result;

/// Encode any serializable value as canonical JSON bytes.
///
/// Two calls with logically equal values always produce identical bytes,
/// regardless of struct field declaration order or map insertion order.
///
/// # Errors
/// Returns an error if the value cannot be represented as JSON.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let tree = serde_json::to_value(value)?;
    let tree = normalize(tree);
    Ok(serde_json::to_vec(&tree)?)
}

/// Recursively normalize a JSON tree.
///
/// Floats with a zero fractional part are rewritten as integers so that
/// `1.0` and `1` encode identically.
fn normalize(value: Value) -> Value {
    match value {
        Value::Number(n) => Value::Number(normalize_number(n)),
        Value::Array(items) => Value::Array(items.into_iter().map(normalize).collect()),
        Value::Object(map) => {
            Value::Object(map.into_iter().map(|(k, v)| (k, normalize(v))).collect())
        }
        other => other,
    }
}

fn normalize_number(n: serde_json::Number) -> serde_json::Number {
    if let Some(f) = n.as_f64()
        && n.as_i64().is_none()
        && n.as_u64().is_none()
        && f.fract().abs() < f64::EPSILON
        && f.abs() < 9_007_199_254_740_992.0
    {
        // Integral float: fold into an integer, dropping the trailing `.0`.
        #[allow(clippy::cast_possible_truncation)]
        return serde_json::Number::from(f as i64);
    }
    n
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
