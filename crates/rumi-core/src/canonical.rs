// SPDX-License-Identifier: MIT OR Apache-2.0
//! Canonical JSON encoding and content hashing.
//!
//! The canonical form is what gets hashed for CAS pre-image comparison and
//! what gets signed for grant/sharing files: object keys sorted, compact
//! separators, UTF-8 with no ASCII escaping. Two values that differ only in
//! key order produce identical canonical bytes.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serialize a value to its canonical JSON string.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// SHA-256 hex digest of the canonical form.
pub fn value_hash(value: &Value) -> String {
    let canonical = canonical_json(value);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex_digest(hasher)
}

/// Lowercase hex of a finished SHA-256 hasher.
pub(crate) fn hex_digest(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    let mut s = String::with_capacity(64);
    for byte in digest {
        s.push_str(&format!("{byte:02x}"));
    }
    s
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {
            // serde_json already emits compact scalars without escaping
            // non-ASCII characters.
            out.push_str(&value.to_string());
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
    }
}
