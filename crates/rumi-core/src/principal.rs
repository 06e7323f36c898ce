// SPDX-License-Identifier: MIT OR Apache-2.0
//! Principal identifiers and the grant hierarchy.
//!
//! A principal id may be hierarchical: `root__child__leaf` denotes a chain
//! where every enclosing ancestor must independently hold a permission and
//! the effective config is the intersection down the chain.

use serde_json::{Map, Value};

/// Separator between hierarchy levels in a principal id.
pub const HIERARCHY_SEPARATOR: &str = "__";

/// Replace bytes that are unsafe in filesystem names with `_`.
///
/// Covers `/ \ : * ? " < > | .` and all control bytes, so a principal id
/// can never traverse out of its grants directory.
pub fn sanitize_principal_id(principal_id: &str) -> String {
    principal_id
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '.' => '_',
            c if (c as u32) < 0x20 => '_',
            c => c,
        })
        .collect()
}

/// Expand a principal id into its ancestor chain.
///
/// `"a__b__c"` becomes `["a", "a__b", "a__b__c"]`; a flat id yields itself.
pub fn parse_principal_chain(principal_id: &str) -> Vec<String> {
    let parts: Vec<&str> = principal_id.split(HIERARCHY_SEPARATOR).collect();
    (1..=parts.len())
        .map(|i| parts[..i].join(HIERARCHY_SEPARATOR))
        .collect()
}

/// Whether the id contains at least one hierarchy separator.
pub fn is_hierarchical(principal_id: &str) -> bool {
    principal_id.contains(HIERARCHY_SEPARATOR)
}

/// The immediate parent of a hierarchical principal, or `None` for a root.
pub fn get_parent(principal_id: &str) -> Option<String> {
    if !is_hierarchical(principal_id) {
        return None;
    }
    let parts: Vec<&str> = principal_id.split(HIERARCHY_SEPARATOR).collect();
    Some(parts[..parts.len() - 1].join(HIERARCHY_SEPARATOR))
}

/// Intersect grant configs down a hierarchy chain.
///
/// Rules per key present in all configs:
/// lists keep the common scalars, bools AND, numbers take the minimum,
/// strings keep the topmost value, objects intersect recursively.
/// Keys missing from any config are dropped.
pub fn intersect_config(configs: &[Map<String, Value>]) -> Map<String, Value> {
    match configs {
        [] => Map::new(),
        [only] => only.clone(),
        [first, rest @ ..] => {
            let mut result = first.clone();
            for other in rest {
                result = intersect_two(&result, other);
            }
            result
        }
    }
}

fn intersect_two(a: &Map<String, Value>, b: &Map<String, Value>) -> Map<String, Value> {
    let mut result = Map::new();
    for (key, va) in a {
        let Some(vb) = b.get(key) else { continue };
        match (va, vb) {
            (Value::Array(la), Value::Array(lb)) => {
                let kept: Vec<Value> = la
                    .iter()
                    .filter(|item| is_scalar(item) && lb.contains(item))
                    .cloned()
                    .collect();
                result.insert(key.clone(), Value::Array(kept));
            }
            (Value::Bool(ba), Value::Bool(bb)) => {
                result.insert(key.clone(), Value::Bool(*ba && *bb));
            }
            (Value::Number(na), Value::Number(nb)) => {
                let min = if na.as_f64().unwrap_or(f64::MAX) <= nb.as_f64().unwrap_or(f64::MAX) {
                    va.clone()
                } else {
                    vb.clone()
                };
                result.insert(key.clone(), min);
            }
            (Value::String(_), Value::String(_)) => {
                result.insert(key.clone(), va.clone());
            }
            (Value::Object(oa), Value::Object(ob)) => {
                result.insert(key.clone(), Value::Object(intersect_two(oa, ob)));
            }
            _ => {}
        }
    }
    result
}

fn is_scalar(value: &Value) -> bool {
    matches!(
        value,
        Value::String(_) | Value::Number(_) | Value::Bool(_)
    )
}
