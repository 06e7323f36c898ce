// SPDX-License-Identifier: MIT OR Apache-2.0
//! CAS pre-image expectation.
//!
//! "Expect the key to be missing" is its own variant rather than a sentinel
//! value, so `Expectation::Value(Value::Null)` unambiguously means "expect
//! stored JSON null". On the wire, an absent `expected_value` field maps to
//! [`Expectation::Missing`].

use serde_json::Value;

/// What the caller expects the current state of a key to be.
#[derive(Debug, Clone, PartialEq)]
pub enum Expectation {
    /// The key must not exist.
    Missing,
    /// The key must hold exactly this value (compared by canonical hash).
    Value(Value),
}

impl Expectation {
    /// Build from an optional wire field: absent → `Missing`, present
    /// (including JSON null) → `Value`.
    pub fn from_wire(field: Option<Value>) -> Self {
        match field {
            None => Self::Missing,
            Some(v) => Self::Value(v),
        }
    }
}
