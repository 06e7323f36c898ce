// SPDX-License-Identifier: MIT OR Apache-2.0
//! Flow orchestration contract.
//!
//! The orchestrator itself is an external collaborator; the daemon owns
//! only its gate: a concurrency semaphore, the run timeout, and the
//! result-size rule (a body past the cap is replaced by a
//! `{_truncated, _keys}` summary).

use rumi_core::{ErrorKind, KernelError};
use serde_json::{json, Value};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Boxed future a flow runner returns.
pub type FlowFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, KernelError>> + Send + 'a>>;

/// Contract the orchestrator implements to be driven by the daemon.
pub trait FlowRunner: Send + Sync {
    /// Run `flow_id` with `inputs`. The daemon enforces the timeout and
    /// the concurrency bound around this call.
    fn run<'a>(&'a self, flow_id: &'a str, inputs: Value) -> FlowFuture<'a>;
}

/// Placeholder runner used until an orchestrator registers: every flow is
/// unknown.
pub struct NullFlowRunner;

impl FlowRunner for NullFlowRunner {
    fn run<'a>(&'a self, flow_id: &'a str, _inputs: Value) -> FlowFuture<'a> {
        Box::pin(async move {
            Err(KernelError::new(
                ErrorKind::InvalidRequest,
                format!("Unknown flow: {flow_id}"),
            ))
        })
    }
}

/// Default flow timeout.
pub const DEFAULT_FLOW_TIMEOUT: Duration = Duration::from_secs(300);

/// Replace an oversized flow result with a summary of its top-level keys.
pub fn truncate_result(result: Value, max_bytes: usize) -> Value {
    let serialized = result.to_string();
    if serialized.len() <= max_bytes {
        return result;
    }
    let keys: Vec<String> = match &result {
        Value::Object(map) => map.keys().cloned().collect(),
        _ => Vec::new(),
    };
    json!({ "_truncated": true, "_keys": keys })
}
