// SPDX-License-Identifier: MIT OR Apache-2.0
//! rumi-exec
//!
//! The trust-and-execution core: the capability executor (C8) and the unit
//! executor (C9). Both run the same gate sequence — approval, trust,
//! grant — and then sandbox the actual execution in a subprocess with a
//! hard wall-clock timeout and a bounded stdout reader. Every early return
//! produces exactly one audit entry.

#![deny(unsafe_code)]

mod capability;
mod handler_registry;
mod runner;
mod unit;
mod unit_registry;

pub use capability::{CapabilityExecutor, CapabilityRequest, CapabilityResponse};
pub use handler_registry::{HandlerDefinition, HandlerRegistry, RegistryLoadResult};
pub use runner::{run_bounded, SubprocessOutcome, SubprocessSpec, MAX_RESPONSE_SIZE};
pub use unit::{UnitExecutionResult, UnitExecutor, UnitRef};
pub use unit_registry::{UnitMeta, UnitRegistry};
