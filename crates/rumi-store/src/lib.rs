// SPDX-License-Identifier: MIT OR Apache-2.0
//! rumi-store
//!
//! The kernel's transactional storage engine: SQLite-backed key/value
//! stores with compare-and-swap, keyset pagination, bounded batch reads,
//! and an HMAC-signed cross-pack sharing policy.

#![deny(unsafe_code)]

mod expectation;
mod migration;
mod registry;
mod sharing;

pub use expectation::Expectation;
pub use registry::{
    BatchGetResult, CasOutcome, ListKeysResult, PackStoreResult, StoreDefinition, StoreRegistry,
    MAX_BATCH_KEYS, MAX_BATCH_RESPONSE_BYTES, MAX_STORES_PER_PACK, MAX_VALUE_BYTES_CAS,
};
pub use sharing::{SharingEntry, SharingManager};
