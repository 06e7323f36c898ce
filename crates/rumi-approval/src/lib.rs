// SPDX-License-Identifier: MIT OR Apache-2.0
//! rumi-approval
//!
//! Pack approval lifecycle: a pack may only originate execution while its
//! status is `approved` AND its on-disk tree still hashes to the digest
//! recorded at approval time. A hash drift automatically demotes the pack
//! to `modified`.
//!
//! The importer stages pack payloads (directory / zip / rumipack) with
//! zip-slip defense and size caps before anything touches the live
//! ecosystem root.

#![deny(unsafe_code)]

mod importer;
mod manager;

pub use importer::{ImportLimits, PackImportResult, PackImporter};
pub use manager::{ApprovalManager, PackRecord, PackStatus};
