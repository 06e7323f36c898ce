// SPDX-License-Identifier: MIT OR Apache-2.0
//! rumi-audit
//!
//! Append-only audit journal. Entries are buffered in memory, grouped by
//! `(category, date-extracted-from-ts)`, and flushed to
//! `audit/<category>_<YYYY-MM-DD>.jsonl` when the buffer reaches its
//! high-water mark, on explicit [`AuditLogger::flush`], or on drop.
//!
//! Audit must never break the caller: write failures are reported through
//! `tracing` and swallowed.

#![deny(unsafe_code)]

mod entry;
mod query;

pub use entry::{AuditCategory, AuditEntry, AuditSeverity};
pub use query::AuditQuery;

use rumi_core::now_ts;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Entries held in memory before a flush is forced.
const BUFFER_HIGH_WATER: usize = 100;

/// Thread-safe buffered audit writer.
pub struct AuditLogger {
    audit_dir: PathBuf,
    buffer: Mutex<Vec<AuditEntry>>,
}

impl AuditLogger {
    /// Create a logger writing under `audit_dir` (created eagerly).
    pub fn new(audit_dir: impl Into<PathBuf>) -> Self {
        let audit_dir = audit_dir.into();
        if let Err(e) = std::fs::create_dir_all(&audit_dir) {
            tracing::error!(dir = %audit_dir.display(), error = %e, "failed to create audit dir");
        }
        Self {
            audit_dir,
            buffer: Mutex::new(Vec::new()),
        }
    }

    /// Record an entry. Flushes when the buffer reaches its high-water mark.
    pub fn log(&self, entry: AuditEntry) {
        let mut buffer = self.buffer.lock().expect("audit buffer lock");
        buffer.push(entry);
        if buffer.len() >= BUFFER_HIGH_WATER {
            self.flush_locked(&mut buffer);
        }
    }

    /// Force-write every buffered entry.
    pub fn flush(&self) {
        let mut buffer = self.buffer.lock().expect("audit buffer lock");
        self.flush_locked(&mut buffer);
    }

    fn flush_locked(&self, buffer: &mut Vec<AuditEntry>) {
        if buffer.is_empty() {
            return;
        }

        let mut by_file: HashMap<PathBuf, Vec<&AuditEntry>> = HashMap::new();
        for entry in buffer.iter() {
            let date = extract_date_from_ts(&entry.ts);
            let file = self
                .audit_dir
                .join(format!("{}_{}.jsonl", entry.category.as_str(), date));
            by_file.entry(file).or_default().push(entry);
        }

        for (file, entries) in by_file {
            if let Err(e) = append_entries(&file, &entries) {
                tracing::error!(file = %file.display(), error = %e, "audit write failed");
            }
        }
        buffer.clear();
    }

    // -- Category-specific constructors ---------------------------------

    /// Record a permission decision (capability / unit execution, grant
    /// mutations).
    #[allow(clippy::too_many_arguments)]
    pub fn log_permission_event(
        &self,
        pack_id: &str,
        permission_type: &str,
        action: &str,
        success: bool,
        details: Map<String, Value>,
        rejection_reason: Option<String>,
    ) {
        let mut merged = Map::new();
        merged.insert("permission_type".into(), Value::String(permission_type.into()));
        merged.extend(details);
        self.log(AuditEntry {
            ts: now_ts(),
            category: AuditCategory::Permission,
            severity: if success {
                AuditSeverity::Info
            } else {
                AuditSeverity::Warning
            },
            action: format!("permission_{action}"),
            success,
            owner_pack: Some(pack_id.to_string()),
            rejection_reason,
            details: merged,
            ..AuditEntry::default()
        });
    }

    /// Record an egress allow/deny decision. `allowed` doubles as `success`.
    pub fn log_network_event(
        &self,
        pack_id: &str,
        domain: &str,
        port: u16,
        allowed: bool,
        reason: Option<String>,
        request_details: Map<String, Value>,
    ) {
        let mut details = Map::new();
        details.insert("domain".into(), Value::String(domain.into()));
        details.insert("port".into(), Value::from(port));
        details.insert("allowed".into(), Value::Bool(allowed));
        details.extend(request_details);
        self.log(AuditEntry {
            ts: now_ts(),
            category: AuditCategory::Network,
            severity: if allowed {
                AuditSeverity::Info
            } else {
                AuditSeverity::Warning
            },
            action: "network_request".into(),
            success: allowed,
            owner_pack: Some(pack_id.to_string()),
            rejection_reason: if allowed { None } else { reason },
            details,
            ..AuditEntry::default()
        });
    }

    /// Record a security event (tamper detection, policy violations).
    pub fn log_security_event(
        &self,
        event_type: &str,
        severity: AuditSeverity,
        description: &str,
        pack_id: Option<&str>,
        details: Map<String, Value>,
    ) {
        let mut merged = Map::new();
        merged.insert("description".into(), Value::String(description.into()));
        merged.extend(details);
        self.log(AuditEntry {
            ts: now_ts(),
            category: AuditCategory::Security,
            severity,
            action: event_type.into(),
            success: matches!(severity, AuditSeverity::Info | AuditSeverity::Warning),
            owner_pack: pack_id.map(str::to_string),
            details: merged,
            ..AuditEntry::default()
        });
    }

    /// Record a system event (store mutations, secret writes, migrations).
    pub fn log_system_event(
        &self,
        event_type: &str,
        success: bool,
        details: Map<String, Value>,
        error: Option<String>,
    ) {
        self.log(AuditEntry {
            ts: now_ts(),
            category: AuditCategory::System,
            severity: if success {
                AuditSeverity::Info
            } else {
                AuditSeverity::Error
            },
            action: event_type.into(),
            success,
            error,
            details,
            ..AuditEntry::default()
        });
    }

    /// Record an approval lifecycle transition.
    pub fn log_approval_event(
        &self,
        pack_id: &str,
        action: &str,
        success: bool,
        previous_status: Option<&str>,
        new_status: Option<&str>,
        reason: Option<&str>,
    ) {
        let mut details = Map::new();
        if let Some(prev) = previous_status {
            details.insert("previous_status".into(), Value::String(prev.into()));
        }
        if let Some(next) = new_status {
            details.insert("new_status".into(), Value::String(next.into()));
        }
        if let Some(reason) = reason {
            details.insert("reason".into(), Value::String(reason.into()));
        }
        self.log(AuditEntry {
            ts: now_ts(),
            category: AuditCategory::Approval,
            severity: if success {
                AuditSeverity::Info
            } else {
                AuditSeverity::Error
            },
            action: format!("approval_{action}"),
            success,
            owner_pack: Some(pack_id.to_string()),
            details,
            ..AuditEntry::default()
        });
    }

    /// Record a flow run outcome.
    pub fn log_flow_execution(
        &self,
        flow_id: &str,
        success: bool,
        execution_time_ms: f64,
        error: Option<String>,
    ) {
        let mut details = Map::new();
        details.insert("execution_time_ms".into(), Value::from(execution_time_ms));
        self.log(AuditEntry {
            ts: now_ts(),
            category: AuditCategory::FlowExecution,
            severity: if success {
                AuditSeverity::Info
            } else {
                AuditSeverity::Error
            },
            action: "execute_flow".into(),
            success,
            flow_id: Some(flow_id.to_string()),
            error,
            details,
            ..AuditEntry::default()
        });
    }

    // -- Query / maintenance --------------------------------------------

    /// Search the journal. Flushes first so fresh entries are visible.
    pub fn query(&self, query: &AuditQuery) -> Vec<Value> {
        self.flush();
        query::run_query(&self.audit_dir, query)
    }

    /// Per-category success/failure counts for one day.
    pub fn summary(&self, category: Option<AuditCategory>, date: Option<&str>) -> Value {
        self.flush();
        query::summarize(&self.audit_dir, category, date)
    }

    /// Delete journal files older than `days_to_keep`. Returns the count.
    pub fn cleanup_old_logs(&self, days_to_keep: i64) -> usize {
        let cutoff = (chrono::Utc::now() - chrono::Duration::days(days_to_keep))
            .format("%Y-%m-%d")
            .to_string();
        let mut deleted = 0;
        let Ok(read_dir) = std::fs::read_dir(&self.audit_dir) else {
            return 0;
        };
        for entry in read_dir.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(date) = query::extract_date_from_filename(&name) {
                if date < cutoff && std::fs::remove_file(entry.path()).is_ok() {
                    deleted += 1;
                }
            }
        }
        deleted
    }

    /// Directory this logger writes into.
    pub fn audit_dir(&self) -> &Path {
        &self.audit_dir
    }
}

impl Drop for AuditLogger {
    fn drop(&mut self) {
        if let Ok(mut buffer) = self.buffer.lock() {
            self.flush_locked(&mut buffer);
        }
    }
}

fn append_entries(file: &Path, entries: &[&AuditEntry]) -> std::io::Result<()> {
    let mut f = std::fs::OpenOptions::new().create(true).append(true).open(file)?;
    for entry in entries {
        let line = serde_json::to_string(entry).map_err(std::io::Error::other)?;
        f.write_all(line.as_bytes())?;
        f.write_all(b"\n")?;
    }
    Ok(())
}

/// `YYYY-MM-DD` from an ISO-8601 timestamp; today if unparseable.
fn extract_date_from_ts(ts: &str) -> String {
    if ts.len() >= 10 {
        let candidate = &ts[..10];
        let bytes = candidate.as_bytes();
        if bytes[4] == b'-'
            && bytes[7] == b'-'
            && candidate[..4].parse::<u16>().is_ok()
            && candidate[5..7].parse::<u8>().is_ok()
            && candidate[8..10].parse::<u8>().is_ok()
        {
            return candidate.to_string();
        }
    }
    chrono::Utc::now().format("%Y-%m-%d").to_string()
}
