// SPDX-License-Identifier: MIT OR Apache-2.0
//! Journal search and summaries.
//!
//! Files are named `<category>_<YYYY-MM-DD>.jsonl`; the date filter is
//! applied to the filename before any file is opened.

use crate::entry::AuditCategory;
use serde_json::Value;
use std::path::Path;

/// Filter set for [`crate::AuditLogger::query`].
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    /// Restrict to one category; `None` scans every journal file.
    pub category: Option<AuditCategory>,
    /// Inclusive start date (`YYYY-MM-DD`).
    pub start_date: Option<String>,
    /// Inclusive end date (`YYYY-MM-DD`).
    pub end_date: Option<String>,
    /// Match on `owner_pack`.
    pub pack_id: Option<String>,
    /// Match on `flow_id`.
    pub flow_id: Option<String>,
    /// `Some(true)` = successes only, `Some(false)` = failures only.
    pub success: Option<bool>,
    /// Maximum entries returned.
    pub limit: usize,
}

impl AuditQuery {
    /// Empty filter with the default limit of 1000 entries.
    pub fn new() -> Self {
        Self {
            limit: 1000,
            ..Self::default()
        }
    }
}

pub(crate) fn run_query(audit_dir: &Path, query: &AuditQuery) -> Vec<Value> {
    let limit = if query.limit == 0 { 1000 } else { query.limit };
    let mut results = Vec::new();

    let mut files: Vec<_> = match std::fs::read_dir(audit_dir) {
        Ok(read_dir) => read_dir
            .flatten()
            .filter(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                if !name.ends_with(".jsonl") {
                    return false;
                }
                if let Some(cat) = query.category {
                    if !name.starts_with(&format!("{}_", cat.as_str())) {
                        return false;
                    }
                }
                match extract_date_from_filename(&name) {
                    Some(date) => {
                        if let Some(start) = &query.start_date {
                            if &date < start {
                                return false;
                            }
                        }
                        if let Some(end) = &query.end_date {
                            if &date > end {
                                return false;
                            }
                        }
                        true
                    }
                    None => false,
                }
            })
            .map(|e| e.path())
            .collect(),
        Err(_) => return results,
    };
    // Newest files first.
    files.sort();
    files.reverse();

    'files: for file in files {
        let Ok(content) = std::fs::read_to_string(&file) else {
            tracing::warn!(file = %file.display(), "failed to read audit file");
            continue;
        };
        for line in content.lines() {
            if results.len() >= limit {
                break 'files;
            }
            let Ok(entry) = serde_json::from_str::<Value>(line) else {
                continue;
            };
            if let Some(pack_id) = &query.pack_id {
                if entry.get("owner_pack").and_then(Value::as_str) != Some(pack_id) {
                    continue;
                }
            }
            if let Some(flow_id) = &query.flow_id {
                if entry.get("flow_id").and_then(Value::as_str) != Some(flow_id) {
                    continue;
                }
            }
            if let Some(success) = query.success {
                if entry.get("success").and_then(Value::as_bool) != Some(success) {
                    continue;
                }
            }
            results.push(entry);
        }
    }

    results
}

pub(crate) fn summarize(
    audit_dir: &Path,
    category: Option<AuditCategory>,
    date: Option<&str>,
) -> Value {
    let date = date
        .map(str::to_string)
        .unwrap_or_else(|| chrono::Utc::now().format("%Y-%m-%d").to_string());

    let categories: Vec<AuditCategory> = match category {
        Some(cat) => vec![cat],
        None => AuditCategory::all().to_vec(),
    };

    let mut total = (0u64, 0u64, 0u64);
    let mut per_category = serde_json::Map::new();

    for cat in categories {
        let file = audit_dir.join(format!("{}_{date}.jsonl", cat.as_str()));
        let mut counts = (0u64, 0u64, 0u64);
        if let Ok(content) = std::fs::read_to_string(&file) {
            for line in content.lines() {
                let Ok(entry) = serde_json::from_str::<Value>(line) else {
                    continue;
                };
                counts.0 += 1;
                if entry.get("success").and_then(Value::as_bool) == Some(true) {
                    counts.1 += 1;
                } else {
                    counts.2 += 1;
                }
            }
        }
        total.0 += counts.0;
        total.1 += counts.1;
        total.2 += counts.2;
        per_category.insert(
            cat.as_str().to_string(),
            serde_json::json!({
                "total": counts.0,
                "success": counts.1,
                "failure": counts.2,
            }),
        );
    }

    serde_json::json!({
        "date": date,
        "categories": per_category,
        "total_entries": total.0,
        "total_success": total.1,
        "total_failure": total.2,
    })
}

/// Parse the `YYYY-MM-DD` suffix out of `<category>_<date>.jsonl`.
pub(crate) fn extract_date_from_filename(filename: &str) -> Option<String> {
    let stem = filename.strip_suffix(".jsonl")?;
    let (_, date) = stem.rsplit_once('_')?;
    let bytes = date.as_bytes();
    if date.len() == 10 && bytes[4] == b'-' && bytes[7] == b'-' {
        Some(date.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AuditEntry, AuditLogger, AuditSeverity};
    use serde_json::Map;

    #[test]
    fn filename_date_extraction() {
        assert_eq!(
            extract_date_from_filename("flow_execution_2024-01-31.jsonl").as_deref(),
            Some("2024-01-31")
        );
        assert_eq!(extract_date_from_filename("system.jsonl"), None);
        assert_eq!(extract_date_from_filename("system_notadate.jsonl"), None);
    }

    #[test]
    fn query_filters_by_category_pack_and_success() {
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLogger::new(dir.path());
        audit.log_permission_event("acme", "capability", "execute", true, Map::new(), None);
        audit.log_permission_event("acme", "capability", "execute", false, Map::new(), Some("no".into()));
        audit.log_permission_event("other", "capability", "execute", true, Map::new(), None);
        audit.log_system_event("unrelated", true, Map::new(), None);

        let results = audit.query(&AuditQuery {
            category: Some(AuditCategory::Permission),
            pack_id: Some("acme".into()),
            success: Some(false),
            ..AuditQuery::new()
        });
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["rejection_reason"], "no");
    }

    #[test]
    fn query_respects_date_range_and_limit() {
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLogger::new(dir.path());
        for (ts, action) in [
            ("2024-01-01T00:00:00Z", "old"),
            ("2024-06-01T00:00:00Z", "mid"),
            ("2024-12-01T00:00:00Z", "new"),
        ] {
            audit.log(AuditEntry {
                ts: ts.into(),
                category: AuditCategory::System,
                severity: AuditSeverity::Info,
                action: action.into(),
                success: true,
                ..AuditEntry::default()
            });
        }

        let results = audit.query(&AuditQuery {
            start_date: Some("2024-02-01".into()),
            end_date: Some("2024-11-30".into()),
            ..AuditQuery::new()
        });
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["action"], "mid");

        let limited = audit.query(&AuditQuery {
            limit: 2,
            ..AuditQuery::new()
        });
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn summary_counts_success_and_failure() {
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLogger::new(dir.path());
        audit.log_system_event("a", true, Map::new(), None);
        audit.log_system_event("b", false, Map::new(), Some("boom".into()));

        let summary = audit.summary(Some(AuditCategory::System), None);
        assert_eq!(summary["total_entries"], 2);
        assert_eq!(summary["total_success"], 1);
        assert_eq!(summary["categories"]["system"]["failure"], 1);
    }
}
