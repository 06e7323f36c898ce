// SPDX-License-Identifier: MIT OR Apache-2.0
//! Audit entry shape.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Journal category; one file family per category per day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    /// Flow orchestrator runs.
    FlowExecution,
    /// Direct script execution by the executors.
    PythonFileCall,
    /// Pack approval lifecycle.
    Approval,
    /// Grant checks and mutations, capability/unit execution decisions.
    Permission,
    /// Egress allow/deny decisions.
    Network,
    /// Tamper detection and policy violations.
    Security,
    /// Store/secret/system mutations.
    System,
}

impl AuditCategory {
    /// Stable snake_case name used in journal filenames.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FlowExecution => "flow_execution",
            Self::PythonFileCall => "python_file_call",
            Self::Approval => "approval",
            Self::Permission => "permission",
            Self::Network => "network",
            Self::Security => "security",
            Self::System => "system",
        }
    }

    /// All categories, for summaries.
    pub fn all() -> &'static [AuditCategory] {
        &[
            Self::FlowExecution,
            Self::PythonFileCall,
            Self::Approval,
            Self::Permission,
            Self::Network,
            Self::Security,
            Self::System,
        ]
    }
}

/// Entry severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    /// Routine success.
    Info,
    /// Denials and recoverable problems.
    Warning,
    /// Failures.
    Error,
    /// Tampering and security-relevant faults.
    Critical,
}

/// One audit journal entry. Optional context fields are omitted from the
/// serialized form when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Entry timestamp (UTC ISO-8601 `Z`); also selects the journal file.
    pub ts: String,
    /// Journal category.
    pub category: AuditCategory,
    /// Severity.
    pub severity: AuditSeverity,
    /// What happened (e.g. `permission_execute`, `store_created`).
    pub action: String,
    /// Whether the operation succeeded / was allowed.
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_pack: Option<String>,

    /// Free-form structured context.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub details: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_mode: Option<String>,
}

impl Default for AuditEntry {
    fn default() -> Self {
        Self {
            ts: String::new(),
            category: AuditCategory::System,
            severity: AuditSeverity::Info,
            action: String::new(),
            success: false,
            flow_id: None,
            step_id: None,
            owner_pack: None,
            details: Map::new(),
            error: None,
            error_type: None,
            rejection_reason: None,
            execution_mode: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_names_match_filenames() {
        assert_eq!(AuditCategory::FlowExecution.as_str(), "flow_execution");
        assert_eq!(AuditCategory::Network.as_str(), "network");
        for cat in AuditCategory::all() {
            let json = serde_json::to_string(cat).unwrap();
            assert_eq!(json, format!("\"{}\"", cat.as_str()));
        }
    }

    #[test]
    fn severity_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&AuditSeverity::Critical).unwrap(), "\"critical\"");
    }
}
