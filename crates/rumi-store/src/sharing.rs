// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cross-pack store sharing.
//!
//! A provider pack shares one of its stores with a consumer pack through an
//! explicit approve/revoke pair. The whole index is HMAC-signed; a file
//! whose signature fails verification contributes nothing (the sharing set
//! loads empty) and the event is logged critical.

use rumi_audit::{AuditLogger, AuditSeverity};
use rumi_core::signing::{compute_data_hmac, verify_data_hmac};
use rumi_core::{now_ts, ErrorKind, KernelError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// One approved (provider, consumer, store) triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharingEntry {
    pub provider_pack_id: String,
    pub consumer_pack_id: String,
    pub store_id: String,
    pub approved_at: String,
    pub approved_by: String,
}

impl SharingEntry {
    fn key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.provider_pack_id, self.consumer_pack_id, self.store_id
        )
    }
}

/// HMAC-signed sharing index at `stores/sharing.json`.
pub struct SharingManager {
    index_path: PathBuf,
    signing_key: Vec<u8>,
    require_hmac: bool,
    audit: Arc<AuditLogger>,
    entries: Mutex<BTreeMap<String, SharingEntry>>,
}

impl SharingManager {
    /// Load the sharing index. `signing_key` usually comes from
    /// `rumi_core::signing::generate_or_load_signing_key`.
    pub fn new(
        index_path: impl Into<PathBuf>,
        signing_key: Vec<u8>,
        require_hmac: bool,
        audit: Arc<AuditLogger>,
    ) -> Self {
        let manager = Self {
            index_path: index_path.into(),
            signing_key,
            require_hmac,
            audit,
            entries: Mutex::new(BTreeMap::new()),
        };
        manager.load();
        manager
    }

    fn load(&self) {
        let Ok(raw) = std::fs::read_to_string(&self.index_path) else {
            return;
        };
        let Ok(Value::Object(mut data)) = serde_json::from_str::<Value>(&raw) else {
            tracing::warn!(path = %self.index_path.display(), "sharing index is not a JSON object");
            return;
        };

        let stored_sig = data
            .remove("_hmac_signature")
            .and_then(|v| v.as_str().map(str::to_string));
        match stored_sig {
            Some(sig) => {
                if !verify_data_hmac(&self.signing_key, &data, &sig) {
                    tracing::error!("sharing index HMAC verification failed");
                    self.audit.log_security_event(
                        "store_sharing_tampered",
                        AuditSeverity::Critical,
                        "Sharing index HMAC verification failed; sharing set cleared",
                        None,
                        Map::new(),
                    );
                    return;
                }
            }
            None => {
                if self.require_hmac {
                    tracing::error!("sharing index has no HMAC signature and RUMI_REQUIRE_HMAC=1");
                    self.audit.log_security_event(
                        "store_sharing_unsigned_rejected",
                        AuditSeverity::Critical,
                        "Unsigned legacy sharing index rejected by policy",
                        None,
                        Map::new(),
                    );
                    return;
                }
                tracing::warn!(
                    "sharing index has no HMAC signature (legacy file); \
                     signature will be added on next save"
                );
            }
        }

        let mut entries = self.entries.lock().expect("sharing lock");
        if let Some(Value::Object(raw_entries)) = data.get("entries") {
            for (key, raw) in raw_entries {
                match serde_json::from_value::<SharingEntry>(raw.clone()) {
                    Ok(entry) => {
                        entries.insert(key.clone(), entry);
                    }
                    Err(e) => tracing::warn!(key, error = %e, "skipped invalid sharing entry"),
                }
            }
        }
    }

    fn save(&self, entries: &BTreeMap<String, SharingEntry>) -> Result<(), KernelError> {
        let mut data = Map::new();
        data.insert("version".into(), json!("1.0"));
        data.insert("updated_at".into(), json!(now_ts()));
        data.insert(
            "entries".into(),
            Value::Object(
                entries
                    .iter()
                    .map(|(k, e)| (k.clone(), serde_json::to_value(e).expect("entry serializes")))
                    .collect(),
            ),
        );
        let signature = compute_data_hmac(&self.signing_key, &data);
        data.insert("_hmac_signature".into(), json!(signature));
        rumi_core::paths::atomic_write_json(&self.index_path, &Value::Object(data), 0o600)
    }

    /// Approve sharing of `store_id` from provider to consumer.
    pub fn approve_sharing(
        &self,
        provider_pack_id: &str,
        consumer_pack_id: &str,
        store_id: &str,
        approved_by: &str,
    ) -> Result<(), KernelError> {
        if provider_pack_id.is_empty() || consumer_pack_id.is_empty() || store_id.is_empty() {
            return Err(KernelError::new(
                ErrorKind::InvalidRequest,
                "provider_pack_id, consumer_pack_id, and store_id are required",
            ));
        }
        if provider_pack_id == consumer_pack_id {
            return Err(KernelError::new(
                ErrorKind::InvalidRequest,
                "provider and consumer must be different packs",
            ));
        }

        let entry = SharingEntry {
            provider_pack_id: provider_pack_id.to_string(),
            consumer_pack_id: consumer_pack_id.to_string(),
            store_id: store_id.to_string(),
            approved_at: now_ts(),
            approved_by: approved_by.to_string(),
        };

        {
            let mut entries = self.entries.lock().expect("sharing lock");
            entries.insert(entry.key(), entry.clone());
            self.save(&entries)?;
        }

        self.audit.log_system_event(
            "store_sharing_approved",
            true,
            serde_json::to_value(&entry)
                .ok()
                .and_then(|v| v.as_object().cloned())
                .unwrap_or_default(),
            None,
        );
        Ok(())
    }

    /// Revoke a previously approved triple.
    pub fn revoke_sharing(
        &self,
        provider_pack_id: &str,
        consumer_pack_id: &str,
        store_id: &str,
    ) -> Result<(), KernelError> {
        let key = format!("{provider_pack_id}:{consumer_pack_id}:{store_id}");
        {
            let mut entries = self.entries.lock().expect("sharing lock");
            if entries.remove(&key).is_none() {
                return Err(KernelError::new(
                    ErrorKind::InvalidRequest,
                    format!("No sharing entry found for {key}"),
                ));
            }
            self.save(&entries)?;
        }

        let mut details = Map::new();
        details.insert("provider_pack_id".into(), json!(provider_pack_id));
        details.insert("consumer_pack_id".into(), json!(consumer_pack_id));
        details.insert("store_id".into(), json!(store_id));
        self.audit
            .log_system_event("store_sharing_revoked", true, details, None);
        Ok(())
    }

    /// Every approved entry.
    pub fn list_shared_stores(&self) -> Vec<SharingEntry> {
        self.entries
            .lock()
            .expect("sharing lock")
            .values()
            .cloned()
            .collect()
    }

    /// Whether some provider shared `store_id` with `consumer_pack_id`.
    pub fn is_sharing_approved(&self, consumer_pack_id: &str, store_id: &str) -> bool {
        self.entries
            .lock()
            .expect("sharing lock")
            .values()
            .any(|e| e.consumer_pack_id == consumer_pack_id && e.store_id == store_id)
    }
}
