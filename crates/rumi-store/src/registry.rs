// SPDX-License-Identifier: MIT OR Apache-2.0
//! Store registry: SQLite-backed key/value namespaces with CAS.
//!
//! Two tables: `stores` (definitions) and `store_data` (rows keyed by
//! `(store_id, key)` holding canonical-JSON values plus their SHA-256).
//! CAS runs inside `BEGIN IMMEDIATE` so the pre-image read and the write
//! are atomic per key; a lock wait past `busy_timeout` surfaces as a
//! `timeout` error, never as a partial write.

use crate::expectation::Expectation;
use crate::sharing::SharingManager;
use rumi_audit::AuditLogger;
use rumi_core::{now_ts, value_hash, ErrorKind, KernelError};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Largest canonical value accepted by [`StoreRegistry::cas`].
pub const MAX_VALUE_BYTES_CAS: usize = 1024 * 1024;
/// Most keys accepted by one [`StoreRegistry::batch_get`].
pub const MAX_BATCH_KEYS: usize = 100;
/// Cumulative response budget for a batch read.
pub const MAX_BATCH_RESPONSE_BYTES: usize = 900 * 1024;
/// Stores a single pack may declare.
pub const MAX_STORES_PER_PACK: usize = 10;

fn valid_store_id(store_id: &str) -> bool {
    !store_id.is_empty()
        && store_id.len() <= 128
        && store_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn valid_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= 512
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '/' | '.' | ':' | '-'))
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// A registered store.
#[derive(Debug, Clone, Serialize)]
pub struct StoreDefinition {
    pub store_id: String,
    pub root_path: String,
    pub created_at: String,
    pub created_by: String,
}

/// Outcome of a CAS attempt that reached the compare step.
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    /// The swap (or insert) committed.
    Success,
    /// Pre-image mismatch. `current_value` is `None` when the key does not
    /// exist, `Some(Value::Null)` when it holds stored JSON null.
    Conflict { current_value: Option<Value> },
}

/// Result of [`StoreRegistry::list_keys`].
#[derive(Debug, Clone, Serialize)]
pub struct ListKeysResult {
    pub keys: Vec<String>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
    pub total_estimate: i64,
}

/// Result of [`StoreRegistry::batch_get`].
#[derive(Debug, Clone, Serialize)]
pub struct BatchGetResult {
    pub results: Map<String, Value>,
    pub found: usize,
    pub not_found: usize,
    pub truncated: usize,
    pub warnings: Vec<String>,
}

/// Per-declaration outcome of [`StoreRegistry::create_stores_for_pack`].
#[derive(Debug, Clone, Serialize)]
pub struct PackStoreResult {
    pub store_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// StoreRegistry
// ---------------------------------------------------------------------------

/// SQLite-backed store registry.
pub struct StoreRegistry {
    db_path: PathBuf,
    stores_base: PathBuf,
    conn: Mutex<Option<Connection>>,
    audit: Arc<AuditLogger>,
}

impl StoreRegistry {
    /// Open the registry at `db_path`, rooting all store directories under
    /// `stores_base`. Removes stale migration temp files and, when the DB
    /// is absent but a legacy `index.json` exists, migrates it first.
    pub fn new(
        db_path: impl Into<PathBuf>,
        stores_base: impl Into<PathBuf>,
        audit: Arc<AuditLogger>,
    ) -> Result<Self, KernelError> {
        let db_path = db_path.into();
        let stores_base = stores_base.into();
        std::fs::create_dir_all(&stores_base)?;

        crate::migration::cleanup_stale_tmp(&db_path);
        let legacy_index = stores_base.join("index.json");
        if !db_path.exists() && legacy_index.exists() {
            crate::migration::migrate_json_to_sqlite(&db_path, &legacy_index)?;
        }

        let registry = Self {
            db_path,
            stores_base,
            conn: Mutex::new(None),
            audit,
        };
        registry.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS stores (
                    store_id   TEXT PRIMARY KEY,
                    root_path  TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    created_by TEXT NOT NULL DEFAULT ''
                );
                CREATE TABLE IF NOT EXISTS store_data (
                    store_id   TEXT NOT NULL
                        REFERENCES stores(store_id) ON DELETE CASCADE,
                    key        TEXT NOT NULL,
                    value      TEXT NOT NULL,
                    value_hash TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (store_id, key)
                );
                PRAGMA user_version = 1;",
            )
            .map_err(db_err)
        })?;
        Ok(registry)
    }

    /// Close the underlying connection. A later call reopens lazily.
    pub fn close(&self) {
        let mut guard = self.conn.lock().expect("store conn lock");
        if let Some(conn) = guard.take() {
            let _ = conn.close();
        }
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, KernelError>,
    ) -> Result<T, KernelError> {
        let mut guard: MutexGuard<'_, Option<Connection>> =
            self.conn.lock().expect("store conn lock");
        if guard.is_none() {
            *guard = Some(crate::migration::open_with_pragmas(&self.db_path)?);
        }
        f(guard.as_mut().expect("connection present"))
    }

    // -- Store CRUD ------------------------------------------------------

    /// Register a store. `root_path` defaults to `<stores_base>/<store_id>`
    /// and must resolve beneath the stores base (`..` forbidden).
    pub fn create_store(
        &self,
        store_id: &str,
        root_path: Option<&str>,
        created_by: &str,
    ) -> Result<StoreDefinition, KernelError> {
        if !valid_store_id(store_id) {
            return Err(KernelError::new(
                ErrorKind::InvalidRequest,
                "store_id must match ^[A-Za-z0-9_-]{1,128}$",
            ));
        }

        let default_root = self.stores_base.join(store_id);
        let root = match root_path {
            Some(raw) => PathBuf::from(raw),
            None => default_root,
        };
        self.validate_store_path(&root)?;
        std::fs::create_dir_all(&root)?;
        let resolved_root = root
            .canonicalize()
            .map_err(|e| KernelError::internal(format!("resolve root_path: {e}")))?;

        let now = now_ts();
        let inserted = self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO stores (store_id, root_path, created_at, created_by)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![store_id, resolved_root.to_string_lossy(), now, created_by],
            )
            .map_err(db_err)
        })?;

        if inserted == 0 {
            return Err(KernelError::new(
                ErrorKind::StoreAlreadyExists,
                format!("Store already exists: {store_id}"),
            ));
        }

        self.audit.log_system_event(
            "store_created",
            true,
            details(&[
                ("store_id", json!(store_id)),
                ("root_path", json!(resolved_root.to_string_lossy())),
            ]),
            None,
        );
        Ok(StoreDefinition {
            store_id: store_id.to_string(),
            root_path: resolved_root.to_string_lossy().into_owned(),
            created_at: now,
            created_by: created_by.to_string(),
        })
    }

    fn validate_store_path(&self, root: &Path) -> Result<(), KernelError> {
        if root.to_string_lossy().contains("..") {
            return Err(KernelError::new(
                ErrorKind::PathTraversal,
                "root_path must not contain '..'",
            ));
        }
        if !rumi_core::paths::is_path_within(root, &self.stores_base) {
            return Err(KernelError::new(
                ErrorKind::PathTraversal,
                format!("root_path must be under {}", self.stores_base.display()),
            ));
        }
        Ok(())
    }

    /// Look up one store definition.
    pub fn get_store(&self, store_id: &str) -> Result<Option<StoreDefinition>, KernelError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT store_id, root_path, created_at, created_by
                 FROM stores WHERE store_id = ?1",
                [store_id],
                |row| {
                    Ok(StoreDefinition {
                        store_id: row.get(0)?,
                        root_path: row.get(1)?,
                        created_at: row.get(2)?,
                        created_by: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(db_err)
        })
    }

    /// All registered stores.
    pub fn list_stores(&self) -> Result<Vec<StoreDefinition>, KernelError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT store_id, root_path, created_at, created_by FROM stores ORDER BY store_id")
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(StoreDefinition {
                        store_id: row.get(0)?,
                        root_path: row.get(1)?,
                        created_at: row.get(2)?,
                        created_by: row.get(3)?,
                    })
                })
                .map_err(db_err)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
        })
    }

    /// Delete a store. The DB row (and, via cascade, its data) goes first;
    /// only then are files removed, so a failure can never leave the DB
    /// referencing a missing directory.
    pub fn delete_store(&self, store_id: &str, delete_files: bool) -> Result<(), KernelError> {
        let Some(store) = self.get_store(store_id)? else {
            return Err(KernelError::new(
                ErrorKind::StoreNotFound,
                format!("Store not found: {store_id}"),
            ));
        };
        self.validate_store_path(Path::new(&store.root_path))?;

        self.with_conn(|conn| {
            conn.execute("DELETE FROM stores WHERE store_id = ?1", [store_id])
                .map_err(db_err)
        })?;

        if delete_files {
            let root = PathBuf::from(&store.root_path);
            if root.exists() {
                if let Err(e) = std::fs::remove_dir_all(&root) {
                    tracing::warn!(store_id, error = %e, "DB deleted but file cleanup failed");
                }
            }
        }

        self.audit.log_system_event(
            "store_deleted",
            true,
            details(&[("store_id", json!(store_id)), ("delete_files", json!(delete_files))]),
            None,
        );
        Ok(())
    }

    // -- Access policy ---------------------------------------------------

    /// Whether `pack_id` may touch `store_id`: either the grant config
    /// listed it in `allowed_store_ids`, or a sharing entry approves the
    /// (consumer, store) pair.
    pub fn is_store_accessible(
        &self,
        store_id: &str,
        pack_id: &str,
        allowed_store_ids: Option<&[String]>,
        sharing: &SharingManager,
    ) -> bool {
        if let Some(allowed) = allowed_store_ids {
            if allowed.iter().any(|s| s == store_id) {
                return true;
            }
        }
        sharing.is_sharing_approved(pack_id, store_id)
    }

    /// Create the stores a pack declares, forcing the `<pack_id>__` prefix.
    /// Existing stores count as success.
    pub fn create_stores_for_pack(
        &self,
        pack_id: &str,
        declared_store_ids: &[String],
    ) -> Vec<PackStoreResult> {
        if declared_store_ids.len() > MAX_STORES_PER_PACK {
            return vec![PackStoreResult {
                store_id: String::new(),
                success: false,
                error: Some(format!(
                    "Too many stores declared ({}). Maximum is {MAX_STORES_PER_PACK} per pack.",
                    declared_store_ids.len()
                )),
            }];
        }

        let prefix = format!("{pack_id}__");
        declared_store_ids
            .iter()
            .map(|raw| {
                let qualified = if raw.starts_with(&prefix) {
                    raw.clone()
                } else {
                    format!("{prefix}{raw}")
                };
                if !valid_store_id(&qualified) {
                    return PackStoreResult {
                        store_id: qualified,
                        success: false,
                        error: Some("qualified store_id must match ^[A-Za-z0-9_-]{1,128}$".into()),
                    };
                }
                match self.get_store(&qualified) {
                    Ok(Some(_)) => PackStoreResult {
                        store_id: qualified,
                        success: true,
                        error: None,
                    },
                    _ => match self.create_store(&qualified, None, &format!("pack:{pack_id}")) {
                        Ok(_) => PackStoreResult {
                            store_id: qualified,
                            success: true,
                            error: None,
                        },
                        Err(e) => PackStoreResult {
                            store_id: qualified,
                            success: false,
                            error: Some(e.to_string()),
                        },
                    },
                }
            })
            .collect()
    }

    // -- CAS -------------------------------------------------------------

    /// Compare-and-swap `key` in `store_id`.
    ///
    /// The pre-image comparison is by SHA-256 of the canonical JSON form,
    /// so key order in the expected value is irrelevant.
    pub fn cas(
        &self,
        store_id: &str,
        key: &str,
        expected: Expectation,
        new_value: &Value,
    ) -> Result<CasOutcome, KernelError> {
        if !valid_key(key) {
            return Err(KernelError::new(
                ErrorKind::InvalidRequest,
                "key must match ^[A-Za-z0-9_/.:-]{1,512}$",
            ));
        }
        if self.get_store(store_id)?.is_none() {
            return Err(KernelError::new(
                ErrorKind::StoreNotFound,
                format!("Store not found: {store_id}"),
            ));
        }

        let new_canonical = rumi_core::canonical_json(new_value);
        if new_canonical.len() > MAX_VALUE_BYTES_CAS {
            return Err(KernelError::new(
                ErrorKind::PayloadTooLarge,
                format!("Value too large (max {MAX_VALUE_BYTES_CAS} bytes)"),
            ));
        }
        let new_hash = value_hash(new_value);
        let now = now_ts();

        self.with_conn(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| match &e {
                    rusqlite::Error::SqliteFailure(err, _)
                        if err.code == rusqlite::ErrorCode::DatabaseBusy
                            || err.code == rusqlite::ErrorCode::DatabaseLocked =>
                    {
                        KernelError::new(ErrorKind::Timeout, format!("CAS lock timeout: {e}"))
                    }
                    _ => db_err(e),
                })?;

            let row: Option<(String, String)> = tx
                .query_row(
                    "SELECT value, value_hash FROM store_data
                     WHERE store_id = ?1 AND key = ?2",
                    [store_id, key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(db_err)?;

            match (row, &expected) {
                (None, Expectation::Missing) => {
                    tx.execute(
                        "INSERT INTO store_data (store_id, key, value, value_hash, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        rusqlite::params![store_id, key, new_canonical, new_hash, now],
                    )
                    .map_err(db_err)?;
                    tx.commit().map_err(db_err)?;
                    Ok(CasOutcome::Success)
                }
                (None, Expectation::Value(_)) => {
                    // Dropping the transaction rolls back.
                    Ok(CasOutcome::Conflict {
                        current_value: None,
                    })
                }
                (Some((current_json, _)), Expectation::Missing) => Ok(CasOutcome::Conflict {
                    current_value: Some(parse_stored(&current_json)),
                }),
                (Some((current_json, current_hash)), Expectation::Value(expected_value)) => {
                    if current_hash != value_hash(expected_value) {
                        return Ok(CasOutcome::Conflict {
                            current_value: Some(parse_stored(&current_json)),
                        });
                    }
                    tx.execute(
                        "UPDATE store_data SET value = ?3, value_hash = ?4, updated_at = ?5
                         WHERE store_id = ?1 AND key = ?2",
                        rusqlite::params![store_id, key, new_canonical, new_hash, now],
                    )
                    .map_err(db_err)?;
                    tx.commit().map_err(db_err)?;
                    Ok(CasOutcome::Success)
                }
            }
        })
    }

    /// CAS convenience: create `key` only when it does not exist yet.
    pub fn insert_if_absent(
        &self,
        store_id: &str,
        key: &str,
        value: &Value,
    ) -> Result<CasOutcome, KernelError> {
        self.cas(store_id, key, Expectation::Missing, value)
    }

    // -- Listing ---------------------------------------------------------

    /// Enumerate keys with an optional prefix filter and keyset pagination.
    /// Without `limit` and `cursor` every key is returned.
    pub fn list_keys(
        &self,
        store_id: &str,
        prefix: &str,
        limit: Option<usize>,
        cursor: Option<&str>,
    ) -> Result<ListKeysResult, KernelError> {
        if !prefix.is_empty() && !valid_key(prefix) {
            return Err(KernelError::new(
                ErrorKind::InvalidRequest,
                "prefix must match ^[A-Za-z0-9_/.:-]{1,512}$",
            ));
        }
        if self.get_store(store_id)?.is_none() {
            return Err(KernelError::new(
                ErrorKind::StoreNotFound,
                format!("Store not found: {store_id}"),
            ));
        }

        self.with_conn(|conn| {
            let mut conditions = vec!["store_id = ?".to_string()];
            let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(store_id.to_string())];
            if !prefix.is_empty() {
                conditions.push("key >= ?".into());
                params.push(Box::new(prefix.to_string()));
                conditions.push("key < ?".into());
                params.push(Box::new(format!("{prefix}\u{ffff}")));
            }
            let where_clause = conditions.join(" AND ");

            let total_estimate: i64 = conn
                .query_row(
                    &format!("SELECT COUNT(*) FROM store_data WHERE {where_clause}"),
                    rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
                    |row| row.get(0),
                )
                .map_err(db_err)?;

            if limit.is_none() && cursor.is_none() {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT key FROM store_data WHERE {where_clause} ORDER BY key"
                    ))
                    .map_err(db_err)?;
                let keys = stmt
                    .query_map(
                        rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
                        |row| row.get::<_, String>(0),
                    )
                    .map_err(db_err)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(db_err)?;
                return Ok(ListKeysResult {
                    keys,
                    next_cursor: None,
                    has_more: false,
                    total_estimate,
                });
            }

            let limit = limit.unwrap_or(100).clamp(1, 1000);
            if let Some(cursor) = cursor {
                conditions.push("key > ?".into());
                params.push(Box::new(cursor.to_string()));
            }
            let page_where = conditions.join(" AND ");

            let mut stmt = conn
                .prepare(&format!(
                    "SELECT key FROM store_data WHERE {page_where} ORDER BY key LIMIT {}",
                    limit + 1
                ))
                .map_err(db_err)?;
            let mut keys = stmt
                .query_map(
                    rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
                    |row| row.get::<_, String>(0),
                )
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;

            let has_more = keys.len() > limit;
            if has_more {
                keys.truncate(limit);
            }
            let next_cursor = if has_more { keys.last().cloned() } else { None };

            Ok(ListKeysResult {
                keys,
                next_cursor,
                has_more,
                total_estimate,
            })
        })
    }

    // -- Batch get -------------------------------------------------------

    /// Fetch up to [`MAX_BATCH_KEYS`] keys in one query. The response is
    /// capped at [`MAX_BATCH_RESPONSE_BYTES`] cumulative; keys past the cap
    /// come back as null with a warning.
    pub fn batch_get(&self, store_id: &str, keys: &[String]) -> Result<BatchGetResult, KernelError> {
        if keys.is_empty() {
            return Err(KernelError::new(ErrorKind::InvalidRequest, "keys is required"));
        }
        if keys.len() > MAX_BATCH_KEYS {
            return Err(KernelError::new(
                ErrorKind::InvalidRequest,
                format!("Too many keys ({}). Maximum is {MAX_BATCH_KEYS}.", keys.len()),
            ));
        }
        if self.get_store(store_id)?.is_none() {
            return Err(KernelError::new(
                ErrorKind::StoreNotFound,
                format!("Store not found: {store_id}"),
            ));
        }

        let valid_keys: Vec<&String> = keys.iter().filter(|k| valid_key(k)).collect();
        let fetched: std::collections::HashMap<String, String> = if valid_keys.is_empty() {
            Default::default()
        } else {
            self.with_conn(|conn| {
                let placeholders = vec!["?"; valid_keys.len()].join(",");
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT key, value FROM store_data
                         WHERE store_id = ? AND key IN ({placeholders})"
                    ))
                    .map_err(db_err)?;
                let mut params: Vec<&dyn rusqlite::ToSql> = vec![&store_id];
                for k in &valid_keys {
                    params.push(*k);
                }
                let rows = stmt
                    .query_map(params.as_slice(), |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                    })
                    .map_err(db_err)?;
                rows.collect::<Result<_, _>>().map_err(db_err)
            })?
        };

        let mut results = Map::new();
        let mut found = 0;
        let mut not_found = 0;
        let mut truncated = 0;
        let mut warnings = Vec::new();
        let mut cumulative = 0usize;
        let mut size_exceeded = false;

        for key in keys {
            if size_exceeded {
                results.insert(key.clone(), Value::Null);
                truncated += 1;
                continue;
            }
            if !valid_key(key) {
                results.insert(key.clone(), Value::Null);
                not_found += 1;
                continue;
            }
            let Some(raw) = fetched.get(key) else {
                results.insert(key.clone(), Value::Null);
                not_found += 1;
                continue;
            };
            let entry_size = raw.len();
            if cumulative + entry_size > MAX_BATCH_RESPONSE_BYTES {
                size_exceeded = true;
                results.insert(key.clone(), Value::Null);
                truncated += 1;
                let remaining = keys.len() - results.len();
                warnings.push(format!(
                    "Response size limit (900KB) exceeded at key '{key}'. \
                     Remaining {remaining} keys returned as null."
                ));
                continue;
            }
            cumulative += entry_size;
            results.insert(key.clone(), parse_stored(raw));
            found += 1;
        }

        Ok(BatchGetResult {
            results,
            found,
            not_found,
            truncated,
            warnings,
        })
    }
}

fn parse_stored(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or(Value::Null)
}

fn db_err(e: rusqlite::Error) -> KernelError {
    KernelError::internal(format!("database error: {e}"))
}

fn details(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn registry(dir: &TempDir) -> StoreRegistry {
        let audit = Arc::new(AuditLogger::new(dir.path().join("audit")));
        StoreRegistry::new(
            dir.path().join("stores/stores.db"),
            dir.path().join("stores"),
            audit,
        )
        .unwrap()
    }

    #[test]
    fn create_get_list_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);

        reg.create_store("s1", None, "test").unwrap();
        let def = reg.get_store("s1").unwrap().unwrap();
        assert_eq!(def.created_by, "test");
        assert!(Path::new(&def.root_path).is_dir());

        assert_eq!(reg.list_stores().unwrap().len(), 1);

        reg.delete_store("s1", true).unwrap();
        assert!(reg.get_store("s1").unwrap().is_none());
        assert!(!Path::new(&def.root_path).exists());
    }

    #[test]
    fn duplicate_store_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        reg.create_store("dup", None, "a").unwrap();
        let err = reg.create_store("dup", None, "b").unwrap_err();
        assert_eq!(err.kind, ErrorKind::StoreAlreadyExists);
    }

    #[test]
    fn store_path_escape_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        let err = reg
            .create_store("evil", Some("/tmp/outside-the-base"), "t")
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PathTraversal);

        let dotdot = dir.path().join("stores/../escape");
        let err = reg
            .create_store("evil2", Some(dotdot.to_str().unwrap()), "t")
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PathTraversal);
    }

    #[test]
    fn cas_insert_update_and_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        reg.create_store("s1", None, "t").unwrap();

        // Insert with expect-missing.
        let out = reg
            .cas("s1", "k", Expectation::Missing, &json!({"v": 1}))
            .unwrap();
        assert_eq!(out, CasOutcome::Success);

        // Second expect-missing conflicts with the stored value.
        let out = reg
            .cas("s1", "k", Expectation::Missing, &json!({"v": 9}))
            .unwrap();
        assert_eq!(
            out,
            CasOutcome::Conflict {
                current_value: Some(json!({"v": 1}))
            }
        );

        // Swap with the right pre-image.
        let out = reg
            .cas("s1", "k", Expectation::Value(json!({"v": 1})), &json!({"v": 2}))
            .unwrap();
        assert_eq!(out, CasOutcome::Success);

        // The loser sees the winner's value.
        let out = reg
            .cas("s1", "k", Expectation::Value(json!({"v": 1})), &json!({"v": 3}))
            .unwrap();
        assert_eq!(
            out,
            CasOutcome::Conflict {
                current_value: Some(json!({"v": 2}))
            }
        );
    }

    #[test]
    fn cas_expect_value_on_missing_key_conflicts_with_null_current() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        reg.create_store("s1", None, "t").unwrap();

        let out = reg
            .cas("s1", "absent", Expectation::Value(json!({"v": 1})), &json!({"v": 2}))
            .unwrap();
        assert_eq!(out, CasOutcome::Conflict { current_value: None });
    }

    #[test]
    fn cas_distinguishes_stored_null_from_missing() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        reg.create_store("s1", None, "t").unwrap();

        reg.cas("s1", "k", Expectation::Missing, &json!(null)).unwrap();
        // Expecting stored JSON null succeeds.
        let out = reg
            .cas("s1", "k", Expectation::Value(json!(null)), &json!({"v": 1}))
            .unwrap();
        assert_eq!(out, CasOutcome::Success);
    }

    #[test]
    fn cas_post_state_hash_matches_new_value() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        reg.create_store("s1", None, "t").unwrap();
        reg.cas("s1", "k", Expectation::Missing, &json!({"b": 2, "a": 1}))
            .unwrap();

        let (stored, stored_hash): (String, String) = reg
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT value, value_hash FROM store_data WHERE store_id='s1' AND key='k'",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(db_err)
            })
            .unwrap();
        assert_eq!(stored, r#"{"a":1,"b":2}"#);
        assert_eq!(stored_hash, value_hash(&json!({"a": 1, "b": 2})));
    }

    #[test]
    fn cas_value_size_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        reg.create_store("s1", None, "t").unwrap();

        // canonical form: {"v":"<payload>"} → 8 bytes of overhead.
        let exact = "x".repeat(MAX_VALUE_BYTES_CAS - 8);
        let out = reg
            .cas("s1", "exact", Expectation::Missing, &json!({"v": exact}))
            .unwrap();
        assert_eq!(out, CasOutcome::Success);

        let over = "x".repeat(MAX_VALUE_BYTES_CAS - 7);
        let err = reg
            .cas("s1", "over", Expectation::Missing, &json!({"v": over}))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PayloadTooLarge);
    }

    #[test]
    fn cas_unknown_store_and_bad_key() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        let err = reg
            .cas("missing", "k", Expectation::Missing, &json!(1))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::StoreNotFound);

        reg.create_store("s1", None, "t").unwrap();
        let err = reg
            .cas("s1", "bad key!", Expectation::Missing, &json!(1))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);
    }

    #[test]
    fn list_keys_pagination_walks_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        reg.create_store("s1", None, "t").unwrap();
        for i in 0..7 {
            reg.cas("s1", &format!("key/{i}"), Expectation::Missing, &json!(i))
                .unwrap();
        }

        let page1 = reg.list_keys("s1", "", Some(3), None).unwrap();
        assert_eq!(page1.keys, vec!["key/0", "key/1", "key/2"]);
        assert!(page1.has_more);
        assert_eq!(page1.next_cursor.as_deref(), Some("key/2"));
        assert_eq!(page1.total_estimate, 7);

        let page2 = reg
            .list_keys("s1", "", Some(3), page1.next_cursor.as_deref())
            .unwrap();
        assert_eq!(page2.keys, vec!["key/3", "key/4", "key/5"]);
        assert!(page2.has_more);

        let page3 = reg
            .list_keys("s1", "", Some(3), page2.next_cursor.as_deref())
            .unwrap();
        assert_eq!(page3.keys, vec!["key/6"]);
        assert!(!page3.has_more);
        assert_eq!(page3.next_cursor, None);
    }

    #[test]
    fn list_keys_prefix_filter() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        reg.create_store("s1", None, "t").unwrap();
        for key in ["a/1", "a/2", "b/1"] {
            reg.cas("s1", key, Expectation::Missing, &json!(1)).unwrap();
        }

        let all = reg.list_keys("s1", "", None, None).unwrap();
        assert_eq!(all.keys.len(), 3);
        assert!(!all.has_more);

        let a_only = reg.list_keys("s1", "a/", None, None).unwrap();
        assert_eq!(a_only.keys, vec!["a/1", "a/2"]);
        assert_eq!(a_only.total_estimate, 2);
    }

    #[test]
    fn batch_get_returns_caller_order_semantics() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        reg.create_store("s1", None, "t").unwrap();
        reg.cas("s1", "k1", Expectation::Missing, &json!({"a": 1})).unwrap();
        reg.cas("s1", "k2", Expectation::Missing, &json!({"b": 2})).unwrap();

        let out = reg
            .batch_get("s1", &["k1".into(), "nope".into(), "k2".into()])
            .unwrap();
        assert_eq!(out.found, 2);
        assert_eq!(out.not_found, 1);
        assert_eq!(out.truncated, 0);
        assert_eq!(out.results["k1"], json!({"a": 1}));
        assert_eq!(out.results["nope"], Value::Null);
    }

    #[test]
    fn batch_get_truncates_past_the_byte_budget() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        reg.create_store("s1", None, "t").unwrap();

        // Each value is ~450KB canonical; the third pushes past 900KB.
        let big = "x".repeat(450 * 1024);
        for key in ["k1", "k2", "k3"] {
            reg.cas("s1", key, Expectation::Missing, &json!({"v": big}))
                .unwrap();
        }

        let out = reg
            .batch_get("s1", &["k1".into(), "k2".into(), "k3".into()])
            .unwrap();
        assert_eq!(out.found, 1);
        assert_eq!(out.truncated, 2);
        assert_eq!(out.warnings.len(), 1);
        assert_eq!(out.results["k3"], Value::Null);
    }

    #[test]
    fn batch_get_caps_key_count() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        reg.create_store("s1", None, "t").unwrap();
        let keys: Vec<String> = (0..101).map(|i| format!("k{i}")).collect();
        let err = reg.batch_get("s1", &keys).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);
    }

    #[test]
    fn pack_store_creation_forces_prefix_and_caps_count() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);

        let results = reg.create_stores_for_pack("acme", &["cache".into(), "acme__data".into()]);
        assert!(results.iter().all(|r| r.success));
        assert!(reg.get_store("acme__cache").unwrap().is_some());
        assert!(reg.get_store("acme__data").unwrap().is_some());

        // Re-declaring is success.
        let again = reg.create_stores_for_pack("acme", &["cache".into()]);
        assert!(again[0].success);

        let too_many: Vec<String> = (0..11).map(|i| format!("s{i}")).collect();
        let results = reg.create_stores_for_pack("acme", &too_many);
        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
    }

    #[test]
    fn close_then_reuse_reopens_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        reg.create_store("s1", None, "t").unwrap();
        reg.close();
        assert!(reg.get_store("s1").unwrap().is_some());
    }
}
