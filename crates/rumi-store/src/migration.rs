// SPDX-License-Identifier: MIT OR Apache-2.0
//! Legacy JSON → SQLite migration.
//!
//! Runs once, at registry startup, when `stores.db` is absent but a legacy
//! `index.json` exists. The new DB is built at `stores.db.tmp` and renamed
//! into place so a crash mid-migration never leaves a half-written DB; the
//! JSON sources are kept for rollback.

use rumi_core::{now_ts, value_hash, KernelError};
use rusqlite::Connection;
use serde_json::Value;
use std::path::Path;

/// Remove a leftover `stores.db.tmp` from an interrupted migration.
pub(crate) fn cleanup_stale_tmp(db_path: &Path) {
    let tmp = tmp_path(db_path);
    if tmp.exists() {
        match std::fs::remove_file(&tmp) {
            Ok(()) => tracing::info!(path = %tmp.display(), "removed stale migration temp file"),
            Err(e) => tracing::warn!(path = %tmp.display(), error = %e, "failed to remove stale temp file"),
        }
    }
}

/// Open a connection with the registry's standing pragmas applied.
pub(crate) fn open_with_pragmas(db_path: &Path) -> Result<Connection, KernelError> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(db_path)
        .map_err(|e| KernelError::internal(format!("open {db_path:?}: {e}")))?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;
         PRAGMA cache_size = -8000;",
    )
    .map_err(|e| KernelError::internal(format!("apply pragmas: {e}")))?;
    Ok(conn)
}

/// Migrate a legacy `index.json` (plus per-store data files) into a fresh
/// SQLite DB. Returns `true` when a migration actually ran.
pub(crate) fn migrate_json_to_sqlite(
    db_path: &Path,
    index_path: &Path,
) -> Result<bool, KernelError> {
    if db_path.exists() || !index_path.exists() {
        return Ok(false);
    }

    let index: Value = serde_json::from_str(&std::fs::read_to_string(index_path)?)?;
    let empty = serde_json::Map::new();
    let stores = index
        .get("stores")
        .and_then(Value::as_object)
        .unwrap_or(&empty);

    let tmp = tmp_path(db_path);
    tracing::info!(from = %index_path.display(), to = %db_path.display(), "starting JSON to SQLite migration");

    let result = (|| -> Result<(usize, usize), KernelError> {
        let conn = open_with_pragmas(&tmp)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS stores (
                store_id   TEXT PRIMARY KEY,
                root_path  TEXT NOT NULL,
                created_at TEXT NOT NULL,
                created_by TEXT NOT NULL DEFAULT ''
            );
            CREATE TABLE IF NOT EXISTS store_data (
                store_id   TEXT NOT NULL REFERENCES stores(store_id) ON DELETE CASCADE,
                key        TEXT NOT NULL,
                value      TEXT NOT NULL,
                value_hash TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (store_id, key)
            );
            PRAGMA user_version = 1;",
        )
        .map_err(|e| KernelError::internal(format!("create tables: {e}")))?;

        let now = now_ts();
        let mut migrated_stores = 0;
        let mut migrated_keys = 0;

        for (store_id, store_meta) in stores {
            let root_path = store_meta
                .get("root_path")
                .and_then(Value::as_str)
                .unwrap_or("");
            let created_at = store_meta
                .get("created_at")
                .and_then(Value::as_str)
                .unwrap_or(&now);
            let created_by = store_meta
                .get("created_by")
                .and_then(Value::as_str)
                .unwrap_or("");
            conn.execute(
                "INSERT OR IGNORE INTO stores (store_id, root_path, created_at, created_by)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![store_id, root_path, created_at, created_by],
            )
            .map_err(|e| KernelError::internal(format!("insert store: {e}")))?;
            migrated_stores += 1;

            // Per-store data files become rows keyed by their relative path.
            let store_root = Path::new(root_path);
            if store_root.is_dir() {
                for entry in walk_json_files(store_root) {
                    let Ok(rel) = entry.strip_prefix(store_root) else {
                        continue;
                    };
                    let key = rel
                        .with_extension("")
                        .to_string_lossy()
                        .replace('\\', "/");
                    let value: Value = match std::fs::read_to_string(&entry)
                        .map_err(KernelError::from)
                        .and_then(|raw| serde_json::from_str(&raw).map_err(KernelError::from))
                    {
                        Ok(v) => v,
                        Err(e) => {
                            tracing::warn!(file = %entry.display(), error = %e, "failed to read data file");
                            continue;
                        }
                    };
                    conn.execute(
                        "INSERT OR IGNORE INTO store_data
                         (store_id, key, value, value_hash, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        rusqlite::params![
                            store_id,
                            key,
                            rumi_core::canonical_json(&value),
                            value_hash(&value),
                            now
                        ],
                    )
                    .map_err(|e| KernelError::internal(format!("insert data row: {e}")))?;
                    migrated_keys += 1;
                }
            }
        }

        conn.close()
            .map_err(|(_, e)| KernelError::internal(format!("close migrated db: {e}")))?;
        Ok((migrated_stores, migrated_keys))
    })();

    match result {
        Ok((stores, keys)) => {
            std::fs::rename(&tmp, db_path)?;
            tracing::info!(stores, keys, "migration complete");
            Ok(true)
        }
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            Err(e)
        }
    }
}

fn tmp_path(db_path: &Path) -> std::path::PathBuf {
    let mut tmp = db_path.as_os_str().to_os_string();
    tmp.push(".tmp");
    std::path::PathBuf::from(tmp)
}

fn walk_json_files(root: &Path) -> Vec<std::path::PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(read_dir) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in read_dir.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().and_then(|e| e.to_str()) == Some("json") {
                out.push(path);
            }
        }
    }
    out.sort();
    out
}
