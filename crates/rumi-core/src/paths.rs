// SPDX-License-Identifier: MIT OR Apache-2.0
//! Path containment, file hashing, and atomic writes.

use crate::error::{ErrorKind, KernelError};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Returns `true` iff `child` resolves to `parent` or a descendant of it.
///
/// Both paths are canonicalised; a path that does not exist is resolved
/// through its nearest existing ancestor so a not-yet-created file can
/// still be containment-checked.
pub fn is_path_within(child: &Path, parent: &Path) -> bool {
    let Some(child) = resolve_lenient(child) else {
        return false;
    };
    let Some(parent) = resolve_lenient(parent) else {
        return false;
    };
    child == parent || child.starts_with(&parent)
}

/// Canonicalise a path, falling back to canonicalising the deepest existing
/// ancestor and re-appending the remaining components.
fn resolve_lenient(path: &Path) -> Option<PathBuf> {
    if let Ok(resolved) = path.canonicalize() {
        return Some(resolved);
    }
    let mut existing = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    loop {
        match existing.parent() {
            Some(parent) => {
                tail.push(existing.file_name()?.to_os_string());
                existing = parent.to_path_buf();
                if let Ok(resolved) = existing.canonicalize() {
                    let mut out = resolved;
                    for component in tail.iter().rev() {
                        if component == ".." {
                            return None;
                        }
                        out.push(component);
                    }
                    return Some(out);
                }
            }
            None => return None,
        }
    }
}

/// SHA-256 hex digest of a file, read in 64 KiB chunks.
pub fn compute_file_sha256(path: &Path) -> Result<String, KernelError> {
    let mut file = File::open(path)
        .map_err(|e| KernelError::new(ErrorKind::InternalError, format!("open {path:?}: {e}")))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(crate::canonical::hex_digest(hasher))
}

/// SHA-256 hex digest of in-memory bytes.
pub fn compute_bytes_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    crate::canonical::hex_digest(hasher)
}

/// Write bytes atomically: tempfile in the target directory, then rename.
///
/// `mode` is applied on Unix after the rename; ignored elsewhere.
pub fn atomic_write(path: &Path, bytes: &[u8], mode: u32) -> Result<(), KernelError> {
    let dir = path
        .parent()
        .ok_or_else(|| KernelError::internal(format!("no parent directory for {path:?}")))?;
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp_")
        .tempfile_in(dir)
        .map_err(|e| KernelError::internal(format!("mkstemp in {dir:?}: {e}")))?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(path)
        .map_err(|e| KernelError::internal(format!("rename into {path:?}: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode));
    }
    #[cfg(not(unix))]
    let _ = mode;

    Ok(())
}

/// Serialize a value as pretty JSON and write it atomically with `mode`.
pub fn atomic_write_json<T: serde::Serialize>(
    path: &Path,
    value: &T,
    mode: u32,
) -> Result<(), KernelError> {
    let content = serde_json::to_string_pretty(value)?;
    atomic_write(path, content.as_bytes(), mode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn containment_accepts_descendants() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let child = root.join("a/b/c.txt");
        assert!(is_path_within(&child, root));
        assert!(is_path_within(root, root));
    }

    #[test]
    fn containment_rejects_siblings_and_escapes() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("inner");
        std::fs::create_dir_all(&root).unwrap();
        let sibling = dir.path().join("other/file.txt");
        assert!(!is_path_within(&sibling, &root));
        assert!(!is_path_within(&root.join("../escape"), &root));
    }

    #[test]
    fn file_hash_matches_bytes_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"hello kernel").unwrap();
        assert_eq!(
            compute_file_sha256(&path).unwrap(),
            compute_bytes_sha256(b"hello kernel")
        );
    }

    #[test]
    fn atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        atomic_write_json(&path, &json!({"v": 1}), 0o600).unwrap();
        atomic_write_json(&path, &json!({"v": 2}), 0o600).unwrap();
        let back: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back["v"], 2);
    }

    #[cfg(unix)]
    #[test]
    fn atomic_write_applies_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.json");
        atomic_write(&path, b"{}", 0o600).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
