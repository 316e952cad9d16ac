// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! Record Store and Blob Store facades.
//!
//! The coordinator and catalog crates never talk to a database or an object
//! store directly — they go through [`RecordStore`] and [`BlobStore`], which
//! keeps the optimistic-concurrency and content-addressing rules in one
//! place and lets tests run against in-memory fakes.

use rcx_error::{CoreError, CoreResult};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// A stored value paired with its optimistic-concurrency version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedRecord<T> {
    /// The stored value.
    pub value: T,
    /// Monotonically increasing version, bumped on every successful write.
    pub version: u64,
}

/// A generic, versioned key-value facade over whatever backs durable
/// records (Mongo in production, memory or disk in tests).
///
/// Writes are conditional: pass `expected_version` to enforce
/// compare-and-swap semantics, or `None` to require the key be absent
/// (first-write-wins, used for uniqueness constraints like tenant slots).
pub trait RecordStore<T>: Send + Sync {
    /// Fetch the current value and version for `key`, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store is unreachable or the stored
    /// bytes cannot be deserialized.
    fn get(&self, key: &str) -> CoreResult<Option<VersionedRecord<T>>>;

    /// Write `value` under `key`.
    ///
    /// `expected_version = Some(v)` requires the current stored version to
    /// equal `v` (or the key be absent with `v == 0`); `None` requires the
    /// key be entirely absent. Returns the new version on success.
    ///
    /// # Errors
    ///
    /// Returns [`rcx_error::ErrorKind::Conflict`] when the expectation does
    /// not hold, or an internal error on backend failure.
    fn put(&self, key: &str, value: T, expected_version: Option<u64>) -> CoreResult<u64>;

    /// Remove `key` unconditionally. No-op if absent.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure.
    fn delete(&self, key: &str) -> CoreResult<()>;

    /// List keys sharing the given prefix, in lexicographic order.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure.
    fn scan_prefix(&self, prefix: &str) -> CoreResult<Vec<String>>;
}

/// In-memory [`RecordStore`], used by unit and integration tests.
#[derive(Debug)]
pub struct InMemoryRecordStore<T> {
    rows: Mutex<BTreeMap<String, VersionedRecord<T>>>,
}

impl<T> Default for InMemoryRecordStore<T> {
    fn default() -> Self {
        Self {
            rows: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<T> InMemoryRecordStore<T> {
    /// Construct an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl<T: Clone + Send + Sync> RecordStore<T> for InMemoryRecordStore<T> {
    fn get(&self, key: &str) -> CoreResult<Option<VersionedRecord<T>>> {
        let rows = self.rows.lock().expect("record store lock poisoned");
        Ok(rows.get(key).cloned())
    }

    fn put(&self, key: &str, value: T, expected_version: Option<u64>) -> CoreResult<u64> {
        let mut rows = self.rows.lock().expect("record store lock poisoned");
        let current_version = rows.get(key).map(|r| r.version);
        match (expected_version, current_version) {
            (None, Some(_)) => {
                return Err(CoreError::new(
                    rcx_error::ErrorKind::Conflict,
                    format!("key '{key}' already exists"),
                ))
            }
            (Some(expected), Some(actual)) if expected != actual => {
                return Err(CoreError::new(
                    rcx_error::ErrorKind::Conflict,
                    format!("version mismatch for '{key}': expected {expected}, found {actual}"),
                ))
            }
            (Some(expected), None) if expected != 0 => {
                return Err(CoreError::new(
                    rcx_error::ErrorKind::Conflict,
                    format!("key '{key}' does not exist, cannot match version {expected}"),
                ))
            }
            _ => {}
        }
        let new_version = current_version.unwrap_or(0) + 1;
        rows.insert(
            key.to_string(),
            VersionedRecord {
                value,
                version: new_version,
            },
        );
        Ok(new_version)
    }

    fn delete(&self, key: &str) -> CoreResult<()> {
        let mut rows = self.rows.lock().expect("record store lock poisoned");
        rows.remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> CoreResult<Vec<String>> {
        let rows = self.rows.lock().expect("record store lock poisoned");
        Ok(rows.keys().filter(|k| k.starts_with(prefix)).cloned().collect())
    }
}

/// File-backed [`RecordStore`], one JSON file per key under `root`.
///
/// Versions are tracked in a sidecar `.meta` file next to the record; this
/// is a development/single-node substitute for the production Mongo-backed
/// store, not a clustered implementation.
#[derive(Debug)]
pub struct FsRecordStore<T> {
    root: PathBuf,
    _marker: std::marker::PhantomData<T>,
}

impl<T> FsRecordStore<T> {
    /// Root a store at the given directory, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> CoreResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| {
            CoreError::new(rcx_error::ErrorKind::Internal, format!("create store dir: {e}"))
        })?;
        Ok(Self {
            root,
            _marker: std::marker::PhantomData,
        })
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", sanitize(key)))
    }
}

fn sanitize(key: &str) -> String {
    key.replace(['/', '\\'], "_")
}

#[derive(serde::Serialize, serde::Deserialize)]
struct OnDisk<T> {
    value: T,
    version: u64,
}

impl<T: Serialize + DeserializeOwned + Clone + Send + Sync> RecordStore<T> for FsRecordStore<T> {
    fn get(&self, key: &str) -> CoreResult<Option<VersionedRecord<T>>> {
        let path = self.record_path(key);
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let on_disk: OnDisk<T> = serde_json::from_str(&contents).map_err(|e| {
                    CoreError::new(rcx_error::ErrorKind::Internal, format!("decode record: {e}"))
                })?;
                Ok(Some(VersionedRecord {
                    value: on_disk.value,
                    version: on_disk.version,
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CoreError::new(
                rcx_error::ErrorKind::Internal,
                format!("read record: {e}"),
            )),
        }
    }

    fn put(&self, key: &str, value: T, expected_version: Option<u64>) -> CoreResult<u64> {
        let current = self.get(key)?;
        match (expected_version, current.as_ref().map(|r| r.version)) {
            (None, Some(_)) => {
                return Err(CoreError::new(
                    rcx_error::ErrorKind::Conflict,
                    format!("key '{key}' already exists"),
                ))
            }
            (Some(expected), Some(actual)) if expected != actual => {
                return Err(CoreError::new(
                    rcx_error::ErrorKind::Conflict,
                    format!("version mismatch for '{key}': expected {expected}, found {actual}"),
                ))
            }
            (Some(expected), None) if expected != 0 => {
                return Err(CoreError::new(
                    rcx_error::ErrorKind::Conflict,
                    format!("key '{key}' does not exist, cannot match version {expected}"),
                ))
            }
            _ => {}
        }
        let new_version = current.map_or(0, |r| r.version) + 1;
        let on_disk = OnDisk {
            value,
            version: new_version,
        };
        let json = serde_json::to_string_pretty(&on_disk).map_err(|e| {
            CoreError::new(rcx_error::ErrorKind::Internal, format!("encode record: {e}"))
        })?;
        std::fs::write(self.record_path(key), json).map_err(|e| {
            CoreError::new(rcx_error::ErrorKind::Internal, format!("write record: {e}"))
        })?;
        Ok(new_version)
    }

    fn delete(&self, key: &str) -> CoreResult<()> {
        match std::fs::remove_file(self.record_path(key)) {
            Ok(()) | Err(_) => Ok(()),
        }
    }

    fn scan_prefix(&self, prefix: &str) -> CoreResult<Vec<String>> {
        let sanitized_prefix = sanitize(prefix);
        let dir = match std::fs::read_dir(&self.root) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(CoreError::new(
                    rcx_error::ErrorKind::Internal,
                    format!("scan store dir: {e}"),
                ))
            }
        };
        let mut keys = Vec::new();
        for entry in dir {
            let entry = entry.map_err(|e| {
                CoreError::new(rcx_error::ErrorKind::Internal, format!("scan entry: {e}"))
            })?;
            if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
                if stem.starts_with(&sanitized_prefix) {
                    keys.push(stem.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Content-addressed or path-addressed blob storage for artifacts: rule
/// bundles, scan results, statistics documents.
pub trait BlobStore: Send + Sync {
    /// Write `bytes` under `key`, creating any parent path implied by `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be written to.
    fn put(&self, key: &str, bytes: &[u8]) -> CoreResult<()>;

    /// Read the bytes stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`rcx_error::ErrorKind::NotFound`] if absent, or an internal
    /// error on backend failure.
    fn get(&self, key: &str) -> CoreResult<Vec<u8>>;

    /// Report whether `key` exists, without reading its contents.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be queried.
    fn exists(&self, key: &str) -> CoreResult<bool>;

    /// Remove `key`. No-op if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be written to.
    fn delete(&self, key: &str) -> CoreResult<()>;
}

/// Filesystem-backed [`BlobStore`] rooted at a directory, mirroring the
/// key's `/`-separated segments onto subdirectories.
#[derive(Debug)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Root a blob store at the given directory.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> CoreResult<PathBuf> {
        if key.split('/').any(|seg| seg == "..") {
            return Err(CoreError::new(
                rcx_error::ErrorKind::Validation,
                format!("blob key '{key}' must not contain '..' segments"),
            ));
        }
        Ok(self.root.join(key))
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, key: &str, bytes: &[u8]) -> CoreResult<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CoreError::new(rcx_error::ErrorKind::Internal, format!("create blob dir: {e}"))
            })?;
        }
        std::fs::write(&path, bytes)
            .map_err(|e| CoreError::new(rcx_error::ErrorKind::Internal, format!("write blob: {e}")))
    }

    fn get(&self, key: &str) -> CoreResult<Vec<u8>> {
        let path = self.path_for(key)?;
        std::fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                CoreError::new(rcx_error::ErrorKind::NotFound, format!("blob '{key}' not found"))
            }
            _ => CoreError::new(rcx_error::ErrorKind::Internal, format!("read blob: {e}")),
        })
    }

    fn exists(&self, key: &str) -> CoreResult<bool> {
        let path = self.path_for(key)?;
        Ok(path.exists())
    }

    fn delete(&self, key: &str) -> CoreResult<()> {
        let path = self.path_for(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) | Err(_) => Ok(()),
        }
    }
}

/// Join blob path segments the way the Blob Layout table in the external
/// interfaces describes: `tenants/{customer}/{tenant}/jobs/{job_id}/...`.
#[must_use]
pub fn job_artifact_key(customer_id: &str, tenant_name: &str, job_id: &str, leaf: &str) -> String {
    format!("tenants/{customer_id}/{tenant_name}/jobs/{job_id}/{leaf}")
}

/// Canonicalize a filesystem path for error messages and logging.
#[must_use]
pub fn display_path(path: &Path) -> String {
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_put_requires_absent_key_when_no_expected_version() {
        let store: InMemoryRecordStore<String> = InMemoryRecordStore::new();
        store.put("a", "one".into(), None).unwrap();
        let err = store.put("a", "two".into(), None).unwrap_err();
        assert_eq!(err.kind, rcx_error::ErrorKind::Conflict);
    }

    #[test]
    fn in_memory_put_enforces_expected_version() {
        let store: InMemoryRecordStore<String> = InMemoryRecordStore::new();
        let v1 = store.put("a", "one".into(), None).unwrap();
        assert_eq!(v1, 1);
        let v2 = store.put("a", "two".into(), Some(1)).unwrap();
        assert_eq!(v2, 2);
        let err = store.put("a", "three".into(), Some(1)).unwrap_err();
        assert_eq!(err.kind, rcx_error::ErrorKind::Conflict);
    }

    #[test]
    fn in_memory_scan_prefix_sorted() {
        let store: InMemoryRecordStore<u32> = InMemoryRecordStore::new();
        store.put("tenants/a/1", 1, None).unwrap();
        store.put("tenants/a/2", 2, None).unwrap();
        store.put("tenants/b/1", 3, None).unwrap();
        let keys = store.scan_prefix("tenants/a").unwrap();
        assert_eq!(keys, vec!["tenants/a/1", "tenants/a/2"]);
    }

    #[test]
    fn fs_record_store_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store: FsRecordStore<String> = FsRecordStore::new(dir.path()).unwrap();
        let v1 = store.put("job-1", "payload".into(), None).unwrap();
        assert_eq!(v1, 1);
        let fetched = store.get("job-1").unwrap().unwrap();
        assert_eq!(fetched.value, "payload");
        assert_eq!(fetched.version, 1);
        let err = store.put("job-1", "other".into(), None).unwrap_err();
        assert_eq!(err.kind, rcx_error::ErrorKind::Conflict);
    }

    #[test]
    fn fs_blob_store_roundtrips_and_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        store.put("tenants/c1/t1/jobs/j1/result.json", b"{}").unwrap();
        assert!(store.exists("tenants/c1/t1/jobs/j1/result.json").unwrap());
        assert_eq!(store.get("tenants/c1/t1/jobs/j1/result.json").unwrap(), b"{}");
        let err = store.put("../escape", b"x").unwrap_err();
        assert_eq!(err.kind, rcx_error::ErrorKind::Validation);
    }

    #[test]
    fn fs_blob_store_missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        let err = store.get("missing").unwrap_err();
        assert_eq!(err.kind, rcx_error::ErrorKind::NotFound);
    }
}
