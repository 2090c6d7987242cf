use super::types::Cvr;
use super::version::CvrVersion;
use crate::error::CvrError;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use std::collections::HashMap;
use std::fmt::Display;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// Durable home of client view records.
///
/// `commit` is a compare-and-set on the record version: it fails with
/// [`CvrError::Conflict`] when the stored version is not `expected`, which
/// only happens if two syncers own the same group.
pub trait CvrStore: Send + Sync {
    fn load(&self, group_id: &str) -> Result<Option<Cvr>, CvrError>;

    fn commit(&self, cvr: &Cvr, expected: Option<&CvrVersion>) -> Result<(), CvrError>;
}

const CVRS: TableDefinition<&str, &[u8]> = TableDefinition::new("cvrs");
const VERSIONS: TableDefinition<&str, &str> = TableDefinition::new("cvr_versions");

/// I/O failures are worth retrying; everything else redb reports means the
/// file or the caller is broken.
fn storage(e: impl Into<redb::Error>) -> CvrError {
    match e.into() {
        e @ redb::Error::Io(_) => CvrError::Transient(e.to_string()),
        e => CvrError::Storage(e.to_string()),
    }
}

fn poisoned(e: impl Display) -> CvrError {
    CvrError::Storage(e.to_string())
}

fn conflict(group: &str, expected: Option<&CvrVersion>, found: Option<String>) -> CvrError {
    CvrError::Conflict {
        group: group.to_string(),
        expected: expected.map(CvrVersion::to_cookie).unwrap_or_else(|| "none".into()),
        found: found.unwrap_or_else(|| "none".into()),
    }
}

/// Records stored as CBOR in a redb file. The version of each record is
/// kept in a side table so commits can check it without decoding.
pub struct RedbCvrStore {
    db: Database,
}

impl RedbCvrStore {
    pub fn open(path: &Path) -> Result<Self, CvrError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(storage)?;
        }
        let db = Database::create(path).map_err(storage)?;
        let txn = db.begin_write().map_err(storage)?;
        txn.open_table(CVRS).map_err(storage)?;
        txn.open_table(VERSIONS).map_err(storage)?;
        txn.commit().map_err(storage)?;
        Ok(Self { db })
    }

    /// Ids of all stored groups.
    pub fn group_ids(&self) -> Result<Vec<String>, CvrError> {
        let txn = self.db.begin_read().map_err(storage)?;
        let table = txn.open_table(VERSIONS).map_err(storage)?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(storage)? {
            let (key, _) = entry.map_err(storage)?;
            out.push(key.value().to_string());
        }
        Ok(out)
    }
}

impl CvrStore for RedbCvrStore {
    fn load(&self, group_id: &str) -> Result<Option<Cvr>, CvrError> {
        let txn = self.db.begin_read().map_err(storage)?;
        let table = txn.open_table(CVRS).map_err(storage)?;
        let Some(bytes) = table.get(group_id).map_err(storage)? else {
            return Ok(None);
        };
        let cvr: Cvr = cbor4ii::serde::from_slice(bytes.value())
            .map_err(|e| CvrError::Encoding(e.to_string()))?;
        debug!(client_group = group_id, version = %cvr.version, "loaded cvr");
        Ok(Some(cvr))
    }

    fn commit(&self, cvr: &Cvr, expected: Option<&CvrVersion>) -> Result<(), CvrError> {
        let bytes = cbor4ii::serde::to_vec(Vec::new(), cvr)
            .map_err(|e| CvrError::Encoding(e.to_string()))?;
        let cookie = cvr.version.to_cookie();
        let txn = self.db.begin_write().map_err(storage)?;
        {
            let mut versions = txn.open_table(VERSIONS).map_err(storage)?;
            let found = versions
                .get(cvr.id.as_str())
                .map_err(storage)?
                .map(|v| v.value().to_string());
            let expected_cookie = expected.map(CvrVersion::to_cookie);
            if found != expected_cookie {
                return Err(conflict(&cvr.id, expected, found));
            }
            versions
                .insert(cvr.id.as_str(), cookie.as_str())
                .map_err(storage)?;
            let mut cvrs = txn.open_table(CVRS).map_err(storage)?;
            cvrs.insert(cvr.id.as_str(), bytes.as_slice()).map_err(storage)?;
        }
        txn.commit().map_err(storage)?;
        debug!(client_group = %cvr.id, version = %cookie, bytes = bytes.len(), "committed cvr");
        Ok(())
    }
}

/// In-memory store for tests and embedding. Can be told to fail the next
/// commits with a transient error.
#[derive(Default)]
pub struct MemoryCvrStore {
    records: Mutex<HashMap<String, Cvr>>,
    failing_commits: AtomicUsize,
}

impl MemoryCvrStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_commits(&self, n: usize) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CvrStore for MemoryCvrStore {
    fn load(&self, group_id: &str) -> Result<Option<Cvr>, CvrError> {
        let records = self.records.lock().map_err(poisoned)?;
        Ok(records.get(group_id).cloned())
    }

    fn commit(&self, cvr: &Cvr, expected: Option<&CvrVersion>) -> Result<(), CvrError> {
        let pending_failures = self.failing_commits.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.failing_commits.store(pending_failures - 1, Ordering::SeqCst);
            return Err(CvrError::Transient("injected failure".into()));
        }
        let mut records = self.records.lock().map_err(poisoned)?;
        let found = records.get(&cvr.id).map(|c| &c.version);
        if found != expected {
            return Err(conflict(&cvr.id, expected, found.map(CvrVersion::to_cookie)));
        }
        records.insert(cvr.id.clone(), cvr.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_compare_and_set() {
        let store = MemoryCvrStore::new();
        let mut cvr = Cvr::new("g1");
        store.commit(&cvr, None).unwrap();

        let previous = cvr.version.clone();
        cvr.version = previous.next(None);
        assert!(matches!(store.commit(&cvr, None), Err(CvrError::Conflict { .. })));
        store.commit(&cvr, Some(&previous)).unwrap();
        assert_eq!(store.load("g1").unwrap().unwrap().version, cvr.version);
        assert!(store.load("g2").unwrap().is_none());
    }

    #[test]
    fn test_redb_io_errors_are_transient() {
        assert!(storage(std::io::Error::other("disk unplugged")).is_transient());
        assert!(storage(redb::StorageError::Io(std::io::Error::other("eio"))).is_transient());
        assert!(storage(redb::CommitError::Storage(redb::StorageError::Io(
            std::io::Error::other("eio")
        )))
        .is_transient());

        let corrupted = storage(redb::StorageError::Corrupted("bad page".into()));
        assert!(!corrupted.is_transient());
        assert!(matches!(corrupted, CvrError::Storage(_)));
        assert!(!storage(redb::TableError::TableDoesNotExist("cvrs".into())).is_transient());
    }

    #[test]
    fn test_memory_store_injected_failures() {
        let store = MemoryCvrStore::new();
        store.fail_next_commits(1);
        let cvr = Cvr::new("g1");
        let err = store.commit(&cvr, None).unwrap_err();
        assert!(err.is_transient());
        store.commit(&cvr, None).unwrap();
        assert_eq!(store.len(), 1);
    }
}
