//! Sync result history backed by sled
//!
//! Results are appended per application and never rewritten: a new pass
//! supersedes the previous record without deleting it.

use std::collections::BTreeSet;
use std::fs::File;
use std::path::Path;

use fs2::FileExt;

use crate::error::CoreError;
use crate::types::result::SyncResult;

/// Separates the application name from the sequence number in keys
const KEY_SEPARATOR: u8 = 0x00;

/// A HistoryStore with filesystem-level exclusive lock.
///
/// The lock is held for the lifetime of this struct and released when
/// dropped, so only one controller owns a data directory at a time.
pub struct LockedHistoryStore {
    /// Lock file handle - flock released on drop
    _lock_file: File,
    store: HistoryStore,
}

impl std::fmt::Debug for LockedHistoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockedHistoryStore")
            .field("store", &"HistoryStore { ... }")
            .finish()
    }
}

impl LockedHistoryStore {
    pub fn inner(&self) -> &HistoryStore {
        &self.store
    }

    /// Clone of the underlying store handle (sled handles are shared)
    pub fn store(&self) -> HistoryStore {
        self.store.clone()
    }
}

impl std::ops::Deref for LockedHistoryStore {
    type Target = HistoryStore;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

/// Append-only store of sync results, keyed by application
#[derive(Clone)]
pub struct HistoryStore {
    db: sled::Db,
    results: sled::Tree,
}

impl HistoryStore {
    /// Open or create a store at the given path
    pub fn open(path: &Path) -> Result<Self, CoreError> {
        let db = sled::open(path)?;
        let results = db.open_tree("results")?;
        Ok(Self { db, results })
    }

    /// Open a throwaway store that is removed on drop; used by tests
    pub fn temporary() -> Result<Self, CoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        let results = db.open_tree("results")?;
        Ok(Self { db, results })
    }

    /// Open store with exclusive filesystem lock (non-blocking).
    ///
    /// Lock file is created at `<path>.lock`.
    /// Returns `CoreError::DbBusy` if another process holds the lock.
    pub fn open_locked(path: &Path) -> Result<LockedHistoryStore, CoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let lock_path = path.with_extension("lock");
        let lock_file = File::create(&lock_path)?;

        lock_file.try_lock_exclusive().map_err(|e| {
            CoreError::DbBusy(format!("History store locked by another process: {}", e))
        })?;

        let store = Self::open(path)?;
        Ok(LockedHistoryStore {
            _lock_file: lock_file,
            store,
        })
    }

    /// Append a result; returns its sequence number
    pub fn record(&self, result: &SyncResult) -> Result<u64, CoreError> {
        let seq = self.db.generate_id()?;
        let key = result_key(&result.application, seq);
        let value = serde_json::to_vec(result)?;
        self.results.insert(key, value)?;
        Ok(seq)
    }

    /// Most recent result for an application
    pub fn latest(&self, application: &str) -> Result<Option<SyncResult>, CoreError> {
        match self.results.scan_prefix(app_prefix(application)).next_back() {
            Some(entry) => {
                let (_, value) = entry?;
                Ok(Some(serde_json::from_slice(&value)?))
            }
            None => Ok(None),
        }
    }

    /// Results for an application, newest first
    pub fn history(&self, application: &str, limit: usize) -> Result<Vec<SyncResult>, CoreError> {
        let mut results = Vec::new();
        for entry in self.results.scan_prefix(app_prefix(application)).rev().take(limit) {
            let (_, value) = entry?;
            results.push(serde_json::from_slice(&value)?);
        }
        Ok(results)
    }

    /// Number of results recorded for an application
    pub fn count(&self, application: &str) -> usize {
        self.results.scan_prefix(app_prefix(application)).count()
    }

    /// Names of applications with at least one recorded result
    pub fn applications(&self) -> Result<Vec<String>, CoreError> {
        let mut names = BTreeSet::new();
        for entry in self.results.iter() {
            let (key, _) = entry?;
            if let Some(pos) = key.iter().position(|b| *b == KEY_SEPARATOR) {
                names.insert(String::from_utf8_lossy(&key[..pos]).into_owned());
            }
        }
        Ok(names.into_iter().collect())
    }

    pub fn flush(&self) -> Result<(), CoreError> {
        self.db.flush()?;
        Ok(())
    }
}

fn app_prefix(application: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(application.len() + 1);
    prefix.extend_from_slice(application.as_bytes());
    prefix.push(KEY_SEPARATOR);
    prefix
}

fn result_key(application: &str, seq: u64) -> Vec<u8> {
    let mut key = app_prefix(application);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}
