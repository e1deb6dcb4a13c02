//! Account store client.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of accounts written by `seed`.
pub const SEED_ACCOUNT_COUNT: usize = 100;
const SEED_ID_BASE: usize = 10000;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("store at {path} unavailable: {reason}")]
    Unavailable { path: String, reason: String },

    #[error("store is closed")]
    Closed,

    #[error("account {0} not found")]
    NotFound(String),

    #[error("failed to persist store at {path}: {reason}")]
    Persist { path: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub name: String,
}

pub struct StorageClient {
    path: PathBuf,
    accounts: DashMap<String, Account>,
    closed: AtomicBool,
    // Serializes seed and persist.
    write_lock: Mutex<()>,
}

impl StorageClient {
    /// Open the store at `path`, creating an empty one if absent.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let unavailable = |reason: String| StorageError::Unavailable {
            path: path.display().to_string(),
            reason,
        };

        let accounts = DashMap::new();
        if path.exists() {
            let file = File::open(&path).map_err(|e| unavailable(e.to_string()))?;
            let len = file.metadata().map_err(|e| unavailable(e.to_string()))?.len();
            if len > 0 {
                let stored: BTreeMap<String, Account> = serde_json::from_reader(BufReader::new(file))
                    .map_err(|e| unavailable(format!("corrupt store: {e}")))?;
                for (id, account) in stored {
                    accounts.insert(id, account);
                }
            }
        } else {
            File::create(&path).map_err(|e| unavailable(e.to_string()))?;
        }

        tracing::info!(path = %path.display(), accounts = accounts.len(), "Store opened");
        Ok(Self {
            path,
            accounts,
            closed: AtomicBool::new(false),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Insert the fixed account dataset if the store is empty. Returns the
    /// number of accounts inserted (0 when already seeded).
    pub fn seed(&self) -> Result<usize, StorageError> {
        let _guard = self.lock();
        self.ensure_open()?;
        if !self.accounts.is_empty() {
            tracing::debug!(accounts = self.accounts.len(), "Store already seeded");
            return Ok(0);
        }

        for i in 0..SEED_ACCOUNT_COUNT {
            let account = Account {
                id: (SEED_ID_BASE + i).to_string(),
                name: format!("Person_{i}"),
            };
            self.accounts.insert(account.id.clone(), account);
        }
        self.persist()?;
        tracing::info!(accounts = SEED_ACCOUNT_COUNT, "Seeded store with fake accounts");
        Ok(SEED_ACCOUNT_COUNT)
    }

    pub fn query_account(&self, id: &str) -> Result<Account, StorageError> {
        self.ensure_open()?;
        self.accounts
            .get(id)
            .map(|r| r.value().clone())
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    /// Persist and close. Later calls are no-ops.
    pub fn close(&self) -> Result<(), StorageError> {
        let _guard = self.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.persist()?;
        tracing::info!(path = %self.path.display(), "Store closed");
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self) -> Result<(), StorageError> {
        let failed = |e: &dyn std::fmt::Display| StorageError::Persist {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        };

        let snapshot: BTreeMap<String, Account> = self
            .accounts
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let file = File::create(&tmp).map_err(|e| failed(&e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &snapshot).map_err(|e| failed(&e))?;
        writer.flush().map_err(|e| failed(&e))?;
        writer.get_ref().sync_all().map_err(|e| failed(&e))?;
        drop(writer);
        fs::rename(&tmp, &self.path).map_err(|e| failed(&e))?;

        tracing::debug!(accounts = snapshot.len(), "Store persisted");
        Ok(())
    }
}

impl std::fmt::Debug for StorageClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageClient")
            .field("path", &self.path)
            .field("accounts", &self.accounts.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_and_seed_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.db");

        let store = StorageClient::open(&path).unwrap();
        assert!(path.exists());
        assert!(store.is_empty());

        assert_eq!(store.seed().unwrap(), SEED_ACCOUNT_COUNT);
        assert_eq!(store.seed().unwrap(), 0);
        assert_eq!(store.len(), SEED_ACCOUNT_COUNT);

        let account = store.query_account("10042").unwrap();
        assert_eq!(account.name, "Person_42");
        assert!(matches!(store.query_account("99999"), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.db");

        let store = StorageClient::open(&path).unwrap();
        store.seed().unwrap();
        store.close().unwrap();
        store.close().unwrap();
        assert!(matches!(store.query_account("10000"), Err(StorageError::Closed)));
        assert!(matches!(store.seed(), Err(StorageError::Closed)));

        let reopened = StorageClient::open(&path).unwrap();
        assert_eq!(reopened.len(), SEED_ACCOUNT_COUNT);
        assert_eq!(reopened.seed().unwrap(), 0);
        assert!(!dir.path().join("accounts.db.tmp").exists());
    }

    #[test]
    fn test_corrupt_or_inaccessible_store() {
        let dir = tempfile::tempdir().unwrap();
        let corrupt = dir.path().join("corrupt.db");
        fs::write(&corrupt, b"{ not json").unwrap();
        assert!(matches!(StorageClient::open(&corrupt), Err(StorageError::Unavailable { .. })));

        let missing_dir = dir.path().join("nope").join("accounts.db");
        assert!(matches!(StorageClient::open(&missing_dir), Err(StorageError::Unavailable { .. })));

        assert!(matches!(StorageClient::open(dir.path()), Err(StorageError::Unavailable { .. })));
    }
}
