//! Account persistence: one JSON file holding the full account list.
//!
//! Reads of a missing file yield an empty list; writes replace the file
//! wholesale. Uniqueness is by `(platform, login)` and enforced by upsert.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;
use viewer_core::{AccountKey, AccountRecord, AccountStatus};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to access account store: {0}")]
    Io(#[from] io::Error),
    #[error("account store is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// JSON-file backed store for the account list.
#[derive(Debug, Clone)]
pub struct AccountStore {
    path: PathBuf,
}

impl AccountStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all accounts. A store file that does not exist yet reads as an
    /// empty list.
    pub fn load(&self) -> Result<Vec<AccountRecord>, StoreError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    /// Replace the stored account list.
    pub fn save(&self, accounts: &[AccountRecord]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(accounts)?;
        fs::write(&self.path, contents)?;
        debug!(path = %self.path.display(), count = accounts.len(), "account store saved");
        Ok(())
    }

    pub fn find(&self, key: &AccountKey) -> Result<Option<AccountRecord>, StoreError> {
        Ok(self.load()?.into_iter().find(|record| record.key() == *key))
    }

    /// Insert or overwrite the account with the same `(platform, login)`.
    /// New and updated entries are stored as stopped; the running flag only
    /// ever comes from an actual start. Returns the resulting list.
    pub fn upsert(&self, record: AccountRecord) -> Result<Vec<AccountRecord>, StoreError> {
        let mut accounts = self.load()?;
        let record = AccountRecord {
            status: AccountStatus::Stopped,
            ..record
        };
        match accounts.iter_mut().find(|existing| existing.key() == record.key()) {
            Some(existing) => *existing = record,
            None => accounts.push(record),
        }
        self.save(&accounts)?;
        Ok(accounts)
    }

    /// Remove the account identified by `key`, returning the resulting list.
    pub fn remove(&self, key: &AccountKey) -> Result<Vec<AccountRecord>, StoreError> {
        let mut accounts = self.load()?;
        accounts.retain(|record| record.key() != *key);
        self.save(&accounts)?;
        Ok(accounts)
    }

    /// Persist a status change for one account. Unknown keys are ignored.
    pub fn set_status(&self, key: &AccountKey, status: AccountStatus) -> Result<(), StoreError> {
        let mut accounts = self.load()?;
        if let Some(record) = accounts.iter_mut().find(|record| record.key() == *key) {
            record.status = status;
            self.save(&accounts)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use viewer_core::Platform;

    fn record(platform: Platform, login: &str, server: &str) -> AccountRecord {
        AccountRecord {
            platform,
            login: login.to_string(),
            password: "p".to_string(),
            server: server.to_string(),
            terminal_path: PathBuf::from("/opt/mt/terminal"),
            status: AccountStatus::Stopped,
        }
    }

    fn store_in(tmp: &TempDir) -> AccountStore {
        AccountStore::new(tmp.path().join("data").join("accounts.json"))
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let tmp = TempDir::new().unwrap();
        assert!(store_in(&tmp).load().unwrap().is_empty());
    }

    #[test]
    fn upsert_overwrites_duplicate_identity() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);

        store.upsert(record(Platform::Mt4, "1", "Broker-A")).unwrap();
        store.upsert(record(Platform::Mt5, "1", "Broker-A")).unwrap();
        let accounts = store.upsert(record(Platform::Mt4, "1", "Broker-B")).unwrap();

        assert_eq!(accounts.len(), 2);
        let mt4 = store
            .find(&AccountKey::new(Platform::Mt4, "1"))
            .unwrap()
            .unwrap();
        assert_eq!(mt4.server, "Broker-B");
    }

    #[test]
    fn upsert_resets_status_to_stopped() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        let mut rec = record(Platform::Mt4, "9", "Broker-A");
        rec.status = AccountStatus::Running;

        let accounts = store.upsert(rec).unwrap();
        assert_eq!(accounts[0].status, AccountStatus::Stopped);
    }

    #[test]
    fn remove_filters_by_identity() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        store.upsert(record(Platform::Mt4, "1", "A")).unwrap();
        store.upsert(record(Platform::Mt5, "2", "B")).unwrap();

        let remaining = store.remove(&AccountKey::new(Platform::Mt4, "1")).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].login, "2");
    }

    #[test]
    fn set_status_persists_across_reload() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        store.upsert(record(Platform::Mt5, "3", "A")).unwrap();
        let key = AccountKey::new(Platform::Mt5, "3");

        store.set_status(&key, AccountStatus::Running).unwrap();
        let reloaded = AccountStore::new(store.path().to_path_buf());
        assert_eq!(
            reloaded.find(&key).unwrap().unwrap().status,
            AccountStatus::Running
        );
    }

    #[test]
    fn set_status_for_unknown_key_is_a_no_op() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        store
            .set_status(&AccountKey::new(Platform::Mt4, "404"), AccountStatus::Running)
            .unwrap();
        assert!(store.load().unwrap().is_empty());
    }
}
