//! Durable storage for the fuel account

use crate::account::FuelAccount;
use crate::error::FuelError;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A last-write-wins slot holding one [`FuelAccount`].
pub trait AccountStore {
    /// Load the stored account, or the zero account if nothing was saved yet
    fn load(&self) -> Result<FuelAccount, FuelError>;

    /// Replace the stored account
    fn save(&mut self, account: &FuelAccount) -> Result<(), FuelError>;
}

/// JSON file store. The file holds a single object keyed by
/// `lastRunCounter`, `cumulativeTankUsage` and `persistedTripUsage`.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl AccountStore for JsonFileStore {
    fn load(&self) -> Result<FuelAccount, FuelError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!("No account at {}, starting from an empty tank", self.path.display());
                return Ok(FuelAccount::default());
            }
            Err(err) => return Err(err.into()),
        };

        let account: FuelAccount = serde_json::from_str(&raw)?;
        debug!("Loaded account from {}: {:?}", self.path.display(), account);
        Ok(account)
    }

    fn save(&mut self, account: &FuelAccount) -> Result<(), FuelError> {
        // Write beside the target and rename so a crash never leaves half a file
        let tmp = self.temp_path();
        std::fs::write(&tmp, serde_json::to_vec_pretty(account)?)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!("Saved account to {}: {:?}", self.path.display(), account);
        Ok(())
    }
}

/// In-memory store, for hosts without a filesystem and for tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    account: Option<FuelAccount>,
    saves: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that already holds `account`
    pub fn with_account(account: FuelAccount) -> Self {
        Self {
            account: Some(account),
            saves: 0,
        }
    }

    /// The last saved account, if any
    pub fn stored(&self) -> Option<&FuelAccount> {
        self.account.as_ref()
    }

    /// Number of `save` calls so far
    pub fn save_count(&self) -> usize {
        self.saves
    }
}

impl AccountStore for MemoryStore {
    fn load(&self) -> Result<FuelAccount, FuelError> {
        Ok(self.account.clone().unwrap_or_default())
    }

    fn save(&mut self, account: &FuelAccount) -> Result<(), FuelError> {
        self.account = Some(account.clone());
        self.saves += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_loads_empty_account() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("account.json"));
        assert_eq!(store.load().unwrap(), FuelAccount::default());
    }

    #[test]
    fn test_file_store_keeps_last_write() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonFileStore::new(dir.path().join("account.json"));

        let first = FuelAccount {
            last_run_counter: 3,
            cumulative_tank_usage: 4.5,
            persisted_trip_usage: 0.25,
        };
        let second = FuelAccount {
            last_run_counter: 4,
            cumulative_tank_usage: 4.75,
            persisted_trip_usage: 0.0,
        };
        store.save(&first).unwrap();
        store.save(&second).unwrap();

        let reopened = JsonFileStore::new(store.path());
        assert_eq!(reopened.load().unwrap(), second);
        assert!(!store.temp_path().exists());
    }

    #[test]
    fn test_file_uses_stable_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonFileStore::new(dir.path().join("account.json"));
        store.save(&FuelAccount::default()).unwrap();

        let raw = std::fs::read_to_string(store.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(value.get("lastRunCounter").is_some());
        assert!(value.get("cumulativeTankUsage").is_some());
        assert!(value.get("persistedTripUsage").is_some());
    }

    #[test]
    fn test_corrupt_file_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("account.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let store = JsonFileStore::new(path);
        assert!(matches!(store.load(), Err(FuelError::Storage(_))));
    }

    #[test]
    fn test_memory_store_counts_saves() {
        let mut store = MemoryStore::new();
        store.save(&FuelAccount::default()).unwrap();
        store.save(&FuelAccount::default()).unwrap();
        assert_eq!(store.save_count(), 2);
    }
}
