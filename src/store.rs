//! Session persistence
//!
//! The session record lives in a small string key-value store (browser
//! local storage, or a JSON file outside the browser). `SessionPersistence`
//! is the only code that touches the session keys, and the manager only
//! calls it at transition boundaries.

use crate::error::{Result, SessionError};
use crate::types::{Principal, ProviderKind, SessionRecord};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Key holding the provider kind; its absence means "no session"
pub const PROVIDER_KEY: &str = "session.provider";
/// Key holding the primary address
pub const PRINCIPAL_KEY: &str = "session.principal";
/// Key holding the wallet account id
pub const ACCOUNT_KEY: &str = "session.account";

/// String key-value store
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a key; removing a missing key is not an error
    fn remove(&self, key: &str) -> Result<()>;
}

/// In-memory key-value store
#[derive(Default)]
pub struct MemoryKeyValueStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryKeyValueStore {
    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock_error(e: impl std::fmt::Display) -> SessionError {
    SessionError::Storage(format!("Failed to acquire store lock: {}", e))
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().map_err(lock_error)?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.write().map_err(lock_error)?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().map_err(lock_error)?;
        entries.remove(key);
        Ok(())
    }
}

/// JSON file-backed key-value store
///
/// The whole map is rewritten on every change via temp file + rename.
pub struct FileKeyValueStore {
    path: PathBuf,
    entries: RwLock<HashMap<String, String>>,
}

impl FileKeyValueStore {
    /// Open the store, loading existing entries if the file exists
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let json = std::fs::read_to_string(&path).map_err(|e| {
                SessionError::Storage(format!(
                    "Failed to read store file {}: {}",
                    path.display(),
                    e
                ))
            })?;
            serde_json::from_str(&json).map_err(|e| {
                SessionError::Storage(format!(
                    "Failed to parse store file {}: {}",
                    path.display(),
                    e
                ))
            })?
        } else {
            HashMap::new()
        };

        tracing::debug!(path = %path.display(), count = entries.len(), "Store opened");
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, entries: &HashMap<String, String>) -> Result<()> {
        let json = serde_json::to_string_pretty(entries)?;
        let tmp_path = self.path.with_extension("tmp");

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SessionError::Storage(format!(
                    "Failed to create store directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        std::fs::write(&tmp_path, json).map_err(|e| {
            SessionError::Storage(format!(
                "Failed to write store file {}: {}",
                tmp_path.display(),
                e
            ))
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            SessionError::Storage(format!(
                "Failed to rename store file {} → {}: {}",
                tmp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        Ok(())
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().map_err(lock_error)?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.write().map_err(lock_error)?;
        entries.insert(key.to_string(), value.to_string());
        self.flush(&entries)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().map_err(lock_error)?;
        if entries.remove(key).is_some() {
            self.flush(&entries)?;
        }
        Ok(())
    }
}

/// Reads and writes the single persisted session record
#[derive(Clone)]
pub struct SessionPersistence {
    store: Arc<dyn KeyValueStore>,
}

impl SessionPersistence {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Overwrite the persisted record
    pub fn save(&self, record: &SessionRecord) -> Result<()> {
        self.store.set(PROVIDER_KEY, record.provider.as_str())?;
        self.store.set(PRINCIPAL_KEY, record.principal.as_str())?;
        match &record.account_id {
            Some(account) => self.store.set(ACCOUNT_KEY, account)?,
            None => self.store.remove(ACCOUNT_KEY)?,
        }

        tracing::debug!(
            provider = %record.provider,
            principal = %record.principal,
            "Session record saved"
        );
        Ok(())
    }

    /// Load the persisted record
    ///
    /// A malformed record (unknown provider, missing principal) is cleared
    /// and reported as absent.
    pub fn load(&self) -> Result<Option<SessionRecord>> {
        let Some(provider) = self.store.get(PROVIDER_KEY)? else {
            return Ok(None);
        };

        let kind = ProviderKind::parse(&provider);
        let principal = self.store.get(PRINCIPAL_KEY)?;

        match (kind, principal) {
            (Some(provider), Some(principal)) => Ok(Some(SessionRecord {
                provider,
                principal: Principal::new(principal),
                account_id: self.store.get(ACCOUNT_KEY)?,
            })),
            _ => {
                tracing::warn!(provider = %provider, "Discarding malformed session record");
                self.clear()?;
                Ok(None)
            }
        }
    }

    /// Remove every session key
    pub fn clear(&self) -> Result<()> {
        self.store.remove(PROVIDER_KEY)?;
        self.store.remove(PRINCIPAL_KEY)?;
        self.store.remove(ACCOUNT_KEY)?;
        tracing::debug!("Session record cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wallet_record() -> SessionRecord {
        SessionRecord {
            provider: ProviderKind::Wallet,
            principal: Principal::new("bbbbb-bb"),
            account_id: Some("acc-1".to_string()),
        }
    }

    fn identity_record() -> SessionRecord {
        SessionRecord {
            provider: ProviderKind::InternetIdentity,
            principal: Principal::new("aaaaa-aa"),
            account_id: None,
        }
    }

    #[test]
    fn test_memory_store_get_set_remove() {
        let store = MemoryKeyValueStore::default();
        assert!(store.get("k").unwrap().is_none());

        store.set("k", "v").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));

        store.remove("k").unwrap();
        store.remove("k").unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_persistence_save_load() {
        let persistence = SessionPersistence::new(Arc::new(MemoryKeyValueStore::default()));
        assert!(persistence.load().unwrap().is_none());

        persistence.save(&wallet_record()).unwrap();
        assert_eq!(persistence.load().unwrap(), Some(wallet_record()));
    }

    #[test]
    fn test_persistence_overwrites_not_merges() {
        let store = Arc::new(MemoryKeyValueStore::default());
        let persistence = SessionPersistence::new(store.clone());

        persistence.save(&wallet_record()).unwrap();
        persistence.save(&identity_record()).unwrap();

        let loaded = persistence.load().unwrap().unwrap();
        assert_eq!(loaded, identity_record());
        assert!(store.get(ACCOUNT_KEY).unwrap().is_none());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_persistence_clear() {
        let store = Arc::new(MemoryKeyValueStore::default());
        let persistence = SessionPersistence::new(store.clone());
        persistence.save(&wallet_record()).unwrap();

        persistence.clear().unwrap();
        assert!(persistence.load().unwrap().is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_persistence_discards_unknown_provider() {
        let store = Arc::new(MemoryKeyValueStore::default());
        store.set(PROVIDER_KEY, "metamask").unwrap();
        store.set(PRINCIPAL_KEY, "aaaaa-aa").unwrap();

        let persistence = SessionPersistence::new(store.clone());
        assert!(persistence.load().unwrap().is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_persistence_discards_missing_principal() {
        let store = Arc::new(MemoryKeyValueStore::default());
        store.set(PROVIDER_KEY, "wallet").unwrap();

        let persistence = SessionPersistence::new(store.clone());
        assert!(persistence.load().unwrap().is_none());
        assert!(store.get(PROVIDER_KEY).unwrap().is_none());
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("session.json");

        {
            let store = FileKeyValueStore::open(&path).unwrap();
            SessionPersistence::new(Arc::new(store))
                .save(&wallet_record())
                .unwrap();
        }
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());

        let reopened = FileKeyValueStore::open(&path).unwrap();
        let loaded = SessionPersistence::new(Arc::new(reopened)).load().unwrap();
        assert_eq!(loaded, Some(wallet_record()));
    }

    #[test]
    fn test_file_store_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyValueStore::open(dir.path().join("absent.json")).unwrap();
        assert!(store.get(PROVIDER_KEY).unwrap().is_none());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_file_store_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, "not json").unwrap();

        let err = FileKeyValueStore::open(&path).err().unwrap();
        assert!(matches!(err, SessionError::Storage(_)));
    }
}
