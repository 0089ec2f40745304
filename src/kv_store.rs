//! Synchronous, namespaced key-value storage.
//!
//! [`KeyValueStore`] serializes values to JSON text and stores them under
//! `prefix + key` in a [`KeyValueBackend`]. Two backends ship with the crate:
//! [`MemoryBackend`] for tests and ephemeral sessions, and [`FileBackend`],
//! which keeps the same map on disk as a single JSON document.
use std::{
    collections::BTreeMap,
    fs,
    io::Write,
    marker::PhantomData,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use log::{debug, error, trace, warn};
use serde::{de::DeserializeOwned, Serialize};
use tempfile::NamedTempFile;

use crate::{MemoError, Result, StorageErrorCode};

/// Raw string storage underneath a [`KeyValueStore`].
pub trait KeyValueBackend: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>>;
    /// Fails with `QuotaExceeded` when the write would not fit.
    fn set_item(&self, key: &str, value: &str) -> Result<()>;
    fn remove_item(&self, key: &str) -> Result<()>;
    fn keys(&self) -> Result<Vec<String>>;
}

fn lock_failed(what: &str) -> MemoError {
    MemoError::LockAcquisitionFailed {
        message: format!("Failed to acquire lock on {}", what),
    }
}

fn stored_bytes(items: &BTreeMap<String, String>) -> u64 {
    items.iter().map(|(k, v)| (k.len() + v.len()) as u64).sum()
}

fn check_quota(
    items: &BTreeMap<String, String>,
    key: &str,
    value: &str,
    quota_bytes: Option<u64>,
) -> Result<()> {
    let Some(quota) = quota_bytes else {
        return Ok(());
    };

    let replaced = items
        .get(key)
        .map(|old| (key.len() + old.len()) as u64)
        .unwrap_or(0);
    let projected = stored_bytes(items) - replaced + (key.len() + value.len()) as u64;
    if projected > quota {
        warn!(
            "Rejecting write of {} ({} bytes): quota of {} bytes exceeded",
            key,
            value.len(),
            quota
        );
        return Err(MemoError::storage(
            StorageErrorCode::QuotaExceeded,
            format!("writing {} would exceed the {} byte quota", key, quota),
        ));
    }
    Ok(())
}

/// In-memory backend with an optional byte quota.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    items: Mutex<BTreeMap<String, String>>,
    quota_bytes: Option<u64>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            items: Mutex::new(BTreeMap::new()),
            quota_bytes: Some(quota_bytes),
        }
    }
}

impl KeyValueBackend for MemoryBackend {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        let items = self.items.lock().map_err(|_| lock_failed("memory backend"))?;
        Ok(items.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let mut items = self.items.lock().map_err(|_| lock_failed("memory backend"))?;
        check_quota(&items, key, value, self.quota_bytes)?;
        items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        let mut items = self.items.lock().map_err(|_| lock_failed("memory backend"))?;
        items.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let items = self.items.lock().map_err(|_| lock_failed("memory backend"))?;
        Ok(items.keys().cloned().collect())
    }
}

/// Disk-backed backend. The whole map lives in memory and is rewritten to
/// `path` after every mutation using an atomic temp-file rename.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    items: Mutex<BTreeMap<String, String>>,
    quota_bytes: Option<u64>,
}

impl FileBackend {
    /// Opens (or creates) the store at `path`.
    ///
    /// Fails with `CorruptedData` when the file exists but is not a JSON
    /// object of strings.
    pub fn open(path: impl Into<PathBuf>, quota_bytes: Option<u64>) -> Result<Self> {
        let path = path.into();
        debug!("Opening key-value file: {}", path.display());

        let items = if path.exists() {
            let text = fs::read_to_string(&path).map_err(|e| {
                error!("Failed to read key-value file {}: {}", path.display(), e);
                MemoError::Io(e)
            })?;
            if text.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str::<BTreeMap<String, String>>(&text).map_err(|e| {
                    error!("Key-value file {} is corrupted: {}", path.display(), e);
                    MemoError::storage(
                        StorageErrorCode::CorruptedData,
                        format!("{} is not a valid store file: {}", path.display(), e),
                    )
                })?
            }
        } else {
            BTreeMap::new()
        };

        debug!("Loaded {} keys from {}", items.len(), path.display());
        Ok(Self {
            path,
            items: Mutex::new(items),
            quota_bytes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, items: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                debug!("Creating parent directory: {}", parent.display());
                fs::create_dir_all(parent)?;
            }
        }

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut temp_file = NamedTempFile::new_in(dir).map_err(|e| {
            error!("Failed to create temporary file: {}", e);
            MemoError::Io(e)
        })?;

        trace!("Serializing {} keys", items.len());
        let json = serde_json::to_string(items)?;
        temp_file.write_all(json.as_bytes())?;
        temp_file.flush()?;

        temp_file.persist(&self.path).map_err(|e| {
            error!("Failed to persist file {}: {}", self.path.display(), e.error);
            MemoError::Io(e.error)
        })?;
        Ok(())
    }

    /// Applies `change`, persists, and rolls the in-memory map back if the
    /// write to disk fails.
    fn mutate(
        &self,
        key: &str,
        change: impl FnOnce(&mut BTreeMap<String, String>) -> Result<()>,
    ) -> Result<()> {
        let mut items = self.items.lock().map_err(|_| lock_failed("file backend"))?;
        let previous = items.get(key).cloned();
        change(&mut items)?;

        if let Err(e) = self.persist(&items) {
            match previous {
                Some(old) => items.insert(key.to_string(), old),
                None => items.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }
}

impl KeyValueBackend for FileBackend {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        let items = self.items.lock().map_err(|_| lock_failed("file backend"))?;
        Ok(items.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let quota = self.quota_bytes;
        self.mutate(key, |items| {
            check_quota(items, key, value, quota)?;
            items.insert(key.to_string(), value.to_string());
            Ok(())
        })
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        self.mutate(key, |items| {
            items.remove(key);
            Ok(())
        })
    }

    fn keys(&self) -> Result<Vec<String>> {
        let items = self.items.lock().map_err(|_| lock_failed("file backend"))?;
        Ok(items.keys().cloned().collect())
    }
}

/// Approximate space used by the namespaced keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageUsage {
    pub used_bytes: u64,
    pub quota_bytes: u64,
}

impl StorageUsage {
    pub fn percent(&self) -> f64 {
        if self.quota_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.quota_bytes as f64 * 100.0
    }
}

/// Namespaced JSON store over a [`KeyValueBackend`].
pub struct KeyValueStore {
    backend: Arc<dyn KeyValueBackend>,
    prefix: String,
    quota_bytes: u64,
}

impl KeyValueStore {
    pub fn new(backend: Arc<dyn KeyValueBackend>, prefix: &str, quota_bytes: u64) -> Self {
        Self {
            backend,
            prefix: prefix.to_string(),
            quota_bytes,
        }
    }

    /// Ephemeral store, mostly for tests.
    pub fn in_memory(prefix: &str) -> Self {
        Self::new(Arc::new(MemoryBackend::new()), prefix, 5 * 1024 * 1024)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Serializes `value` and stores it under the namespaced key.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let text = serde_json::to_string(value).map_err(|e| {
            error!("Failed to serialize value for {}: {}", key, e);
            MemoError::storage(StorageErrorCode::InvalidFormat, e.to_string())
        })?;
        self.backend.set_item(&self.namespaced(key), &text)
    }

    /// Returns the deserialized value, or `None` when the key is absent.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.backend.get_item(&self.namespaced(key))? {
            None => Ok(None),
            Some(text) => serde_json::from_str(&text).map(Some).map_err(|e| {
                error!("Stored value for {} is corrupted: {}", key, e);
                MemoError::storage(
                    StorageErrorCode::CorruptedData,
                    format!("value stored under {} is not valid JSON: {}", key, e),
                )
            }),
        }
    }

    pub fn get_raw(&self, key: &str) -> Result<Option<String>> {
        self.backend.get_item(&self.namespaced(key))
    }

    /// Stores already-serialized text after checking that it parses.
    pub fn set_raw(&self, key: &str, text: &str) -> Result<()> {
        serde_json::from_str::<serde_json::Value>(text).map_err(|e| {
            MemoError::storage(StorageErrorCode::InvalidFormat, e.to_string())
        })?;
        self.backend.set_item(&self.namespaced(key), text)
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.backend.remove_item(&self.namespaced(key))
    }

    /// Removes only keys under this store's prefix.
    pub fn clear(&self) -> Result<()> {
        let keys = self.namespaced_keys()?;
        debug!("Clearing {} keys under prefix {}", keys.len(), self.prefix);
        for key in keys {
            self.backend.remove_item(&key)?;
        }
        Ok(())
    }

    pub fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.backend.get_item(&self.namespaced(key))?.is_some())
    }

    /// Namespaced keys with the prefix stripped.
    pub fn list_keys(&self) -> Result<Vec<String>> {
        Ok(self
            .namespaced_keys()?
            .into_iter()
            .map(|k| k[self.prefix.len()..].to_string())
            .collect())
    }

    pub fn usage(&self) -> Result<StorageUsage> {
        let mut used_bytes = 0u64;
        for key in self.namespaced_keys()? {
            let value_len = self
                .backend
                .get_item(&key)?
                .map(|v| v.len())
                .unwrap_or(0);
            used_bytes += (key.len() + value_len) as u64;
        }
        Ok(StorageUsage {
            used_bytes,
            quota_bytes: self.quota_bytes,
        })
    }

    fn namespaced_keys(&self) -> Result<Vec<String>> {
        Ok(self
            .backend
            .keys()?
            .into_iter()
            .filter(|k| k.starts_with(&self.prefix))
            .collect())
    }
}

/// An entity that can live in a [`RecordCollection`].
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync {
    fn record_id(&self) -> &str;
}

/// One entity kind stored as a JSON array under a single key.
pub struct RecordCollection<T> {
    store: Arc<KeyValueStore>,
    key: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Record> RecordCollection<T> {
    pub fn new(store: Arc<KeyValueStore>, key: &'static str) -> Self {
        Self {
            store,
            key,
            _marker: PhantomData,
        }
    }

    pub fn key(&self) -> &'static str {
        self.key
    }

    /// All records in storage order.
    pub fn load_all(&self) -> Result<Vec<T>> {
        Ok(self.store.get::<Vec<T>>(self.key)?.unwrap_or_default())
    }

    pub fn find(&self, id: &str) -> Result<Option<T>> {
        Ok(self.load_all()?.into_iter().find(|r| r.record_id() == id))
    }

    /// Replaces the record with the same id in place, or appends it.
    pub fn upsert(&self, record: &T) -> Result<()> {
        let mut records = self.load_all()?;
        match records
            .iter_mut()
            .find(|r| r.record_id() == record.record_id())
        {
            Some(existing) => *existing = record.clone(),
            None => records.push(record.clone()),
        }
        self.store.set(self.key, &records)
    }

    /// Removes the record with `id`. Returns whether one was removed.
    pub fn remove(&self, id: &str) -> Result<bool> {
        let mut records = self.load_all()?;
        let before = records.len();
        records.retain(|r| r.record_id() != id);
        if records.len() == before {
            return Ok(false);
        }
        self.store.set(self.key, &records)?;
        Ok(true)
    }

    /// Removes every record matching `predicate` and returns them.
    pub fn remove_where(&self, predicate: impl Fn(&T) -> bool) -> Result<Vec<T>> {
        let (removed, kept): (Vec<T>, Vec<T>) =
            self.load_all()?.into_iter().partition(|r| predicate(r));
        if !removed.is_empty() {
            self.store.set(self.key, &kept)?;
        }
        Ok(removed)
    }

    pub fn replace_all(&self, records: &[T]) -> Result<()> {
        self.store.set(self.key, records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        id: String,
        value: u32,
    }

    impl Record for Item {
        fn record_id(&self) -> &str {
            &self.id
        }
    }

    #[test]
    fn values_are_namespaced_and_round_trip() {
        let backend = Arc::new(MemoryBackend::new());
        let store = KeyValueStore::new(backend.clone(), "memo_", 1024);

        store.set("answer", &42u32).unwrap();
        assert_eq!(store.get::<u32>("answer").unwrap(), Some(42));
        assert!(backend.get_item("memo_answer").unwrap().is_some());
        assert_eq!(store.get::<u32>("missing").unwrap(), None);
        assert!(store.exists("answer").unwrap());
    }

    #[test]
    fn clear_leaves_foreign_keys_untouched() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_item("other_app", "\"keep\"").unwrap();
        let store = KeyValueStore::new(backend.clone(), "memo_", 1024);
        store.set("a", &1).unwrap();
        store.set("b", &2).unwrap();

        assert_eq!(store.list_keys().unwrap(), vec!["a", "b"]);
        store.clear().unwrap();

        assert!(store.list_keys().unwrap().is_empty());
        assert_eq!(backend.get_item("other_app").unwrap().as_deref(), Some("\"keep\""));
    }

    #[test]
    fn corrupted_values_are_reported() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_item("memo_bad", "{not json").unwrap();
        let store = KeyValueStore::new(backend, "memo_", 1024);

        let err = store.get::<u32>("bad").unwrap_err();
        assert_eq!(err.storage_code(), Some(StorageErrorCode::CorruptedData));
    }

    #[test]
    fn quota_is_enforced() {
        let store = KeyValueStore::new(Arc::new(MemoryBackend::with_quota(32)), "m_", 32);
        store.set("small", "ok").unwrap();

        let err = store.set("big", &"x".repeat(64)).unwrap_err();
        assert_eq!(err.storage_code(), Some(StorageErrorCode::QuotaExceeded));
        assert!(!store.exists("big").unwrap());

        let usage = store.usage().unwrap();
        assert!(usage.used_bytes > 0);
        assert!(usage.percent() <= 100.0);
    }

    #[test]
    fn file_backend_persists_between_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        {
            let backend = FileBackend::open(&path, None).unwrap();
            backend.set_item("k", "\"v\"").unwrap();
        }

        let reopened = FileBackend::open(&path, None).unwrap();
        assert_eq!(reopened.get_item("k").unwrap().as_deref(), Some("\"v\""));
        reopened.remove_item("k").unwrap();
        assert!(FileBackend::open(&path, None).unwrap().keys().unwrap().is_empty());
    }

    #[test]
    fn file_backend_rejects_corrupted_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        fs::write(&path, "not json").unwrap();

        let err = FileBackend::open(&path, None).unwrap_err();
        assert_eq!(err.storage_code(), Some(StorageErrorCode::CorruptedData));
    }

    #[test]
    fn collection_upsert_and_remove() {
        let store = Arc::new(KeyValueStore::in_memory("t_"));
        let items: RecordCollection<Item> = RecordCollection::new(store, "items");

        items.upsert(&Item { id: "a".into(), value: 1 }).unwrap();
        items.upsert(&Item { id: "b".into(), value: 2 }).unwrap();
        items.upsert(&Item { id: "a".into(), value: 3 }).unwrap();

        let all = items.load_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].value, 3);

        assert!(items.remove("a").unwrap());
        assert!(!items.remove("a").unwrap());
        let removed = items.remove_where(|i| i.value == 2).unwrap();
        assert_eq!(removed.len(), 1);
        assert!(items.load_all().unwrap().is_empty());
    }
}
