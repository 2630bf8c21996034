//! TTL-keyed blob store.

use crate::host::KvStore;
use crate::store::persistent::{self, StoredValue};
use crate::types::unix_now_ns;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A stored blob and its expiry instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueRecord {
    pub bytes: Vec<u8>,
    pub expires_at_ns: u64,
}

impl ValueRecord {
    pub fn is_expired(&self) -> bool {
        self.expires_at_ns < unix_now_ns()
    }
}

/// Thread-safe value store with per-entry TTL.
pub struct ValueStore {
    entries: RwLock<HashMap<String, ValueRecord>>,
    kv: Option<Arc<dyn KvStore>>,
}

impl ValueStore {
    pub fn new(kv: Option<Arc<dyn KvStore>>) -> Self {
        ValueStore {
            entries: RwLock::new(HashMap::new()),
            kv,
        }
    }

    /// Store `bytes` under `key` for `ttl`. Overwrites any previous entry.
    pub fn put(&self, key: &str, bytes: Vec<u8>, ttl: Duration) {
        let record = ValueRecord {
            bytes,
            expires_at_ns: unix_now_ns().saturating_add(ttl.as_nanos() as u64),
        };
        if let Some(kv) = &self.kv {
            let stored = StoredValue::from_record(&record);
            if let Err(e) = kv.put(&persistent::value_kv_key(key), &stored.to_bytes()) {
                warn!(key, error = %e, "value write-through failed");
            }
        }
        self.entries.write().insert(key.to_string(), record);
    }

    /// Fetch a value, hiding expired entries.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let entries = self.entries.read();
        let record = entries.get(key)?;
        if record.is_expired() {
            return None;
        }
        Some(record.bytes.clone())
    }

    pub fn remove(&self, key: &str) -> bool {
        if let Some(kv) = &self.kv {
            if let Err(e) = kv.delete(&persistent::value_kv_key(key)) {
                warn!(key, error = %e, "value delete write-through failed");
            }
        }
        self.entries.write().remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Scan and drop expired entries. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, r)| r.is_expired())
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            entries.remove(key);
            if let Some(kv) = &self.kv {
                let _ = kv.delete(&persistent::value_kv_key(key));
            }
        }
        before - entries.len()
    }

    /// Replay persisted entries, discarding (and deleting) expired ones.
    pub fn load_persisted(&self) {
        let Some(kv) = &self.kv else { return };
        let loaded = match kv.scan_prefix(persistent::VALUE_KV_PREFIX) {
            Ok(pairs) => pairs,
            Err(e) => {
                warn!(error = %e, "value store replay failed");
                return;
            }
        };
        let mut entries = self.entries.write();
        let mut restored = 0usize;
        for (kv_key, bytes) in loaded {
            let Some(key) = kv_key.strip_prefix(persistent::VALUE_KV_PREFIX) else {
                continue;
            };
            match StoredValue::from_bytes(&bytes).and_then(|s| s.into_record()) {
                Some(record) if !record.is_expired() => {
                    entries.insert(key.to_string(), record);
                    restored += 1;
                }
                _ => {
                    let _ = kv.delete(&kv_key);
                }
            }
        }
        debug!(restored, "value store replayed from kv");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryKvStore;

    #[test]
    fn test_put_get_round_trip() {
        let store = ValueStore::new(None);
        store.put("k", b"v".to_vec(), Duration::from_secs(3600));
        assert_eq!(store.get("k"), Some(b"v".to_vec()));
        assert_eq!(store.get("missing"), None);
    }

    #[test]
    fn test_expired_values_are_hidden_and_cleaned() {
        let store = ValueStore::new(None);
        store.put("short", b"v".to_vec(), Duration::ZERO);
        store.put("long", b"v".to_vec(), Duration::from_secs(3600));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(store.get("short"), None);
        assert_eq!(store.cleanup_expired(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("long"), Some(b"v".to_vec()));
    }

    #[test]
    fn test_overwrite_refreshes_ttl() {
        let store = ValueStore::new(None);
        store.put("k", b"v1".to_vec(), Duration::ZERO);
        store.put("k", b"v2".to_vec(), Duration::from_secs(3600));
        assert_eq!(store.get("k"), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_write_through_and_replay() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let store = ValueStore::new(Some(kv.clone()));
        store.put("alive", b"v".to_vec(), Duration::from_secs(3600));
        store.put("dead", b"v".to_vec(), Duration::ZERO);
        std::thread::sleep(Duration::from_millis(5));

        let restored = ValueStore::new(Some(kv.clone()));
        restored.load_persisted();
        assert_eq!(restored.get("alive"), Some(b"v".to_vec()));
        assert_eq!(restored.get("dead"), None);
        assert_eq!(restored.len(), 1);
        // The expired entry was deleted from the engine during replay.
        assert!(kv
            .scan_prefix(persistent::VALUE_KV_PREFIX)
            .unwrap()
            .iter()
            .all(|(k, _)| !k.contains("dead")));
    }

    #[test]
    fn test_replay_from_file_backed_store() {
        use crate::host::FileKvStore;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("values.json");

        let kv: Arc<dyn KvStore> = Arc::new(FileKvStore::open(&path).unwrap());
        let store = ValueStore::new(Some(kv));
        store.put("alive", b"v".to_vec(), Duration::from_secs(3600));
        store.put("dead", b"v".to_vec(), Duration::ZERO);
        std::thread::sleep(Duration::from_millis(5));
        drop(store);

        // A fresh store over the same file sees only the live entry.
        let kv: Arc<dyn KvStore> = Arc::new(FileKvStore::open(&path).unwrap());
        let restored = ValueStore::new(Some(kv.clone()));
        restored.load_persisted();
        assert_eq!(restored.get("alive"), Some(b"v".to_vec()));
        assert_eq!(restored.get("dead"), None);
        assert_eq!(restored.len(), 1);
        // Replay pruned the expired entry from the file as well.
        assert_eq!(kv.scan_prefix(persistent::VALUE_KV_PREFIX).unwrap().len(), 1);
    }

    #[test]
    fn test_remove_deletes_from_kv() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let store = ValueStore::new(Some(kv.clone()));
        store.put("k", b"v".to_vec(), Duration::from_secs(3600));
        assert!(store.remove("k"));
        assert!(kv.scan_prefix(persistent::VALUE_KV_PREFIX).unwrap().is_empty());
    }
}
