//! Provider announcements: key → set of peers that can serve the content.

use crate::host::KvStore;
use crate::store::persistent::{self, StoredProvider};
use crate::types::{unix_now_ns, NodeId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// One peer's announcement for a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderRecord {
    pub peer_id: NodeId,
    pub addrs: Vec<String>,
    pub expires_at_ns: u64,
}

impl ProviderRecord {
    pub fn new(peer_id: NodeId, addrs: Vec<String>, ttl: Duration) -> Self {
        ProviderRecord {
            peer_id,
            addrs,
            expires_at_ns: unix_now_ns().saturating_add(ttl.as_nanos() as u64),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at_ns < unix_now_ns()
    }
}

/// Thread-safe provider store with per-record expiry.
pub struct ProviderStore {
    entries: RwLock<HashMap<String, HashMap<NodeId, ProviderRecord>>>,
    kv: Option<Arc<dyn KvStore>>,
}

impl ProviderStore {
    pub fn new(kv: Option<Arc<dyn KvStore>>) -> Self {
        ProviderStore {
            entries: RwLock::new(HashMap::new()),
            kv,
        }
    }

    /// Add or refresh a provider record for `key`.
    pub fn add(&self, key: &str, record: ProviderRecord) {
        if let Some(kv) = &self.kv {
            let stored = StoredProvider::from_record(&record);
            let kv_key = persistent::provider_kv_key(key, &record.peer_id);
            if let Err(e) = kv.put(&kv_key, &stored.to_bytes()) {
                warn!(key, error = %e, "provider write-through failed");
            }
        }
        self.entries
            .write()
            .entry(key.to_string())
            .or_default()
            .insert(record.peer_id, record);
    }

    /// Providers for `key`, hiding expired records.
    pub fn get(&self, key: &str) -> Vec<ProviderRecord> {
        let entries = self.entries.read();
        entries
            .get(key)
            .map(|records| {
                records
                    .values()
                    .filter(|r| !r.is_expired())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remove one peer's announcement for `key`.
    pub fn remove(&self, key: &str, peer_id: &NodeId) -> bool {
        if let Some(kv) = &self.kv {
            let _ = kv.delete(&persistent::provider_kv_key(key, peer_id));
        }
        let mut entries = self.entries.write();
        let Some(records) = entries.get_mut(key) else {
            return false;
        };
        let removed = records.remove(peer_id).is_some();
        if records.is_empty() {
            entries.remove(key);
        }
        removed
    }

    /// Rewrite the address set on every record announced by the local node.
    pub fn update_local_addrs(&self, local_id: &NodeId, addrs: &[String]) {
        let mut entries = self.entries.write();
        for (key, records) in entries.iter_mut() {
            if let Some(record) = records.get_mut(local_id) {
                record.addrs = addrs.to_vec();
                if let Some(kv) = &self.kv {
                    let stored = StoredProvider::from_record(record);
                    let kv_key = persistent::provider_kv_key(key, local_id);
                    if let Err(e) = kv.put(&kv_key, &stored.to_bytes()) {
                        warn!(key, error = %e, "provider write-through failed");
                    }
                }
            }
        }
    }

    /// Keys currently announced by the local node (for re-announcement).
    pub fn keys_provided_by(&self, local_id: &NodeId) -> Vec<String> {
        self.entries
            .read()
            .iter()
            .filter(|(_, records)| records.contains_key(local_id))
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().values().map(|r| r.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Scan and drop expired records. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let mut entries = self.entries.write();
        let mut removed = 0usize;
        entries.retain(|key, records| {
            records.retain(|peer_id, record| {
                let keep = !record.is_expired();
                if !keep {
                    removed += 1;
                    if let Some(kv) = &self.kv {
                        let _ = kv.delete(&persistent::provider_kv_key(key, peer_id));
                    }
                }
                keep
            });
            !records.is_empty()
        });
        removed
    }

    /// Replay persisted records, discarding (and deleting) expired ones.
    pub fn load_persisted(&self) {
        let Some(kv) = &self.kv else { return };
        let loaded = match kv.scan_prefix(persistent::PROVIDER_KV_PREFIX) {
            Ok(pairs) => pairs,
            Err(e) => {
                warn!(error = %e, "provider store replay failed");
                return;
            }
        };
        let mut entries = self.entries.write();
        let mut restored = 0usize;
        for (kv_key, bytes) in loaded {
            let Some((key, _)) = persistent::split_provider_kv_key(&kv_key) else {
                continue;
            };
            match StoredProvider::from_bytes(&bytes).and_then(|s| s.into_record()) {
                Some(record) if !record.is_expired() => {
                    entries
                        .entry(key.to_string())
                        .or_default()
                        .insert(record.peer_id, record);
                    restored += 1;
                }
                _ => {
                    let _ = kv.delete(&kv_key);
                }
            }
        }
        debug!(restored, "provider store replayed from kv");
    }
}
