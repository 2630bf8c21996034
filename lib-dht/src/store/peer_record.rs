//! Store of validated signed peer records, one per key.
//!
//! Writes go through the full validation chain and `should_replace` conflict
//! resolution, so a stale or forged record can never displace a good one.

use crate::error::DhtError;
use crate::record::validator::{RecordValidator, CLOCK_SKEW_TOLERANCE};
use crate::record::SignedRealmPeerRecord;
use parking_lot::RwLock;
use std::collections::HashMap;

pub struct PeerRecordStore {
    entries: RwLock<HashMap<String, SignedRealmPeerRecord>>,
    validator: RecordValidator,
}

impl Default for PeerRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerRecordStore {
    pub fn new() -> Self {
        PeerRecordStore {
            entries: RwLock::new(HashMap::new()),
            validator: RecordValidator::new(),
        }
    }

    /// Validate and store `signed` under `key`, applying conflict resolution
    /// against any existing record. The write is atomic in local memory.
    pub fn put(&self, key: &str, signed: SignedRealmPeerRecord) -> Result<(), DhtError> {
        let mut entries = self.entries.write();
        self.validator.should_replace(key, entries.get(key), &signed)?;
        entries.insert(key.to_string(), signed);
        Ok(())
    }

    /// Fetch the record under `key`, hiding expired entries.
    pub fn get(&self, key: &str) -> Option<SignedRealmPeerRecord> {
        let entries = self.entries.read();
        let record = entries.get(key)?;
        if record.record.is_expired(CLOCK_SKEW_TOLERANCE) {
            return None;
        }
        Some(record.clone())
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.write().remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Scan and drop expired records. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, signed| !signed.record.is_expired(CLOCK_SKEW_TOLERANCE));
        before - entries.len()
    }
}
