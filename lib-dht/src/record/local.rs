//! Local signed-record lifecycle.
//!
//! Owns the local sequence counter, the signing key, and the snapshot of the
//! last published address sets. Republish decisions compare address multisets
//! order-insensitively so that shuffled address lists do not trigger churn.

use crate::error::DhtError;
use crate::record::{RealmPeerRecord, SignedRealmPeerRecord};
use crate::types::{unix_now_ns, unix_now_secs, NatType, NodeId, Reachability, RealmId};
use ed25519_dalek::SigningKey;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Default)]
struct Inner {
    signing_key: Option<SigningKey>,
    node_id: Option<NodeId>,
    realm_id: RealmId,
    last_record: Option<SignedRealmPeerRecord>,
    /// Unix seconds of the last publish; `None` until first publish.
    last_publish_secs: Option<u64>,
    last_direct_addrs: Vec<String>,
    last_relay_addrs: Vec<String>,
}

/// Manages the node's own signed records.
pub struct LocalRecordManager {
    seq: AtomicU64,
    inner: Mutex<Inner>,
}

impl Default for LocalRecordManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalRecordManager {
    pub fn new() -> Self {
        LocalRecordManager {
            seq: AtomicU64::new(0),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Install the signing identity. Required before any record creation.
    pub fn initialize(&self, signing_key: SigningKey, node_id: NodeId, realm_id: RealmId) {
        let mut inner = self.inner.lock();
        inner.signing_key = Some(signing_key);
        inner.node_id = Some(node_id);
        inner.realm_id = realm_id;
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.lock().signing_key.is_some()
    }

    /// Hot-swap the realm on join/leave; subsequent records use the new realm.
    pub fn set_realm_id(&self, realm_id: RealmId) {
        self.inner.lock().realm_id = realm_id;
    }

    pub fn realm_id(&self) -> RealmId {
        self.inner.lock().realm_id.clone()
    }

    pub fn node_id(&self) -> Option<NodeId> {
        self.inner.lock().node_id
    }

    pub fn last_record(&self) -> Option<SignedRealmPeerRecord> {
        self.inner.lock().last_record.clone()
    }

    pub fn current_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Build, sign, and snapshot a new record with the next sequence number.
    #[allow(clippy::too_many_arguments)]
    pub fn create_signed_record(
        &self,
        direct_addrs: Vec<String>,
        relay_addrs: Vec<String>,
        nat_type: NatType,
        reachability: Reachability,
        capabilities: Vec<String>,
        ttl: Duration,
    ) -> Result<SignedRealmPeerRecord, DhtError> {
        let mut inner = self.inner.lock();
        let (Some(signing_key), Some(node_id)) = (inner.signing_key.clone(), inner.node_id) else {
            return Err(DhtError::NotStarted);
        };

        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let record = RealmPeerRecord {
            node_id,
            realm_id: inner.realm_id.clone(),
            direct_addrs: direct_addrs.clone(),
            relay_addrs: relay_addrs.clone(),
            nat_type,
            reachability,
            capabilities,
            seq,
            timestamp_ns: unix_now_ns(),
            ttl_ms: ttl.as_millis() as u64,
        };
        let signed = record.sign(&signing_key)?;

        inner.last_record = Some(signed.clone());
        inner.last_publish_secs = Some(unix_now_secs());
        inner.last_direct_addrs = direct_addrs;
        inner.last_relay_addrs = relay_addrs;
        Ok(signed)
    }

    /// True if never published, the interval elapsed, or either address
    /// multiset changed (order-insensitive).
    pub fn needs_republish(&self, interval: Duration, direct: &[String], relay: &[String]) -> bool {
        let inner = self.inner.lock();
        let Some(last_publish) = inner.last_publish_secs else {
            return true;
        };
        if unix_now_secs().saturating_sub(last_publish) >= interval.as_secs() {
            return true;
        }
        !same_multiset(direct, &inner.last_direct_addrs)
            || !same_multiset(relay, &inner.last_relay_addrs)
    }

    /// Drop signing material and the publish snapshot.
    ///
    /// `node_id` and `realm_id` are retained so an unpublish can still
    /// compute the keys to delete.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.signing_key = None;
        inner.last_record = None;
        inner.last_publish_secs = None;
        inner.last_direct_addrs.clear();
        inner.last_relay_addrs.clear();
    }
}

fn same_multiset(a: &[String], b: &[String]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a_sorted: Vec<&String> = a.iter().collect();
    let mut b_sorted: Vec<&String> = b.iter().collect();
    a_sorted.sort();
    b_sorted.sort();
    a_sorted == b_sorted
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn initialized_manager() -> LocalRecordManager {
        let manager = LocalRecordManager::new();
        let key = SigningKey::generate(&mut OsRng);
        let node_id = NodeId::from_public_key(&key.verifying_key());
        manager.initialize(key, node_id, RealmId::new("tenant"));
        manager
    }

    #[test]
    fn test_create_requires_initialization() {
        let manager = LocalRecordManager::new();
        let result = manager.create_signed_record(
            vec![],
            vec![],
            NatType::Unknown,
            Reachability::Unknown,
            vec![],
            Duration::from_secs(3600),
        );
        assert!(matches!(result, Err(DhtError::NotStarted)));
    }

    #[test]
    fn test_seq_increments_per_record() {
        let manager = initialized_manager();
        for expected in 1..=3u64 {
            let signed = manager
                .create_signed_record(
                    vec!["/ip4/1.2.3.4/tcp/4001".to_string()],
                    vec![],
                    NatType::None,
                    Reachability::Public,
                    vec![],
                    Duration::from_secs(3600),
                )
                .unwrap();
            assert_eq!(signed.record.seq, expected);
            assert!(signed.verify_signature());
        }
        assert_eq!(manager.current_seq(), 3);
    }

    #[test]
    fn test_needs_republish_before_first_publish() {
        let manager = initialized_manager();
        assert!(manager.needs_republish(Duration::from_secs(3600), &[], &[]));
    }

    #[test]
    fn test_needs_republish_on_address_change_only() {
        let manager = initialized_manager();
        let direct = vec![
            "/ip4/1.2.3.4/tcp/4001".to_string(),
            "/ip4/5.6.7.8/tcp/4001".to_string(),
        ];
        manager
            .create_signed_record(
                direct.clone(),
                vec![],
                NatType::None,
                Reachability::Public,
                vec![],
                Duration::from_secs(3600),
            )
            .unwrap();

        // Same multiset, different order: no republish needed.
        let shuffled = vec![direct[1].clone(), direct[0].clone()];
        assert!(!manager.needs_republish(Duration::from_secs(3600), &shuffled, &[]));

        // New direct address: republish.
        let changed = vec![direct[0].clone(), "/ip4/9.9.9.9/tcp/4001".to_string()];
        assert!(manager.needs_republish(Duration::from_secs(3600), &changed, &[]));

        // New relay set: republish.
        assert!(manager.needs_republish(
            Duration::from_secs(3600),
            &direct,
            &["/ip4/7.7.7.7/tcp/4001/p2p-circuit".to_string()],
        ));

        // Zero interval means the elapsed check always fires.
        assert!(manager.needs_republish(Duration::ZERO, &direct, &[]));
    }

    #[test]
    fn test_realm_hot_swap_applies_to_next_record() {
        let manager = initialized_manager();
        let first = manager
            .create_signed_record(
                vec![],
                vec![],
                NatType::None,
                Reachability::Public,
                vec![],
                Duration::from_secs(3600),
            )
            .unwrap();
        assert_eq!(first.record.realm_id, RealmId::new("tenant"));

        manager.set_realm_id(RealmId::new("other"));
        let second = manager
            .create_signed_record(
                vec![],
                vec![],
                NatType::None,
                Reachability::Public,
                vec![],
                Duration::from_secs(3600),
            )
            .unwrap();
        assert_eq!(second.record.realm_id, RealmId::new("other"));
        assert_eq!(second.record.seq, 2);
    }

    #[test]
    fn test_clear_retains_identity_for_unpublish() {
        let manager = initialized_manager();
        manager
            .create_signed_record(
                vec![],
                vec![],
                NatType::None,
                Reachability::Public,
                vec![],
                Duration::from_secs(3600),
            )
            .unwrap();
        let node_id = manager.node_id().unwrap();
        manager.clear();
        assert!(!manager.is_initialized());
        assert!(manager.last_record().is_none());
        assert_eq!(manager.node_id(), Some(node_id));
        assert_eq!(manager.realm_id(), RealmId::new("tenant"));
        assert!(manager.needs_republish(Duration::from_secs(3600), &[], &[]));
    }
}
