//! Core identity and peer types for the overlay DHT.
//!
//! `NodeId` is the canonical 32-byte identity of a node, derived from its
//! public key by hashing the serialized key bytes. `RealmId` is an opaque
//! tenant scope; the empty realm is the global scope.

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Length of a node identifier in bytes.
pub const NODE_ID_LEN: usize = 32;

/// Canonical node identifier: SHA-256 of the node's serialized public key.
///
/// The derivation must match the identity layer bit-for-bit; the record
/// validator re-derives it from the public key carried in signed records.
/// Serializes as lowercase hex so ids are readable in wire messages and
/// persisted snapshots.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let hex_str = String::deserialize(deserializer)?;
        NodeId::from_hex(&hex_str)
            .ok_or_else(|| serde::de::Error::custom("node id is not 32 bytes of hex"))
    }
}

impl NodeId {
    /// Build from raw bytes.
    pub fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        NodeId(bytes)
    }

    /// Derive the identity from a public key (SHA-256 over the serialized key).
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        Self::from_public_key_bytes(key.as_bytes())
    }

    /// Derive the identity from serialized public key bytes.
    pub fn from_public_key_bytes(key_bytes: &[u8]) -> Self {
        let digest = Sha256::digest(key_bytes);
        let mut id = [0u8; NODE_ID_LEN];
        id.copy_from_slice(&digest);
        NodeId(id)
    }

    /// Generate a random node id (bucket refresh probes, tests).
    pub fn random() -> Self {
        let mut id = [0u8; NODE_ID_LEN];
        rand::Rng::fill(&mut rand::thread_rng(), &mut id);
        NodeId(id)
    }

    /// The all-zero id, used as the "empty sender" sentinel on the wire.
    pub fn zero() -> Self {
        NodeId([0u8; NODE_ID_LEN])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; NODE_ID_LEN]
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a lowercase hex id as produced by [`NodeId::to_hex`].
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; NODE_ID_LEN] = bytes.try_into().ok()?;
        Some(NodeId(arr))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}..)", &self.to_hex()[..8])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Opaque tenant scope carried in keys and records.
///
/// The empty realm is the global scope; realm-scoped keys embed the SHA-256
/// of the realm id, never the id itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct RealmId(String);

impl RealmId {
    pub fn new(id: impl Into<String>) -> Self {
        RealmId(id.into())
    }

    /// The global (empty) realm.
    pub fn global() -> Self {
        RealmId(String::new())
    }

    pub fn is_global(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lowercase hex SHA-256 of the realm id, as embedded in realm keys.
    pub fn hash_hex(&self) -> String {
        hex::encode(Sha256::digest(self.0.as_bytes()))
    }
}

/// NAT classification reported by the reachability checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NatType {
    None,
    FullCone,
    RestrictedCone,
    PortRestricted,
    Symmetric,
    Unknown,
}

/// Dialability of the local node as seen from the outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reachability {
    /// Directly dialable.
    Public,
    /// Reachable only through a relay.
    Private,
    Unknown,
}

/// Where an address-book / peerstore entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerSource {
    /// Learned through a DHT lookup.
    Dht,
    /// Learned from realm member-list gossip.
    MemberList,
    /// Imported from an external address book.
    AddressBook,
    /// Statically configured.
    Static,
}

/// A peer with its dialable addresses; the currency of discovery results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub node_id: NodeId,
    pub addrs: Vec<String>,
}

impl PeerInfo {
    pub fn new(node_id: NodeId, addrs: Vec<String>) -> Self {
        PeerInfo { node_id, addrs }
    }
}

/// A node tracked by the routing table.
///
/// `last_seen` and `fail_count` move monotonically under observation: a
/// successful interaction advances `last_seen` to now and clears the failure
/// counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingNode {
    pub node_id: NodeId,
    pub addrs: Vec<String>,
    /// Unix seconds of the last successful interaction.
    pub last_seen: u64,
    /// Unix seconds of the last query we sent this node.
    pub last_query: u64,
    /// Smoothed round-trip time in milliseconds, if measured.
    pub rtt_ms: Option<u64>,
    pub fail_count: u32,
    pub realm_id: Option<RealmId>,
}

impl RoutingNode {
    pub fn new(node_id: NodeId, addrs: Vec<String>) -> Self {
        let now = unix_now_secs();
        RoutingNode {
            node_id,
            addrs,
            last_seen: now,
            last_query: 0,
            rtt_ms: None,
            fail_count: 0,
            realm_id: None,
        }
    }

    pub fn with_realm(mut self, realm: RealmId) -> Self {
        self.realm_id = Some(realm);
        self
    }

    /// True once `expire_secs` have elapsed without a `last_seen` refresh.
    pub fn is_expired(&self, expire_secs: u64) -> bool {
        unix_now_secs().saturating_sub(self.last_seen) > expire_secs
    }

    /// Record a successful interaction.
    pub fn mark_responsive(&mut self) {
        self.last_seen = unix_now_secs();
        self.fail_count = 0;
    }

    /// Record a failed interaction.
    pub fn mark_failed(&mut self) {
        self.fail_count = self.fail_count.saturating_add(1);
    }

    pub fn mark_queried(&mut self) {
        self.last_query = unix_now_secs();
    }
}

/// Unix timestamp in whole seconds.
pub(crate) fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Unix timestamp in nanoseconds, as carried in signed records.
pub(crate) fn unix_now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}
