//! Envelopes and key layout for write-through persistence.
//!
//! Layout in the external key/value engine:
//! - `dht/v/<key>` → `{value_b64, expires_at_ns}`
//! - `dht/p/<key>/<peer_id>` → `{peer_id, addrs, expires_at_ns}`
//! - `dht/r/<bucket:03>/<node_id>` → routing node snapshot
//!
//! All writes are best-effort: failures are logged by the callers and never
//! fail the in-memory operation.

use crate::distance::bucket_index;
use crate::store::provider::ProviderRecord;
use crate::store::value::ValueRecord;
use crate::types::{NodeId, RoutingNode};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::host::KvStore;

pub const VALUE_KV_PREFIX: &str = "dht/v/";
pub const PROVIDER_KV_PREFIX: &str = "dht/p/";
pub const ROUTING_KV_PREFIX: &str = "dht/r/";

pub fn value_kv_key(key: &str) -> String {
    format!("{}{}", VALUE_KV_PREFIX, key)
}

pub fn provider_kv_key(key: &str, peer_id: &NodeId) -> String {
    format!("{}{}/{}", PROVIDER_KV_PREFIX, key, peer_id.to_hex())
}

/// Split a provider kv key back into `(store_key, peer_hex)`.
///
/// The store key itself contains slashes, so the peer id is the final
/// segment.
pub fn split_provider_kv_key(kv_key: &str) -> Option<(&str, &str)> {
    kv_key
        .strip_prefix(PROVIDER_KV_PREFIX)?
        .rsplit_once('/')
}

pub fn routing_kv_key(local: &NodeId, node: &NodeId) -> String {
    format!(
        "{}{:03}/{}",
        ROUTING_KV_PREFIX,
        bucket_index(local, node),
        node.to_hex()
    )
}

/// Persisted value envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct StoredValue {
    pub value_b64: String,
    pub expires_at_ns: u64,
}

impl StoredValue {
    pub fn from_record(record: &ValueRecord) -> Self {
        StoredValue {
            value_b64: BASE64.encode(&record.bytes),
            expires_at_ns: record.expires_at_ns,
        }
    }

    pub fn into_record(self) -> Option<ValueRecord> {
        Some(ValueRecord {
            bytes: BASE64.decode(&self.value_b64).ok()?,
            expires_at_ns: self.expires_at_ns,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

/// Persisted provider envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct StoredProvider {
    pub peer_id: String,
    pub addrs: Vec<String>,
    pub expires_at_ns: u64,
}

impl StoredProvider {
    pub fn from_record(record: &ProviderRecord) -> Self {
        StoredProvider {
            peer_id: record.peer_id.to_hex(),
            addrs: record.addrs.clone(),
            expires_at_ns: record.expires_at_ns,
        }
    }

    pub fn into_record(self) -> Option<ProviderRecord> {
        Some(ProviderRecord {
            peer_id: NodeId::from_hex(&self.peer_id)?,
            addrs: self.addrs,
            expires_at_ns: self.expires_at_ns,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

/// Best-effort snapshot of one routing node.
pub fn persist_routing_node(kv: &Arc<dyn KvStore>, local: &NodeId, node: &RoutingNode) {
    let key = routing_kv_key(local, &node.node_id);
    match serde_json::to_vec(node) {
        Ok(bytes) => {
            if let Err(e) = kv.put(&key, &bytes) {
                warn!(node = %node.node_id, error = %e, "routing snapshot write failed");
            }
        }
        Err(e) => warn!(node = %node.node_id, error = %e, "routing snapshot encode failed"),
    }
}

pub fn delete_routing_node(kv: &Arc<dyn KvStore>, local: &NodeId, node_id: &NodeId) {
    let _ = kv.delete(&routing_kv_key(local, node_id));
}

/// Replay routing node snapshots, discarding expired ones.
pub fn load_routing_nodes(kv: &Arc<dyn KvStore>, expire_secs: u64) -> Vec<RoutingNode> {
    let pairs = match kv.scan_prefix(ROUTING_KV_PREFIX) {
        Ok(pairs) => pairs,
        Err(e) => {
            warn!(error = %e, "routing snapshot replay failed");
            return Vec::new();
        }
    };
    let mut nodes = Vec::new();
    for (kv_key, bytes) in pairs {
        match serde_json::from_slice::<RoutingNode>(&bytes) {
            Ok(node) if !node.is_expired(expire_secs) => nodes.push(node),
            _ => {
                let _ = kv.delete(&kv_key);
            }
        }
    }
    nodes
}
