//! Hierarchical DHT key encoding.
//!
//! All keys are UTF-8 paths under the `/meshnet/v2` namespace. Realm-scoped
//! keys embed the lowercase-hex SHA-256 of the realm id so the realm itself
//! never appears on the wire.
//!
//! Layout:
//! - `/meshnet/v2/node/<node_id>`
//! - `/meshnet/v2/realm/<hex(sha256(realm))>/peer/<node_id>`
//! - `/meshnet/v2/realm/<hex(sha256(realm))>/members`
//! - `/meshnet/v2/realm/<hex(sha256(realm))>/(value|provider)/<payload>`
//! - `/meshnet/v2/sys/<type>/<payload>`

use crate::error::DhtError;
use crate::types::{NodeId, RealmId};
use sha2::{Digest, Sha256};

/// Namespace prefix shared by every key this DHT stores or routes.
pub const KEY_PREFIX: &str = "/meshnet/v2";

const REALM_HASH_HEX_LEN: usize = 64;

/// Global node key for a peer's signed record.
pub fn node_key(node_id: &NodeId) -> String {
    format!("{}/node/{}", KEY_PREFIX, node_id.to_hex())
}

/// Realm-scoped peer key for a node's signed record.
pub fn realm_peer_key(realm: &RealmId, node_id: &NodeId) -> String {
    format!(
        "{}/realm/{}/peer/{}",
        KEY_PREFIX,
        realm.hash_hex(),
        node_id.to_hex()
    )
}

/// Realm member-list key.
pub fn realm_members_key(realm: &RealmId) -> String {
    format!("{}/realm/{}/members", KEY_PREFIX, realm.hash_hex())
}

/// Realm-scoped value key.
pub fn realm_value_key(realm: &RealmId, payload: &str) -> String {
    format!("{}/realm/{}/value/{}", KEY_PREFIX, realm.hash_hex(), payload)
}

/// Realm-scoped provider key.
pub fn realm_provider_key(realm: &RealmId, payload: &str) -> String {
    format!(
        "{}/realm/{}/provider/{}",
        KEY_PREFIX,
        realm.hash_hex(),
        payload
    )
}

/// System key outside any realm.
pub fn sys_key(kind: &str, payload: &str) -> String {
    format!("{}/sys/{}/{}", KEY_PREFIX, kind, payload)
}

/// Routing target for an arbitrary key: SHA-256 of the key bytes.
pub fn key_target(key: &str) -> NodeId {
    let digest = Sha256::digest(key.as_bytes());
    let mut id = [0u8; 32];
    id.copy_from_slice(&digest);
    NodeId::from_bytes(id)
}

/// A structurally valid DHT key, broken into its scope and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedKey {
    Node {
        node_id: NodeId,
    },
    RealmPeer {
        realm_hash: String,
        node_id: NodeId,
    },
    RealmMembers {
        realm_hash: String,
    },
    RealmValue {
        realm_hash: String,
        payload: String,
    },
    RealmProvider {
        realm_hash: String,
        payload: String,
    },
    Sys {
        kind: String,
        payload: String,
    },
}

impl ParsedKey {
    /// The realm hash segment, for realm-scoped keys.
    pub fn realm_hash(&self) -> Option<&str> {
        match self {
            ParsedKey::RealmPeer { realm_hash, .. }
            | ParsedKey::RealmMembers { realm_hash }
            | ParsedKey::RealmValue { realm_hash, .. }
            | ParsedKey::RealmProvider { realm_hash, .. } => Some(realm_hash),
            _ => None,
        }
    }

    /// The node id segment, for peer keys.
    pub fn node_id(&self) -> Option<&NodeId> {
        match self {
            ParsedKey::Node { node_id } | ParsedKey::RealmPeer { node_id, .. } => Some(node_id),
            _ => None,
        }
    }
}

/// Parse and validate a key under the `/meshnet/v2` namespace.
pub fn parse_key(key: &str) -> Result<ParsedKey, DhtError> {
    let rest = key
        .strip_prefix(KEY_PREFIX)
        .and_then(|r| r.strip_prefix('/'))
        .ok_or_else(|| DhtError::InvalidKey(format!("missing {} prefix: {}", KEY_PREFIX, key)))?;

    let mut segments = rest.splitn(2, '/');
    let scope = segments.next().unwrap_or_default();
    let tail = segments.next().unwrap_or_default();

    match scope {
        "node" => {
            let node_id = parse_node_segment(tail, key)?;
            Ok(ParsedKey::Node { node_id })
        }
        "realm" => parse_realm_tail(tail, key),
        "sys" => {
            let mut parts = tail.splitn(2, '/');
            let kind = parts.next().unwrap_or_default();
            let payload = parts.next().unwrap_or_default();
            if kind.is_empty() || payload.is_empty() {
                return Err(DhtError::InvalidKey(format!("malformed sys key: {}", key)));
            }
            Ok(ParsedKey::Sys {
                kind: kind.to_string(),
                payload: payload.to_string(),
            })
        }
        _ => Err(DhtError::InvalidKey(format!("unknown scope in key: {}", key))),
    }
}

fn parse_realm_tail(tail: &str, key: &str) -> Result<ParsedKey, DhtError> {
    let mut parts = tail.splitn(2, '/');
    let realm_hash = parts.next().unwrap_or_default();
    let rest = parts.next().unwrap_or_default();

    if realm_hash.len() != REALM_HASH_HEX_LEN
        || !realm_hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
    {
        return Err(DhtError::InvalidKey(format!(
            "realm segment is not lowercase hex sha256: {}",
            key
        )));
    }
    let realm_hash = realm_hash.to_string();

    if rest == "members" {
        return Ok(ParsedKey::RealmMembers { realm_hash });
    }

    let mut parts = rest.splitn(2, '/');
    let kind = parts.next().unwrap_or_default();
    let payload = parts.next().unwrap_or_default();
    match kind {
        "peer" => {
            let node_id = parse_node_segment(payload, key)?;
            Ok(ParsedKey::RealmPeer { realm_hash, node_id })
        }
        "value" if !payload.is_empty() => Ok(ParsedKey::RealmValue {
            realm_hash,
            payload: payload.to_string(),
        }),
        "provider" if !payload.is_empty() => Ok(ParsedKey::RealmProvider {
            realm_hash,
            payload: payload.to_string(),
        }),
        _ => Err(DhtError::InvalidKey(format!("malformed realm key: {}", key))),
    }
}

fn parse_node_segment(segment: &str, key: &str) -> Result<NodeId, DhtError> {
    NodeId::from_hex(segment)
        .ok_or_else(|| DhtError::InvalidKey(format!("bad node id segment in key: {}", key)))
}
