//! Signed peer records.
//!
//! A `RealmPeerRecord` is a node's authoritative statement of its current
//! addresses, NAT situation, capabilities, and version. It travels as a
//! `SignedRealmPeerRecord`: the bincode-serialized payload bytes, the
//! signer's public key, and an ed25519 signature over the payload-type tag
//! concatenated with those exact bytes. The payload bytes are kept verbatim
//! so re-serialization can never invalidate the signature.

pub mod local;
pub mod validator;

use crate::error::DhtError;
use crate::types::{unix_now_ns, NatType, NodeId, Reachability, RealmId};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Domain-separation tag bound into every record signature.
pub const PAYLOAD_TYPE_TAG: &[u8] = b"/meshnet/dht/peer-record/v1";

/// The signed payload. All fields are authoritative once signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealmPeerRecord {
    pub node_id: NodeId,
    pub realm_id: RealmId,
    pub direct_addrs: Vec<String>,
    pub relay_addrs: Vec<String>,
    pub nat_type: NatType,
    pub reachability: Reachability,
    pub capabilities: Vec<String>,
    /// Strictly positive, monotonically increasing per signer.
    pub seq: u64,
    /// Unix nanoseconds at signing time.
    pub timestamp_ns: u64,
    /// Advertised lifetime in milliseconds.
    pub ttl_ms: u64,
}

impl RealmPeerRecord {
    /// Expiry instant in unix nanoseconds.
    pub fn expires_at_ns(&self) -> u64 {
        self.timestamp_ns
            .saturating_add(self.ttl_ms.saturating_mul(1_000_000))
    }

    /// True once `timestamp + ttl + skew` lies in the past.
    pub fn is_expired(&self, clock_skew: Duration) -> bool {
        let deadline = self
            .expires_at_ns()
            .saturating_add(clock_skew.as_nanos() as u64);
        deadline < unix_now_ns()
    }

    /// Serialize the payload to its canonical wire bytes.
    pub fn to_payload_bytes(&self) -> Result<Vec<u8>, DhtError> {
        bincode::serialize(self).map_err(|e| DhtError::Codec(e.to_string()))
    }

    /// Decode a payload from wire bytes.
    pub fn from_payload_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        bincode::deserialize(bytes).map_err(|e| DhtError::Codec(e.to_string()))
    }

    /// Sign this payload, producing the envelope that travels on the wire.
    pub fn sign(self, key: &SigningKey) -> Result<SignedRealmPeerRecord, DhtError> {
        let raw = self.to_payload_bytes()?;
        let signature = key.sign(&signing_input(&raw));
        Ok(SignedRealmPeerRecord {
            record: self,
            raw_record: raw,
            public_key: key.verifying_key().as_bytes().to_vec(),
            signature: signature.to_bytes().to_vec(),
        })
    }
}

fn signing_input(raw_record: &[u8]) -> Vec<u8> {
    let mut input = Vec::with_capacity(PAYLOAD_TYPE_TAG.len() + raw_record.len());
    input.extend_from_slice(PAYLOAD_TYPE_TAG);
    input.extend_from_slice(raw_record);
    input
}

/// Wire envelope: exact payload bytes, signer key, signature.
#[derive(Serialize, Deserialize)]
struct SignedEnvelope {
    raw_record: Vec<u8>,
    public_key: Vec<u8>,
    signature: Vec<u8>,
}

/// A validated-decodable signed record. Shared-immutable after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRealmPeerRecord {
    /// Decoded view of `raw_record`.
    pub record: RealmPeerRecord,
    /// The exact bytes the signature covers (after the type tag).
    pub raw_record: Vec<u8>,
    /// Serialized ed25519 public key of the signer.
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
}

impl SignedRealmPeerRecord {
    /// Rebuild an envelope from its parts, decoding the payload view.
    pub fn from_parts(
        raw_record: Vec<u8>,
        public_key: Vec<u8>,
        signature: Vec<u8>,
    ) -> Result<Self, DhtError> {
        let record = RealmPeerRecord::from_payload_bytes(&raw_record)?;
        Ok(SignedRealmPeerRecord {
            record,
            raw_record,
            public_key,
            signature,
        })
    }

    /// Serialize the envelope for transport or storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>, DhtError> {
        let envelope = SignedEnvelope {
            raw_record: self.raw_record.clone(),
            public_key: self.public_key.clone(),
            signature: self.signature.clone(),
        };
        bincode::serialize(&envelope).map_err(|e| DhtError::Codec(e.to_string()))
    }

    /// Decode an envelope and its payload view. Does not verify the signature.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        let envelope: SignedEnvelope =
            bincode::deserialize(bytes).map_err(|e| DhtError::Codec(e.to_string()))?;
        Self::from_parts(envelope.raw_record, envelope.public_key, envelope.signature)
    }

    /// Verify the signature over `TAG || raw_record`.
    pub fn verify_signature(&self) -> bool {
        let Ok(key_bytes) = <[u8; 32]>::try_from(self.public_key.as_slice()) else {
            return false;
        };
        let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
            return false;
        };
        let Ok(sig_bytes) = <[u8; 64]>::try_from(self.signature.as_slice()) else {
            return false;
        };
        let signature = Signature::from_bytes(&sig_bytes);
        key.verify(&signing_input(&self.raw_record), &signature).is_ok()
    }

    /// Identity derived from the embedded public key.
    pub fn signer_node_id(&self) -> NodeId {
        NodeId::from_public_key_bytes(&self.public_key)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn test_sign_verify_round_trip() {
        let key = SigningKey::generate(&mut OsRng);
        let signed = test_support::signed_record(&key, &RealmId::new("r"), 1, Duration::from_secs(3600));
        assert!(signed.verify_signature());
        assert_eq!(signed.signer_node_id(), signed.record.node_id);
    }

    #[test]
    fn test_envelope_round_trip_preserves_equality() {
        let key = SigningKey::generate(&mut OsRng);
        let signed = test_support::signed_record(&key, &RealmId::global(), 7, Duration::from_secs(900));
        let bytes = signed.to_bytes().unwrap();
        let decoded = SignedRealmPeerRecord::from_bytes(&bytes).unwrap();
        assert_eq!(signed, decoded);
        assert!(decoded.verify_signature());
    }

    #[test]
    fn test_tampered_payload_fails_verification() {
        let key = SigningKey::generate(&mut OsRng);
        let mut signed =
            test_support::signed_record(&key, &RealmId::new("r"), 1, Duration::from_secs(3600));
        signed.raw_record[0] ^= 0x01;
        assert!(!signed.verify_signature());
    }

    #[test]
    fn test_wrong_key_fails_verification() {
        let key = SigningKey::generate(&mut OsRng);
        let other = SigningKey::generate(&mut OsRng);
        let mut signed =
            test_support::signed_record(&key, &RealmId::new("r"), 1, Duration::from_secs(3600));
        signed.public_key = other.verifying_key().as_bytes().to_vec();
        assert!(!signed.verify_signature());
    }

    #[test]
    fn test_expiry_with_skew() {
        let key = SigningKey::generate(&mut OsRng);
        let mut record = RealmPeerRecord {
            node_id: NodeId::from_public_key(&key.verifying_key()),
            realm_id: RealmId::global(),
            direct_addrs: vec![],
            relay_addrs: vec![],
            nat_type: NatType::Unknown,
            reachability: Reachability::Unknown,
            capabilities: vec![],
            seq: 1,
            timestamp_ns: unix_now_ns(),
            ttl_ms: 1,
        };
        // Fresh within skew even though the 1 ms ttl may already have elapsed.
        assert!(!record.is_expired(Duration::from_secs(300)));
        // Firmly in the past, beyond any skew.
        record.timestamp_ns = 1;
        assert!(record.is_expired(Duration::from_secs(300)));
    }
}
