//! Peer-record validation and conflict resolution.
//!
//! Validation is all-or-nothing: each check returns a typed reason and no
//! partially valid record is ever accepted. Conflict resolution is
//! last-writer-wins by sequence number, then timestamp.

use crate::error::DhtError;
use crate::key::{parse_key, ParsedKey};
use crate::record::SignedRealmPeerRecord;
use std::time::Duration;

/// Lower bound on an advertised record lifetime.
pub const MIN_TTL: Duration = Duration::from_secs(15 * 60);
/// Upper bound on an advertised record lifetime.
pub const MAX_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Tolerated clock skew when judging expiry.
pub const CLOCK_SKEW_TOLERANCE: Duration = Duration::from_secs(5 * 60);

/// Validates signed peer records against the key they are stored under.
#[derive(Debug, Clone, Default)]
pub struct RecordValidator;

impl RecordValidator {
    pub fn new() -> Self {
        RecordValidator
    }

    /// Full validation chain, in order: sequence, signature, key binding,
    /// TTL bounds and expiry, identity binding.
    pub fn validate(&self, key: &str, signed: &SignedRealmPeerRecord) -> Result<(), DhtError> {
        let record = &signed.record;

        if record.seq == 0 {
            return Err(DhtError::InvalidSeq);
        }

        if !signed.verify_signature() {
            return Err(DhtError::InvalidSignature);
        }

        match parse_key(key)? {
            ParsedKey::RealmPeer { realm_hash, node_id } => {
                if realm_hash != record.realm_id.hash_hex() {
                    return Err(DhtError::RealmIdMismatch);
                }
                if node_id != record.node_id {
                    return Err(DhtError::NodeIdMismatch);
                }
            }
            ParsedKey::Node { node_id } => {
                if node_id != record.node_id {
                    return Err(DhtError::NodeIdMismatch);
                }
            }
            _ => {
                return Err(DhtError::InvalidKey(format!(
                    "not a peer-record key: {}",
                    key
                )))
            }
        }

        let ttl = Duration::from_millis(record.ttl_ms);
        if ttl < MIN_TTL || ttl > MAX_TTL {
            return Err(DhtError::InvalidTtl);
        }
        if record.is_expired(CLOCK_SKEW_TOLERANCE) {
            return Err(DhtError::RecordExpired);
        }

        if signed.signer_node_id() != record.node_id {
            return Err(DhtError::NodeIdMismatch);
        }

        Ok(())
    }

    /// Pick the best record out of a set of candidates for the same key.
    ///
    /// Signature-invalid candidates are discarded; non-expired beats expired
    /// regardless of sequence; then higher seq, then later timestamp. Ties
    /// resolve to the earliest position, deterministically.
    pub fn select_best<'a>(
        &self,
        records: &'a [SignedRealmPeerRecord],
    ) -> Option<&'a SignedRealmPeerRecord> {
        let mut best: Option<&SignedRealmPeerRecord> = None;
        for candidate in records {
            if !candidate.verify_signature() {
                continue;
            }
            best = match best {
                None => Some(candidate),
                Some(current) => {
                    if Self::better(candidate, current) {
                        Some(candidate)
                    } else {
                        Some(current)
                    }
                }
            };
        }
        best
    }

    /// Strictly-better ordering used by [`select_best`]; ties keep `current`.
    fn better(candidate: &SignedRealmPeerRecord, current: &SignedRealmPeerRecord) -> bool {
        let cand_expired = candidate.record.is_expired(CLOCK_SKEW_TOLERANCE);
        let cur_expired = current.record.is_expired(CLOCK_SKEW_TOLERANCE);
        if cand_expired != cur_expired {
            return !cand_expired;
        }
        if candidate.record.seq != current.record.seq {
            return candidate.record.seq > current.record.seq;
        }
        candidate.record.timestamp_ns > current.record.timestamp_ns
    }

    /// Decide whether `new` may replace `old` under `key`.
    ///
    /// `new` is fully validated first. Replacement requires a strictly higher
    /// seq, or the same seq with a strictly later timestamp.
    pub fn should_replace(
        &self,
        key: &str,
        old: Option<&SignedRealmPeerRecord>,
        new: &SignedRealmPeerRecord,
    ) -> Result<(), DhtError> {
        self.validate(key, new)?;
        let Some(old) = old else {
            return Ok(());
        };
        if new.record.seq > old.record.seq {
            return Ok(());
        }
        if new.record.seq == old.record.seq && new.record.timestamp_ns > old.record.timestamp_ns {
            return Ok(());
        }
        Err(DhtError::SeqTooOld)
    }
}
