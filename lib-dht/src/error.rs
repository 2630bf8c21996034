//! Error types surfaced by the DHT.
//!
//! Per-target I/O failures inside queries are swallowed and logged; only
//! exhaustion of all candidates surfaces one of these to the caller.
//! Validation errors are terminal for the individual record but never tear
//! down the inbound handler.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DhtError>;

/// Errors surfaced by DHT operations.
#[derive(Debug, Error)]
pub enum DhtError {
    // Lifecycle misuse
    #[error("DHT not started")]
    NotStarted,
    #[error("DHT already started")]
    AlreadyStarted,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // Query outcomes
    #[error("no nearby peers in routing table")]
    NoNearbyPeers,
    #[error("peer not found")]
    PeerNotFound,
    #[error("key not found")]
    KeyNotFound,

    // Transport layer
    #[error("request timed out")]
    Timeout,
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("network closed")]
    NetworkClosed,

    // Record validation and conflict resolution
    #[error("invalid signature")]
    InvalidSignature,
    #[error("node id does not match record key or public key")]
    NodeIdMismatch,
    #[error("realm id does not match record key")]
    RealmIdMismatch,
    #[error("record expired")]
    RecordExpired,
    #[error("record ttl out of bounds")]
    InvalidTtl,
    #[error("invalid sequence number")]
    InvalidSeq,
    #[error("sequence number too old")]
    SeqTooOld,

    // Admission control
    #[error("rate limit exceeded")]
    RateLimitExceeded,
    #[error("unroutable address: {0}")]
    UnroutableAddress(String),
    #[error("bad request: {0}")]
    BadRequest(String),

    // Keys and codecs
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("codec error: {0}")]
    Codec(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DhtError {
    /// Stable reason string carried in error responses on the wire.
    pub fn wire_reason(&self) -> String {
        match self {
            DhtError::RateLimitExceeded => "rate limit exceeded".to_string(),
            DhtError::UnroutableAddress(_) => "no routable addresses".to_string(),
            DhtError::SeqTooOld => "seq too old".to_string(),
            other => other.to_string(),
        }
    }
}
