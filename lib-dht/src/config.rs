//! DHT configuration surface.

use crate::error::DhtError;
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Which of the local addresses get published in peer records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AddressPublishStrategy {
    /// Decide from measured reachability.
    #[default]
    Auto,
    /// Publish everything.
    All,
    /// Publish only direct addresses.
    DirectOnly,
    /// Publish only relay addresses.
    RelayOnly,
}

/// A statically configured bootstrap target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapPeer {
    pub node_id: NodeId,
    pub addrs: Vec<String>,
}

/// Tunables for one DHT instance.
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// K: bucket capacity, replication width, and result-set size.
    pub bucket_size: usize,
    /// Base query parallelism; adapted upward on small tables / deep queues.
    pub alpha: usize,
    /// Outer deadline for one iterative query.
    pub query_timeout: Duration,
    /// Cadence of the routing-table refresh loop.
    pub refresh_interval: Duration,
    /// Staleness threshold after which a bucket gets a refresh probe.
    pub bucket_refresh_interval: Duration,
    /// Fan-out width for STORE / ADD_PROVIDER / PUT_PEER_RECORD.
    pub replication_factor: usize,
    /// Serve and store raw values (`STORE` / `FIND_VALUE`).
    pub enable_value_store: bool,
    /// Hard cap on accepted value TTLs.
    pub max_record_age: Duration,
    pub bootstrap_peers: Vec<BootstrapPeer>,
    /// Lifetime of provider announcements.
    pub provider_ttl: Duration,
    /// Base lifetime of the local peer record (modulated by NAT type).
    pub peer_record_ttl: Duration,
    /// Cadence of the store cleanup loop.
    pub cleanup_interval: Duration,
    /// Cadence of the republish loop; effectively capped at half the record ttl.
    pub republish_interval: Duration,
    /// Data directory handed to the external key/value engine, if any.
    pub data_dir: Option<PathBuf>,
    /// Accept RFC1918 / ULA addresses (loopback stays rejected regardless).
    pub allow_private_addrs: bool,
    pub address_publish_strategy: AddressPublishStrategy,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Routing nodes expire after this long without being seen.
    pub node_expire_time: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        DhtConfig {
            bucket_size: 20,
            alpha: 5,
            query_timeout: Duration::from_secs(30),
            refresh_interval: Duration::from_secs(10 * 60),
            bucket_refresh_interval: Duration::from_secs(60 * 60),
            replication_factor: 20,
            enable_value_store: true,
            max_record_age: Duration::from_secs(24 * 60 * 60),
            bootstrap_peers: Vec::new(),
            provider_ttl: Duration::from_secs(24 * 60 * 60),
            peer_record_ttl: Duration::from_secs(60 * 60),
            cleanup_interval: Duration::from_secs(5 * 60),
            republish_interval: Duration::from_secs(60 * 60),
            data_dir: None,
            allow_private_addrs: false,
            address_publish_strategy: AddressPublishStrategy::Auto,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(15),
            node_expire_time: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl DhtConfig {
    /// Tightened intervals for tests and local simulation.
    pub fn local_test() -> Self {
        DhtConfig {
            query_timeout: Duration::from_secs(5),
            refresh_interval: Duration::from_secs(2),
            cleanup_interval: Duration::from_secs(1),
            republish_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(3),
            allow_private_addrs: true,
            ..Default::default()
        }
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<(), DhtError> {
        if self.bucket_size == 0 {
            return Err(DhtError::InvalidConfig("bucket_size must be > 0".into()));
        }
        if self.alpha == 0 {
            return Err(DhtError::InvalidConfig("alpha must be > 0".into()));
        }
        if self.replication_factor == 0 {
            return Err(DhtError::InvalidConfig(
                "replication_factor must be > 0".into(),
            ));
        }
        for (name, value) in [
            ("query_timeout", self.query_timeout),
            ("refresh_interval", self.refresh_interval),
            ("cleanup_interval", self.cleanup_interval),
            ("republish_interval", self.republish_interval),
            ("connect_timeout", self.connect_timeout),
            ("request_timeout", self.request_timeout),
            ("provider_ttl", self.provider_ttl),
            ("peer_record_ttl", self.peer_record_ttl),
            ("node_expire_time", self.node_expire_time),
        ] {
            if value.is_zero() {
                return Err(DhtError::InvalidConfig(format!("{} must be > 0", name)));
            }
        }
        Ok(())
    }

    /// Effective republish cadence: never slower than half the record ttl.
    pub fn effective_republish_interval(&self) -> Duration {
        self.republish_interval.min(self.peer_record_ttl / 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        DhtConfig::default().validate().unwrap();
        DhtConfig::local_test().validate().unwrap();
    }

    #[test]
    fn test_rejects_zero_parameters() {
        let mut config = DhtConfig::default();
        config.bucket_size = 0;
        assert!(matches!(config.validate(), Err(DhtError::InvalidConfig(_))));

        let mut config = DhtConfig::default();
        config.alpha = 0;
        assert!(config.validate().is_err());

        let mut config = DhtConfig::default();
        config.request_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_effective_republish_interval_bounded_by_ttl() {
        let mut config = DhtConfig::default();
        config.republish_interval = Duration::from_secs(3600);
        config.peer_record_ttl = Duration::from_secs(1800);
        assert_eq!(
            config.effective_republish_interval(),
            Duration::from_secs(900)
        );
        config.peer_record_ttl = Duration::from_secs(24 * 3600);
        assert_eq!(
            config.effective_republish_interval(),
            Duration::from_secs(3600)
        );
    }
}
