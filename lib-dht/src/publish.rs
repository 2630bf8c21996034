//! Reachability-aware address publication.
//!
//! Maps the measured NAT situation to a reachability class, derives a record
//! TTL from it (shorter-lived records for nodes whose addresses churn), and
//! splits the local address set into direct and relay halves according to the
//! configured strategy.

use crate::config::AddressPublishStrategy;
use crate::record::validator::{MAX_TTL, MIN_TTL};
use crate::types::{NatType, Reachability};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Marker segment identifying a relay circuit address.
pub const RELAY_MARKER: &str = "/p2p-circuit";

/// External NAT/reachability measurement capability.
#[async_trait]
pub trait ReachabilityChecker: Send + Sync {
    /// Current reachability class and NAT type.
    async fn check_reachability(&self) -> (Reachability, NatType);

    /// Partition `addrs` into externally verified and unverified.
    async fn verify_addresses(&self, addrs: &[String]) -> (Vec<String>, Vec<String>);

    /// Direct addresses already confirmed dialable from outside.
    async fn verified_direct_addresses(&self) -> Vec<String>;

    async fn is_directly_reachable(&self) -> bool {
        matches!(self.check_reachability().await.0, Reachability::Public)
    }
}

/// Fixed-report checker for embedders without a NAT measurement stack.
pub struct StaticReachability {
    reachability: Reachability,
    nat_type: NatType,
}

impl StaticReachability {
    pub fn new(reachability: Reachability, nat_type: NatType) -> Self {
        StaticReachability {
            reachability,
            nat_type,
        }
    }
}

#[async_trait]
impl ReachabilityChecker for StaticReachability {
    async fn check_reachability(&self) -> (Reachability, NatType) {
        (self.reachability, self.nat_type)
    }

    async fn verify_addresses(&self, addrs: &[String]) -> (Vec<String>, Vec<String>) {
        (addrs.to_vec(), Vec::new())
    }

    async fn verified_direct_addresses(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Default mapping from NAT type to reachability class.
pub fn reachability_for_nat(nat: NatType) -> Reachability {
    match nat {
        NatType::None | NatType::FullCone => Reachability::Public,
        NatType::Symmetric => Reachability::Private,
        NatType::RestrictedCone | NatType::PortRestricted | NatType::Unknown => {
            Reachability::Unknown
        }
    }
}

/// Record TTL derived from NAT type, optionally shortened when the local
/// address set has been churning. Clamped to the validator bounds.
pub fn dynamic_ttl(nat: NatType, base: Duration, changes_per_hour: Option<f64>) -> Duration {
    let mut ttl = match nat {
        NatType::None => MAX_TTL,
        NatType::FullCone => base * 2,
        NatType::RestrictedCone | NatType::PortRestricted => base,
        NatType::Symmetric | NatType::Unknown => base / 2,
    };
    if let Some(rate) = changes_per_hour {
        if rate > 2.0 {
            ttl /= 2;
        } else if rate > 0.5 {
            ttl = ttl * 3 / 4;
        }
    }
    ttl.clamp(MIN_TTL, MAX_TTL)
}

pub fn is_relay_addr(addr: &str) -> bool {
    addr.contains(RELAY_MARKER)
}

/// Partition addresses into (direct, relay).
pub fn split_addrs(addrs: &[String]) -> (Vec<String>, Vec<String>) {
    let mut direct = Vec::new();
    let mut relay = Vec::new();
    for addr in addrs {
        if is_relay_addr(addr) {
            relay.push(addr.clone());
        } else {
            direct.push(addr.clone());
        }
    }
    (direct, relay)
}

/// Sliding one-hour window of observed local address changes.
pub struct AddressChangeTracker {
    events: Mutex<Vec<Instant>>,
}

impl Default for AddressChangeTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressChangeTracker {
    pub fn new() -> Self {
        AddressChangeTracker {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn record_change(&self) {
        self.events.lock().push(Instant::now());
    }

    /// Changes observed in the trailing hour.
    pub fn changes_per_hour(&self) -> f64 {
        let mut events = self.events.lock();
        let cutoff = Duration::from_secs(3600);
        events.retain(|t| t.elapsed() < cutoff);
        events.len() as f64
    }
}

/// Outcome of a publish decision.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishDecision {
    pub should_publish: bool,
    pub direct_addrs: Vec<String>,
    pub relay_addrs: Vec<String>,
    pub nat_type: NatType,
    pub reachability: Reachability,
    pub ttl: Duration,
    pub reason: String,
    pub warnings: Vec<String>,
}

/// Applies the configured strategy to the current address set.
pub struct PublishDecisionEngine {
    strategy: AddressPublishStrategy,
    base_ttl: Duration,
    checker: Option<Arc<dyn ReachabilityChecker>>,
    change_tracker: Arc<AddressChangeTracker>,
}

impl PublishDecisionEngine {
    pub fn new(
        strategy: AddressPublishStrategy,
        base_ttl: Duration,
        checker: Option<Arc<dyn ReachabilityChecker>>,
        change_tracker: Arc<AddressChangeTracker>,
    ) -> Self {
        PublishDecisionEngine {
            strategy,
            base_ttl,
            checker,
            change_tracker,
        }
    }

    /// Split `all_addrs`, consult reachability, and decide what to publish.
    pub async fn make_publish_decision(&self, all_addrs: &[String]) -> PublishDecision {
        let (reachability, nat_type) = match &self.checker {
            Some(checker) => checker.check_reachability().await,
            None => (Reachability::Unknown, NatType::Unknown),
        };
        let (all_direct, all_relay) = split_addrs(all_addrs);
        let mut warnings = Vec::new();

        let (direct, relay, reason) = match self.strategy {
            AddressPublishStrategy::All => {
                (all_direct, all_relay, "strategy: all addresses".to_string())
            }
            AddressPublishStrategy::DirectOnly => {
                if !all_relay.is_empty() {
                    warnings.push(format!("{} relay addresses suppressed", all_relay.len()));
                }
                (all_direct, Vec::new(), "strategy: direct only".to_string())
            }
            AddressPublishStrategy::RelayOnly => {
                if !all_direct.is_empty() {
                    warnings.push(format!("{} direct addresses suppressed", all_direct.len()));
                }
                (Vec::new(), all_relay, "strategy: relay only".to_string())
            }
            AddressPublishStrategy::Auto => match reachability {
                Reachability::Public => (
                    all_direct,
                    all_relay,
                    "auto: public reachability, all addresses".to_string(),
                ),
                Reachability::Private => (
                    Vec::new(),
                    all_relay,
                    "auto: private reachability, relay only".to_string(),
                ),
                Reachability::Unknown => {
                    // Conservative: relay plus whatever direct addresses an
                    // external checker has actually verified.
                    let direct = match &self.checker {
                        Some(checker) => {
                            let (verified, unverified) =
                                checker.verify_addresses(&all_direct).await;
                            if !unverified.is_empty() {
                                warnings.push(format!(
                                    "{} unverified direct addresses withheld",
                                    unverified.len()
                                ));
                            }
                            verified
                        }
                        None => Vec::new(),
                    };
                    (
                        direct,
                        all_relay,
                        "auto: unknown reachability, relay plus verified direct".to_string(),
                    )
                }
            },
        };

        let ttl = dynamic_ttl(
            nat_type,
            self.base_ttl,
            Some(self.change_tracker.changes_per_hour()),
        );
        let should_publish = !direct.is_empty() || !relay.is_empty();
        if !should_publish {
            warnings.push("no publishable addresses after filtering".to_string());
        }

        PublishDecision {
            should_publish,
            direct_addrs: direct,
            relay_addrs: relay,
            nat_type,
            reachability,
            ttl,
            reason,
            warnings,
        }
    }
}
