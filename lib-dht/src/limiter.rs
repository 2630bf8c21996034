//! Admission control for the inbound handler: per-sender sliding-window rate
//! limiting and dialability filtering of advertised addresses.

use crate::types::NodeId;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::{Duration, Instant};

/// Sliding-window counter per sender: exactly `limit` calls succeed inside
/// any rolling `window`.
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    entries: Mutex<HashMap<NodeId, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        RateLimiter {
            limit,
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record and admit one call from `sender` if it is within the limit.
    pub fn allow(&self, sender: &NodeId) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let timestamps = entries.entry(*sender).or_default();
        while let Some(front) = timestamps.front() {
            if now.duration_since(*front) >= self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }
        if timestamps.len() >= self.limit {
            return false;
        }
        timestamps.push_back(now);
        true
    }

    /// Drop senders with no activity inside the window.
    pub fn prune(&self) {
        let now = Instant::now();
        self.entries.lock().retain(|_, timestamps| {
            timestamps
                .back()
                .map(|t| now.duration_since(*t) < self.window)
                .unwrap_or(false)
        });
    }

    pub fn tracked_senders(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Filters advertised addresses down to ones worth dialing.
///
/// Loopback and link-local are rejected unconditionally. RFC1918 ranges and
/// IPv6 ULA are rejected unless `allow_private` is set. Anything that does
/// not parse as `/ip4/…` or `/ip6/…` followed by a transport is rejected.
#[derive(Debug, Clone, Copy)]
pub struct AddressFilter {
    allow_private: bool,
}

impl AddressFilter {
    pub fn new(allow_private: bool) -> Self {
        AddressFilter { allow_private }
    }

    /// Keep only routable addresses.
    pub fn filter(&self, addrs: &[String]) -> Vec<String> {
        addrs
            .iter()
            .filter(|a| self.is_routable(a))
            .cloned()
            .collect()
    }

    pub fn is_routable(&self, addr: &str) -> bool {
        let mut segments = addr.split('/');
        // Addresses are absolute: the first split segment is empty.
        if segments.next() != Some("") {
            return false;
        }
        let family = segments.next().unwrap_or_default();
        let host = segments.next().unwrap_or_default();
        let transport = segments.next().unwrap_or_default();
        if transport.is_empty() {
            return false;
        }
        match family {
            "ip4" => match host.parse::<Ipv4Addr>() {
                Ok(ip) => self.ip4_allowed(ip),
                Err(_) => false,
            },
            "ip6" => match host.parse::<Ipv6Addr>() {
                Ok(ip) => self.ip6_allowed(ip),
                Err(_) => false,
            },
            _ => false,
        }
    }

    fn ip4_allowed(&self, ip: Ipv4Addr) -> bool {
        if ip.is_loopback() || ip.is_link_local() || ip.is_unspecified() {
            return false;
        }
        if ip.is_private() && !self.allow_private {
            return false;
        }
        true
    }

    fn ip6_allowed(&self, ip: Ipv6Addr) -> bool {
        if ip.is_loopback() || ip.is_unspecified() {
            return false;
        }
        let first = ip.segments()[0];
        // fe80::/10 link-local.
        if first & 0xffc0 == 0xfe80 {
            return false;
        }
        // fc00::/7 unique-local.
        if first & 0xfe00 == 0xfc00 && !self.allow_private {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter_exact_limit_per_window() {
        let limiter = RateLimiter::new(10, Duration::from_secs(60));
        let sender = NodeId::random();
        for _ in 0..10 {
            assert!(limiter.allow(&sender));
        }
        // The eleventh call inside the window is refused.
        assert!(!limiter.allow(&sender));
    }

    #[test]
    fn test_rate_limiter_isolates_senders() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        let a = NodeId::random();
        let b = NodeId::random();
        assert!(limiter.allow(&a));
        assert!(limiter.allow(&a));
        assert!(!limiter.allow(&a));
        assert!(limiter.allow(&b));
        assert_eq!(limiter.tracked_senders(), 2);
    }

    #[test]
    fn test_rate_limiter_window_slides() {
        let limiter = RateLimiter::new(2, Duration::from_millis(30));
        let sender = NodeId::random();
        assert!(limiter.allow(&sender));
        assert!(limiter.allow(&sender));
        assert!(!limiter.allow(&sender));
        std::thread::sleep(Duration::from_millis(40));
        assert!(limiter.allow(&sender));
    }

    #[test]
    fn test_rate_limiter_prune() {
        let limiter = RateLimiter::new(2, Duration::from_millis(10));
        limiter.allow(&NodeId::random());
        std::thread::sleep(Duration::from_millis(20));
        limiter.prune();
        assert_eq!(limiter.tracked_senders(), 0);
    }

    #[test]
    fn test_filter_rejects_loopback_and_link_local_always() {
        for filter in [AddressFilter::new(false), AddressFilter::new(true)] {
            assert!(!filter.is_routable("/ip4/127.0.0.1/tcp/4001"));
            assert!(!filter.is_routable("/ip4/169.254.1.1/tcp/4001"));
            assert!(!filter.is_routable("/ip6/::1/tcp/4001"));
            assert!(!filter.is_routable("/ip6/fe80::1/tcp/4001"));
            assert!(!filter.is_routable("/ip4/0.0.0.0/tcp/4001"));
        }
    }

    #[test]
    fn test_filter_private_ranges_gated_by_flag() {
        let strict = AddressFilter::new(false);
        let permissive = AddressFilter::new(true);
        for addr in [
            "/ip4/10.0.0.1/tcp/4001",
            "/ip4/172.16.5.5/tcp/4001",
            "/ip4/192.168.1.10/tcp/4001",
            "/ip6/fc00::1/tcp/4001",
            "/ip6/fd12::7/tcp/4001",
        ] {
            assert!(!strict.is_routable(addr), "{} accepted by strict", addr);
            assert!(permissive.is_routable(addr), "{} rejected by permissive", addr);
        }
    }

    #[test]
    fn test_filter_accepts_public_addresses() {
        let filter = AddressFilter::new(false);
        assert!(filter.is_routable("/ip4/1.2.3.4/tcp/4001"));
        assert!(filter.is_routable("/ip4/8.8.8.8/udp/4001"));
        assert!(filter.is_routable("/ip6/2001:db8::1/tcp/4001"));
    }

    #[test]
    fn test_filter_rejects_malformed_strings() {
        let filter = AddressFilter::new(true);
        assert!(!filter.is_routable("1.2.3.4:4001"));
        assert!(!filter.is_routable("/dns4/example.com/tcp/4001"));
        assert!(!filter.is_routable("/ip4/not-an-ip/tcp/4001"));
        assert!(!filter.is_routable("/ip4/1.2.3.4"));
        assert!(!filter.is_routable(""));
    }

    #[test]
    fn test_filter_batch() {
        let filter = AddressFilter::new(false);
        let filtered = filter.filter(&[
            "/ip4/1.2.3.4/tcp/4001".to_string(),
            "/ip4/127.0.0.1/tcp/4001".to_string(),
            "garbage".to_string(),
        ]);
        assert_eq!(filtered, vec!["/ip4/1.2.3.4/tcp/4001".to_string()]);
    }
}
