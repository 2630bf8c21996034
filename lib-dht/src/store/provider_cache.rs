//! Short-TTL cache for remote provider-query results.
//!
//! Separate from the provider store: this only memoizes what remote lookups
//! returned, so repeated `find_peers` calls within the TTL window skip the
//! network entirely. Eviction prefers expired entries, then the oldest.

use crate::types::PeerInfo;
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_CACHE_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
struct CacheEntry {
    providers: Vec<PeerInfo>,
    created_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.created_at.elapsed() > self.ttl
    }
}

/// Cache counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
}

/// Not internally synchronized; the facade wraps it in a mutex.
pub struct ProviderCache {
    entries: HashMap<String, CacheEntry>,
    /// Insertion order, oldest first.
    order: Vec<String>,
    capacity: usize,
    ttl: Duration,
    stats: ProviderCacheStats,
}

impl ProviderCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        ProviderCache {
            entries: HashMap::with_capacity(capacity),
            order: Vec::with_capacity(capacity),
            capacity,
            ttl,
            stats: ProviderCacheStats::default(),
        }
    }

    pub fn get(&mut self, key: &str) -> Option<Vec<PeerInfo>> {
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired() => {
                self.stats.hits += 1;
                Some(entry.providers.clone())
            }
            Some(_) => {
                self.remove(key);
                self.stats.misses += 1;
                None
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, key: String, providers: Vec<PeerInfo>) {
        let entry = CacheEntry {
            providers,
            created_at: Instant::now(),
            ttl: self.ttl,
        };
        if self.entries.insert(key.clone(), entry).is_some() {
            self.stats.size = self.entries.len();
            return;
        }
        self.order.push(key);
        while self.entries.len() > self.capacity {
            self.evict_one();
        }
        self.stats.size = self.entries.len();
    }

    pub fn remove(&mut self, key: &str) {
        if self.entries.remove(key).is_some() {
            if let Some(pos) = self.order.iter().position(|k| k == key) {
                self.order.remove(pos);
            }
            self.stats.size = self.entries.len();
        }
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn cleanup_expired(&mut self) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired())
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> &ProviderCacheStats {
        &self.stats
    }

    /// Evict an expired entry if one exists, else the oldest.
    fn evict_one(&mut self) {
        let victim = self
            .order
            .iter()
            .find(|k| self.entries.get(*k).map(|e| e.is_expired()).unwrap_or(true))
            .or_else(|| self.order.first())
            .cloned();
        if let Some(key) = victim {
            self.remove(&key);
            self.stats.evictions += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeId;

    fn providers(n: usize) -> Vec<PeerInfo> {
        (0..n)
            .map(|i| PeerInfo::new(NodeId::random(), vec![format!("/ip4/1.2.3.4/tcp/{}", 4000 + i)]))
            .collect()
    }

    #[test]
    fn test_hit_and_miss() {
        let mut cache = ProviderCache::new(10, Duration::from_secs(60));
        cache.insert("/ns".to_string(), providers(2));
        assert_eq!(cache.get("/ns").unwrap().len(), 2);
        assert!(cache.get("/missing").is_none());
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_expired_entries_miss_and_clean() {
        let mut cache = ProviderCache::new(10, Duration::ZERO);
        cache.insert("/ns".to_string(), providers(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("/ns").is_none());
        cache.insert("/other".to_string(), providers(1));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.cleanup_expired(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_evicts_expired_first_then_oldest() {
        let mut cache = ProviderCache::new(2, Duration::from_secs(60));
        cache.insert("a".to_string(), providers(1));
        cache.insert("b".to_string(), providers(1));
        // Expire "b" manually so it is the preferred victim despite being newer.
        cache.entries.get_mut("b").unwrap().ttl = Duration::ZERO;
        std::thread::sleep(Duration::from_millis(5));
        cache.insert("c".to_string(), providers(1));
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());

        // No expired entries now: the oldest goes.
        cache.insert("d".to_string(), providers(1));
        assert!(cache.get("a").is_none());
        assert_eq!(cache.stats().evictions, 2);
    }

    #[test]
    fn test_reinsert_updates_in_place() {
        let mut cache = ProviderCache::new(2, Duration::from_secs(60));
        cache.insert("a".to_string(), providers(1));
        cache.insert("a".to_string(), providers(3));
        assert_eq!(cache.get("a").unwrap().len(), 3);
        assert_eq!(cache.len(), 1);
    }
}
