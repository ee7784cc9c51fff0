//! Remote metadata cache
//!
//! Listings fetched from the object store are kept for a configurable
//! time and access budget. The -1 sentinels disable the respective
//! limit; 0 for the entry limit disables caching entirely.

use std::collections::HashMap;
use std::time::{Duration, Instant};

struct CacheEntry<V> {
    value: V,
    stored: Instant,
    accesses: i64,
}

/// TTL and access-count bounded cache for remote listings.
pub struct ListingCache<V> {
    ttl: Duration,
    max_entries: i64,
    max_access: i64,
    entries: HashMap<String, CacheEntry<V>>,
}

impl<V: Clone> ListingCache<V> {
    pub fn new(ttl: Duration, max_entries: i64, max_access: i64) -> Self {
        Self {
            ttl,
            max_entries,
            max_access,
            entries: HashMap::new(),
        }
    }

    /// Fetch a live entry, counting the access. Expired and worn-out
    /// entries are dropped so the caller refreshes from the remote.
    pub fn get(&mut self, key: &str) -> Option<V> {
        let entry = self.entries.get_mut(key)?;
        if entry.stored.elapsed() > self.ttl {
            self.entries.remove(key);
            return None;
        }
        if self.max_access >= 0 && entry.accesses >= self.max_access {
            self.entries.remove(key);
            return None;
        }
        entry.accesses += 1;
        Some(entry.value.clone())
    }

    pub fn store(&mut self, key: String, value: V) {
        if self.max_entries == 0 {
            return;
        }
        if self.max_entries > 0
            && self.entries.len() >= self.max_entries as usize
            && !self.entries.contains_key(&key)
        {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.stored)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(
            key,
            CacheEntry {
                value,
                stored: Instant::now(),
                accesses: 0,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn entries_expire_after_ttl() {
        let mut cache = ListingCache::new(Duration::from_millis(10), -1, -1);
        cache.store("/".to_string(), vec!["documents"]);
        assert_eq!(cache.get("/"), Some(vec!["documents"]));

        sleep(Duration::from_millis(20));
        assert_eq!(cache.get("/"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn access_budget_wears_entries_out() {
        let mut cache = ListingCache::new(Duration::from_secs(60), -1, 2);
        cache.store("/".to_string(), 1);
        assert_eq!(cache.get("/"), Some(1));
        assert_eq!(cache.get("/"), Some(1));
        // Third access exceeds the budget.
        assert_eq!(cache.get("/"), None);
    }

    #[test]
    fn negative_sentinels_disable_limits() {
        let mut cache = ListingCache::new(Duration::from_secs(60), -1, -1);
        cache.store("/".to_string(), 1);
        for _ in 0..100 {
            assert_eq!(cache.get("/"), Some(1));
        }
    }

    #[test]
    fn entry_limit_evicts_oldest() {
        let mut cache = ListingCache::new(Duration::from_secs(60), 2, -1);
        cache.store("a".to_string(), 1);
        sleep(Duration::from_millis(2));
        cache.store("b".to_string(), 2);
        sleep(Duration::from_millis(2));
        cache.store("c".to_string(), 3);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(2));
        assert_eq!(cache.get("c"), Some(3));
    }

    #[test]
    fn zero_entry_limit_disables_caching() {
        let mut cache = ListingCache::new(Duration::from_secs(60), 0, -1);
        cache.store("/".to_string(), 1);
        assert_eq!(cache.get("/"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn storing_again_resets_the_budget() {
        let mut cache = ListingCache::new(Duration::from_secs(60), -1, 1);
        cache.store("/".to_string(), 1);
        assert_eq!(cache.get("/"), Some(1));
        assert_eq!(cache.get("/"), None);

        cache.store("/".to_string(), 2);
        assert_eq!(cache.get("/"), Some(2));
    }
}
