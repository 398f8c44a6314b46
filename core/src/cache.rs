// Sighting cache
//
// Address-keyed store of the most recent sighting per device. Recency, not
// signal strength, is canonical: a newer sighting always replaces the stored
// one. Readers take a snapshot under the read lock; eviction removes every
// stale entry under a single write lock so no reader sees a partial pass.

use crate::filter::{matches_any, ScanFilter};
use crate::sighting::Sighting;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Most-recent sighting per device address
#[derive(Debug, Default)]
pub struct SightingCache {
    entries: RwLock<HashMap<String, Arc<Sighting>>>,
}

impl SightingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `sighting`, replacing any prior entry for its address.
    ///
    /// Returns the shared handle stored in the cache.
    pub fn upsert(&self, sighting: Sighting) -> Arc<Sighting> {
        let sighting = Arc::new(sighting);
        self.entries
            .write()
            .insert(sighting.address.clone(), Arc::clone(&sighting));
        sighting
    }

    /// Remove every entry observed strictly before `cutoff_nanos`.
    ///
    /// Returns the removed `(address, last sighting)` pairs.
    pub fn evict_stale(&self, cutoff_nanos: u64) -> Vec<(String, Arc<Sighting>)> {
        let mut entries = self.entries.write();
        let stale: Vec<String> = entries
            .iter()
            .filter(|(_, s)| s.observed_at_nanos < cutoff_nanos)
            .map(|(address, _)| address.clone())
            .collect();

        let evicted: Vec<(String, Arc<Sighting>)> = stale
            .into_iter()
            .filter_map(|address| entries.remove(&address).map(|s| (address, s)))
            .collect();

        if !evicted.is_empty() {
            debug!("Evicted {} stale sightings ({} remain)", evicted.len(), entries.len());
        }
        evicted
    }

    /// Snapshot of cached sightings matching any of `filters`
    pub fn matching(&self, filters: &[ScanFilter]) -> Vec<Arc<Sighting>> {
        self.entries
            .read()
            .values()
            .filter(|s| matches_any(filters, s))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ScanRecord;

    fn sighting(address: &str, rssi: i32, at_ms: u64) -> Sighting {
        Sighting::new(address, ScanRecord::default(), rssi, at_ms * 1_000_000)
    }

    fn cached(cache: &SightingCache, address: &str) -> Option<Arc<Sighting>> {
        cache.matching(&[]).into_iter().find(|s| s.address == address)
    }

    #[test]
    fn test_upsert_newer_wins_even_if_weaker() {
        let cache = SightingCache::new();
        cache.upsert(sighting("A", -40, 0));
        cache.upsert(sighting("A", -90, 10));

        let stored = cached(&cache, "A").expect("cached");
        assert_eq!(stored.rssi, -90);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_matching_with_empty_filters_returns_all() {
        let cache = SightingCache::new();
        for i in 0..5 {
            cache.upsert(sighting(&format!("dev-{}", i), -50, i));
        }
        assert_eq!(cache.matching(&[]).len(), 5);
    }

    #[test]
    fn test_matching_respects_filters() {
        let cache = SightingCache::new();
        cache.upsert(sighting("A", -50, 0));
        cache.upsert(sighting("B", -50, 0));

        let filter = ScanFilter::builder().device_address("B").build().unwrap();
        let found = cache.matching(&[filter]);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].address, "B");
    }

    #[test]
    fn test_evict_stale_is_strict() {
        let cache = SightingCache::new();
        cache.upsert(sighting("A", -50, 0));
        cache.upsert(sighting("B", -50, 100));
        cache.upsert(sighting("C", -50, 50));

        // cutoff at 50ms: only entries strictly older go
        let evicted = cache.evict_stale(50 * 1_000_000);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].0, "A");
        assert_eq!(evicted[0].1.observed_at_nanos, 0);

        assert!(cached(&cache, "A").is_none());
        assert!(cached(&cache, "B").is_some());
        assert!(cached(&cache, "C").is_some());
        assert_eq!(cache.len(), 2);
    }
}
