use std::collections::HashMap;
use std::time::{Duration, Instant};

use inventory_tags_core::{InventoryError, StatusCounts};
use tracing::debug;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum CacheKey {
    GlobalCounts,
    CaliberOptions,
}

impl CacheKey {
    pub const ALL: [Self; 2] = [Self::GlobalCounts, Self::CaliberOptions];
}

#[derive(Debug, Clone)]
enum CachedValue {
    Counts(StatusCounts),
    Calibers(Vec<String>),
}

/// Short-lived aggregate results. Entries expire after the TTL and are
/// dropped explicitly by every write path that could stale them.
#[derive(Debug)]
pub struct ReadCache {
    ttl: Duration,
    entries: HashMap<CacheKey, (Instant, CachedValue)>,
}

impl ReadCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    #[must_use]
    pub fn is_fresh(&self, key: CacheKey) -> bool {
        self.fresh(key).is_some()
    }

    pub fn invalidate(&mut self, key: CacheKey) {
        if self.entries.remove(&key).is_some() {
            debug!(?key, "invalidated cache entry");
        }
    }

    pub fn invalidate_all(&mut self) {
        for key in CacheKey::ALL {
            self.invalidate(key);
        }
    }

    pub fn counts_or_load(
        &mut self,
        load: impl FnOnce() -> Result<StatusCounts, InventoryError>,
    ) -> Result<StatusCounts, InventoryError> {
        if let Some(CachedValue::Counts(counts)) = self.fresh(CacheKey::GlobalCounts) {
            return Ok(counts.clone());
        }
        let counts = load()?;
        self.store(CacheKey::GlobalCounts, CachedValue::Counts(counts.clone()));
        Ok(counts)
    }

    pub fn calibers_or_load(
        &mut self,
        load: impl FnOnce() -> Result<Vec<String>, InventoryError>,
    ) -> Result<Vec<String>, InventoryError> {
        if let Some(CachedValue::Calibers(calibers)) = self.fresh(CacheKey::CaliberOptions) {
            return Ok(calibers.clone());
        }
        let calibers = load()?;
        self.store(CacheKey::CaliberOptions, CachedValue::Calibers(calibers.clone()));
        Ok(calibers)
    }

    fn fresh(&self, key: CacheKey) -> Option<&CachedValue> {
        let (stored_at, value) = self.entries.get(&key)?;
        if stored_at.elapsed() < self.ttl {
            debug!(?key, "cache hit");
            Some(value)
        } else {
            None
        }
    }

    fn store(&mut self, key: CacheKey, value: CachedValue) {
        debug!(?key, "cache miss, storing fresh value");
        self.entries.insert(key, (Instant::now(), value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn must<T>(result: Result<T, InventoryError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    #[test]
    fn fresh_entry_is_served_until_invalidated() {
        let mut cache = ReadCache::new(Duration::from_secs(60));
        let loads = Cell::new(0);
        let load = || {
            loads.set(loads.get() + 1);
            Ok(vec![format!("load-{}", loads.get())])
        };

        assert_eq!(must(cache.calibers_or_load(load)), vec!["load-1"]);
        assert_eq!(must(cache.calibers_or_load(load)), vec!["load-1"]);
        assert!(cache.is_fresh(CacheKey::CaliberOptions));

        cache.invalidate(CacheKey::CaliberOptions);
        assert_eq!(must(cache.calibers_or_load(load)), vec!["load-2"]);
        assert_eq!(loads.get(), 2);
    }

    #[test]
    fn zero_ttl_never_serves_stale_values() {
        let mut cache = ReadCache::new(Duration::ZERO);
        let loads = Cell::new(0);
        for _ in 0..3 {
            must(cache.counts_or_load(|| {
                loads.set(loads.get() + 1);
                Ok(StatusCounts::default())
            }));
        }
        assert_eq!(loads.get(), 3);
        assert!(!cache.is_fresh(CacheKey::GlobalCounts));
    }

    #[test]
    fn failed_load_leaves_cache_empty() {
        let mut cache = ReadCache::new(Duration::from_secs(60));
        let result = cache.counts_or_load(|| Err(InventoryError::storage("offline")));
        assert!(result.is_err());
        assert!(!cache.is_fresh(CacheKey::GlobalCounts));
    }

    #[test]
    fn invalidate_all_clears_every_key() {
        let mut cache = ReadCache::new(Duration::from_secs(60));
        must(cache.counts_or_load(|| Ok(StatusCounts::default())));
        must(cache.calibers_or_load(|| Ok(Vec::new())));
        cache.invalidate_all();
        assert!(CacheKey::ALL.iter().all(|key| !cache.is_fresh(*key)));
    }
}
