//! Bounded cache of time-limited entries.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use super::key::{matches_prefix, CacheKey};
use super::stats::{CacheCounters, CacheStats};
use super::ttl::CacheConfig;

/// A stored value with its creation time and lifetime.
///
/// Entries are never mutated; a refresh replaces the whole entry.
#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    ttl: Duration,
    /// Insertion order, breaks ties between equal `created_at` instants.
    seq: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= self.ttl
    }
}

#[derive(Debug)]
struct CacheState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    next_seq: u64,
    /// Bumped by every invalidation and by `clear`.
    epoch: u64,
    /// Epoch of the latest invalidation of each prefix, recorded only while
    /// fills are outstanding.
    invalidated: HashMap<String, u64>,
    /// Epoch of the latest `clear`.
    cleared_at: u64,
    fills_in_flight: usize,
}

impl<V> CacheState<V> {
    /// Whether `key` was invalidated after `epoch`.
    fn invalidated_since(&self, key: &str, epoch: u64) -> bool {
        self.cleared_at > epoch
            || self
                .invalidated
                .iter()
                .any(|(prefix, &at)| at > epoch && matches_prefix(key, prefix))
    }

    /// Insert or replace `key`, evicting the oldest entry first when a new
    /// key arrives at capacity.
    fn insert(
        &mut self,
        key: &CacheKey,
        value: V,
        ttl: Duration,
        max_entries: usize,
    ) -> Option<String> {
        let evicted = if !self.entries.contains_key(key.as_str()) && self.entries.len() >= max_entries
        {
            self.evict_oldest()
        } else {
            None
        };

        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            key.as_str().to_string(),
            CacheEntry {
                value,
                created_at: Instant::now(),
                ttl,
                seq,
            },
        );
        evicted
    }

    /// Remove the oldest inserted entry and return its key.
    ///
    /// O(n) scan over all entries. Fine for the hot set this cache is sized
    /// for (tens to low hundreds of entries); this is the known scalability
    /// ceiling of the design.
    fn evict_oldest(&mut self) -> Option<String> {
        let evict_key = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| (entry.created_at, entry.seq))
            .map(|(key, _)| key.clone())?;

        self.entries.remove(&evict_key);
        Some(evict_key)
    }
}

enum Lookup<V> {
    Hit(V),
    Expired,
    Absent,
}

/// A pending read-through fill started by [`ExpiringCache::begin_fill`].
///
/// Completing the fill stores the fetched value only if no invalidation
/// covering the key happened since the fill began, so rows fetched before a
/// change can never overwrite the snapshot taken after it.
#[must_use = "a fill stores nothing unless completed"]
pub struct Fill<'a, V: Clone> {
    cache: &'a ExpiringCache<V>,
    key: CacheKey,
    epoch: u64,
}

impl<V: Clone> Fill<'_, V> {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Store `value` unless the key was invalidated meanwhile.
    ///
    /// Returns whether the value was stored.
    pub fn complete(self, value: V, ttl_override: Option<Duration>) -> bool {
        let cache = self.cache;
        let ttl = ttl_override.unwrap_or_else(|| cache.config.ttl.ttl_for(self.key.kind()));

        let evicted = {
            let mut state = cache.state.lock();
            if state.invalidated_since(self.key.as_str(), self.epoch) {
                drop(state);
                tracing::debug!(key = %self.key, "fill overtaken by invalidation, not cached");
                return false;
            }
            state.insert(&self.key, value, ttl, cache.config.max_entries)
        };

        cache.record_set(&self.key, evicted);
        true
    }
}

impl<V: Clone> Drop for Fill<'_, V> {
    fn drop(&mut self) {
        let mut state = self.cache.state.lock();
        state.fills_in_flight = state.fills_in_flight.saturating_sub(1);
        if state.fills_in_flight == 0 {
            state.invalidated.clear();
        }
    }
}

/// Thread-safe read-through cache keyed by [`CacheKey`].
///
/// Expiry is lazy: a stale entry is removed when a read finds it (or by
/// [`purge_expired`](Self::purge_expired)). When a new key arrives at
/// capacity, the entry with the earliest insertion time is evicted. Access
/// recency plays no part in eviction.
///
/// All map access goes through one mutex that is never held across I/O or
/// callbacks.
#[derive(Debug)]
pub struct ExpiringCache<V> {
    state: Mutex<CacheState<V>>,
    config: CacheConfig,
    counters: CacheCounters,
}

impl<V: Clone> ExpiringCache<V> {
    /// Create a cache with the given configuration.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                next_seq: 0,
                epoch: 0,
                invalidated: HashMap::new(),
                cleared_at: 0,
                fills_in_flight: 0,
            }),
            config,
            counters: CacheCounters::default(),
        }
    }

    /// Get an unexpired value.
    ///
    /// Returns `None` (and counts a miss) when the key is absent or expired;
    /// an expired entry is dropped on the way out.
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let now = Instant::now();

        let lookup = {
            let mut state = self.state.lock();
            let lookup = match state.entries.get(key.as_str()) {
                Some(entry) if !entry.is_expired(now) => Lookup::Hit(entry.value.clone()),
                Some(_) => Lookup::Expired,
                None => Lookup::Absent,
            };
            if let Lookup::Expired = lookup {
                state.entries.remove(key.as_str());
            }
            lookup
        };

        match lookup {
            Lookup::Hit(value) => {
                self.counters.record_hit();
                tracing::trace!(key = %key, "cache hit");
                Some(value)
            }
            Lookup::Expired => {
                self.counters.record_miss();
                self.counters.record_expirations(1);
                tracing::debug!(key = %key, "cache entry expired");
                None
            }
            Lookup::Absent => {
                self.counters.record_miss();
                tracing::trace!(key = %key, "cache miss");
                None
            }
        }
    }

    /// Store or replace a value.
    ///
    /// The TTL is `ttl_override` if given, otherwise the configured TTL for
    /// the key's kind. A new key arriving at capacity evicts exactly one
    /// entry first; replacing an existing key never evicts.
    pub fn set(&self, key: CacheKey, value: V, ttl_override: Option<Duration>) {
        let ttl = ttl_override.unwrap_or_else(|| self.config.ttl.ttl_for(key.kind()));
        let evicted = self
            .state
            .lock()
            .insert(&key, value, ttl, self.config.max_entries);
        self.record_set(&key, evicted);
    }

    /// Start a read-through fill of `key`.
    ///
    /// Take the fill before fetching and [`complete`](Fill::complete) it with
    /// the fetched value.
    pub fn begin_fill(&self, key: CacheKey) -> Fill<'_, V> {
        let epoch = {
            let mut state = self.state.lock();
            state.fills_in_flight += 1;
            state.epoch
        };
        Fill {
            cache: self,
            key,
            epoch,
        }
    }

    /// Count a lookup that could not use the cache as a miss.
    pub fn record_uncached_miss(&self) {
        self.counters.record_miss();
    }

    fn record_set(&self, key: &CacheKey, evicted: Option<String>) {
        self.counters.record_set();
        if let Some(evicted) = evicted {
            self.counters.record_eviction();
            tracing::debug!(evicted = %evicted, inserted = %key, "evicted oldest cache entry");
        }
    }

    /// Remove every entry whose key equals `prefix` or extends it by whole
    /// segments. Returns the number of entries removed.
    pub fn invalidate(&self, prefix: &str) -> usize {
        let removed = {
            let mut state = self.state.lock();
            let before = state.entries.len();
            state.entries.retain(|key, _| !matches_prefix(key, prefix));
            state.epoch += 1;
            if state.fills_in_flight > 0 {
                let epoch = state.epoch;
                state.invalidated.insert(prefix.to_string(), epoch);
            }
            before - state.entries.len()
        };

        if removed > 0 {
            tracing::debug!(prefix, removed, "cache invalidated");
        }
        removed
    }

    /// Remove exactly this key and any parameterized variants of it.
    pub fn invalidate_key(&self, key: &CacheKey) -> usize {
        self.invalidate(key.as_str())
    }

    /// Remove every entry of `kind` under `scope`.
    pub fn invalidate_kind(&self, scope: &str, kind: &str) -> usize {
        self.invalidate(&CacheKey::kind_prefix(scope, kind))
    }

    /// Remove every entry under `scope`.
    pub fn invalidate_scope(&self, scope: &str) -> usize {
        self.invalidate(scope)
    }

    /// Drop all expired entries. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let removed = {
            let mut state = self.state.lock();
            let before = state.entries.len();
            state.entries.retain(|_, entry| !entry.is_expired(now));
            before - state.entries.len()
        };

        self.counters.record_expirations(removed as u64);
        removed
    }

    /// Remove all entries and reset statistics.
    pub fn clear(&self) {
        {
            let mut state = self.state.lock();
            state.entries.clear();
            state.epoch += 1;
            state.cleared_at = state.epoch;
        }
        self.counters.reset();
    }

    /// Current counters, size and hit rate.
    pub fn stats(&self) -> CacheStats {
        let size = self.len();
        self.counters.snapshot(size)
    }

    /// Whether a key is present, expired or not. Does not touch statistics.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.state.lock().entries.contains_key(key.as_str())
    }

    /// The TTL a freshly stored entry of `kind` would get.
    pub fn ttl_for(&self, kind: &str) -> Duration {
        self.config.ttl.ttl_for(kind)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone> Default for ExpiringCache<V> {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    fn segment() -> impl Strategy<Value = String> {
        "[a-z0-9_]{1,6}"
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Property: scope invalidation removes exactly the keys of that scope.
        #[test]
        fn prop_invalidate_scope_is_exact(
            keys in prop::collection::vec((segment(), segment()), 1..40),
            target in segment(),
        ) {
            let cache: ExpiringCache<u32> =
                ExpiringCache::new(CacheConfig::new().with_max_entries(1000));
            for (scope, kind) in &keys {
                cache.set(CacheKey::new(scope.as_str(), kind.as_str()).unwrap(), 0, None);
            }

            cache.invalidate_scope(&target);

            for (scope, kind) in &keys {
                let key = CacheKey::new(scope.as_str(), kind.as_str()).unwrap();
                prop_assert_eq!(cache.contains(&key), scope != &target);
            }
        }

        /// Property: the cache never holds more than its capacity, and
        /// inserting `cap + 1` distinct keys evicts exactly the first one.
        #[test]
        fn prop_capacity_bound(cap in 1usize..20) {
            let cache: ExpiringCache<usize> =
                ExpiringCache::new(CacheConfig::new().with_max_entries(cap));
            for i in 0..=cap {
                cache.set(CacheKey::new("fam", format!("k{i}")).unwrap(), i, None);
                prop_assert!(cache.len() <= cap);
            }

            prop_assert_eq!(cache.stats().evictions, 1);
            prop_assert!(!cache.contains(&CacheKey::new("fam", "k0").unwrap()));
        }
    }
}
