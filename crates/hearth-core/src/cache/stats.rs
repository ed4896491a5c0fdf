//! Cache statistics.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use serde::Serialize;

/// Live counters, updated without taking the entry lock.
#[derive(Debug, Default)]
pub(crate) struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl CacheCounters {
    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn record_set(&self) {
        self.sets.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn record_eviction(&self) {
        self.evictions.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn record_expirations(&self, count: u64) {
        self.expirations.fetch_add(count, AtomicOrdering::Relaxed);
    }

    pub(crate) fn reset(&self) {
        self.hits.store(0, AtomicOrdering::Relaxed);
        self.misses.store(0, AtomicOrdering::Relaxed);
        self.sets.store(0, AtomicOrdering::Relaxed);
        self.evictions.store(0, AtomicOrdering::Relaxed);
        self.expirations.store(0, AtomicOrdering::Relaxed);
    }

    pub(crate) fn snapshot(&self, size: usize) -> CacheStats {
        let hits = self.hits.load(AtomicOrdering::Relaxed);
        let misses = self.misses.load(AtomicOrdering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        };

        CacheStats {
            hits,
            misses,
            sets: self.sets.load(AtomicOrdering::Relaxed),
            evictions: self.evictions.load(AtomicOrdering::Relaxed),
            expirations: self.expirations.load(AtomicOrdering::Relaxed),
            size,
            hit_rate,
        }
    }
}

/// Point-in-time view of cache usage.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Reads served from the cache.
    pub hits: u64,
    /// Reads that found nothing or an expired entry.
    pub misses: u64,
    /// Stores, including replacements.
    pub sets: u64,
    /// Entries removed to make room for new keys.
    pub evictions: u64,
    /// Entries removed because their TTL elapsed.
    pub expirations: u64,
    /// Entries currently held.
    pub size: usize,
    /// `hits / (hits + misses)`, or 0.0 before any access.
    pub hit_rate: f64,
}

impl CacheStats {
    /// Hit rate as a percentage with one decimal, e.g. `"60.0%"`.
    pub fn hit_rate_percent(&self) -> String {
        format!("{:.1}%", self.hit_rate * 100.0)
    }

    /// Total number of lookups.
    pub fn accesses(&self) -> u64 {
        self.hits + self.misses
    }
}
