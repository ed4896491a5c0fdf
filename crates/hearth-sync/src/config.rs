//! Sync layer configuration.

use std::collections::HashMap;
use std::time::Duration;

use hearth_core::{CacheConfig, TtlTable, DEFAULT_MAX_ENTRIES, DEFAULT_TTL};
use hearth_proto::Table;

/// Default capacity of each event bus topic.
pub const DEFAULT_BUS_CAPACITY: usize = 256;

/// Configuration for a [`SyncFacade`](crate::SyncFacade).
///
/// Static after construction.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// TTL for kinds without an explicit entry.
    pub default_ttl: Duration,
    /// Per-kind TTL overrides.
    pub ttl_by_kind: HashMap<String, Duration>,
    /// Capacity bound of the cache.
    pub max_cache_entries: usize,
    /// Interval of the background expiry sweep. `None` disables it.
    pub sweep_interval: Option<Duration>,
    /// Buffered events per bus topic before slow receivers start lagging.
    pub bus_capacity: usize,
}

impl SyncConfig {
    /// Create a config with the default table TTLs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the fallback TTL.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set the TTL for a kind.
    pub fn with_kind_ttl(mut self, kind: impl Into<String>, ttl: Duration) -> Self {
        self.ttl_by_kind.insert(kind.into(), ttl);
        self
    }

    /// Set the cache capacity (at least one entry).
    pub fn with_max_cache_entries(mut self, max: usize) -> Self {
        self.max_cache_entries = max.max(1);
        self
    }

    /// Enable the background expiry sweep.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    /// Disable the background expiry sweep.
    pub fn without_sweeper(mut self) -> Self {
        self.sweep_interval = None;
        self
    }

    /// Set the per-topic bus capacity.
    pub fn with_bus_capacity(mut self, capacity: usize) -> Self {
        self.bus_capacity = capacity.max(1);
        self
    }

    /// The TTL that applies to `kind`.
    pub fn ttl_for(&self, kind: &str) -> Duration {
        self.ttl_by_kind
            .get(kind)
            .copied()
            .unwrap_or(self.default_ttl)
    }

    /// Build the cache configuration.
    pub fn cache_config(&self) -> CacheConfig {
        let ttl = self
            .ttl_by_kind
            .iter()
            .fold(TtlTable::new(self.default_ttl), |table, (kind, ttl)| {
                table.with_kind(kind.clone(), *ttl)
            });

        CacheConfig::new()
            .with_max_entries(self.max_cache_entries)
            .with_ttl_table(ttl)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        let ttl_by_kind = [
            (Table::Members, Duration::from_secs(300)),
            (Table::Chores, Duration::from_secs(60)),
            (Table::Rewards, Duration::from_secs(300)),
            (Table::Completions, Duration::from_secs(30)),
        ]
        .into_iter()
        .map(|(table, ttl)| (table.as_str().to_string(), ttl))
        .collect();

        Self {
            default_ttl: DEFAULT_TTL,
            ttl_by_kind,
            max_cache_entries: DEFAULT_MAX_ENTRIES,
            sweep_interval: None,
            bus_capacity: DEFAULT_BUS_CAPACITY,
        }
    }
}
