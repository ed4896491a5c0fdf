//! Cache configuration and the per-kind TTL table.

use std::collections::HashMap;
use std::time::Duration;

/// Default TTL for kinds without an explicit entry (2 minutes).
pub const DEFAULT_TTL: Duration = Duration::from_secs(120);

/// Default capacity bound of the cache.
pub const DEFAULT_MAX_ENTRIES: usize = 100;

/// Static mapping from data kind to entry lifetime.
///
/// Unknown kinds fall back to the table's default TTL.
#[derive(Debug, Clone)]
pub struct TtlTable {
    default_ttl: Duration,
    by_kind: HashMap<String, Duration>,
}

impl TtlTable {
    /// Create an empty table with the given fallback TTL.
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            default_ttl,
            by_kind: HashMap::new(),
        }
    }

    /// Set the TTL for a kind.
    pub fn with_kind(mut self, kind: impl Into<String>, ttl: Duration) -> Self {
        self.by_kind.insert(kind.into(), ttl);
        self
    }

    /// Set the fallback TTL.
    pub fn with_default(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Resolve the TTL for a kind.
    pub fn ttl_for(&self, kind: &str) -> Duration {
        self.by_kind.get(kind).copied().unwrap_or(self.default_ttl)
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Kinds with an explicit TTL.
    pub fn kinds(&self) -> impl Iterator<Item = (&str, Duration)> {
        self.by_kind.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl Default for TtlTable {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

/// Configuration for an [`ExpiringCache`](super::ExpiringCache).
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries before eviction kicks in.
    pub max_entries: usize,
    /// TTL lookup table.
    pub ttl: TtlTable,
}

impl CacheConfig {
    /// Create a cache config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the capacity bound (at least one entry).
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max.max(1);
        self
    }

    /// Set the TTL table.
    pub fn with_ttl_table(mut self, ttl: TtlTable) -> Self {
        self.ttl = ttl;
        self
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            ttl: TtlTable::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_kind_falls_back() {
        let table = TtlTable::new(Duration::from_secs(30))
            .with_kind("members", Duration::from_secs(300));

        assert_eq!(table.ttl_for("members"), Duration::from_secs(300));
        assert_eq!(table.ttl_for("stats"), Duration::from_secs(30));
    }

    #[test]
    fn test_cache_config_builder() {
        let config = CacheConfig::new()
            .with_max_entries(0)
            .with_ttl_table(TtlTable::default().with_default(Duration::from_secs(5)));

        assert_eq!(config.max_entries, 1);
        assert_eq!(config.ttl.default_ttl(), Duration::from_secs(5));
        assert_eq!(config.ttl.kinds().count(), 0);
    }
}
