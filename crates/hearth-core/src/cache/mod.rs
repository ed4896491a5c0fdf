//! Expiring read-through cache.
//!
//! # Keys
//!
//! [`CacheKey`] cannot be built without a scope, and its segments cannot
//! contain the separator, so invalidating a scope (`fam1`) can never remove
//! entries of a different scope (`fam10`).
//!
//! # Expiry and eviction
//!
//! Each entry lives for the TTL of its kind, resolved through a static
//! [`TtlTable`]. Expired entries are dropped lazily when read. When a new key
//! arrives at capacity, the oldest inserted entry is evicted; this is not LRU.
//!
//! # Example
//!
//! ```ignore
//! let cache: ExpiringCache<String> = ExpiringCache::new(CacheConfig::default());
//! let key = CacheKey::new("fam1", "chores")?;
//!
//! cache.set(key.clone(), "dishes".into(), None);
//! assert_eq!(cache.get(&key).as_deref(), Some("dishes"));
//!
//! cache.invalidate_scope("fam1");
//! assert!(cache.get(&key).is_none());
//! ```

pub mod expiring;
pub mod key;
pub mod stats;
pub mod ttl;

pub use expiring::{ExpiringCache, Fill};
pub use key::{matches_prefix, CacheKey, KEY_SEPARATOR};
pub use stats::CacheStats;
pub use ttl::{CacheConfig, TtlTable, DEFAULT_MAX_ENTRIES, DEFAULT_TTL};
