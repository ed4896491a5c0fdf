//! Hearth Core - expiring cache engine.
//!
//! This crate provides the in-process cache that sits in front of the remote
//! data store: scoped cache keys, a static per-kind TTL table, and a bounded
//! map with lazy expiry and oldest-inserted eviction.

pub mod cache;
pub mod error;

pub use cache::{
    CacheConfig, CacheKey, CacheStats, ExpiringCache, Fill, TtlTable, DEFAULT_MAX_ENTRIES,
    DEFAULT_TTL, KEY_SEPARATOR,
};
pub use error::Error;
