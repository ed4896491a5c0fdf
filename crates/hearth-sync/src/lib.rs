//! Hearth Sync - cached reads with push-driven refresh.
//!
//! This crate sits between application code and a remote data store that
//! also publishes row-level change notifications.
//!
//! # Modules
//!
//! - [`facade`] - Public entry point ([`SyncFacade`])
//! - [`coordinator`] - Read-through caching, write invalidation, refresh on change
//! - [`registry`] - One change feed channel per `(scope, table)`
//! - [`dispatcher`] - Payload normalization and listener fan-out
//! - [`bus`] - In-process event bus, one topic per table
//! - [`sweeper`] - Background expiry sweep
//! - [`store`] / [`feed`] - Collaborator boundaries
//! - [`memory`] - In-memory collaborators
//!
//! # Flow
//!
//! ```text
//! read  ──► cache hit? ──► rows
//!              │ miss
//!              └──► DataStore::fetch ──► cache.set ──► rows
//!
//! ChangeFeed ──► registry pump ──► dispatcher ──► coordinator worker
//!                                      │            (invalidate, fetch, set,
//!                                      ▼             refresh listeners)
//!                                   EventBus
//! ```

pub mod bus;
pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod facade;
pub mod feed;
pub mod memory;
pub mod registry;
pub mod store;
pub mod subscription;
pub mod sweeper;

pub use bus::EventBus;
pub use config::{SyncConfig, DEFAULT_BUS_CAPACITY};
pub use coordinator::{AttachSummary, RefreshCallback, SyncCoordinator, SyncCoordinatorBuilder};
pub use dispatcher::{ChangeDispatcher, ChangeListener, DispatchReport, ListenerId};
pub use error::{Error, FeedError, ListenerError, StoreError, StoreErrorKind};
pub use facade::SyncFacade;
pub use feed::{ChangeFeed, ChannelFilter, ChannelHandle, ChannelStatus, FeedChannel, FeedMessage};
pub use memory::{InMemoryChangeFeed, InMemoryDataStore};
pub use registry::SubscriptionRegistry;
pub use store::{DataStore, Mutation, MutationOutcome};
pub use subscription::{EventHandler, SubscribeOutcome, SubscriptionInfo, SubscriptionState};
pub use sweeper::CacheSweeper;

pub use hearth_core::{CacheKey, CacheStats};
pub use hearth_proto::{ChangeEvent, Record, RecordSet, Table};
