//! Public entry point of the sync layer.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{info, warn};

use hearth_core::{CacheStats, ExpiringCache};
use hearth_proto::{Record, RecordSet, Table};

use crate::bus::EventBus;
use crate::config::SyncConfig;
use crate::coordinator::{AttachSummary, SyncCoordinator};
use crate::dispatcher::{ChangeDispatcher, ListenerId};
use crate::error::{Error, StoreError};
use crate::feed::ChangeFeed;
use crate::store::{DataStore, Mutation, MutationOutcome};
use crate::sweeper::CacheSweeper;

/// Cached, change-aware access to the backend tables.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use hearth_sync::{InMemoryChangeFeed, InMemoryDataStore, SyncConfig, SyncFacade};
/// use hearth_proto::Table;
///
/// let feed = Arc::new(InMemoryChangeFeed::new());
/// let store = Arc::new(InMemoryDataStore::new().with_feed(feed.clone()));
/// let sync = SyncFacade::new(SyncConfig::default(), store, feed);
///
/// sync.attach("fam1", &Table::ALL).await;
/// sync.subscribe(Table::Chores, |scope, rows| println!("{scope}: {} chores", rows.len()));
/// let chores = sync.read_table("fam1", Table::Chores).await?;
/// println!("hit rate {}", sync.get_stats().hit_rate_percent());
/// sync.shutdown().await;
/// ```
pub struct SyncFacade {
    config: SyncConfig,
    cache: Arc<ExpiringCache<RecordSet>>,
    bus: Arc<EventBus>,
    dispatcher: Arc<ChangeDispatcher>,
    coordinator: SyncCoordinator,
    sweeper: Mutex<Option<CacheSweeper>>,
}

impl SyncFacade {
    /// Create a facade with its own event bus.
    pub fn new(config: SyncConfig, store: Arc<dyn DataStore>, feed: Arc<dyn ChangeFeed>) -> Self {
        let bus = Arc::new(EventBus::new(config.bus_capacity));
        Self::with_bus(config, store, feed, bus)
    }

    /// Create a facade publishing on a shared event bus.
    ///
    /// The sweeper, when configured, only starts inside a Tokio runtime.
    pub fn with_bus(
        config: SyncConfig,
        store: Arc<dyn DataStore>,
        feed: Arc<dyn ChangeFeed>,
        bus: Arc<EventBus>,
    ) -> Self {
        let cache = Arc::new(ExpiringCache::new(config.cache_config()));
        let dispatcher = Arc::new(ChangeDispatcher::new(Arc::clone(&bus)));
        let coordinator =
            SyncCoordinator::new(Arc::clone(&cache), store, feed, Arc::clone(&dispatcher));

        let sweeper = match config.sweep_interval {
            Some(interval) if Handle::try_current().is_ok() => {
                Some(CacheSweeper::start(Arc::clone(&cache), interval))
            }
            Some(_) => {
                warn!("no async runtime, cache sweeper disabled");
                None
            }
            None => None,
        };

        info!(
            max_cache_entries = config.max_cache_entries,
            default_ttl_secs = config.default_ttl.as_secs(),
            sweeper = sweeper.is_some(),
            "sync facade created"
        );

        Self {
            config,
            cache,
            bus,
            dispatcher,
            coordinator,
            sweeper: Mutex::new(sweeper),
        }
    }

    /// Read `(scope, kind, params)` through the cache, fetching on a miss.
    pub async fn read<F, Fut>(
        &self,
        scope: &str,
        kind: &str,
        params: Option<&str>,
        fetcher: F,
    ) -> Result<RecordSet, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<Record>, StoreError>>,
    {
        self.coordinator.read(scope, kind, params, fetcher).await
    }

    /// Read every row of `table` in `scope`.
    pub async fn read_table(&self, scope: &str, table: Table) -> Result<RecordSet, Error> {
        self.coordinator.read_table(scope, table, None).await
    }

    /// Read the rows of `table` in `scope` matching `params`.
    pub async fn read_table_where(
        &self,
        scope: &str,
        table: Table,
        params: &str,
    ) -> Result<RecordSet, Error> {
        self.coordinator.read_table(scope, table, Some(params)).await
    }

    /// Run a custom write and invalidate `(scope, kind)` on success.
    pub async fn write<F, Fut, T>(&self, scope: &str, kind: &str, mutation: F) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        self.coordinator.write(scope, kind, mutation).await
    }

    /// Apply a mutation through the data store and invalidate the table.
    pub async fn mutate(
        &self,
        scope: &str,
        table: Table,
        mutation: Mutation,
    ) -> Result<MutationOutcome, Error> {
        self.coordinator.mutate(scope, table, mutation).await
    }

    pub async fn attach(&self, scope: &str, tables: &[Table]) -> AttachSummary {
        self.coordinator.attach(scope, tables).await
    }

    pub async fn detach(&self, scope: &str) {
        self.coordinator.detach(scope).await
    }

    pub fn get_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Call `listener` with fresh rows each time `kind` is refreshed by a change.
    pub fn subscribe<F>(&self, kind: Table, listener: F) -> ListenerId
    where
        F: Fn(&str, &RecordSet) + Send + Sync + 'static,
    {
        self.coordinator.add_refresh_listener(kind, listener)
    }

    pub fn unsubscribe(&self, kind: Table, id: ListenerId) -> bool {
        self.coordinator.remove_refresh_listener(kind, id)
    }

    /// Bus carrying every dispatched change event.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn dispatcher(&self) -> &Arc<ChangeDispatcher> {
        &self.dispatcher
    }

    pub fn coordinator(&self) -> &SyncCoordinator {
        &self.coordinator
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Detach every scope and stop the sweeper.
    pub async fn shutdown(&self) {
        self.coordinator.shutdown().await;

        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.join().await;
        }
        info!("sync facade shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryChangeFeed, InMemoryDataStore};
    use hearth_proto::Reward;
    use std::time::Duration;

    fn facade(config: SyncConfig) -> (SyncFacade, Arc<InMemoryDataStore>) {
        let feed = Arc::new(InMemoryChangeFeed::new());
        let store = Arc::new(InMemoryDataStore::new().with_feed(feed.clone()));
        store.seed(Record::Reward(Reward {
            id: 1,
            family_id: "fam1".into(),
            title: "Movie night".into(),
            cost: 50,
        }));
        (SyncFacade::new(config, store.clone(), feed), store)
    }

    #[tokio::test]
    async fn test_stats_through_facade() {
        let (sync, _) = facade(SyncConfig::default());

        sync.read_table("fam1", Table::Rewards).await.unwrap();
        sync.read_table("fam1", Table::Rewards).await.unwrap();

        let stats = sync.get_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
        assert_eq!(stats.hit_rate_percent(), "50.0%");
    }

    #[tokio::test]
    async fn test_subscribe_and_unsubscribe() {
        let (sync, _) = facade(SyncConfig::default());

        let id = sync.subscribe(Table::Rewards, |_, _| {});
        assert!(sync.unsubscribe(Table::Rewards, id));
        assert!(!sync.unsubscribe(Table::Rewards, id));
    }

    #[tokio::test]
    async fn test_mutate_invalidates() {
        let (sync, store) = facade(SyncConfig::default());
        sync.read_table("fam1", Table::Rewards).await.unwrap();

        sync.mutate("fam1", Table::Rewards, Mutation::delete(1))
            .await
            .unwrap();
        let rewards = sync.read_table("fam1", Table::Rewards).await.unwrap();

        assert!(rewards.is_empty());
        assert_eq!(store.fetch_count(Table::Rewards), 2);
    }

    #[tokio::test]
    async fn test_shutdown_stops_sweeper() {
        let config = SyncConfig::default().with_sweep_interval(Duration::from_secs(60));
        let (sync, _) = facade(config);
        sync.attach("fam1", &[Table::Rewards]).await;

        sync.shutdown().await;

        assert!(sync.sweeper.lock().is_none());
        assert!(sync.coordinator().attached_scopes().is_empty());
    }

    #[test]
    fn test_sweeper_needs_runtime() {
        let config = SyncConfig::default().with_sweep_interval(Duration::from_secs(60));
        let (sync, _) = facade(config);
        assert!(sync.sweeper.lock().is_none());
    }
}
