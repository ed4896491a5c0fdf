//! Sync coordinator.
//!
//! Ties the cache, the data store and the change feed together:
//!
//! - reads go through the cache and fill it on a miss
//! - writes invalidate the written kind once the store accepts them
//! - change events for attached scopes invalidate the table, re-fetch it,
//!   store the fresh snapshot and notify refresh listeners
//!
//! Change events are queued onto one worker task per `(scope, table)`, so
//! refreshes of a table run in arrival order while different tables refresh
//! in parallel. Detaching a scope stops its workers before returning.
//!
//! Reads fill the cache through [`ExpiringCache::begin_fill`]: rows fetched
//! before an invalidation of their key are returned but never stored.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use hearth_core::{CacheKey, ExpiringCache};
use hearth_proto::{ChangeEvent, Record, RecordSet, Table};

use crate::dispatcher::{ChangeDispatcher, ListenerId};
use crate::error::{Error, ListenerError, StoreError};
use crate::feed::ChangeFeed;
use crate::registry::SubscriptionRegistry;
use crate::store::{DataStore, Mutation, MutationOutcome};
use crate::subscription::{EventHandler, SubscribeOutcome};

/// Callback invoked with `(scope, fresh rows)` after a table is refreshed.
pub type RefreshCallback = Arc<dyn Fn(&str, &RecordSet) + Send + Sync>;

/// What an [`attach`](SyncCoordinator::attach) call did per table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachSummary {
    pub opened: Vec<Table>,
    pub already_subscribed: Vec<Table>,
    /// Tables whose open was overtaken by a detach.
    pub cancelled: Vec<Table>,
    /// Tables the feed refused, with the reason.
    pub failed: Vec<(Table, String)>,
}

impl AttachSummary {
    /// Whether every requested table ended up subscribed.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.cancelled.is_empty()
    }
}

type WorkerKey = (String, Table);

struct RefreshWorker {
    sender: mpsc::UnboundedSender<ChangeEvent>,
    handle: JoinHandle<()>,
}

struct CoordinatorInner {
    cache: Arc<ExpiringCache<RecordSet>>,
    store: Arc<dyn DataStore>,
    dispatcher: Arc<ChangeDispatcher>,
    registry: SubscriptionRegistry,
    attached: Mutex<HashSet<String>>,
    table_listeners: Mutex<HashMap<Table, ListenerId>>,
    workers: DashMap<WorkerKey, RefreshWorker>,
    refresh_listeners: RwLock<HashMap<Table, Vec<(ListenerId, RefreshCallback)>>>,
    next_refresh_id: AtomicU64,
}

impl CoordinatorInner {
    fn is_attached(&self, scope: &str) -> bool {
        self.attached.lock().contains(scope)
    }

    /// Register this coordinator with the dispatcher for `table`, once.
    fn ensure_table_listener(self: &Arc<Self>, table: Table) {
        let mut listeners = self.table_listeners.lock();
        if listeners.contains_key(&table) {
            return;
        }

        let weak = Arc::downgrade(self);
        let id = self.dispatcher.add_listener(
            table,
            Arc::new(move |event: &ChangeEvent| -> Result<(), ListenerError> {
                match weak.upgrade() {
                    Some(inner) => inner.enqueue(event),
                    None => Ok(()),
                }
            }),
        );
        listeners.insert(table, id);
    }

    /// Queue an event on its `(scope, table)` worker.
    fn enqueue(self: &Arc<Self>, event: &ChangeEvent) -> Result<(), ListenerError> {
        if !self.is_attached(&event.scope) {
            debug!(scope = %event.scope, table = %event.table, "ignoring change for detached scope");
            return Ok(());
        }

        let runtime = Handle::try_current()
            .map_err(|_| ListenerError::new("no async runtime for refresh worker"))?;
        let key: WorkerKey = (event.scope.clone(), event.table);
        let sender = self
            .workers
            .entry(key)
            .or_insert_with(|| self.spawn_worker(&runtime, &event.scope, event.table))
            .sender
            .clone();

        sender
            .send(event.clone())
            .map_err(|_| ListenerError::new("refresh worker stopped"))
    }

    fn spawn_worker(
        self: &Arc<Self>,
        runtime: &Handle,
        scope: &str,
        table: Table,
    ) -> RefreshWorker {
        let (sender, mut rx) = mpsc::unbounded_channel::<ChangeEvent>();
        let weak = Arc::downgrade(self);
        let scope = scope.to_string();

        let handle = runtime.spawn(async move {
            debug!(scope = %scope, table = %table, "refresh worker started");
            while let Some(event) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.refresh(&event).await;
            }
            debug!(scope = %scope, table = %table, "refresh worker stopped");
        });
        RefreshWorker { sender, handle }
    }

    /// Stop every refresh worker of `scope` and wait for them to exit.
    async fn stop_workers(&self, scope: &str) -> usize {
        let keys: Vec<WorkerKey> = self
            .workers
            .iter()
            .filter(|entry| entry.key().0 == scope)
            .map(|entry| entry.key().clone())
            .collect();

        let handles: Vec<JoinHandle<()>> = keys
            .iter()
            .filter_map(|key| self.workers.remove(key))
            .map(|(_, worker)| {
                worker.handle.abort();
                worker.handle
            })
            .collect();

        let stopped = handles.len();
        join_all(handles).await;
        stopped
    }

    /// Invalidate the event's table; if the scope is attached, re-fetch and
    /// re-store it, then notify.
    async fn refresh(&self, event: &ChangeEvent) {
        let (scope, table) = (event.scope.as_str(), event.table);

        let removed = self.cache.invalidate_kind(scope, table.as_str());
        debug!(
            scope,
            table = %table,
            event_type = %event.event_type,
            record_id = ?event.record_id(),
            removed,
            "cache invalidated by change"
        );

        if !self.is_attached(scope) {
            debug!(scope, table = %table, "not refreshing detached scope");
            return;
        }

        let fill = match CacheKey::new(scope, table.as_str()) {
            Ok(key) => self.cache.begin_fill(key),
            Err(e) => {
                warn!(scope, table = %table, error = %e, "cannot cache refreshed rows");
                return;
            }
        };

        let records: RecordSet = match self.store.fetch(table, scope, None).await {
            Ok(records) => Arc::new(records),
            Err(e) => {
                warn!(scope, table = %table, error = %e, "refresh after change failed");
                return;
            }
        };

        {
            // Holding the attach lock keeps a concurrent detach from
            // clearing the scope between the check and the store.
            let attached = self.attached.lock();
            if !attached.contains(scope) {
                return;
            }
            fill.complete(Arc::clone(&records), None);
        }

        self.notify_refresh(scope, table, &records);
    }

    fn notify_refresh(&self, scope: &str, table: Table, records: &RecordSet) {
        let callbacks = self
            .refresh_listeners
            .read()
            .get(&table)
            .cloned()
            .unwrap_or_default();

        for (id, callback) in callbacks {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(scope, records))).is_err() {
                warn!(listener_id = id.as_u64(), scope, table = %table, "refresh listener panicked");
            }
        }
    }

    fn add_refresh_listener(&self, table: Table, callback: RefreshCallback) -> ListenerId {
        let id = ListenerId::new(self.next_refresh_id.fetch_add(1, Ordering::SeqCst));
        self.refresh_listeners
            .write()
            .entry(table)
            .or_default()
            .push((id, callback));
        id
    }
}

impl Drop for CoordinatorInner {
    fn drop(&mut self) {
        for (_, id) in self.table_listeners.get_mut().drain() {
            self.dispatcher.remove_listener(id);
        }
    }
}

/// Builder for [`SyncCoordinator`].
pub struct SyncCoordinatorBuilder {
    cache: Arc<ExpiringCache<RecordSet>>,
    store: Arc<dyn DataStore>,
    feed: Arc<dyn ChangeFeed>,
    dispatcher: Arc<ChangeDispatcher>,
    refresh: Vec<(Table, RefreshCallback)>,
}

impl SyncCoordinatorBuilder {
    /// Register a refresh listener at construction.
    pub fn on_refresh<F>(mut self, table: Table, callback: F) -> Self
    where
        F: Fn(&str, &RecordSet) + Send + Sync + 'static,
    {
        self.refresh.push((table, Arc::new(callback)));
        self
    }

    pub fn build(self) -> SyncCoordinator {
        let inner = Arc::new(CoordinatorInner {
            cache: self.cache,
            store: self.store,
            dispatcher: self.dispatcher,
            registry: SubscriptionRegistry::new(self.feed),
            attached: Mutex::new(HashSet::new()),
            table_listeners: Mutex::new(HashMap::new()),
            workers: DashMap::new(),
            refresh_listeners: RwLock::new(HashMap::new()),
            next_refresh_id: AtomicU64::new(1),
        });
        for (table, callback) in self.refresh {
            inner.add_refresh_listener(table, callback);
        }
        SyncCoordinator { inner }
    }
}

/// Coordinates cached reads, invalidating writes and push-driven refresh.
///
/// Cloning is cheap and yields a handle to the same coordinator.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl SyncCoordinator {
    pub fn builder(
        cache: Arc<ExpiringCache<RecordSet>>,
        store: Arc<dyn DataStore>,
        feed: Arc<dyn ChangeFeed>,
        dispatcher: Arc<ChangeDispatcher>,
    ) -> SyncCoordinatorBuilder {
        SyncCoordinatorBuilder {
            cache,
            store,
            feed,
            dispatcher,
            refresh: Vec::new(),
        }
    }

    pub fn new(
        cache: Arc<ExpiringCache<RecordSet>>,
        store: Arc<dyn DataStore>,
        feed: Arc<dyn ChangeFeed>,
        dispatcher: Arc<ChangeDispatcher>,
    ) -> Self {
        Self::builder(cache, store, feed, dispatcher).build()
    }

    /// Read `(scope, kind, params)` through the cache.
    ///
    /// On a miss `fetcher` is awaited and its rows are stored with the kind's
    /// TTL, unless the key was invalidated while the fetch was in flight.
    /// Fetch errors propagate and nothing is cached. Concurrent misses for the
    /// same key each run their own fetch; the last store wins.
    ///
    /// An invalid key (empty segment or one containing `:`) panics in debug
    /// builds; release builds read uncached.
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
        let key = match cache_key(scope, kind, params) {
            Ok(key) => key,
            Err(e) => {
                if cfg!(debug_assertions) {
                    panic!("invalid cache key for scope {scope:?} kind {kind:?}: {e}");
                }
                return self.read_uncached(scope, kind, e, fetcher).await;
            }
        };

        if let Some(hit) = self.inner.cache.get(&key) {
            return Ok(hit);
        }

        let fill = self.inner.cache.begin_fill(key);
        let records: RecordSet = Arc::new(fetcher().await?);
        if fill.complete(Arc::clone(&records), None) {
            debug!(scope, kind, rows = records.len(), "cached fetched rows");
        }
        Ok(records)
    }

    /// Fallback for reads whose key cannot be built: counted as a miss,
    /// fetched and never stored.
    async fn read_uncached<F, Fut>(
        &self,
        scope: &str,
        kind: &str,
        error: hearth_core::Error,
        fetcher: F,
    ) -> Result<RecordSet, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<Record>, StoreError>>,
    {
        warn!(scope, kind, error = %error, "invalid cache key, reading uncached");
        self.inner.cache.record_uncached_miss();
        Ok(Arc::new(fetcher().await?))
    }

    /// Read a whole table (optionally filtered) through the data store.
    pub async fn read_table(
        &self,
        scope: &str,
        table: Table,
        params: Option<&str>,
    ) -> Result<RecordSet, Error> {
        let store = Arc::clone(&self.inner.store);
        self.read(scope, table.as_str(), params, || async move {
            store.fetch(table, scope, params).await
        })
        .await
    }

    /// Run `mutation`; on success invalidate every cached entry of `(scope, kind)`.
    ///
    /// A failed mutation leaves the cache untouched.
    pub async fn write<F, Fut, T>(&self, scope: &str, kind: &str, mutation: F) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let outcome = mutation().await?;
        let removed = self.inner.cache.invalidate_kind(scope, kind);
        debug!(scope, kind, removed, "cache invalidated by write");
        Ok(outcome)
    }

    /// Apply a [`Mutation`] through the data store with write-through invalidation.
    pub async fn mutate(
        &self,
        scope: &str,
        table: Table,
        mutation: Mutation,
    ) -> Result<MutationOutcome, Error> {
        let store = Arc::clone(&self.inner.store);
        self.write(scope, table.as_str(), || async move {
            store.mutate(table, mutation).await
        })
        .await
    }

    /// Handle a change event inline, bypassing the per-table workers.
    ///
    /// The event's table is always invalidated for its scope; it is only
    /// re-fetched and announced to refresh listeners while the scope is
    /// attached.
    pub async fn on_change_event(&self, event: &ChangeEvent) {
        self.inner.refresh(event).await;
    }

    /// Attach a scope: subscribe to every distinct table concurrently.
    pub async fn attach(&self, scope: &str, tables: &[Table]) -> AttachSummary {
        self.inner.attached.lock().insert(scope.to_string());

        let mut distinct = tables.to_vec();
        distinct.sort();
        distinct.dedup();
        for &table in &distinct {
            self.inner.ensure_table_listener(table);
        }

        let handler = self.event_handler();
        let results = join_all(distinct.iter().map(|&table| {
            let handler = Arc::clone(&handler);
            async move {
                let result = self.inner.registry.subscribe(scope, table, handler).await;
                (table, result)
            }
        }))
        .await;

        let mut summary = AttachSummary::default();
        for (table, result) in results {
            match result {
                Ok(SubscribeOutcome::Opened) => summary.opened.push(table),
                Ok(SubscribeOutcome::AlreadySubscribed) => summary.already_subscribed.push(table),
                Ok(SubscribeOutcome::Cancelled) => summary.cancelled.push(table),
                Err(e) => summary.failed.push((table, e.to_string())),
            }
        }

        info!(
            scope,
            opened = summary.opened.len(),
            already_subscribed = summary.already_subscribed.len(),
            cancelled = summary.cancelled.len(),
            failed = summary.failed.len(),
            "scope attached"
        );
        summary
    }

    /// Detach a scope: close its subscriptions, stop its refresh workers and
    /// drop its cache entries. Idempotent.
    ///
    /// Queued changes of the scope are discarded; once this returns no
    /// refresh of the scope is running.
    pub async fn detach(&self, scope: &str) {
        let was_attached = self.inner.attached.lock().remove(scope);
        let closed = self.inner.registry.unsubscribe_all(scope).await;
        let workers = self.inner.stop_workers(scope).await;

        let removed = self.inner.cache.invalidate_scope(scope);

        if was_attached || closed > 0 {
            info!(scope, subscriptions = closed, workers, cache_entries = removed, "scope detached");
        } else {
            debug!(scope, "detach of unattached scope");
        }
    }

    /// Detach every attached scope and unregister from the dispatcher.
    pub async fn shutdown(&self) {
        for scope in self.attached_scopes() {
            self.detach(&scope).await;
        }

        let listeners: Vec<ListenerId> = self
            .inner
            .table_listeners
            .lock()
            .drain()
            .map(|(_, id)| id)
            .collect();
        for id in listeners {
            self.inner.dispatcher.remove_listener(id);
        }
    }

    /// Register a callback run after each refresh of `table`.
    pub fn add_refresh_listener<F>(&self, table: Table, callback: F) -> ListenerId
    where
        F: Fn(&str, &RecordSet) + Send + Sync + 'static,
    {
        self.inner.add_refresh_listener(table, Arc::new(callback))
    }

    pub fn remove_refresh_listener(&self, table: Table, id: ListenerId) -> bool {
        let mut listeners = self.inner.refresh_listeners.write();
        let Some(list) = listeners.get_mut(&table) else {
            return false;
        };
        let before = list.len();
        list.retain(|(listener_id, _)| *listener_id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            listeners.remove(&table);
        }
        removed
    }

    pub fn refresh_listener_count(&self, table: Table) -> usize {
        self.inner
            .refresh_listeners
            .read()
            .get(&table)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn is_attached(&self, scope: &str) -> bool {
        self.inner.is_attached(scope)
    }

    /// Attached scopes, sorted.
    pub fn attached_scopes(&self) -> Vec<String> {
        let mut scopes: Vec<String> = self.inner.attached.lock().iter().cloned().collect();
        scopes.sort();
        scopes
    }

    /// Number of live refresh workers.
    pub fn worker_count(&self) -> usize {
        self.inner.workers.len()
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.inner.registry
    }

    pub fn cache(&self) -> &Arc<ExpiringCache<RecordSet>> {
        &self.inner.cache
    }

    fn event_handler(&self) -> EventHandler {
        let dispatcher = Arc::clone(&self.inner.dispatcher);
        Arc::new(move |scope: &str, table: Table, payload: &Value| {
            dispatcher.on_raw_event(scope, table.as_str(), payload);
        })
    }
}

fn cache_key(scope: &str, kind: &str, params: Option<&str>) -> Result<CacheKey, hearth_core::Error> {
    match params {
        Some(params) => CacheKey::with_params(scope, kind, params),
        None => CacheKey::new(scope, kind),
    }
}
