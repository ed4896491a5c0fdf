//! In-memory collaborators.
//!
//! [`InMemoryDataStore`] and [`InMemoryChangeFeed`] stand in for the remote
//! backend in tests and in the `hearth` binary. A store linked to a feed
//! emits a change payload for every successful mutation, the way the real
//! backend's replication stream does.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use hearth_proto::{EventType, Record, Table};

use crate::error::{FeedError, StoreError};
use crate::feed::{ChangeFeed, ChannelFilter, ChannelHandle, ChannelStatus, FeedChannel, FeedMessage};
use crate::store::{DataStore, Mutation, MutationOutcome};

struct OpenChannel {
    scope: String,
    table: Table,
    filter: ChannelFilter,
    tx: mpsc::UnboundedSender<FeedMessage>,
}

/// Change feed backed by in-process channels.
pub struct InMemoryChangeFeed {
    channels: Mutex<HashMap<ChannelHandle, OpenChannel>>,
    next_handle: AtomicU64,
    auto_ack: bool,
    open_delay: Option<Duration>,
    rejected: Mutex<HashMap<Table, String>>,
    opened: AtomicU64,
    closed: AtomicU64,
}

impl InMemoryChangeFeed {
    /// Create a feed that acknowledges channels as soon as they open.
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            auto_ack: true,
            open_delay: None,
            rejected: Mutex::new(HashMap::new()),
            opened: AtomicU64::new(0),
            closed: AtomicU64::new(0),
        }
    }

    /// Whether opened channels are acknowledged immediately.
    pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    /// Delay every `open_channel` call.
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }

    /// Reject channel requests for `table` until [`allow_table`](Self::allow_table).
    pub fn reject_table(&self, table: Table, reason: impl Into<String>) {
        self.rejected.lock().insert(table, reason.into());
    }

    pub fn allow_table(&self, table: Table) {
        self.rejected.lock().remove(&table);
    }

    /// Push a change payload to every open channel of `(scope, table)`.
    ///
    /// Returns the number of channels reached.
    pub fn emit(&self, scope: &str, table: Table, payload: Value) -> usize {
        let channels = self.channels.lock();
        let reached = channels
            .values()
            .filter(|channel| channel.table == table && channel.filter.value == scope)
            .filter(|channel| channel.tx.send(FeedMessage::Change(payload.clone())).is_ok())
            .count();

        trace!(scope, table = %table, channels = reached, "change emitted");
        reached
    }

    /// Acknowledge a channel opened without auto-ack.
    pub fn acknowledge(&self, handle: ChannelHandle) -> bool {
        self.send_status(handle, ChannelStatus::Subscribed)
    }

    /// Report a server-side failure on a channel.
    pub fn fail_channel(&self, handle: ChannelHandle, reason: impl Into<String>) -> bool {
        self.send_status(handle, ChannelStatus::Error(reason.into()))
    }

    fn send_status(&self, handle: ChannelHandle, status: ChannelStatus) -> bool {
        self.channels
            .lock()
            .get(&handle)
            .map(|channel| channel.tx.send(FeedMessage::Status(status)).is_ok())
            .unwrap_or(false)
    }

    /// Handles of the open channels for `(scope, table)`.
    pub fn handles_for(&self, scope: &str, table: Table) -> Vec<ChannelHandle> {
        let mut handles: Vec<ChannelHandle> = self
            .channels
            .lock()
            .iter()
            .filter(|(_, channel)| channel.scope == scope && channel.table == table)
            .map(|(handle, _)| *handle)
            .collect();
        handles.sort();
        handles
    }

    pub fn open_channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    /// Channels opened over the feed's lifetime.
    pub fn opened_total(&self) -> u64 {
        self.opened.load(Ordering::SeqCst)
    }

    /// Channels closed over the feed's lifetime.
    pub fn closed_total(&self) -> u64 {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChangeFeed for InMemoryChangeFeed {
    async fn open_channel(
        &self,
        scope: &str,
        table: Table,
        filter: &ChannelFilter,
    ) -> Result<FeedChannel, FeedError> {
        if let Some(delay) = self.open_delay {
            tokio::time::sleep(delay).await;
        }
        let rejection = self.rejected.lock().get(&table).cloned();
        if let Some(reason) = rejection {
            return Err(FeedError::Rejected(reason));
        }

        let handle = ChannelHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        let (tx, messages) = mpsc::unbounded_channel();
        if self.auto_ack {
            let _ = tx.send(FeedMessage::Status(ChannelStatus::Subscribed));
        }

        self.channels.lock().insert(
            handle,
            OpenChannel {
                scope: scope.to_string(),
                table,
                filter: filter.clone(),
                tx,
            },
        );
        self.opened.fetch_add(1, Ordering::SeqCst);

        debug!(handle = %handle, scope, table = %table, filter = %filter, "channel opened");
        Ok(FeedChannel { handle, messages })
    }

    async fn close_channel(&self, handle: ChannelHandle) -> Result<(), FeedError> {
        match self.channels.lock().remove(&handle) {
            Some(_) => {
                self.closed.fetch_add(1, Ordering::SeqCst);
                debug!(handle = %handle, "channel closed");
                Ok(())
            }
            None => Err(FeedError::Closed),
        }
    }
}

/// Data store holding validated rows in memory.
pub struct InMemoryDataStore {
    tables: RwLock<HashMap<Table, Vec<Record>>>,
    next_id: AtomicI64,
    fetch_counts: Mutex<HashMap<Table, u64>>,
    fail_next_fetch: Mutex<Option<StoreError>>,
    fail_next_mutation: Mutex<Option<StoreError>>,
    fetch_delay: Option<Duration>,
    feed: Option<Arc<InMemoryChangeFeed>>,
}

impl InMemoryDataStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            fetch_counts: Mutex::new(HashMap::new()),
            fail_next_fetch: Mutex::new(None),
            fail_next_mutation: Mutex::new(None),
            fetch_delay: None,
            feed: None,
        }
    }

    /// Emit a change on `feed` for every successful mutation.
    pub fn with_feed(mut self, feed: Arc<InMemoryChangeFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    /// Delay every fetch.
    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }

    /// Store a record directly, without emitting a change.
    pub fn seed(&self, record: Record) {
        self.next_id.fetch_max(record.id() + 1, Ordering::SeqCst);
        self.tables
            .write()
            .entry(record.table())
            .or_default()
            .push(record);
    }

    /// Snapshot of every row of a table.
    pub fn records(&self, table: Table) -> Vec<Record> {
        self.tables.read().get(&table).cloned().unwrap_or_default()
    }

    /// Number of fetches served for a table.
    pub fn fetch_count(&self, table: Table) -> u64 {
        self.fetch_counts.lock().get(&table).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> u64 {
        self.fetch_counts.lock().values().sum()
    }

    /// Fail the next fetch with `error`.
    pub fn fail_next_fetch(&self, error: StoreError) {
        *self.fail_next_fetch.lock() = Some(error);
    }

    /// Fail the next mutation with `error`.
    pub fn fail_next_mutation(&self, error: StoreError) {
        *self.fail_next_mutation.lock() = Some(error);
    }

    fn emit(&self, table: Table, event_type: EventType, scope: &str, new: Value, old: Value) {
        if let Some(feed) = &self.feed {
            let event_type = event_type.as_str().to_ascii_uppercase();
            let payload = json!({ "eventType": event_type, "new": new, "old": old });
            feed.emit(scope, table, payload);
        }
    }

    fn insert(&self, table: Table, row: Value) -> Result<MutationOutcome, StoreError> {
        let mut row = into_object(row)?;
        if !row.contains_key("id") {
            row.insert(
                "id".to_string(),
                json!(self.next_id.fetch_add(1, Ordering::SeqCst)),
            );
        }
        let row = Value::Object(row);
        let record = Record::from_row(table, &row)?;

        {
            let mut tables = self.tables.write();
            let rows = tables.entry(table).or_default();
            if rows.iter().any(|existing| existing.id() == record.id()) {
                return Err(StoreError::ConstraintViolation(format!(
                    "duplicate id {} in {table}",
                    record.id()
                )));
            }
            rows.push(record.clone());
        }
        self.next_id.fetch_max(record.id() + 1, Ordering::SeqCst);

        self.emit(table, EventType::Insert, record.family_id(), record.to_row()?, json!({}));
        Ok(MutationOutcome {
            affected: 1,
            record: Some(record),
        })
    }

    fn update(&self, table: Table, id: i64, changes: Value) -> Result<MutationOutcome, StoreError> {
        let changes = into_object(changes)?;
        if let Some(new_id) = changes.get("id") {
            if new_id.as_i64() != Some(id) {
                return Err(StoreError::ConstraintViolation("id is immutable".to_string()));
            }
        }

        let (old, new) = {
            let mut tables = self.tables.write();
            let rows = tables.entry(table).or_default();
            let slot = rows
                .iter_mut()
                .find(|record| record.id() == id)
                .ok_or_else(|| StoreError::NotFound(format!("{table} row {id}")))?;

            let old_row = slot.to_row()?;
            let mut merged = into_object(old_row.clone())?;
            merged.extend(changes);
            let record = Record::from_row(table, &Value::Object(merged))?;
            *slot = record.clone();
            (old_row, record)
        };

        self.emit(table, EventType::Update, new.family_id(), new.to_row()?, old);
        Ok(MutationOutcome {
            affected: 1,
            record: Some(new),
        })
    }

    fn delete(&self, table: Table, id: i64) -> Result<MutationOutcome, StoreError> {
        let removed = {
            let mut tables = self.tables.write();
            let rows = tables.entry(table).or_default();
            let position = rows
                .iter()
                .position(|record| record.id() == id)
                .ok_or_else(|| StoreError::NotFound(format!("{table} row {id}")))?;
            rows.remove(position)
        };

        self.emit(table, EventType::Delete, removed.family_id(), json!({}), removed.to_row()?);
        Ok(MutationOutcome {
            affected: 1,
            record: Some(removed),
        })
    }
}

impl Default for InMemoryDataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataStore for InMemoryDataStore {
    async fn fetch(
        &self,
        table: Table,
        scope: &str,
        params: Option<&str>,
    ) -> Result<Vec<Record>, StoreError> {
        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }
        *self.fetch_counts.lock().entry(table).or_insert(0) += 1;
        let failure = self.fail_next_fetch.lock().take();
        if let Some(error) = failure {
            return Err(error);
        }

        let rows = self.records(table);
        let mut matched = Vec::new();
        for record in rows.into_iter().filter(|r| r.family_id() == scope) {
            if let Some(params) = params {
                if !matches_params(&record, params)? {
                    continue;
                }
            }
            matched.push(record);
        }

        trace!(table = %table, scope, rows = matched.len(), "fetch served");
        Ok(matched)
    }

    async fn mutate(&self, table: Table, mutation: Mutation) -> Result<MutationOutcome, StoreError> {
        let failure = self.fail_next_mutation.lock().take();
        if let Some(error) = failure {
            return Err(error);
        }

        debug!(table = %table, operation = mutation.operation(), "applying mutation");
        match mutation {
            Mutation::Insert { row } => self.insert(table, row),
            Mutation::Update { id, changes } => self.update(table, id, changes),
            Mutation::Delete { id } => self.delete(table, id),
        }
    }
}

fn into_object(value: Value) -> Result<Map<String, Value>, StoreError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::ConstraintViolation(format!(
            "expected a JSON object, got {other}"
        ))),
    }
}

/// Evaluate `column=value` pairs joined by `&` against a record.
fn matches_params(record: &Record, params: &str) -> Result<bool, StoreError> {
    let row = record.to_row()?;
    for pair in params.split('&').filter(|pair| !pair.is_empty()) {
        let (column, expected) = pair
            .split_once('=')
            .ok_or_else(|| StoreError::Transport(format!("malformed filter '{pair}'")))?;

        let matched = match row.get(column) {
            Some(Value::String(actual)) => actual == expected,
            Some(Value::Null) | None => expected == "null",
            Some(actual) => actual.to_string() == expected,
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}
