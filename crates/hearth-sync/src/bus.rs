//! In-process event bus.
//!
//! One broadcast topic per table. Publishing without receivers is not an
//! error; receivers that fall more than the topic capacity behind observe
//! `RecvError::Lagged` and skip ahead.

use std::sync::Arc;

use dashmap::DashMap;
use hearth_proto::{ChangeEvent, Table};
use tokio::sync::broadcast;

use crate::config::DEFAULT_BUS_CAPACITY;

/// Topic-per-table broadcast of normalized change events.
pub struct EventBus {
    topics: DashMap<Table, broadcast::Sender<Arc<ChangeEvent>>>,
    capacity: usize,
}

impl EventBus {
    /// Create a bus whose topics buffer `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Receive every event published for `table` from now on.
    pub fn subscribe(&self, table: Table) -> broadcast::Receiver<Arc<ChangeEvent>> {
        self.topics
            .entry(table)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publish an event on its table's topic.
    ///
    /// Returns the number of receivers reached.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        let table = event.table;
        let reached = match self.topics.get(&table) {
            Some(sender) => sender.send(Arc::new(event)).unwrap_or(0),
            None => 0,
        };
        tracing::trace!(table = %table, receivers = reached, "event published");
        reached
    }

    /// Number of live receivers on a topic.
    pub fn receiver_count(&self, table: Table) -> usize {
        self.topics
            .get(&table)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}
