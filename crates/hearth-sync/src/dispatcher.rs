//! Change dispatcher.
//!
//! Normalizes raw feed payloads into [`ChangeEvent`]s and fans them out to
//! the listeners registered for the event's table, then to the event bus.
//! Listeners run outside every lock, so a listener may register or remove
//! listeners while it is being called.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

use hearth_proto::{ChangeEvent, RawChange, Record, Table};

use crate::bus::EventBus;
use crate::error::ListenerError;

/// Identifier returned when registering a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Receiver of normalized change events for one table.
pub trait ChangeListener: Send + Sync {
    fn on_change(&self, event: &ChangeEvent) -> Result<(), ListenerError>;
}

impl<F> ChangeListener for F
where
    F: Fn(&ChangeEvent) -> Result<(), ListenerError> + Send + Sync,
{
    fn on_change(&self, event: &ChangeEvent) -> Result<(), ListenerError> {
        self(event)
    }
}

/// Counts from one dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Listeners that returned `Ok`.
    pub delivered: usize,
    /// Listeners that returned an error or panicked.
    pub failed: usize,
    /// Bus receivers reached.
    pub broadcast: usize,
}

type ListenerList = Vec<(ListenerId, Arc<dyn ChangeListener>)>;

/// Fans change events out to table listeners and the event bus.
pub struct ChangeDispatcher {
    listeners: RwLock<HashMap<Table, ListenerList>>,
    next_id: AtomicU64,
    bus: Arc<EventBus>,
}

impl ChangeDispatcher {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            bus,
        }
    }

    /// Register a listener for a table. Listeners run in registration order.
    pub fn add_listener(&self, table: Table, listener: Arc<dyn ChangeListener>) -> ListenerId {
        let id = ListenerId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.listeners
            .write()
            .entry(table)
            .or_default()
            .push((id, listener));

        debug!(listener_id = id.0, table = %table, "change listener added");
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let mut removed = false;
        listeners.retain(|_, list| {
            let before = list.len();
            list.retain(|(listener_id, _)| *listener_id != id);
            removed |= list.len() != before;
            !list.is_empty()
        });

        if removed {
            debug!(listener_id = id.0, "change listener removed");
        }
        removed
    }

    pub fn listener_count(&self, table: Table) -> usize {
        self.listeners
            .read()
            .get(&table)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// The bus events are broadcast on.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Normalize a raw feed payload and dispatch it.
    ///
    /// Returns `None` when the table or payload cannot be interpreted; the
    /// event is dropped with a warning.
    pub fn on_raw_event(&self, scope: &str, table: &str, payload: &Value) -> Option<DispatchReport> {
        match normalize(scope, table, payload) {
            Ok(event) => Some(self.dispatch(&event)),
            Err(e) => {
                warn!(scope, table, error = %e, "dropping malformed change event");
                None
            }
        }
    }

    /// Dispatch a normalized event to the table's listeners, then broadcast it.
    pub fn dispatch(&self, event: &ChangeEvent) -> DispatchReport {
        let listeners: ListenerList = self
            .listeners
            .read()
            .get(&event.table)
            .cloned()
            .unwrap_or_default();

        let mut report = DispatchReport::default();
        for (id, listener) in listeners {
            match panic::catch_unwind(AssertUnwindSafe(|| listener.on_change(event))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!(
                        listener_id = id.0,
                        scope = %event.scope,
                        table = %event.table,
                        error = %e,
                        "change listener failed"
                    );
                }
                Err(_) => {
                    report.failed += 1;
                    warn!(
                        listener_id = id.0,
                        scope = %event.scope,
                        table = %event.table,
                        "change listener panicked"
                    );
                }
            }
        }

        report.broadcast = self.broadcast(event);
        debug!(
            scope = %event.scope,
            table = %event.table,
            event_type = %event.event_type,
            delivered = report.delivered,
            failed = report.failed,
            "change event dispatched"
        );
        report
    }

    /// Publish on the bus. Having no receivers is not an error.
    pub fn broadcast(&self, event: &ChangeEvent) -> usize {
        self.bus.publish(event.clone())
    }
}

/// Build a [`ChangeEvent`] from a raw payload.
///
/// Images that fail validation become `None`. Old images are commonly partial
/// (only the primary key), so their failures are only logged at `debug`.
pub fn normalize(scope: &str, table: &str, payload: &Value) -> Result<ChangeEvent, hearth_proto::Error> {
    let table: Table = table.parse()?;
    let raw = RawChange::parse(payload)?;

    let mut event = ChangeEvent::new(scope, table, raw.event_type);
    if let Some(row) = raw.new {
        match Record::from_row(table, &row) {
            Ok(record) => event = event.with_new(record),
            Err(e) => warn!(scope, table = %table, error = %e, "ignoring invalid new row"),
        }
    }
    if let Some(row) = raw.old {
        match Record::from_row(table, &row) {
            Ok(record) => event = event.with_old(record),
            Err(e) => debug!(scope, table = %table, error = %e, "ignoring partial old row"),
        }
    }
    Ok(event)
}
