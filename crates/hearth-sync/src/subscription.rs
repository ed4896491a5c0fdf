//! Subscription state and delivery gating.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hearth_proto::Table;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::feed::ChannelHandle;

/// Callback receiving raw change payloads for a `(scope, table)`.
pub type EventHandler = Arc<dyn Fn(&str, Table, &Value) + Send + Sync>;

/// Lifecycle of a `(scope, table)` subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    /// Channel requested, not yet acknowledged by the feed.
    Pending,
    /// Acknowledged and delivering.
    Active,
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubscriptionState::Unsubscribed => "unsubscribed",
            SubscriptionState::Pending => "pending",
            SubscriptionState::Active => "active",
        };
        f.write_str(name)
    }
}

/// Result of a subscribe call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// A new channel was opened.
    Opened,
    /// A pending or active subscription already existed; the feed was not touched.
    AlreadySubscribed,
    /// The subscription was torn down while its channel was opening.
    Cancelled,
}

/// Snapshot of one subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionInfo {
    pub id: u64,
    pub scope: String,
    pub table: Table,
    pub state: SubscriptionState,
    pub handle: Option<ChannelHandle>,
    pub created_at: Instant,
    pub events_delivered: u64,
}

/// Guards handler invocations of one subscription.
///
/// Deliveries hold the read side for the duration of the handler call.
/// Closing takes the write side, so it waits for an in-flight delivery and
/// no delivery starts afterwards.
#[derive(Debug)]
pub(crate) struct DeliveryGate {
    open: RwLock<bool>,
    delivered: AtomicU64,
}

impl DeliveryGate {
    pub(crate) fn new() -> Self {
        Self {
            open: RwLock::new(true),
            delivered: AtomicU64::new(0),
        }
    }

    /// Run `deliver` if the gate is still open.
    pub(crate) fn deliver(&self, deliver: impl FnOnce()) -> bool {
        let open = self.open.read();
        if !*open {
            return false;
        }
        deliver();
        self.delivered.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub(crate) fn close(&self) {
        *self.open.write() = false;
    }

    pub(crate) fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

/// Registry slot for a `(scope, table)` pair.
pub(crate) struct SubscriptionSlot {
    pub(crate) id: u64,
    pub(crate) state: SubscriptionState,
    pub(crate) handle: Option<ChannelHandle>,
    pub(crate) pump: Option<JoinHandle<()>>,
    pub(crate) gate: Arc<DeliveryGate>,
    pub(crate) created_at: Instant,
}

impl SubscriptionSlot {
    pub(crate) fn pending(id: u64, gate: Arc<DeliveryGate>) -> Self {
        Self {
            id,
            state: SubscriptionState::Pending,
            handle: None,
            pump: None,
            gate,
            created_at: Instant::now(),
        }
    }

    pub(crate) fn info(&self, scope: &str, table: Table) -> SubscriptionInfo {
        SubscriptionInfo {
            id: self.id,
            scope: scope.to_string(),
            table,
            state: self.state,
            handle: self.handle,
            created_at: self.created_at,
            events_delivered: self.gate.delivered(),
        }
    }
}
