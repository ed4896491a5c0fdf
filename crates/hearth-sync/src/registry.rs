//! Subscription registry.
//!
//! Owns at most one change feed channel per `(scope, table)`. Each open
//! channel is drained by a pump task that forwards change payloads to the
//! subscription's handler through its [`DeliveryGate`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use hearth_proto::Table;

use crate::error::Error;
use crate::feed::{ChangeFeed, ChannelFilter, ChannelHandle, ChannelStatus, FeedChannel, FeedMessage};
use crate::subscription::{
    DeliveryGate, EventHandler, SubscribeOutcome, SubscriptionInfo, SubscriptionSlot,
    SubscriptionState,
};

type SlotKey = (String, Table);

struct RegistryInner {
    slots: Mutex<HashMap<SlotKey, SubscriptionSlot>>,
    next_id: AtomicU64,
}

impl RegistryInner {
    /// Remove the slot only if it still belongs to subscription `id`.
    fn remove_if_current(&self, key: &SlotKey, id: u64) -> Option<SubscriptionSlot> {
        let mut slots = self.slots.lock();
        match slots.get(key) {
            Some(slot) if slot.id == id => slots.remove(key),
            _ => None,
        }
    }

    fn mark_active(&self, key: &SlotKey, id: u64) -> bool {
        let mut slots = self.slots.lock();
        match slots.get_mut(key) {
            Some(slot) if slot.id == id => {
                slot.state = SubscriptionState::Active;
                true
            }
            _ => false,
        }
    }
}

/// Tracks change feed subscriptions per `(scope, table)`.
pub struct SubscriptionRegistry {
    feed: Arc<dyn ChangeFeed>,
    inner: Arc<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new(feed: Arc<dyn ChangeFeed>) -> Self {
        Self {
            feed,
            inner: Arc::new(RegistryInner {
                slots: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Subscribe `on_event` to changes of `table` within `scope`.
    ///
    /// Idempotent: a pending or active subscription is left untouched.
    pub async fn subscribe(
        &self,
        scope: &str,
        table: Table,
        on_event: EventHandler,
    ) -> Result<SubscribeOutcome, Error> {
        let key: SlotKey = (scope.to_string(), table);

        let (id, gate) = {
            let mut slots = self.inner.slots.lock();
            if slots.contains_key(&key) {
                debug!(scope, table = %table, "already subscribed");
                return Ok(SubscribeOutcome::AlreadySubscribed);
            }
            let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
            let gate = Arc::new(DeliveryGate::new());
            slots.insert(key.clone(), SubscriptionSlot::pending(id, Arc::clone(&gate)));
            (id, gate)
        };
        debug!(subscription_id = id, scope, table = %table, "subscription pending");

        let filter = ChannelFilter::for_scope(scope);
        let FeedChannel { handle, messages } =
            match self.feed.open_channel(scope, table, &filter).await {
                Ok(channel) => channel,
                Err(e) => {
                    self.inner.remove_if_current(&key, id);
                    warn!(scope, table = %table, filter = %filter, error = %e, "failed to open change channel");
                    return Err(Error::Subscription {
                        scope: scope.to_string(),
                        table,
                        reason: e.to_string(),
                    });
                }
            };

        let attached = {
            let mut slots = self.inner.slots.lock();
            match slots.get_mut(&key) {
                Some(slot) if slot.id == id => {
                    slot.handle = Some(handle);
                    slot.pump = Some(tokio::spawn(pump(
                        Arc::clone(&self.inner),
                        Arc::clone(&self.feed),
                        key.clone(),
                        id,
                        handle,
                        gate,
                        messages,
                        on_event,
                    )));
                    true
                }
                _ => false,
            }
        };

        if !attached {
            debug!(subscription_id = id, scope, table = %table, "subscription cancelled while opening");
            release(self.feed.as_ref(), handle).await;
            return Ok(SubscribeOutcome::Cancelled);
        }

        debug!(subscription_id = id, scope, table = %table, handle = %handle, "change channel opened");
        Ok(SubscribeOutcome::Opened)
    }

    /// Tear down the subscription for `(scope, table)`, if any.
    ///
    /// When this returns, the handler is not running and will not be called again.
    pub async fn unsubscribe(&self, scope: &str, table: Table) -> bool {
        let slot = self.inner.slots.lock().remove(&(scope.to_string(), table));
        match slot {
            Some(slot) => {
                self.teardown(scope, table, slot).await;
                true
            }
            None => false,
        }
    }

    /// Tear down every subscription of `scope`, including pending ones.
    ///
    /// Returns the number of subscriptions removed.
    pub async fn unsubscribe_all(&self, scope: &str) -> usize {
        let removed: Vec<(Table, SubscriptionSlot)> = {
            let mut slots = self.inner.slots.lock();
            let keys: Vec<SlotKey> = slots
                .keys()
                .filter(|(slot_scope, _)| slot_scope == scope)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| slots.remove(&key).map(|slot| (key.1, slot)))
                .collect()
        };

        let count = removed.len();
        join_all(
            removed
                .into_iter()
                .map(|(table, slot)| self.teardown(scope, table, slot)),
        )
        .await;
        count
    }

    async fn teardown(&self, scope: &str, table: Table, slot: SubscriptionSlot) {
        slot.gate.close();
        if let Some(pump) = slot.pump {
            pump.abort();
        }
        if let Some(handle) = slot.handle {
            release(self.feed.as_ref(), handle).await;
        }

        debug!(
            subscription_id = slot.id,
            scope,
            table = %table,
            events_delivered = slot.gate.delivered(),
            "subscription removed"
        );
    }

    pub fn state(&self, scope: &str, table: Table) -> SubscriptionState {
        self.inner
            .slots
            .lock()
            .get(&(scope.to_string(), table))
            .map(|slot| slot.state)
            .unwrap_or(SubscriptionState::Unsubscribed)
    }

    pub fn subscriptions_for_scope(&self, scope: &str) -> Vec<SubscriptionInfo> {
        let slots = self.inner.slots.lock();
        let mut infos: Vec<SubscriptionInfo> = slots
            .iter()
            .filter(|((slot_scope, _), _)| slot_scope == scope)
            .map(|((slot_scope, table), slot)| slot.info(slot_scope, *table))
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.slots.lock().len()
    }
}

/// Dropping the registry stops every pump and hands the open channels to a
/// background task that closes them. Outside a runtime the channels are left
/// to the feed; call [`unsubscribe_all`](SubscriptionRegistry::unsubscribe_all)
/// first to close them deterministically.
impl Drop for SubscriptionRegistry {
    fn drop(&mut self) {
        let slots: Vec<SubscriptionSlot> = self
            .inner
            .slots
            .lock()
            .drain()
            .map(|(_, slot)| slot)
            .collect();

        // Gates are not closed here: the drop may run inside a delivery that
        // holds its gate's read side.
        let mut handles = Vec::new();
        for slot in slots {
            if let Some(pump) = slot.pump {
                pump.abort();
            }
            handles.extend(slot.handle);
        }
        if handles.is_empty() {
            return;
        }

        match Handle::try_current() {
            Ok(runtime) => {
                let feed = Arc::clone(&self.feed);
                runtime.spawn(async move {
                    for handle in handles {
                        release(feed.as_ref(), handle).await;
                    }
                });
            }
            Err(_) => {
                warn!(
                    channels = handles.len(),
                    "registry dropped outside a runtime, change channels left open"
                );
            }
        }
    }
}

async fn release(feed: &dyn ChangeFeed, handle: ChannelHandle) {
    if let Err(e) = feed.close_channel(handle).await {
        warn!(handle = %handle, error = %e, "failed to close change channel");
    }
}

/// Drain a channel until it ends, fails, or the pump is aborted.
#[allow(clippy::too_many_arguments)]
async fn pump(
    inner: Arc<RegistryInner>,
    feed: Arc<dyn ChangeFeed>,
    key: SlotKey,
    id: u64,
    handle: ChannelHandle,
    gate: Arc<DeliveryGate>,
    mut messages: mpsc::UnboundedReceiver<FeedMessage>,
    on_event: EventHandler,
) {
    let (scope, table) = (key.0.as_str(), key.1);

    while let Some(message) = messages.recv().await {
        match message {
            FeedMessage::Status(ChannelStatus::Subscribed) => {
                if inner.mark_active(&key, id) {
                    debug!(subscription_id = id, scope, table = %table, "subscription active");
                }
            }
            FeedMessage::Status(ChannelStatus::Error(reason)) => {
                warn!(subscription_id = id, scope, table = %table, reason = %reason, "change channel failed");
                if inner.remove_if_current(&key, id).is_some() {
                    gate.close();
                    release(feed.as_ref(), handle).await;
                }
                return;
            }
            FeedMessage::Status(ChannelStatus::Closed) => {
                debug!(subscription_id = id, scope, table = %table, "change channel closed by feed");
                if inner.remove_if_current(&key, id).is_some() {
                    gate.close();
                }
                return;
            }
            FeedMessage::Change(payload) => {
                gate.deliver(|| on_event(scope, table, &payload));
            }
        }
    }

    debug!(subscription_id = id, scope, table = %table, "change channel ended");
    if inner.remove_if_current(&key, id).is_some() {
        gate.close();
    }
}
