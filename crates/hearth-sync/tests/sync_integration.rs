//! End-to-end tests of the sync layer over the in-memory collaborators.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

use hearth_proto::{Chore, ChoreStatus, Member, MemberRole, Record, RecordSet, Table};
use hearth_sync::{
    ChangeFeed, DataStore, InMemoryChangeFeed, InMemoryDataStore, Mutation, SubscriptionRegistry,
    SubscriptionState, SyncConfig, SyncFacade,
};

struct TestContext {
    store: Arc<InMemoryDataStore>,
    feed: Arc<InMemoryChangeFeed>,
    sync: SyncFacade,
}

impl TestContext {
    fn new() -> Self {
        Self::with_config(SyncConfig::default())
    }

    fn with_config(config: SyncConfig) -> Self {
        Self::build(config, InMemoryChangeFeed::new())
    }

    fn build(config: SyncConfig, feed: InMemoryChangeFeed) -> Self {
        let feed = Arc::new(feed);
        let store = Arc::new(InMemoryDataStore::new().with_feed(feed.clone()));
        seed(&store);
        let sync = SyncFacade::new(config, store.clone(), feed.clone());
        Self { store, feed, sync }
    }
}

fn seed(store: &InMemoryDataStore) {
    for (id, family, name, role) in [
        (1, "fam1", "Ada", MemberRole::Parent),
        (2, "fam1", "Finn", MemberRole::Child),
        (3, "fam2", "Gus", MemberRole::Parent),
    ] {
        store.seed(Record::Member(Member {
            id,
            family_id: family.to_string(),
            name: name.to_string(),
            role,
            points: 0,
        }));
    }
    for (id, family, title) in [(10, "fam1", "Dishes"), (11, "fam1", "Trash"), (12, "fam2", "Lawn")] {
        store.seed(Record::Chore(Chore {
            id,
            family_id: family.to_string(),
            title: title.to_string(),
            assigned_to: None,
            points: 5,
            status: ChoreStatus::Open,
            due_date: None,
        }));
    }
}

fn refresh_channel(sync: &SyncFacade, table: Table) -> mpsc::UnboundedReceiver<(String, RecordSet)> {
    let (tx, rx) = mpsc::unbounded_channel();
    sync.subscribe(table, move |scope, rows| {
        let _ = tx.send((scope.to_string(), Arc::clone(rows)));
    });
    rx
}

async fn next_refresh(
    rx: &mut mpsc::UnboundedReceiver<(String, RecordSet)>,
) -> (String, RecordSet) {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("refresh timed out")
        .expect("refresh channel closed")
}

fn chore_status(rows: &RecordSet, id: i64) -> Option<ChoreStatus> {
    rows.iter().find_map(|record| match record {
        Record::Chore(chore) if chore.id == id => Some(chore.status),
        _ => None,
    })
}

#[tokio::test]
async fn test_read_within_ttl_fetches_once() {
    let ctx = TestContext::new();

    let first = ctx.sync.read_table("fam1", Table::Chores).await.unwrap();
    let second = ctx.sync.read_table("fam1", Table::Chores).await.unwrap();

    assert_eq!(first.len(), 2);
    assert_eq!(first, second);
    assert_eq!(ctx.store.fetch_count(Table::Chores), 1);
}

#[tokio::test]
async fn test_custom_fetcher_is_cached_by_kind() {
    let ctx = TestContext::new();
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let calls = calls.clone();
        let rows = ctx
            .sync
            .read("fam1", "leaderboard", Some("top=3"), || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Vec::new())
            })
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_entry_expires_after_kind_ttl() {
    let ctx = TestContext::new();

    ctx.sync.read_table("fam1", Table::Chores).await.unwrap();
    tokio::time::advance(Duration::from_secs(59)).await;
    ctx.sync.read_table("fam1", Table::Chores).await.unwrap();
    assert_eq!(ctx.store.fetch_count(Table::Chores), 1);

    tokio::time::advance(Duration::from_secs(2)).await;
    ctx.sync.read_table("fam1", Table::Chores).await.unwrap();

    let stats = ctx.sync.get_stats();
    assert_eq!(ctx.store.fetch_count(Table::Chores), 2);
    assert_eq!(stats.misses, 2);
    assert_eq!(stats.expirations, 1);
}

#[tokio::test]
async fn test_capacity_evicts_earliest_insert() {
    let ctx = TestContext::with_config(SyncConfig::default().with_max_cache_entries(2));

    ctx.sync.read_table("fam1", Table::Members).await.unwrap();
    ctx.sync.read_table("fam1", Table::Chores).await.unwrap();
    ctx.sync.read_table("fam2", Table::Members).await.unwrap();

    let stats = ctx.sync.get_stats();
    assert_eq!(stats.evictions, 1);
    assert_eq!(stats.size, 2);

    ctx.sync.read_table("fam1", Table::Chores).await.unwrap();
    assert_eq!(ctx.store.fetch_count(Table::Chores), 1);
    ctx.sync.read_table("fam1", Table::Members).await.unwrap();
    assert_eq!(ctx.store.fetch_count(Table::Members), 3);
}

#[tokio::test]
async fn test_hit_rate_after_three_hits_two_misses() {
    let ctx = TestContext::new();

    ctx.sync.read_table("fam1", Table::Members).await.unwrap();
    ctx.sync.read_table("fam1", Table::Members).await.unwrap();
    ctx.sync.read_table("fam1", Table::Members).await.unwrap();
    ctx.sync.read_table("fam1", Table::Chores).await.unwrap();
    ctx.sync.read_table("fam1", Table::Chores).await.unwrap();

    let stats = ctx.sync.get_stats();
    assert_eq!((stats.hits, stats.misses), (3, 2));
    assert_eq!(stats.hit_rate_percent(), "60.0%");
}

#[tokio::test]
async fn test_change_event_refreshes_table_once() {
    let ctx = TestContext::new();
    let mut refreshes = refresh_channel(&ctx.sync, Table::Chores);

    let summary = ctx.sync.attach("fam1", &Table::ALL).await;
    assert!(summary.is_complete());
    let before = ctx.sync.read_table("fam1", Table::Chores).await.unwrap();
    assert_eq!(chore_status(&before, 10), Some(ChoreStatus::Open));

    // Written behind the facade's back: only the change feed tells us.
    ctx.store
        .mutate(Table::Chores, Mutation::update(10, json!({ "status": "done" })))
        .await
        .unwrap();

    let (scope, rows) = next_refresh(&mut refreshes).await;
    assert_eq!(scope, "fam1");
    assert_eq!(chore_status(&rows, 10), Some(ChoreStatus::Done));
    assert_eq!(ctx.store.fetch_count(Table::Chores), 2);

    let cached = ctx.sync.read_table("fam1", Table::Chores).await.unwrap();
    assert_eq!(chore_status(&cached, 10), Some(ChoreStatus::Done));
    assert_eq!(ctx.store.fetch_count(Table::Chores), 2);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(refreshes.try_recv().is_err());
}

#[tokio::test]
async fn test_refreshes_follow_event_order() {
    let ctx = TestContext::new();
    let mut refreshes = refresh_channel(&ctx.sync, Table::Chores);
    ctx.sync.attach("fam1", &[Table::Chores]).await;

    for status in ["done", "approved", "open"] {
        ctx.store
            .mutate(Table::Chores, Mutation::update(11, json!({ "status": status })))
            .await
            .unwrap();
    }

    let mut last = None;
    for _ in 0..3 {
        last = Some(next_refresh(&mut refreshes).await.1);
    }
    assert_eq!(chore_status(&last.unwrap(), 11), Some(ChoreStatus::Open));
}

#[tokio::test]
async fn test_changes_of_other_scopes_are_ignored() {
    let ctx = TestContext::new();
    let mut refreshes = refresh_channel(&ctx.sync, Table::Chores);
    ctx.sync.attach("fam1", &[Table::Chores]).await;

    ctx.store
        .mutate(Table::Chores, Mutation::update(12, json!({ "points": 9 })))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(refreshes.try_recv().is_err());
    assert_eq!(ctx.store.fetch_count(Table::Chores), 0);
}

#[tokio::test]
async fn test_slow_read_keeps_refreshed_snapshot() {
    let ctx = TestContext::new();
    let mut refreshes = refresh_channel(&ctx.sync, Table::Chores);
    ctx.sync.attach("fam1", &[Table::Chores]).await;

    let (fetched_tx, fetched_rx) = oneshot::channel();
    let store = ctx.store.clone();
    let slow_read = ctx.sync.read("fam1", "chores", None, || async move {
        let rows = store.fetch(Table::Chores, "fam1", None).await;
        let _ = fetched_tx.send(());
        tokio::time::sleep(Duration::from_millis(200)).await;
        rows
    });

    let change = async {
        fetched_rx.await.unwrap();
        ctx.store
            .mutate(Table::Chores, Mutation::update(10, json!({ "status": "done" })))
            .await
            .unwrap();
        next_refresh(&mut refreshes).await
    };

    let (stale, (_, refreshed)) = tokio::join!(slow_read, change);
    assert_eq!(chore_status(&stale.unwrap(), 10), Some(ChoreStatus::Open));
    assert_eq!(chore_status(&refreshed, 10), Some(ChoreStatus::Done));

    let cached = ctx.sync.read_table("fam1", Table::Chores).await.unwrap();
    assert_eq!(chore_status(&cached, 10), Some(ChoreStatus::Done));
}

#[tokio::test]
async fn test_events_reach_bus() {
    let ctx = TestContext::new();
    let mut events = ctx.sync.bus().subscribe(Table::Members);
    ctx.sync.attach("fam1", &[Table::Members]).await;

    ctx.sync
        .mutate(
            "fam1",
            Table::Members,
            Mutation::insert(json!({ "family_id": "fam1", "name": "Ivy", "role": "child" })),
        )
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.scope, "fam1");
    assert_eq!(event.table, Table::Members);
    assert!(event.new_record.is_some());
}

#[tokio::test]
async fn test_attach_twice_opens_one_channel_per_table() {
    let ctx = TestContext::new();

    let first = ctx.sync.attach("fam1", &[Table::Chores, Table::Members]).await;
    let second = ctx.sync.attach("fam1", &[Table::Chores, Table::Members]).await;

    assert_eq!(first.opened.len(), 2);
    assert_eq!(second.already_subscribed.len(), 2);
    assert_eq!(ctx.feed.opened_total(), 2);
    assert_eq!(ctx.feed.handles_for("fam1", Table::Chores).len(), 1);
}

#[tokio::test]
async fn test_detach_during_attach_leaves_nothing_open() {
    let feed = InMemoryChangeFeed::new().with_open_delay(Duration::from_millis(100));
    let ctx = Arc::new(TestContext::build(SyncConfig::default(), feed));

    let attaching = {
        let ctx = ctx.clone();
        tokio::spawn(async move { ctx.sync.attach("fam1", &Table::ALL).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    ctx.sync.detach("fam1").await;

    let summary = attaching.await.unwrap();
    assert_eq!(summary.cancelled.len(), Table::ALL.len());
    assert!(!ctx.sync.coordinator().is_attached("fam1"));
    assert_eq!(ctx.sync.coordinator().registry().subscription_count(), 0);
    assert_eq!(ctx.feed.open_channel_count(), 0);
    assert_eq!(ctx.feed.closed_total(), Table::ALL.len() as u64);
}

#[tokio::test]
async fn test_detach_drops_scope_cache_only() {
    let ctx = TestContext::new();
    ctx.sync.attach("fam1", &Table::ALL).await;
    ctx.sync.read_table("fam1", Table::Members).await.unwrap();
    ctx.sync.read_table("fam2", Table::Members).await.unwrap();

    ctx.sync.detach("fam1").await;

    assert_eq!(ctx.sync.get_stats().size, 1);
    assert_eq!(ctx.feed.open_channel_count(), 0);
    ctx.sync.read_table("fam2", Table::Members).await.unwrap();
    assert_eq!(ctx.store.fetch_count(Table::Members), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unsubscribe_waits_for_in_flight_delivery() {
    let feed = Arc::new(InMemoryChangeFeed::new());
    let registry = SubscriptionRegistry::new(feed.clone() as Arc<dyn ChangeFeed>);

    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let unsubscribed = Arc::new(AtomicBool::new(false));
    let calls = Arc::new(AtomicUsize::new(0));
    let late_calls = Arc::new(AtomicUsize::new(0));

    let handler = {
        let unsubscribed = unsubscribed.clone();
        let calls = calls.clone();
        let late_calls = late_calls.clone();
        Arc::new(move |_: &str, _: Table, _: &Value| {
            if unsubscribed.load(Ordering::SeqCst) {
                late_calls.fetch_add(1, Ordering::SeqCst);
            }
            let _ = started_tx.send(());
            std::thread::sleep(Duration::from_millis(100));
            calls.fetch_add(1, Ordering::SeqCst);
        })
    };
    registry.subscribe("fam1", Table::Chores, handler).await.unwrap();

    let payload = json!({ "eventType": "DELETE", "old": { "id": 10 } });
    feed.emit("fam1", Table::Chores, payload.clone());
    started_rx.recv().await.unwrap();

    registry.unsubscribe("fam1", Table::Chores).await;
    unsubscribed.store(true, Ordering::SeqCst);

    // The in-flight call finished before unsubscribe returned.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(registry.state("fam1", Table::Chores), SubscriptionState::Unsubscribed);

    assert_eq!(feed.emit("fam1", Table::Chores, payload), 0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(late_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_facade_mutation_failure_keeps_cache() {
    let ctx = TestContext::new();
    ctx.sync.read_table("fam1", Table::Chores).await.unwrap();

    let err = ctx
        .sync
        .mutate("fam1", Table::Chores, Mutation::delete(999))
        .await
        .unwrap_err();

    assert_eq!(err.store_kind(), Some(hearth_sync::StoreErrorKind::NotFound));
    assert_eq!(ctx.sync.get_stats().size, 1);
}
