//! Scripted sync session.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};

use hearth_core::CacheStats;
use hearth_proto::{
    Chore, ChoreStatus, Completion, Member, MemberRole, Record, Reward, Table,
};
use hearth_sync::{InMemoryChangeFeed, InMemoryDataStore, Mutation, SyncConfig, SyncFacade};

/// How long to wait for the refresh triggered by the session's write.
const REFRESH_TIMEOUT: Duration = Duration::from_secs(2);

/// Rows read for one table.
#[derive(Debug, Clone, Serialize)]
pub struct TableReport {
    pub table: Table,
    pub rows: usize,
    pub ttl_secs: u64,
}

/// Outcome of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub family: String,
    pub subscribed: usize,
    pub failed_subscriptions: usize,
    pub tables: Vec<TableReport>,
    /// Whether the chore update came back through the change feed.
    pub refreshed: bool,
    pub stats: CacheStats,
}

/// Seed the in-memory store with a small household.
pub fn seed_family(store: &InMemoryDataStore, family: &str) {
    let family_id = family.to_string();

    for (id, name, role, points) in [
        (1, "Robin", MemberRole::Parent, 0),
        (2, "Sam", MemberRole::Child, 40),
        (3, "Alex", MemberRole::Child, 25),
    ] {
        store.seed(Record::Member(Member {
            id,
            family_id: family_id.clone(),
            name: name.to_string(),
            role,
            points,
        }));
    }

    for (id, title, assigned_to, points) in [
        (10, "Empty the dishwasher", Some(2), 10),
        (11, "Take out the recycling", Some(3), 5),
        (12, "Water the plants", None, 5),
    ] {
        store.seed(Record::Chore(Chore {
            id,
            family_id: family_id.clone(),
            title: title.to_string(),
            assigned_to,
            points,
            status: ChoreStatus::Open,
            due_date: NaiveDate::from_ymd_opt(2024, 3, 1),
        }));
    }

    store.seed(Record::Reward(Reward {
        id: 20,
        family_id: family_id.clone(),
        title: "Extra screen time".to_string(),
        cost: 30,
    }));

    store.seed(Record::Completion(Completion {
        id: 30,
        family_id,
        chore_id: 11,
        member_id: 3,
        completed_at: Utc::now(),
    }));
}

/// Attach `family`, read every table twice, complete a chore and detach.
pub async fn run(family: &str, config: SyncConfig) -> Result<SessionReport, hearth_sync::Error> {
    let feed = Arc::new(InMemoryChangeFeed::new());
    let store = Arc::new(InMemoryDataStore::new().with_feed(feed.clone()));
    seed_family(&store, family);

    let sync = SyncFacade::new(config, store, feed);

    let (refresh_tx, mut refresh_rx) = mpsc::unbounded_channel();
    sync.subscribe(Table::Chores, move |scope, rows| {
        let _ = refresh_tx.send((scope.to_string(), rows.len()));
    });

    let summary = sync.attach(family, &Table::ALL).await;
    for (table, reason) in &summary.failed {
        warn!(family, table = %table, reason = %reason, "subscription failed");
    }

    let mut tables = Vec::with_capacity(Table::ALL.len());
    for table in Table::ALL {
        let rows = sync.read_table(family, table).await?;
        sync.read_table(family, table).await?;
        tables.push(TableReport {
            table,
            rows: rows.len(),
            ttl_secs: sync.config().ttl_for(table.as_str()).as_secs(),
        });
    }

    sync.mutate(
        family,
        Table::Chores,
        Mutation::update(10, json!({ "status": "done" })),
    )
    .await?;

    let refreshed = match tokio::time::timeout(REFRESH_TIMEOUT, refresh_rx.recv()).await {
        Ok(Some((scope, rows))) => {
            info!(family = %scope, rows, "chores refreshed from change feed");
            true
        }
        _ => {
            warn!(family, "no refresh observed for chores");
            false
        }
    };

    // Captured before detach drops the family's entries.
    let stats = sync.get_stats();

    sync.detach(family).await;
    sync.shutdown().await;

    Ok(SessionReport {
        family: family.to_string(),
        subscribed: summary.opened.len() + summary.already_subscribed.len(),
        failed_subscriptions: summary.failed.len(),
        tables,
        refreshed,
        stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_session_report() {
        let report = run("fam1", SyncConfig::default()).await.unwrap();

        assert_eq!(report.family, "fam1");
        assert_eq!(report.subscribed, Table::ALL.len());
        assert_eq!(report.failed_subscriptions, 0);
        assert!(report.refreshed);

        let chores = report
            .tables
            .iter()
            .find(|t| t.table == Table::Chores)
            .unwrap();
        assert_eq!(chores.rows, 3);
        assert_eq!(chores.ttl_secs, 60);

        assert_eq!(report.stats.hits, 4);
        assert_eq!(report.stats.misses, 4);
        assert_eq!(report.stats.hit_rate_percent(), "50.0%");
    }
}
