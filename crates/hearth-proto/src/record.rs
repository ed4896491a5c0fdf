//! Domain records, one concrete schema per table.
//!
//! Rows arrive from the backend as loosely typed JSON objects. They are
//! validated into a [`Record`] at the data store boundary so the rest of the
//! sync layer only ever sees well-formed data.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::table::Table;

/// A snapshot of rows shared between the cache and refresh listeners.
pub type RecordSet = Arc<Vec<Record>>;

/// Role of a family member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Parent,
    Child,
}

/// Progress of a chore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChoreStatus {
    #[default]
    Open,
    Done,
    Approved,
}

/// A row of the `members` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: i64,
    pub family_id: String,
    pub name: String,
    pub role: MemberRole,
    #[serde(default)]
    pub points: i64,
}

/// A row of the `chores` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chore {
    pub id: i64,
    pub family_id: String,
    pub title: String,
    #[serde(default)]
    pub assigned_to: Option<i64>,
    #[serde(default)]
    pub points: i64,
    #[serde(default)]
    pub status: ChoreStatus,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
}

/// A row of the `rewards` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reward {
    pub id: i64,
    pub family_id: String,
    pub title: String,
    pub cost: i64,
}

/// A row of the `completions` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub id: i64,
    pub family_id: String,
    pub chore_id: i64,
    pub member_id: i64,
    pub completed_at: DateTime<Utc>,
}

/// A validated row from any synchronized table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    Member(Member),
    Chore(Chore),
    Reward(Reward),
    Completion(Completion),
}

impl Record {
    /// Validate a raw JSON row against the schema of `table`.
    pub fn from_row(table: Table, row: &Value) -> Result<Self, Error> {
        let invalid = |e: serde_json::Error| Error::InvalidRecord {
            table: table.as_str().to_string(),
            reason: e.to_string(),
        };

        let record = match table {
            Table::Members => Record::Member(Member::deserialize(row).map_err(invalid)?),
            Table::Chores => Record::Chore(Chore::deserialize(row).map_err(invalid)?),
            Table::Rewards => Record::Reward(Reward::deserialize(row).map_err(invalid)?),
            Table::Completions => {
                Record::Completion(Completion::deserialize(row).map_err(invalid)?)
            }
        };

        Ok(record)
    }

    /// Render this record back into a backend row (no `kind` tag).
    pub fn to_row(&self) -> Result<Value, Error> {
        let row = match self {
            Record::Member(m) => serde_json::to_value(m),
            Record::Chore(c) => serde_json::to_value(c),
            Record::Reward(r) => serde_json::to_value(r),
            Record::Completion(c) => serde_json::to_value(c),
        };
        row.map_err(|e| Error::Serialization(e.to_string()))
    }

    /// The table this record belongs to.
    pub fn table(&self) -> Table {
        match self {
            Record::Member(_) => Table::Members,
            Record::Chore(_) => Table::Chores,
            Record::Reward(_) => Table::Rewards,
            Record::Completion(_) => Table::Completions,
        }
    }

    /// Primary key of the row.
    pub fn id(&self) -> i64 {
        match self {
            Record::Member(m) => m.id,
            Record::Chore(c) => c.id,
            Record::Reward(r) => r.id,
            Record::Completion(c) => c.id,
        }
    }

    /// The family (scope) that owns the row.
    pub fn family_id(&self) -> &str {
        match self {
            Record::Member(m) => &m.family_id,
            Record::Chore(c) => &c.family_id,
            Record::Reward(r) => &r.family_id,
            Record::Completion(c) => &c.family_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chore_from_row_with_defaults() {
        let row = json!({ "id": 5, "family_id": "fam1", "title": "Dishes" });
        let record = Record::from_row(Table::Chores, &row).unwrap();

        match &record {
            Record::Chore(chore) => {
                assert_eq!(chore.id, 5);
                assert_eq!(chore.status, ChoreStatus::Open);
                assert_eq!(chore.assigned_to, None);
                assert_eq!(chore.points, 0);
            }
            other => panic!("expected chore, got {:?}", other),
        }
        assert_eq!(record.table(), Table::Chores);
        assert_eq!(record.family_id(), "fam1");
    }

    #[test]
    fn test_row_validated_against_table_schema() {
        // A member row is not a valid reward row.
        let row = json!({ "id": 1, "family_id": "fam1", "name": "Ada", "role": "parent" });
        assert!(Record::from_row(Table::Members, &row).is_ok());

        let err = Record::from_row(Table::Rewards, &row).unwrap_err();
        assert!(matches!(err, Error::InvalidRecord { ref table, .. } if table == "rewards"));
    }

    #[test]
    fn test_to_row_omits_kind_tag() {
        let record = Record::Reward(Reward {
            id: 3,
            family_id: "fam1".into(),
            title: "Movie night".into(),
            cost: 50,
        });

        let row = record.to_row().unwrap();
        assert!(row.get("kind").is_none());
        assert_eq!(row["cost"], 50);
        assert_eq!(Record::from_row(Table::Rewards, &row).unwrap(), record);
    }

    #[test]
    fn test_completion_timestamp() {
        let row = json!({
            "id": 9,
            "family_id": "fam2",
            "chore_id": 5,
            "member_id": 1,
            "completed_at": "2024-03-01T10:00:00Z"
        });
        let record = Record::from_row(Table::Completions, &row).unwrap();
        assert_eq!(record.id(), 9);
        assert_eq!(record.family_id(), "fam2");
    }
}
