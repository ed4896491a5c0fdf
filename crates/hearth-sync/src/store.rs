//! Data store boundary.

use async_trait::async_trait;
use hearth_proto::{Record, Table};
use serde_json::Value;

use crate::error::StoreError;

/// A write against one table.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Insert a full row. A missing `id` is assigned by the store.
    Insert { row: Value },
    /// Merge `changes` into the row with `id`.
    Update { id: i64, changes: Value },
    /// Remove the row with `id`.
    Delete { id: i64 },
}

impl Mutation {
    pub fn insert(row: Value) -> Self {
        Mutation::Insert { row }
    }

    pub fn update(id: i64, changes: Value) -> Self {
        Mutation::Update { id, changes }
    }

    pub fn delete(id: i64) -> Self {
        Mutation::Delete { id }
    }

    /// Short operation name for logs.
    pub fn operation(&self) -> &'static str {
        match self {
            Mutation::Insert { .. } => "insert",
            Mutation::Update { .. } => "update",
            Mutation::Delete { .. } => "delete",
        }
    }
}

/// Result of a successful mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationOutcome {
    /// Number of rows affected.
    pub affected: u64,
    /// The row as stored after the write, or as it was before a delete.
    pub record: Option<Record>,
}

/// Remote data store holding the synchronized tables.
///
/// Every row is validated into a [`Record`] before it crosses this boundary.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Fetch the rows of `table` belonging to `scope`.
    ///
    /// `params` narrows the result with `column=value` pairs joined by `&`.
    async fn fetch(
        &self,
        table: Table,
        scope: &str,
        params: Option<&str>,
    ) -> Result<Vec<Record>, StoreError>;

    /// Apply a write to `table`.
    async fn mutate(&self, table: Table, mutation: Mutation)
        -> Result<MutationOutcome, StoreError>;
}
