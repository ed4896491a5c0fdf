//! Hearth protocol types.
//!
//! This crate defines the data shared across the sync layer: the set of
//! synchronized tables, the validated record schema for each table, and the
//! change notifications pushed by the backend.
//!
//! # Modules
//!
//! - [`table`] - Synchronized table names
//! - [`record`] - Per-table record schemas and row validation
//! - [`change`] - Raw and normalized change notifications
//! - [`error`] - Protocol error types
//!
//! # Validation
//!
//! Rows enter the system as JSON objects and are validated once:
//!
//! ```ignore
//! use hearth_proto::{Record, Table};
//!
//! let row = serde_json::json!({ "id": 5, "family_id": "fam1", "title": "Dishes" });
//! let record = Record::from_row(Table::Chores, &row)?;
//! assert_eq!(record.id(), 5);
//! ```

pub mod change;
pub mod error;
pub mod record;
pub mod table;

pub use error::Error;

pub use change::{ChangeEvent, EventType, RawChange};
pub use record::{
    Chore, ChoreStatus, Completion, Member, MemberRole, Record, RecordSet, Reward,
};
pub use table::Table;

/// Column that partitions every table by scope.
pub const SCOPE_COLUMN: &str = "family_id";
