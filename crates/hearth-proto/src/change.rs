//! Change notification types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::record::Record;
use crate::table::Table;

/// Types of row changes pushed by the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A new row was inserted.
    Insert,
    /// An existing row was updated.
    Update,
    /// A row was deleted.
    Delete,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Insert => "insert",
            EventType::Update => "update",
            EventType::Delete => "delete",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = Error;

    /// Feeds spell event types in upper case (`INSERT`); accept any case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("insert") {
            Ok(EventType::Insert)
        } else if s.eq_ignore_ascii_case("update") {
            Ok(EventType::Update)
        } else if s.eq_ignore_ascii_case("delete") {
            Ok(EventType::Delete)
        } else {
            Err(Error::UnknownEventType(s.to_string()))
        }
    }
}

/// A change payload as delivered by the feed, before row validation.
///
/// Expected shape: `{ "eventType": "UPDATE", "new": {...}, "old": {...} }`.
/// Feeds send `{}` for the side that does not exist (e.g. `new` on delete);
/// empty objects and nulls are normalized to `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawChange {
    pub event_type: EventType,
    pub new: Option<Value>,
    pub old: Option<Value>,
}

impl RawChange {
    /// Extract the event type and row images from a raw payload.
    pub fn parse(payload: &Value) -> Result<Self, Error> {
        let event_type = payload
            .get("eventType")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidPayload("missing eventType".to_string()))?
            .parse()?;

        Ok(Self {
            event_type,
            new: row_image(payload.get("new")),
            old: row_image(payload.get("old")),
        })
    }
}

fn row_image(value: Option<&Value>) -> Option<Value> {
    match value {
        Some(Value::Object(map)) if !map.is_empty() => Some(Value::Object(map.clone())),
        _ => None,
    }
}

/// A normalized row change for one scope and table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// The scope (family) the change belongs to.
    pub scope: String,
    /// The table that changed.
    pub table: Table,
    /// The type of change.
    pub event_type: EventType,
    /// The row after the change, if the feed sent a valid one.
    pub new_record: Option<Record>,
    /// The row before the change, if the feed sent a valid one.
    pub old_record: Option<Record>,
}

impl ChangeEvent {
    /// Create a change event without row images.
    pub fn new(scope: impl Into<String>, table: Table, event_type: EventType) -> Self {
        Self {
            scope: scope.into(),
            table,
            event_type,
            new_record: None,
            old_record: None,
        }
    }

    /// Attach the post-change row.
    pub fn with_new(mut self, record: Record) -> Self {
        self.new_record = Some(record);
        self
    }

    /// Attach the pre-change row.
    pub fn with_old(mut self, record: Record) -> Self {
        self.old_record = Some(record);
        self
    }

    /// Primary key of the changed row, preferring the new image.
    pub fn record_id(&self) -> Option<i64> {
        self.new_record
            .as_ref()
            .or(self.old_record.as_ref())
            .map(Record::id)
    }
}
