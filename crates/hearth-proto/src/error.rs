//! Protocol error types.

use thiserror::Error;

/// Errors raised while interpreting rows and change payloads.
#[derive(Debug, Error)]
pub enum Error {
    /// The table name is not one of the synchronized tables.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// The change payload carried an event type we do not understand.
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    /// A row did not match the schema of its table.
    #[error("invalid {table} record: {reason}")]
    InvalidRecord { table: String, reason: String },

    /// The change payload was not shaped like a change notification.
    #[error("invalid change payload: {0}")]
    InvalidPayload(String),

    /// Serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}
