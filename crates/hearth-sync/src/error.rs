//! Sync layer error types.

use hearth_proto::Table;
use thiserror::Error;

/// Discriminator for data store failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    NotFound,
    Transport,
    ConstraintViolation,
    InvalidRecord,
}

/// Failure reported by a [`DataStore`](crate::DataStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The backend could not be reached or returned a transport failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The backend rejected a write.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// A row failed validation at the store boundary.
    #[error("invalid record: {0}")]
    InvalidRecord(#[from] hearth_proto::Error),
}

impl StoreError {
    pub fn kind(&self) -> StoreErrorKind {
        match self {
            StoreError::NotFound(_) => StoreErrorKind::NotFound,
            StoreError::Transport(_) => StoreErrorKind::Transport,
            StoreError::ConstraintViolation(_) => StoreErrorKind::ConstraintViolation,
            StoreError::InvalidRecord(_) => StoreErrorKind::InvalidRecord,
        }
    }
}

/// Failure reported by a [`ChangeFeed`](crate::ChangeFeed).
#[derive(Debug, Error)]
pub enum FeedError {
    /// The feed refused to open the channel.
    #[error("channel rejected: {0}")]
    Rejected(String),

    /// The channel is already closed.
    #[error("channel closed")]
    Closed,
}

/// Failure raised by a change listener.
#[derive(Debug, Error)]
#[error("listener failed: {0}")]
pub struct ListenerError(pub String);

impl ListenerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Sync layer errors surfaced to callers of reads, writes and subscriptions.
#[derive(Debug, Error)]
pub enum Error {
    /// The data store failed; nothing was cached.
    #[error("fetch failed: {0}")]
    Fetch(#[from] StoreError),

    /// The change feed rejected or dropped a subscription.
    #[error("subscription to {table} for scope {scope} failed: {reason}")]
    Subscription {
        scope: String,
        table: Table,
        reason: String,
    },
}

impl Error {
    /// The store failure kind, if this is a fetch failure.
    pub fn store_kind(&self) -> Option<StoreErrorKind> {
        match self {
            Error::Fetch(e) => Some(e.kind()),
            _ => None,
        }
    }
}
