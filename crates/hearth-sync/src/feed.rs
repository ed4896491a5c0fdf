//! Change feed boundary.

use std::fmt;

use async_trait::async_trait;
use hearth_proto::{Table, SCOPE_COLUMN};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::FeedError;

/// Server-side identifier of an open channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelHandle(pub u64);

impl fmt::Display for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel-{}", self.0)
    }
}

/// Row filter applied by the feed before pushing changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelFilter {
    pub column: String,
    pub value: String,
}

impl ChannelFilter {
    /// Filter to rows of a single scope.
    pub fn for_scope(scope: &str) -> Self {
        Self {
            column: SCOPE_COLUMN.to_string(),
            value: scope.to_string(),
        }
    }
}

impl fmt::Display for ChannelFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=eq.{}", self.column, self.value)
    }
}

/// Lifecycle status reported by the feed for a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    /// The server acknowledged the subscription.
    Subscribed,
    /// The channel failed and will deliver nothing more.
    Error(String),
    /// The server closed the channel.
    Closed,
}

/// A message pushed on a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    Status(ChannelStatus),
    /// Raw change payload with `eventType`, `new` and `old` fields.
    Change(Value),
}

/// An opened channel.
#[derive(Debug)]
pub struct FeedChannel {
    pub handle: ChannelHandle,
    pub messages: mpsc::UnboundedReceiver<FeedMessage>,
}

/// Push-based source of row-level change notifications.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open a channel for changes to `table` matching `filter`.
    async fn open_channel(
        &self,
        scope: &str,
        table: Table,
        filter: &ChannelFilter,
    ) -> Result<FeedChannel, FeedError>;

    /// Release the server resources held by a channel.
    async fn close_channel(&self, handle: ChannelHandle) -> Result<(), FeedError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_filter() {
        let filter = ChannelFilter::for_scope("fam1");
        assert_eq!(filter.column, "family_id");
        assert_eq!(filter.to_string(), "family_id=eq.fam1");
    }
}
