//! Per-table change notifications.
//!
//! Every committed write publishes a [`TableChange`] on a broadcast channel.
//! Subscribers get a notification, not a diff, and are expected to re-fetch.
//! Publishing with no subscribers is a no-op.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    Rides,
    Bookings,
    Messages,
    Profiles,
    Notifications,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Rides => "rides",
            Table::Bookings => "bookings",
            Table::Messages => "messages",
            Table::Profiles => "profiles",
            Table::Notifications => "notifications",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableChange {
    pub table: Table,
    pub kind: ChangeKind,
}

#[derive(Clone)]
pub struct ChangeFeed {
    sender: broadcast::Sender<TableChange>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TableChange> {
        self.sender.subscribe()
    }

    pub fn publish(&self, table: Table, kind: ChangeKind) {
        let _ = self.sender.send(TableChange { table, kind });
    }
}

impl std::fmt::Debug for ChangeFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeed")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_changes() {
        let feed = ChangeFeed::new(8);
        let mut first = feed.subscribe();
        let mut second = feed.subscribe();

        feed.publish(Table::Bookings, ChangeKind::Insert);

        let expected = TableChange {
            table: Table::Bookings,
            kind: ChangeKind::Insert,
        };
        assert_eq!(first.recv().await.unwrap(), expected);
        assert_eq!(second.recv().await.unwrap(), expected);
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let feed = ChangeFeed::new(8);
        feed.publish(Table::Rides, ChangeKind::Update);
    }

    #[test]
    fn table_names_match_serde() {
        let json = serde_json::to_string(&Table::Notifications).unwrap();
        assert_eq!(json, format!("\"{}\"", Table::Notifications.as_str()));
    }
}
