//! The side-channel that tells connected clients about changes.
//!
//! Events are published on a [tokio::sync::broadcast] channel and forwarded to
//! clients by whatever fan-out layer subscribes to it. Publishing never fails
//! from the caller's point of view.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::user::UserId;

/// The number of events a slow subscriber may fall behind before it starts
/// missing events.
pub const DEFAULT_CAPACITY: usize = 256;

/// The collection an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    /// The transaction log.
    Transactions,
    /// Recurring subscriptions.
    Subscriptions,
    /// Notifications shown to the user.
    Notifications,
    /// Income and expense categories.
    Categories,
}

/// What happened to the collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// A record was created.
    Create,
    /// A record was edited.
    Update,
    /// A record was deleted.
    Delete,
    /// A subscription moved on to its next occurrence.
    Renew,
    /// Notifications were marked as read.
    Mark,
}

/// A change to one of the user's collections.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    /// The user whose clients should receive the event.
    #[serde(skip)]
    pub owner: UserId,
    /// The collection that changed.
    pub collection: Collection,
    /// What happened to it.
    pub action: Action,
    /// The changed record, its ID, or a marker such as `"bulk"`.
    pub detail: serde_json::Value,
}

/// Publishes [Event]s to every subscriber.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    sender: broadcast::Sender<Event>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Broadcaster {
    /// Create a broadcaster that buffers up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);

        Self { sender }
    }

    /// Receive every event sent from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publish an event. Failures are logged and otherwise ignored.
    pub fn send(
        &self,
        owner: &UserId,
        collection: Collection,
        action: Action,
        detail: impl Serialize,
    ) {
        let detail = serde_json::to_value(detail).unwrap_or_else(|error| {
            tracing::warn!("could not serialize {collection:?} {action:?} event detail: {error}");
            serde_json::Value::Null
        });

        let event = Event {
            owner: owner.clone(),
            collection,
            action,
            detail,
        };

        if self.sender.send(event).is_err() {
            tracing::debug!("no subscribers for {collection:?} {action:?} event");
        }
    }
}
