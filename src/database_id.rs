//! Database ID type definitions.
//!
//! IDs are random UUIDs rather than per-table integers so that a holder ID is
//! unique across the account and saving tables.

use uuid::Uuid;

/// Alias for the type used for mapping to database IDs.
pub type DatabaseId = Uuid;
/// The ID of an account or a saving.
pub type HolderId = Uuid;
/// The ID of a transaction.
pub type TransactionId = Uuid;
/// The ID of a subscription.
pub type SubscriptionId = Uuid;
/// The ID of a notification.
pub type NotificationId = Uuid;
/// The ID of a category.
pub type CategoryId = Uuid;

/// Generate a fresh ID for a new record.
pub fn new_id() -> DatabaseId {
    Uuid::new_v4()
}
