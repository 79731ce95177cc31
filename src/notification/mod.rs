//! Notifications shown to users.
//!
//! This module contains:
//! - The `Notification` model and its database queries
//! - The [NotificationCoordinator], which sends subscription reminders,
//!   materializes due occurrences and manages user notifications

mod coordinator;
mod core;

pub use coordinator::{NotificationCoordinator, REMINDER_TITLE, ScanReport};
pub use core::{
    NewNotification, Notification, NotificationEdit, NotificationKind, create_notification_table,
};
