//! Recurring subscriptions.
//!
//! This module contains:
//! - The `Subscription` model and its database queries
//! - The schedule arithmetic that dates each occurrence
//! - The [Scheduler], which creates subscriptions, catches them up on missed
//!   occurrences and renews them

mod core;
mod schedule;
mod scheduler;

pub use core::{
    Interval, NewSubscription, Subscription, SubscriptionEdit, UnknownIntervalError,
    create_subscription_table, get_subscription, get_subscriptions_since,
};
pub use schedule::{Renewal, step};
pub use scheduler::{CatchUp, Scheduler};

pub(crate) use core::{
    mark_subscriptions_deleted_for_category, mark_subscriptions_deleted_for_holder,
    select_due_occurrences, select_due_reminders,
};
pub(crate) use scheduler::{clear_reminder_in_unit, renew_in_unit};
