//! Defines the subscription model and its database queries.

use std::{fmt::Display, str::FromStr};

use rusqlite::{
    Connection, Row, ToSql,
    types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    Error,
    database_id::{CategoryId, HolderId, SubscriptionId, new_id},
    db::decimal_from_row,
    holder::RowsAffected,
    subscription::schedule::Renewal,
    timestamp::{optional_timestamp_from_row, timestamp_from_row, to_millis, to_millis_or_none},
    transaction::{NewTransaction, Transaction, TransactionKind},
    user::UserId,
};

// ============================================================================
// MODELS
// ============================================================================

/// How often a subscription recurs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interval {
    /// Every seven days.
    Week,
    /// On the same day each month, clamped to the month's last day.
    Month,
    /// On the same date each year, clamped for 29 February.
    Year,
    /// Every minute. Used to watch the scheduler work in development.
    Test,
}

impl Interval {
    /// The name stored in the database and sent to clients.
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::Week => "week",
            Interval::Month => "month",
            Interval::Year => "year",
            Interval::Test => "test",
        }
    }
}

impl Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The name of an interval that the scheduler does not know how to step.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("\"{0}\" is not a known subscription interval")]
pub struct UnknownIntervalError(pub String);

impl FromStr for Interval {
    type Err = UnknownIntervalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "week" => Ok(Interval::Week),
            "month" => Ok(Interval::Month),
            "year" => Ok(Interval::Year),
            "test" => Ok(Interval::Test),
            other => Err(UnknownIntervalError(other.to_owned())),
        }
    }
}

impl ToSql for Interval {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Interval {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|error| FromSqlError::Other(Box::new(error)))
    }
}

/// A recurring expense, such as a streaming service or rent.
///
/// The template fields describe the transaction created for each occurrence.
/// The state fields track progress through the schedule and are only changed
/// by renewals.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Subscription {
    /// The ID of the subscription.
    pub id: SubscriptionId,
    /// The user that created the subscription.
    pub creator: UserId,
    /// The name used for the generated transactions.
    pub name: String,
    /// The name of the icon shown next to the subscription.
    pub icon: String,
    /// The amount of each occurrence.
    pub amount: Decimal,
    /// The holder each occurrence is paid from.
    pub source_holder: HolderId,
    /// The category each occurrence is filed under.
    pub category: CategoryId,
    /// The date of the first occurrence.
    #[serde(with = "time::serde::rfc3339")]
    pub start_date: OffsetDateTime,
    /// How often the subscription recurs.
    pub interval: Interval,
    /// The number of occurrences, or zero for no limit.
    pub max_interval: u32,
    /// The number of occurrences materialized so far.
    pub current_interval: u32,
    /// How many days before an occurrence to remind the creator.
    pub remind_before: i64,
    /// When the next occurrence is due.
    #[serde(with = "time::serde::rfc3339")]
    pub next_active: OffsetDateTime,
    /// When to send the reminder for the next occurrence, or `None` once it
    /// has been sent.
    #[serde(with = "time::serde::rfc3339::option")]
    pub notify_at: Option<OffsetDateTime>,
    /// Whether more occurrences are due. Cleared once the cap is reached.
    pub is_active: bool,
    /// Whether the user has deleted the subscription.
    pub is_deleted: bool,
    /// When the subscription was last changed.
    #[serde(with = "time::serde::rfc3339")]
    pub last_update: OffsetDateTime,
}

impl Subscription {
    /// The transaction for the occurrence due at `due`.
    ///
    /// # Errors
    /// Returns an [Error::InvalidTransaction] if the template no longer
    /// describes a valid expense.
    pub fn occurrence(&self, due: OffsetDateTime) -> Result<NewTransaction, Error> {
        Transaction::build(
            self.creator.clone(),
            TransactionKind::Expense,
            self.amount,
            due,
        )
        .source(self.source_holder)
        .category(self.category)
        .note(&format!("Subscription payment for {}", self.name))
        .finalise()
    }

    /// Whether the reminder for the next occurrence should be sent at `now`.
    pub fn reminder_due(&self, now: OffsetDateTime) -> bool {
        self.is_active
            && !self.is_deleted
            && self.notify_at.is_some_and(|notify_at| notify_at <= now)
    }

    /// Whether the next occurrence should be materialized at `now`.
    pub fn occurrence_due(&self, now: OffsetDateTime) -> bool {
        self.is_active && !self.is_deleted && self.next_active <= now
    }
}

/// The data needed to start a new subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSubscription {
    /// The user creating the subscription.
    pub creator: UserId,
    /// The name used for the generated transactions.
    pub name: String,
    /// The icon name, empty for none.
    pub icon: String,
    /// The amount of each occurrence.
    pub amount: Decimal,
    /// The holder each occurrence is paid from.
    pub source_holder: HolderId,
    /// The category each occurrence is filed under.
    pub category: CategoryId,
    /// The date of the first occurrence.
    pub start_date: OffsetDateTime,
    /// How often the subscription recurs.
    pub interval: Interval,
    /// The number of occurrences, or zero for no limit.
    pub max_interval: u32,
    /// How many days before an occurrence to remind the creator.
    pub remind_before: i64,
}

impl NewSubscription {
    /// Describe an uncapped subscription without a reminder lead time.
    pub fn new(
        creator: UserId,
        name: &str,
        amount: Decimal,
        source_holder: HolderId,
        category: CategoryId,
        start_date: OffsetDateTime,
        interval: Interval,
    ) -> Self {
        Self {
            creator,
            name: name.to_owned(),
            icon: String::new(),
            amount,
            source_holder,
            category,
            start_date,
            interval,
            max_interval: 0,
            remind_before: 0,
        }
    }

    /// Set the icon for the subscription.
    pub fn icon(mut self, icon: &str) -> Self {
        self.icon = icon.to_owned();
        self
    }

    /// Stop after `max_interval` occurrences. Zero means no limit.
    pub fn max_interval(mut self, max_interval: u32) -> Self {
        self.max_interval = max_interval;
        self
    }

    /// Remind the creator `days` days before each occurrence.
    pub fn remind_before(mut self, days: i64) -> Self {
        self.remind_before = days;
        self
    }

    /// Check the template describes a valid expense.
    ///
    /// # Errors
    /// Returns an [Error::InvalidSubscription] describing the broken rule.
    pub fn validate(&self) -> Result<(), Error> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidSubscription(
                "a subscription needs a name".to_owned(),
            ));
        }

        if self.amount.is_sign_negative() {
            return Err(Error::InvalidSubscription(format!(
                "the amount must not be negative, got {}",
                self.amount
            )));
        }

        Ok(())
    }
}

/// The user-editable parts of a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionEdit {
    /// The new name.
    pub name: String,
    /// The new icon name.
    pub icon: String,
    /// The new amount of each occurrence.
    pub amount: Decimal,
    /// The new holder to pay from.
    pub source_holder: HolderId,
    /// The new category.
    pub category: CategoryId,
}

// ============================================================================
// DATABASE FUNCTIONS
// ============================================================================

/// Create the subscription table and the indexes the scans use.
pub fn create_subscription_table(connection: &Connection) -> Result<(), rusqlite::Error> {
    connection.execute(
        "CREATE TABLE IF NOT EXISTS subscription (
            id BLOB PRIMARY KEY,
            creator TEXT NOT NULL,
            name TEXT NOT NULL,
            icon TEXT NOT NULL,
            amount TEXT NOT NULL,
            source_holder BLOB NOT NULL,
            category BLOB NOT NULL,
            start_date INTEGER NOT NULL,
            interval TEXT NOT NULL,
            max_interval INTEGER NOT NULL,
            current_interval INTEGER NOT NULL,
            remind_before INTEGER NOT NULL,
            next_active INTEGER NOT NULL,
            notify_at INTEGER NOT NULL,
            is_active INTEGER NOT NULL,
            last_update INTEGER NOT NULL,
            is_deleted INTEGER NOT NULL DEFAULT 0
        )",
        (),
    )?;

    connection.execute(
        "CREATE INDEX IF NOT EXISTS idx_subscription_creator_last_update
         ON subscription(creator, last_update)",
        (),
    )?;
    connection.execute(
        "CREATE INDEX IF NOT EXISTS idx_subscription_notify_at
         ON subscription(is_active, is_deleted, notify_at)",
        (),
    )?;
    connection.execute(
        "CREATE INDEX IF NOT EXISTS idx_subscription_next_active
         ON subscription(is_active, is_deleted, next_active)",
        (),
    )?;

    Ok(())
}

fn map_row_to_subscription(row: &Row) -> Result<Subscription, rusqlite::Error> {
    Ok(Subscription {
        id: row.get(0)?,
        creator: row.get(1)?,
        name: row.get(2)?,
        icon: row.get(3)?,
        amount: decimal_from_row(row, 4)?,
        source_holder: row.get(5)?,
        category: row.get(6)?,
        start_date: timestamp_from_row(row, 7)?,
        interval: row.get(8)?,
        max_interval: row.get(9)?,
        current_interval: row.get(10)?,
        remind_before: row.get(11)?,
        next_active: timestamp_from_row(row, 12)?,
        notify_at: optional_timestamp_from_row(row, 13)?,
        is_active: row.get(14)?,
        last_update: timestamp_from_row(row, 15)?,
        is_deleted: row.get(16)?,
    })
}

const SELECT_SUBSCRIPTION: &str = "SELECT id, creator, name, icon, amount, source_holder, \
     category, start_date, interval, max_interval, current_interval, remind_before, \
     next_active, notify_at, is_active, last_update, is_deleted FROM subscription";

/// Write a new subscription in the state `initial` and return it.
///
/// The caller is expected to catch the subscription up straight away.
pub(crate) fn insert_subscription(
    subscription: &NewSubscription,
    initial: &Renewal,
    connection: &Connection,
    now: OffsetDateTime,
) -> Result<Subscription, Error> {
    let id = new_id();

    connection.execute(
        "INSERT INTO subscription (id, creator, name, icon, amount, source_holder, category,
            start_date, interval, max_interval, current_interval, remind_before, next_active,
            notify_at, is_active, last_update, is_deleted)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, 0)",
        rusqlite::params![
            id,
            &subscription.creator,
            &subscription.name,
            &subscription.icon,
            subscription.amount.to_string(),
            subscription.source_holder,
            subscription.category,
            to_millis(subscription.start_date),
            subscription.interval,
            subscription.max_interval,
            initial.current_interval,
            subscription.remind_before,
            to_millis(initial.next_active),
            to_millis_or_none(initial.notify_at),
            initial.is_active,
            to_millis(now),
        ],
    )?;

    get_subscription(id, connection)
}

/// Retrieve a subscription by its `id`, including deleted subscriptions.
///
/// # Errors
/// This function will return a:
/// - [Error::SubscriptionNotFound] if `id` does not refer to a subscription,
/// - [Error::UnknownInterval] if the stored interval is not recognised,
/// - or [Error::SqlError] there is some other SQL error.
pub fn get_subscription(
    id: SubscriptionId,
    connection: &Connection,
) -> Result<Subscription, Error> {
    connection
        .prepare(&format!("{SELECT_SUBSCRIPTION} WHERE id = :id"))?
        .query_one(&[(":id", &id)], map_row_to_subscription)
        .map_err(|error| match error {
            rusqlite::Error::QueryReturnedNoRows => Error::SubscriptionNotFound(id),
            error => error.into(),
        })
}

/// Retrieve the subscriptions of `creator` changed after `since`, most recent
/// first.
///
/// # Errors
/// This function will return a [Error::SqlError] there is some SQL error.
pub fn get_subscriptions_since(
    creator: &UserId,
    since: OffsetDateTime,
    connection: &Connection,
) -> Result<Vec<Subscription>, Error> {
    connection
        .prepare(&format!(
            "{SELECT_SUBSCRIPTION} WHERE creator = ?1 AND last_update > ?2
             ORDER BY last_update DESC"
        ))?
        .query_map((creator, to_millis(since)), map_row_to_subscription)?
        .map(|maybe_subscription| maybe_subscription.map_err(Error::from))
        .collect()
}

/// The IDs of live subscriptions whose reminder is due at `now`, earliest
/// first.
///
/// Only the IDs are read so that one unreadable row cannot hide the others.
pub(crate) fn select_due_reminders(
    now: OffsetDateTime,
    connection: &Connection,
) -> Result<Vec<SubscriptionId>, Error> {
    connection
        .prepare(
            "SELECT id FROM subscription
             WHERE is_active = 1 AND is_deleted = 0 AND notify_at != 0 AND notify_at <= ?1
             ORDER BY notify_at",
        )?
        .query_map([to_millis(now)], |row| row.get(0))?
        .map(|maybe_id| maybe_id.map_err(Error::from))
        .collect()
}

/// The IDs of live subscriptions with an occurrence due at `now`, earliest
/// first.
pub(crate) fn select_due_occurrences(
    now: OffsetDateTime,
    connection: &Connection,
) -> Result<Vec<SubscriptionId>, Error> {
    connection
        .prepare(
            "SELECT id FROM subscription
             WHERE is_active = 1 AND is_deleted = 0 AND next_active <= ?1
             ORDER BY next_active",
        )?
        .query_map([to_millis(now)], |row| row.get(0))?
        .map(|maybe_id| maybe_id.map_err(Error::from))
        .collect()
}

/// Overwrite the state fields of subscription `id`, but only if it has not
/// been renewed since it was read with `expected_interval` occurrences.
pub(crate) fn write_renewal(
    id: SubscriptionId,
    expected_interval: u32,
    renewal: &Renewal,
    connection: &Connection,
    now: OffsetDateTime,
) -> Result<RowsAffected, Error> {
    connection
        .execute(
            "UPDATE subscription SET current_interval = ?1, next_active = ?2, notify_at = ?3,
                is_active = ?4, last_update = ?5
             WHERE id = ?6 AND current_interval = ?7",
            (
                renewal.current_interval,
                to_millis(renewal.next_active),
                to_millis_or_none(renewal.notify_at),
                renewal.is_active,
                to_millis(now),
                id,
                expected_interval,
            ),
        )
        .map_err(Error::from)
}

/// Mark the pending reminder of subscription `id` as sent, but only if it is
/// still the reminder scheduled for `expected`.
pub(crate) fn clear_notify_at(
    id: SubscriptionId,
    expected: OffsetDateTime,
    connection: &Connection,
) -> Result<RowsAffected, Error> {
    connection
        .execute(
            "UPDATE subscription SET notify_at = 0 WHERE id = ?1 AND notify_at = ?2",
            (id, to_millis(expected)),
        )
        .map_err(Error::from)
}

/// Overwrite the template fields of subscription `id`.
///
/// # Errors
/// Returns an [Error::SubscriptionNotFound] if `id` does not refer to a live
/// subscription.
pub(crate) fn update_subscription_template(
    id: SubscriptionId,
    edit: &SubscriptionEdit,
    connection: &Connection,
    now: OffsetDateTime,
) -> Result<(), Error> {
    let rows_affected = connection.execute(
        "UPDATE subscription SET name = ?1, icon = ?2, amount = ?3, source_holder = ?4,
            category = ?5, last_update = ?6
         WHERE id = ?7 AND is_deleted = 0",
        (
            &edit.name,
            &edit.icon,
            edit.amount.to_string(),
            edit.source_holder,
            edit.category,
            to_millis(now),
            id,
        ),
    )?;

    match rows_affected {
        0 => Err(Error::SubscriptionNotFound(id)),
        _ => Ok(()),
    }
}

/// Flag subscription `id` as deleted. Transactions it already created are kept.
///
/// # Errors
/// Returns an [Error::SubscriptionNotFound] if `id` does not refer to a live
/// subscription.
pub(crate) fn mark_subscription_deleted(
    id: SubscriptionId,
    connection: &Connection,
    now: OffsetDateTime,
) -> Result<(), Error> {
    let rows_affected = connection.execute(
        "UPDATE subscription SET is_deleted = 1, last_update = ?1 WHERE id = ?2 AND is_deleted = 0",
        (to_millis(now), id),
    )?;

    match rows_affected {
        0 => Err(Error::SubscriptionNotFound(id)),
        _ => Ok(()),
    }
}

/// Flag every live subscription paid from `holder` as deleted.
pub(crate) fn mark_subscriptions_deleted_for_holder(
    holder: HolderId,
    connection: &Connection,
    now: OffsetDateTime,
) -> Result<RowsAffected, Error> {
    connection
        .execute(
            "UPDATE subscription SET is_deleted = 1, last_update = ?1
             WHERE source_holder = ?2 AND is_deleted = 0",
            (to_millis(now), holder),
        )
        .map_err(Error::from)
}

/// Flag every live subscription filed under `category` as deleted.
pub(crate) fn mark_subscriptions_deleted_for_category(
    category: CategoryId,
    connection: &Connection,
    now: OffsetDateTime,
) -> Result<RowsAffected, Error> {
    connection
        .execute(
            "UPDATE subscription SET is_deleted = 1, last_update = ?1
             WHERE category = ?2 AND is_deleted = 0",
            (to_millis(now), category),
        )
        .map_err(Error::from)
}

// ============================================================================
// TESTS
// ============================================================================
