//! Defines the notification model and its database queries.

use std::{fmt::Display, str::FromStr};

use rusqlite::{
    Connection, Row, ToSql,
    types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef},
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    Error,
    database_id::{NotificationId, new_id},
    holder::RowsAffected,
    timestamp::{timestamp_from_row, to_millis},
    user::UserId,
};

/// What a notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// A transaction was recorded for the user.
    Transaction,
    /// Spending in a category went over its budget.
    OverBudget,
    /// An expected income arrived.
    FinishIncome,
    /// A reminder that a subscription payment is coming up.
    Subscription,
}

impl NotificationKind {
    /// The name stored in the database and sent to clients.
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Transaction => "transaction",
            NotificationKind::OverBudget => "over_budget",
            NotificationKind::FinishIncome => "finish_income",
            NotificationKind::Subscription => "subscription",
        }
    }
}

impl Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The name of a notification kind that is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("\"{0}\" is not a notification kind")]
pub struct NotificationKindError(String);

impl FromStr for NotificationKind {
    type Err = NotificationKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transaction" => Ok(NotificationKind::Transaction),
            "over_budget" => Ok(NotificationKind::OverBudget),
            "finish_income" => Ok(NotificationKind::FinishIncome),
            "subscription" => Ok(NotificationKind::Subscription),
            other => Err(NotificationKindError(other.to_owned())),
        }
    }
}

impl ToSql for NotificationKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for NotificationKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|error| FromSqlError::Other(Box::new(error)))
    }
}

/// A message shown to a user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    /// The ID of the notification.
    pub id: NotificationId,
    /// The user the notification is for.
    pub owner: UserId,
    /// What the notification is about.
    pub kind: NotificationKind,
    /// The record the notification is about, e.g. a subscription.
    pub reference_id: Option<Uuid>,
    /// The headline.
    pub title: String,
    /// The body text.
    pub message: String,
    /// Whether the owner has seen the notification. Once set it stays set.
    pub read: bool,
    /// When the notification should be shown.
    #[serde(with = "time::serde::rfc3339")]
    pub scheduled_at: OffsetDateTime,
    /// When the notification was last changed.
    #[serde(with = "time::serde::rfc3339")]
    pub last_update: OffsetDateTime,
    /// Whether the owner has deleted the notification.
    pub is_deleted: bool,
}

/// The data needed to create a notification.
#[derive(Debug, Clone, PartialEq)]
pub struct NewNotification {
    /// The user the notification is for.
    pub owner: UserId,
    /// What the notification is about.
    pub kind: NotificationKind,
    /// The record the notification is about, if any.
    pub reference_id: Option<Uuid>,
    /// The headline.
    pub title: String,
    /// The body text.
    pub message: String,
    /// When the notification should be shown.
    pub scheduled_at: OffsetDateTime,
}

impl NewNotification {
    /// Describe a notification that does not refer to any record.
    pub fn new(
        owner: UserId,
        kind: NotificationKind,
        title: &str,
        message: &str,
        scheduled_at: OffsetDateTime,
    ) -> Self {
        Self {
            owner,
            kind,
            reference_id: None,
            title: title.to_owned(),
            message: message.to_owned(),
            scheduled_at,
        }
    }

    /// Link the notification to the record it is about.
    pub fn reference(mut self, id: Uuid) -> Self {
        self.reference_id = Some(id);
        self
    }
}

/// The user-editable parts of a notification. The read flag is changed with
/// [mark_notifications_read] only.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationEdit {
    /// The new headline.
    pub title: String,
    /// The new body text.
    pub message: String,
    /// The new time to show the notification.
    pub scheduled_at: OffsetDateTime,
}

/// Create the notification table and its sync index.
pub fn create_notification_table(connection: &Connection) -> Result<(), rusqlite::Error> {
    connection.execute(
        "CREATE TABLE IF NOT EXISTS notification (
            id BLOB PRIMARY KEY,
            owner TEXT NOT NULL,
            kind TEXT NOT NULL,
            reference_id BLOB,
            title TEXT NOT NULL,
            message TEXT NOT NULL,
            read INTEGER NOT NULL DEFAULT 0,
            scheduled_at INTEGER NOT NULL,
            last_update INTEGER NOT NULL,
            is_deleted INTEGER NOT NULL DEFAULT 0
        )",
        (),
    )?;

    connection.execute(
        "CREATE INDEX IF NOT EXISTS idx_notification_owner_last_update
         ON notification(owner, last_update)",
        (),
    )?;

    Ok(())
}

fn map_row_to_notification(row: &Row) -> Result<Notification, rusqlite::Error> {
    Ok(Notification {
        id: row.get(0)?,
        owner: row.get(1)?,
        kind: row.get(2)?,
        reference_id: row.get(3)?,
        title: row.get(4)?,
        message: row.get(5)?,
        read: row.get(6)?,
        scheduled_at: timestamp_from_row(row, 7)?,
        last_update: timestamp_from_row(row, 8)?,
        is_deleted: row.get(9)?,
    })
}

const SELECT_NOTIFICATION: &str = "SELECT id, owner, kind, reference_id, title, message, read, \
     scheduled_at, last_update, is_deleted FROM notification";

/// Store a new, unread notification.
///
/// # Errors
/// Returns an [Error::SqlError] if there is an SQL error.
pub fn create_notification(
    notification: &NewNotification,
    connection: &Connection,
    now: OffsetDateTime,
) -> Result<Notification, Error> {
    let id = new_id();

    connection.execute(
        "INSERT INTO notification (id, owner, kind, reference_id, title, message, read,
            scheduled_at, last_update, is_deleted)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8, 0)",
        (
            id,
            &notification.owner,
            notification.kind,
            notification.reference_id,
            &notification.title,
            &notification.message,
            to_millis(notification.scheduled_at),
            to_millis(now),
        ),
    )?;

    get_notification(id, connection)
}

/// Retrieve a notification by its `id`, including deleted notifications.
///
/// # Errors
/// Returns an [Error::NotificationNotFound] if `id` does not refer to a
/// notification.
pub fn get_notification(
    id: NotificationId,
    connection: &Connection,
) -> Result<Notification, Error> {
    connection
        .query_row(
            &format!("{SELECT_NOTIFICATION} WHERE id = ?1"),
            [id],
            map_row_to_notification,
        )
        .map_err(|error| match error {
            rusqlite::Error::QueryReturnedNoRows => Error::NotificationNotFound(id),
            error => error.into(),
        })
}

/// Retrieve the notifications of `owner` changed after `since`, most recent
/// first.
///
/// # Errors
/// Returns an [Error::SqlError] if there is an SQL error.
pub fn get_notifications_since(
    owner: &UserId,
    since: OffsetDateTime,
    connection: &Connection,
) -> Result<Vec<Notification>, Error> {
    connection
        .prepare(&format!(
            "{SELECT_NOTIFICATION} WHERE owner = ?1 AND last_update > ?2
             ORDER BY last_update DESC"
        ))?
        .query_map((owner, to_millis(since)), map_row_to_notification)?
        .map(|maybe_notification| maybe_notification.map_err(Error::from))
        .collect()
}

/// Mark the notifications in `ids` that belong to `owner` as read.
///
/// Notifications that are already read, or belong to someone else, are left
/// alone. Returns the number of notifications that changed.
///
/// # Errors
/// Returns an [Error::SqlError] if there is an SQL error.
pub fn mark_notifications_read(
    owner: &UserId,
    ids: &[NotificationId],
    connection: &Connection,
    now: OffsetDateTime,
) -> Result<RowsAffected, Error> {
    let mut statement = connection.prepare(
        "UPDATE notification SET read = 1, last_update = ?1
         WHERE id = ?2 AND owner = ?3 AND read = 0",
    )?;

    let mut rows_affected = 0;
    for id in ids {
        rows_affected += statement.execute((to_millis(now), id, owner))?;
    }

    Ok(rows_affected)
}

/// Edit the text and schedule of notification `id`.
///
/// # Errors
/// Returns an [Error::NotificationNotFound] if `id` does not refer to a live
/// notification.
pub fn update_notification(
    id: NotificationId,
    edit: &NotificationEdit,
    connection: &Connection,
    now: OffsetDateTime,
) -> Result<(), Error> {
    let rows_affected = connection.execute(
        "UPDATE notification SET title = ?1, message = ?2, scheduled_at = ?3, last_update = ?4
         WHERE id = ?5 AND is_deleted = 0",
        (
            &edit.title,
            &edit.message,
            to_millis(edit.scheduled_at),
            to_millis(now),
            id,
        ),
    )?;

    match rows_affected {
        0 => Err(Error::NotificationNotFound(id)),
        _ => Ok(()),
    }
}

/// Mark notification `id` as deleted.
///
/// # Errors
/// Returns an [Error::NotificationNotFound] if `id` does not refer to a live
/// notification.
pub fn delete_notification(
    id: NotificationId,
    connection: &Connection,
    now: OffsetDateTime,
) -> Result<(), Error> {
    let rows_affected = connection.execute(
        "UPDATE notification SET is_deleted = 1, last_update = ?1 WHERE id = ?2 AND is_deleted = 0",
        (to_millis(now), id),
    )?;

    match rows_affected {
        0 => Err(Error::NotificationNotFound(id)),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use rusqlite::Connection;
    use time::macros::datetime;

    use crate::{Error, database_id::new_id, db::initialize, user::UserId};

    use super::{
        NewNotification, NotificationEdit, NotificationKind, create_notification,
        delete_notification, get_notification, get_notifications_since, mark_notifications_read,
        update_notification,
    };

    fn get_test_connection() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        conn
    }

    fn new_notification(owner: &str) -> NewNotification {
        NewNotification::new(
            UserId::new(owner),
            NotificationKind::OverBudget,
            "Over budget",
            "You spent more than planned on groceries.",
            datetime!(2025-03-01 8:00 UTC),
        )
    }

    #[test]
    fn kind_round_trips_through_text() {
        for kind in [
            NotificationKind::Transaction,
            NotificationKind::OverBudget,
            NotificationKind::FinishIncome,
            NotificationKind::Subscription,
        ] {
            assert_eq!(kind.as_str().parse(), Ok(kind));
        }
        assert!("reminder".parse::<NotificationKind>().is_err());
    }

    #[test]
    fn create_then_get() {
        let conn = get_test_connection();
        let reference = new_id();

        let created = create_notification(
            &new_notification("alice").reference(reference),
            &conn,
            datetime!(2025-03-01 8:00 UTC),
        )
        .unwrap();

        assert_eq!(get_notification(created.id, &conn), Ok(created.clone()));
        assert_eq!(created.reference_id, Some(reference));
        assert!(!created.read);
    }

    #[test]
    fn mark_read_is_monotonic_and_owner_scoped() {
        let conn = get_test_connection();
        let alice = UserId::new("alice");
        let mine = create_notification(&new_notification("alice"), &conn, datetime!(2025-03-01 8:00 UTC))
            .unwrap();
        let theirs =
            create_notification(&new_notification("bob"), &conn, datetime!(2025-03-01 8:00 UTC))
                .unwrap();

        let first = mark_notifications_read(
            &alice,
            &[mine.id, theirs.id],
            &conn,
            datetime!(2025-03-02 8:00 UTC),
        );
        let second =
            mark_notifications_read(&alice, &[mine.id], &conn, datetime!(2025-03-03 8:00 UTC));

        assert_eq!(first, Ok(1));
        assert_eq!(second, Ok(0));
        let mine = get_notification(mine.id, &conn).unwrap();
        assert!(mine.read);
        assert_eq!(mine.last_update, datetime!(2025-03-02 8:00 UTC));
        assert!(!get_notification(theirs.id, &conn).unwrap().read);

        update_notification(
            mine.id,
            &NotificationEdit {
                title: "Edited".to_owned(),
                message: String::new(),
                scheduled_at: datetime!(2025-03-04 8:00 UTC),
            },
            &conn,
            datetime!(2025-03-04 8:00 UTC),
        )
        .unwrap();
        assert!(get_notification(mine.id, &conn).unwrap().read);
    }

    #[test]
    fn delete_is_soft_and_final() {
        let conn = get_test_connection();
        let alice = UserId::new("alice");
        let created =
            create_notification(&new_notification("alice"), &conn, datetime!(2025-03-01 8:00 UTC))
                .unwrap();

        delete_notification(created.id, &conn, datetime!(2025-03-02 8:00 UTC)).unwrap();

        assert_eq!(
            delete_notification(created.id, &conn, datetime!(2025-03-03 8:00 UTC)),
            Err(Error::NotificationNotFound(created.id))
        );
        let changed =
            get_notifications_since(&alice, datetime!(2025-03-01 12:00 UTC), &conn).unwrap();
        assert_eq!(changed.len(), 1);
        assert!(changed[0].is_deleted);
    }

    #[test]
    fn get_missing_notification_fails() {
        let conn = get_test_connection();
        let id = new_id();

        assert_eq!(get_notification(id, &conn), Err(Error::NotificationNotFound(id)));
    }
}
