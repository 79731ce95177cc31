//! Savings goals: money set aside towards a target amount.

use rusqlite::{Connection, Row};
use rust_decimal::Decimal;
use serde::Serialize;
use time::OffsetDateTime;

use crate::{
    Error,
    database_id::{HolderId, new_id},
    db::decimal_from_row,
    holder::core::{RowsAffected, Savings, delete_holder_in_unit},
    timestamp::{optional_timestamp_from_row, timestamp_from_row, to_millis, to_millis_or_none},
    user::UserId,
};

/// A savings goal. It holds a balance just like an account.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Saving {
    /// The ID of the saving.
    pub id: HolderId,
    /// The user that owns the saving.
    pub owner: UserId,
    /// The display name of the saving.
    pub name: String,
    /// The name of the icon shown next to the saving.
    pub icon: String,
    /// The amount saved so far. Only the ledger changes this after creation.
    pub balance: Decimal,
    /// The amount the user wants to save.
    pub goal: Decimal,
    /// When the user wants to reach the goal, if they set a date.
    #[serde(with = "time::serde::rfc3339::option")]
    pub goal_date: Option<OffsetDateTime>,
    /// When the saving was created.
    #[serde(with = "time::serde::rfc3339")]
    pub created_date: OffsetDateTime,
    /// When the saving was last changed.
    #[serde(with = "time::serde::rfc3339")]
    pub last_update: OffsetDateTime,
    /// Whether the user has deleted the saving.
    pub is_deleted: bool,
}

impl Saving {
    /// The fraction of the goal reached so far, or `None` if there is no goal.
    pub fn progress(&self) -> Option<Decimal> {
        if self.goal.is_zero() {
            None
        } else {
            Some(self.balance / self.goal)
        }
    }
}

/// The data needed to start a new savings goal.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSaving {
    /// The user that will own the saving.
    pub owner: UserId,
    /// The display name.
    pub name: String,
    /// The icon name, empty for none.
    pub icon: String,
    /// The amount already saved.
    pub balance: Decimal,
    /// The amount to save, zero for none.
    pub goal: Decimal,
    /// When the user wants to reach the goal.
    pub goal_date: Option<OffsetDateTime>,
}

impl NewSaving {
    /// Describe a new saving with no icon or goal date.
    pub fn new(owner: UserId, name: &str, balance: Decimal, goal: Decimal) -> Self {
        Self {
            owner,
            name: name.to_owned(),
            icon: String::new(),
            balance,
            goal,
            goal_date: None,
        }
    }

    /// Set the icon for the saving.
    pub fn icon(mut self, icon: &str) -> Self {
        self.icon = icon.to_owned();
        self
    }

    /// Set the date the user wants to reach the goal by.
    pub fn goal_date(mut self, goal_date: OffsetDateTime) -> Self {
        self.goal_date = Some(goal_date);
        self
    }
}

/// Create the saving table and its sync index.
pub fn create_saving_table(connection: &Connection) -> Result<(), rusqlite::Error> {
    connection.execute(
        "CREATE TABLE IF NOT EXISTS saving (
            id BLOB PRIMARY KEY,
            owner TEXT NOT NULL,
            name TEXT NOT NULL,
            icon TEXT NOT NULL,
            balance TEXT NOT NULL,
            goal TEXT NOT NULL,
            goal_date INTEGER NOT NULL,
            created_date INTEGER NOT NULL,
            last_update INTEGER NOT NULL,
            is_deleted INTEGER NOT NULL DEFAULT 0
        )",
        (),
    )?;

    connection.execute(
        "CREATE INDEX IF NOT EXISTS idx_saving_owner_last_update ON saving(owner, last_update)",
        (),
    )?;

    Ok(())
}

fn map_row_to_saving(row: &Row) -> Result<Saving, rusqlite::Error> {
    Ok(Saving {
        id: row.get(0)?,
        owner: row.get(1)?,
        name: row.get(2)?,
        icon: row.get(3)?,
        balance: decimal_from_row(row, 4)?,
        goal: decimal_from_row(row, 5)?,
        goal_date: optional_timestamp_from_row(row, 6)?,
        created_date: timestamp_from_row(row, 7)?,
        last_update: timestamp_from_row(row, 8)?,
        is_deleted: row.get(9)?,
    })
}

const SELECT_SAVING: &str = "SELECT id, owner, name, icon, balance, goal, goal_date, \
     created_date, last_update, is_deleted FROM saving";

/// Start a new savings goal.
///
/// # Errors
/// Returns an [Error::SqlError] if there is an SQL error.
pub fn create_saving(
    saving: NewSaving,
    connection: &Connection,
    now: OffsetDateTime,
) -> Result<Saving, Error> {
    let saving = Saving {
        id: new_id(),
        owner: saving.owner,
        name: saving.name,
        icon: saving.icon,
        balance: saving.balance,
        goal: saving.goal,
        goal_date: saving.goal_date,
        created_date: now,
        last_update: now,
        is_deleted: false,
    };

    connection.execute(
        "INSERT INTO saving
            (id, owner, name, icon, balance, goal, goal_date, created_date, last_update, is_deleted)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0)",
        (
            saving.id,
            &saving.owner,
            &saving.name,
            &saving.icon,
            saving.balance.to_string(),
            saving.goal.to_string(),
            to_millis_or_none(saving.goal_date),
            to_millis(now),
            to_millis(now),
        ),
    )?;

    Ok(saving)
}

/// Retrieve a saving by its `id`, including deleted savings.
///
/// # Errors
/// Returns an [Error::HolderNotFound] if `id` does not refer to a saving.
pub fn get_saving(id: HolderId, connection: &Connection) -> Result<Saving, Error> {
    connection
        .query_row(&format!("{SELECT_SAVING} WHERE id = ?1"), [id], map_row_to_saving)
        .map_err(|error| match error {
            rusqlite::Error::QueryReturnedNoRows => Error::HolderNotFound(id),
            error => error.into(),
        })
}

/// Retrieve the savings of `owner` that have not been deleted.
///
/// # Errors
/// Returns an [Error::SqlError] if there is an SQL error.
pub fn get_savings(owner: &UserId, connection: &Connection) -> Result<Vec<Saving>, Error> {
    connection
        .prepare(&format!(
            "{SELECT_SAVING} WHERE owner = ?1 AND is_deleted = 0 ORDER BY name"
        ))?
        .query_map([owner], map_row_to_saving)?
        .map(|maybe_saving| maybe_saving.map_err(Error::from))
        .collect()
}

/// Retrieve the savings of `owner` changed after `since`, most recent first.
///
/// # Errors
/// Returns an [Error::SqlError] if there is an SQL error.
pub fn get_savings_since(
    owner: &UserId,
    since: OffsetDateTime,
    connection: &Connection,
) -> Result<Vec<Saving>, Error> {
    connection
        .prepare(&format!(
            "{SELECT_SAVING} WHERE owner = ?1 AND last_update > ?2 ORDER BY last_update DESC"
        ))?
        .query_map((owner, to_millis(since)), map_row_to_saving)?
        .map(|maybe_saving| maybe_saving.map_err(Error::from))
        .collect()
}

/// The user-editable parts of a saving.
#[derive(Debug, Clone, PartialEq)]
pub struct SavingEdit {
    /// The new display name.
    pub name: String,
    /// The new icon name.
    pub icon: String,
    /// The new goal.
    pub goal: Decimal,
    /// The new goal date, `None` to clear it.
    pub goal_date: Option<OffsetDateTime>,
}

/// Edit a saving. The balance is never touched.
///
/// # Errors
/// Returns an [Error::HolderNotFound] if `id` does not refer to a live saving.
pub fn update_saving(
    id: HolderId,
    edit: &SavingEdit,
    connection: &Connection,
    now: OffsetDateTime,
) -> Result<(), Error> {
    let rows_affected = connection.execute(
        "UPDATE saving SET name = ?1, icon = ?2, goal = ?3, goal_date = ?4, last_update = ?5
         WHERE id = ?6 AND is_deleted = 0",
        (
            &edit.name,
            &edit.icon,
            edit.goal.to_string(),
            to_millis_or_none(edit.goal_date),
            to_millis(now),
            id,
        ),
    )?;

    match rows_affected {
        0 => Err(Error::HolderNotFound(id)),
        _ => Ok(()),
    }
}

/// Mark a saving as deleted, along with its transactions and the
/// subscriptions paid from it.
///
/// See [crate::delete_account] for how the transactions are reversed.
///
/// # Errors
/// Returns an [Error::HolderNotFound] if `id` does not refer to a live
/// saving, or an [Error::Ledger] if a transaction could not be reversed.
/// Nothing changes on error.
pub fn delete_saving(
    id: HolderId,
    connection: &Connection,
    now: OffsetDateTime,
) -> Result<RowsAffected, Error> {
    // Using unchecked_transaction because we only have &Connection from the MutexGuard.
    let unit = connection.unchecked_transaction()?;
    let rows_affected = delete_holder_in_unit(&Savings, id, &unit, now)?;
    unit.commit()?;

    Ok(rows_affected)
}
