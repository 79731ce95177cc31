//! Bank accounts, credit cards and cash wallets.

use rusqlite::{Connection, Row};
use rust_decimal::Decimal;
use serde::Serialize;
use time::OffsetDateTime;

use crate::{
    Error,
    database_id::{HolderId, new_id},
    db::decimal_from_row,
    holder::core::{Accounts, RowsAffected, delete_holder_in_unit},
    timestamp::{timestamp_from_row, to_millis},
    user::UserId,
};

/// The amount of money available in a bank account or credit card.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Account {
    /// The id for the account.
    pub id: HolderId,
    /// The user that owns the account.
    pub owner: UserId,
    /// The display name of the account.
    pub name: String,
    /// The name of the icon shown next to the account.
    pub icon: String,
    /// The balance. Only the ledger changes this after creation.
    pub balance: Decimal,
    /// When the account was last changed.
    #[serde(with = "time::serde::rfc3339")]
    pub last_update: OffsetDateTime,
    /// Whether the user has deleted the account.
    pub is_deleted: bool,
}

/// The data needed to open a new account.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAccount {
    /// The user that will own the account.
    pub owner: UserId,
    /// The display name.
    pub name: String,
    /// The icon name, empty for none.
    pub icon: String,
    /// The balance the account opens with.
    pub balance: Decimal,
}

impl NewAccount {
    /// Describe a new account with no icon.
    pub fn new(owner: UserId, name: &str, balance: Decimal) -> Self {
        Self {
            owner,
            name: name.to_owned(),
            icon: String::new(),
            balance,
        }
    }

    /// Set the icon for the account.
    pub fn icon(mut self, icon: &str) -> Self {
        self.icon = icon.to_owned();
        self
    }
}

/// Create the account table and its sync index.
pub fn create_account_table(connection: &Connection) -> Result<(), rusqlite::Error> {
    connection.execute(
        "CREATE TABLE IF NOT EXISTS account (
            id BLOB PRIMARY KEY,
            owner TEXT NOT NULL,
            name TEXT NOT NULL,
            icon TEXT NOT NULL,
            balance TEXT NOT NULL,
            last_update INTEGER NOT NULL,
            is_deleted INTEGER NOT NULL DEFAULT 0
        )",
        (),
    )?;

    connection.execute(
        "CREATE INDEX IF NOT EXISTS idx_account_owner_last_update ON account(owner, last_update)",
        (),
    )?;

    Ok(())
}

fn map_row_to_account(row: &Row) -> Result<Account, rusqlite::Error> {
    Ok(Account {
        id: row.get(0)?,
        owner: row.get(1)?,
        name: row.get(2)?,
        icon: row.get(3)?,
        balance: decimal_from_row(row, 4)?,
        last_update: timestamp_from_row(row, 5)?,
        is_deleted: row.get(6)?,
    })
}

const SELECT_ACCOUNT: &str =
    "SELECT id, owner, name, icon, balance, last_update, is_deleted FROM account";

/// Open a new account.
///
/// # Errors
/// Returns an [Error::SqlError] if there is an SQL error.
pub fn create_account(
    account: NewAccount,
    connection: &Connection,
    now: OffsetDateTime,
) -> Result<Account, Error> {
    let account = Account {
        id: new_id(),
        owner: account.owner,
        name: account.name,
        icon: account.icon,
        balance: account.balance,
        last_update: now,
        is_deleted: false,
    };

    connection.execute(
        "INSERT INTO account (id, owner, name, icon, balance, last_update, is_deleted)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
        (
            account.id,
            &account.owner,
            &account.name,
            &account.icon,
            account.balance.to_string(),
            to_millis(now),
        ),
    )?;

    Ok(account)
}

/// Retrieve an account by its `id`, including deleted accounts.
///
/// # Errors
/// Returns an [Error::HolderNotFound] if `id` does not refer to an account.
pub fn get_account(id: HolderId, connection: &Connection) -> Result<Account, Error> {
    connection
        .query_row(
            &format!("{SELECT_ACCOUNT} WHERE id = ?1"),
            [id],
            map_row_to_account,
        )
        .map_err(|error| match error {
            rusqlite::Error::QueryReturnedNoRows => Error::HolderNotFound(id),
            error => error.into(),
        })
}

/// Retrieve the accounts of `owner` that have not been deleted.
///
/// # Errors
/// Returns an [Error::SqlError] if there is an SQL error.
pub fn get_accounts(owner: &UserId, connection: &Connection) -> Result<Vec<Account>, Error> {
    connection
        .prepare(&format!(
            "{SELECT_ACCOUNT} WHERE owner = ?1 AND is_deleted = 0 ORDER BY name"
        ))?
        .query_map([owner], map_row_to_account)?
        .map(|maybe_account| maybe_account.map_err(Error::from))
        .collect()
}

/// Retrieve the accounts of `owner` changed after `since`, most recent first.
///
/// Deleted accounts are included so that clients can drop them.
///
/// # Errors
/// Returns an [Error::SqlError] if there is an SQL error.
pub fn get_accounts_since(
    owner: &UserId,
    since: OffsetDateTime,
    connection: &Connection,
) -> Result<Vec<Account>, Error> {
    connection
        .prepare(&format!(
            "{SELECT_ACCOUNT} WHERE owner = ?1 AND last_update > ?2 ORDER BY last_update DESC"
        ))?
        .query_map((owner, to_millis(since)), map_row_to_account)?
        .map(|maybe_account| maybe_account.map_err(Error::from))
        .collect()
}

/// Rename an account or change its icon. The balance is never touched.
///
/// # Errors
/// Returns an [Error::HolderNotFound] if `id` does not refer to a live account.
pub fn update_account(
    id: HolderId,
    name: &str,
    icon: &str,
    connection: &Connection,
    now: OffsetDateTime,
) -> Result<(), Error> {
    let rows_affected = connection.execute(
        "UPDATE account SET name = ?1, icon = ?2, last_update = ?3
         WHERE id = ?4 AND is_deleted = 0",
        (name, icon, to_millis(now), id),
    )?;

    match rows_affected {
        0 => Err(Error::HolderNotFound(id)),
        _ => Ok(()),
    }
}

/// Mark an account as deleted, along with its transactions and the
/// subscriptions paid from it.
///
/// Deleting a transaction reverses its effect, so the other side of a
/// transfer gets its money back. The account row is kept so that the deleted
/// transactions stay reversible.
///
/// # Errors
/// Returns an [Error::HolderNotFound] if `id` does not refer to a live
/// account, or an [Error::Ledger] if a transaction could not be reversed.
/// Nothing changes on error.
pub fn delete_account(
    id: HolderId,
    connection: &Connection,
    now: OffsetDateTime,
) -> Result<RowsAffected, Error> {
    // Using unchecked_transaction because we only have &Connection from the MutexGuard.
    let unit = connection.unchecked_transaction()?;
    let rows_affected = delete_holder_in_unit(&Accounts, id, &unit, now)?;
    unit.commit()?;

    Ok(rows_affected)
}

/// Get the total balance across the live accounts of `owner`.
///
/// # Errors
/// Returns an [Error::SqlError] if there is an SQL error.
pub fn get_total_account_balance(owner: &UserId, connection: &Connection) -> Result<Decimal, Error> {
    Ok(get_accounts(owner, connection)?
        .iter()
        .map(|account| account.balance)
        .sum())
}

#[cfg(test)]
mod create_table_tests {
    use rusqlite::Connection;

    use super::create_account_table;

    #[test]
    fn sql_is_valid() {
        let connection =
            Connection::open_in_memory().expect("Could not initialise in-memory SQLite database");

        assert_eq!(Ok(()), create_account_table(&connection));
    }
}
