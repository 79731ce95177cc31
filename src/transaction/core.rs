//! Defines the core data models and database queries for transactions.

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
    database_id::{CategoryId, DatabaseId, HolderId, TransactionId, new_id},
    db::decimal_from_row,
    holder::RowsAffected,
    timestamp::{timestamp_from_row, to_millis},
    user::UserId,
};

// ============================================================================
// MODELS
// ============================================================================

/// Which way money moves in a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    /// Money coming into a holder.
    Income,
    /// Money leaving a holder.
    Expense,
    /// Money moved between two of the user's own holders.
    Transfer,
}

impl TransactionKind {
    /// The name stored in the database and sent to clients.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Income => "income",
            TransactionKind::Expense => "expense",
            TransactionKind::Transfer => "transfer",
        }
    }
}

impl Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The name of a transaction kind that is not recognised.
#[derive(Debug, thiserror::Error)]
#[error("{0} is not a valid transaction type")]
pub struct TransactionKindError(String);

impl FromStr for TransactionKind {
    type Err = TransactionKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "income" => Ok(TransactionKind::Income),
            "expense" => Ok(TransactionKind::Expense),
            "transfer" => Ok(TransactionKind::Transfer),
            other => Err(TransactionKindError(other.to_owned())),
        }
    }
}

impl ToSql for TransactionKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for TransactionKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|error| FromSqlError::Other(Box::new(error)))
    }
}

/// An income, expense or transfer recorded in the ledger.
///
/// Transactions are created, edited and deleted only through the
/// [crate::Ledger], which keeps holder balances in step with them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transaction {
    /// The ID of the transaction.
    pub id: TransactionId,
    /// The user that recorded the transaction.
    pub creator: UserId,
    /// The amount of money moved. Never negative.
    pub amount: Decimal,
    /// When the money moved.
    #[serde(with = "time::serde::rfc3339")]
    pub date_time: OffsetDateTime,
    /// Whether the transaction is an income, an expense or a transfer.
    pub kind: TransactionKind,
    /// The holder the money left, if any.
    pub source_holder: Option<HolderId>,
    /// The holder the money arrived in, if any.
    pub destination_holder: Option<HolderId>,
    /// The category of an income or expense.
    pub category: Option<CategoryId>,
    /// A free-form note from the creator.
    pub note: String,
    /// When the transaction was last changed.
    #[serde(with = "time::serde::rfc3339")]
    pub last_update: OffsetDateTime,
    /// Whether the transaction has been deleted.
    pub is_deleted: bool,
}

impl Transaction {
    /// Start describing a new transaction.
    ///
    /// Shortcut for [TransactionBuilder] for discoverability.
    pub fn build(
        creator: UserId,
        kind: TransactionKind,
        amount: Decimal,
        date_time: OffsetDateTime,
    ) -> TransactionBuilder {
        TransactionBuilder {
            creator,
            kind,
            amount,
            date_time,
            source_holder: None,
            destination_holder: None,
            category: None,
            note: String::new(),
        }
    }

    /// The transaction's content, without its identity and bookkeeping fields.
    pub fn to_new_transaction(&self) -> NewTransaction {
        NewTransaction {
            creator: self.creator.clone(),
            amount: self.amount,
            date_time: self.date_time,
            kind: self.kind,
            source_holder: self.source_holder,
            destination_holder: self.destination_holder,
            category: self.category,
            note: self.note.clone(),
        }
    }
}

/// A transaction that has been checked but not yet written to the ledger.
///
/// The ledger trusts these values: callers should build them with
/// [Transaction::build] or make sure the holder/category rules hold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewTransaction {
    /// The user recording the transaction.
    pub creator: UserId,
    /// The amount of money moved. Never negative.
    pub amount: Decimal,
    /// When the money moved.
    #[serde(with = "time::serde::rfc3339")]
    pub date_time: OffsetDateTime,
    /// Whether the transaction is an income, an expense or a transfer.
    pub kind: TransactionKind,
    /// The holder the money leaves, if any.
    pub source_holder: Option<HolderId>,
    /// The holder the money arrives in, if any.
    pub destination_holder: Option<HolderId>,
    /// The category of an income or expense.
    pub category: Option<CategoryId>,
    /// A free-form note.
    pub note: String,
}

/// A builder for creating [NewTransaction] instances.
///
/// # Examples
///
/// ```ignore
/// let transfer = Transaction::build(alice, TransactionKind::Transfer, dec!(40), now)
///     .source(everyday.id)
///     .destination(holiday.id)
///     .note("Saving for Japan")
///     .finalise()?;
/// ```
#[derive(Debug, PartialEq, Clone)]
pub struct TransactionBuilder {
    /// The user recording the transaction.
    pub creator: UserId,
    /// The kind of transaction.
    pub kind: TransactionKind,
    /// The amount of money moved.
    pub amount: Decimal,
    /// When the money moved.
    pub date_time: OffsetDateTime,
    /// The holder the money leaves, if any.
    pub source_holder: Option<HolderId>,
    /// The holder the money arrives in, if any.
    pub destination_holder: Option<HolderId>,
    /// The category, if any.
    pub category: Option<CategoryId>,
    /// A free-form note.
    pub note: String,
}

impl TransactionBuilder {
    /// Set the holder the money leaves.
    pub fn source(mut self, holder: HolderId) -> Self {
        self.source_holder = Some(holder);
        self
    }

    /// Set the holder the money arrives in.
    pub fn destination(mut self, holder: HolderId) -> Self {
        self.destination_holder = Some(holder);
        self
    }

    /// File the transaction under a category.
    pub fn category(mut self, category: CategoryId) -> Self {
        self.category = Some(category);
        self
    }

    /// Attach a note.
    pub fn note(mut self, note: &str) -> Self {
        self.note = note.to_owned();
        self
    }

    /// Check the holder and category rules and produce a [NewTransaction].
    ///
    /// Incomes and expenses touch exactly one holder and need a category.
    /// Transfers touch two distinct holders and have no category.
    ///
    /// # Errors
    /// Returns an [Error::InvalidTransaction] describing the broken rule.
    pub fn finalise(self) -> Result<NewTransaction, Error> {
        if self.amount.is_sign_negative() && !self.amount.is_zero() {
            return Err(Error::InvalidTransaction(format!(
                "the amount {} is negative",
                self.amount
            )));
        }

        match (self.kind, self.source_holder, self.destination_holder) {
            (TransactionKind::Transfer, Some(source), Some(destination)) => {
                if source == destination {
                    return Err(Error::InvalidTransaction(
                        "a transfer needs two different holders".to_owned(),
                    ));
                }

                if self.category.is_some() {
                    return Err(Error::InvalidTransaction(
                        "a transfer cannot have a category".to_owned(),
                    ));
                }
            }
            (TransactionKind::Transfer, _, _) => {
                return Err(Error::InvalidTransaction(
                    "a transfer needs both a source and a destination".to_owned(),
                ));
            }
            (kind, Some(_), None) | (kind, None, Some(_)) => {
                if self.category.is_none() {
                    return Err(Error::InvalidTransaction(format!(
                        "an {kind} needs a category"
                    )));
                }
            }
            (kind, _, _) => {
                return Err(Error::InvalidTransaction(format!(
                    "an {kind} needs exactly one of a source or a destination"
                )));
            }
        }

        Ok(NewTransaction {
            creator: self.creator,
            amount: self.amount,
            date_time: self.date_time,
            kind: self.kind,
            source_holder: self.source_holder,
            destination_holder: self.destination_holder,
            category: self.category,
            note: self.note,
        })
    }
}

// ============================================================================
// DATABASE FUNCTIONS
// ============================================================================

/// Create the transaction table in the database.
///
/// # Errors
/// Returns an error if the table cannot be created or if there is an SQL error.
pub fn create_transaction_table(connection: &Connection) -> Result<(), rusqlite::Error> {
    connection.execute(
        "CREATE TABLE IF NOT EXISTS \"transaction\" (
                id BLOB PRIMARY KEY,
                creator TEXT NOT NULL,
                amount TEXT NOT NULL,
                date_time INTEGER NOT NULL,
                kind TEXT NOT NULL,
                source_holder BLOB,
                destination_holder BLOB,
                category BLOB,
                note TEXT NOT NULL,
                last_update INTEGER NOT NULL,
                is_deleted INTEGER NOT NULL DEFAULT 0
                )",
        (),
    )?;

    // Used by the sync feed.
    connection.execute(
        "CREATE INDEX IF NOT EXISTS idx_transaction_creator_last_update
         ON \"transaction\"(creator, last_update);",
        (),
    )?;

    Ok(())
}

/// Map a database row to a Transaction.
pub fn map_transaction_row(row: &Row) -> Result<Transaction, rusqlite::Error> {
    Ok(Transaction {
        id: row.get(0)?,
        creator: row.get(1)?,
        amount: decimal_from_row(row, 2)?,
        date_time: timestamp_from_row(row, 3)?,
        kind: row.get(4)?,
        source_holder: row.get(5)?,
        destination_holder: row.get(6)?,
        category: row.get(7)?,
        note: row.get(8)?,
        last_update: timestamp_from_row(row, 9)?,
        is_deleted: row.get(10)?,
    })
}

const SELECT_TRANSACTION: &str = "SELECT id, creator, amount, date_time, kind, source_holder, \
     destination_holder, category, note, last_update, is_deleted FROM \"transaction\"";

/// Write a new transaction record. Balances are not touched.
pub(crate) fn insert_transaction_record(
    transaction: &NewTransaction,
    connection: &Connection,
    now: OffsetDateTime,
) -> Result<Transaction, Error> {
    let id = new_id();

    connection.execute(
        "INSERT INTO \"transaction\" (id, creator, amount, date_time, kind, source_holder,
            destination_holder, category, note, last_update, is_deleted)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0)",
        (
            id,
            &transaction.creator,
            transaction.amount.to_string(),
            to_millis(transaction.date_time),
            transaction.kind,
            transaction.source_holder,
            transaction.destination_holder,
            transaction.category,
            &transaction.note,
            to_millis(now),
        ),
    )?;

    get_transaction(id, connection)
}

/// Replace the content of record `id` with `transaction`. Balances are not touched.
pub(crate) fn overwrite_transaction_record(
    id: TransactionId,
    transaction: &NewTransaction,
    connection: &Connection,
    now: OffsetDateTime,
) -> Result<RowsAffected, Error> {
    connection
        .execute(
            "UPDATE \"transaction\" SET creator = ?1, amount = ?2, date_time = ?3, kind = ?4,
                source_holder = ?5, destination_holder = ?6, category = ?7, note = ?8,
                last_update = ?9
             WHERE id = ?10 AND is_deleted = 0",
            (
                &transaction.creator,
                transaction.amount.to_string(),
                to_millis(transaction.date_time),
                transaction.kind,
                transaction.source_holder,
                transaction.destination_holder,
                transaction.category,
                &transaction.note,
                to_millis(now),
                id,
            ),
        )
        .map_err(Error::from)
}

/// Flag record `id` as deleted. Balances are not touched.
pub(crate) fn mark_transaction_deleted(
    id: TransactionId,
    connection: &Connection,
    now: OffsetDateTime,
) -> Result<RowsAffected, Error> {
    connection
        .execute(
            "UPDATE \"transaction\" SET is_deleted = 1, last_update = ?1
             WHERE id = ?2 AND is_deleted = 0",
            (to_millis(now), id),
        )
        .map_err(Error::from)
}

/// Retrieve a transaction from the database by its `id`, including deleted
/// transactions.
///
/// # Errors
/// This function will return a:
/// - [Error::TransactionNotFound] if `id` does not refer to a transaction,
/// - or [Error::SqlError] there is some other SQL error.
pub fn get_transaction(id: TransactionId, connection: &Connection) -> Result<Transaction, Error> {
    connection
        .prepare(&format!("{SELECT_TRANSACTION} WHERE id = :id"))?
        .query_one(&[(":id", &id)], map_transaction_row)
        .map_err(|error| match error {
            rusqlite::Error::QueryReturnedNoRows => Error::TransactionNotFound(id),
            error => error.into(),
        })
}

/// Retrieve a transaction that has not been deleted.
///
/// # Errors
/// Returns an [Error::TransactionNotFound] if `id` does not refer to a live
/// transaction.
pub fn get_live_transaction(
    id: TransactionId,
    connection: &Connection,
) -> Result<Transaction, Error> {
    match get_transaction(id, connection)? {
        transaction if transaction.is_deleted => Err(Error::TransactionNotFound(id)),
        transaction => Ok(transaction),
    }
}

/// Retrieve the transactions of `creator` changed after `since`, most recent
/// first.
///
/// Deleted transactions are included so that clients can drop them.
///
/// # Errors
/// This function will return a [Error::SqlError] there is some SQL error.
pub fn get_transactions_since(
    creator: &UserId,
    since: OffsetDateTime,
    connection: &Connection,
) -> Result<Vec<Transaction>, Error> {
    connection
        .prepare(&format!(
            "{SELECT_TRANSACTION} WHERE creator = ?1 AND last_update > ?2
             ORDER BY last_update DESC"
        ))?
        .query_map((creator, to_millis(since)), map_transaction_row)?
        .map(|maybe_transaction| maybe_transaction.map_err(Error::from))
        .collect()
}

fn select_live_transaction_ids(
    condition: &str,
    id: DatabaseId,
    connection: &Connection,
) -> Result<Vec<TransactionId>, Error> {
    connection
        .prepare(&format!(
            "SELECT id FROM \"transaction\" WHERE is_deleted = 0 AND ({condition})
             ORDER BY date_time"
        ))?
        .query_map([id], |row| row.get(0))?
        .map(|maybe_id| maybe_id.map_err(Error::from))
        .collect()
}

/// The IDs of the live transactions that move money into or out of `holder`.
pub(crate) fn select_live_transactions_for_holder(
    holder: HolderId,
    connection: &Connection,
) -> Result<Vec<TransactionId>, Error> {
    select_live_transaction_ids(
        "source_holder = ?1 OR destination_holder = ?1",
        holder,
        connection,
    )
}

/// The IDs of the live transactions filed under `category`.
pub(crate) fn select_live_transactions_for_category(
    category: CategoryId,
    connection: &Connection,
) -> Result<Vec<TransactionId>, Error> {
    select_live_transaction_ids("category = ?1", category, connection)
}

/// Get the number of live transactions in the database.
///
/// # Errors
/// This function will return a [Error::SqlError] there is some SQL error.
pub fn count_transactions(connection: &Connection) -> Result<u32, Error> {
    connection
        .query_row(
            "SELECT COUNT(id) FROM \"transaction\" WHERE is_deleted = 0;",
            [],
            |row| row.get(0),
        )
        .map_err(|error| error.into())
}

// ============================================================================
// TESTS
// ============================================================================
