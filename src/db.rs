//! The persistence context shared by every service.
//!
//! All services receive a [Database] handle instead of reaching for global
//! connections. Writes that must be all-or-nothing go through
//! [Database::run_unit], which wraps them in a single SQLite transaction.

use std::{
    str::FromStr,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use rusqlite::{Connection, Row, Transaction as SqlTransaction, TransactionBehavior};
use rust_decimal::Decimal;

use crate::{
    Error,
    category::create_category_table,
    holder::{create_account_table, create_saving_table},
    notification::create_notification_table,
    subscription::create_subscription_table,
    transaction::create_transaction_table,
};

/// Create the tables for all the domain models if they do not exist yet.
///
/// # Errors
/// Returns an error if a table cannot be created or if there is an SQL error.
pub fn initialize(connection: &Connection) -> Result<(), Error> {
    let transaction = SqlTransaction::new_unchecked(connection, TransactionBehavior::Exclusive)?;

    create_account_table(&transaction)?;
    create_saving_table(&transaction)?;
    create_category_table(&transaction)?;
    create_transaction_table(&transaction)?;
    create_subscription_table(&transaction)?;
    create_notification_table(&transaction)?;

    transaction.commit()?;

    Ok(())
}

/// A handle to the application database.
///
/// Cloning the handle is cheap, all clones share the same connection.
#[derive(Debug, Clone)]
pub struct Database {
    connection: Arc<Mutex<Connection>>,
}

impl Database {
    /// Wrap `connection` and create the tables for the domain models.
    ///
    /// # Errors
    /// Returns an error if the database cannot be initialized.
    pub fn new(connection: Connection) -> Result<Self, Error> {
        initialize(&connection)?;

        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    /// The shared connection, for callers that manage locking themselves.
    pub fn connection(&self) -> &Arc<Mutex<Connection>> {
        &self.connection
    }

    /// Run `operation` as one atomic unit.
    ///
    /// The unit is an `IMMEDIATE` SQLite transaction, so it is isolated from
    /// every other unit. If `operation` returns an error, or the unit is still
    /// running when `deadline` expires, the transaction is rolled back and
    /// nothing it wrote is kept.
    ///
    /// # Errors
    /// Returns the error from `operation`, [Error::Timeout] if the deadline
    /// expired, [Error::DatabaseLockError] if the connection lock is poisoned
    /// or [Error::SqlError] if the transaction could not be started or
    /// committed.
    pub async fn run_unit<T, F>(&self, deadline: Duration, operation: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&SqlTransaction<'_>) -> Result<T, Error> + Send + 'static,
    {
        let connection = self.connection.clone();
        let expires_at = Instant::now() + deadline;

        tokio::task::spawn_blocking(move || {
            let connection = connection.lock().map_err(|error| {
                tracing::error!("could not acquire database lock: {error}");
                Error::DatabaseLockError
            })?;

            if Instant::now() >= expires_at {
                return Err(Error::Timeout(deadline));
            }

            let unit = SqlTransaction::new_unchecked(&connection, TransactionBehavior::Immediate)?;
            let value = operation(&unit)?;

            if Instant::now() >= expires_at {
                tracing::debug!("rolling back unit that overran its {deadline:?} deadline");
                return Err(Error::Timeout(deadline));
            }

            unit.commit()?;

            Ok(value)
        })
        .await
        .map_err(|error| Error::TaskFailed(error.to_string()))?
    }

    /// Run a read-only `query` against the database.
    ///
    /// # Errors
    /// Returns the error from `query`, [Error::Timeout] if the deadline expired
    /// before the connection became available, or [Error::DatabaseLockError]
    /// if the connection lock is poisoned.
    pub async fn read<T, F>(&self, deadline: Duration, query: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, Error> + Send + 'static,
    {
        let connection = self.connection.clone();
        let expires_at = Instant::now() + deadline;

        tokio::task::spawn_blocking(move || {
            let connection = connection.lock().map_err(|error| {
                tracing::error!("could not acquire database lock: {error}");
                Error::DatabaseLockError
            })?;

            if Instant::now() >= expires_at {
                return Err(Error::Timeout(deadline));
            }

            query(&connection)
        })
        .await
        .map_err(|error| Error::TaskFailed(error.to_string()))?
    }
}

/// Read the decimal stored as text in column `index` of `row`.
pub fn decimal_from_row(row: &Row, index: usize) -> Result<Decimal, rusqlite::Error> {
    let raw: String = row.get(index)?;

    Decimal::from_str(&raw).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(error))
    })
}
