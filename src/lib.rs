//! Fintrack is the core of a personal finance tracker.
//!
//! This library keeps account and savings balances consistent with the
//! transaction log, and turns recurring subscriptions into transactions and
//! reminders. Request handling lives outside the library: handlers build
//! validated values such as [NewTransaction] and [NewSubscription] and call
//! the services held in [AppState].

#![warn(missing_docs)]

use std::time::Duration;

use tokio::signal;

mod app_state;
mod broadcast;
mod category;
mod config;
mod database_id;
mod db;
mod holder;
mod logging;
mod notification;
mod poller;
mod subscription;
mod timestamp;
mod transaction;
mod user;

#[cfg(test)]
mod test_utils;

pub use app_state::AppState;
pub use broadcast::{Action, Broadcaster, Collection, Event};
pub use category::{
    Category, CategoryEdit, CategoryKind, CategoryStore, NewCategory, create_category,
    get_categories_since, get_category, update_category,
};
pub use config::Config;
pub use database_id::{
    CategoryId, DatabaseId, HolderId, NotificationId, SubscriptionId, TransactionId,
};
pub use db::{Database, initialize as initialize_db};
pub use holder::{
    Account, HolderKind, NewAccount, NewSaving, Saving, SavingEdit, create_account,
    create_saving, delete_account, delete_saving, get_account, get_accounts, get_accounts_since,
    get_balance, get_saving, get_savings, get_savings_since, get_total_account_balance,
    update_account, update_saving,
};
pub use logging::setup_logging;
pub use notification::{
    NewNotification, Notification, NotificationCoordinator, NotificationEdit, NotificationKind,
    REMINDER_TITLE, ScanReport,
};
pub use poller::{PeriodicTask, Pollers};
pub use subscription::{
    CatchUp, Interval, NewSubscription, Renewal, Scheduler, Subscription, SubscriptionEdit,
    UnknownIntervalError, get_subscription, get_subscriptions_since, step,
};
pub use timestamp::{Clock, ManualClock, SystemClock};
pub use transaction::{
    Ledger, LedgerStep, NewTransaction, Transaction, TransactionBuilder, TransactionKind,
    count_transactions, create_transaction, get_transaction, get_transactions_since,
};
pub use user::UserId;

/// Wait for either the ctrl+c or terminate signal, whichever comes first.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {error}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(error) => {
                tracing::error!("failed to install signal handler: {error}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::debug!("Received ctrl+c signal.");
        },
        _ = terminate => {
            tracing::debug!("Received terminate signal.");
        },
    }
}

/// The broad class of an [Error], for callers that map errors to responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller supplied a value that breaks a domain rule.
    Validation,
    /// A referenced record does not exist.
    NotFound,
    /// The operation lost a race with another writer. Retrying may succeed.
    Conflict,
    /// The database or the runtime failed.
    Dependency,
    /// A stored value cannot be interpreted.
    Configuration,
}

/// The errors that may occur in the application.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum Error {
    /// A transaction breaks the holder and category rules.
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    /// A category has no name or a negative budget.
    #[error("invalid category: {0}")]
    InvalidCategory(String),

    /// A subscription template is not a valid expense.
    #[error("invalid subscription: {0}")]
    InvalidSubscription(String),

    /// Neither an account nor a saving has the ID.
    #[error("no account or saving has the ID {0}")]
    HolderNotFound(HolderId),

    /// The transaction does not exist or has been deleted.
    #[error("the transaction {0} could not be found")]
    TransactionNotFound(TransactionId),

    /// The subscription does not exist or has been deleted.
    #[error("the subscription {0} could not be found")]
    SubscriptionNotFound(SubscriptionId),

    /// The category does not exist or has been deleted.
    #[error("the category {0} could not be found")]
    CategoryNotFound(CategoryId),

    /// The notification does not exist or has been deleted.
    #[error("the notification {0} could not be found")]
    NotificationNotFound(NotificationId),

    /// The requested resource was not found.
    ///
    /// Internally, this error may occur when a query returns no rows.
    #[error("the requested resource could not be found")]
    NotFound,

    /// A step of a ledger operation failed and the whole operation was
    /// rolled back.
    #[error("ledger operation failed while {step}: {source}")]
    Ledger {
        /// The step that failed.
        step: LedgerStep,
        /// Why it failed.
        source: Box<Error>,
    },

    /// Another writer changed the record first.
    #[error("conflicting update: {0}")]
    Conflict(String),

    /// The operation did not finish before its deadline and was rolled back.
    #[error("the operation did not finish within {0:?}")]
    Timeout(Duration),

    /// Could not acquire the database lock
    #[error("could not acquire the database lock")]
    DatabaseLockError,

    /// A blocking database task panicked or was cancelled.
    #[error("a database task failed: {0}")]
    TaskFailed(String),

    /// An unhandled/unexpected SQL error.
    #[error("an unexpected SQL error occurred: {0}")]
    SqlError(rusqlite::Error),

    /// A stored subscription uses an interval the scheduler cannot step.
    #[error("unknown subscription interval \"{0}\"")]
    UnknownInterval(String),

    /// A subscription occurrence falls outside the supported dates.
    #[error("schedule out of range: {0}")]
    ScheduleOutOfRange(String),
}

impl Error {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidTransaction(_)
            | Error::InvalidCategory(_)
            | Error::InvalidSubscription(_) => ErrorKind::Validation,
            Error::HolderNotFound(_)
            | Error::TransactionNotFound(_)
            | Error::SubscriptionNotFound(_)
            | Error::CategoryNotFound(_)
            | Error::NotificationNotFound(_)
            | Error::NotFound => ErrorKind::NotFound,
            Error::Ledger { source, .. } => source.kind(),
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Timeout(_)
            | Error::DatabaseLockError
            | Error::TaskFailed(_)
            | Error::SqlError(_) => ErrorKind::Dependency,
            Error::UnknownInterval(_) | Error::ScheduleOutOfRange(_) => ErrorKind::Configuration,
        }
    }
}

fn unhandled_sql_error(error: rusqlite::Error) -> Error {
    tracing::error!("an unhandled SQL error occurred: {}", error);
    Error::SqlError(error)
}

impl From<rusqlite::Error> for Error {
    fn from(value: rusqlite::Error) -> Self {
        match value {
            rusqlite::Error::SqliteFailure(sql_error, _)
                if matches!(
                    sql_error.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                Error::Conflict(format!("the database is busy: {sql_error}"))
            }
            rusqlite::Error::QueryReturnedNoRows => Error::NotFound,
            rusqlite::Error::FromSqlConversionFailure(index, kind, cause) => {
                match cause.downcast_ref::<UnknownIntervalError>() {
                    Some(UnknownIntervalError(name)) => Error::UnknownInterval(name.clone()),
                    None => unhandled_sql_error(rusqlite::Error::FromSqlConversionFailure(
                        index, kind, cause,
                    )),
                }
            }
            error => unhandled_sql_error(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rusqlite::{Connection, ErrorCode, ffi};

    use crate::{Error, ErrorKind, LedgerStep, database_id::new_id};

    #[test]
    fn ledger_error_reports_kind_of_its_source() {
        let error = Error::Ledger {
            step: LedgerStep::ApplyDestination,
            source: Box::new(Error::HolderNotFound(new_id())),
        };

        assert_eq!(error.kind(), ErrorKind::NotFound);
        assert!(error.to_string().contains("crediting the destination holder"));
    }

    #[test]
    fn busy_database_is_a_conflict() {
        let error: Error = rusqlite::Error::SqliteFailure(
            ffi::Error {
                code: ErrorCode::DatabaseBusy,
                extended_code: ffi::SQLITE_BUSY,
            },
            None,
        )
        .into();

        assert_eq!(error.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn no_rows_is_not_found() {
        let error: Error = rusqlite::Error::QueryReturnedNoRows.into();

        assert_eq!(error, Error::NotFound);
    }

    #[test]
    fn other_conversion_failures_are_sql_errors() {
        let connection = Connection::open_in_memory().unwrap();

        let error: Error = connection
            .query_row("SELECT 'abc'", [], |row| crate::db::decimal_from_row(row, 0))
            .unwrap_err()
            .into();

        assert!(matches!(error, Error::SqlError(_)));
        assert_eq!(error.kind(), ErrorKind::Dependency);
    }

    #[test]
    fn timeout_is_a_dependency_failure() {
        assert_eq!(Error::Timeout(Duration::ZERO).kind(), ErrorKind::Dependency);
    }
}
