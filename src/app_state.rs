//! Implements a struct that holds the services shared by the application.

use std::sync::Arc;

use rusqlite::Connection;

use crate::{
    Error,
    broadcast::Broadcaster,
    category::CategoryStore,
    config::Config,
    db::Database,
    notification::NotificationCoordinator,
    poller::Pollers,
    subscription::Scheduler,
    timestamp::{Clock, SystemClock},
    transaction::Ledger,
};

/// The state of the application: the database and every service built on it.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The database handle shared by the services.
    pub database: Database,

    /// Publishes changes to connected clients.
    pub broadcaster: Broadcaster,

    /// Where the services read the current time from.
    pub clock: Arc<dyn Clock>,

    /// The deadlines and poll period the services run with.
    pub config: Config,

    /// Creates, edits and deletes transactions.
    pub ledger: Ledger,

    /// Creates, edits and deletes categories.
    pub categories: CategoryStore,

    /// Creates, edits and renews subscriptions.
    pub scheduler: Scheduler,

    /// Sends reminders, materializes due occurrences and manages notifications.
    pub coordinator: NotificationCoordinator,
}

impl AppState {
    /// Create a new [AppState] with a SQLite database connection and the wall
    /// clock.
    ///
    /// This function will initialize the database by adding the tables for the
    /// domain models.
    ///
    /// # Errors
    /// Returns an error if the database cannot be initialized.
    pub fn new(db_connection: Connection, config: Config) -> Result<Self, Error> {
        Self::with_clock(db_connection, config, Arc::new(SystemClock))
    }

    /// Same as [AppState::new], reading the current time from `clock`.
    ///
    /// # Errors
    /// Returns an error if the database cannot be initialized.
    pub fn with_clock(
        db_connection: Connection,
        config: Config,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, Error> {
        let database = Database::new(db_connection)?;
        let broadcaster = Broadcaster::default();

        Ok(Self {
            ledger: Ledger::new(
                database.clone(),
                broadcaster.clone(),
                clock.clone(),
                config.request_deadline,
            ),
            categories: CategoryStore::new(
                database.clone(),
                broadcaster.clone(),
                clock.clone(),
                config.request_deadline,
            ),
            scheduler: Scheduler::new(
                database.clone(),
                broadcaster.clone(),
                clock.clone(),
                config.request_deadline,
            ),
            coordinator: NotificationCoordinator::new(
                database.clone(),
                broadcaster.clone(),
                clock.clone(),
                config.request_deadline,
                config.batch_deadline,
            ),
            database,
            broadcaster,
            clock,
            config,
        })
    }

    /// Start the occurrence and reminder pollers with the configured period.
    pub fn start_pollers(&self) -> Pollers {
        Pollers::start(self.coordinator.clone(), self.config.poll_period)
    }
}
