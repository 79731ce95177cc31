//! Shared fixtures for the unit tests.

use std::{sync::Arc, time::Duration};

use rusqlite::Connection;
use rust_decimal::Decimal;
use time::{OffsetDateTime, macros::datetime};

use crate::{
    broadcast::Broadcaster,
    category::CategoryStore,
    config::DEFAULT_REQUEST_DEADLINE,
    database_id::HolderId,
    db::Database,
    holder::{NewAccount, NewSaving, create_account, create_saving, get_balance},
    notification::NotificationCoordinator,
    subscription::Scheduler,
    timestamp::{Clock, ManualClock},
    transaction::Ledger,
    user::UserId,
};

/// The time the test clock starts at.
pub(crate) const TEST_NOW: OffsetDateTime = datetime!(2025-06-01 12:00 UTC);

/// An in-memory database with every service wired to a manual clock.
pub(crate) struct TestContext {
    pub database: Database,
    pub broadcaster: Broadcaster,
    pub clock: ManualClock,
    pub ledger: Ledger,
    pub categories: CategoryStore,
    pub scheduler: Scheduler,
    pub coordinator: NotificationCoordinator,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_deadlines(DEFAULT_REQUEST_DEADLINE, DEFAULT_REQUEST_DEADLINE)
    }

    /// Use `deadline` for every operation, including scans.
    pub fn with_deadline(deadline: Duration) -> Self {
        Self::with_deadlines(deadline, deadline)
    }

    /// Use `deadline` for scans only.
    pub fn with_batch_deadline(deadline: Duration) -> Self {
        Self::with_deadlines(DEFAULT_REQUEST_DEADLINE, deadline)
    }

    fn with_deadlines(request_deadline: Duration, batch_deadline: Duration) -> Self {
        let database = Database::new(Connection::open_in_memory().unwrap()).unwrap();
        let broadcaster = Broadcaster::default();
        let clock = ManualClock::new(TEST_NOW);
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());

        Self {
            ledger: Ledger::new(
                database.clone(),
                broadcaster.clone(),
                shared_clock.clone(),
                request_deadline,
            ),
            categories: CategoryStore::new(
                database.clone(),
                broadcaster.clone(),
                shared_clock.clone(),
                request_deadline,
            ),
            scheduler: Scheduler::new(
                database.clone(),
                broadcaster.clone(),
                shared_clock.clone(),
                request_deadline,
            ),
            coordinator: NotificationCoordinator::new(
                database.clone(),
                broadcaster.clone(),
                shared_clock,
                request_deadline,
                batch_deadline,
            ),
            database,
            broadcaster,
            clock,
        }
    }

    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    /// Create an account owned by "alice".
    pub fn account(&self, name: &str, balance: Decimal) -> HolderId {
        let connection = self.database.connection().lock().unwrap();

        create_account(
            NewAccount::new(UserId::new("alice"), name, balance),
            &connection,
            self.now(),
        )
        .unwrap()
        .id
    }

    /// Create a saving owned by "alice" without a goal.
    pub fn saving(&self, name: &str, balance: Decimal) -> HolderId {
        let connection = self.database.connection().lock().unwrap();

        create_saving(
            NewSaving::new(UserId::new("alice"), name, balance, Decimal::ZERO),
            &connection,
            self.now(),
        )
        .unwrap()
        .id
    }
}

pub(crate) fn balance_of(database: &Database, id: HolderId) -> Decimal {
    let connection = database.connection().lock().unwrap();

    get_balance(&connection, id).unwrap()
}
