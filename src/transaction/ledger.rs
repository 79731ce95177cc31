//! The ledger: atomic create, update and delete of transactions with the
//! matching balance adjustments.
//!
//! Every operation runs as one unit. Either the record and all the balance
//! adjustments are written, or none of them are.

use std::{fmt::Display, sync::Arc, time::Duration};

use rusqlite::Connection;
use rust_decimal::Decimal;
use time::OffsetDateTime;

use crate::{
    Error,
    broadcast::{Action, Broadcaster, Collection},
    database_id::{HolderId, TransactionId},
    db::Database,
    holder::adjust_balance,
    timestamp::Clock,
    transaction::core::{
        NewTransaction, Transaction, get_live_transaction, get_transaction,
        get_transactions_since, insert_transaction_record, mark_transaction_deleted,
        overwrite_transaction_record,
    },
    user::UserId,
};

/// The step of a ledger operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerStep {
    /// Writing a new transaction record.
    InsertRecord,
    /// Refunding the source holder of the old record.
    ReverseSource,
    /// Debiting the destination holder of the old record.
    ReverseDestination,
    /// Debiting the source holder.
    ApplySource,
    /// Crediting the destination holder.
    ApplyDestination,
    /// Overwriting an existing transaction record.
    WriteRecord,
    /// Flagging the transaction as deleted.
    MarkDeleted,
}

impl Display for LedgerStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let description = match self {
            LedgerStep::InsertRecord => "inserting the transaction record",
            LedgerStep::ReverseSource => "refunding the old source holder",
            LedgerStep::ReverseDestination => "debiting the old destination holder",
            LedgerStep::ApplySource => "debiting the source holder",
            LedgerStep::ApplyDestination => "crediting the destination holder",
            LedgerStep::WriteRecord => "overwriting the transaction record",
            LedgerStep::MarkDeleted => "marking the transaction as deleted",
        };

        f.write_str(description)
    }
}

fn run_step<T>(step: LedgerStep, operation: impl FnOnce() -> Result<T, Error>) -> Result<T, Error> {
    operation().map_err(|source| Error::Ledger {
        step,
        source: Box::new(source),
    })
}

fn adjust_leg(
    unit: &Connection,
    step: LedgerStep,
    holder: Option<HolderId>,
    delta: Decimal,
    now: OffsetDateTime,
) -> Result<(), Error> {
    match holder {
        Some(holder) => run_step(step, || adjust_balance(unit, holder, delta, now)).map(|_| ()),
        None => Ok(()),
    }
}

/// Move `amount` from `source` to `destination`.
fn apply_effect(
    unit: &Connection,
    source: Option<HolderId>,
    destination: Option<HolderId>,
    amount: Decimal,
    now: OffsetDateTime,
) -> Result<(), Error> {
    adjust_leg(unit, LedgerStep::ApplySource, source, -amount, now)?;
    adjust_leg(unit, LedgerStep::ApplyDestination, destination, amount, now)
}

/// Undo the balance effect of `transaction`.
fn reverse_effect(
    unit: &Connection,
    transaction: &Transaction,
    now: OffsetDateTime,
) -> Result<(), Error> {
    adjust_leg(
        unit,
        LedgerStep::ReverseSource,
        transaction.source_holder,
        transaction.amount,
        now,
    )?;
    adjust_leg(
        unit,
        LedgerStep::ReverseDestination,
        transaction.destination_holder,
        -transaction.amount,
        now,
    )
}

/// Record `transaction` and apply its balance effect inside `unit`.
pub(crate) fn create_in_unit(
    unit: &Connection,
    transaction: &NewTransaction,
    now: OffsetDateTime,
) -> Result<Transaction, Error> {
    let record = run_step(LedgerStep::InsertRecord, || {
        insert_transaction_record(transaction, unit, now)
    })?;

    apply_effect(
        unit,
        transaction.source_holder,
        transaction.destination_holder,
        transaction.amount,
        now,
    )?;

    Ok(record)
}

/// Reverse the old effect of `id`, apply the effect of `transaction` and
/// overwrite the record, inside `unit`.
pub(crate) fn update_in_unit(
    unit: &Connection,
    id: TransactionId,
    transaction: &NewTransaction,
    now: OffsetDateTime,
) -> Result<Transaction, Error> {
    let old = get_live_transaction(id, unit)?;

    reverse_effect(unit, &old, now)?;
    apply_effect(
        unit,
        transaction.source_holder,
        transaction.destination_holder,
        transaction.amount,
        now,
    )?;

    run_step(LedgerStep::WriteRecord, || {
        match overwrite_transaction_record(id, transaction, unit, now)? {
            0 => Err(Error::TransactionNotFound(id)),
            _ => Ok(()),
        }
    })?;

    get_transaction(id, unit)
}

/// Reverse the effect of `id` and flag it as deleted, inside `unit`.
pub(crate) fn delete_in_unit(
    unit: &Connection,
    id: TransactionId,
    now: OffsetDateTime,
) -> Result<Transaction, Error> {
    let old = get_live_transaction(id, unit)?;

    reverse_effect(unit, &old, now)?;

    run_step(LedgerStep::MarkDeleted, || {
        match mark_transaction_deleted(id, unit, now)? {
            0 => Err(Error::TransactionNotFound(id)),
            _ => Ok(()),
        }
    })?;

    get_transaction(id, unit)
}

/// Create a transaction and apply its balance effect in one SQLite transaction.
///
/// This is the synchronous form of [Ledger::create_silent] for callers that
/// already hold the connection.
///
/// # Errors
/// Returns an [Error::Ledger] naming the step that failed. Nothing is written
/// on error.
pub fn create_transaction(
    transaction: &NewTransaction,
    connection: &Connection,
    now: OffsetDateTime,
) -> Result<Transaction, Error> {
    // Using unchecked_transaction because we only have &Connection from the MutexGuard.
    let unit = connection.unchecked_transaction()?;
    let created = create_in_unit(&unit, transaction, now)?;
    unit.commit()?;

    Ok(created)
}

/// Keeps transaction records and holder balances consistent.
#[derive(Debug, Clone)]
pub struct Ledger {
    database: Database,
    broadcaster: Broadcaster,
    clock: Arc<dyn Clock>,
    deadline: Duration,
}

impl Ledger {
    /// Create a ledger whose operations must finish within `deadline`.
    pub fn new(
        database: Database,
        broadcaster: Broadcaster,
        clock: Arc<dyn Clock>,
        deadline: Duration,
    ) -> Self {
        Self {
            database,
            broadcaster,
            clock,
            deadline,
        }
    }

    /// Record a transaction, move the money and tell the creator's clients.
    ///
    /// # Errors
    /// Returns an [Error::Ledger] naming the failed step, or an
    /// [Error::Timeout]. Nothing is written on error.
    pub async fn create(&self, transaction: NewTransaction) -> Result<TransactionId, Error> {
        let created = self.create_unit(transaction).await?;

        self.broadcaster.send(
            &created.creator,
            Collection::Transactions,
            Action::Create,
            &created,
        );

        Ok(created.id)
    }

    /// Same as [Ledger::create] without telling any clients.
    ///
    /// Used for transactions generated by the scheduler.
    ///
    /// # Errors
    /// See [Ledger::create].
    pub async fn create_silent(&self, transaction: NewTransaction) -> Result<TransactionId, Error> {
        self.create_unit(transaction).await.map(|created| created.id)
    }

    async fn create_unit(&self, transaction: NewTransaction) -> Result<Transaction, Error> {
        let now = self.clock.now();

        let created = self
            .database
            .run_unit(self.deadline, move |unit| {
                create_in_unit(unit, &transaction, now)
            })
            .await?;

        tracing::debug!("created transaction {}", created.id);

        Ok(created)
    }

    /// Replace transaction `id` with `transaction`, reversing the old balance
    /// effect before applying the new one.
    ///
    /// # Errors
    /// Returns an [Error::TransactionNotFound] if `id` is missing or deleted,
    /// an [Error::Ledger] naming the failed step, or an [Error::Timeout].
    /// The original transaction and balances are untouched on error.
    pub async fn update(
        &self,
        id: TransactionId,
        transaction: NewTransaction,
    ) -> Result<TransactionId, Error> {
        let now = self.clock.now();

        let updated = self
            .database
            .run_unit(self.deadline, move |unit| {
                update_in_unit(unit, id, &transaction, now)
            })
            .await?;

        tracing::debug!("updated transaction {id}");
        self.broadcaster.send(
            &updated.creator,
            Collection::Transactions,
            Action::Update,
            &updated,
        );

        Ok(updated.id)
    }

    /// Reverse the balance effect of transaction `id` and mark it deleted.
    ///
    /// # Errors
    /// Returns an [Error::TransactionNotFound] if `id` is missing or already
    /// deleted, an [Error::Ledger] naming the failed step, or an
    /// [Error::Timeout]. Nothing changes on error.
    pub async fn delete(&self, id: TransactionId) -> Result<TransactionId, Error> {
        let now = self.clock.now();

        let deleted = self
            .database
            .run_unit(self.deadline, move |unit| delete_in_unit(unit, id, now))
            .await?;

        tracing::debug!("deleted transaction {id}");
        self.broadcaster.send(
            &deleted.creator,
            Collection::Transactions,
            Action::Delete,
            id,
        );

        Ok(id)
    }

    /// Retrieve transaction `id`, including deleted transactions.
    ///
    /// # Errors
    /// Returns an [Error::TransactionNotFound] if `id` does not exist.
    pub async fn get(&self, id: TransactionId) -> Result<Transaction, Error> {
        self.database
            .read(self.deadline, move |connection| get_transaction(id, connection))
            .await
    }

    /// Retrieve the transactions of `creator` changed after `since`, most
    /// recent first.
    ///
    /// # Errors
    /// Returns an [Error::SqlError] if there is an SQL error.
    pub async fn get_since(
        &self,
        creator: UserId,
        since: OffsetDateTime,
    ) -> Result<Vec<Transaction>, Error> {
        self.database
            .read(self.deadline, move |connection| {
                get_transactions_since(&creator, since, connection)
            })
            .await
    }
}

#[cfg(test)]
mod ledger_tests {
    use std::time::Duration;

    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use time::macros::datetime;

    use crate::{
        Error, ErrorKind,
        broadcast::{Action, Collection},
        database_id::{HolderId, new_id},
        test_utils::{TestContext, balance_of},
        transaction::{NewTransaction, Transaction, TransactionKind, count_transactions},
        user::UserId,
    };

    use super::{LedgerStep, create_transaction};

    fn transfer(source: HolderId, destination: HolderId, amount: Decimal) -> NewTransaction {
        Transaction::build(
            UserId::new("alice"),
            TransactionKind::Transfer,
            amount,
            datetime!(2025-07-01 10:00 UTC),
        )
        .source(source)
        .destination(destination)
        .finalise()
        .unwrap()
    }

    fn expense(source: HolderId, amount: Decimal) -> NewTransaction {
        Transaction::build(
            UserId::new("alice"),
            TransactionKind::Expense,
            amount,
            datetime!(2025-07-01 10:00 UTC),
        )
        .source(source)
        .category(new_id())
        .finalise()
        .unwrap()
    }

    #[tokio::test]
    async fn transfer_update_delete_scenario() {
        let context = TestContext::new();
        let a = context.account("A", dec!(100));
        let b = context.account("B", dec!(0));

        let id = context.ledger.create(transfer(a, b, dec!(40))).await.unwrap();
        assert_eq!(balance_of(&context.database, a), dec!(60));
        assert_eq!(balance_of(&context.database, b), dec!(40));

        context.ledger.update(id, transfer(a, b, dec!(10))).await.unwrap();
        assert_eq!(balance_of(&context.database, a), dec!(90));
        assert_eq!(balance_of(&context.database, b), dec!(10));

        context.ledger.delete(id).await.unwrap();
        assert_eq!(balance_of(&context.database, a), dec!(100));
        assert_eq!(balance_of(&context.database, b), dec!(0));
        assert!(context.ledger.get(id).await.unwrap().is_deleted);
    }

    #[tokio::test]
    async fn failed_second_leg_rolls_back_everything() {
        let context = TestContext::new();
        let a = context.account("A", dec!(100));
        let missing = new_id();

        let result = context.ledger.create(transfer(a, missing, dec!(40))).await;

        match result {
            Err(Error::Ledger { step, source }) => {
                assert_eq!(step, LedgerStep::ApplyDestination);
                assert_eq!(*source, Error::HolderNotFound(missing));
            }
            other => panic!("Unexpected result: {other:?}"),
        }
        assert_eq!(balance_of(&context.database, a), dec!(100));
        let connection = context.database.connection().lock().unwrap();
        assert_eq!(count_transactions(&connection), Ok(0));
    }

    #[tokio::test]
    async fn failed_update_leaves_original_untouched() {
        let context = TestContext::new();
        let a = context.account("A", dec!(100));
        let b = context.account("B", dec!(0));
        let id = context.ledger.create(transfer(a, b, dec!(40))).await.unwrap();
        let before = context.ledger.get(id).await.unwrap();

        let result = context.ledger.update(id, transfer(a, new_id(), dec!(5))).await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(context.ledger.get(id).await.unwrap(), before);
        assert_eq!(balance_of(&context.database, a), dec!(60));
        assert_eq!(balance_of(&context.database, b), dec!(40));
    }

    #[tokio::test]
    async fn update_can_move_transaction_to_other_holders() {
        let context = TestContext::new();
        let a = context.account("A", dec!(100));
        let b = context.account("B", dec!(100));
        let saving = context.saving("Holiday", dec!(0));
        let id = context.ledger.create(expense(a, dec!(30))).await.unwrap();

        context.ledger.update(id, transfer(b, saving, dec!(25))).await.unwrap();

        assert_eq!(balance_of(&context.database, a), dec!(100));
        assert_eq!(balance_of(&context.database, b), dec!(75));
        assert_eq!(balance_of(&context.database, saving), dec!(25));
    }

    #[tokio::test]
    async fn second_delete_does_not_double_reverse() {
        let context = TestContext::new();
        let a = context.account("A", dec!(100));
        let id = context.ledger.create(expense(a, dec!(30))).await.unwrap();
        context.ledger.delete(id).await.unwrap();

        let result = context.ledger.delete(id).await;

        assert_eq!(result, Err(Error::TransactionNotFound(id)));
        assert_eq!(balance_of(&context.database, a), dec!(100));
    }

    #[tokio::test]
    async fn update_of_missing_transaction_fails() {
        let context = TestContext::new();
        let a = context.account("A", dec!(100));
        let id = new_id();

        let result = context.ledger.update(id, expense(a, dec!(1))).await;

        assert_eq!(result, Err(Error::TransactionNotFound(id)));
        assert_eq!(balance_of(&context.database, a), dec!(100));
    }

    #[tokio::test]
    async fn balances_are_conserved_across_edits() {
        let context = TestContext::new();
        let a = context.account("A", dec!(500));
        let b = context.account("B", dec!(500));
        let mut live = Vec::new();

        for amount in [dec!(10), dec!(20.5), dec!(33.25), dec!(7)] {
            live.push(context.ledger.create(transfer(a, b, amount)).await.unwrap());
        }
        context.ledger.update(live[1], transfer(b, a, dec!(1))).await.unwrap();
        context.ledger.delete(live[2]).await.unwrap();

        // Remaining: 10 and 7 from A to B, and 1 from B to A.
        assert_eq!(balance_of(&context.database, a), dec!(484));
        assert_eq!(balance_of(&context.database, b), dec!(516));
        assert_eq!(
            balance_of(&context.database, a) + balance_of(&context.database, b),
            dec!(1000)
        );
    }

    #[tokio::test]
    async fn create_broadcasts_but_silent_create_does_not() {
        let context = TestContext::new();
        let a = context.account("A", dec!(100));
        let mut events = context.broadcaster.subscribe();

        context.ledger.create_silent(expense(a, dec!(1))).await.unwrap();
        assert!(events.try_recv().is_err());

        let id = context.ledger.create(expense(a, dec!(1))).await.unwrap();
        let event = events.try_recv().unwrap();
        assert_eq!(event.collection, Collection::Transactions);
        assert_eq!(event.action, Action::Create);
        assert_eq!(event.owner, UserId::new("alice"));
        assert_eq!(event.detail["id"], serde_json::json!(id));
    }

    #[tokio::test]
    async fn timed_out_create_writes_nothing() {
        let context = TestContext::with_deadline(Duration::ZERO);
        let a = context.account("A", dec!(100));

        let result = context.ledger.create(expense(a, dec!(1))).await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Dependency);
        assert_eq!(balance_of(&context.database, a), dec!(100));
    }

    #[test]
    fn synchronous_create_applies_both_legs() {
        let context = TestContext::new();
        let a = context.account("A", dec!(100));
        let b = context.saving("B", dec!(0));
        let connection = context.database.connection().lock().unwrap();

        let created =
            create_transaction(&transfer(a, b, dec!(12.34)), &connection, context.now()).unwrap();

        assert_eq!(created.amount, dec!(12.34));
        drop(connection);
        assert_eq!(balance_of(&context.database, a), dec!(87.66));
        assert_eq!(balance_of(&context.database, b), dec!(12.34));
    }
}
