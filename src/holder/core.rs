//! The balance adjustment primitive shared by accounts and savings.

use std::fmt::Display;

use rusqlite::{Connection, OptionalExtension};
use rust_decimal::Decimal;
use time::OffsetDateTime;

use crate::{
    Error,
    database_id::HolderId,
    db::decimal_from_row,
    subscription::mark_subscriptions_deleted_for_holder,
    timestamp::to_millis,
    transaction::{delete_in_unit, select_live_transactions_for_holder},
};

/// The number of rows changed by a write.
pub type RowsAffected = usize;

/// The concrete kinds of balance holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HolderKind {
    /// A bank account, credit card or wallet.
    Account,
    /// A savings goal.
    Saving,
}

impl Display for HolderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HolderKind::Account => write!(f, "account"),
            HolderKind::Saving => write!(f, "saving"),
        }
    }
}

/// A collection of records that hold a balance.
///
/// Only the ledger may call [BalanceHolder::adjust_balance], and only from
/// inside one of its atomic units.
pub trait BalanceHolder: Sync {
    /// The kind of holder stored in this collection.
    fn kind(&self) -> HolderKind;

    /// The name of the table that stores this collection.
    fn table(&self) -> &'static str;

    /// Get the balance of holder `id`, or `None` if this collection does not
    /// contain `id`.
    ///
    /// # Errors
    /// Returns an [Error::SqlError] if there is an SQL error.
    fn balance(&self, connection: &Connection, id: HolderId) -> Result<Option<Decimal>, Error> {
        connection
            .query_row(
                &format!("SELECT balance FROM {} WHERE id = ?1", self.table()),
                [id],
                |row| decimal_from_row(row, 0),
            )
            .optional()
            .map_err(Error::from)
    }

    /// Add `delta` to the balance of holder `id` and stamp it with `now`.
    ///
    /// Returns zero if this collection does not contain `id`.
    ///
    /// # Errors
    /// Returns an [Error::InvalidTransaction] if the new balance overflows, or
    /// an [Error::SqlError] if there is an SQL error.
    fn adjust_balance(
        &self,
        unit: &Connection,
        id: HolderId,
        delta: Decimal,
        now: OffsetDateTime,
    ) -> Result<RowsAffected, Error> {
        let Some(balance) = self.balance(unit, id)? else {
            return Ok(0);
        };

        let new_balance = balance.checked_add(delta).ok_or_else(|| {
            Error::InvalidTransaction(format!("the balance of {} {id} would overflow", self.kind()))
        })?;

        unit.execute(
            &format!(
                "UPDATE {} SET balance = ?1, last_update = ?2 WHERE id = ?3",
                self.table()
            ),
            (new_balance.to_string(), to_millis(now), id),
        )
        .map_err(Error::from)
    }
}

/// The account collection.
#[derive(Debug, Clone, Copy)]
pub struct Accounts;

impl BalanceHolder for Accounts {
    fn kind(&self) -> HolderKind {
        HolderKind::Account
    }

    fn table(&self) -> &'static str {
        "account"
    }
}

/// The savings goal collection.
#[derive(Debug, Clone, Copy)]
pub struct Savings;

impl BalanceHolder for Savings {
    fn kind(&self) -> HolderKind {
        HolderKind::Saving
    }

    fn table(&self) -> &'static str {
        "saving"
    }
}

/// The order in which holder collections are searched for an ID.
static HOLDER_CHAIN: [&dyn BalanceHolder; 2] = [&Accounts, &Savings];

/// Add `delta` to the balance of whichever holder has the ID `id`.
///
/// Accounts are searched first, then savings.
///
/// # Errors
/// Returns an [Error::HolderNotFound] if no collection contains `id`, in which
/// case no balance was changed, or the error from the collection that does.
pub fn adjust_balance(
    unit: &Connection,
    id: HolderId,
    delta: Decimal,
    now: OffsetDateTime,
) -> Result<RowsAffected, Error> {
    for holders in HOLDER_CHAIN {
        let rows_affected = holders.adjust_balance(unit, id, delta, now)?;

        if rows_affected != 0 {
            tracing::debug!("adjusted {} {id} by {delta}", holders.kind());
            return Ok(rows_affected);
        }
    }

    Err(Error::HolderNotFound(id))
}

/// Get the balance of whichever holder has the ID `id`.
///
/// # Errors
/// Returns an [Error::HolderNotFound] if no collection contains `id`.
pub fn get_balance(connection: &Connection, id: HolderId) -> Result<Decimal, Error> {
    for holders in HOLDER_CHAIN {
        if let Some(balance) = holders.balance(connection, id)? {
            return Ok(balance);
        }
    }

    Err(Error::HolderNotFound(id))
}

/// Mark holder `id` in `holders` as deleted, along with everything that
/// refers to it, inside `unit`.
///
/// Each live transaction touching the holder is deleted through the ledger, so
/// the other holder of a transfer gets its money back. Subscriptions paid from
/// the holder are deleted so that no further occurrences are generated.
///
/// # Errors
/// Returns an [Error::HolderNotFound] if `id` is not a live member of
/// `holders`, or the ledger error of the first transaction that could not be
/// deleted. Nothing changes on error once `unit` is rolled back.
pub(crate) fn delete_holder_in_unit(
    holders: &dyn BalanceHolder,
    id: HolderId,
    unit: &Connection,
    now: OffsetDateTime,
) -> Result<RowsAffected, Error> {
    let rows_affected = unit.execute(
        &format!(
            "UPDATE {} SET is_deleted = 1, last_update = ?1 WHERE id = ?2 AND is_deleted = 0",
            holders.table()
        ),
        (to_millis(now), id),
    )?;

    if rows_affected == 0 {
        return Err(Error::HolderNotFound(id));
    }

    let transactions = select_live_transactions_for_holder(id, unit)?;
    for transaction in &transactions {
        delete_in_unit(unit, *transaction, now)?;
    }

    let subscriptions = mark_subscriptions_deleted_for_holder(id, unit, now)?;

    tracing::debug!(
        "deleted {} {id} with {} transactions and {subscriptions} subscriptions",
        holders.kind(),
        transactions.len()
    );

    Ok(rows_affected)
}

#[cfg(test)]
mod tests {
    use rusqlite::Connection;
    use rust_decimal_macros::dec;
    use time::macros::datetime;

    use crate::{
        Error,
        database_id::new_id,
        db::initialize,
        holder::{
            NewAccount, NewSaving, create_account, create_saving, get_account, get_saving,
        },
        user::UserId,
    };

    use super::{adjust_balance, get_balance};

    fn get_test_connection() -> Connection {
        let connection = Connection::open_in_memory().unwrap();
        initialize(&connection).unwrap();
        connection
    }

    #[test]
    fn adjusts_account() {
        let connection = get_test_connection();
        let now = datetime!(2025-06-01 12:00 UTC);
        let account = create_account(
            NewAccount::new(UserId::new("alice"), "Everyday", dec!(100)),
            &connection,
            now,
        )
        .unwrap();

        let later = datetime!(2025-06-02 12:00 UTC);
        let rows_affected = adjust_balance(&connection, account.id, dec!(-25.50), later).unwrap();

        let account = get_account(account.id, &connection).unwrap();
        assert_eq!(rows_affected, 1);
        assert_eq!(account.balance, dec!(74.50));
        assert_eq!(account.last_update, later);
    }

    #[test]
    fn falls_through_to_saving() {
        let connection = get_test_connection();
        let now = datetime!(2025-06-01 12:00 UTC);
        let saving = create_saving(
            NewSaving::new(UserId::new("alice"), "Holiday", dec!(10), dec!(1000)),
            &connection,
            now,
        )
        .unwrap();

        adjust_balance(&connection, saving.id, dec!(40), now).unwrap();

        assert_eq!(get_saving(saving.id, &connection).unwrap().balance, dec!(50));
        assert_eq!(get_balance(&connection, saving.id), Ok(dec!(50)));
    }

    #[test]
    fn unknown_holder_fails() {
        let connection = get_test_connection();
        let id = new_id();

        let result = adjust_balance(&connection, id, dec!(1), datetime!(2025-06-01 12:00 UTC));

        assert_eq!(result, Err(Error::HolderNotFound(id)));
        assert_eq!(get_balance(&connection, id), Err(Error::HolderNotFound(id)));
    }

    #[test]
    fn soft_deleted_holder_still_adjusts() {
        let connection = get_test_connection();
        let now = datetime!(2025-06-01 12:00 UTC);
        let account = create_account(
            NewAccount::new(UserId::new("alice"), "Old card", dec!(5)),
            &connection,
            now,
        )
        .unwrap();
        crate::holder::delete_account(account.id, &connection, now).unwrap();

        adjust_balance(&connection, account.id, dec!(5), now).unwrap();

        assert_eq!(get_balance(&connection, account.id), Ok(dec!(10)));
    }
}
