//! Transactions and the ledger that keeps balances consistent with them.
//!
//! This module contains:
//! - The `Transaction` model and `TransactionBuilder` for describing transactions
//! - Database functions for storing and querying transaction records
//! - The [Ledger], the only place where transactions and holder balances change

mod core;
mod ledger;

pub use core::{
    NewTransaction, Transaction, TransactionBuilder, TransactionKind, count_transactions,
    create_transaction_table, get_transaction, get_transactions_since,
};
pub use ledger::{Ledger, LedgerStep, create_transaction};

pub(crate) use core::{select_live_transactions_for_category, select_live_transactions_for_holder};
pub(crate) use ledger::{create_in_unit, delete_in_unit};
