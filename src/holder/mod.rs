//! Balance holders: accounts and savings goals.
//!
//! This module contains:
//! - The balance holder collections and the [adjust_balance] primitive used
//!   by the ledger
//! - Database functions for creating, querying, editing and deleting
//!   accounts and savings

mod account;
mod core;
mod saving;

pub use account::{
    Account, NewAccount, create_account, create_account_table, delete_account, get_account,
    get_accounts, get_accounts_since, get_total_account_balance, update_account,
};
pub use core::{HolderKind, RowsAffected, adjust_balance, get_balance};
pub use saving::{
    NewSaving, Saving, SavingEdit, create_saving, create_saving_table, delete_saving, get_saving,
    get_savings, get_savings_since, update_saving,
};
