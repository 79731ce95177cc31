//! Categories that incomes, expenses and subscriptions are filed under.
//!
//! This module contains:
//! - The `Category` model and its database queries
//! - The [CategoryStore], which creates, edits and deletes categories and
//!   deletes the transactions filed under a deleted category through the ledger

mod core;
mod store;

pub use core::{
    Category, CategoryEdit, CategoryKind, NewCategory, create_category, create_category_table,
    get_categories_since, get_category, update_category,
};
pub use store::CategoryStore;
