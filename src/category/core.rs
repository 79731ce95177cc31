//! Defines the category model and its database queries.

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
    database_id::{CategoryId, new_id},
    db::decimal_from_row,
    subscription::mark_subscriptions_deleted_for_category,
    timestamp::{timestamp_from_row, to_millis},
    transaction::{delete_in_unit, select_live_transactions_for_category},
    user::UserId,
};

/// Whether a category files money coming in or going out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CategoryKind {
    /// Salary, refunds and other money coming in.
    Income,
    /// Bills, groceries and other money going out.
    Expense,
}

impl CategoryKind {
    /// The name stored in the database and sent to clients.
    pub fn as_str(&self) -> &'static str {
        match self {
            CategoryKind::Income => "income",
            CategoryKind::Expense => "expense",
        }
    }
}

impl Display for CategoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The name of a category kind that is neither income nor expense.
#[derive(Debug, thiserror::Error)]
#[error("{0} is not a valid category type")]
pub struct CategoryKindError(String);

impl FromStr for CategoryKind {
    type Err = CategoryKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "income" => Ok(CategoryKind::Income),
            "expense" => Ok(CategoryKind::Expense),
            other => Err(CategoryKindError(other.to_owned())),
        }
    }
}

impl ToSql for CategoryKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for CategoryKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|error| FromSqlError::Other(Box::new(error)))
    }
}

/// A label for incomes and expenses, with an optional monthly budget.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Category {
    /// The ID of the category.
    pub id: CategoryId,
    /// The user that owns the category.
    pub owner: UserId,
    /// Whether incomes or expenses are filed under the category.
    pub kind: CategoryKind,
    /// The name of the icon shown next to the category.
    pub icon: String,
    /// The display name of the category.
    pub name: String,
    /// How much the user plans to spend or earn in the category. Zero means
    /// no budget.
    pub budget: Decimal,
    /// When the category was last changed.
    #[serde(with = "time::serde::rfc3339")]
    pub last_update: OffsetDateTime,
    /// Whether the user has deleted the category.
    pub is_deleted: bool,
}

/// The data needed to create a category.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCategory {
    /// The user that will own the category.
    pub owner: UserId,
    /// Whether incomes or expenses are filed under the category.
    pub kind: CategoryKind,
    /// The display name.
    pub name: String,
    /// The icon name, empty for none.
    pub icon: String,
    /// The planned amount, zero for none.
    pub budget: Decimal,
}

impl NewCategory {
    /// Describe a category without an icon or budget.
    pub fn new(owner: UserId, kind: CategoryKind, name: &str) -> Self {
        Self {
            owner,
            kind,
            name: name.to_owned(),
            icon: String::new(),
            budget: Decimal::ZERO,
        }
    }

    /// Set the icon for the category.
    pub fn icon(mut self, icon: &str) -> Self {
        self.icon = icon.to_owned();
        self
    }

    /// Set the budget for the category.
    pub fn budget(mut self, budget: Decimal) -> Self {
        self.budget = budget;
        self
    }

    /// Check the category has a name and a non-negative budget.
    ///
    /// # Errors
    /// Returns an [Error::InvalidCategory] describing the broken rule.
    pub fn validate(&self) -> Result<(), Error> {
        validate(&self.name, self.budget)
    }
}

/// The user-editable parts of a category. The owner never changes.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryEdit {
    /// The new kind.
    pub kind: CategoryKind,
    /// The new display name.
    pub name: String,
    /// The new icon name.
    pub icon: String,
    /// The new budget.
    pub budget: Decimal,
}

fn validate(name: &str, budget: Decimal) -> Result<(), Error> {
    if name.trim().is_empty() {
        return Err(Error::InvalidCategory("a category needs a name".to_owned()));
    }

    if budget.is_sign_negative() && !budget.is_zero() {
        return Err(Error::InvalidCategory(format!(
            "the budget must not be negative, got {budget}"
        )));
    }

    Ok(())
}

impl CategoryEdit {
    /// Check the edit keeps a name and a non-negative budget.
    ///
    /// # Errors
    /// Returns an [Error::InvalidCategory] describing the broken rule.
    pub fn validate(&self) -> Result<(), Error> {
        validate(&self.name, self.budget)
    }
}

/// Create the category table and its sync index.
pub fn create_category_table(connection: &Connection) -> Result<(), rusqlite::Error> {
    connection.execute(
        "CREATE TABLE IF NOT EXISTS category (
            id BLOB PRIMARY KEY,
            owner TEXT NOT NULL,
            kind TEXT NOT NULL,
            icon TEXT NOT NULL,
            name TEXT NOT NULL,
            budget TEXT NOT NULL,
            last_update INTEGER NOT NULL,
            is_deleted INTEGER NOT NULL DEFAULT 0
        )",
        (),
    )?;

    connection.execute(
        "CREATE INDEX IF NOT EXISTS idx_category_owner_last_update ON category(owner, last_update)",
        (),
    )?;

    Ok(())
}

fn map_row_to_category(row: &Row) -> Result<Category, rusqlite::Error> {
    Ok(Category {
        id: row.get(0)?,
        owner: row.get(1)?,
        kind: row.get(2)?,
        icon: row.get(3)?,
        name: row.get(4)?,
        budget: decimal_from_row(row, 5)?,
        last_update: timestamp_from_row(row, 6)?,
        is_deleted: row.get(7)?,
    })
}

const SELECT_CATEGORY: &str =
    "SELECT id, owner, kind, icon, name, budget, last_update, is_deleted FROM category";

/// Create a category.
///
/// # Errors
/// Returns an [Error::InvalidCategory] if the category has no name or a
/// negative budget, or an [Error::SqlError] if there is an SQL error.
pub fn create_category(
    category: NewCategory,
    connection: &Connection,
    now: OffsetDateTime,
) -> Result<Category, Error> {
    category.validate()?;

    let category = Category {
        id: new_id(),
        owner: category.owner,
        kind: category.kind,
        icon: category.icon,
        name: category.name,
        budget: category.budget,
        last_update: now,
        is_deleted: false,
    };

    connection.execute(
        "INSERT INTO category (id, owner, kind, icon, name, budget, last_update, is_deleted)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
        (
            category.id,
            &category.owner,
            category.kind,
            &category.icon,
            &category.name,
            category.budget.to_string(),
            to_millis(now),
        ),
    )?;

    Ok(category)
}

/// Retrieve a category by its `id`, including deleted categories.
///
/// # Errors
/// Returns an [Error::CategoryNotFound] if `id` does not refer to a category.
pub fn get_category(id: CategoryId, connection: &Connection) -> Result<Category, Error> {
    connection
        .query_row(
            &format!("{SELECT_CATEGORY} WHERE id = ?1"),
            [id],
            map_row_to_category,
        )
        .map_err(|error| match error {
            rusqlite::Error::QueryReturnedNoRows => Error::CategoryNotFound(id),
            error => error.into(),
        })
}

/// Retrieve the categories of `owner` changed after `since`, most recent
/// first.
///
/// Deleted categories are included so that clients can drop them.
///
/// # Errors
/// Returns an [Error::SqlError] if there is an SQL error.
pub fn get_categories_since(
    owner: &UserId,
    since: OffsetDateTime,
    connection: &Connection,
) -> Result<Vec<Category>, Error> {
    connection
        .prepare(&format!(
            "{SELECT_CATEGORY} WHERE owner = ?1 AND last_update > ?2 ORDER BY last_update DESC"
        ))?
        .query_map((owner, to_millis(since)), map_row_to_category)?
        .map(|maybe_category| maybe_category.map_err(Error::from))
        .collect()
}

/// Overwrite the editable fields of category `id`.
///
/// # Errors
/// Returns an [Error::InvalidCategory] if the edit is invalid, or an
/// [Error::CategoryNotFound] if `id` does not refer to a live category.
pub fn update_category(
    id: CategoryId,
    edit: &CategoryEdit,
    connection: &Connection,
    now: OffsetDateTime,
) -> Result<(), Error> {
    edit.validate()?;

    let rows_affected = connection.execute(
        "UPDATE category SET kind = ?1, icon = ?2, name = ?3, budget = ?4, last_update = ?5
         WHERE id = ?6 AND is_deleted = 0",
        (
            edit.kind,
            &edit.icon,
            &edit.name,
            edit.budget.to_string(),
            to_millis(now),
            id,
        ),
    )?;

    match rows_affected {
        0 => Err(Error::CategoryNotFound(id)),
        _ => Ok(()),
    }
}

/// Mark category `id` as deleted inside `unit`, along with every live
/// transaction and subscription filed under it.
///
/// Transactions are deleted through the ledger so their holders get the money
/// back. Returns the number of transactions deleted.
///
/// # Errors
/// Returns an [Error::CategoryNotFound] if `id` does not refer to a live
/// category, or the ledger error of the first transaction that could not be
/// deleted.
pub(crate) fn delete_category_in_unit(
    id: CategoryId,
    unit: &Connection,
    now: OffsetDateTime,
) -> Result<usize, Error> {
    let rows_affected = unit.execute(
        "UPDATE category SET is_deleted = 1, last_update = ?1 WHERE id = ?2 AND is_deleted = 0",
        (to_millis(now), id),
    )?;

    if rows_affected == 0 {
        return Err(Error::CategoryNotFound(id));
    }

    let transactions = select_live_transactions_for_category(id, unit)?;
    for transaction in &transactions {
        delete_in_unit(unit, *transaction, now)?;
    }

    let subscriptions = mark_subscriptions_deleted_for_category(id, unit, now)?;

    tracing::debug!(
        "deleted category {id} with {} transactions and {subscriptions} subscriptions",
        transactions.len()
    );

    Ok(transactions.len())
}
