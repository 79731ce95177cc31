//! The category service: create, edit and delete categories and tell the
//! owner's clients about it.

use std::{sync::Arc, time::Duration};

use time::OffsetDateTime;

use crate::{
    Error,
    broadcast::{Action, Broadcaster, Collection},
    category::core::{
        Category, CategoryEdit, NewCategory, create_category, delete_category_in_unit,
        get_categories_since, get_category, update_category,
    },
    database_id::CategoryId,
    db::Database,
    timestamp::Clock,
    user::UserId,
};

/// Creates, edits and deletes categories.
#[derive(Debug, Clone)]
pub struct CategoryStore {
    database: Database,
    broadcaster: Broadcaster,
    clock: Arc<dyn Clock>,
    deadline: Duration,
}

impl CategoryStore {
    /// Create a category store whose operations must finish within `deadline`.
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

    /// Create a category and tell the owner's clients.
    ///
    /// # Errors
    /// Returns an [Error::InvalidCategory] if the category is invalid, or an
    /// [Error::Timeout].
    pub async fn create(&self, category: NewCategory) -> Result<Category, Error> {
        let now = self.clock.now();

        let created = self
            .database
            .run_unit(self.deadline, move |unit| create_category(category, unit, now))
            .await?;

        tracing::debug!("created category {}", created.id);
        self.broadcaster.send(
            &created.owner,
            Collection::Categories,
            Action::Create,
            &created,
        );

        Ok(created)
    }

    /// Edit category `id`. Transactions filed under it are unchanged.
    ///
    /// # Errors
    /// Returns an [Error::InvalidCategory] if the edit is invalid, or an
    /// [Error::CategoryNotFound] if `id` does not refer to a live category.
    pub async fn update(&self, id: CategoryId, edit: CategoryEdit) -> Result<Category, Error> {
        let now = self.clock.now();

        let updated = self
            .database
            .run_unit(self.deadline, move |unit| {
                update_category(id, &edit, unit, now)?;
                get_category(id, unit)
            })
            .await?;

        self.broadcaster.send(
            &updated.owner,
            Collection::Categories,
            Action::Update,
            &updated,
        );

        Ok(updated)
    }

    /// Delete category `id` with its transactions and subscriptions, in one
    /// unit.
    ///
    /// # Errors
    /// Returns an [Error::CategoryNotFound] if `id` does not refer to a live
    /// category, an [Error::Ledger] if a transaction could not be reversed, or
    /// an [Error::Timeout]. Nothing changes on error.
    pub async fn delete(&self, id: CategoryId) -> Result<CategoryId, Error> {
        let now = self.clock.now();

        let (deleted, transactions) = self
            .database
            .run_unit(self.deadline, move |unit| {
                let transactions = delete_category_in_unit(id, unit, now)?;
                Ok((get_category(id, unit)?, transactions))
            })
            .await?;

        tracing::info!("deleted category {id} and {transactions} of its transactions");

        if transactions > 0 {
            self.broadcaster.send(
                &deleted.owner,
                Collection::Transactions,
                Action::Delete,
                "bulk",
            );
        }

        self.broadcaster.send(
            &deleted.owner,
            Collection::Categories,
            Action::Delete,
            id,
        );

        Ok(id)
    }

    /// Retrieve category `id`, including deleted categories.
    ///
    /// # Errors
    /// Returns an [Error::CategoryNotFound] if `id` does not exist.
    pub async fn get(&self, id: CategoryId) -> Result<Category, Error> {
        self.database
            .read(self.deadline, move |connection| get_category(id, connection))
            .await
    }

    /// Retrieve the categories of `owner` changed after `since`, most recent
    /// first.
    ///
    /// # Errors
    /// Returns an [Error::SqlError] if there is an SQL error.
    pub async fn get_since(
        &self,
        owner: UserId,
        since: OffsetDateTime,
    ) -> Result<Vec<Category>, Error> {
        self.database
            .read(self.deadline, move |connection| {
                get_categories_since(&owner, since, connection)
            })
            .await
    }
}
