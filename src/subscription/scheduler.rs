//! The subscription state machine: catching up on missed occurrences and
//! renewing subscriptions as their occurrences and reminders are processed.

use std::{sync::Arc, time::Duration};

use rusqlite::Connection;
use serde::Serialize;
use time::OffsetDateTime;

use crate::{
    Error,
    broadcast::{Action, Broadcaster, Collection},
    database_id::SubscriptionId,
    db::Database,
    subscription::{
        core::{
            NewSubscription, Subscription, SubscriptionEdit, clear_notify_at, get_subscription,
            get_subscriptions_since, insert_subscription, mark_subscription_deleted,
            update_subscription_template, write_renewal,
        },
        schedule::{Renewal, step},
    },
    timestamp::Clock,
    transaction::create_in_unit,
    user::UserId,
};

/// The state of `subscription` after `current_interval` occurrences.
fn renewal_of(subscription: &Subscription, current_interval: u32) -> Result<Renewal, Error> {
    Renewal::after(
        subscription.start_date,
        subscription.interval,
        subscription.max_interval,
        subscription.remind_before,
        current_interval,
    )
}

/// Persist `renewal` for `subscription`, failing if another unit renewed it
/// since `subscription` was read.
fn commit_renewal(
    unit: &Connection,
    subscription: &Subscription,
    renewal: &Renewal,
    now: OffsetDateTime,
) -> Result<Subscription, Error> {
    match write_renewal(
        subscription.id,
        subscription.current_interval,
        renewal,
        unit,
        now,
    )? {
        0 => Err(Error::Conflict(format!(
            "subscription {} was renewed past occurrence {} by someone else",
            subscription.id, subscription.current_interval
        ))),
        _ => get_subscription(subscription.id, unit),
    }
}

/// The result of catching a subscription up.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatchUp {
    /// The subscription after catching up.
    pub subscription: Subscription,
    /// The number of occurrences turned into transactions.
    pub materialized: u32,
}

/// Materialize every occurrence of `subscription` due at or before `now`
/// and persist the new schedule state, inside `unit`.
///
/// Stops at the occurrence cap. The state is persisted even when nothing was
/// due.
pub(crate) fn catch_up_in_unit(
    unit: &Connection,
    subscription: &Subscription,
    now: OffsetDateTime,
) -> Result<CatchUp, Error> {
    let mut count = subscription.current_interval;

    while subscription.max_interval == 0 || count < subscription.max_interval {
        let due = step(subscription.start_date, subscription.interval, count)?;

        if due > now {
            break;
        }

        create_in_unit(unit, &subscription.occurrence(due)?, now)?;
        count += 1;
    }

    let renewal = renewal_of(subscription, count)?;

    Ok(CatchUp {
        materialized: count - subscription.current_interval,
        subscription: commit_renewal(unit, subscription, &renewal, now)?,
    })
}

/// Move `subscription` on to its next occurrence, inside `unit`.
///
/// `subscription` is the snapshot the caller acted on. If the stored record
/// has moved on since, nothing is written and [Error::Conflict] is returned.
pub(crate) fn renew_in_unit(
    unit: &Connection,
    subscription: &Subscription,
    now: OffsetDateTime,
) -> Result<Subscription, Error> {
    let renewal = renewal_of(subscription, subscription.current_interval + 1)?;

    commit_renewal(unit, subscription, &renewal, now)
}

/// Mark the pending reminder of `subscription` as sent, inside `unit`.
///
/// # Errors
/// Returns an [Error::Conflict] if the stored reminder no longer matches the
/// snapshot, e.g. because another unit already sent it.
pub(crate) fn clear_reminder_in_unit(
    unit: &Connection,
    subscription: &Subscription,
) -> Result<(), Error> {
    let Some(notify_at) = subscription.notify_at else {
        return Err(Error::Conflict(format!(
            "subscription {} has no pending reminder",
            subscription.id
        )));
    };

    match clear_notify_at(subscription.id, notify_at, unit)? {
        0 => Err(Error::Conflict(format!(
            "the reminder of subscription {} was already handled",
            subscription.id
        ))),
        _ => Ok(()),
    }
}

/// Creates, edits and renews subscriptions.
#[derive(Debug, Clone)]
pub struct Scheduler {
    database: Database,
    broadcaster: Broadcaster,
    clock: Arc<dyn Clock>,
    deadline: Duration,
}

impl Scheduler {
    /// Create a scheduler whose operations must finish within `deadline`.
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

    fn announce_catch_up(&self, catch_up: &CatchUp) {
        let subscription = &catch_up.subscription;

        if catch_up.materialized > 0 {
            self.broadcaster.send(
                &subscription.creator,
                Collection::Transactions,
                Action::Create,
                "bulk",
            );
        }

        self.broadcaster.send(
            &subscription.creator,
            Collection::Subscriptions,
            Action::Renew,
            subscription.id,
        );
    }

    /// Start a subscription and materialize every occurrence already due.
    ///
    /// Inserting the subscription and catching it up happen in one unit, so a
    /// failure leaves neither the subscription nor any of its transactions.
    ///
    /// # Errors
    /// Returns an [Error::InvalidSubscription] if the template is invalid, an
    /// [Error::Ledger] if an occurrence could not be recorded (e.g. the source
    /// holder does not exist), or an [Error::Timeout].
    pub async fn create_subscription(
        &self,
        subscription: NewSubscription,
    ) -> Result<CatchUp, Error> {
        subscription.validate()?;
        let now = self.clock.now();

        let catch_up = self
            .database
            .run_unit(self.deadline, move |unit| {
                let initial = Renewal::after(
                    subscription.start_date,
                    subscription.interval,
                    subscription.max_interval,
                    subscription.remind_before,
                    0,
                )?;
                let inserted = insert_subscription(&subscription, &initial, unit, now)?;

                catch_up_in_unit(unit, &inserted, now)
            })
            .await?;

        tracing::info!(
            "created subscription {} with {} past occurrences",
            catch_up.subscription.id,
            catch_up.materialized
        );
        self.announce_catch_up(&catch_up);
        self.broadcaster.send(
            &catch_up.subscription.creator,
            Collection::Subscriptions,
            Action::Create,
            &catch_up.subscription,
        );

        Ok(catch_up)
    }

    /// Materialize every occurrence of subscription `id` that is due now.
    ///
    /// # Errors
    /// Returns an [Error::SubscriptionNotFound] if `id` does not refer to a
    /// live subscription, an [Error::Ledger] if an occurrence could not be
    /// recorded, or an [Error::Timeout]. Nothing is written on error.
    pub async fn catch_up(&self, id: SubscriptionId) -> Result<CatchUp, Error> {
        let now = self.clock.now();

        let catch_up = self
            .database
            .run_unit(self.deadline, move |unit| {
                let subscription = get_subscription(id, unit)?;

                if subscription.is_deleted {
                    return Err(Error::SubscriptionNotFound(id));
                }

                catch_up_in_unit(unit, &subscription, now)
            })
            .await?;

        tracing::debug!(
            "caught up subscription {id} with {} occurrences",
            catch_up.materialized
        );
        self.announce_catch_up(&catch_up);

        Ok(catch_up)
    }

    /// Move subscription `id` on to its next occurrence after its current
    /// occurrence was turned into a transaction.
    ///
    /// # Errors
    /// Returns an [Error::SubscriptionNotFound] if `id` does not exist, or an
    /// [Error::Conflict] if it was renewed concurrently.
    pub async fn on_transaction_created(&self, id: SubscriptionId) -> Result<Subscription, Error> {
        let now = self.clock.now();

        let renewed = self
            .database
            .run_unit(self.deadline, move |unit| {
                let subscription = get_subscription(id, unit)?;

                renew_in_unit(unit, &subscription, now)
            })
            .await?;

        self.broadcaster.send(
            &renewed.creator,
            Collection::Subscriptions,
            Action::Renew,
            renewed.id,
        );

        Ok(renewed)
    }

    /// Mark the pending reminder of subscription `id` as sent.
    ///
    /// # Errors
    /// Returns an [Error::SubscriptionNotFound] if `id` does not exist, or an
    /// [Error::Conflict] if there is no pending reminder.
    pub async fn on_notification_created(&self, id: SubscriptionId) -> Result<(), Error> {
        self.database
            .run_unit(self.deadline, move |unit| {
                let subscription = get_subscription(id, unit)?;

                clear_reminder_in_unit(unit, &subscription)
            })
            .await
    }

    /// Edit the template of subscription `id`. Its schedule is unchanged.
    ///
    /// # Errors
    /// Returns an [Error::SubscriptionNotFound] if `id` does not refer to a
    /// live subscription, or an [Error::InvalidSubscription] if the edited
    /// amount is negative.
    pub async fn update_subscription(
        &self,
        id: SubscriptionId,
        edit: SubscriptionEdit,
    ) -> Result<Subscription, Error> {
        if edit.amount.is_sign_negative() {
            return Err(Error::InvalidSubscription(format!(
                "the amount must not be negative, got {}",
                edit.amount
            )));
        }

        let now = self.clock.now();

        let updated = self
            .database
            .run_unit(self.deadline, move |unit| {
                update_subscription_template(id, &edit, unit, now)?;
                get_subscription(id, unit)
            })
            .await?;

        self.broadcaster.send(
            &updated.creator,
            Collection::Subscriptions,
            Action::Update,
            &updated,
        );

        Ok(updated)
    }

    /// Stop subscription `id`. Transactions it already created are kept.
    ///
    /// # Errors
    /// Returns an [Error::SubscriptionNotFound] if `id` does not refer to a
    /// live subscription.
    pub async fn delete_subscription(&self, id: SubscriptionId) -> Result<SubscriptionId, Error> {
        let now = self.clock.now();

        let deleted = self
            .database
            .run_unit(self.deadline, move |unit| {
                mark_subscription_deleted(id, unit, now)?;
                get_subscription(id, unit)
            })
            .await?;

        self.broadcaster.send(
            &deleted.creator,
            Collection::Subscriptions,
            Action::Delete,
            id,
        );

        Ok(id)
    }

    /// Retrieve subscription `id`, including deleted subscriptions.
    ///
    /// # Errors
    /// Returns an [Error::SubscriptionNotFound] if `id` does not exist.
    pub async fn get_subscription(&self, id: SubscriptionId) -> Result<Subscription, Error> {
        self.database
            .read(self.deadline, move |connection| get_subscription(id, connection))
            .await
    }

    /// Retrieve the subscriptions of `creator` changed after `since`, most
    /// recent first.
    ///
    /// # Errors
    /// Returns an [Error::SqlError] if there is an SQL error.
    pub async fn get_subscriptions_since(
        &self,
        creator: UserId,
        since: OffsetDateTime,
    ) -> Result<Vec<Subscription>, Error> {
        self.database
            .read(self.deadline, move |connection| {
                get_subscriptions_since(&creator, since, connection)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;
    use time::Duration;

    use crate::{
        Error, ErrorKind,
        broadcast::{Action, Collection},
        database_id::new_id,
        subscription::{Interval, NewSubscription, SubscriptionEdit, get_subscription, step},
        test_utils::{TEST_NOW, TestContext, balance_of},
        transaction::count_transactions,
        user::UserId,
    };

    use super::renew_in_unit;

    fn weekly(
        context: &TestContext,
        source: crate::database_id::HolderId,
        weeks_ago: i64,
    ) -> NewSubscription {
        NewSubscription::new(
            UserId::new("alice"),
            "Gym",
            dec!(10),
            source,
            new_id(),
            context.now() - Duration::weeks(weeks_ago),
            Interval::Week,
        )
        .remind_before(2)
    }

    #[tokio::test]
    async fn catch_up_stops_at_cap() {
        let context = TestContext::new();
        let account = context.account("Everyday", dec!(100));

        let catch_up = context
            .scheduler
            .create_subscription(weekly(&context, account, 10).max_interval(5))
            .await
            .unwrap();

        assert_eq!(catch_up.materialized, 5);
        assert_eq!(catch_up.subscription.current_interval, 5);
        assert!(!catch_up.subscription.is_active);
        assert_eq!(balance_of(&context.database, account), dec!(50));
        let connection = context.database.connection().lock().unwrap();
        assert_eq!(count_transactions(&connection), Ok(5));
    }

    #[tokio::test]
    async fn uncapped_catch_up_materializes_every_past_occurrence() {
        let context = TestContext::new();
        let account = context.account("Everyday", dec!(200));

        let catch_up = context
            .scheduler
            .create_subscription(weekly(&context, account, 10))
            .await
            .unwrap();

        // Occurrences 0 to 10 inclusive, the last one due exactly now.
        assert_eq!(catch_up.materialized, 11);
        let subscription = catch_up.subscription;
        assert!(subscription.is_active);
        assert_eq!(subscription.next_active, TEST_NOW + Duration::weeks(1));
        assert_eq!(
            subscription.notify_at,
            Some(TEST_NOW + Duration::weeks(1) - Duration::days(2))
        );
        assert_eq!(balance_of(&context.database, account), dec!(90));
    }

    #[tokio::test]
    async fn catch_up_dates_transactions_at_their_occurrence() {
        let context = TestContext::new();
        let account = context.account("Everyday", dec!(100));
        let new = weekly(&context, account, 2);
        let start = new.start_date;

        context.scheduler.create_subscription(new).await.unwrap();

        let mut dates: Vec<_> = context
            .ledger
            .get_since(UserId::new("alice"), TEST_NOW - Duration::days(1))
            .await
            .unwrap()
            .into_iter()
            .map(|transaction| transaction.date_time)
            .collect();
        dates.sort();
        assert_eq!(
            dates,
            vec![
                start,
                step(start, Interval::Week, 1).unwrap(),
                step(start, Interval::Week, 2).unwrap(),
            ]
        );
    }

    #[tokio::test]
    async fn future_subscription_broadcasts_renew_and_create_only() {
        let context = TestContext::new();
        let account = context.account("Everyday", dec!(100));
        let mut events = context.broadcaster.subscribe();

        let catch_up = context
            .scheduler
            .create_subscription(weekly(&context, account, -1))
            .await
            .unwrap();

        assert_eq!(catch_up.materialized, 0);
        let first = events.try_recv().unwrap();
        assert_eq!((first.collection, first.action), (Collection::Subscriptions, Action::Renew));
        let second = events.try_recv().unwrap();
        assert_eq!((second.collection, second.action), (Collection::Subscriptions, Action::Create));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_catch_up_leaves_nothing_behind() {
        let context = TestContext::new();
        let missing_holder = new_id();

        let result = context
            .scheduler
            .create_subscription(weekly(&context, missing_holder, 3))
            .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::NotFound);
        let subscriptions = context
            .scheduler
            .get_subscriptions_since(UserId::new("alice"), TEST_NOW - Duration::weeks(100))
            .await
            .unwrap();
        assert!(subscriptions.is_empty());
    }

    #[tokio::test]
    async fn invalid_template_is_rejected() {
        let context = TestContext::new();
        let account = context.account("Everyday", dec!(100));
        let mut new = weekly(&context, account, 0);
        new.amount = dec!(-5);

        let result = context.scheduler.create_subscription(new).await;

        assert!(matches!(result, Err(Error::InvalidSubscription(_))));
    }

    #[tokio::test]
    async fn renewal_from_stale_snapshot_conflicts() {
        let context = TestContext::new();
        let account = context.account("Everyday", dec!(100));
        let created = context
            .scheduler
            .create_subscription(weekly(&context, account, -1))
            .await
            .unwrap()
            .subscription;

        let renewed = context.scheduler.on_transaction_created(created.id).await.unwrap();
        assert_eq!(renewed.current_interval, 1);
        assert_eq!(renewed.next_active, step(created.start_date, Interval::Week, 1).unwrap());

        let connection = context.database.connection().lock().unwrap();
        let result = renew_in_unit(&connection, &created, context.now());

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Conflict);
        assert_eq!(get_subscription(created.id, &connection), Ok(renewed));
    }

    #[tokio::test]
    async fn reminder_can_only_be_cleared_once() {
        let context = TestContext::new();
        let account = context.account("Everyday", dec!(100));
        let created = context
            .scheduler
            .create_subscription(weekly(&context, account, -1))
            .await
            .unwrap()
            .subscription;

        context.scheduler.on_notification_created(created.id).await.unwrap();
        let cleared = context.scheduler.get_subscription(created.id).await.unwrap();
        assert_eq!(cleared.notify_at, None);

        let second = context.scheduler.on_notification_created(created.id).await;
        assert_eq!(second.unwrap_err().kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn edit_changes_template_and_delete_is_final() {
        let context = TestContext::new();
        let account = context.account("Everyday", dec!(100));
        let other = context.saving("Bills", dec!(100));
        let created = context
            .scheduler
            .create_subscription(weekly(&context, account, -1))
            .await
            .unwrap()
            .subscription;

        let updated = context
            .scheduler
            .update_subscription(
                created.id,
                SubscriptionEdit {
                    name: "Pool".to_owned(),
                    icon: String::new(),
                    amount: dec!(12),
                    source_holder: other,
                    category: created.category,
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.source_holder, other);
        assert_eq!(updated.next_active, created.next_active);

        context.scheduler.delete_subscription(created.id).await.unwrap();
        assert_eq!(
            context.scheduler.delete_subscription(created.id).await,
            Err(Error::SubscriptionNotFound(created.id))
        );
        assert_eq!(
            context.scheduler.catch_up(created.id).await.map(|_| ()),
            Err(Error::SubscriptionNotFound(created.id))
        );
    }

    #[tokio::test]
    async fn catch_up_after_downtime_fills_the_gap() {
        let context = TestContext::new();
        let account = context.account("Everyday", dec!(100));
        let created = context
            .scheduler
            .create_subscription(weekly(&context, account, 0))
            .await
            .unwrap()
            .subscription;
        assert_eq!(created.current_interval, 1);

        context.clock.advance(Duration::weeks(3));
        let catch_up = context.scheduler.catch_up(created.id).await.unwrap();

        assert_eq!(catch_up.materialized, 3);
        assert_eq!(catch_up.subscription.current_interval, 4);
        assert_eq!(balance_of(&context.database, account), dec!(60));
    }
}
