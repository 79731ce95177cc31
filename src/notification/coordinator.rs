//! Turns due subscriptions into reminders and transactions, and handles the
//! notifications users act on.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use rusqlite::Connection;
use serde::Serialize;
use time::OffsetDateTime;

use crate::{
    Error, ErrorKind,
    broadcast::{Action, Broadcaster, Collection},
    database_id::{NotificationId, SubscriptionId},
    db::Database,
    notification::core::{
        NewNotification, Notification, NotificationEdit, NotificationKind, create_notification,
        delete_notification, get_notification, get_notifications_since, mark_notifications_read,
        update_notification,
    },
    subscription::{
        Subscription, clear_reminder_in_unit, get_subscription, renew_in_unit,
        select_due_occurrences, select_due_reminders,
    },
    timestamp::Clock,
    transaction::{Transaction, create_in_unit},
    user::UserId,
};

/// The title of subscription reminders.
pub const REMINDER_TITLE: &str = "Subscription Alert";

/// The tally of a scan over due subscriptions.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    /// Subscriptions that matched the scan.
    pub selected: usize,
    /// Subscriptions processed successfully.
    pub completed: usize,
    /// Subscriptions that were no longer due, or were handled by someone else.
    pub skipped: usize,
    /// Subscriptions that could not be processed.
    pub failed: usize,
}

impl ScanReport {
    fn new(selected: usize) -> Self {
        Self {
            selected,
            ..Default::default()
        }
    }

    fn record<T>(
        &mut self,
        scan: &str,
        id: SubscriptionId,
        outcome: Result<Option<T>, Error>,
    ) -> Option<T> {
        match outcome {
            Ok(Some(value)) => {
                self.completed += 1;
                Some(value)
            }
            Ok(None) => {
                tracing::debug!("{scan}: subscription {id} is no longer due");
                self.skipped += 1;
                None
            }
            Err(error) if error.kind() == ErrorKind::Conflict => {
                tracing::warn!("{scan}: skipping subscription {id}: {error}");
                self.skipped += 1;
                None
            }
            Err(error) => {
                tracing::error!("{scan}: could not process subscription {id}: {error}");
                self.failed += 1;
                None
            }
        }
    }
}

fn reminder_message(subscription: &Subscription) -> String {
    if subscription.remind_before > 0 {
        format!(
            "Your subscription {} is due in {} days.",
            subscription.name, subscription.remind_before
        )
    } else {
        format!("Your subscription {} is due now.", subscription.name)
    }
}

/// Send the reminder for subscription `id` if it is still due, inside `unit`.
fn remind_in_unit(
    unit: &Connection,
    id: SubscriptionId,
    now: OffsetDateTime,
) -> Result<Option<Notification>, Error> {
    let subscription = get_subscription(id, unit)?;

    if !subscription.reminder_due(now) {
        return Ok(None);
    }

    let notification = create_notification(
        &NewNotification::new(
            subscription.creator.clone(),
            NotificationKind::Subscription,
            REMINDER_TITLE,
            &reminder_message(&subscription),
            now,
        )
        .reference(subscription.id),
        unit,
        now,
    )?;
    clear_reminder_in_unit(unit, &subscription)?;

    Ok(Some(notification))
}

/// Materialize the next occurrence of subscription `id` if it is still due,
/// inside `unit`.
fn materialize_in_unit(
    unit: &Connection,
    id: SubscriptionId,
    now: OffsetDateTime,
) -> Result<Option<(Transaction, Subscription)>, Error> {
    let subscription = get_subscription(id, unit)?;

    if !subscription.occurrence_due(now) {
        return Ok(None);
    }

    let occurrence = subscription.occurrence(subscription.next_active)?;
    let transaction = create_in_unit(unit, &occurrence, now)?;
    let renewed = renew_in_unit(unit, &subscription, now)?;

    Ok(Some((transaction, renewed)))
}

/// Drives reminders and occurrences of due subscriptions, and manages user
/// notifications.
#[derive(Debug, Clone)]
pub struct NotificationCoordinator {
    database: Database,
    broadcaster: Broadcaster,
    clock: Arc<dyn Clock>,
    request_deadline: Duration,
    batch_deadline: Duration,
}

impl NotificationCoordinator {
    /// Create a coordinator.
    ///
    /// Single operations must finish within `request_deadline`; every unit of
    /// a scan shares one `batch_deadline`.
    pub fn new(
        database: Database,
        broadcaster: Broadcaster,
        clock: Arc<dyn Clock>,
        request_deadline: Duration,
        batch_deadline: Duration,
    ) -> Self {
        Self {
            database,
            broadcaster,
            clock,
            request_deadline,
            batch_deadline,
        }
    }

    /// The clock the coordinator reads "now" from.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Send a reminder for every subscription whose reminder is due at `now`.
    ///
    /// Each reminder is created and marked as sent in one unit, so running the
    /// scan twice for the same `now` creates each reminder once. A failure for
    /// one subscription is logged and counted, and the scan moves on.
    ///
    /// # Errors
    /// Returns an error only if the due subscriptions could not be selected.
    pub async fn scan_due_reminders(&self, now: OffsetDateTime) -> Result<ScanReport, Error> {
        let expires_at = Instant::now() + self.batch_deadline;

        let due = self
            .database
            .read(self.batch_deadline, move |connection| {
                select_due_reminders(now, connection)
            })
            .await?;
        let mut report = ScanReport::new(due.len());

        for id in due {
            let remaining = expires_at.saturating_duration_since(Instant::now());
            let outcome = self
                .database
                .run_unit(remaining, move |unit| remind_in_unit(unit, id, now))
                .await;

            if let Some(notification) = report.record("reminder scan", id, outcome) {
                self.broadcaster.send(
                    &notification.owner,
                    Collection::Notifications,
                    Action::Create,
                    &notification,
                );
            }
        }

        tracing::info!("reminder scan at {now}: {report:?}");

        Ok(report)
    }

    /// Materialize the next occurrence of every subscription due at `now`.
    ///
    /// Each occurrence is recorded through the ledger and the subscription
    /// renewed in one unit. A failure for one subscription is logged and
    /// counted, and the scan moves on.
    ///
    /// # Errors
    /// Returns an error only if the due subscriptions could not be selected.
    pub async fn scan_due_occurrences(&self, now: OffsetDateTime) -> Result<ScanReport, Error> {
        let expires_at = Instant::now() + self.batch_deadline;

        let due = self
            .database
            .read(self.batch_deadline, move |connection| {
                select_due_occurrences(now, connection)
            })
            .await?;
        let mut report = ScanReport::new(due.len());

        for id in due {
            let remaining = expires_at.saturating_duration_since(Instant::now());
            let outcome = self
                .database
                .run_unit(remaining, move |unit| materialize_in_unit(unit, id, now))
                .await;

            if let Some((transaction, renewed)) = report.record("occurrence scan", id, outcome) {
                self.broadcaster.send(
                    &transaction.creator,
                    Collection::Transactions,
                    Action::Create,
                    &transaction,
                );
                self.broadcaster.send(
                    &renewed.creator,
                    Collection::Subscriptions,
                    Action::Renew,
                    renewed.id,
                );
            }
        }

        tracing::info!("occurrence scan at {now}: {report:?}");

        Ok(report)
    }

    /// Create a notification and tell the owner's clients.
    ///
    /// # Errors
    /// Returns an [Error::SqlError] if there is an SQL error, or an
    /// [Error::Timeout].
    pub async fn notify(&self, notification: NewNotification) -> Result<Notification, Error> {
        let now = self.clock.now();

        let created = self
            .database
            .run_unit(self.request_deadline, move |unit| {
                create_notification(&notification, unit, now)
            })
            .await?;

        self.broadcaster.send(
            &created.owner,
            Collection::Notifications,
            Action::Create,
            &created,
        );

        Ok(created)
    }

    /// Mark the notifications in `ids` that belong to `owner` as read.
    ///
    /// Returns the number of notifications that changed.
    ///
    /// # Errors
    /// Returns an [Error::SqlError] if there is an SQL error, or an
    /// [Error::Timeout]. No notification changes on error.
    pub async fn mark_as_read(
        &self,
        owner: UserId,
        ids: Vec<NotificationId>,
    ) -> Result<usize, Error> {
        let now = self.clock.now();
        let owner_for_unit = owner.clone();
        let ids_for_unit = ids.clone();

        let changed = self
            .database
            .run_unit(self.request_deadline, move |unit| {
                mark_notifications_read(&owner_for_unit, &ids_for_unit, unit, now)
            })
            .await?;

        self.broadcaster
            .send(&owner, Collection::Notifications, Action::Mark, &ids);

        Ok(changed)
    }

    /// Edit the text and schedule of notification `id`.
    ///
    /// # Errors
    /// Returns an [Error::NotificationNotFound] if `id` does not refer to a
    /// live notification.
    pub async fn update_notification(
        &self,
        id: NotificationId,
        edit: NotificationEdit,
    ) -> Result<Notification, Error> {
        let now = self.clock.now();

        let updated = self
            .database
            .run_unit(self.request_deadline, move |unit| {
                update_notification(id, &edit, unit, now)?;
                get_notification(id, unit)
            })
            .await?;

        self.broadcaster.send(
            &updated.owner,
            Collection::Notifications,
            Action::Update,
            &updated,
        );

        Ok(updated)
    }

    /// Mark notification `id` as deleted.
    ///
    /// # Errors
    /// Returns an [Error::NotificationNotFound] if `id` does not refer to a
    /// live notification.
    pub async fn delete_notification(&self, id: NotificationId) -> Result<NotificationId, Error> {
        let now = self.clock.now();

        let deleted = self
            .database
            .run_unit(self.request_deadline, move |unit| {
                delete_notification(id, unit, now)?;
                get_notification(id, unit)
            })
            .await?;

        self.broadcaster.send(
            &deleted.owner,
            Collection::Notifications,
            Action::Delete,
            id,
        );

        Ok(id)
    }

    /// Retrieve notification `id`, including deleted notifications.
    ///
    /// # Errors
    /// Returns an [Error::NotificationNotFound] if `id` does not exist.
    pub async fn get_notification(&self, id: NotificationId) -> Result<Notification, Error> {
        self.database
            .read(self.request_deadline, move |connection| {
                get_notification(id, connection)
            })
            .await
    }

    /// Retrieve the notifications of `owner` changed after `since`, most
    /// recent first.
    ///
    /// # Errors
    /// Returns an [Error::SqlError] if there is an SQL error.
    pub async fn get_notifications_since(
        &self,
        owner: UserId,
        since: OffsetDateTime,
    ) -> Result<Vec<Notification>, Error> {
        self.database
            .read(self.request_deadline, move |connection| {
                get_notifications_since(&owner, since, connection)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;
    use time::Duration;

    use crate::{
        broadcast::{Action, Collection},
        database_id::{HolderId, new_id},
        notification::{NewNotification, NotificationKind},
        subscription::{Interval, NewSubscription, Subscription},
        test_utils::{TEST_NOW, TestContext, balance_of},
        transaction::count_transactions,
        user::UserId,
    };

    use super::{REMINDER_TITLE, ScanReport};

    async fn monthly_from_now(context: &TestContext, source: HolderId) -> Subscription {
        context
            .scheduler
            .create_subscription(
                NewSubscription::new(
                    UserId::new("alice"),
                    "Rent",
                    dec!(500),
                    source,
                    new_id(),
                    TEST_NOW + Duration::days(10),
                    Interval::Month,
                )
                .remind_before(3),
            )
            .await
            .unwrap()
            .subscription
    }

    #[tokio::test]
    async fn reminder_is_sent_once() {
        let context = TestContext::new();
        let account = context.account("Everyday", dec!(1000));
        let subscription = monthly_from_now(&context, account).await;
        let now = TEST_NOW + Duration::days(7);

        let first = context.coordinator.scan_due_reminders(now).await.unwrap();
        let second = context.coordinator.scan_due_reminders(now).await.unwrap();

        assert_eq!(
            first,
            ScanReport {
                selected: 1,
                completed: 1,
                skipped: 0,
                failed: 0
            }
        );
        assert_eq!(second, ScanReport::default());
        let notifications = context
            .coordinator
            .get_notifications_since(UserId::new("alice"), TEST_NOW)
            .await
            .unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].title, REMINDER_TITLE);
        assert_eq!(notifications[0].kind, NotificationKind::Subscription);
        assert_eq!(notifications[0].reference_id, Some(subscription.id));
        assert_eq!(notifications[0].message, "Your subscription Rent is due in 3 days.");
    }

    #[tokio::test]
    async fn reminder_is_not_sent_early() {
        let context = TestContext::new();
        let account = context.account("Everyday", dec!(1000));
        monthly_from_now(&context, account).await;

        let report = context
            .coordinator
            .scan_due_reminders(TEST_NOW + Duration::days(6))
            .await
            .unwrap();

        assert_eq!(report.selected, 0);
    }

    #[tokio::test]
    async fn occurrence_scan_pays_and_renews() {
        let context = TestContext::new();
        let account = context.account("Everyday", dec!(1000));
        let subscription = monthly_from_now(&context, account).await;
        let mut events = context.broadcaster.subscribe();
        let now = TEST_NOW + Duration::days(11);

        let report = context.coordinator.scan_due_occurrences(now).await.unwrap();

        assert_eq!(report.completed, 1);
        assert_eq!(balance_of(&context.database, account), dec!(500));
        let renewed = context
            .scheduler
            .get_subscription(subscription.id)
            .await
            .unwrap();
        assert_eq!(renewed.current_interval, 1);
        assert_eq!(renewed.next_active, subscription.next_active + Duration::days(30));
        assert_eq!(renewed.notify_at, Some(renewed.next_active - Duration::days(3)));

        let created = events.try_recv().unwrap();
        assert_eq!((created.collection, created.action), (Collection::Transactions, Action::Create));
        assert_eq!(created.detail["date_time"], serde_json::json!("2025-06-11T12:00:00Z"));
        let renew = events.try_recv().unwrap();
        assert_eq!((renew.collection, renew.action), (Collection::Subscriptions, Action::Renew));

        let again = context.coordinator.scan_due_occurrences(now).await.unwrap();
        assert_eq!(again.selected, 0);
    }

    #[tokio::test]
    async fn failing_subscription_does_not_stop_the_scan() {
        let context = TestContext::new();
        let account = context.account("Everyday", dec!(1000));
        let broken = monthly_from_now(&context, account).await;
        let healthy = monthly_from_now(&context, account).await;
        {
            let connection = context.database.connection().lock().unwrap();
            connection
                .execute(
                    "UPDATE subscription SET interval = 'fortnight' WHERE id = ?1",
                    [broken.id],
                )
                .unwrap();
        }

        let report = context
            .coordinator
            .scan_due_occurrences(TEST_NOW + Duration::days(11))
            .await
            .unwrap();

        assert_eq!(
            report,
            ScanReport {
                selected: 2,
                completed: 1,
                skipped: 0,
                failed: 1
            }
        );
        let renewed = context.scheduler.get_subscription(healthy.id).await.unwrap();
        assert_eq!(renewed.current_interval, 1);
        let connection = context.database.connection().lock().unwrap();
        assert_eq!(count_transactions(&connection), Ok(1));
    }

    #[tokio::test]
    async fn occurrence_with_missing_holder_rolls_back() {
        let context = TestContext::new();
        let account = context.account("Everyday", dec!(1000));
        let subscription = monthly_from_now(&context, account).await;
        {
            let connection = context.database.connection().lock().unwrap();
            connection
                .execute(
                    "UPDATE subscription SET source_holder = ?1 WHERE id = ?2",
                    (new_id(), subscription.id),
                )
                .unwrap();
        }

        let report = context
            .coordinator
            .scan_due_occurrences(TEST_NOW + Duration::days(11))
            .await
            .unwrap();

        assert_eq!(report.failed, 1);
        let unchanged = context
            .scheduler
            .get_subscription(subscription.id)
            .await
            .unwrap();
        assert_eq!(unchanged.current_interval, 0);
        assert_eq!(balance_of(&context.database, account), dec!(1000));
    }

    #[tokio::test]
    async fn expired_batch_deadline_processes_nothing() {
        let context = TestContext::with_batch_deadline(std::time::Duration::ZERO);
        let account = context.account("Everyday", dec!(1000));
        monthly_from_now(&context, account).await;

        let result = context
            .coordinator
            .scan_due_occurrences(TEST_NOW + Duration::days(11))
            .await;

        assert!(result.is_err());
        assert_eq!(balance_of(&context.database, account), dec!(1000));
    }

    #[tokio::test]
    async fn user_notifications_flow() {
        let context = TestContext::new();
        let alice = UserId::new("alice");
        let mut events = context.broadcaster.subscribe();

        let created = context
            .coordinator
            .notify(NewNotification::new(
                alice.clone(),
                NotificationKind::FinishIncome,
                "Payday",
                "Your salary arrived.",
                TEST_NOW,
            ))
            .await
            .unwrap();
        let changed = context
            .coordinator
            .mark_as_read(alice.clone(), vec![created.id])
            .await
            .unwrap();
        context.coordinator.delete_notification(created.id).await.unwrap();

        assert_eq!(changed, 1);
        let stored = context.coordinator.get_notification(created.id).await.unwrap();
        assert!(stored.read);
        assert!(stored.is_deleted);
        let actions: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|event| event.action)
            .collect();
        assert_eq!(actions, vec![Action::Create, Action::Mark, Action::Delete]);
    }
}
