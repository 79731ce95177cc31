//! Background tasks that periodically scan for due subscriptions.

use std::{future::Future, time::Duration};

use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};

use crate::notification::NotificationCoordinator;

/// A job that runs on a fixed period until stopped.
///
/// The first run happens one period after the task starts. A run that is
/// in progress when the task is stopped is allowed to finish.
#[derive(Debug)]
pub struct PeriodicTask {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Spawn a task that runs `job` every `period`.
    ///
    /// # Panics
    /// Panics if `period` is zero or if called outside a tokio runtime.
    pub fn start<F, Fut>(name: &'static str, period: Duration, mut job: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, mut shutdown_receiver) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        tracing::debug!("{name} tick");
                        job().await;
                    }
                    _ = shutdown_receiver.changed() => {
                        tracing::debug!("{name} received shutdown signal");
                        break;
                    }
                }
            }
        });

        tracing::info!("started {name}, running every {period:?}");

        Self {
            name,
            shutdown,
            handle,
        }
    }

    /// Stop the task and wait for it to finish.
    pub async fn stop(self) {
        if self.shutdown.send(true).is_err() {
            tracing::debug!("{} had already stopped", self.name);
        }

        if let Err(error) = self.handle.await {
            tracing::error!("{} did not stop cleanly: {error}", self.name);
        }

        tracing::info!("stopped {}", self.name);
    }
}

/// The two pollers that drive the subscription scans.
#[derive(Debug)]
pub struct Pollers {
    occurrences: PeriodicTask,
    reminders: PeriodicTask,
}

impl Pollers {
    /// Start polling for due occurrences and due reminders every `period`.
    ///
    /// Each scan reads "now" from the coordinator's clock. Scan errors are
    /// logged and the poller carries on.
    pub fn start(coordinator: NotificationCoordinator, period: Duration) -> Self {
        let occurrence_coordinator = coordinator.clone();
        let occurrences = PeriodicTask::start("occurrence poller", period, move || {
            let coordinator = occurrence_coordinator.clone();

            async move {
                let now = coordinator.clock().now();

                if let Err(error) = coordinator.scan_due_occurrences(now).await {
                    tracing::error!("could not scan for due occurrences: {error}");
                }
            }
        });

        let reminders = PeriodicTask::start("reminder poller", period, move || {
            let coordinator = coordinator.clone();

            async move {
                let now = coordinator.clock().now();

                if let Err(error) = coordinator.scan_due_reminders(now).await {
                    tracing::error!("could not scan for due reminders: {error}");
                }
            }
        });

        Self {
            occurrences,
            reminders,
        }
    }

    /// Stop both pollers and wait for them to finish.
    pub async fn stop(self) {
        tokio::join!(self.occurrences.stop(), self.reminders.stop());
    }
}
