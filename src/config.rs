//! Timing configuration for the services and pollers.

use std::time::Duration;

/// How long handler-triggered operations may take by default.
pub const DEFAULT_REQUEST_DEADLINE: Duration = Duration::from_secs(10);
/// How long one scan over due subscriptions may take by default.
pub const DEFAULT_BATCH_DEADLINE: Duration = Duration::from_secs(30);
/// How often the pollers scan for due subscriptions by default.
pub const DEFAULT_POLL_PERIOD: Duration = Duration::from_secs(60 * 60);
/// How often the pollers scan in development mode.
pub const DEV_POLL_PERIOD: Duration = Duration::from_secs(60);

/// The deadlines and periods that the services run with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// The deadline for a single ledger, scheduler or notification operation.
    pub request_deadline: Duration,
    /// The deadline shared by all the units of one scan.
    pub batch_deadline: Duration,
    /// The time between two scans of the same poller.
    pub poll_period: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            request_deadline: DEFAULT_REQUEST_DEADLINE,
            batch_deadline: DEFAULT_BATCH_DEADLINE,
            poll_period: DEFAULT_POLL_PERIOD,
        }
    }
}

impl Config {
    /// The development preset, which polls every minute so that `test`
    /// interval subscriptions can be watched as they happen.
    pub fn dev() -> Self {
        Self {
            poll_period: DEV_POLL_PERIOD,
            ..Default::default()
        }
    }
}
