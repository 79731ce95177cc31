//! Timestamp persistence and the clock used to read the current time.
//!
//! Timestamps are stored as Unix milliseconds in UTC. The value `0` is the
//! sentinel for "no timestamp", e.g. a subscription without a pending
//! reminder, so that selection filters stay a plain integer comparison.

use std::{
    fmt::Debug,
    sync::{Arc, Mutex},
};

use rusqlite::Row;
use time::{Duration, OffsetDateTime};

/// The stored value meaning "no timestamp".
pub const TIMESTAMP_NONE: i64 = 0;

/// Convert `timestamp` to the stored representation.
///
/// Sub-millisecond precision is truncated.
pub fn to_millis(timestamp: OffsetDateTime) -> i64 {
    (timestamp.unix_timestamp_nanos() / 1_000_000) as i64
}

/// Convert an optional timestamp to the stored representation, using
/// [TIMESTAMP_NONE] for `None`.
pub fn to_millis_or_none(timestamp: Option<OffsetDateTime>) -> i64 {
    timestamp.map_or(TIMESTAMP_NONE, to_millis)
}

/// Read the timestamp stored in column `index` of `row`.
pub fn timestamp_from_row(row: &Row, index: usize) -> Result<OffsetDateTime, rusqlite::Error> {
    let millis: i64 = row.get(index)?;

    OffsetDateTime::from_unix_timestamp_nanos(millis as i128 * 1_000_000).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Integer,
            Box::new(error),
        )
    })
}

/// Read an optional timestamp stored in column `index` of `row`, mapping
/// [TIMESTAMP_NONE] to `None`.
pub fn optional_timestamp_from_row(
    row: &Row,
    index: usize,
) -> Result<Option<OffsetDateTime>, rusqlite::Error> {
    let millis: i64 = row.get(index)?;

    if millis == TIMESTAMP_NONE {
        Ok(None)
    } else {
        timestamp_from_row(row, index).map(Some)
    }
}

/// A source for the current time.
///
/// Services read "now" through a clock so that tests can simulate the passage
/// of time without real delays.
pub trait Clock: Debug + Send + Sync {
    /// The current time.
    fn now(&self) -> OffsetDateTime;
}

/// The wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<OffsetDateTime>>,
}

impl ManualClock {
    /// Create a clock frozen at `now`.
    pub fn new(now: OffsetDateTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    /// Set the current time.
    pub fn set(&self, now: OffsetDateTime) {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = now;
    }

    /// Move the clock forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += duration;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use rusqlite::Connection;
    use time::{Duration, macros::datetime};

    use super::{
        Clock, ManualClock, TIMESTAMP_NONE, optional_timestamp_from_row, timestamp_from_row,
        to_millis, to_millis_or_none,
    };

    #[test]
    fn keeps_millisecond_precision() {
        let connection = Connection::open_in_memory().unwrap();
        let timestamp = datetime!(2025-03-14 15:09:26.535 UTC);

        let got = connection
            .query_row("SELECT ?1", [to_millis(timestamp)], |row| {
                timestamp_from_row(row, 0)
            })
            .unwrap();

        assert_eq!(got, timestamp);
    }

    #[test]
    fn sentinel_reads_as_none() {
        let connection = Connection::open_in_memory().unwrap();

        let got = connection
            .query_row("SELECT ?1", [to_millis_or_none(None)], |row| {
                optional_timestamp_from_row(row, 0)
            })
            .unwrap();

        assert_eq!(got, None);
        assert_eq!(to_millis_or_none(None), TIMESTAMP_NONE);
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(datetime!(2025-01-01 0:00 UTC));

        clock.advance(Duration::days(2));

        assert_eq!(clock.now(), datetime!(2025-01-03 0:00 UTC));
    }
}
