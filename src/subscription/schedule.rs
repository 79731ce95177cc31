//! Date arithmetic for subscription schedules.
//!
//! Occurrence `n` is always computed from the start date, never from the
//! previous occurrence, so month-end clamping does not accumulate: a monthly
//! subscription starting on 31 January falls on 30 April, then 31 May.

use time::{Date, Duration, Month, OffsetDateTime, util::is_leap_year};

use crate::{Error, subscription::core::Interval};

fn days_in_month(year: i32, month: Month) -> u8 {
    match month {
        Month::January
        | Month::March
        | Month::May
        | Month::July
        | Month::August
        | Month::October
        | Month::December => 31,
        Month::April | Month::June | Month::September | Month::November => 30,
        Month::February if is_leap_year(year) => 29,
        Month::February => 28,
    }
}

fn out_of_range(start: OffsetDateTime, interval: Interval, count: u32) -> Error {
    Error::ScheduleOutOfRange(format!(
        "occurrence {count} of the {interval} schedule starting {start} is not a valid date"
    ))
}

fn add_months(start: OffsetDateTime, months: i64) -> Option<OffsetDateTime> {
    let month_index = start.year() as i64 * 12 + (start.month() as i64 - 1) + months;
    let year = i32::try_from(month_index.div_euclid(12)).ok()?;
    let month = Month::try_from(month_index.rem_euclid(12) as u8 + 1).ok()?;
    let day = start.day().min(days_in_month(year, month));

    let date = Date::from_calendar_date(year, month, day).ok()?;

    Some(start.replace_date(date))
}

/// The date of occurrence `count` of a schedule starting at `start`.
///
/// Occurrence zero is `start` itself. Month and year steps clamp the day to
/// the last day of the target month.
///
/// # Errors
/// Returns an [Error::ScheduleOutOfRange] if the occurrence falls outside the
/// representable range of dates.
pub fn step(start: OffsetDateTime, interval: Interval, count: u32) -> Result<OffsetDateTime, Error> {
    let count_i64 = i64::from(count);

    let occurrence = match interval {
        Interval::Week => i32::try_from(count)
            .ok()
            .and_then(|count| Duration::WEEK.checked_mul(count))
            .and_then(|offset| start.checked_add(offset)),
        Interval::Month => add_months(start, count_i64),
        Interval::Year => add_months(start, count_i64 * 12),
        Interval::Test => start.checked_add(Duration::minutes(count_i64)),
    };

    occurrence.ok_or_else(|| out_of_range(start, interval, count))
}

/// The schedule state of a subscription after `current_interval` occurrences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Renewal {
    /// The number of occurrences materialized.
    pub current_interval: u32,
    /// When the next occurrence is due.
    pub next_active: OffsetDateTime,
    /// When to remind the creator about the next occurrence.
    pub notify_at: Option<OffsetDateTime>,
    /// Whether the next occurrence is within the cap.
    pub is_active: bool,
}

impl Renewal {
    /// Compute the state after `current_interval` occurrences.
    ///
    /// A schedule with `max_interval > 0` stops once `current_interval`
    /// reaches it. The reminder is due `remind_before` days before the next
    /// occurrence, or at the occurrence itself when `remind_before <= 0`.
    ///
    /// # Errors
    /// Returns an [Error::ScheduleOutOfRange] if the next occurrence or its
    /// reminder is not a valid date.
    pub fn after(
        start: OffsetDateTime,
        interval: Interval,
        max_interval: u32,
        remind_before: i64,
        current_interval: u32,
    ) -> Result<Self, Error> {
        let next_active = step(start, interval, current_interval)?;

        let notify_at = if remind_before <= 0 {
            next_active
        } else {
            i32::try_from(remind_before)
                .ok()
                .and_then(|days| Duration::DAY.checked_mul(days))
                .and_then(|lead_time| next_active.checked_sub(lead_time))
                .ok_or_else(|| out_of_range(start, interval, current_interval))?
        };

        Ok(Self {
            current_interval,
            next_active,
            notify_at: Some(notify_at),
            is_active: max_interval == 0 || current_interval < max_interval,
        })
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use crate::{Error, subscription::core::Interval};

    use super::{Renewal, step};

    #[test]
    fn month_end_clamps_without_accumulating() {
        let start = datetime!(2024-01-31 8:00 UTC);

        assert_eq!(step(start, Interval::Month, 1), Ok(datetime!(2024-02-29 8:00 UTC)));
        assert_eq!(step(start, Interval::Month, 3), Ok(datetime!(2024-04-30 8:00 UTC)));
        assert_eq!(step(start, Interval::Month, 4), Ok(datetime!(2024-05-31 8:00 UTC)));
        assert_eq!(step(start, Interval::Month, 13), Ok(datetime!(2025-02-28 8:00 UTC)));
    }

    #[test]
    fn leap_day_clamps_in_common_years() {
        let start = datetime!(2024-02-29 0:00 UTC);

        assert_eq!(step(start, Interval::Year, 1), Ok(datetime!(2025-02-28 0:00 UTC)));
        assert_eq!(step(start, Interval::Year, 4), Ok(datetime!(2028-02-29 0:00 UTC)));
    }

    #[test]
    fn week_and_test_steps() {
        let start = datetime!(2025-12-29 23:30 UTC);

        assert_eq!(step(start, Interval::Week, 0), Ok(start));
        assert_eq!(step(start, Interval::Week, 2), Ok(datetime!(2026-01-12 23:30 UTC)));
        assert_eq!(step(start, Interval::Test, 45), Ok(datetime!(2025-12-30 0:15 UTC)));
    }

    #[test]
    fn month_step_crosses_year_boundary() {
        let start = datetime!(2025-11-15 12:00 UTC);

        assert_eq!(step(start, Interval::Month, 2), Ok(datetime!(2026-01-15 12:00 UTC)));
    }

    #[test]
    fn out_of_range_step_is_an_error() {
        let result = step(datetime!(2025-01-01 0:00 UTC), Interval::Year, u32::MAX);

        assert!(matches!(result, Err(Error::ScheduleOutOfRange(_))));
    }

    #[test]
    fn renewal_reminds_before_next_occurrence() {
        let start = datetime!(2025-01-15 9:00 UTC);

        let renewal = Renewal::after(start, Interval::Month, 0, 3, 2).unwrap();

        assert_eq!(renewal.next_active, datetime!(2025-03-15 9:00 UTC));
        assert_eq!(renewal.notify_at, Some(datetime!(2025-03-12 9:00 UTC)));
        assert!(renewal.is_active);
    }

    #[test]
    fn renewal_without_lead_time_reminds_at_occurrence() {
        let start = datetime!(2025-01-15 9:00 UTC);

        let renewal = Renewal::after(start, Interval::Week, 0, 0, 1).unwrap();

        assert_eq!(renewal.notify_at, Some(renewal.next_active));
    }

    #[test]
    fn negative_lead_time_reminds_at_occurrence() {
        let start = datetime!(2025-01-15 9:00 UTC);

        let renewal = Renewal::after(start, Interval::Month, 0, -4, 1).unwrap();

        assert_eq!(renewal.next_active, datetime!(2025-02-15 9:00 UTC));
        assert_eq!(renewal.notify_at, Some(renewal.next_active));
    }

    #[test]
    fn renewal_deactivates_at_cap() {
        let start = datetime!(2025-01-15 9:00 UTC);

        assert!(Renewal::after(start, Interval::Week, 5, 0, 4).unwrap().is_active);
        assert!(!Renewal::after(start, Interval::Week, 5, 0, 5).unwrap().is_active);
    }
}
