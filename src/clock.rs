//! Injected time source.
//!
//! All "now"-dependent logic (slot states, streaks, rolling windows) goes
//! through the `Clock` trait so tests can fix time. Day keys are derived in
//! the subject's local offset, never raw UTC — a dose taken at 23:30 local
//! belongs to that local day regardless of where UTC midnight falls.

use std::sync::Mutex;

use chrono::{DateTime, Days, Duration, FixedOffset, Local, NaiveDate, NaiveTime, Utc};

/// Time source for the engine.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;

    /// The subject's local UTC offset, used to derive calendar-day keys.
    fn offset(&self) -> FixedOffset;

    /// Subject-local calendar day of an instant.
    fn local_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.offset()).date_naive()
    }

    /// Subject-local calendar day of `now`.
    fn today(&self) -> NaiveDate {
        self.local_date(self.now())
    }

    /// The instant corresponding to a local wall-clock time on a local day.
    fn instant_at(&self, day: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
        let local = day.and_time(time);
        (local - Duration::seconds(i64::from(self.offset().local_minus_utc()))).and_utc()
    }

    /// Half-open instant range `[start of day, start of next day)`.
    fn day_bounds(&self, day: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        (
            self.instant_at(day, NaiveTime::MIN),
            self.instant_at(day + Days::new(1), NaiveTime::MIN),
        )
    }
}

/// Production clock: system time, host-local offset.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn offset(&self) -> FixedOffset {
        *Local::now().offset()
    }
}

/// Settable clock for tests and simulations.
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
    offset: FixedOffset,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>, offset: FixedOffset) -> Self {
        Self {
            now: Mutex::new(now),
            offset,
        }
    }

    /// Fixed clock in UTC.
    pub fn utc(now: DateTime<Utc>) -> Self {
        Self::new(now, FixedOffset::east_opt(0).expect("zero offset is valid"))
    }

    pub fn set_now(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }

    pub fn advance(&self, delta: Duration) {
        if let Ok(mut guard) = self.now.lock() {
            *guard += delta;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.now
            .lock()
            .map(|guard| *guard)
            .unwrap_or_else(|poisoned| *poisoned.into_inner())
    }

    fn offset(&self) -> FixedOffset {
        self.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).single().unwrap()
    }

    #[test]
    fn fixed_clock_reports_what_it_was_given() {
        let clock = FixedClock::utc(at(2024, 3, 10, 9, 30));
        assert_eq!(clock.now(), at(2024, 3, 10, 9, 30));
        assert_eq!(clock.today(), NaiveDate::from_ymd_opt(2024, 3, 10).unwrap());
    }

    #[test]
    fn advance_moves_now_forward() {
        let clock = FixedClock::utc(at(2024, 3, 10, 9, 0));
        clock.advance(Duration::hours(20));
        assert_eq!(clock.today(), NaiveDate::from_ymd_opt(2024, 3, 11).unwrap());
    }

    #[test]
    fn local_day_respects_offset() {
        // 23:30 local in UTC+2 is 21:30 UTC — still the local day.
        let offset = FixedOffset::east_opt(2 * 3600).unwrap();
        let clock = FixedClock::new(at(2024, 3, 10, 21, 30), offset);
        assert_eq!(clock.today(), NaiveDate::from_ymd_opt(2024, 3, 10).unwrap());

        // 23:30 UTC in UTC+2 is already the next local day.
        clock.set_now(at(2024, 3, 10, 23, 30));
        assert_eq!(clock.today(), NaiveDate::from_ymd_opt(2024, 3, 11).unwrap());
    }

    #[test]
    fn instant_at_round_trips_through_local_date() {
        let offset = FixedOffset::west_opt(5 * 3600).unwrap();
        let clock = FixedClock::new(at(2024, 6, 1, 12, 0), offset);
        let day = NaiveDate::from_ymd_opt(2024, 5, 20).unwrap();
        let time = NaiveTime::from_hms_opt(8, 0, 0).unwrap();

        let instant = clock.instant_at(day, time);
        assert_eq!(clock.local_date(instant), day);
        // 08:00 local at UTC-5 is 13:00 UTC.
        assert_eq!(instant, at(2024, 5, 20, 13, 0));
    }

    #[test]
    fn day_bounds_are_half_open_and_contiguous() {
        let clock = FixedClock::utc(at(2024, 3, 10, 0, 0));
        let day = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        let (start, end) = clock.day_bounds(day);
        assert_eq!(start, at(2024, 3, 10, 0, 0));
        assert_eq!(end, at(2024, 3, 11, 0, 0));
        let (next_start, _) = clock.day_bounds(day + Days::new(1));
        assert_eq!(end, next_start);
    }
}
