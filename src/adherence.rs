//! Adherence metrics over the day set — streak, rolling 30-day adherence,
//! missed days, and the 7-day activity feed.
//!
//! Everything here is a pure function of the dose collection and `now`; the
//! cache owns the data, these functions only read a snapshot. The rolling
//! window is always anchored to today — never to a moving loop cursor.

use std::collections::BTreeSet;

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::config::{ACTIVITY_FEED_DAYS, ADHERENCE_WINDOW_DAYS, STREAK_WALK_CAP};
use crate::models::DoseRecord;

/// Subject-local calendar days with at least one recorded dose. Derived,
/// never stored — rebuilt whenever the dose collection changes.
pub type DaySet = BTreeSet<NaiveDate>;

/// One entry of the recent-activity feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayActivity {
    pub day: NaiveDate,
    pub taken: bool,
    /// Timestamp of the day's most recent dose, when any.
    pub time: Option<DateTime<Utc>>,
}

/// Calendar classification of a single day, for the month-view dots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DayStanding {
    /// At least one dose recorded.
    Taken,
    /// A past day with nothing recorded.
    MissedPast,
    /// Today, nothing recorded yet.
    Open,
    /// A future day.
    Upcoming,
}

/// Aggregate adherence view for a subject, shared by the patient header and
/// the caretaker summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdherenceSummary {
    pub streak: u32,
    pub monthly_pct: u32,
    pub missed_days: u32,
    pub taken_today: bool,
    pub taken_this_week: u32,
    /// Last 7 days, most recent first.
    pub recent_activity: Vec<DayActivity>,
}

/// Build the day set from a dose collection, deriving day keys in the
/// subject's local offset.
pub fn day_set(doses: &[DoseRecord], clock: &dyn Clock) -> DaySet {
    doses
        .iter()
        .map(|dose| clock.local_date(dose.taken_at))
        .collect()
}

/// Consecutive days ending today with at least one dose each. 0 if today has
/// none yet. The walk stops after `STREAK_WALK_CAP` counted days as a safety
/// bound against pathological data.
pub fn streak(days: &DaySet, today: NaiveDate) -> u32 {
    let mut count = 0u32;
    let mut cursor = today;
    while days.contains(&cursor) && count < STREAK_WALK_CAP {
        count += 1;
        cursor = match cursor.checked_sub_days(Days::new(1)) {
            Some(prev) => prev,
            None => break,
        };
    }
    count
}

/// Days of the inclusive 30-day window ending today that have a dose.
fn taken_in_window(days: &DaySet, today: NaiveDate) -> u32 {
    let start = today
        .checked_sub_days(Days::new(u64::from(ADHERENCE_WINDOW_DAYS) - 1))
        .unwrap_or(today);
    days.range(start..=today).count() as u32
}

/// Rolling adherence percentage: `round(100 × taken-days / 30)` over the
/// window anchored to today. 0 for an empty collection.
pub fn monthly_adherence(days: &DaySet, today: NaiveDate) -> u32 {
    if days.is_empty() {
        return 0;
    }
    let taken = taken_in_window(days, today);
    ((f64::from(taken) / f64::from(ADHERENCE_WINDOW_DAYS)) * 100.0).round() as u32
}

/// Days of the 30-day window with nothing recorded.
pub fn missed_days(days: &DaySet, today: NaiveDate) -> u32 {
    ADHERENCE_WINDOW_DAYS - taken_in_window(days, today)
}

/// The 7-day activity feed, most recent first. Each taken day carries the
/// timestamp of its most recent dose.
pub fn recent_activity(doses: &[DoseRecord], clock: &dyn Clock) -> Vec<DayActivity> {
    let days = day_set(doses, clock);
    let today = clock.today();
    (0..ACTIVITY_FEED_DAYS)
        .map(|i| {
            let day = today
                .checked_sub_days(Days::new(u64::from(i)))
                .unwrap_or(today);
            let time = doses
                .iter()
                .filter(|dose| clock.local_date(dose.taken_at) == day)
                .max_by_key(|dose| (dose.taken_at, dose.id))
                .map(|dose| dose.taken_at);
            DayActivity {
                day,
                taken: days.contains(&day),
                time,
            }
        })
        .collect()
}

/// Calendar-dot classification of an arbitrary day.
pub fn day_standing(days: &DaySet, day: NaiveDate, today: NaiveDate) -> DayStanding {
    if days.contains(&day) {
        DayStanding::Taken
    } else if day < today {
        DayStanding::MissedPast
    } else if day == today {
        DayStanding::Open
    } else {
        DayStanding::Upcoming
    }
}

/// The full summary in one derivation pass.
pub fn summary(doses: &[DoseRecord], clock: &dyn Clock) -> AdherenceSummary {
    let days = day_set(doses, clock);
    let today = clock.today();
    let recent = recent_activity(doses, clock);
    AdherenceSummary {
        streak: streak(&days, today),
        monthly_pct: monthly_adherence(&days, today),
        missed_days: missed_days(&days, today),
        taken_today: days.contains(&today),
        taken_this_week: recent.iter().filter(|a| a.taken).count() as u32,
        recent_activity: recent,
    }
}
