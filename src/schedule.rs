//! Schedule matcher — reconciles a medication's scheduled slot times against
//! recorded dose events for one day.
//!
//! Key properties:
//! - A dose satisfies a slot iff it falls in the ±15 minute tolerance window
//!   AND on the same subject-local calendar day.
//! - Matching is deterministic: per slot, the unclaimed dose nearest the
//!   scheduled instant wins; ties go to the earlier `taken_at`, then the
//!   smaller id. A dose is claimed by at most one slot — never double-counted.
//! - Unscheduled medications get a single synthetic slot keyed to the day.

use std::collections::HashSet;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::DOSE_TOLERANCE_MINUTES;
use crate::models::{DoseRecord, Medication};

// ═══════════════════════════════════════════════════════════
// View types
// ═══════════════════════════════════════════════════════════

/// Lifecycle state of one slot, relative to `now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotState {
    /// The day lies ahead — nothing to do yet.
    Future,
    /// Today, scheduled instant not yet reached. Actionable.
    DueSoon,
    /// Not satisfied and the scheduled instant has passed today. Still
    /// actionable — the dose can be marked late.
    Missed,
    /// Satisfied by a matched dose.
    Taken,
    /// A past day with no matching dose. Terminal, not actionable.
    NotApplicablePast,
}

impl SlotState {
    /// Whether the UI may offer a "mark taken" action for this slot.
    pub fn is_actionable(&self) -> bool {
        matches!(self, SlotState::DueSoon | SlotState::Missed)
    }
}

/// Status of one (medication, day, scheduled time) slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotStatus {
    /// Scheduled time of day. `None` for the synthetic unscheduled slot.
    pub time: Option<NaiveTime>,
    /// Instant the slot is anchored to (start of day for unscheduled).
    pub scheduled_at: DateTime<Utc>,
    pub taken: bool,
    pub matched_dose: Option<DoseRecord>,
    pub state: SlotState,
}

// ═══════════════════════════════════════════════════════════
// Matching
// ═══════════════════════════════════════════════════════════

/// One status per scheduled time, or a single synthetic slot when the
/// medication has no schedule. `doses` is the day's dose list from the cache;
/// records outside `day` (by the subject-local calendar) never match.
pub fn slot_statuses(
    medication: &Medication,
    day: NaiveDate,
    doses: &[DoseRecord],
    clock: &dyn Clock,
) -> Vec<SlotStatus> {
    let times = medication.scheduled_times();
    if times.is_empty() {
        return vec![unscheduled_slot(day, doses, clock)];
    }

    let tolerance = Duration::minutes(DOSE_TOLERANCE_MINUTES);
    let mut claimed: HashSet<Uuid> = HashSet::new();

    times
        .into_iter()
        .map(|time| {
            let scheduled_at = clock.instant_at(day, time);
            let matched = nearest_unclaimed(doses, &claimed, scheduled_at, tolerance, day, clock);
            if let Some(dose) = &matched {
                claimed.insert(dose.id);
            }
            let state = scheduled_state(day, scheduled_at, matched.is_some(), clock);
            SlotStatus {
                time: Some(time),
                scheduled_at,
                taken: matched.is_some(),
                matched_dose: matched,
                state,
            }
        })
        .collect()
}

/// Deterministic pick: nearest to the scheduled instant, ties broken by
/// earliest `taken_at`, then smallest id.
fn nearest_unclaimed(
    doses: &[DoseRecord],
    claimed: &HashSet<Uuid>,
    scheduled_at: DateTime<Utc>,
    tolerance: Duration,
    day: NaiveDate,
    clock: &dyn Clock,
) -> Option<DoseRecord> {
    doses
        .iter()
        .filter(|dose| !claimed.contains(&dose.id))
        .filter(|dose| clock.local_date(dose.taken_at) == day)
        .filter(|dose| {
            let delta = dose.taken_at - scheduled_at;
            delta >= -tolerance && delta <= tolerance
        })
        .min_by_key(|dose| {
            let distance = (dose.taken_at - scheduled_at).num_seconds().abs();
            (distance, dose.taken_at, dose.id)
        })
        .cloned()
}

/// State assignment for a scheduled slot, first match wins.
fn scheduled_state(
    day: NaiveDate,
    scheduled_at: DateTime<Utc>,
    taken: bool,
    clock: &dyn Clock,
) -> SlotState {
    let today = clock.today();
    if day > today {
        SlotState::Future
    } else if taken {
        SlotState::Taken
    } else if day == today && scheduled_at < clock.now() {
        SlotState::Missed
    } else if day == today {
        SlotState::DueSoon
    } else {
        SlotState::NotApplicablePast
    }
}

/// The synthetic once-per-day slot for an unscheduled medication: satisfied by
/// any dose on the day. The most recent dose of the day (ids as final
/// tie-break) supplies the displayed timestamp. Marking taken timestamps at
/// `now`, not a slot time.
fn unscheduled_slot(day: NaiveDate, doses: &[DoseRecord], clock: &dyn Clock) -> SlotStatus {
    let matched = doses
        .iter()
        .filter(|dose| clock.local_date(dose.taken_at) == day)
        .max_by_key(|dose| (dose.taken_at, dose.id))
        .cloned();

    let today = clock.today();
    let state = if day > today {
        SlotState::Future
    } else if matched.is_some() {
        SlotState::Taken
    } else if day == today {
        SlotState::Missed
    } else {
        SlotState::NotApplicablePast
    };

    SlotStatus {
        time: None,
        scheduled_at: clock.instant_at(day, NaiveTime::MIN),
        taken: matched.is_some(),
        matched_dose: matched,
        state,
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
