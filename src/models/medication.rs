use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A medication as read from the remote store. Owned by exactly one subject;
/// mutated only through medication-management flows outside this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Medication {
    pub id: Uuid,
    pub subject_id: Uuid,
    pub name: String,
    pub dosage: String,
    pub frequency: String,
    /// Ordered scheduled times of day as `HH:MM` strings. Empty means
    /// unscheduled — expected once per day at no particular time.
    pub time_of_day: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Medication {
    /// Parsed scheduled times, in schedule order. Malformed entries are
    /// skipped with a warning — one bad row must not blank the whole schedule.
    pub fn scheduled_times(&self) -> Vec<NaiveTime> {
        self.time_of_day
            .iter()
            .filter_map(|raw| match NaiveTime::parse_from_str(raw, "%H:%M") {
                Ok(time) => Some(time),
                Err(_) => {
                    tracing::warn!(medication = %self.id, time = %raw, "Skipping malformed schedule time");
                    None
                }
            })
            .collect()
    }

    /// Whether the medication has no fixed slot times.
    pub fn is_unscheduled(&self) -> bool {
        self.scheduled_times().is_empty()
    }
}
