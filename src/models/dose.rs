use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A recorded dose event. Immutable once committed — `taken_at` is set at
/// creation and never edited; undo is whole-record deletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoseRecord {
    pub id: Uuid,
    pub medication_id: Uuid,
    pub taken_at: DateTime<Utc>,
}

/// Insert payload for a new dose row. The store assigns the identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDose {
    pub medication_id: Uuid,
    pub taken_at: DateTime<Utc>,
}
