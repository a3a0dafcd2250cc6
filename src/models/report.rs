use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata record for a stored proof attachment (e.g. a photo of the pill
/// organizer). Created only by the attachment half of a mark-taken write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofReport {
    pub id: Uuid,
    pub subject_id: Uuid,
    pub medication_id: Option<Uuid>,
    pub report_name: String,
    pub file_url: String,
    pub uploaded_at: DateTime<Utc>,
}

/// An attachment staged by the caller for a mark-taken mutation. Cloned into
/// the write, never consumed — on failure the caller still holds it for retry.
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub file_name: String,
    pub bytes: Vec<u8>,
}
