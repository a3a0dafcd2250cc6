//! Engine error taxonomy.
//!
//! Every remote-facing failure is converted to one of these kinds at the
//! read/mutation boundary — a raw transport error never reaches a caller.
//! Nothing here is fatal to the process: each failure is local to one
//! mutation or one cache scope.

use crate::store::StoreError;

/// Which half of the composite attachment write failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentStage {
    /// Storing the attachment bytes themselves.
    Upload,
    /// Inserting the proof-report metadata record.
    Metadata,
}

impl std::fmt::Display for AttachmentStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttachmentStage::Upload => write!(f, "upload"),
            AttachmentStage::Metadata => write!(f, "metadata"),
        }
    }
}

/// Errors surfaced by core engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The remote store rejected or lost a write. The optimistic patch has
    /// been rolled back; retry is the caller re-issuing the same mutation.
    #[error("Remote write failed: {source}")]
    RemoteWriteFailed {
        #[source]
        source: StoreError,
    },

    /// A scope's fetch failed and nothing usable was cached. When stale data
    /// exists it is kept and surfaced with an error flag instead of this.
    #[error("Remote read failed: {source}")]
    RemoteReadFailed {
        #[source]
        source: StoreError,
    },

    /// The attachment upload or its metadata insert failed. The whole
    /// composite write aborts — no dose record is created.
    #[error("Attachment {stage} failed: {source}")]
    AttachmentFailed {
        stage: AttachmentStage,
        #[source]
        source: StoreError,
    },

    /// No active subject context. Precondition failure, never retried
    /// automatically.
    #[error("No active subject context")]
    NotAuthenticated,
}

impl EngineError {
    /// Whether re-issuing the same operation can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, EngineError::NotAuthenticated)
    }
}
