//! Optimistic mutation coordinator.
//!
//! Every write runs the same state machine:
//! `Staged → InFlight → {Committed | RolledBack} → Settled`.
//! The machine is a value type with checked transitions — not a pile of
//! callbacks — so rollback and settle are structurally always reached. The
//! optimistic patch is a latency hint, never the system of record: the settle
//! step invalidates every affected scope and re-syncs ground truth no matter
//! how the write ended.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::json;
use tokio::sync::watch;
use uuid::Uuid;

use crate::cache::{CachedValue, DoseCache, Scope};
use crate::clock::Clock;
use crate::error::{AttachmentStage, EngineError};
use crate::models::{Attachment, DoseRecord, Medication, NewDose};
use crate::store::{AttachmentScope, AttachmentStore, RemoteStore, StoreError, Table};

// ═══════════════════════════════════════════════════════════
// Mutation kinds
// ═══════════════════════════════════════════════════════════

/// The three writes the core supports.
#[derive(Debug, Clone)]
pub enum MutationKind {
    /// Patient marks a slot taken, optionally with a proof attachment.
    MarkTaken {
        medication: Medication,
        day: NaiveDate,
        taken_at: DateTime<Utc>,
        attachment: Option<Attachment>,
    },
    /// Whole-record deletion of a committed dose.
    Undo {
        medication: Medication,
        day: NaiveDate,
        dose_id: Uuid,
    },
    /// Caretaker logs a dose on the patient's behalf, timestamped now.
    LogByCaretaker {
        medication: Medication,
        day: NaiveDate,
        taken_at: DateTime<Utc>,
    },
}

impl MutationKind {
    fn medication(&self) -> &Medication {
        match self {
            MutationKind::MarkTaken { medication, .. }
            | MutationKind::Undo { medication, .. }
            | MutationKind::LogByCaretaker { medication, .. } => medication,
        }
    }

    fn day(&self) -> NaiveDate {
        match self {
            MutationKind::MarkTaken { day, .. }
            | MutationKind::Undo { day, .. }
            | MutationKind::LogByCaretaker { day, .. } => *day,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            MutationKind::MarkTaken { .. } => "mark_taken",
            MutationKind::Undo { .. } => "undo",
            MutationKind::LogByCaretaker { .. } => "log_by_caretaker",
        }
    }

    /// Every cache scope this write touches: the medication-day view, the
    /// subject's cross-medication dose log, and the report list when an
    /// attachment rides along.
    pub(crate) fn affected_scopes(&self) -> Vec<Scope> {
        let med = self.medication();
        let mut scopes = vec![
            Scope::dose_day(med.subject_id, med.id, self.day()),
            Scope::dose_log(med.subject_id),
        ];
        if matches!(self, MutationKind::MarkTaken { attachment: Some(_), .. }) {
            scopes.push(Scope::report_list(med.subject_id, med.id));
        }
        scopes
    }
}

// ═══════════════════════════════════════════════════════════
// State machine
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum MutationStatus {
    Staged,
    InFlight,
    Committed,
    RolledBack,
    Settled,
}

impl MutationStatus {
    fn can_advance_to(self, next: MutationStatus) -> bool {
        use MutationStatus::*;
        matches!(
            (self, next),
            (Staged, InFlight)
                | (InFlight, Committed)
                | (InFlight, RolledBack)
                | (Committed, Settled)
                | (RolledBack, Settled)
        )
    }
}

/// What a `MutationHandle` reports on every transition.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationProgress {
    pub status: MutationStatus,
    pub error: Option<String>,
}

/// One write in flight. Exists only for the duration of the mutation and is
/// never persisted.
pub(crate) struct PendingMutation {
    kind: MutationKind,
    scopes: Vec<Scope>,
    snapshots: HashMap<Scope, Option<CachedValue>>,
    status: MutationStatus,
}

impl PendingMutation {
    pub(crate) fn stage(kind: MutationKind) -> Self {
        let scopes = kind.affected_scopes();
        Self {
            kind,
            scopes,
            snapshots: HashMap::new(),
            status: MutationStatus::Staged,
        }
    }

    /// Transition to `next` if legal. An illegal transition is refused and
    /// logged — callers drive the machine linearly, so a refusal is a bug.
    pub(crate) fn advance(&mut self, next: MutationStatus) -> bool {
        if self.status.can_advance_to(next) {
            self.status = next;
            true
        } else {
            tracing::error!(
                mutation = self.kind.label(),
                from = ?self.status,
                to = ?next,
                "Refusing illegal mutation transition"
            );
            false
        }
    }

    pub(crate) fn status(&self) -> MutationStatus {
        self.status
    }

    pub(crate) fn scopes(&self) -> &[Scope] {
        &self.scopes
    }
}

// ═══════════════════════════════════════════════════════════
// Handle
// ═══════════════════════════════════════════════════════════

/// Committed result of a mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    /// The server-assigned dose record (not the optimistic temporary).
    Recorded { dose: DoseRecord },
    Removed { dose_id: Uuid },
}

/// Caller-facing handle for one dispatched mutation. Status transitions are
/// observable for UI binding; awaiting `settle` drives the write to its
/// terminal state.
pub struct MutationHandle {
    progress: watch::Receiver<MutationProgress>,
    outcome: BoxFuture<'static, Result<MutationOutcome, EngineError>>,
}

impl MutationHandle {
    pub fn progress(&self) -> MutationProgress {
        self.progress.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MutationProgress> {
        self.progress.clone()
    }

    /// Drive the mutation to Settled and return the outcome.
    pub async fn settle(self) -> Result<MutationOutcome, EngineError> {
        self.outcome.await
    }
}

// ═══════════════════════════════════════════════════════════
// Coordinator
// ═══════════════════════════════════════════════════════════

#[derive(Clone)]
pub(crate) struct MutationCoordinator {
    store: Arc<dyn RemoteStore>,
    attachments: Arc<dyn AttachmentStore>,
    cache: Arc<DoseCache>,
    clock: Arc<dyn Clock>,
}

impl MutationCoordinator {
    pub(crate) fn new(
        store: Arc<dyn RemoteStore>,
        attachments: Arc<dyn AttachmentStore>,
        cache: Arc<DoseCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            attachments,
            cache,
            clock,
        }
    }

    /// Stage a mutation and hand back its handle. The write runs as the
    /// handle is awaited.
    pub(crate) fn dispatch(&self, kind: MutationKind) -> MutationHandle {
        let (tx, rx) = watch::channel(MutationProgress {
            status: MutationStatus::Staged,
            error: None,
        });
        let coordinator = self.clone();
        let outcome = async move { coordinator.run(kind, tx).await }.boxed();
        MutationHandle {
            progress: rx,
            outcome,
        }
    }

    async fn run(
        &self,
        kind: MutationKind,
        tx: watch::Sender<MutationProgress>,
    ) -> Result<MutationOutcome, EngineError> {
        let mut pending = PendingMutation::stage(kind);
        tracing::debug!(mutation = pending.kind.label(), "Staging mutation");

        // Staged → InFlight: cancel racing reads, snapshot, patch.
        for scope in pending.scopes() {
            self.cache.cancel_in_flight(scope);
        }
        pending.snapshots = self.cache.snapshot(pending.scopes());
        self.apply_optimistic_patch(&pending.kind);
        pending.advance(MutationStatus::InFlight);
        let _ = tx.send(MutationProgress {
            status: MutationStatus::InFlight,
            error: None,
        });

        let written = self.write(&pending.kind).await;
        let outcome = match written {
            Ok(outcome) => {
                // The optimistic record is not reconciled field-by-field with
                // the server response; the settle-step re-sync restores truth.
                pending.advance(MutationStatus::Committed);
                let _ = tx.send(MutationProgress {
                    status: MutationStatus::Committed,
                    error: None,
                });
                Ok(outcome)
            }
            Err(err) => {
                for (scope, snapshot) in pending.snapshots.clone() {
                    self.cache.restore(&scope, snapshot);
                }
                pending.advance(MutationStatus::RolledBack);
                let _ = tx.send(MutationProgress {
                    status: MutationStatus::RolledBack,
                    error: Some(err.to_string()),
                });
                tracing::warn!(
                    mutation = pending.kind.label(),
                    error = %err,
                    "Mutation rolled back"
                );
                Err(err)
            }
        };

        // Settled — always, regardless of outcome: the next read must see
        // ground truth.
        self.cache.invalidate(pending.scopes());
        self.cache.refresh(pending.scopes()).await;
        pending.advance(MutationStatus::Settled);
        let _ = tx.send(MutationProgress {
            status: MutationStatus::Settled,
            error: outcome.as_ref().err().map(|e| e.to_string()),
        });
        tracing::debug!(mutation = pending.kind.label(), "Mutation settled");
        outcome
    }

    fn apply_optimistic_patch(&self, kind: &MutationKind) {
        let med = kind.medication();
        let day_scope = Scope::dose_day(med.subject_id, med.id, kind.day());
        let log_scope = Scope::dose_log(med.subject_id);
        match kind {
            MutationKind::MarkTaken {
                medication,
                taken_at,
                ..
            }
            | MutationKind::LogByCaretaker {
                medication,
                taken_at,
                ..
            } => {
                // Temporary identity, superseded by the settle re-sync.
                let temp = DoseRecord {
                    id: Uuid::new_v4(),
                    medication_id: medication.id,
                    taken_at: *taken_at,
                };
                for scope in [day_scope, log_scope] {
                    let temp = temp.clone();
                    self.cache.apply_patch(&scope, move |current| {
                        let mut doses = current
                            .cloned()
                            .map(CachedValue::into_doses)
                            .unwrap_or_default();
                        doses.insert(0, temp);
                        CachedValue::Doses(doses)
                    });
                }
            }
            MutationKind::Undo { dose_id, .. } => {
                for scope in [day_scope, log_scope] {
                    let dose_id = *dose_id;
                    self.cache.apply_patch(&scope, move |current| {
                        let doses = current
                            .cloned()
                            .map(CachedValue::into_doses)
                            .unwrap_or_default()
                            .into_iter()
                            .filter(|dose| dose.id != dose_id)
                            .collect();
                        CachedValue::Doses(doses)
                    });
                }
            }
        }
    }

    async fn write(&self, kind: &MutationKind) -> Result<MutationOutcome, EngineError> {
        match kind {
            MutationKind::MarkTaken {
                medication,
                taken_at,
                attachment,
                ..
            } => {
                // Attachment and its metadata must land before the dose row —
                // one logical unit, no orphaned halves.
                if let Some(attachment) = attachment {
                    self.store_attachment(medication, attachment).await?;
                }
                self.insert_dose(medication, *taken_at).await
            }
            MutationKind::LogByCaretaker {
                medication,
                taken_at,
                ..
            } => self.insert_dose(medication, *taken_at).await,
            MutationKind::Undo { dose_id, .. } => {
                self.store
                    .delete(Table::Doses, *dose_id)
                    .await
                    .map_err(|source| EngineError::RemoteWriteFailed { source })?;
                Ok(MutationOutcome::Removed { dose_id: *dose_id })
            }
        }
    }

    async fn insert_dose(
        &self,
        medication: &Medication,
        taken_at: DateTime<Utc>,
    ) -> Result<MutationOutcome, EngineError> {
        let fields = serde_json::to_value(NewDose {
            medication_id: medication.id,
            taken_at,
        })
        .map_err(|e| EngineError::RemoteWriteFailed {
            source: StoreError::Rejected(e.to_string()),
        })?;
        let record = self
            .store
            .insert(Table::Doses, fields)
            .await
            .map_err(|source| EngineError::RemoteWriteFailed { source })?;
        let dose: DoseRecord =
            serde_json::from_value(record).map_err(|e| EngineError::RemoteWriteFailed {
                source: StoreError::Rejected(format!("malformed dose record: {e}")),
            })?;
        Ok(MutationOutcome::Recorded { dose })
    }

    async fn store_attachment(
        &self,
        medication: &Medication,
        attachment: &Attachment,
    ) -> Result<(), EngineError> {
        let scope = AttachmentScope {
            subject: medication.subject_id,
            medication: medication.id,
        };
        let url = self
            .attachments
            .store(scope, attachment.file_name.clone(), attachment.bytes.clone())
            .await
            .map_err(|source| EngineError::AttachmentFailed {
                stage: AttachmentStage::Upload,
                source,
            })?;

        let now = self.clock.now();
        let fields = json!({
            "subject_id": medication.subject_id,
            "medication_id": medication.id,
            "report_name": format!(
                "Proof for {} ({})",
                medication.name,
                now.format("%b %d, %H:%M")
            ),
            "file_url": url,
            "uploaded_at": now,
        });
        self.store
            .insert(Table::Reports, fields)
            .await
            .map_err(|source| EngineError::AttachmentFailed {
                stage: AttachmentStage::Metadata,
                source,
            })?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
