//! The engine facade: subject-context lifecycle and the operations exposed to
//! presentation layers.
//!
//! Derived adherence state has an explicit lifecycle — created when a subject
//! context is established, torn down when it changes. Nothing here is an
//! implicit singleton: activating a subject builds a fresh cache, mutation
//! coordinator, and realtime subscription; activating another subject (or
//! deactivating) tears them down, subscription included.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{NaiveDate, NaiveTime};
use futures_util::FutureExt;
use serde_json::Value;
use uuid::Uuid;

use crate::adherence::{self, AdherenceSummary, DayStanding};
use crate::cache::{CachedValue, DoseCache, FetchFn, ResourceKind, Scope};
use crate::clock::Clock;
use crate::error::EngineError;
use crate::models::{Attachment, DoseRecord, Medication, ProofReport};
use crate::mutation::{MutationCoordinator, MutationHandle, MutationKind};
use crate::realtime::RealtimeReconciler;
use crate::schedule::{self, SlotStatus};
use crate::store::{AttachmentStore, ChangeFeed, QueryFilter, RemoteStore, SortOrder, StoreError, Table};

// ═══════════════════════════════════════════════════════════
// Fetch wiring
// ═══════════════════════════════════════════════════════════

fn decode_rows<T: serde::de::DeserializeOwned>(
    rows: Vec<Value>,
    table: Table,
) -> Result<Vec<T>, StoreError> {
    rows.into_iter()
        .map(|row| {
            serde_json::from_value(row)
                .map_err(|e| StoreError::Rejected(format!("malformed {table} record: {e}")))
        })
        .collect()
}

/// Resolve a cache scope against the remote store.
fn build_fetch(store: Arc<dyn RemoteStore>, clock: Arc<dyn Clock>) -> FetchFn {
    Arc::new(move |scope: Scope| {
        let store = store.clone();
        let clock = clock.clone();
        async move {
            match scope.kind {
                ResourceKind::DoseDay => {
                    let medication = scope
                        .medication
                        .ok_or_else(|| StoreError::Rejected("day scope without medication".into()))?;
                    let day = scope
                        .day
                        .ok_or_else(|| StoreError::Rejected("day scope without day".into()))?;
                    let (start, end) = clock.day_bounds(day);
                    let rows = store
                        .query(
                            Table::Doses,
                            QueryFilter {
                                medication: Some(medication),
                                between: Some((start, end)),
                                ..Default::default()
                            },
                            SortOrder::NewestFirst,
                        )
                        .await?;
                    Ok(CachedValue::Doses(decode_rows(rows, Table::Doses)?))
                }
                ResourceKind::DoseLog => {
                    let rows = store
                        .query(
                            Table::Doses,
                            QueryFilter {
                                subject: Some(scope.subject),
                                ..Default::default()
                            },
                            SortOrder::NewestFirst,
                        )
                        .await?;
                    Ok(CachedValue::Doses(decode_rows(rows, Table::Doses)?))
                }
                ResourceKind::MedicationList => {
                    let rows = store
                        .query(
                            Table::Medications,
                            QueryFilter {
                                subject: Some(scope.subject),
                                ..Default::default()
                            },
                            SortOrder::OldestFirst,
                        )
                        .await?;
                    Ok(CachedValue::Medications(decode_rows(rows, Table::Medications)?))
                }
                ResourceKind::ReportList => {
                    let rows = store
                        .query(
                            Table::Reports,
                            QueryFilter {
                                subject: Some(scope.subject),
                                medication: scope.medication,
                                ..Default::default()
                            },
                            SortOrder::NewestFirst,
                        )
                        .await?;
                    Ok(CachedValue::Reports(decode_rows(rows, Table::Reports)?))
                }
            }
        }
        .boxed()
    })
}

// ═══════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════

/// Everything owned by one active subject context.
struct SubjectContext {
    subject: Uuid,
    cache: Arc<DoseCache>,
    coordinator: MutationCoordinator,
    // Held for its Drop: releases the change-feed subscription.
    _reconciler: RealtimeReconciler,
}

/// Cloned-out handles so operations never hold the context lock across I/O.
struct ActiveHandles {
    subject: Uuid,
    cache: Arc<DoseCache>,
    coordinator: MutationCoordinator,
}

/// The adherence & optimistic-sync engine.
pub struct AdherenceEngine {
    store: Arc<dyn RemoteStore>,
    attachments: Arc<dyn AttachmentStore>,
    feed: Arc<dyn ChangeFeed>,
    clock: Arc<dyn Clock>,
    context: Mutex<Option<SubjectContext>>,
}

impl AdherenceEngine {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        attachments: Arc<dyn AttachmentStore>,
        feed: Arc<dyn ChangeFeed>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            attachments,
            feed,
            clock,
            context: Mutex::new(None),
        }
    }

    fn lock_context(&self) -> MutexGuard<'_, Option<SubjectContext>> {
        self.context.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Context lifecycle ────────────────────────────────────

    /// Establish the context for a subject: fresh cache, coordinator, and
    /// realtime subscription. Any previous context is torn down first,
    /// subscription included — a caretaker switching patients never keeps the
    /// old patient's feed alive.
    pub fn activate_subject(&self, subject: Uuid) {
        let fetch = build_fetch(self.store.clone(), self.clock.clone());
        let cache = Arc::new(DoseCache::new(fetch, self.clock.clone()));
        let coordinator = MutationCoordinator::new(
            self.store.clone(),
            self.attachments.clone(),
            cache.clone(),
            self.clock.clone(),
        );
        let reconciler = RealtimeReconciler::new(self.feed.clone(), cache.clone());
        reconciler.watch_subject(subject);

        let mut guard = self.lock_context();
        *guard = Some(SubjectContext {
            subject,
            cache,
            coordinator,
            _reconciler: reconciler,
        });
        tracing::info!(%subject, "Subject context established");
    }

    /// Tear down the active context and its subscription.
    pub fn deactivate(&self) {
        let previous = self.lock_context().take();
        if let Some(context) = previous {
            tracing::info!(subject = %context.subject, "Subject context torn down");
        }
    }

    pub fn active_subject(&self) -> Option<Uuid> {
        self.lock_context().as_ref().map(|ctx| ctx.subject)
    }

    fn handles(&self) -> Result<ActiveHandles, EngineError> {
        self.lock_context()
            .as_ref()
            .map(|ctx| ActiveHandles {
                subject: ctx.subject,
                cache: ctx.cache.clone(),
                coordinator: ctx.coordinator.clone(),
            })
            .ok_or(EngineError::NotAuthenticated)
    }

    // ── Read operations ──────────────────────────────────────

    /// Per-slot statuses for one medication on one day.
    pub async fn slot_statuses(
        &self,
        medication: &Medication,
        day: NaiveDate,
    ) -> Result<Vec<SlotStatus>, EngineError> {
        let handles = self.handles()?;
        let scope = Scope::dose_day(medication.subject_id, medication.id, day);
        let read = handles.cache.read(scope).await?;
        let doses = read.value.into_doses();
        Ok(schedule::slot_statuses(medication, day, &doses, self.clock.as_ref()))
    }

    /// Streak, rolling adherence, missed days, and the 7-day feed for the
    /// active subject. Shared by the patient header and caretaker summary.
    pub async fn adherence_summary(&self) -> Result<AdherenceSummary, EngineError> {
        let handles = self.handles()?;
        let read = handles.cache.read(Scope::dose_log(handles.subject)).await?;
        let doses = read.value.into_doses();
        Ok(adherence::summary(&doses, self.clock.as_ref()))
    }

    /// Calendar-dot classification of one day for the active subject.
    pub async fn day_standing(&self, day: NaiveDate) -> Result<DayStanding, EngineError> {
        let handles = self.handles()?;
        let read = handles.cache.read(Scope::dose_log(handles.subject)).await?;
        let days = adherence::day_set(&read.value.into_doses(), self.clock.as_ref());
        Ok(adherence::day_standing(&days, day, self.clock.today()))
    }

    /// The active subject's medications.
    pub async fn medications(&self) -> Result<Vec<Medication>, EngineError> {
        let handles = self.handles()?;
        let read = handles
            .cache
            .read(Scope::medication_list(handles.subject))
            .await?;
        Ok(read.value.into_medications())
    }

    /// Recorded doses for one medication on one day, newest first.
    pub async fn dose_history(
        &self,
        medication: &Medication,
        day: NaiveDate,
    ) -> Result<Vec<DoseRecord>, EngineError> {
        let handles = self.handles()?;
        let scope = Scope::dose_day(medication.subject_id, medication.id, day);
        let mut doses = handles.cache.read(scope).await?.value.into_doses();
        doses.sort_by(|a, b| b.taken_at.cmp(&a.taken_at));
        Ok(doses)
    }

    /// Proof reports for one medication, newest first.
    pub async fn proof_reports(
        &self,
        medication: &Medication,
    ) -> Result<Vec<ProofReport>, EngineError> {
        let handles = self.handles()?;
        let scope = Scope::report_list(medication.subject_id, medication.id);
        Ok(handles.cache.read(scope).await?.value.into_reports())
    }

    // ── Mutations ────────────────────────────────────────────

    /// Mark a slot taken, optionally with a proof attachment. A scheduled
    /// slot timestamps at the slot time on `day`; an unscheduled mark
    /// timestamps at `now`.
    pub fn mark_taken(
        &self,
        medication: &Medication,
        day: NaiveDate,
        slot_time: Option<NaiveTime>,
        attachment: Option<Attachment>,
    ) -> Result<MutationHandle, EngineError> {
        let handles = self.handles()?;
        let taken_at = match slot_time {
            Some(time) => self.clock.instant_at(day, time),
            None => self.clock.now(),
        };
        Ok(handles.coordinator.dispatch(MutationKind::MarkTaken {
            medication: medication.clone(),
            day,
            taken_at,
            attachment,
        }))
    }

    /// Delete a committed dose record.
    pub fn undo_dose(
        &self,
        medication: &Medication,
        day: NaiveDate,
        dose_id: Uuid,
    ) -> Result<MutationHandle, EngineError> {
        let handles = self.handles()?;
        Ok(handles.coordinator.dispatch(MutationKind::Undo {
            medication: medication.clone(),
            day,
            dose_id,
        }))
    }

    /// Caretaker logs a dose on the patient's behalf, timestamped now. Runs
    /// the same optimistic machine as the patient's own mark.
    pub fn log_dose_by_caretaker(
        &self,
        medication: &Medication,
    ) -> Result<MutationHandle, EngineError> {
        let handles = self.handles()?;
        Ok(handles.coordinator.dispatch(MutationKind::LogByCaretaker {
            medication: medication.clone(),
            day: self.clock.today(),
            taken_at: self.clock.now(),
        }))
    }

    #[cfg(test)]
    pub(crate) fn cache(&self) -> Option<Arc<DoseCache>> {
        self.lock_context().as_ref().map(|ctx| ctx.cache.clone())
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
