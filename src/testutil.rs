//! In-memory collaborator fakes shared by the engine, mutation, and realtime
//! tests: a remote store with failure injection and a gate for holding writes
//! in flight, an attachment store, and a change feed with manual delivery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::models::{DoseRecord, Medication, NewDose, ProofReport};
use crate::store::{
    AttachmentScope, AttachmentStore, ChangeEvent, ChangeFeed, ChangeHandler, QueryFilter,
    RemoteStore, SortOrder, StoreError, SubscriptionHandle, Table,
};

// ═══════════════════════════════════════════════════════════
// MemoryStore
// ═══════════════════════════════════════════════════════════

#[derive(Default)]
struct StoreState {
    medications: Vec<Medication>,
    doses: Vec<DoseRecord>,
    reports: Vec<ProofReport>,
}

/// Insert payload shape for the reports table.
#[derive(Deserialize)]
struct NewReport {
    subject_id: Uuid,
    medication_id: Option<Uuid>,
    report_name: String,
    file_url: String,
    uploaded_at: DateTime<Utc>,
}

pub(crate) struct MemoryStore {
    state: Mutex<StoreState>,
    ops: Mutex<Vec<String>>,
    fail_dose_insert: AtomicBool,
    fail_report_insert: AtomicBool,
    fail_delete: AtomicBool,
    fail_query: AtomicBool,
    query_count: AtomicUsize,
    gate_dose_inserts: AtomicBool,
    dose_insert_gate: Semaphore,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            ops: Mutex::new(Vec::new()),
            fail_dose_insert: AtomicBool::new(false),
            fail_report_insert: AtomicBool::new(false),
            fail_delete: AtomicBool::new(false),
            fail_query: AtomicBool::new(false),
            query_count: AtomicUsize::new(0),
            gate_dose_inserts: AtomicBool::new(false),
            dose_insert_gate: Semaphore::new(0),
        }
    }

    pub fn seed_medication(&self, medication: Medication) {
        self.lock_state().medications.push(medication);
    }

    pub fn seed_dose(&self, dose: DoseRecord) {
        self.lock_state().doses.push(dose);
    }

    pub fn doses(&self) -> Vec<DoseRecord> {
        self.lock_state().doses.clone()
    }

    pub fn reports(&self) -> Vec<ProofReport> {
        self.lock_state().reports.clone()
    }

    pub fn dose_count(&self) -> usize {
        self.lock_state().doses.len()
    }

    /// Chronological log of write operations, e.g. `"insert medication_doses"`.
    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    pub fn query_count(&self) -> usize {
        self.query_count.load(Ordering::SeqCst)
    }

    pub fn set_fail_dose_insert(&self, fail: bool) {
        self.fail_dose_insert.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_report_insert(&self, fail: bool) {
        self.fail_report_insert.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_delete(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_query(&self, fail: bool) {
        self.fail_query.store(fail, Ordering::SeqCst);
    }

    /// Hold subsequent dose inserts until `release_dose_insert` grants one.
    pub fn gate_dose_inserts(&self) {
        self.gate_dose_inserts.store(true, Ordering::SeqCst);
    }

    pub fn release_dose_insert(&self) {
        self.dose_insert_gate.add_permits(1);
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap()
    }

    fn log_op(&self, op: String) {
        self.ops.lock().unwrap().push(op);
    }

    fn subject_of(&self, medication_id: Uuid) -> Option<Uuid> {
        self.lock_state()
            .medications
            .iter()
            .find(|m| m.id == medication_id)
            .map(|m| m.subject_id)
    }
}

impl RemoteStore for MemoryStore {
    fn insert(&self, table: Table, fields: Value) -> BoxFuture<'_, Result<Value, StoreError>> {
        async move {
            if table == Table::Doses && self.gate_dose_inserts.load(Ordering::SeqCst) {
                let permit = self
                    .dose_insert_gate
                    .acquire()
                    .await
                    .map_err(|_| StoreError::Unavailable("gate closed".into()))?;
                permit.forget();
            }
            match table {
                Table::Doses => {
                    if self.fail_dose_insert.load(Ordering::SeqCst) {
                        return Err(StoreError::Unavailable("injected dose-insert failure".into()));
                    }
                    let new: NewDose = serde_json::from_value(fields)
                        .map_err(|e| StoreError::Rejected(e.to_string()))?;
                    let dose = DoseRecord {
                        id: Uuid::new_v4(),
                        medication_id: new.medication_id,
                        taken_at: new.taken_at,
                    };
                    self.lock_state().doses.push(dose.clone());
                    self.log_op(format!("insert {table}"));
                    serde_json::to_value(&dose).map_err(|e| StoreError::Rejected(e.to_string()))
                }
                Table::Reports => {
                    if self.fail_report_insert.load(Ordering::SeqCst) {
                        return Err(StoreError::Rejected("injected report-insert failure".into()));
                    }
                    let new: NewReport = serde_json::from_value(fields)
                        .map_err(|e| StoreError::Rejected(e.to_string()))?;
                    let report = ProofReport {
                        id: Uuid::new_v4(),
                        subject_id: new.subject_id,
                        medication_id: new.medication_id,
                        report_name: new.report_name,
                        file_url: new.file_url,
                        uploaded_at: new.uploaded_at,
                    };
                    self.lock_state().reports.push(report.clone());
                    self.log_op(format!("insert {table}"));
                    serde_json::to_value(&report).map_err(|e| StoreError::Rejected(e.to_string()))
                }
                Table::Medications => {
                    let medication: Medication = serde_json::from_value(fields)
                        .map_err(|e| StoreError::Rejected(e.to_string()))?;
                    self.lock_state().medications.push(medication.clone());
                    self.log_op(format!("insert {table}"));
                    serde_json::to_value(&medication)
                        .map_err(|e| StoreError::Rejected(e.to_string()))
                }
            }
        }
        .boxed()
    }

    fn update(
        &self,
        table: Table,
        _id: Uuid,
        _fields: Value,
    ) -> BoxFuture<'_, Result<Value, StoreError>> {
        async move { Err(StoreError::Rejected(format!("update on {table} not exercised"))) }.boxed()
    }

    fn delete(&self, table: Table, id: Uuid) -> BoxFuture<'_, Result<(), StoreError>> {
        async move {
            if self.fail_delete.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("injected delete failure".into()));
            }
            match table {
                Table::Doses => self.lock_state().doses.retain(|d| d.id != id),
                Table::Reports => self.lock_state().reports.retain(|r| r.id != id),
                Table::Medications => self.lock_state().medications.retain(|m| m.id != id),
            }
            self.log_op(format!("delete {table}"));
            Ok(())
        }
        .boxed()
    }

    fn query(
        &self,
        table: Table,
        filter: QueryFilter,
        order: SortOrder,
    ) -> BoxFuture<'_, Result<Vec<Value>, StoreError>> {
        async move {
            self.query_count.fetch_add(1, Ordering::SeqCst);
            if self.fail_query.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("injected query failure".into()));
            }
            let rows: Vec<Value> = match table {
                Table::Doses => {
                    let mut doses: Vec<DoseRecord> = self
                        .doses()
                        .into_iter()
                        .filter(|d| {
                            filter.medication.map_or(true, |m| d.medication_id == m)
                                && filter
                                    .subject
                                    .map_or(true, |s| self.subject_of(d.medication_id) == Some(s))
                                && filter
                                    .between
                                    .map_or(true, |(start, end)| d.taken_at >= start && d.taken_at < end)
                        })
                        .collect();
                    doses.sort_by_key(|d| d.taken_at);
                    if order == SortOrder::NewestFirst {
                        doses.reverse();
                    }
                    doses
                        .iter()
                        .map(|d| serde_json::to_value(d).unwrap())
                        .collect()
                }
                Table::Medications => {
                    let mut meds: Vec<Medication> = self
                        .lock_state()
                        .medications
                        .iter()
                        .filter(|m| filter.subject.map_or(true, |s| m.subject_id == s))
                        .cloned()
                        .collect();
                    meds.sort_by_key(|m| m.created_at);
                    if order == SortOrder::NewestFirst {
                        meds.reverse();
                    }
                    meds.iter().map(|m| serde_json::to_value(m).unwrap()).collect()
                }
                Table::Reports => {
                    let mut reports: Vec<ProofReport> = self
                        .lock_state()
                        .reports
                        .iter()
                        .filter(|r| {
                            filter.subject.map_or(true, |s| r.subject_id == s)
                                && filter.medication.map_or(true, |m| r.medication_id == Some(m))
                        })
                        .cloned()
                        .collect();
                    reports.sort_by_key(|r| r.uploaded_at);
                    if order == SortOrder::NewestFirst {
                        reports.reverse();
                    }
                    reports
                        .iter()
                        .map(|r| serde_json::to_value(r).unwrap())
                        .collect()
                }
            };
            Ok(rows)
        }
        .boxed()
    }
}

// ═══════════════════════════════════════════════════════════
// MemoryAttachments
// ═══════════════════════════════════════════════════════════

#[derive(Default)]
pub(crate) struct MemoryAttachments {
    fail: AtomicBool,
    stored: Mutex<Vec<String>>,
}

impl MemoryAttachments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn stored(&self) -> Vec<String> {
        self.stored.lock().unwrap().clone()
    }
}

impl AttachmentStore for MemoryAttachments {
    fn store(
        &self,
        scope: AttachmentScope,
        file_name: String,
        _bytes: Vec<u8>,
    ) -> BoxFuture<'_, Result<String, StoreError>> {
        async move {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("injected upload failure".into()));
            }
            let url = format!("memory://{}/{}/{}", scope.subject, scope.medication, file_name);
            self.stored.lock().unwrap().push(url.clone());
            Ok(url)
        }
        .boxed()
    }
}

// ═══════════════════════════════════════════════════════════
// MemoryFeed
// ═══════════════════════════════════════════════════════════

#[derive(Default)]
pub(crate) struct MemoryFeed {
    subscriptions: Mutex<HashMap<u64, (Uuid, ChangeHandler)>>,
    next_id: AtomicU64,
}

impl MemoryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event to every handler subscribed for the subject.
    pub fn emit(&self, subject: Uuid, event: ChangeEvent) {
        let handlers: Vec<ChangeHandler> = self
            .subscriptions
            .lock()
            .unwrap()
            .values()
            .filter(|(s, _)| *s == subject)
            .map(|(_, h)| h.clone())
            .collect();
        for handler in handlers {
            handler(event);
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().unwrap().len()
    }

    /// Clones of the live handlers, to simulate a feed replaying events after
    /// unsubscribe.
    pub fn handlers(&self) -> Vec<ChangeHandler> {
        self.subscriptions
            .lock()
            .unwrap()
            .values()
            .map(|(_, h)| h.clone())
            .collect()
    }
}

impl ChangeFeed for MemoryFeed {
    fn subscribe(&self, subject: Uuid, handler: ChangeHandler) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscriptions
            .lock()
            .unwrap()
            .insert(id, (subject, handler));
        SubscriptionHandle(id)
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.subscriptions.lock().unwrap().remove(&handle.0);
    }
}

// ═══════════════════════════════════════════════════════════
// Fixtures
// ═══════════════════════════════════════════════════════════

pub(crate) fn medication(subject: Uuid, times: &[&str]) -> Medication {
    Medication {
        id: Uuid::new_v4(),
        subject_id: subject,
        name: "Metoprolol".into(),
        dosage: "50mg".into(),
        frequency: "Twice daily".into(),
        time_of_day: times.iter().map(|t| t.to_string()).collect(),
        created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap(),
    }
}

pub(crate) fn dose_for(medication: &Medication, taken_at: DateTime<Utc>) -> DoseRecord {
    DoseRecord {
        id: Uuid::new_v4(),
        medication_id: medication.id,
        taken_at,
    }
}
