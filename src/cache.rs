//! Scope-keyed cache of dose/medication query results.
//!
//! The single owner of mutable derived state. Readers get a consistent
//! snapshot; writers go through snapshot → optimistic patch → restore-or-
//! invalidate. Remote fetches run through an injected callback and are
//! abandoned cooperatively: cancellation bumps a per-scope generation, and a
//! fetch that resolves under a stale generation is discarded on arrival.
//!
//! Key properties:
//! - A stale entry is never served after its invalidating event was processed.
//! - Duplicate invalidations for one scope collapse into one refetch.
//! - A failed fetch keeps stale data and surfaces the error beside it,
//!   rather than clearing the entry.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, NaiveDate, Utc};
use futures_util::future::BoxFuture;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::EngineError;
use crate::models::{DoseRecord, Medication, ProofReport};
use crate::store::StoreError;

/// Attempts a read gives a repeatedly-superseded fetch before giving up.
const MAX_READ_ATTEMPTS: u32 = 3;

// ═══════════════════════════════════════════════════════════
// Scope — the cache key
// ═══════════════════════════════════════════════════════════

/// Which derived view a scope caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// One medication's doses for one day.
    DoseDay,
    /// Every dose of the subject, across medications.
    DoseLog,
    /// The subject's medication list.
    MedicationList,
    /// Proof reports for one medication.
    ReportList,
}

/// Key identifying one cached view. Scopes sharing a subject are overlapping
/// views of the same underlying data and invalidate together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Scope {
    pub kind: ResourceKind,
    pub subject: Uuid,
    pub medication: Option<Uuid>,
    pub day: Option<NaiveDate>,
}

impl Scope {
    pub fn dose_day(subject: Uuid, medication: Uuid, day: NaiveDate) -> Self {
        Self {
            kind: ResourceKind::DoseDay,
            subject,
            medication: Some(medication),
            day: Some(day),
        }
    }

    pub fn dose_log(subject: Uuid) -> Self {
        Self {
            kind: ResourceKind::DoseLog,
            subject,
            medication: None,
            day: None,
        }
    }

    pub fn medication_list(subject: Uuid) -> Self {
        Self {
            kind: ResourceKind::MedicationList,
            subject,
            medication: None,
            day: None,
        }
    }

    pub fn report_list(subject: Uuid, medication: Uuid) -> Self {
        Self {
            kind: ResourceKind::ReportList,
            subject,
            medication: Some(medication),
            day: None,
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}/{}", self.kind, self.subject)?;
        if let Some(med) = self.medication {
            write!(f, "/{med}")?;
        }
        if let Some(day) = self.day {
            write!(f, "/{day}")?;
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════
// Cached data
// ═══════════════════════════════════════════════════════════

/// The payload a scope caches. Variant follows the scope's resource kind.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
    Doses(Vec<DoseRecord>),
    Medications(Vec<Medication>),
    Reports(Vec<ProofReport>),
}

impl CachedValue {
    pub fn into_doses(self) -> Vec<DoseRecord> {
        match self {
            CachedValue::Doses(doses) => doses,
            _ => Vec::new(),
        }
    }

    pub fn into_medications(self) -> Vec<Medication> {
        match self {
            CachedValue::Medications(meds) => meds,
            _ => Vec::new(),
        }
    }

    pub fn into_reports(self) -> Vec<ProofReport> {
        match self {
            CachedValue::Reports(reports) => reports,
            _ => Vec::new(),
        }
    }
}

/// Result of a cache read. `stale` + `error` are set together when the fetch
/// failed but older data was worth keeping.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadResult {
    pub value: CachedValue,
    pub stale: bool,
    pub error: Option<StoreError>,
}

/// Fetch callback resolving a scope against the remote store.
pub type FetchFn =
    Arc<dyn Fn(Scope) -> BoxFuture<'static, Result<CachedValue, StoreError>> + Send + Sync>;

struct Entry {
    data: CachedValue,
    fetched_at: DateTime<Utc>,
    stale: bool,
    last_error: Option<StoreError>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<Scope, Entry>,
    /// Accepted generation per scope; a fetch started under an older
    /// generation is discarded when it resolves.
    generations: HashMap<Scope, u64>,
    /// Scopes with a fetch currently in flight (read or refetch).
    fetching: HashSet<Scope>,
}

// ═══════════════════════════════════════════════════════════
// DoseCache
// ═══════════════════════════════════════════════════════════

pub struct DoseCache {
    inner: Mutex<Inner>,
    fetch: FetchFn,
    clock: Arc<dyn Clock>,
}

impl DoseCache {
    pub fn new(fetch: FetchFn, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            fetch,
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Reads ────────────────────────────────────────────────

    /// Cached data if present and fresh, otherwise fetch through the injected
    /// callback. A fetch cancelled mid-flight is discarded on arrival and the
    /// read serves whatever the cache then holds (e.g. an optimistic patch).
    pub async fn read(&self, scope: Scope) -> Result<ReadResult, EngineError> {
        let mut attempts = 0u32;
        loop {
            let generation = {
                let mut inner = self.lock();
                if let Some(entry) = inner.entries.get(&scope) {
                    if !entry.stale {
                        return Ok(ReadResult {
                            value: entry.data.clone(),
                            stale: false,
                            error: None,
                        });
                    }
                }
                inner.fetching.insert(scope);
                *inner.generations.entry(scope).or_insert(0)
            };

            attempts += 1;
            let fetched = (self.fetch)(scope).await;

            let mut inner = self.lock();
            inner.fetching.remove(&scope);

            if inner.generations.get(&scope).copied().unwrap_or(0) != generation {
                // Cancelled or invalidated while in flight — discard.
                tracing::debug!(%scope, "Discarding abandoned fetch result");
                if let Some(entry) = inner.entries.get(&scope) {
                    if !entry.stale {
                        return Ok(ReadResult {
                            value: entry.data.clone(),
                            stale: false,
                            error: None,
                        });
                    }
                }
                if attempts >= MAX_READ_ATTEMPTS {
                    return Err(EngineError::RemoteReadFailed {
                        source: StoreError::Unavailable("fetch repeatedly superseded".into()),
                    });
                }
                continue;
            }

            return match fetched {
                Ok(value) => {
                    inner.entries.insert(
                        scope,
                        Entry {
                            data: value.clone(),
                            fetched_at: self.clock.now(),
                            stale: false,
                            last_error: None,
                        },
                    );
                    Ok(ReadResult {
                        value,
                        stale: false,
                        error: None,
                    })
                }
                Err(err) => {
                    if let Some(entry) = inner.entries.get_mut(&scope) {
                        // Keep what we had; surface the failure beside it.
                        entry.stale = true;
                        entry.last_error = Some(err.clone());
                        tracing::warn!(%scope, error = %err, "Fetch failed, serving stale data");
                        return Ok(ReadResult {
                            value: entry.data.clone(),
                            stale: true,
                            error: Some(err),
                        });
                    }
                    tracing::warn!(%scope, error = %err, "Fetch failed with nothing cached");
                    Err(EngineError::RemoteReadFailed { source: err })
                }
            };
        }
    }

    // ── Write-path hooks ─────────────────────────────────────

    /// Abandon any in-flight fetch for the scope; its result, if it later
    /// arrives, is discarded. Called by the write path before patching so a
    /// stale read cannot overwrite an optimistic patch.
    pub fn cancel_in_flight(&self, scope: &Scope) {
        let mut inner = self.lock();
        if inner.fetching.contains(scope) {
            *inner.generations.entry(*scope).or_insert(0) += 1;
            tracing::debug!(%scope, "Cancelled in-flight fetch");
        }
    }

    /// Current data per scope, for rollback. `None` marks "nothing cached".
    pub fn snapshot(&self, scopes: &[Scope]) -> HashMap<Scope, Option<CachedValue>> {
        let inner = self.lock();
        scopes
            .iter()
            .map(|scope| (*scope, inner.entries.get(scope).map(|e| e.data.clone())))
            .collect()
    }

    /// Replace a scope's data with `transform(current)` without touching the
    /// remote store — the optimistic patch.
    pub fn apply_patch<F>(&self, scope: &Scope, transform: F)
    where
        F: FnOnce(Option<&CachedValue>) -> CachedValue,
    {
        let mut inner = self.lock();
        let next = transform(inner.entries.get(scope).map(|e| &e.data));
        inner.entries.insert(
            *scope,
            Entry {
                data: next,
                fetched_at: self.clock.now(),
                stale: false,
                last_error: None,
            },
        );
    }

    /// Hard-reset a scope to a previously captured snapshot value.
    pub fn restore(&self, scope: &Scope, snapshot: Option<CachedValue>) {
        let mut inner = self.lock();
        match snapshot {
            Some(data) => {
                inner.entries.insert(
                    *scope,
                    Entry {
                        data,
                        fetched_at: self.clock.now(),
                        stale: false,
                        last_error: None,
                    },
                );
            }
            None => {
                inner.entries.remove(scope);
            }
        }
    }

    // ── Invalidation ─────────────────────────────────────────

    /// Mark scopes stale so the next read (or `refresh`) refetches ground
    /// truth. Also bumps the generation: a fetch already in flight can no
    /// longer satisfy the scope. Idempotent.
    pub fn invalidate(&self, scopes: &[Scope]) {
        let mut inner = self.lock();
        for scope in scopes {
            *inner.generations.entry(*scope).or_insert(0) += 1;
            if let Some(entry) = inner.entries.get_mut(scope) {
                entry.stale = true;
            }
            tracing::debug!(%scope, "Invalidated");
        }
    }

    /// Invalidate every cached view derived from one subject's data — the
    /// overlapping-view rule. Safe to call for unknown subjects.
    pub fn invalidate_subject(&self, subject: Uuid) {
        let scopes: Vec<Scope> = {
            let inner = self.lock();
            inner
                .entries
                .keys()
                .filter(|scope| scope.subject == subject)
                .copied()
                .collect()
        };
        self.invalidate(&scopes);
    }

    /// Refetch every listed scope that is cached and stale. A scope whose
    /// refetch is already in flight is skipped — concurrent duplicate
    /// invalidations collapse into one refetch.
    pub async fn refresh(&self, scopes: &[Scope]) {
        for scope in scopes {
            let generation = {
                let mut inner = self.lock();
                let needs = matches!(inner.entries.get(scope), Some(entry) if entry.stale);
                if !needs || inner.fetching.contains(scope) {
                    continue;
                }
                inner.fetching.insert(*scope);
                *inner.generations.entry(*scope).or_insert(0)
            };

            let fetched = (self.fetch)(*scope).await;

            let mut inner = self.lock();
            inner.fetching.remove(scope);
            if inner.generations.get(scope).copied().unwrap_or(0) != generation {
                tracing::debug!(%scope, "Discarding superseded refetch");
                continue;
            }
            match fetched {
                Ok(value) => {
                    inner.entries.insert(
                        *scope,
                        Entry {
                            data: value,
                            fetched_at: self.clock.now(),
                            stale: false,
                            last_error: None,
                        },
                    );
                }
                Err(err) => {
                    if let Some(entry) = inner.entries.get_mut(scope) {
                        entry.last_error = Some(err.clone());
                    }
                    tracing::warn!(%scope, error = %err, "Background refetch failed");
                }
            }
        }
    }

    // ── Introspection ────────────────────────────────────────

    /// Current data for a scope, fresh or stale. No fetch.
    pub fn cached(&self, scope: &Scope) -> Option<CachedValue> {
        self.lock().entries.get(scope).map(|e| e.data.clone())
    }

    pub fn is_stale(&self, scope: &Scope) -> bool {
        self.lock()
            .entries
            .get(scope)
            .map(|e| e.stale)
            .unwrap_or(false)
    }

    /// Completion time of the entry's last accepted fetch or patch.
    pub fn fetched_at(&self, scope: &Scope) -> Option<DateTime<Utc>> {
        self.lock().entries.get(scope).map(|e| e.fetched_at)
    }

    pub fn is_fetching(&self, scope: &Scope) -> bool {
        self.lock().fetching.contains(scope)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
