//! Collaborator interfaces the core consumes and never implements.
//!
//! The remote store is opaque: it trades in `serde_json::Value` records and
//! reports failures as `StoreError`. Typed decoding happens at the engine
//! boundary. The change feed delivers "something changed" notifications with
//! no payload guarantees beyond resource + event kind.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde_json::Value;
use uuid::Uuid;

/// Resources the core reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Medications,
    Doses,
    Reports,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Medications => "medications",
            Table::Doses => "medication_doses",
            Table::Reports => "medical_reports",
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque transport/storage failure reported by a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The backend could not be reached or timed out.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    /// The backend reached but refused the request.
    #[error("Store rejected the request: {0}")]
    Rejected(String),
}

/// Row filter for `RemoteStore::query`. Unset fields do not constrain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryFilter {
    /// Rows belonging (directly or via their medication) to this subject.
    pub subject: Option<Uuid>,
    /// Rows for this medication.
    pub medication: Option<Uuid>,
    /// Half-open `[start, end)` bound on the row's primary timestamp.
    pub between: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

/// Result ordering on the row's primary timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    NewestFirst,
    OldestFirst,
}

/// The remote persistence backend, suspension point of all reads and writes.
pub trait RemoteStore: Send + Sync {
    fn insert(&self, table: Table, fields: Value) -> BoxFuture<'_, Result<Value, StoreError>>;

    fn update(
        &self,
        table: Table,
        id: Uuid,
        fields: Value,
    ) -> BoxFuture<'_, Result<Value, StoreError>>;

    fn delete(&self, table: Table, id: Uuid) -> BoxFuture<'_, Result<(), StoreError>>;

    fn query(
        &self,
        table: Table,
        filter: QueryFilter,
        order: SortOrder,
    ) -> BoxFuture<'_, Result<Vec<Value>, StoreError>>;
}

/// Ownership path under which an attachment is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentScope {
    pub subject: Uuid,
    pub medication: Uuid,
}

/// Durable blob storage for proof attachments.
pub trait AttachmentStore: Send + Sync {
    /// Store the bytes and return a retrievable URL.
    fn store(
        &self,
        scope: AttachmentScope,
        file_name: String,
        bytes: Vec<u8>,
    ) -> BoxFuture<'_, Result<String, StoreError>>;
}

/// What kind of change a feed event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A change notification for one resource of one subject. No payload — the
/// only guarantee is "something in this resource for this subject changed".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: ChangeKind,
}

/// Token identifying one live subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

/// Callback invoked on event delivery.
pub type ChangeHandler = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

/// Subject-scoped change-notification feed.
pub trait ChangeFeed: Send + Sync {
    /// Register a handler for all dose/medication changes of one subject.
    fn subscribe(&self, subject: Uuid, handler: ChangeHandler) -> SubscriptionHandle;

    /// Tear down a subscription. Unknown handles are ignored.
    fn unsubscribe(&self, handle: SubscriptionHandle);
}
