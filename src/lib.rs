//! Adhera — adherence & optimistic-sync core for a shared patient/caretaker
//! medication tracker.
//!
//! The engine reconciles scheduled dose times against recorded dose events,
//! derives streak/adherence metrics, and keeps every cached view (day view,
//! cross-medication log, caretaker summary) consistent under concurrent
//! actors via optimistic mutations plus realtime invalidation. Persistence,
//! blob storage, and the change feed are opaque collaborators injected
//! through the traits in [`store`].

pub mod adherence; // streak, rolling 30-day adherence, activity feed
pub mod cache; // scope-keyed dose cache: snapshot/patch/restore/invalidate
pub mod clock; // injected time source
pub mod config;
pub mod engine; // subject context lifecycle + exposed operations
pub mod error;
pub mod models;
pub mod mutation; // optimistic mutation state machine
pub mod realtime; // change feed → invalidation
pub mod schedule; // slot matching
pub mod store; // collaborator traits

#[cfg(test)]
pub(crate) mod testutil;

pub use engine::AdherenceEngine;
pub use error::EngineError;

use tracing_subscriber::EnvFilter;

/// Initialize tracing for binaries and harnesses embedding the engine.
/// Respects `RUST_LOG`, falling back to the crate default.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();
    tracing::info!("Adhera core v{}", config::APP_VERSION);
}
