//! Realtime reconciler — turns change-feed events into cache invalidation.
//!
//! A subscription is a scoped resource: acquired when a subject identity
//! becomes known, torn down on every exit path (subject switch, release,
//! drop). A handler that outlives its subscription goes inert, so a replayed
//! or late event can never invalidate on behalf of a subject the consumer no
//! longer watches. Invalidation happens strictly after delivery and is
//! idempotent, so duplicate events are harmless.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::cache::DoseCache;
use crate::store::{ChangeFeed, ChangeHandler, SubscriptionHandle};

struct ActiveSubscription {
    subject: Uuid,
    handle: SubscriptionHandle,
    /// Cleared on teardown; the handler checks it before touching the cache.
    alive: Arc<AtomicBool>,
}

pub struct RealtimeReconciler {
    feed: Arc<dyn ChangeFeed>,
    cache: Arc<DoseCache>,
    active: Mutex<Option<ActiveSubscription>>,
}

impl RealtimeReconciler {
    pub fn new(feed: Arc<dyn ChangeFeed>, cache: Arc<DoseCache>) -> Self {
        Self {
            feed,
            cache,
            active: Mutex::new(None),
        }
    }

    /// Subscribe for one subject's dose/medication changes. Any previous
    /// subscription is torn down first — switching patients never leaves a
    /// live handler behind.
    pub fn watch_subject(&self, subject: Uuid) {
        self.release();

        let alive = Arc::new(AtomicBool::new(true));
        let handler: ChangeHandler = {
            let alive = alive.clone();
            let cache = self.cache.clone();
            Arc::new(move |event| {
                if !alive.load(Ordering::Acquire) {
                    return;
                }
                tracing::debug!(%subject, table = %event.table, kind = ?event.kind, "Change event received");
                // A single underlying change affects every derived view of
                // the subject, not just the resource the event names.
                cache.invalidate_subject(subject);
            })
        };
        let handle = self.feed.subscribe(subject, handler);
        tracing::info!(%subject, "Watching subject changes");

        if let Ok(mut active) = self.active.lock() {
            *active = Some(ActiveSubscription {
                subject,
                handle,
                alive,
            });
        }
    }

    /// Tear down the current subscription, if any. Idempotent.
    pub fn release(&self) {
        let previous = self
            .active
            .lock()
            .map(|mut active| active.take())
            .unwrap_or(None);
        if let Some(subscription) = previous {
            subscription.alive.store(false, Ordering::Release);
            self.feed.unsubscribe(subscription.handle);
            tracing::info!(subject = %subscription.subject, "Released subject subscription");
        }
    }

    /// The subject currently watched, if any.
    pub fn subject(&self) -> Option<Uuid> {
        self.active
            .lock()
            .map(|active| active.as_ref().map(|s| s.subject))
            .unwrap_or(None)
    }
}

impl Drop for RealtimeReconciler {
    fn drop(&mut self) {
        self.release();
    }
}
