//! Event infrastructure for sync observers.
//!
//! Provides `SyncEvent` for status displays and debugging, and `EventBus` for
//! subscriptions. Subscribers are called synchronously on the task that
//! emitted the event, so callbacks must be quick and must not block.

use crate::sync_engine::SyncStatus;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Events emitted by the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// The visible sync status changed.
    StatusChanged {
        status: SyncStatus,
        /// Milliseconds since Unix epoch.
        timestamp: i64,
    },
    /// A pull brought in a new remote document and merged it.
    PullApplied { token: String, timestamp: i64 },
    /// A conditional pull found nothing new.
    PullUnchanged { timestamp: i64 },
    /// A pull was dropped because a push was in flight.
    PullSuppressed { timestamp: i64 },
    /// A pull failed. `silent` is true when the visible status was left alone.
    PullFailed {
        error: String,
        silent: bool,
        timestamp: i64,
    },
    /// A push landed and the remote handed back a new token.
    PushCommitted { token: String, timestamp: i64 },
    /// A push was rejected or could not reach the store.
    PushFailed { error: String, timestamp: i64 },
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(SyncEvent) + Send + Sync>;

/// Event bus for publishing sync events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(SyncEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // emit drops the lock before calling out. No blocking while unwinding.
        if std::thread::panicking() {
            if let Ok(mut guard) = self.callbacks.try_write() {
                guard.retain(|(i, _)| *i != id);
            }
            return;
        }
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(i, _)| *i != id);
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: SyncEvent) {
        // Clone the list so a callback may subscribe without deadlocking.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }
}
