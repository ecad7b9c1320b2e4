//! Session events and the bus that delivers them to UI-side subscribers.
//!
//! Subscribers register a callback and get a [`Subscription`] back; dropping it
//! unsubscribes. Callbacks run synchronously on the emitting task, so they
//! should hand work off rather than block.

use crate::connection::ConnectionState;
use crate::document::Document;
use crate::presence::PresenceSnapshot;
use crate::protocol::{Notice, Operation};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Everything a session reports to the UI layer.
#[derive(Debug, Clone)]
pub enum SessionEvent<D: Document> {
    /// Connection state changed.
    ConnectionChanged {
        state: ConnectionState,
        attempts: u32,
    },
    /// A peer operation was applied to the local document.
    RemoteOperation(Operation<D::Op>),
    /// The relay pushed a full document that replaced the local one.
    DocumentReplaced(D),
    PresenceChanged(PresenceSnapshot),
    /// A peer started or stopped editing note content.
    PeerTyping {
        username: Option<String>,
        active: bool,
    },
    SaveStarted,
    SaveSucceeded,
    /// The durable save failed; local state is kept and the save retried.
    SaveFailed { message: String },
    Notice(Notice),
    /// A local operation could not be sent because the socket was down.
    OperationDropped,
    BackupStored { timestamp: u64 },
    BackupFailed { message: String },
}

type Callback<E> = Arc<dyn Fn(E) + Send + Sync>;

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

/// Event bus for publishing events to subscribers.
///
/// Thread-safe; wrap in `Arc` to enable subscriptions.
pub struct EventBus<E> {
    callbacks: RwLock<Vec<(usize, Callback<E>)>>,
    next_id: AtomicUsize,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl<E: Clone + Send + 'static> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(E) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));

        let bus: Weak<Self> = Arc::downgrade(self);
        Subscription {
            unsubscribe: Some(Box::new(move || {
                if let Some(bus) = bus.upgrade() {
                    bus.unsubscribe(id);
                }
            })),
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run during unwinding while emit holds the read lock.
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: E) {
        // Snapshot the list so callbacks may subscribe without deadlocking.
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
