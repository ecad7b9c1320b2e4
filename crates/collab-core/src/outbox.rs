//! What happens to outbound frames while the socket is down.
//!
//! The default drops them: peers catch up from the relay's `state` push and the
//! durable store after reconnect. Queueing keeps a bounded backlog that is
//! flushed, oldest first, once the socket is back.

use std::collections::VecDeque;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OfflinePolicy {
    #[default]
    Drop,
    Queue { capacity: usize },
}

/// Result of offering a frame while disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    Dropped,
    Queued,
    /// Queued, and the oldest frame was evicted to make room.
    Evicted,
}

#[derive(Debug, Default)]
pub struct Outbox {
    policy: OfflinePolicy,
    queue: VecDeque<String>,
}

impl Outbox {
    pub fn new(policy: OfflinePolicy) -> Self {
        Self {
            policy,
            queue: VecDeque::new(),
        }
    }

    pub fn policy(&self) -> OfflinePolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Hold on to a frame that couldn't be sent.
    pub fn offer(&mut self, frame: String) -> OfferOutcome {
        match self.policy {
            OfflinePolicy::Drop => {
                warn!("Not connected; dropping outbound frame");
                OfferOutcome::Dropped
            }
            OfflinePolicy::Queue { capacity: 0 } => OfferOutcome::Dropped,
            OfflinePolicy::Queue { capacity } => {
                let mut outcome = OfferOutcome::Queued;
                if self.queue.len() >= capacity {
                    self.queue.pop_front();
                    outcome = OfferOutcome::Evicted;
                    debug!("Offline queue full; evicted oldest frame");
                }
                self.queue.push_back(frame);
                outcome
            }
        }
    }

    /// Take every queued frame, oldest first.
    pub fn drain(&mut self) -> Vec<String> {
        self.queue.drain(..).collect()
    }
}
