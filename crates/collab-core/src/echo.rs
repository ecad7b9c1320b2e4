//! Echo suppression for relayed operations.
//!
//! Relays may broadcast a session's own operations back to it. Re-applying
//! them would clobber newer local edits, so they are filtered by origin.

use crate::identity::{SessionIdentity, UserId};
use crate::protocol::Operation;

/// Filters inbound operations that originated from the local session.
#[derive(Debug, Clone)]
pub struct EchoGuard {
    local: UserId,
    suppressed: u64,
}

impl EchoGuard {
    pub fn new(identity: &SessionIdentity) -> Self {
        Self {
            local: identity.user_id.clone(),
            suppressed: 0,
        }
    }

    /// Whether an inbound operation should be applied.
    ///
    /// Operations without an origin are treated as coming from a peer.
    pub fn should_apply<Op>(&mut self, op: &Operation<Op>) -> bool {
        match &op.origin {
            Some(origin) if *origin == self.local => {
                self.suppressed += 1;
                false
            }
            _ => true,
        }
    }

    /// Number of operations dropped as echoes so far.
    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }
}
