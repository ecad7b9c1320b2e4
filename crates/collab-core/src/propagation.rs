//! Dual-cadence propagation: a fast peer-broadcast pipeline and a slower
//! durable-save pipeline, scheduled independently.
//!
//! A local mutation feeds both. Coalescing operations (note content) wait for
//! the broadcast window and only the latest value goes out; discrete operations
//! (cursor moves, board edits) are released immediately. The save pipeline
//! tracks an "unsaved changes" flag that only a successful save of the latest
//! generation clears.

use crate::debounce::{Coalescer, Debouncer};
use crate::document::{Cadence, Document};
use std::time::Duration;
use tracing::{debug, warn};
use web_time::Instant;

/// Identifies which local generation a save carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveTicket {
    generation: u64,
}

impl SaveTicket {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Debug)]
pub struct Propagation<D: Document> {
    broadcast: Coalescer<D::Op>,
    immediate: bool,
    save: Debouncer,
    unsaved: bool,
    /// Bumped on every local mutation.
    generation: u64,
}

impl<D: Document> Propagation<D> {
    pub fn new(cadence: Cadence) -> Self {
        Self {
            broadcast: Coalescer::new(cadence.broadcast),
            immediate: cadence.broadcast == Duration::ZERO,
            save: Debouncer::new(cadence.save),
            unsaved: false,
            generation: 0,
        }
    }

    // ==================== Local mutations ====================

    /// Record a local mutation that has no wire representation (e.g. a title
    /// edit). Marks the document unsaved and restarts the save window.
    pub fn on_local_mutation(&mut self, now: Instant) {
        self.unsaved = true;
        self.generation += 1;
        self.save.schedule(now);
    }

    /// Record a local operation. Returns the operation if it must be broadcast
    /// right away; coalesced operations come out of [`take_due_broadcast`].
    ///
    /// `changed` is whether applying the operation changed the document.
    ///
    /// [`take_due_broadcast`]: Self::take_due_broadcast
    pub fn on_local_operation(&mut self, op: D::Op, changed: bool, now: Instant) -> Option<D::Op> {
        if changed {
            self.on_local_mutation(now);
        }

        if !D::coalesces(&op) {
            return Some(op);
        }

        self.broadcast.push(op, now);
        if self.immediate {
            return self.broadcast.flush();
        }
        None
    }

    /// Record an operation received from a peer. Coalescing values it carries
    /// become the broadcast baseline so they are never echoed back.
    pub fn observe_remote(&mut self, op: &D::Op) {
        if D::coalesces(op) {
            self.broadcast.observe(op.clone());
        }
    }

    // ==================== Broadcast pipeline ====================

    pub fn broadcast_deadline(&self) -> Option<Instant> {
        self.broadcast.deadline()
    }

    pub fn take_due_broadcast(&mut self, now: Instant) -> Option<D::Op> {
        self.broadcast.take_due(now)
    }

    /// Release a pending coalesced operation without waiting for its window.
    pub fn flush_broadcast(&mut self) -> Option<D::Op> {
        self.broadcast.flush()
    }

    // ==================== Save pipeline ====================

    pub fn save_deadline(&self) -> Option<Instant> {
        self.save.deadline()
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.unsaved
    }

    /// If the save window elapsed and there is something to save, returns a
    /// ticket for the save that should start now.
    pub fn take_due_save(&mut self, now: Instant) -> Option<SaveTicket> {
        if !self.save.take_due(now) || !self.unsaved {
            return None;
        }
        Some(self.ticket())
    }

    /// Skip the save window. Returns a ticket if there is anything to save.
    pub fn force(&mut self) -> Option<SaveTicket> {
        self.save.cancel();
        self.unsaved.then(|| self.ticket())
    }

    /// Drop the pending save and forget about unsaved changes.
    pub fn cancel(&mut self) {
        self.save.cancel();
        self.unsaved = false;
    }

    /// A save completed. Clears the unsaved flag unless newer mutations
    /// happened after the save was issued. Returns whether the flag cleared.
    pub fn on_save_success(&mut self, ticket: SaveTicket) -> bool {
        if ticket.generation != self.generation {
            debug!(
                "Save of generation {} completed; generation {} still pending",
                ticket.generation, self.generation
            );
            return false;
        }
        self.unsaved = false;
        true
    }

    /// A save failed. The flag stays set and another attempt is scheduled one
    /// save window from now unless a newer mutation already scheduled one.
    pub fn on_save_failure(&mut self, now: Instant) {
        if !self.unsaved {
            return;
        }
        warn!("Save failed; will retry in {:?}", self.save.delay());
        if !self.save.is_pending() {
            self.save.schedule(now);
        }
    }

    /// Cancel every pending timer. Returns a ticket for a final save if the
    /// document still has unsaved changes.
    pub fn shutdown(&mut self) -> Option<SaveTicket> {
        self.broadcast.cancel();
        self.force()
    }

    fn ticket(&self) -> SaveTicket {
        SaveTicket {
            generation: self.generation,
        }
    }
}
