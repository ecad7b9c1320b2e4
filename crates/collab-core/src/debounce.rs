//! Deadline-based debouncing.
//!
//! These types never sleep. The driver asks for the current deadline, waits
//! until then however it likes, and calls `take_due` with the current time.

use std::time::Duration;
use web_time::Instant;

/// Fires once after `delay` of quiet; every `schedule` pushes the deadline out.
#[derive(Debug, Clone)]
pub struct Debouncer {
    delay: Duration,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// (Re)start the quiet window from `now`.
    pub fn schedule(&mut self, now: Instant) {
        self.deadline = Some(now + self.delay);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    /// Returns `true` exactly once when the window has elapsed.
    pub fn take_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

/// Debounced "latest value wins" buffer.
///
/// Keeps only the most recent pending value and remembers the last value
/// actually emitted, so an unchanged value is never emitted twice in a row.
#[derive(Debug, Clone)]
pub struct Coalescer<T> {
    debouncer: Debouncer,
    pending: Option<T>,
    last_sent: Option<T>,
}

impl<T: Clone + PartialEq> Coalescer<T> {
    pub fn new(delay: Duration) -> Self {
        Self {
            debouncer: Debouncer::new(delay),
            pending: None,
            last_sent: None,
        }
    }

    /// Replace the pending value and restart the window.
    pub fn push(&mut self, value: T, now: Instant) {
        self.pending = Some(value);
        self.debouncer.schedule(now);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.debouncer.deadline()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Record a value as already known to peers (e.g. content received from
    /// one of them) without emitting it.
    pub fn observe(&mut self, value: T) {
        if self.pending.as_ref() == Some(&value) {
            self.pending = None;
            self.debouncer.cancel();
        }
        self.last_sent = Some(value);
    }

    pub fn last_sent(&self) -> Option<&T> {
        self.last_sent.as_ref()
    }

    /// Take the pending value if its window elapsed and it differs from the
    /// last value emitted.
    pub fn take_due(&mut self, now: Instant) -> Option<T> {
        if !self.debouncer.take_due(now) {
            return None;
        }
        self.flush()
    }

    /// Take the pending value regardless of the window.
    pub fn flush(&mut self) -> Option<T> {
        self.debouncer.cancel();
        let value = self.pending.take()?;
        if self.last_sent.as_ref() == Some(&value) {
            return None;
        }
        self.last_sent = Some(value.clone());
        Some(value)
    }

    /// Drop the pending value without emitting it.
    pub fn cancel(&mut self) {
        self.pending = None;
        self.debouncer.cancel();
    }
}
