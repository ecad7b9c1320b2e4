//! Connection lifecycle state machine.
//!
//! Uses the action pattern: methods consume transport events and return the
//! action the driver should perform. No I/O and no clocks live here, so the
//! whole lifecycle is testable synchronously.
//!
//! # State Machine
//!
//! ```text
//! ┌──────────────┐ open ┌────────────┐ opened ┌───────────┐
//! │ Disconnected │─────>│ Connecting │───────>│ Connected │
//! └──────────────┘      └────────────┘        └───────────┘
//!        ^                    │ closed              │ closed
//!        │ budget spent       v                     v
//!        │               ┌──────────────┐<──────────┘
//!        └───────────────│ Reconnecting │──┐ reconnect due / closed
//!                        └──────────────┘<─┘
//! ```

use crate::reconnect::{ReconnectConfig, ReconnectState};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No socket and no retry pending
    Disconnected,
    /// First connection attempt in flight
    Connecting,
    /// Socket open; operations can be sent
    Connected,
    /// Lost the socket; waiting for or running a retry
    Reconnecting,
}

/// What the driver must do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Open a new socket.
    Connect,
    /// Wait `delay`, then call [`ConnectionMachine::on_reconnect_due`].
    ScheduleReconnect { delay: Duration, attempt: u32 },
    /// Retry budget exhausted; the session stays disconnected until reopened.
    GiveUp,
    /// Cancel any pending retry and close the socket normally.
    Teardown,
}

#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ConnectionState,
    config: ReconnectConfig,
    reconnect: ReconnectState,
    /// Set by [`close`](Self::close); late transport events are ignored.
    closed: bool,
}

impl ConnectionMachine {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            config,
            reconnect: ReconnectState::new(),
            closed: false,
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Reconnect attempts since the last successful open.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.reconnect.attempts()
    }

    #[must_use]
    pub fn can_send(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Start connecting. Only valid from `Disconnected`, which also covers
    /// reopening after the retry budget was spent.
    pub fn open(&mut self) -> Option<ConnectionAction> {
        if self.closed || self.state != ConnectionState::Disconnected {
            return None;
        }
        self.reconnect.reset();
        self.state = ConnectionState::Connecting;
        Some(ConnectionAction::Connect)
    }

    /// The socket finished its handshake.
    pub fn on_opened(&mut self) {
        if self.closed {
            return;
        }
        if self.reconnect.attempts() > 0 {
            info!("Reconnected after {} attempt(s)", self.reconnect.attempts());
        }
        self.reconnect.reset();
        self.state = ConnectionState::Connected;
    }

    /// The socket closed abnormally or a connection attempt failed.
    pub fn on_closed(&mut self) -> Option<ConnectionAction> {
        if self.closed || self.state == ConnectionState::Disconnected {
            return None;
        }

        match self.reconnect.next_delay(&self.config) {
            Some(delay) => {
                let attempt = self.reconnect.attempts();
                debug!(
                    "Scheduling reconnect attempt {}/{} in {:?}",
                    attempt, self.config.max_attempts, delay
                );
                self.state = ConnectionState::Reconnecting;
                Some(ConnectionAction::ScheduleReconnect { delay, attempt })
            }
            None => {
                warn!(
                    "Giving up after {} reconnect attempts",
                    self.config.max_attempts
                );
                self.state = ConnectionState::Disconnected;
                Some(ConnectionAction::GiveUp)
            }
        }
    }

    /// The reconnect delay elapsed.
    pub fn on_reconnect_due(&mut self) -> Option<ConnectionAction> {
        if self.closed || self.state != ConnectionState::Reconnecting {
            return None;
        }
        Some(ConnectionAction::Connect)
    }

    /// Intentional teardown. Never followed by a reconnect.
    pub fn close(&mut self) -> ConnectionAction {
        self.closed = true;
        self.state = ConnectionState::Disconnected;
        ConnectionAction::Teardown
    }
}

impl Default for ConnectionMachine {
    fn default() -> Self {
        Self::new(ReconnectConfig::default())
    }
}
