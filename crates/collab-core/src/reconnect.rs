//! Reconnection policy with capped exponential backoff.

use std::time::Duration;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Attempts before giving up; the session then stays disconnected
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: 5,
        }
    }
}

/// Delay before reconnect attempt number `attempt` (0-based):
/// `min(base * 2^attempt, max)`.
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    config
        .base_delay
        .checked_mul(factor)
        .unwrap_or(config.max_delay)
        .min(config.max_delay)
}

/// Attempt bookkeeping for one connection.
#[derive(Debug, Clone, Default)]
pub struct ReconnectState {
    attempts: u32,
}

impl ReconnectState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of reconnect attempts scheduled since the last successful open.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Schedule the next attempt. Returns the delay to wait, or `None` once the
    /// attempt budget is spent.
    pub fn next_delay(&mut self, config: &ReconnectConfig) -> Option<Duration> {
        if self.exceeded_max_attempts(config) {
            return None;
        }
        let delay = calculate_backoff(self.attempts, config);
        self.attempts += 1;
        Some(delay)
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn exceeded_max_attempts(&self, config: &ReconnectConfig) -> bool {
        self.attempts >= config.max_attempts
    }
}
