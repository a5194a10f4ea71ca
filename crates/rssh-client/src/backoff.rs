//! Retry bookkeeping for one dial-home sequence.

use serde::Deserialize;
use std::time::Duration;

/// First backoff delay.
pub const INITIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Doubling stops once it would pass this.
pub const CEILING: Duration = Duration::from_secs(6 * 60 * 60);
/// Delay used after the ceiling is hit in [`CeilingMode::Reset`].
pub const RESET_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// What happens when doubling the delay would pass [`CEILING`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CeilingMode {
    /// Drop back to [`RESET_TIMEOUT`] and keep doubling from there.
    /// Matches deployed peers.
    #[default]
    Reset,
    /// Stay at [`CEILING`].
    Saturate,
}

/// Per-sequence retry state. Created fresh for every dial sequence.
#[derive(Debug, Clone)]
pub struct RetryState {
    fail_count: u32,
    timeout: Duration,
    max_attempts: i64,
    mode: CeilingMode,
}

impl RetryState {
    /// `max_attempts < 0` retries forever.
    pub fn new(max_attempts: i64, mode: CeilingMode) -> Self {
        Self {
            fail_count: 0,
            timeout: INITIAL_TIMEOUT,
            max_attempts,
            mode,
        }
    }

    pub fn fail_count(&self) -> u32 {
        self.fail_count
    }

    pub fn max_attempts(&self) -> i64 {
        self.max_attempts
    }

    /// Delay to sleep before the next attempt.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether another attempt is allowed after a failure.
    pub fn can_retry(&self) -> bool {
        self.max_attempts < 0 || i64::from(self.fail_count) < self.max_attempts
    }

    /// Record a failed attempt whose backoff has been slept.
    pub fn record_failure(&mut self) {
        self.fail_count = self.fail_count.saturating_add(1);
        self.timeout = next_timeout(self.timeout, self.mode);
    }
}

/// Delay that follows `current`.
pub fn next_timeout(current: Duration, mode: CeilingMode) -> Duration {
    let doubled = current.saturating_mul(2);
    if doubled <= CEILING {
        return doubled;
    }
    match mode {
        CeilingMode::Reset => RESET_TIMEOUT,
        CeilingMode::Saturate => CEILING,
    }
}
