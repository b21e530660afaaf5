//! Capped exponential backoff for voice reconnects.
//!
//! base, 2×base, 4×base, … capped at `max`. With the default 1s/15s:
//! 1s → 2s → 4s → 8s → 15s → 15s …

use std::time::Duration;

use crate::config::VoiceConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMode {
    /// Surface the failure after this many attempts.
    Bounded(u32),
    /// Resident mode: keep trying until a session comes up.
    Unbounded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub mode: RetryMode,
}

impl BackoffPolicy {
    pub fn from_config(config: &VoiceConfig) -> Self {
        Self {
            base: Duration::from_millis(config.backoff_base_ms),
            max: Duration::from_millis(config.backoff_max_ms),
            mode: match config.max_connect_attempts {
                0 => RetryMode::Unbounded,
                n => RetryMode::Bounded(n),
            },
        }
    }

    /// Delay that follows the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base.saturating_mul(1 << exponent).min(self.max)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&VoiceConfig::default())
    }
}

/// Per-connect-loop retry state.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    failures: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record a failed attempt. Returns how long to wait before the next
    /// one, or `None` once a bounded policy is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        match self.policy.mode {
            RetryMode::Bounded(max) if self.failures >= max => None,
            _ => Some(self.policy.delay_for(self.failures)),
        }
    }
}
