//! Reconnect policy: exponential backoff with jitter and an optional retry
//! budget.

use rand::Rng;
use std::time::Duration;

/// How a [`SyncChannel`](crate::channel::SyncChannel) retries after a
/// transient failure.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any single delay (before jitter)
    pub max_delay: Duration,
    /// Relative jitter, 0.2 means ±20%
    pub jitter: f64,
    /// Consecutive failed attempts allowed; `None` retries forever
    pub max_retries: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
            max_retries: None,
        }
    }
}

impl ReconnectPolicy {
    /// Cap the number of consecutive failed attempts.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Un-jittered delay before retry number `attempt` (1-based).
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Retry counter driven by a [`ReconnectPolicy`].
///
/// Reset it after every successful connection so the next outage starts
/// from the base delay again.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    /// Start a fresh attempt counter under `policy`.
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Number of retries scheduled since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Forget past failures after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay before the next retry, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.policy.max_retries {
            if self.attempt >= max {
                return None;
            }
        }
        self.attempt += 1;
        Some(self.jittered(self.policy.nominal_delay(self.attempt)))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let jitter = self.policy.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return delay;
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        delay.mul_f64(factor)
    }
}
