use rand::Rng;
use std::time::Duration;

pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const DEFAULT_BACKOFF_CEILING: Duration = Duration::from_secs(30);

/// Exponential reconnect backoff.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub ceiling: Duration,
    /// Fraction in `[0, 1]` by which a delay may be randomly shortened. 0 disables jitter.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            ceiling: DEFAULT_BACKOFF_CEILING,
            jitter: 0.0,
        }
    }
}

/// Backoff state: `base * 2^attempt`, capped at `ceiling`, reset on success.
#[derive(Clone, Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.peek();
        self.attempt = self.attempt.saturating_add(1);
        if self.policy.jitter > 0.0 {
            let jitter = self.policy.jitter.min(1.0);
            let scale = 1.0 - jitter * rand::thread_rng().gen_range(0.0..=1.0);
            return delay.mul_f64(scale);
        }
        delay
    }

    fn peek(&self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        self.policy
            .base
            .checked_mul(factor)
            .unwrap_or(self.policy.ceiling)
            .min(self.policy.ceiling)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
