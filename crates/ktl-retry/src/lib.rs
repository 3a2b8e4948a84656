//! Backoff schedules and retry budgets for deploy retries.
//!
//! The scheduler retries a failed release only when its error class is
//! transient. Two knobs govern how aggressively that happens:
//!
//! - [`BackoffConfig`] — the per-attempt delay curve (exponential with a
//!   cap and jitter). Rate-limit classes get a widened preset so retries
//!   back off well past the server's throttle window.
//! - [`RetryBudget`] — a bounded, run-global allowance of time spent
//!   waiting on rate-limit retries. Once the budget is exhausted, a
//!   rate-limited node fails terminally instead of retrying forever.
//!
//! # Example
//!
//! ```
//! use ktl_retry::{BackoffConfig, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::default();
//! let delay = policy.backoff.delay_for_attempt(2);
//! assert!(delay <= policy.backoff.max_delay);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delay curve for retry attempts.
///
/// Attempt numbers are 1-indexed: attempt 1 is the first retry, delayed by
/// `base_delay`; each further attempt multiplies the previous delay by
/// `multiplier`, capped at `max_delay`, then jittered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Upper bound for any single delay, applied before jitter.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Growth factor between consecutive attempts.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Jitter factor in `[0.0, 1.0]`; 0.5 spreads a delay across
    /// `[0.5d, 1.5d]`.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.5
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(120),
            multiplier: 2.0,
            jitter: 0.5,
        }
    }
}

impl BackoffConfig {
    /// Widened variant of this curve for rate-limited errors (HTTP 429
    /// and friends): delays stretch well past the server's throttle
    /// window instead of re-triggering it.
    pub fn widened(&self) -> Self {
        Self {
            base_delay: self.base_delay.saturating_mul(5),
            max_delay: self.max_delay.max(Duration::from_secs(300)),
            multiplier: self.multiplier,
            jitter: self.jitter,
        }
    }

    /// The jittered delay before retry `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.raw_delay_for_attempt(attempt);
        if self.jitter > 0.0 {
            apply_jitter(delay, self.jitter)
        } else {
            delay
        }
    }

    /// The un-jittered delay before retry `attempt` (1-indexed).
    ///
    /// Exposed so callers can reason about worst-case schedules; the
    /// scheduler itself always uses the jittered variant.
    pub fn raw_delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let factor = self.multiplier.max(1.0).powi(exponent as i32);
        let millis = (self.base_delay.as_millis() as f64 * factor).round();
        let delay = if millis >= Duration::MAX.as_millis() as f64 {
            self.max_delay
        } else {
            Duration::from_millis(millis as u64)
        };
        delay.min(self.max_delay)
    }
}

fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    use rand::RngExt;

    let jitter = jitter.clamp(0.0, 1.0);
    let mut rng = rand::rng();
    let random_value: f64 = rng.random();
    let factor = 1.0 - jitter + (random_value * 2.0 * jitter);
    let millis = (delay.as_millis() as f64 * factor).round() as u64;
    Duration::from_millis(millis)
}

/// Per-node retry policy: how many attempts, and which delay curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one. `1` disables retries.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay curve between attempts.
    #[serde(default)]
    pub backoff: BackoffConfig,
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffConfig::default(),
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `attempt` attempts ran.
    pub fn attempts_remaining(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Run-global allowance of wall-clock time spent waiting on rate-limit
/// retries.
///
/// Every scheduled rate-limit delay draws from this budget. When the
/// budget cannot cover the next delay, the caller must treat the error as
/// terminal.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    window: Duration,
    spent: Duration,
}

impl RetryBudget {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            spent: Duration::ZERO,
        }
    }

    /// Try to reserve `delay` from the budget. Returns `false` (without
    /// spending) when the budget cannot cover it.
    pub fn try_consume(&mut self, delay: Duration) -> bool {
        match self.spent.checked_add(delay) {
            Some(total) if total <= self.window => {
                self.spent = total;
                true
            }
            _ => false,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.window.saturating_sub(self.spent)
    }

    pub fn exhausted(&self) -> bool {
        self.spent >= self.window
    }
}

impl Default for RetryBudget {
    /// Ten minutes of cumulative rate-limit waiting per run.
    fn default() -> Self {
        Self::new(Duration::from_secs(600))
    }
}
