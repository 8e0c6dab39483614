//! Retry budget and backoff for transient scoring failures.
//!
//! One policy serves two callers:
//! - the scoring worker, deciding whether a failed job goes back on the queue
//!   and how long it stays invisible;
//! - the worker loop, pacing reconnect attempts while the queue is down.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use textguard_core::PredictionId;

/// Delay curve between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed { delay: Duration },
    /// `base * 2^(retry - 1)`, never above `cap`.
    Exponential { base: Duration, cap: Duration },
}

impl Backoff {
    fn raw_delay(&self, retry: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay } => delay,
            Backoff::Exponential { base, cap } => {
                let factor = 1u32.checked_shl(retry - 1).unwrap_or(u32::MAX);
                base.checked_mul(factor).unwrap_or(cap).min(cap)
            }
        }
    }

    fn ceiling(&self) -> Duration {
        match *self {
            Backoff::Fixed { delay } => delay,
            Backoff::Exponential { cap, .. } => cap,
        }
    }
}

/// How many times a job may be scored and how long to wait in between.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total scoring attempts, the first one included. Zero behaves like one.
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Fraction (0.0-1.0) of each delay shaved off per job, so that jobs failing
    /// together do not come back together.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_millis(500), Duration::from_secs(60))
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed { delay },
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential {
                base,
                cap: cap.max(base),
            },
            jitter: 0.1,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Un-jittered delay before retry number `retry` (1 = after the first failure).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        self.backoff.raw_delay(retry).min(self.backoff.ceiling())
    }

    /// Delay before retrying one job.
    ///
    /// Jitter only ever shortens the delay and is derived from the prediction
    /// id, so the same job always gets the same delay for the same retry.
    pub fn delay_for_job(&self, retry: u32, prediction_id: PredictionId) -> Duration {
        let delay = self.delay_for_retry(retry);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || delay.is_zero() {
            return delay;
        }

        let bits = prediction_id.as_uuid().as_u128() as u64 ^ u64::from(retry);
        let fraction = (bits % 1_000) as f64 / 1_000.0;
        delay.mul_f64(1.0 - jitter * fraction)
    }

    /// Whether another attempt is allowed after `attempts_made` have failed.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts.max(1)
    }
}
