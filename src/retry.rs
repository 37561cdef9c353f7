//! Retry policy with exponential backoff
//!
//! [`RetryPolicy::decide`] is a pure function: given the number of failed
//! attempts and the classification of the latest failure, it returns whether
//! the task should be retried and after how long. Delays grow exponentially
//! from `initial_delay`, are capped at `max_delay`, and use full jitter
//! (uniform in `[0, computed]`) to spread retries of many tasks apart.
//!
//! # Example
//!
//! ```
//! use rand::SeedableRng;
//! use resumable_dl::config::RetryConfig;
//! use resumable_dl::retry::{RetryDecision, RetryPolicy};
//! use resumable_dl::types::ErrorKind;
//!
//! let policy = RetryPolicy::new(RetryConfig {
//!     jitter: false,
//!     ..Default::default()
//! });
//! let mut rng = rand::rngs::StdRng::seed_from_u64(7);
//!
//! assert_eq!(
//!     policy.decide(3, ErrorKind::Transient, &mut rng),
//!     RetryDecision::Retry(std::time::Duration::from_secs(4))
//! );
//! assert_eq!(
//!     policy.decide(1, ErrorKind::Permanent, &mut rng),
//!     RetryDecision::GiveUp
//! );
//! ```

use crate::config::RetryConfig;
use crate::types::ErrorKind;
use rand::Rng;
use std::time::Duration;

/// Outcome of a retry decision
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Make the task eligible again after this delay
    Retry(Duration),
    /// Stop retrying and finalize the task as failed
    GiveUp,
}

/// Backoff policy for transient transfer failures
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create a policy from retry configuration
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// The configuration this policy was built from
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Decide whether to retry after `attempt_count` failed attempts
    ///
    /// `attempt_count` includes the attempt that just failed. Only
    /// [`ErrorKind::Transient`] failures are retried.
    pub fn decide<R: Rng + ?Sized>(
        &self,
        attempt_count: u32,
        kind: ErrorKind,
        rng: &mut R,
    ) -> RetryDecision {
        if kind != ErrorKind::Transient || attempt_count >= self.config.max_attempts {
            return RetryDecision::GiveUp;
        }

        let computed = self.computed_delay(attempt_count);
        if self.config.jitter {
            RetryDecision::Retry(full_jitter(computed, rng))
        } else {
            RetryDecision::Retry(computed)
        }
    }

    /// `min(initial_delay * multiplier^(attempt_count - 1), max_delay)`
    pub fn computed_delay(&self, attempt_count: u32) -> Duration {
        let exponent = attempt_count.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.config.initial_delay.as_secs_f64()
            * self.config.backoff_multiplier.powi(exponent);
        let cap = self.config.max_delay.as_secs_f64();

        // powi overflows to infinity for large attempt counts
        if !secs.is_finite() || secs >= cap {
            self.config.max_delay
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }
}

/// Uniformly random delay in `[0, delay]`
fn full_jitter<R: Rng + ?Sized>(delay: Duration, rng: &mut R) -> Duration {
    let factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}
