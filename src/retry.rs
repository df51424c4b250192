//! Retry policies: pure decision functions mapping (error, attempt) to a
//! retry verdict and backoff delay.
//!
//! A policy never sleeps or executes anything itself; the caller honors the
//! returned delay and re-invokes the worker.

use std::time::Duration;

use rand::Rng;

use crate::error::WorkerError;

/// Outcome of a retry decision. When `retry` is false the delay is zero and
/// the failure is permanent from the policy's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Duration,
}

impl RetryDecision {
    fn give_up() -> Self {
        Self {
            retry: false,
            delay: Duration::ZERO,
        }
    }

    fn after(delay: Duration) -> Self {
        Self { retry: true, delay }
    }
}

#[derive(Debug, Clone)]
pub enum RetryPolicy {
    /// Every failure is permanent.
    None,

    /// Fixed delay multiplied by the attempt number, up to `max_attempts`.
    Linear { delay: Duration, max_attempts: u32 },

    /// Doubling backoff with multiplicative jitter: the first retry waits
    /// `base`, each further retry doubles, capped at `max_delay`. `jitter`
    /// is a fraction in [0, 1); the delay is scaled by a random factor in
    /// [1 - jitter, 1 + jitter].
    Exponential {
        base: Duration,
        max_attempts: u32,
        max_delay: Duration,
        jitter: f64,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_millis(250),
            max_attempts: 3,
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Decide whether the attempt that just failed should be retried.
    ///
    /// `attempt` is 1-based: the first execution is attempt 1. Only errors
    /// classified transient are ever retried.
    pub fn should_retry(&self, error: &WorkerError, attempt: u32) -> RetryDecision {
        if !error.is_transient() {
            return RetryDecision::give_up();
        }

        match self {
            Self::None => RetryDecision::give_up(),
            Self::Linear {
                delay,
                max_attempts,
            } => {
                if attempt >= *max_attempts {
                    RetryDecision::give_up()
                } else {
                    RetryDecision::after(delay.saturating_mul(attempt))
                }
            }
            Self::Exponential {
                base,
                max_attempts,
                max_delay,
                jitter,
            } => {
                if attempt >= *max_attempts {
                    return RetryDecision::give_up();
                }
                let doubled = base.saturating_mul(1u32 << attempt.saturating_sub(1).min(20));
                let capped = doubled.min(*max_delay);
                RetryDecision::after(apply_jitter(capped, *jitter))
            }
        }
    }

    pub fn max_attempts(&self) -> u32 {
        match self {
            Self::None => 1,
            Self::Linear { max_attempts, .. } | Self::Exponential { max_attempts, .. } => {
                (*max_attempts).max(1)
            }
        }
    }
}

fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    let jitter = jitter.min(0.99);
    let factor = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
    delay.mul_f64(factor)
}
