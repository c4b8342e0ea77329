//! Retry policies for socket connect attempts
//!
//! Connection-refused errors are retried until the policy is exhausted;
//! every other failure propagates immediately. The two strategies mirror the
//! two connect loops that historically coexisted for this operation, folded
//! into one configurable seam.

use crate::config::RetryConfig;
use std::time::Duration;

/// Yields the delay before the next connect attempt, or `None` once the
/// policy is exhausted and the connect must fail
pub trait RetryPolicy: Send {
    fn next_delay(&mut self) -> Option<Duration>;
}

/// Fixed wait step subtracted from a remaining-timeout budget until the
/// budget runs out; a `None` budget retries forever
#[derive(Debug)]
pub struct LinearCountdown {
    step: Duration,
    remaining_ms: Option<u64>,
}

impl LinearCountdown {
    pub fn new(step_ms: u64, budget_ms: Option<u64>) -> Self {
        Self {
            step: Duration::from_millis(step_ms),
            remaining_ms: budget_ms,
        }
    }
}

impl RetryPolicy for LinearCountdown {
    fn next_delay(&mut self) -> Option<Duration> {
        match self.remaining_ms.as_mut() {
            None => Some(self.step),
            Some(0) => None,
            Some(remaining) => {
                *remaining = remaining.saturating_sub(self.step.as_millis() as u64);
                Some(self.step)
            }
        }
    }
}

/// Delay growing by a constant multiplier, bounded by a maximum attempt count
#[derive(Debug)]
pub struct ExponentialBackoff {
    initial: Duration,
    multiplier: f64,
    max_attempts: u32,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, multiplier: f64, max_attempts: u32) -> Self {
        Self {
            initial,
            multiplier,
            max_attempts,
            attempt: 0,
        }
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let factor = self.multiplier.powi(self.attempt as i32);
        self.attempt += 1;
        Some(self.initial.mul_f64(factor))
    }
}

/// Build the configured policy for a connect call with the given timeout
/// budget (milliseconds; negative = unbounded)
pub fn policy_for(config: &RetryConfig, timeout_ms: i64) -> Box<dyn RetryPolicy> {
    match *config {
        RetryConfig::Linear { step_ms } => {
            let budget = if timeout_ms < 0 {
                None
            } else {
                Some(timeout_ms as u64)
            };
            Box::new(LinearCountdown::new(step_ms, budget))
        }
        RetryConfig::Exponential {
            multiplier,
            max_attempts,
        } => {
            let initial = if timeout_ms > 0 {
                Duration::from_millis(timeout_ms as u64)
            } else {
                Duration::from_millis(200)
            };
            Box::new(ExponentialBackoff::new(initial, multiplier, max_attempts))
        }
    }
}
