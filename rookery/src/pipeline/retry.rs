//! Retry bookkeeping for the call pipeline.

use std::time::Duration;

use crate::config::RetryPolicy;
use crate::error::BrokerError;

/// Tracks how many retries a call has used and computes backoff.
///
/// The schedule grants a retry only while all three hold: the error is
/// retryable, attempts remain, and the backoff still fits inside the call's
/// remaining deadline. Waiting out a delay the deadline would consume anyway
/// is pointless, so those calls fail with the error they already have.
pub(crate) struct RetrySchedule {
    policy: RetryPolicy,
    granted: u32,
}

impl RetrySchedule {
    pub(crate) fn new(policy: RetryPolicy) -> Self {
        Self { policy, granted: 0 }
    }

    /// Decide after a failed attempt: `Some(delay)` to retry after sleeping,
    /// `None` to give up with `err`.
    pub(crate) fn next_delay(
        &mut self,
        err: &BrokerError,
        remaining: Option<Duration>,
    ) -> Option<Duration> {
        if !err.retryable() || self.granted >= self.policy.retries {
            return None;
        }
        self.granted += 1;
        let delay = self.policy.delay_for(self.granted);
        match remaining {
            Some(rem) if delay >= rem => None,
            _ => Some(delay),
        }
    }

    pub(crate) fn attempts_used(&self) -> u32 {
        self.granted
    }
}
