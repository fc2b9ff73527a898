//! Per-endpoint circuit breaker.
//!
//! ```text
//!            threshold failures in window
//!   Closed ─────────────────────────────▶ Open
//!     ▲                                    │ cooldown elapsed,
//!     │ probe succeeds                     ▼ next call admitted
//!     └──────────────────────────────── HalfOpen ──▶ Open (probe fails)
//! ```
//!
//! Every endpoint carries its own breaker, so one overloaded node never
//! blocks calls to its healthy replicas. Which failures count is decided by
//! [`BrokerError::counts_for_breaker`](crate::error::BrokerError::counts_for_breaker).

use std::cell::Cell;

use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;

/// Breaker state, also surfaced on the notification bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Outcome of asking the breaker to admit a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Allowed,
    /// Admitted as the single half-open probe.
    AllowedProbe,
    Rejected,
}

/// State transition worth reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BreakerTransition {
    Opened,
    Closed,
}

pub struct CircuitBreaker {
    cfg: CircuitBreakerConfig,
    state: Cell<BreakerState>,
    failures: Cell<u32>,
    window_started: Cell<Instant>,
    opened_at: Cell<Instant>,
    probe_in_flight: Cell<bool>,
}

impl CircuitBreaker {
    pub(crate) fn new(cfg: CircuitBreakerConfig) -> Self {
        let now = Instant::now();
        Self {
            cfg,
            state: Cell::new(BreakerState::Closed),
            failures: Cell::new(0),
            window_started: Cell::new(now),
            opened_at: Cell::new(now),
            probe_in_flight: Cell::new(false),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state.get()
    }

    /// Non-mutating check used when filtering eligible endpoints.
    ///
    /// An open breaker whose cooldown has elapsed reports `true` so the
    /// endpoint can be selected for its probe.
    pub(crate) fn allows_selection(&self) -> bool {
        if !self.cfg.enabled {
            return true;
        }
        match self.state.get() {
            BreakerState::Closed => true,
            BreakerState::Open => self.opened_at.get().elapsed() >= self.cfg.cooldown,
            BreakerState::HalfOpen => !self.probe_in_flight.get(),
        }
    }

    /// Admit or reject a call, transitioning open -> half-open when due.
    pub(crate) fn try_acquire(&self) -> Admission {
        if !self.cfg.enabled {
            return Admission::Allowed;
        }
        match self.state.get() {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::Open => {
                if self.opened_at.get().elapsed() >= self.cfg.cooldown {
                    self.state.set(BreakerState::HalfOpen);
                    self.probe_in_flight.set(true);
                    Admission::AllowedProbe
                } else {
                    Admission::Rejected
                }
            }
            BreakerState::HalfOpen => {
                if self.probe_in_flight.get() {
                    Admission::Rejected
                } else {
                    self.probe_in_flight.set(true);
                    Admission::AllowedProbe
                }
            }
        }
    }

    pub(crate) fn on_success(&self) -> Option<BreakerTransition> {
        if !self.cfg.enabled {
            return None;
        }
        match self.state.get() {
            BreakerState::HalfOpen => {
                self.state.set(BreakerState::Closed);
                self.failures.set(0);
                self.window_started.set(Instant::now());
                self.probe_in_flight.set(false);
                Some(BreakerTransition::Closed)
            }
            _ => None,
        }
    }

    /// Release the half-open probe slot without a health verdict.
    ///
    /// Runs when a probe call is cancelled before completing, or when it
    /// finishes with an expected failure that does not count against the
    /// breaker; otherwise the slot would stay taken and the breaker could
    /// never leave half-open.
    pub(crate) fn abandon_probe(&self) {
        if self.state.get() == BreakerState::HalfOpen {
            self.probe_in_flight.set(false);
        }
    }

    pub(crate) fn on_failure(&self) -> Option<BreakerTransition> {
        if !self.cfg.enabled {
            return None;
        }
        let now = Instant::now();
        match self.state.get() {
            BreakerState::Closed => {
                if now.duration_since(self.window_started.get()) > self.cfg.window {
                    self.failures.set(0);
                    self.window_started.set(now);
                }
                let failures = self.failures.get() + 1;
                self.failures.set(failures);
                if failures >= self.cfg.threshold {
                    self.state.set(BreakerState::Open);
                    self.opened_at.set(now);
                    Some(BreakerTransition::Opened)
                } else {
                    None
                }
            }
            BreakerState::HalfOpen => {
                self.state.set(BreakerState::Open);
                self.opened_at.set(now);
                self.probe_in_flight.set(false);
                Some(BreakerTransition::Opened)
            }
            BreakerState::Open => None,
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state.get())
            .field("failures", &self.failures.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::advance;

    fn breaker(threshold: u32, window: Duration, cooldown: Duration) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            enabled: true,
            threshold,
            window,
            cooldown,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_failures_open_the_breaker() {
        let cb = breaker(3, Duration::from_secs(60), Duration::from_secs(10));

        assert_eq!(cb.on_failure(), None);
        assert_eq!(cb.on_failure(), None);
        assert_eq!(cb.on_failure(), Some(BreakerTransition::Opened));
        assert_eq!(cb.state(), BreakerState::Open);
        assert_eq!(cb.try_acquire(), Admission::Rejected);
        assert!(!cb.allows_selection());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_admits_exactly_one_probe() {
        let cb = breaker(1, Duration::from_secs(60), Duration::from_secs(10));
        cb.on_failure();
        assert_eq!(cb.state(), BreakerState::Open);

        advance(Duration::from_secs(10)).await;
        assert!(cb.allows_selection());
        assert_eq!(cb.try_acquire(), Admission::AllowedProbe);
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        // The probe is in flight; nothing else gets through.
        assert_eq!(cb.try_acquire(), Admission::Rejected);
        assert!(!cb.allows_selection());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_success_closes() {
        let cb = breaker(1, Duration::from_secs(60), Duration::from_secs(5));
        cb.on_failure();
        advance(Duration::from_secs(5)).await;
        cb.try_acquire();

        assert_eq!(cb.on_success(), Some(BreakerTransition::Closed));
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.try_acquire(), Admission::Allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_reopens() {
        let cb = breaker(1, Duration::from_secs(60), Duration::from_secs(5));
        cb.on_failure();
        advance(Duration::from_secs(5)).await;
        cb.try_acquire();

        assert_eq!(cb.on_failure(), Some(BreakerTransition::Opened));
        assert_eq!(cb.state(), BreakerState::Open);
        // Cooldown restarted.
        assert_eq!(cb.try_acquire(), Admission::Rejected);
        advance(Duration::from_secs(5)).await;
        assert_eq!(cb.try_acquire(), Admission::AllowedProbe);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_do_not_accumulate() {
        let cb = breaker(2, Duration::from_secs(1), Duration::from_secs(5));
        cb.on_failure();
        advance(Duration::from_secs(2)).await;
        // Window rolled over; this failure starts a fresh count.
        assert_eq!(cb.on_failure(), None);
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_probe_frees_the_slot() {
        let cb = breaker(1, Duration::from_secs(60), Duration::from_secs(5));
        cb.on_failure();
        advance(Duration::from_secs(5)).await;
        assert_eq!(cb.try_acquire(), Admission::AllowedProbe);
        assert_eq!(cb.try_acquire(), Admission::Rejected);

        cb.abandon_probe();
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        assert_eq!(cb.try_acquire(), Admission::AllowedProbe);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_breaker_never_rejects() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::default());
        for _ in 0..100 {
            cb.on_failure();
        }
        assert_eq!(cb.try_acquire(), Admission::Allowed);
        assert!(cb.allows_selection());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_while_closed_reports_nothing() {
        let cb = breaker(3, Duration::from_secs(60), Duration::from_secs(10));
        assert_eq!(cb.on_success(), None);
    }
}
