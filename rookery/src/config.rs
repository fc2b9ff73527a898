//! Broker configuration and fault-tolerance policy structs.

use std::time::Duration;

use crate::strategy::StrategyKind;

/// Top-level broker options.
///
/// Per-action overrides on [`ActionSpec`](crate::service::ActionSpec) and
/// per-call overrides on [`CallOptions`](crate::context::CallOptions) win
/// over these defaults.
#[derive(Clone, Debug)]
pub struct BrokerOptions {
    /// Node id announced to the mesh. `None` generates `node-{hex}`.
    pub node_id: Option<String>,

    /// Mesh namespace. Brokers only see peers with the same namespace.
    pub namespace: String,

    /// Default overall timeout for a call. `Duration::ZERO` disables it.
    pub request_timeout: Duration,

    /// Maximum call-chain depth. `0` means unlimited.
    pub max_call_level: u32,

    /// Interval between outgoing HEARTBEAT packets.
    pub heartbeat_interval: Duration,

    /// Silence after which a peer is treated as gone.
    pub heartbeat_timeout: Duration,

    /// Load-balancing strategy for new endpoint lists.
    pub strategy: StrategyKind,

    /// Default retry policy.
    pub retry: RetryPolicy,

    /// Default circuit-breaker policy.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Default bulkhead policy for local actions.
    pub bulkhead: BulkheadConfig,

    /// Register the `$node` introspection service on start.
    pub internal_services: bool,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            node_id: None,
            namespace: String::new(),
            request_timeout: Duration::from_secs(10),
            max_call_level: 0, // unlimited
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
            strategy: StrategyKind::RoundRobin,
            retry: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            bulkhead: BulkheadConfig::default(),
            internal_services: true,
        }
    }
}

impl BrokerOptions {
    /// Tightened timings for in-process test meshes.
    pub fn for_tests() -> Self {
        Self {
            request_timeout: Duration::from_secs(2),
            heartbeat_interval: Duration::from_millis(100),
            heartbeat_timeout: Duration::from_millis(300),
            ..Self::default()
        }
    }

    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_call_level(mut self, level: u32) -> Self {
        self.max_call_level = level;
        self
    }

    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }
}

/// Retry policy for failed calls.
///
/// Only errors classified retryable by
/// [`BrokerError::retryable`](crate::error::BrokerError::retryable) are
/// re-sent; the endpoint is re-resolved on every attempt.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Extra attempts after the first. `0` disables retrying.
    pub retries: u32,

    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Upper bound for the computed delay.
    pub max_delay: Duration,

    /// Multiplier applied per attempt; `1.0` keeps the delay fixed.
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 0, // opt-in: actions are not assumed idempotent
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Enable retrying with `retries` extra attempts and default backoff.
    pub fn attempts(retries: u32) -> Self {
        Self {
            retries,
            ..Self::default()
        }
    }

    /// Backoff before retry number `attempt` (1-based):
    /// `base_delay * factor^(attempt-1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let ms = self.base_delay.as_millis() as f64 * self.factor.powi(exp);
        let capped = ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

/// Circuit-breaker policy, applied per endpoint.
///
/// The breaker opens once `threshold` qualifying failures land inside one
/// `window`. An open breaker rejects immediately until `cooldown` elapses,
/// then admits a single half-open probe: success closes the breaker,
/// failure restarts the cooldown.
#[derive(Clone, Debug, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Gate calls through the breaker at all.
    pub enabled: bool,

    /// Failures within `window` that open the breaker.
    pub threshold: u32,

    /// Width of the failure-counting window.
    pub window: Duration,

    /// How long an open breaker rejects before probing.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: false, // opt-in, matching the other policies
            threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(10),
        }
    }
}

impl CircuitBreakerConfig {
    /// Enabled breaker with the default thresholds.
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

/// Bulkhead policy: bounds concurrent executions of a local action.
///
/// Excess calls wait in FIFO order up to `max_queue`; beyond that they are
/// rejected with `QueueFull`. `max_queue = 0` rejects as soon as all
/// concurrency slots are taken.
#[derive(Clone, Debug, PartialEq)]
pub struct BulkheadConfig {
    pub enabled: bool,

    /// Concurrent executions allowed per action.
    pub concurrency: u32,

    /// Calls allowed to wait for a slot.
    pub max_queue: u32,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            concurrency: 10,
            max_queue: 100,
        }
    }
}

impl BulkheadConfig {
    /// Enabled bulkhead with the given concurrency and queue bounds.
    pub fn limits(concurrency: u32, max_queue: u32) -> Self {
        Self {
            enabled: true,
            concurrency,
            max_queue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timings() {
        let options = BrokerOptions::default();
        assert_eq!(options.request_timeout, Duration::from_secs(10));
        assert_eq!(options.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(options.heartbeat_timeout, Duration::from_secs(15));
        assert_eq!(options.max_call_level, 0);
        assert!(options.internal_services);
    }

    #[test]
    fn test_retry_backoff_grows_exponentially() {
        let policy = RetryPolicy {
            retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        // Capped.
        assert_eq!(policy.delay_for(10), Duration::from_secs(2));
    }

    #[test]
    fn test_retry_factor_one_keeps_delay_fixed() {
        let policy = RetryPolicy {
            retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
            factor: 1.0,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for(4), Duration::from_millis(250));
    }

    #[test]
    fn test_policies_are_opt_in_by_default() {
        assert_eq!(RetryPolicy::default().retries, 0);
        assert!(!CircuitBreakerConfig::default().enabled);
        assert!(!BulkheadConfig::default().enabled);
    }
}
