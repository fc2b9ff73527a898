//! Error types for the rookery service broker.
//!
//! The taxonomy distinguishes *expected* application failures (validation,
//! missing services) from *unexpected* infrastructure failures (timeouts,
//! transport loss). Only the latter are retryable and only the latter count
//! against an endpoint's circuit breaker; see [`BrokerError::retryable`]
//! and [`BrokerError::counts_for_breaker`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::NodeId;
use crate::serializer::SerializerError;
use crate::transport::TransportError;

/// Errors surfaced by broker calls and event emission.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// No live endpoint exists for the requested action.
    #[error("service '{action}' is not available")]
    ServiceNotFound {
        /// Full action name that could not be resolved.
        action: String,
    },

    /// The call deadline elapsed before a response arrived.
    #[error("request '{action}' timed out after {elapsed_ms}ms")]
    RequestTimeout {
        action: String,
        /// Node the last attempt was addressed to, if one was selected.
        node: Option<NodeId>,
        elapsed_ms: u64,
    },

    /// The call was never dispatched because its deadline had already passed.
    ///
    /// Raised when a parent call timed out while a child call was still
    /// queued, so the child would be wasted work.
    #[error("request '{action}' skipped: deadline already elapsed")]
    RequestSkipped { action: String },

    /// Call-chain depth reached the configured `max_call_level`.
    #[error("max call level reached at depth {level}")]
    MaxCallLevel { level: u32 },

    /// The selected endpoint's circuit breaker is open.
    #[error("circuit breaker is open for '{action}' on node '{node}'")]
    CircuitBreakerOpen { action: String, node: NodeId },

    /// The action's bulkhead is saturated and its queue is full.
    #[error("bulkhead queue is full for '{action}'")]
    QueueFull { action: String },

    /// Parameter validation failed. An expected application error.
    #[error("parameters invalid: {message}")]
    Validation {
        message: String,
        /// Structured detail (offending fields etc.), echoed to remote callers.
        data: Option<serde_json::Value>,
    },

    /// The target node disconnected or was never known.
    #[error("node '{node}' is not available")]
    NodeUnavailable { node: NodeId },

    /// Packet encode/decode failed.
    #[error("serializer error: {0}")]
    Serializer(#[from] SerializerError),

    /// Transport-level failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A service definition was rejected at registration time.
    #[error("invalid service schema: {message}")]
    ServiceSchema { message: String },

    /// A failure reported by a remote node that has no local counterpart.
    #[error("remote error from node '{node}': [{kind}] {message}")]
    Remote {
        /// Error kind string as sent by the peer.
        kind: String,
        message: String,
        node: NodeId,
        retryable: bool,
    },

    /// A local action handler returned an error.
    #[error("handler failed: {message}")]
    Handler { message: String },
}

impl BrokerError {
    /// Stable kind string used on the wire and in bus notifications.
    pub fn kind(&self) -> &str {
        match self {
            BrokerError::ServiceNotFound { .. } => "ServiceNotFound",
            BrokerError::RequestTimeout { .. } => "RequestTimeout",
            BrokerError::RequestSkipped { .. } => "RequestSkipped",
            BrokerError::MaxCallLevel { .. } => "MaxCallLevel",
            BrokerError::CircuitBreakerOpen { .. } => "CircuitBreakerOpen",
            BrokerError::QueueFull { .. } => "QueueFull",
            BrokerError::Validation { .. } => "Validation",
            BrokerError::NodeUnavailable { .. } => "NodeUnavailable",
            BrokerError::Serializer(_) => "Serializer",
            BrokerError::Transport(_) => "Transport",
            BrokerError::ServiceSchema { .. } => "ServiceSchema",
            BrokerError::Remote { kind, .. } => kind,
            BrokerError::Handler { .. } => "Handler",
        }
    }

    /// Whether a retry policy may re-send the call after this failure.
    ///
    /// Timeouts and transport-level failures are transient; application
    /// errors and policy rejections are not.
    pub fn retryable(&self) -> bool {
        match self {
            BrokerError::RequestTimeout { .. }
            | BrokerError::NodeUnavailable { .. }
            | BrokerError::Transport(_) => true,
            BrokerError::Remote { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Whether this failure counts toward opening the endpoint's circuit
    /// breaker.
    ///
    /// Expected application errors (validation, unknown service) say nothing
    /// about endpoint health, so they do not count.
    pub fn counts_for_breaker(&self) -> bool {
        match self {
            BrokerError::ServiceNotFound { .. }
            | BrokerError::RequestSkipped { .. }
            | BrokerError::MaxCallLevel { .. }
            | BrokerError::CircuitBreakerOpen { .. }
            | BrokerError::QueueFull { .. }
            | BrokerError::Validation { .. }
            | BrokerError::ServiceSchema { .. } => false,
            BrokerError::Remote { retryable, .. } => *retryable,
            _ => true,
        }
    }
}

/// Error form carried inside a RESPONSE packet.
///
/// `data` holds the structured fields of the original error so the caller
/// side can rebuild the same [`BrokerError`] variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: String,
    pub message: String,
    pub node_id: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl WireError {
    /// Capture a broker error for transmission from `node`.
    pub fn capture(err: &BrokerError, node: &NodeId) -> Self {
        let data = match err {
            BrokerError::ServiceNotFound { action }
            | BrokerError::RequestSkipped { action }
            | BrokerError::QueueFull { action }
            | BrokerError::CircuitBreakerOpen { action, .. } => {
                Some(serde_json::json!({ "action": action }))
            }
            BrokerError::RequestTimeout {
                action, elapsed_ms, ..
            } => Some(serde_json::json!({ "action": action, "elapsedMs": elapsed_ms })),
            BrokerError::MaxCallLevel { level } => Some(serde_json::json!({ "level": level })),
            BrokerError::Validation { data, .. } => data.clone(),
            BrokerError::NodeUnavailable { node } => {
                Some(serde_json::json!({ "node": node.as_str() }))
            }
            BrokerError::Remote { .. } => None,
            _ => None,
        };
        WireError {
            kind: err.kind().to_string(),
            message: err.to_string(),
            node_id: node.as_str().to_string(),
            retryable: err.retryable(),
            data,
        }
    }

    /// Rebuild the caller-side error. `from` is the responding node.
    pub fn rehydrate(self, from: &NodeId) -> BrokerError {
        let field = |name: &str| -> Option<String> {
            self.data
                .as_ref()
                .and_then(|d| d.get(name))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };
        match self.kind.as_str() {
            "ServiceNotFound" => BrokerError::ServiceNotFound {
                action: field("action").unwrap_or_default(),
            },
            "RequestTimeout" => BrokerError::RequestTimeout {
                action: field("action").unwrap_or_default(),
                node: Some(from.clone()),
                elapsed_ms: self
                    .data
                    .as_ref()
                    .and_then(|d| d.get("elapsedMs"))
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0),
            },
            "RequestSkipped" => BrokerError::RequestSkipped {
                action: field("action").unwrap_or_default(),
            },
            "MaxCallLevel" => BrokerError::MaxCallLevel {
                level: self
                    .data
                    .as_ref()
                    .and_then(|d| d.get("level"))
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as u32,
            },
            "CircuitBreakerOpen" => BrokerError::CircuitBreakerOpen {
                action: field("action").unwrap_or_default(),
                node: from.clone(),
            },
            "QueueFull" => BrokerError::QueueFull {
                action: field("action").unwrap_or_default(),
            },
            "Validation" => BrokerError::Validation {
                message: self.message,
                data: self.data,
            },
            "NodeUnavailable" => BrokerError::NodeUnavailable {
                node: field("node").map(NodeId::new).unwrap_or_else(|| from.clone()),
            },
            "Handler" => BrokerError::Handler {
                message: self.message,
            },
            _ => BrokerError::Remote {
                kind: self.kind,
                message: self.message,
                node: from.clone(),
                retryable: self.retryable,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> NodeId {
        NodeId::new(id)
    }

    #[test]
    fn test_timeouts_and_transport_failures_are_retryable() {
        let timeout = BrokerError::RequestTimeout {
            action: "math.add".into(),
            node: Some(node("a")),
            elapsed_ms: 500,
        };
        let unavailable = BrokerError::NodeUnavailable { node: node("a") };

        assert!(timeout.retryable());
        assert!(unavailable.retryable());
    }

    #[test]
    fn test_policy_rejections_are_not_retryable() {
        let cases = [
            BrokerError::ServiceNotFound {
                action: "x".into(),
            },
            BrokerError::Validation {
                message: "bad".into(),
                data: None,
            },
            BrokerError::QueueFull { action: "x".into() },
            BrokerError::CircuitBreakerOpen {
                action: "x".into(),
                node: node("a"),
            },
            BrokerError::MaxCallLevel { level: 4 },
        ];
        for err in cases {
            assert!(!err.retryable(), "{err} should not be retryable");
            assert!(!err.counts_for_breaker(), "{err} should not trip breakers");
        }
    }

    #[test]
    fn test_handler_errors_count_for_breaker_but_do_not_retry() {
        let err = BrokerError::Handler {
            message: "boom".into(),
        };
        assert!(err.counts_for_breaker());
        assert!(!err.retryable());
    }

    #[test]
    fn test_wire_round_trip_preserves_validation_kind() {
        let original = BrokerError::Validation {
            message: "age must be positive".into(),
            data: Some(serde_json::json!({ "field": "age" })),
        };
        let wire = WireError::capture(&original, &node("remote-1"));
        let back = wire.rehydrate(&node("remote-1"));

        match &back {
            BrokerError::Validation { data, .. } => {
                assert_eq!(data, &Some(serde_json::json!({ "field": "age" })));
            }
            other => panic!("expected Validation, got {other:?}"),
        }
        assert!(!back.retryable());
    }

    #[test]
    fn test_wire_round_trip_preserves_timeout_fields() {
        let original = BrokerError::RequestTimeout {
            action: "math.add".into(),
            node: Some(node("remote-1")),
            elapsed_ms: 1500,
        };
        let wire = WireError::capture(&original, &node("remote-1"));
        assert!(wire.retryable);

        match wire.rehydrate(&node("remote-1")) {
            BrokerError::RequestTimeout {
                action, elapsed_ms, ..
            } => {
                assert_eq!(action, "math.add");
                assert_eq!(elapsed_ms, 1500);
            }
            other => panic!("expected RequestTimeout, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_wire_kind_becomes_remote() {
        let wire = WireError {
            kind: "SomethingCustom".into(),
            message: "wat".into(),
            node_id: "remote-1".into(),
            retryable: true,
            data: None,
        };
        match wire.rehydrate(&node("remote-1")) {
            BrokerError::Remote {
                kind, retryable, ..
            } => {
                assert_eq!(kind, "SomethingCustom");
                assert!(retryable);
            }
            other => panic!("expected Remote, got {other:?}"),
        }
    }
}
