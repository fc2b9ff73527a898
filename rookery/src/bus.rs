//! Typed broker notifications.
//!
//! Internal components publish lifecycle and health changes here instead of
//! calling each other back. Subscribers get an unbounded receiver; closed
//! receivers are pruned on the next publish.

use std::cell::RefCell;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::pipeline::circuit_breaker::BreakerState;
use crate::registry::NodeId;

/// Everything the broker announces about itself and the mesh.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    Started,
    Stopped,
    NodeConnected {
        node: NodeId,
        /// A node we had already seen coming back.
        reconnected: bool,
    },
    /// A live node announced a newer manifest.
    NodeUpdated { node: NodeId },
    NodeDisconnected {
        node: NodeId,
        /// Heartbeat expiry rather than a graceful DISCONNECT.
        unexpected: bool,
    },
    ServiceAdded { service: String },
    ServiceRemoved { service: String },
    BreakerStateChanged {
        action: String,
        node: NodeId,
        state: BreakerState,
    },
    /// Metrics hook: one per finished call attempt.
    CallFinished {
        action: String,
        node: NodeId,
        elapsed: Duration,
        ok: bool,
        from_cache: bool,
    },
    PongReceived {
        node: NodeId,
        rtt: Duration,
        offset_ms: i64,
    },
}

#[derive(Default)]
pub struct NotificationBus {
    subscribers: RefCell<Vec<mpsc::UnboundedSender<BrokerEvent>>>,
}

impl NotificationBus {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Subscribe to every event published from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<BrokerEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers.borrow_mut().push(sender);
        receiver
    }

    pub(crate) fn publish(&self, event: BrokerEvent) {
        self.subscribers
            .borrow_mut()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}
