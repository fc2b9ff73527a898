//! Correlation of outbound requests with their responses.
//!
//! Every outbound REQUEST parks a oneshot sender here, keyed by call id.
//! The matching RESPONSE resolves it; a node loss rejects every call parked
//! for that node; a timed-out caller drops its entry so the late response
//! falls on the floor.

use std::cell::RefCell;
use std::collections::HashMap;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::error::BrokerError;
use crate::registry::NodeId;

/// Successful remote reply: result payload plus the meta echoed back.
#[derive(Debug, Clone)]
pub(crate) struct CallReply {
    pub(crate) data: serde_json::Value,
    pub(crate) meta: serde_json::Value,
}

type ReplySender = oneshot::Sender<Result<CallReply, BrokerError>>;
pub(crate) type ReplyReceiver = oneshot::Receiver<Result<CallReply, BrokerError>>;

struct PendingCall {
    action: String,
    node: NodeId,
    started: Instant,
    sender: ReplySender,
}

#[derive(Default)]
pub(crate) struct PendingStore {
    calls: RefCell<HashMap<String, PendingCall>>,
}

impl PendingStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Park a call until its RESPONSE arrives.
    ///
    /// Re-registering the same id (a retry attempt) replaces the previous
    /// entry; its receiver has already resolved by then.
    pub(crate) fn register(&self, id: &str, action: &str, node: &NodeId) -> ReplyReceiver {
        let (sender, receiver) = oneshot::channel();
        self.calls.borrow_mut().insert(
            id.to_string(),
            PendingCall {
                action: action.to_string(),
                node: node.clone(),
                started: Instant::now(),
                sender,
            },
        );
        receiver
    }

    /// Resolve a parked call. `false` means the id is unknown, typically a
    /// response outliving its caller's deadline.
    pub(crate) fn complete(&self, id: &str, result: Result<CallReply, BrokerError>) -> bool {
        let entry = self.calls.borrow_mut().remove(id);
        match entry {
            Some(call) => {
                if call.sender.send(result).is_err() {
                    debug!(
                        id,
                        action = %call.action,
                        elapsed_ms = call.started.elapsed().as_millis() as u64,
                        "pending call receiver already gone"
                    );
                }
                true
            }
            None => false,
        }
    }

    /// Forget a call so a late RESPONSE is discarded. Timeout path.
    pub(crate) fn drop_call(&self, id: &str) {
        self.calls.borrow_mut().remove(id);
    }

    /// Reject every call parked for `node`. Node-loss path.
    pub(crate) fn reject_for_node<E>(&self, node: &NodeId, error: E) -> usize
    where
        E: Fn() -> BrokerError,
    {
        let ids: Vec<String> = self
            .calls
            .borrow()
            .iter()
            .filter(|(_, call)| call.node == *node)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            self.complete(id, Err(error()));
        }
        ids.len()
    }

    /// Reject everything. Broker-stop path.
    pub(crate) fn reject_all<E>(&self, error: E) -> usize
    where
        E: Fn() -> BrokerError,
    {
        let ids: Vec<String> = self.calls.borrow().keys().cloned().collect();
        for id in &ids {
            self.complete(id, Err(error()));
        }
        ids.len()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.calls.borrow().len()
    }
}
