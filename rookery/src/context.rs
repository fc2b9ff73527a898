//! Per-invocation call context.
//!
//! A [`Context`] travels with every action call and event delivery. It
//! carries the correlation ids that stitch a call chain together, the
//! caller's metadata, the call depth and the deadline inherited from the
//! root call. Handlers use it to reach back into the broker for nested
//! calls, which keeps the chain accounting (`level`, `request_id`,
//! deadline) intact.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tokio::time::Instant;

use crate::broker::Broker;
use crate::error::BrokerError;
use crate::registry::NodeId;

/// Fresh 128-bit call id, rendered as 32 hex digits.
pub(crate) fn new_call_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// Per-call overrides for [`Broker::call`](crate::broker::Broker::call).
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Overrides the action and broker level timeout. Zero disables it.
    pub timeout: Option<Duration>,

    /// Overrides the retry budget for this call.
    pub retries: Option<u32>,

    /// Value returned instead of the error when the call ultimately fails.
    pub fallback: Option<serde_json::Value>,

    /// Pin the call to one node, bypassing strategy selection.
    pub node_id: Option<NodeId>,

    /// Extra metadata merged over the context meta for this call.
    pub meta: Option<serde_json::Value>,
}

impl CallOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_fallback(mut self, fallback: serde_json::Value) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_node(mut self, node_id: impl Into<NodeId>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// Execution context handed to action and event handlers.
#[derive(Clone)]
pub struct Context {
    id: String,
    request_id: String,
    action: Option<String>,
    event: Option<String>,
    params: serde_json::Value,
    meta: Rc<RefCell<serde_json::Value>>,
    level: u32,
    parent_id: Option<String>,
    caller: Option<String>,
    deadline: Option<Instant>,
    caller_node: NodeId,
    broker: Weak<Broker>,
}

impl Context {
    /// Root context for a call or emit entering the system on this node.
    pub(crate) fn new_root(broker: &Rc<Broker>, meta: serde_json::Value) -> Self {
        let id = new_call_id();
        Self {
            request_id: id.clone(),
            id,
            action: None,
            event: None,
            params: serde_json::Value::Null,
            meta: Rc::new(RefCell::new(meta)),
            level: 1,
            parent_id: None,
            caller: None,
            deadline: None,
            caller_node: broker.node_id().clone(),
            broker: Rc::downgrade(broker),
        }
    }

    /// Child context for a nested call made from inside a handler.
    ///
    /// The child shares the parent's meta object and request id, sits one
    /// level deeper and names the parent action as its caller.
    pub(crate) fn child(&self) -> Self {
        Self {
            id: new_call_id(),
            request_id: self.request_id.clone(),
            action: None,
            event: None,
            params: serde_json::Value::Null,
            meta: Rc::clone(&self.meta),
            level: self.level + 1,
            parent_id: Some(self.id.clone()),
            caller: self.action.clone().or_else(|| self.event.clone()),
            deadline: self.deadline,
            caller_node: self.caller_node.clone(),
            broker: self.broker.clone(),
        }
    }

    /// Context rebuilt on the executing node from an incoming request.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn for_incoming(
        broker: &Rc<Broker>,
        id: String,
        request_id: String,
        params: serde_json::Value,
        meta: serde_json::Value,
        level: u32,
        parent_id: Option<String>,
        caller: Option<String>,
        deadline: Option<Instant>,
        caller_node: NodeId,
    ) -> Self {
        Self {
            id,
            request_id,
            action: None,
            event: None,
            params,
            meta: Rc::new(RefCell::new(meta)),
            level,
            parent_id,
            caller,
            deadline,
            caller_node,
            broker: Rc::downgrade(broker),
        }
    }

    /// Broker-less context for exercising handlers in unit tests.
    #[cfg(test)]
    pub(crate) fn test_local(params: serde_json::Value) -> Self {
        let id = new_call_id();
        Self {
            request_id: id.clone(),
            id,
            action: None,
            event: None,
            params,
            meta: Rc::new(RefCell::new(serde_json::json!({}))),
            level: 1,
            parent_id: None,
            caller: None,
            deadline: None,
            caller_node: NodeId::new("test-node"),
            broker: Weak::new(),
        }
    }

    pub(crate) fn with_action(mut self, action: &str, params: serde_json::Value) -> Self {
        self.action = Some(action.to_string());
        self.event = None;
        self.params = params;
        self
    }

    pub(crate) fn with_event(mut self, event: &str, payload: serde_json::Value) -> Self {
        self.event = Some(event.to_string());
        self.action = None;
        self.params = payload;
        self
    }

    pub(crate) fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub(crate) fn merge_meta(&self, extra: &serde_json::Value) {
        if let serde_json::Value::Object(extra) = extra {
            let mut meta = self.meta.borrow_mut();
            if !meta.is_object() {
                *meta = serde_json::json!({});
            }
            if let serde_json::Value::Object(target) = &mut *meta {
                for (key, value) in extra {
                    target.insert(key.clone(), value.clone());
                }
            }
        }
    }

    /// Unique id of this invocation.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Id of the root invocation of this call chain.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Action being invoked, if this is an action context.
    pub fn action(&self) -> Option<&str> {
        self.action.as_deref()
    }

    /// Event being delivered, if this is an event context.
    pub fn event(&self) -> Option<&str> {
        self.event.as_deref()
    }

    pub fn params(&self) -> &serde_json::Value {
        &self.params
    }

    /// Shared metadata of the call chain.
    pub fn meta(&self) -> Rc<RefCell<serde_json::Value>> {
        Rc::clone(&self.meta)
    }

    pub(crate) fn meta_snapshot(&self) -> serde_json::Value {
        self.meta.borrow().clone()
    }

    /// Depth of this context in the call chain, starting at 1.
    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    /// Action or event name that made this call, if any.
    pub fn caller(&self) -> Option<&str> {
        self.caller.as_deref()
    }

    /// Node the call chain entered the system on.
    pub fn caller_node(&self) -> &NodeId {
        &self.caller_node
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline. `None` when the call has no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub(crate) fn expired(&self) -> bool {
        matches!(self.remaining(), Some(remaining) if remaining.is_zero())
    }

    /// Call another action from inside a handler.
    pub async fn call(
        &self,
        action: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, BrokerError> {
        self.call_with(action, params, CallOptions::default()).await
    }

    /// Call another action with per-call options.
    pub async fn call_with(
        &self,
        action: &str,
        params: serde_json::Value,
        options: CallOptions,
    ) -> Result<serde_json::Value, BrokerError> {
        let broker = self.upgrade()?;
        broker.call_from(Some(self), action, params, options).await
    }

    /// Emit a balanced event from inside a handler.
    pub async fn emit(
        &self,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<(), BrokerError> {
        let broker = self.upgrade()?;
        broker.emit_from(Some(self), event, payload, None).await
    }

    /// Broadcast an event to every listener from inside a handler.
    pub async fn broadcast(
        &self,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<(), BrokerError> {
        let broker = self.upgrade()?;
        broker.broadcast_from(Some(self), event, payload).await
    }

    fn upgrade(&self) -> Result<Rc<Broker>, BrokerError> {
        self.broker.upgrade().ok_or_else(|| BrokerError::NodeUnavailable {
            node: self.caller_node.clone(),
        })
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("request_id", &self.request_id)
            .field("action", &self.action)
            .field("event", &self.event)
            .field("level", &self.level)
            .field("parent_id", &self.parent_id)
            .field("caller", &self.caller)
            .field("caller_node", &self.caller_node)
            .finish()
    }
}
