//! Endpoints: the (node, action/event) bindings strategies select among.

use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use serde_json::Value;

use crate::config::CircuitBreakerConfig;
use crate::pipeline::circuit_breaker::CircuitBreaker;
use crate::registry::node::{Node, NodeId};
use crate::service::{ActionSpec, EventSpec};
use crate::strategy::{Strategy, StrategyKind};
use crate::transit::packet::{ActionInfo, EventInfo};

/// Does `pattern` (with `*` / `**` wildcards) match the event `name`?
///
/// `*` matches exactly one dot-separated segment, `**` one or more.
pub(crate) fn pattern_matches(pattern: &str, name: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == name;
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let name: Vec<&str> = name.split('.').collect();
    match_segments(&pattern, &name)
}

fn match_segments(pattern: &[&str], name: &[&str]) -> bool {
    match pattern.split_first() {
        None => name.is_empty(),
        Some((&"**", rest)) => (1..=name.len()).any(|taken| match_segments(rest, &name[taken..])),
        Some((&segment, rest)) => match name.split_first() {
            Some((&head, tail)) => (segment == "*" || segment == head) && match_segments(rest, tail),
            None => false,
        },
    }
}

/// One callable action on one node.
pub struct ActionEndpoint {
    node: Rc<Node>,
    name: String,
    /// Present on local endpoints only; remote handlers live elsewhere.
    action: Option<Rc<ActionSpec>>,
    /// Announced timeout of a remote action.
    announced_timeout: Option<Duration>,
    breaker: CircuitBreaker,
}

impl ActionEndpoint {
    pub(crate) fn local(
        node: Rc<Node>,
        name: String,
        action: Rc<ActionSpec>,
        breaker_cfg: CircuitBreakerConfig,
    ) -> Self {
        let breaker_cfg = action.circuit_breaker.clone().unwrap_or(breaker_cfg);
        Self {
            node,
            name,
            action: Some(action),
            announced_timeout: None,
            breaker: CircuitBreaker::new(breaker_cfg),
        }
    }

    pub(crate) fn remote(
        node: Rc<Node>,
        info: &ActionInfo,
        breaker_cfg: CircuitBreakerConfig,
    ) -> Self {
        Self {
            node,
            name: info.name.clone(),
            action: None,
            announced_timeout: info.timeout_ms.map(Duration::from_millis),
            breaker: CircuitBreaker::new(breaker_cfg),
        }
    }

    pub fn node(&self) -> &Rc<Node> {
        &self.node
    }

    pub fn node_id(&self) -> &NodeId {
        self.node.id()
    }

    pub fn is_local(&self) -> bool {
        self.node.is_local()
    }

    pub(crate) fn action(&self) -> Option<&Rc<ActionSpec>> {
        self.action.as_ref()
    }

    /// Action-level timeout override, wherever the action lives.
    pub(crate) fn action_timeout(&self) -> Option<Duration> {
        match &self.action {
            Some(spec) => spec.timeout,
            None => self.announced_timeout,
        }
    }

    pub(crate) fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

impl fmt::Debug for ActionEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionEndpoint")
            .field("name", &self.name)
            .field("node", self.node.id())
            .field("local", &self.is_local())
            .field("breaker", &self.breaker.state())
            .finish()
    }
}

/// One event subscription on one node.
pub struct EventEndpoint {
    node: Rc<Node>,
    /// Full name of the subscribing service, for endpoint identity.
    service: String,
    pattern: String,
    group: String,
    event: Option<Rc<EventSpec>>,
}

impl EventEndpoint {
    pub(crate) fn local(
        node: Rc<Node>,
        service: String,
        group: String,
        event: Rc<EventSpec>,
    ) -> Self {
        Self {
            node,
            service,
            pattern: event.name().to_string(),
            group,
            event: Some(event),
        }
    }

    pub(crate) fn remote(node: Rc<Node>, service: String, info: &EventInfo) -> Self {
        Self {
            node,
            service,
            pattern: info.name.clone(),
            group: info.group.clone(),
            event: None,
        }
    }

    pub fn node(&self) -> &Rc<Node> {
        &self.node
    }

    pub fn node_id(&self) -> &NodeId {
        self.node.id()
    }

    pub(crate) fn service(&self) -> &str {
        &self.service
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn is_local(&self) -> bool {
        self.node.is_local()
    }

    pub(crate) fn event(&self) -> Option<&Rc<EventSpec>> {
        self.event.as_ref()
    }

    pub(crate) fn is_selectable(&self) -> bool {
        self.node.is_available()
    }
}

impl fmt::Debug for EventEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEndpoint")
            .field("pattern", &self.pattern)
            .field("group", &self.group)
            .field("node", self.node.id())
            .field("service", &self.service)
            .finish()
    }
}

/// Selection outcome over one action's endpoint list.
pub(crate) enum Selection {
    /// No live endpoint at all.
    None,
    /// Live endpoints exist but every breaker is blocking; the node of the
    /// first blocked endpoint is reported in the error.
    AllOpen(NodeId),
    One(Rc<ActionEndpoint>),
}

/// Endpoints for one action name plus the list's strategy instance.
pub(crate) struct EndpointList {
    name: String,
    endpoints: Vec<Rc<ActionEndpoint>>,
    strategy: Box<dyn Strategy>,
}

impl EndpointList {
    pub(crate) fn new(name: String, kind: &StrategyKind) -> Self {
        Self {
            name,
            endpoints: Vec::new(),
            strategy: kind.build(),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn endpoints(&self) -> &[Rc<ActionEndpoint>] {
        &self.endpoints
    }

    /// Insert or replace the endpoint for `endpoint.node()`.
    pub(crate) fn upsert(&mut self, endpoint: ActionEndpoint) {
        let endpoint = Rc::new(endpoint);
        match self
            .endpoints
            .iter_mut()
            .find(|existing| existing.node_id() == endpoint.node_id())
        {
            Some(slot) => *slot = endpoint,
            None => self.endpoints.push(endpoint),
        }
    }

    /// Drop the node's endpoint; reports whether the list is now empty.
    pub(crate) fn remove_node(&mut self, node: &NodeId) -> bool {
        self.endpoints.retain(|endpoint| endpoint.node_id() != node);
        self.endpoints.is_empty()
    }

    pub(crate) fn find(&self, node: &NodeId) -> Option<&Rc<ActionEndpoint>> {
        self.endpoints.iter().find(|endpoint| endpoint.node_id() == node)
    }

    /// Pick one selectable endpoint via the list's strategy.
    pub(crate) fn select(&self, params: &Value, meta: &Value) -> Selection {
        let live: Vec<&Rc<ActionEndpoint>> = self
            .endpoints
            .iter()
            .filter(|endpoint| endpoint.node().is_available())
            .collect();
        if live.is_empty() {
            return Selection::None;
        }

        let selectable: Vec<&Rc<ActionEndpoint>> = live
            .iter()
            .copied()
            .filter(|endpoint| endpoint.breaker.allows_selection())
            .collect();
        if selectable.is_empty() {
            return Selection::AllOpen(live[0].node_id().clone());
        }

        let candidates: Vec<Rc<Node>> = selectable
            .iter()
            .map(|endpoint| Rc::clone(endpoint.node()))
            .collect();
        match self.strategy.select(&candidates, params, meta) {
            Some(index) => Selection::One(Rc::clone(selectable[index])),
            None => Selection::None,
        }
    }

    pub(crate) fn on_call_finished(&self, node: &NodeId, elapsed: Duration) {
        self.strategy.on_call_finished(node, elapsed);
    }
}

impl fmt::Debug for EndpointList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointList")
            .field("name", &self.name)
            .field("endpoints", &self.endpoints)
            .finish()
    }
}

/// Endpoints for one (pattern, group) subscription plus its strategy.
pub(crate) struct EventEntry {
    pattern: String,
    group: String,
    endpoints: Vec<Rc<EventEndpoint>>,
    strategy: Box<dyn Strategy>,
}

impl EventEntry {
    pub(crate) fn new(pattern: String, group: String, kind: &StrategyKind) -> Self {
        Self {
            pattern,
            group,
            endpoints: Vec::new(),
            strategy: kind.build(),
        }
    }

    pub(crate) fn pattern(&self) -> &str {
        &self.pattern
    }

    pub(crate) fn group(&self) -> &str {
        &self.group
    }

    pub(crate) fn endpoints(&self) -> &[Rc<EventEndpoint>] {
        &self.endpoints
    }

    pub(crate) fn matches(&self, event: &str) -> bool {
        pattern_matches(&self.pattern, event)
    }

    /// Insert or replace the endpoint for (node, service).
    pub(crate) fn upsert(&mut self, endpoint: EventEndpoint) {
        let endpoint = Rc::new(endpoint);
        match self.endpoints.iter_mut().find(|existing| {
            existing.node_id() == endpoint.node_id() && existing.service() == endpoint.service()
        }) {
            Some(slot) => *slot = endpoint,
            None => self.endpoints.push(endpoint),
        }
    }

    pub(crate) fn remove_node(&mut self, node: &NodeId) -> bool {
        self.endpoints.retain(|endpoint| endpoint.node_id() != node);
        self.endpoints.is_empty()
    }

    pub(crate) fn remove_service(&mut self, node: &NodeId, service: &str) -> bool {
        self.endpoints
            .retain(|endpoint| !(endpoint.node_id() == node && endpoint.service() == service));
        self.endpoints.is_empty()
    }

    /// Strategy-pick one live endpoint, optionally restricted to local ones.
    pub(crate) fn select(&self, local_only: bool, payload: &Value) -> Option<Rc<EventEndpoint>> {
        let eligible: Vec<&Rc<EventEndpoint>> = self
            .endpoints
            .iter()
            .filter(|endpoint| endpoint.is_selectable() && (!local_only || endpoint.is_local()))
            .collect();
        if eligible.is_empty() {
            return None;
        }
        let candidates: Vec<Rc<Node>> = eligible
            .iter()
            .map(|endpoint| Rc::clone(endpoint.node()))
            .collect();
        let index = self
            .strategy
            .select(&candidates, payload, &Value::Null)?;
        Some(Rc::clone(eligible[index]))
    }
}

impl fmt::Debug for EventEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEntry")
            .field("pattern", &self.pattern)
            .field("group", &self.group)
            .field("endpoints", &self.endpoints)
            .finish()
    }
}
