//! Soft-state service registry.
//!
//! ```text
//!                 INFO / HEARTBEAT / DISCONNECT        sweep (timer)
//!                              │                            │
//!                              ▼                            ▼
//!   nodes:    NodeId ─▶ Node { seq, instance_id, available, last_heartbeat }
//!                              │ 1..n
//!                              ▼
//!   actions:  "v2.users.get" ─▶ EndpointList [ ActionEndpoint(node, breaker) … ]
//!   events:   ("user.*", "mail") ─▶ EventEntry [ EventEndpoint(node) … ]
//! ```
//!
//! Every piece of remote state is soft: it arrives via INFO packets, decays
//! via the heartbeat sweep and is rebuilt from discovery after a restart.
//! Sequence numbers gate updates so out-of-order INFO never rolls a node
//! back; a changed instance id bypasses the gate because the peer restarted
//! and its counter started over.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::config::CircuitBreakerConfig;
use crate::error::BrokerError;
use crate::service::ServiceSpec;
use crate::strategy::StrategyKind;
use crate::transit::packet::{PacketHeartbeat, PacketInfo, ServiceInfo};

pub(crate) mod endpoint;
pub mod node;

pub(crate) use endpoint::{ActionEndpoint, EndpointList, EventEndpoint, EventEntry, Selection};
pub use node::{Node, NodeId};

/// How an incoming INFO changed the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InfoOutcome {
    /// First INFO from this node.
    New,
    /// Node was known but marked unavailable.
    Reconnected,
    /// Fresh manifest for a live node.
    Updated,
    /// Sequence not newer (or our own echo); dropped.
    Stale,
}

/// How an incoming HEARTBEAT was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeartbeatOutcome {
    Applied,
    /// Node unknown, unavailable or its manifest lags the announced
    /// sequence; the caller should ask for INFO.
    Unknown,
}

pub(crate) struct Registry {
    local: Rc<Node>,
    strategy_kind: StrategyKind,
    breaker_cfg: CircuitBreakerConfig,
    nodes: RefCell<HashMap<NodeId, Rc<Node>>>,
    actions: RefCell<HashMap<String, EndpointList>>,
    events: RefCell<Vec<EventEntry>>,
    local_services: RefCell<Vec<Rc<ServiceSpec>>>,
}

impl Registry {
    pub(crate) fn new(
        node_id: NodeId,
        instance_id: String,
        strategy_kind: StrategyKind,
        breaker_cfg: CircuitBreakerConfig,
    ) -> Self {
        let local = Rc::new(Node::new_local(node_id.clone(), instance_id));
        let mut nodes = HashMap::new();
        nodes.insert(node_id, Rc::clone(&local));
        Self {
            local,
            strategy_kind,
            breaker_cfg,
            nodes: RefCell::new(nodes),
            actions: RefCell::new(HashMap::new()),
            events: RefCell::new(Vec::new()),
            local_services: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn local_node(&self) -> &Rc<Node> {
        &self.local
    }

    pub(crate) fn node(&self, id: &NodeId) -> Option<Rc<Node>> {
        self.nodes.borrow().get(id).cloned()
    }

    /// Manifest of every local service, as announced in INFO.
    pub(crate) fn local_manifest(&self) -> Vec<ServiceInfo> {
        self.local.services()
    }

    // ---- local services ------------------------------------------------

    /// Register a local service and wire its endpoints.
    pub(crate) fn add_local_service(
        &self,
        spec: ServiceSpec,
    ) -> Result<Rc<ServiceSpec>, BrokerError> {
        if spec.name().is_empty() {
            return Err(BrokerError::ServiceSchema {
                message: "service name must not be empty".to_string(),
            });
        }
        let full_name = spec.full_name();
        if self
            .local_services
            .borrow()
            .iter()
            .any(|existing| existing.full_name() == full_name)
        {
            return Err(BrokerError::ServiceSchema {
                message: format!("service '{full_name}' is already registered"),
            });
        }
        for action in spec.actions() {
            if action.name().is_empty() {
                return Err(BrokerError::ServiceSchema {
                    message: format!("service '{full_name}' declares an unnamed action"),
                });
            }
        }

        let spec = Rc::new(spec);
        {
            let mut actions = self.actions.borrow_mut();
            for action in spec.actions() {
                let name = format!("{full_name}.{}", action.name());
                let list = actions
                    .entry(name.clone())
                    .or_insert_with(|| EndpointList::new(name.clone(), &self.strategy_kind));
                list.upsert(ActionEndpoint::local(
                    Rc::clone(&self.local),
                    name.clone(),
                    Rc::clone(action),
                    self.breaker_cfg.clone(),
                ));
            }
        }
        {
            let mut events = self.events.borrow_mut();
            for event in spec.events() {
                let group = event.resolved_group(&full_name);
                let index = match events
                    .iter()
                    .position(|entry| entry.pattern() == event.name() && entry.group() == group)
                {
                    Some(index) => index,
                    None => {
                        events.push(EventEntry::new(
                            event.name().to_string(),
                            group.clone(),
                            &self.strategy_kind,
                        ));
                        events.len() - 1
                    }
                };
                events[index].upsert(EventEndpoint::local(
                    Rc::clone(&self.local),
                    full_name.clone(),
                    group,
                    Rc::clone(event),
                ));
            }
        }

        self.local_services.borrow_mut().push(Rc::clone(&spec));
        self.refresh_local_manifest();
        Ok(spec)
    }

    /// Unregister a local service and drop its endpoints.
    pub(crate) fn remove_local_service(
        &self,
        full_name: &str,
    ) -> Result<Rc<ServiceSpec>, BrokerError> {
        let spec = {
            let mut services = self.local_services.borrow_mut();
            let index = services
                .iter()
                .position(|spec| spec.full_name() == full_name)
                .ok_or_else(|| BrokerError::ServiceSchema {
                    message: format!("unknown local service '{full_name}'"),
                })?;
            services.remove(index)
        };

        {
            let mut actions = self.actions.borrow_mut();
            for action in spec.actions() {
                let name = format!("{full_name}.{}", action.name());
                let emptied = match actions.get_mut(&name) {
                    Some(list) => list.remove_node(self.local.id()),
                    None => false,
                };
                if emptied {
                    actions.remove(&name);
                }
            }
        }
        self.events
            .borrow_mut()
            .retain_mut(|entry| !entry.remove_service(self.local.id(), full_name));

        self.refresh_local_manifest();
        Ok(spec)
    }

    fn refresh_local_manifest(&self) {
        let manifest: Vec<ServiceInfo> = self
            .local_services
            .borrow()
            .iter()
            .map(|spec| spec.manifest())
            .collect();
        self.local.set_services(manifest);
        self.local.bump_seq();
    }

    // ---- remote membership ---------------------------------------------

    /// Apply an INFO packet, rebuilding the sender's endpoints on success.
    pub(crate) fn apply_info(&self, info: &PacketInfo) -> InfoOutcome {
        if info.sender == *self.local.id() {
            return InfoOutcome::Stale;
        }

        let (node, existed) = {
            let mut nodes = self.nodes.borrow_mut();
            match nodes.get(&info.sender) {
                Some(node) => (Rc::clone(node), true),
                None => {
                    let node = Rc::new(Node::new_remote(info.sender.clone()));
                    nodes.insert(info.sender.clone(), Rc::clone(&node));
                    (node, false)
                }
            }
        };

        let was_available = node.is_available();
        if !node.apply_info(info) {
            debug!(node = %info.sender, seq = info.seq, "ignoring stale INFO");
            return InfoOutcome::Stale;
        }

        // Replace the node's endpoint set atomically.
        self.remove_node_endpoints(&info.sender);
        self.install_remote_endpoints(&node, &info.services);

        if !existed {
            InfoOutcome::New
        } else if !was_available {
            InfoOutcome::Reconnected
        } else {
            InfoOutcome::Updated
        }
    }

    pub(crate) fn heartbeat(&self, beat: &PacketHeartbeat) -> HeartbeatOutcome {
        let nodes = self.nodes.borrow();
        match nodes.get(&beat.sender) {
            // A beat announcing a newer seq than the manifest we hold means
            // we missed an INFO; keep the node alive but ask again.
            Some(node) if node.is_available() && beat.seq > node.seq() => {
                node.beat(beat.cpu);
                HeartbeatOutcome::Unknown
            }
            Some(node) if node.is_available() => {
                node.beat(beat.cpu);
                HeartbeatOutcome::Applied
            }
            _ => HeartbeatOutcome::Unknown,
        }
    }

    /// Mark a node unavailable and drop its endpoints.
    ///
    /// The node entry itself stays so a later INFO is recognized as a
    /// reconnect. Reports whether the node was available before.
    pub(crate) fn disconnect(&self, node_id: &NodeId) -> bool {
        if node_id == self.local.id() {
            return false;
        }
        let node = self.nodes.borrow().get(node_id).cloned();
        match node {
            Some(node) => {
                let was_available = node.is_available();
                node.set_available(false);
                self.remove_node_endpoints(node_id);
                was_available
            }
            None => false,
        }
    }

    /// Expire nodes whose heartbeat is older than `timeout`.
    pub(crate) fn sweep(&self, timeout: Duration) -> Vec<NodeId> {
        let expired: Vec<NodeId> = self
            .nodes
            .borrow()
            .values()
            .filter(|node| {
                !node.is_local()
                    && node.is_available()
                    && node.last_heartbeat().elapsed() > timeout
            })
            .map(|node| node.id().clone())
            .collect();
        for node_id in &expired {
            self.disconnect(node_id);
        }
        expired
    }

    fn install_remote_endpoints(&self, node: &Rc<Node>, services: &[ServiceInfo]) {
        let mut actions = self.actions.borrow_mut();
        let mut events = self.events.borrow_mut();
        for service in services {
            for action in &service.actions {
                let list = actions
                    .entry(action.name.clone())
                    .or_insert_with(|| EndpointList::new(action.name.clone(), &self.strategy_kind));
                list.upsert(ActionEndpoint::remote(
                    Rc::clone(node),
                    action,
                    self.breaker_cfg.clone(),
                ));
            }
            for event in &service.events {
                let index = match events
                    .iter()
                    .position(|entry| entry.pattern() == event.name && entry.group() == event.group)
                {
                    Some(index) => index,
                    None => {
                        events.push(EventEntry::new(
                            event.name.clone(),
                            event.group.clone(),
                            &self.strategy_kind,
                        ));
                        events.len() - 1
                    }
                };
                events[index].upsert(EventEndpoint::remote(
                    Rc::clone(node),
                    service.name.clone(),
                    event,
                ));
            }
        }
    }

    fn remove_node_endpoints(&self, node: &NodeId) {
        self.actions
            .borrow_mut()
            .retain(|_, list| !list.remove_node(node));
        self.events
            .borrow_mut()
            .retain_mut(|entry| !entry.remove_node(node));
    }

    // ---- resolution ----------------------------------------------------

    /// Pick the endpoint for an action call.
    ///
    /// A `target` pins the call to that node (no strategy, no breaker
    /// filter). Otherwise the list's strategy chooses among selectable
    /// endpoints; live-but-all-open resolves to `CircuitBreakerOpen` so the
    /// caller fails fast instead of hammering open endpoints.
    pub(crate) fn resolve_action(
        &self,
        action: &str,
        target: Option<&NodeId>,
        params: &Value,
        meta: &Value,
    ) -> Result<Rc<ActionEndpoint>, BrokerError> {
        let actions = self.actions.borrow();
        let list = actions
            .get(action)
            .ok_or_else(|| BrokerError::ServiceNotFound {
                action: action.to_string(),
            })?;
        match target {
            Some(node_id) => {
                let endpoint =
                    list.find(node_id)
                        .ok_or_else(|| BrokerError::ServiceNotFound {
                            action: action.to_string(),
                        })?;
                if !endpoint.node().is_available() {
                    return Err(BrokerError::NodeUnavailable {
                        node: node_id.clone(),
                    });
                }
                Ok(Rc::clone(endpoint))
            }
            None => match list.select(params, meta) {
                Selection::One(endpoint) => Ok(endpoint),
                Selection::AllOpen(node) => Err(BrokerError::CircuitBreakerOpen {
                    action: action.to_string(),
                    node,
                }),
                Selection::None => Err(BrokerError::ServiceNotFound {
                    action: action.to_string(),
                }),
            },
        }
    }

    /// One endpoint per distinct group, strategy-chosen within the first
    /// entry that matches the event and group.
    pub(crate) fn resolve_event_balanced(
        &self,
        event: &str,
        groups: Option<&[String]>,
        payload: &Value,
    ) -> Vec<Rc<EventEndpoint>> {
        self.balanced_endpoints(event, groups, payload, false)
    }

    /// Balanced selection restricted to local handlers, used when a
    /// balanced EVENT packet arrives with its target groups.
    pub(crate) fn local_event_balanced(
        &self,
        event: &str,
        groups: Option<&[String]>,
        payload: &Value,
    ) -> Vec<Rc<EventEndpoint>> {
        self.balanced_endpoints(event, groups, payload, true)
    }

    fn balanced_endpoints(
        &self,
        event: &str,
        groups: Option<&[String]>,
        payload: &Value,
        local_only: bool,
    ) -> Vec<Rc<EventEndpoint>> {
        let entries = self.events.borrow();
        let mut chosen: Vec<Rc<EventEndpoint>> = Vec::new();
        let mut served_groups: Vec<String> = Vec::new();
        for entry in entries.iter() {
            if !entry.matches(event) {
                continue;
            }
            if let Some(filter) = groups {
                if !filter.iter().any(|group| group == entry.group()) {
                    continue;
                }
            }
            if served_groups.iter().any(|group| group == entry.group()) {
                continue;
            }
            if let Some(endpoint) = entry.select(local_only, payload) {
                served_groups.push(entry.group().to_string());
                chosen.push(endpoint);
            }
        }
        chosen
    }

    /// Every live endpoint subscribed to the event, across all groups.
    pub(crate) fn resolve_event_broadcast(&self, event: &str) -> Vec<Rc<EventEndpoint>> {
        self.events
            .borrow()
            .iter()
            .filter(|entry| entry.matches(event))
            .flat_map(|entry| {
                entry
                    .endpoints()
                    .iter()
                    .filter(|endpoint| endpoint.is_selectable())
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Local handlers subscribed to the event, across all groups.
    pub(crate) fn local_event_broadcast(&self, event: &str) -> Vec<Rc<EventEndpoint>> {
        self.resolve_event_broadcast(event)
            .into_iter()
            .filter(|endpoint| endpoint.is_local())
            .collect()
    }

    /// Strategy feedback after a finished call (latency EWMA).
    pub(crate) fn on_call_finished(&self, action: &str, node: &NodeId, elapsed: Duration) {
        if let Some(list) = self.actions.borrow().get(action) {
            list.on_call_finished(node, elapsed);
        }
    }

    // ---- introspection -------------------------------------------------

    pub(crate) fn nodes_snapshot(&self) -> Value {
        let mut rows: Vec<(String, Value)> = self
            .nodes
            .borrow()
            .values()
            .map(|node| {
                let services: Vec<String> = node
                    .services()
                    .iter()
                    .map(|service| service.name.clone())
                    .collect();
                (
                    node.id().to_string(),
                    serde_json::json!({
                        "id": node.id().as_str(),
                        "local": node.is_local(),
                        "available": node.is_available(),
                        "seq": node.seq(),
                        "instanceId": node.instance_id(),
                        "cpu": node.cpu(),
                        "offsetMs": node.offset_ms(),
                        "client": node.client(),
                        "services": services,
                    }),
                )
            })
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        Value::Array(rows.into_iter().map(|(_, row)| row).collect())
    }

    pub(crate) fn services_snapshot(&self) -> Value {
        let mut by_name: BTreeMap<String, (Option<String>, Vec<String>)> = BTreeMap::new();
        for node in self.nodes.borrow().values() {
            if !node.is_available() {
                continue;
            }
            for service in node.services() {
                let entry = by_name
                    .entry(service.name.clone())
                    .or_insert_with(|| (service.version.clone(), Vec::new()));
                entry.1.push(node.id().to_string());
            }
        }
        Value::Array(
            by_name
                .into_iter()
                .map(|(name, (version, mut nodes))| {
                    nodes.sort();
                    serde_json::json!({ "name": name, "version": version, "nodes": nodes })
                })
                .collect(),
        )
    }

    pub(crate) fn actions_snapshot(&self) -> Value {
        let mut rows: Vec<(String, Value)> = self
            .actions
            .borrow()
            .values()
            .map(|list| {
                let mut nodes: Vec<String> = list
                    .endpoints()
                    .iter()
                    .filter(|endpoint| endpoint.node().is_available())
                    .map(|endpoint| endpoint.node_id().to_string())
                    .collect();
                nodes.sort();
                let has_local = list.endpoints().iter().any(|endpoint| endpoint.is_local());
                (
                    list.name().to_string(),
                    serde_json::json!({
                        "name": list.name(),
                        "nodes": nodes,
                        "hasLocal": has_local,
                    }),
                )
            })
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        Value::Array(rows.into_iter().map(|(_, row)| row).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{ActionSpec, EventSpec};
    use crate::transit::packet::{ActionInfo, ClientInfo, EventInfo};

    fn registry() -> Registry {
        Registry::new(
            NodeId::new("local"),
            "instance-local".to_string(),
            StrategyKind::RoundRobin,
            CircuitBreakerConfig::default(),
        )
    }

    fn info(sender: &str, seq: u64, actions: &[&str]) -> PacketInfo {
        PacketInfo {
            sender: NodeId::new(sender),
            seq,
            instance_id: format!("instance-{sender}"),
            services: vec![ServiceInfo {
                name: "math".to_string(),
                version: None,
                settings: serde_json::json!({}),
                actions: actions
                    .iter()
                    .map(|name| ActionInfo {
                        name: name.to_string(),
                        timeout_ms: None,
                    })
                    .collect(),
                events: vec![EventInfo {
                    name: "user.*".to_string(),
                    group: "math".to_string(),
                }],
            }],
            client: ClientInfo::default(),
        }
    }

    fn no_params() -> Value {
        serde_json::json!({})
    }

    #[tokio::test]
    async fn test_info_creates_endpoints_and_stale_info_is_ignored() {
        let registry = registry();
        assert_eq!(registry.apply_info(&info("a", 3, &["math.add"])), InfoOutcome::New);

        let endpoint = registry
            .resolve_action("math.add", None, &no_params(), &no_params())
            .expect("endpoint resolves");
        assert_eq!(endpoint.node_id(), &NodeId::new("a"));

        // Same seq again: dropped, state unchanged.
        assert_eq!(registry.apply_info(&info("a", 3, &["math.sub"])), InfoOutcome::Stale);
        assert!(registry
            .resolve_action("math.add", None, &no_params(), &no_params())
            .is_ok());

        // Newer seq replaces the endpoint set.
        assert_eq!(
            registry.apply_info(&info("a", 4, &["math.sub"])),
            InfoOutcome::Updated
        );
        assert!(matches!(
            registry.resolve_action("math.add", None, &no_params(), &no_params()),
            Err(BrokerError::ServiceNotFound { .. })
        ));
        assert!(registry
            .resolve_action("math.sub", None, &no_params(), &no_params())
            .is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_removes_every_endpoint() {
        let registry = registry();
        registry.apply_info(&info("a", 1, &["math.add"]));
        registry.apply_info(&info("b", 1, &["math.add"]));

        assert!(registry.disconnect(&NodeId::new("a")));
        for _ in 0..4 {
            let endpoint = registry
                .resolve_action("math.add", None, &no_params(), &no_params())
                .expect("b still serves");
            assert_eq!(endpoint.node_id(), &NodeId::new("b"));
        }
        assert!(registry.resolve_event_broadcast("user.created")
            .iter()
            .all(|endpoint| endpoint.node_id() != &NodeId::new("a")));

        // Second disconnect is a no-op.
        assert!(!registry.disconnect(&NodeId::new("a")));
    }

    #[tokio::test]
    async fn test_reconnect_after_disconnect() {
        let registry = registry();
        registry.apply_info(&info("a", 1, &["math.add"]));
        registry.disconnect(&NodeId::new("a"));

        assert_eq!(
            registry.apply_info(&info("a", 2, &["math.add"])),
            InfoOutcome::Reconnected
        );
        assert!(registry
            .resolve_action("math.add", None, &no_params(), &no_params())
            .is_ok());
    }

    #[tokio::test]
    async fn test_directed_resolution_pins_the_node() {
        let registry = registry();
        registry.apply_info(&info("a", 1, &["math.add"]));
        registry.apply_info(&info("b", 1, &["math.add"]));

        for _ in 0..3 {
            let endpoint = registry
                .resolve_action("math.add", Some(&NodeId::new("b")), &no_params(), &no_params())
                .expect("directed call resolves");
            assert_eq!(endpoint.node_id(), &NodeId::new("b"));
        }

        registry.disconnect(&NodeId::new("b"));
        assert!(matches!(
            registry.resolve_action("math.add", Some(&NodeId::new("b")), &no_params(), &no_params()),
            Err(BrokerError::ServiceNotFound { .. }) | Err(BrokerError::NodeUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_all_open_breakers_fail_fast() {
        let registry = Registry::new(
            NodeId::new("local"),
            "instance-local".to_string(),
            StrategyKind::RoundRobin,
            CircuitBreakerConfig::enabled().with_threshold(1),
        );
        registry.apply_info(&info("a", 1, &["math.add"]));

        let endpoint = registry
            .resolve_action("math.add", None, &no_params(), &no_params())
            .expect("closed breaker admits");
        endpoint.breaker().on_failure();

        assert!(matches!(
            registry.resolve_action("math.add", None, &no_params(), &no_params()),
            Err(BrokerError::CircuitBreakerOpen { .. })
        ));
    }

    #[tokio::test]
    async fn test_local_service_registration_and_duplicate() {
        let registry = registry();
        let seq_before = registry.local_node().seq();
        registry
            .add_local_service(
                ServiceSpec::builder("math")
                    .action(ActionSpec::new("add", |_ctx| async {
                        Ok(serde_json::Value::Null)
                    }))
                    .build(),
            )
            .expect("registers");

        assert_eq!(registry.local_node().seq(), seq_before + 1);
        let endpoint = registry
            .resolve_action("math.add", None, &no_params(), &no_params())
            .expect("local endpoint resolves");
        assert!(endpoint.is_local());

        let duplicate = registry.add_local_service(
            ServiceSpec::builder("math")
                .action(ActionSpec::new("add", |_ctx| async {
                    Ok(serde_json::Value::Null)
                }))
                .build(),
        );
        assert!(matches!(duplicate, Err(BrokerError::ServiceSchema { .. })));
    }

    #[tokio::test]
    async fn test_remove_local_service_drops_endpoints() {
        let registry = registry();
        registry
            .add_local_service(
                ServiceSpec::builder("math")
                    .action(ActionSpec::new("add", |_ctx| async {
                        Ok(serde_json::Value::Null)
                    }))
                    .event(EventSpec::new("user.created", |_ctx| async { Ok(()) }))
                    .build(),
            )
            .expect("registers");

        registry.remove_local_service("math").expect("removes");
        assert!(matches!(
            registry.resolve_action("math.add", None, &no_params(), &no_params()),
            Err(BrokerError::ServiceNotFound { .. })
        ));
        assert!(registry.local_event_broadcast("user.created").is_empty());
        assert!(matches!(
            registry.remove_local_service("math"),
            Err(BrokerError::ServiceSchema { .. })
        ));
    }

    #[tokio::test]
    async fn test_balanced_picks_one_per_group_broadcast_picks_all() {
        let registry = registry();
        // Two nodes in group "math", one in group "audit".
        registry.apply_info(&info("a", 1, &["math.add"]));
        registry.apply_info(&info("b", 1, &["math.add"]));
        let mut audit = info("c", 1, &[]);
        audit.services[0].name = "audit".to_string();
        audit.services[0].events[0].group = "audit".to_string();
        registry.apply_info(&audit);

        let balanced = registry.resolve_event_balanced("user.created", None, &no_params());
        let mut groups: Vec<&str> = balanced.iter().map(|e| e.group()).collect();
        groups.sort_unstable();
        assert_eq!(groups, vec!["audit", "math"]);

        let broadcast = registry.resolve_event_broadcast("user.created");
        assert_eq!(broadcast.len(), 3);

        let filtered =
            registry.resolve_event_balanced("user.created", Some(&["audit".to_string()]), &no_params());
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].group(), "audit");
    }

    #[tokio::test]
    async fn test_wildcard_subscriptions_match_resolution() {
        let registry = registry();
        registry.apply_info(&info("a", 1, &[]));

        assert_eq!(registry.resolve_event_broadcast("user.created").len(), 1);
        assert!(registry.resolve_event_broadcast("user.profile.updated").is_empty());
        assert!(registry.resolve_event_broadcast("payment.done").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_expires_silent_nodes() {
        let registry = registry();
        registry.apply_info(&info("a", 1, &["math.add"]));
        registry.apply_info(&info("b", 1, &["math.add"]));

        tokio::time::advance(Duration::from_secs(10)).await;
        let beat = PacketHeartbeat {
            sender: NodeId::new("b"),
            seq: 1,
            cpu: Some(0.1),
        };
        assert_eq!(registry.heartbeat(&beat), HeartbeatOutcome::Applied);

        tokio::time::advance(Duration::from_secs(6)).await;
        let expired = registry.sweep(Duration::from_secs(15));
        assert_eq!(expired, vec![NodeId::new("a")]);

        let endpoint = registry
            .resolve_action("math.add", None, &no_params(), &no_params())
            .expect("b survives the sweep");
        assert_eq!(endpoint.node_id(), &NodeId::new("b"));
    }

    #[tokio::test]
    async fn test_heartbeat_from_unknown_node() {
        let registry = registry();
        let beat = PacketHeartbeat {
            sender: NodeId::new("ghost"),
            seq: 1,
            cpu: None,
        };
        assert_eq!(registry.heartbeat(&beat), HeartbeatOutcome::Unknown);
    }

    #[tokio::test]
    async fn test_heartbeat_with_newer_seq_requests_info() {
        let registry = registry();
        registry.apply_info(&info("a", 1, &["math.add"]));

        let beat = PacketHeartbeat {
            sender: NodeId::new("a"),
            seq: 3,
            cpu: None,
        };
        assert_eq!(registry.heartbeat(&beat), HeartbeatOutcome::Unknown);
        // The node stays alive while the fresh INFO is on its way.
        assert!(registry.node(&NodeId::new("a")).expect("known").is_available());
    }

    #[tokio::test]
    async fn test_snapshots_reflect_membership() {
        let registry = registry();
        registry.apply_info(&info("a", 1, &["math.add"]));
        registry
            .add_local_service(
                ServiceSpec::builder("gate")
                    .action(ActionSpec::new("open", |_ctx| async {
                        Ok(serde_json::Value::Null)
                    }))
                    .build(),
            )
            .expect("registers");

        let nodes = registry.nodes_snapshot();
        let listed: Vec<&str> = nodes
            .as_array()
            .expect("array")
            .iter()
            .map(|row| row["id"].as_str().expect("id"))
            .collect();
        assert_eq!(listed, vec!["a", "local"]);

        let actions = registry.actions_snapshot();
        let names: Vec<&str> = actions
            .as_array()
            .expect("array")
            .iter()
            .map(|row| row["name"].as_str().expect("name"))
            .collect();
        assert_eq!(names, vec!["gate.open", "math.add"]);
    }
}
