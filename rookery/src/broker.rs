//! The broker: node lifecycle, packet dispatch and the public call surface.
//!
//! ```text
//!                        ┌────────────────────────────┐
//!   call / emit ────────▶│           Broker           │◀──────── create_service
//!                        │  registry  transit  bus    │
//!                        └──┬───────────┬──────────┬──┘
//!                 receive loop   heartbeat loop   sweep loop
//!                        │           │              │
//!                 handle_packet   HEARTBEAT     expire silent
//!                 (9 kinds)       broadcast     peers
//! ```
//!
//! `start` connects the transport, announces this node (DISCOVER, then
//! INFO) and spawns three loops on the current-thread runtime: one draining
//! inbound packets, one broadcasting heartbeats, one expiring peers whose
//! heartbeat went silent. Each loop holds only a [`Weak`] broker reference
//! and exits when the broker is gone; `stop` aborts them, says goodbye with
//! DISCONNECT and rejects every call still in flight.
//!
//! A broker built without a transport is a single-node mesh: local calls,
//! events and the `$node` introspection service all work, nothing goes on
//! a wire.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::bus::{BrokerEvent, NotificationBus};
use crate::cacher::Cacher;
use crate::config::{BrokerOptions, BulkheadConfig};
use crate::context::{new_call_id, CallOptions, Context};
use crate::error::{BrokerError, WireError};
use crate::pipeline::bulkhead::Bulkhead;
use crate::pipeline::{local_execute, run_call};
use crate::registry::{HeartbeatOutcome, InfoOutcome, NodeId, Registry};
use crate::serializer::{JsonSerializer, Serializer};
use crate::service::{ActionSpec, ServiceSpec};
use crate::transit::packet::{
    ClientInfo, Packet, PacketDisconnect, PacketDiscover, PacketEvent, PacketHeartbeat, PacketInfo,
    PacketPing, PacketPong, PacketRequest, PacketResponse,
};
use crate::transit::pending::CallReply;
use crate::transit::Transit;
use crate::transport::Transport;

/// Lifecycle state of a [`Broker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    /// Built, not yet started. Local calls are allowed.
    Created,
    Running,
    Stopping,
    Stopped,
}

/// Result of a [`Broker::ping`].
#[derive(Debug, Clone)]
pub struct PongInfo {
    pub node: NodeId,
    /// Round-trip time measured on our clock.
    pub rtt: Duration,
    /// Estimated clock offset of the peer in milliseconds, positive when
    /// the peer's clock is ahead of ours.
    pub offset_ms: i64,
}

/// Builder for a [`Broker`].
///
/// Everything is optional: the default is a transportless single-node
/// broker with the default [`BrokerOptions`].
pub struct BrokerBuilder {
    options: BrokerOptions,
    transport: Option<Rc<dyn Transport>>,
    serializer: Option<Rc<dyn Serializer>>,
    cacher: Option<Rc<dyn Cacher>>,
    cpu_source: Option<Rc<dyn Fn() -> f32>>,
    services: Vec<ServiceSpec>,
}

impl BrokerBuilder {
    fn new() -> Self {
        Self {
            options: BrokerOptions::default(),
            transport: None,
            serializer: None,
            cacher: None,
            cpu_source: None,
            services: Vec::new(),
        }
    }

    pub fn options(mut self, options: BrokerOptions) -> Self {
        self.options = options;
        self
    }

    /// Attach a transport; without one the broker never touches a wire.
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Rc::new(transport));
        self
    }

    /// Override the wire format. Defaults to [`JsonSerializer`].
    pub fn serializer(mut self, serializer: impl Serializer + 'static) -> Self {
        self.serializer = Some(Rc::new(serializer));
        self
    }

    /// Attach a cache backend for actions declaring a cache policy.
    pub fn cacher(mut self, cacher: impl Cacher + 'static) -> Self {
        self.cacher = Some(Rc::new(cacher));
        self
    }

    /// Source for the cpu load sample carried in HEARTBEAT, `0.0..=1.0`.
    pub fn cpu_source<F>(mut self, source: F) -> Self
    where
        F: Fn() -> f32 + 'static,
    {
        self.cpu_source = Some(Rc::new(source));
        self
    }

    /// Register a service before the broker starts.
    pub fn service(mut self, spec: ServiceSpec) -> Self {
        self.services.push(spec);
        self
    }

    /// Build the broker and register the queued services.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ServiceSchema`] when a queued service is
    /// invalid or collides with an already registered one.
    pub fn build(self) -> Result<Rc<Broker>, BrokerError> {
        let node_id = NodeId::new(
            self.options
                .node_id
                .clone()
                .unwrap_or_else(|| format!("node-{:08x}", rand::random::<u32>())),
        );
        let instance_id = new_call_id();
        let registry = Registry::new(
            node_id.clone(),
            instance_id.clone(),
            self.options.strategy.clone(),
            self.options.circuit_breaker.clone(),
        );
        let transit = self.transport.map(|transport| {
            let serializer = self
                .serializer
                .unwrap_or_else(|| Rc::new(JsonSerializer));
            Rc::new(Transit::new(
                node_id.clone(),
                &self.options.namespace,
                transport,
                serializer,
            ))
        });

        let broker = Rc::new(Broker {
            node_id,
            instance_id,
            options: self.options,
            registry,
            transit,
            cacher: self.cacher,
            bus: NotificationBus::new(),
            bulkheads: RefCell::new(HashMap::new()),
            cpu_source: self.cpu_source,
            state: Cell::new(BrokerState::Created),
            tasks: RefCell::new(Vec::new()),
            pings: RefCell::new(HashMap::new()),
        });

        if broker.options.internal_services {
            broker.add_service(node_info_service(Rc::downgrade(&broker)))?;
        }
        for spec in self.services {
            broker.add_service(spec)?;
        }
        Ok(broker)
    }
}

/// A service broker node.
///
/// One broker is one node in the mesh: it owns the local services, the
/// soft-state view of every peer and the transport connection. All calls
/// and events go through it; there is no global instance, tests routinely
/// run several brokers in one process.
pub struct Broker {
    node_id: NodeId,
    instance_id: String,
    options: BrokerOptions,
    registry: Registry,
    transit: Option<Rc<Transit>>,
    cacher: Option<Rc<dyn Cacher>>,
    bus: NotificationBus,
    // One bulkhead per local action, created on first use.
    bulkheads: RefCell<HashMap<String, Rc<Bulkhead>>>,
    cpu_source: Option<Rc<dyn Fn() -> f32>>,
    state: Cell<BrokerState>,
    tasks: RefCell<Vec<JoinHandle<()>>>,
    // Outstanding ping probes by packet id.
    pings: RefCell<HashMap<String, oneshot::Sender<PongInfo>>>,
}

impl Broker {
    pub fn builder() -> BrokerBuilder {
        BrokerBuilder::new()
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Identifier regenerated on every construction, announced in INFO so
    /// peers can tell a restarted node from a reordered packet.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn state(&self) -> BrokerState {
        self.state.get()
    }

    pub fn options(&self) -> &BrokerOptions {
        &self.options
    }

    /// Lifecycle and health notifications.
    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn transit(&self) -> Option<&Transit> {
        self.transit.as_deref()
    }

    pub(crate) fn cacher(&self) -> Option<&Rc<dyn Cacher>> {
        self.cacher.as_ref()
    }

    /// Bulkhead for a local action, `None` when disabled for it.
    ///
    /// The first resolution fixes the limits; later override changes for
    /// the same action name are ignored.
    pub(crate) fn bulkhead_for(
        &self,
        action: &str,
        override_cfg: Option<&BulkheadConfig>,
    ) -> Option<Rc<Bulkhead>> {
        let cfg = override_cfg.unwrap_or(&self.options.bulkhead);
        if !cfg.enabled {
            return None;
        }
        let mut bulkheads = self.bulkheads.borrow_mut();
        let bulkhead = bulkheads
            .entry(action.to_string())
            .or_insert_with(|| Rc::new(Bulkhead::new(cfg.clone())));
        Some(Rc::clone(bulkhead))
    }

    // ---- lifecycle -----------------------------------------------------

    /// Connect, announce this node and spawn the broker loops.
    ///
    /// Must run inside a `LocalSet` (or a current-thread runtime driving
    /// one) because the loops are spawned with `spawn_local`.
    pub async fn start(self: &Rc<Self>) -> Result<(), BrokerError> {
        if self.state.get() != BrokerState::Created {
            warn!(node = %self.node_id, state = ?self.state.get(), "start ignored");
            return Ok(());
        }
        info!(node = %self.node_id, namespace = %self.options.namespace, "broker starting");

        if let Some(transit) = &self.transit {
            transit.connect().await?;
            transit
                .broadcast(&Packet::Discover(PacketDiscover {
                    sender: self.node_id.clone(),
                }))
                .await?;
            self.announce_info(None).await?;
            self.spawn_loops();
        }

        self.state.set(BrokerState::Running);
        self.bus.publish(BrokerEvent::Started);
        info!(node = %self.node_id, "broker started");
        Ok(())
    }

    /// Leave the mesh: DISCONNECT broadcast, loops aborted, in-flight
    /// calls rejected, transport closed. Idempotent.
    pub async fn stop(self: &Rc<Self>) -> Result<(), BrokerError> {
        match self.state.get() {
            BrokerState::Stopping | BrokerState::Stopped => return Ok(()),
            BrokerState::Created => {
                self.state.set(BrokerState::Stopped);
                self.bus.publish(BrokerEvent::Stopped);
                return Ok(());
            }
            BrokerState::Running => {}
        }
        self.state.set(BrokerState::Stopping);
        info!(node = %self.node_id, "broker stopping");

        if let Some(transit) = &self.transit {
            let goodbye = Packet::Disconnect(PacketDisconnect {
                sender: self.node_id.clone(),
            });
            if let Err(error) = transit.broadcast(&goodbye).await {
                warn!(%error, "DISCONNECT broadcast failed");
            }
        }
        for task in self.tasks.borrow_mut().drain(..) {
            task.abort();
        }
        self.pings.borrow_mut().clear();
        if let Some(transit) = &self.transit {
            let rejected = transit.pending().reject_all(|| BrokerError::NodeUnavailable {
                node: self.node_id.clone(),
            });
            if rejected > 0 {
                debug!(rejected, "rejected in-flight calls at shutdown");
            }
            if let Err(error) = transit.disconnect().await {
                warn!(%error, "transport disconnect failed");
            }
        }

        self.state.set(BrokerState::Stopped);
        self.bus.publish(BrokerEvent::Stopped);
        info!(node = %self.node_id, "broker stopped");
        Ok(())
    }

    // ---- services ------------------------------------------------------

    /// Register a service. On a running broker the new manifest is
    /// re-announced to the mesh.
    pub async fn create_service(self: &Rc<Self>, spec: ServiceSpec) -> Result<(), BrokerError> {
        self.add_service(spec)?;
        if self.state.get() == BrokerState::Running {
            self.announce_info(None).await?;
        }
        Ok(())
    }

    /// Unregister a service by full name (`v2.users`). On a running broker
    /// the shrunk manifest is re-announced.
    pub async fn destroy_service(self: &Rc<Self>, full_name: &str) -> Result<(), BrokerError> {
        let spec = self.registry.remove_local_service(full_name)?;
        info!(service = %spec.full_name(), "service removed");
        self.bus.publish(BrokerEvent::ServiceRemoved {
            service: spec.full_name(),
        });
        if self.state.get() == BrokerState::Running {
            self.announce_info(None).await?;
        }
        Ok(())
    }

    fn add_service(&self, spec: ServiceSpec) -> Result<(), BrokerError> {
        let spec = self.registry.add_local_service(spec)?;
        info!(service = %spec.full_name(), "service registered");
        self.bus.publish(BrokerEvent::ServiceAdded {
            service: spec.full_name(),
        });
        Ok(())
    }

    // ---- calls ---------------------------------------------------------

    /// Call an action with default options.
    pub async fn call(
        self: &Rc<Self>,
        action: &str,
        params: Value,
    ) -> Result<Value, BrokerError> {
        self.call_from(None, action, params, CallOptions::default())
            .await
    }

    /// Call an action with per-call options.
    pub async fn call_with(
        self: &Rc<Self>,
        action: &str,
        params: Value,
        options: CallOptions,
    ) -> Result<Value, BrokerError> {
        self.call_from(None, action, params, options).await
    }

    /// Call an action and deserialize the result.
    pub async fn call_typed<T>(self: &Rc<Self>, action: &str, params: Value) -> Result<T, BrokerError>
    where
        T: DeserializeOwned,
    {
        let value = self.call(action, params).await?;
        serde_json::from_value(value)
            .map_err(|error| crate::serializer::SerializerError::Decode(Box::new(error)).into())
    }

    pub(crate) async fn call_from(
        self: &Rc<Self>,
        parent: Option<&Context>,
        action: &str,
        params: Value,
        options: CallOptions,
    ) -> Result<Value, BrokerError> {
        if matches!(self.state.get(), BrokerState::Stopping | BrokerState::Stopped) {
            return Err(BrokerError::NodeUnavailable {
                node: self.node_id.clone(),
            });
        }
        let ctx = match parent {
            Some(parent) => parent.child(),
            None => Context::new_root(self, serde_json::json!({})),
        }
        .with_action(action, params);
        run_call(self, action, ctx, options).await
    }

    // ---- events --------------------------------------------------------

    /// Emit a balanced event: one handler per listening group.
    pub async fn emit(self: &Rc<Self>, event: &str, payload: Value) -> Result<(), BrokerError> {
        self.emit_from(None, event, payload, None).await
    }

    /// Emit a balanced event restricted to the given groups.
    pub async fn emit_with(
        self: &Rc<Self>,
        event: &str,
        payload: Value,
        groups: &[&str],
    ) -> Result<(), BrokerError> {
        let groups: Vec<String> = groups.iter().map(|group| group.to_string()).collect();
        self.emit_from(None, event, payload, Some(&groups)).await
    }

    /// Broadcast an event to every live listener in every group.
    pub async fn broadcast(
        self: &Rc<Self>,
        event: &str,
        payload: Value,
    ) -> Result<(), BrokerError> {
        self.broadcast_from(None, event, payload).await
    }

    pub(crate) async fn emit_from(
        self: &Rc<Self>,
        parent: Option<&Context>,
        event: &str,
        payload: Value,
        groups: Option<&[String]>,
    ) -> Result<(), BrokerError> {
        let ctx = self.event_context(parent, event, payload.clone());
        let endpoints = self.registry.resolve_event_balanced(event, groups, &payload);
        debug!(event, listeners = endpoints.len(), "emitting event");

        // Collect the target groups per remote node, one packet per node.
        let mut remote: HashMap<NodeId, Vec<String>> = HashMap::new();
        for endpoint in &endpoints {
            if endpoint.is_local() {
                self.invoke_event_endpoint(endpoint, &ctx).await;
            } else {
                remote
                    .entry(endpoint.node_id().clone())
                    .or_default()
                    .push(endpoint.group().to_string());
            }
        }
        if let Some(transit) = &self.transit {
            for (node, node_groups) in remote {
                let packet = Packet::Event(PacketEvent {
                    sender: self.node_id.clone(),
                    id: ctx.id().to_string(),
                    event: event.to_string(),
                    data: payload.clone(),
                    meta: ctx.meta_snapshot(),
                    groups: Some(node_groups),
                    broadcast: false,
                    level: ctx.level(),
                });
                transit.send_to(&node, &packet).await?;
            }
        }
        Ok(())
    }

    pub(crate) async fn broadcast_from(
        self: &Rc<Self>,
        parent: Option<&Context>,
        event: &str,
        payload: Value,
    ) -> Result<(), BrokerError> {
        let ctx = self.event_context(parent, event, payload.clone());
        let endpoints = self.registry.resolve_event_broadcast(event);
        debug!(event, listeners = endpoints.len(), "broadcasting event");

        let mut remote_nodes: Vec<NodeId> = Vec::new();
        for endpoint in &endpoints {
            if endpoint.is_local() {
                self.invoke_event_endpoint(endpoint, &ctx).await;
            } else if !remote_nodes.contains(endpoint.node_id()) {
                remote_nodes.push(endpoint.node_id().clone());
            }
        }
        if let Some(transit) = &self.transit {
            for node in remote_nodes {
                let packet = Packet::Event(PacketEvent {
                    sender: self.node_id.clone(),
                    id: ctx.id().to_string(),
                    event: event.to_string(),
                    data: payload.clone(),
                    meta: ctx.meta_snapshot(),
                    groups: None,
                    broadcast: true,
                    level: ctx.level(),
                });
                transit.send_to(&node, &packet).await?;
            }
        }
        Ok(())
    }

    fn event_context(self: &Rc<Self>, parent: Option<&Context>, event: &str, payload: Value) -> Context {
        match parent {
            Some(parent) => parent.child(),
            None => Context::new_root(self, serde_json::json!({})),
        }
        .with_event(event, payload)
    }

    async fn invoke_event_endpoint(
        &self,
        endpoint: &Rc<crate::registry::EventEndpoint>,
        ctx: &Context,
    ) {
        if let Some(spec) = endpoint.event() {
            if let Err(error) = spec.invoke(ctx.clone()).await {
                warn!(
                    event = ctx.event().unwrap_or_default(),
                    service = endpoint.service(),
                    %error,
                    "event handler failed"
                );
            }
        }
    }

    // ---- ping ----------------------------------------------------------

    /// Probe a peer. Resolves with its round-trip time and clock offset,
    /// or `None` when no PONG arrives within `wait`.
    pub async fn ping(&self, node: impl Into<NodeId>, wait: Duration) -> Option<PongInfo> {
        let node = node.into();
        let transit = self.transit.as_ref()?;
        let id = new_call_id();
        let (sender, receiver) = oneshot::channel();
        self.pings.borrow_mut().insert(id.clone(), sender);

        let packet = Packet::Ping(PacketPing {
            sender: self.node_id.clone(),
            id: id.clone(),
            time: unix_ms(),
        });
        if let Err(error) = transit.send_to(&node, &packet).await {
            debug!(node = %node, %error, "ping send failed");
            self.pings.borrow_mut().remove(&id);
            return None;
        }
        match timeout(wait, receiver).await {
            Ok(Ok(info)) => Some(info),
            _ => {
                self.pings.borrow_mut().remove(&id);
                None
            }
        }
    }

    // ---- packet dispatch -----------------------------------------------

    async fn handle_packet(self: &Rc<Self>, packet: Packet) {
        debug!(kind = packet.kind(), sender = %packet.sender(), "packet received");
        match packet {
            Packet::Discover(packet) => self.handle_discover(packet).await,
            Packet::Info(packet) => self.handle_info(packet),
            Packet::Heartbeat(packet) => self.handle_heartbeat(packet).await,
            Packet::Request(packet) => self.handle_request(packet),
            Packet::Response(packet) => self.handle_response(packet),
            Packet::Event(packet) => self.handle_event(packet),
            Packet::Ping(packet) => self.handle_ping(packet).await,
            Packet::Pong(packet) => self.handle_pong(packet),
            Packet::Disconnect(packet) => self.handle_disconnect(packet),
        }
    }

    async fn handle_discover(&self, packet: PacketDiscover) {
        if let Err(error) = self.announce_info(Some(&packet.sender)).await {
            warn!(node = %packet.sender, %error, "failed to answer DISCOVER");
        }
    }

    fn handle_info(&self, packet: PacketInfo) {
        let node = packet.sender.clone();
        match self.registry.apply_info(&packet) {
            InfoOutcome::New => {
                info!(node = %node, services = packet.services.len(), "node connected");
                self.bus.publish(BrokerEvent::NodeConnected {
                    node,
                    reconnected: false,
                });
            }
            InfoOutcome::Reconnected => {
                info!(node = %node, "node reconnected");
                self.bus.publish(BrokerEvent::NodeConnected {
                    node,
                    reconnected: true,
                });
            }
            InfoOutcome::Updated => {
                debug!(node = %node, "node manifest updated");
                self.bus.publish(BrokerEvent::NodeUpdated { node });
            }
            InfoOutcome::Stale => {}
        }
    }

    async fn handle_heartbeat(&self, packet: PacketHeartbeat) {
        match self.registry.heartbeat(&packet) {
            HeartbeatOutcome::Applied => {}
            HeartbeatOutcome::Unknown => {
                debug!(node = %packet.sender, "heartbeat from unknown node, asking for INFO");
                if let Some(transit) = &self.transit {
                    let discover = Packet::Discover(PacketDiscover {
                        sender: self.node_id.clone(),
                    });
                    if let Err(error) = transit.send_to(&packet.sender, &discover).await {
                        warn!(node = %packet.sender, %error, "targeted DISCOVER failed");
                    }
                }
            }
        }
    }

    /// Serve an incoming REQUEST on its own task so a slow handler never
    /// stalls the receive loop.
    fn handle_request(self: &Rc<Self>, packet: PacketRequest) {
        let broker = Rc::clone(self);
        tokio::task::spawn_local(async move {
            let response = broker.serve_request(&packet).await;
            if let Some(transit) = &broker.transit {
                if let Err(error) = transit.send_to(&packet.sender, &response).await {
                    warn!(id = %packet.id, %error, "failed to send RESPONSE");
                }
            }
        });
    }

    async fn serve_request(self: &Rc<Self>, packet: &PacketRequest) -> Packet {
        // The caller's remaining budget becomes our deadline. An expired
        // budget still runs the handler; only the caller enforces it.
        let deadline = packet
            .timeout_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        let ctx = Context::for_incoming(
            self,
            packet.id.clone(),
            packet.request_id.clone(),
            Value::Null,
            packet.meta.clone(),
            packet.level,
            packet.parent_id.clone(),
            packet.caller.clone(),
            deadline,
            packet.sender.clone(),
        )
        .with_action(&packet.action, packet.params.clone());

        let resolved = self.registry.resolve_action(
            &packet.action,
            Some(&self.node_id),
            ctx.params(),
            &packet.meta,
        );
        let execution = match resolved {
            Ok(endpoint) => match endpoint.action() {
                Some(spec) => local_execute(self, &packet.action, Rc::clone(spec), &ctx)
                    .await
                    .map(|(value, _)| value),
                None => Err(BrokerError::ServiceNotFound {
                    action: packet.action.clone(),
                }),
            },
            Err(error) => Err(error),
        };

        match execution {
            Ok(data) => Packet::Response(PacketResponse {
                sender: self.node_id.clone(),
                id: packet.id.clone(),
                success: true,
                data: Some(data),
                error: None,
                meta: ctx.meta_snapshot(),
            }),
            Err(error) => {
                debug!(id = %packet.id, action = %packet.action, %error, "request failed");
                Packet::Response(PacketResponse {
                    sender: self.node_id.clone(),
                    id: packet.id.clone(),
                    success: false,
                    data: None,
                    error: Some(WireError::capture(&error, &self.node_id)),
                    meta: ctx.meta_snapshot(),
                })
            }
        }
    }

    fn handle_response(&self, packet: PacketResponse) {
        let transit = match &self.transit {
            Some(transit) => transit,
            None => return,
        };
        let result = if packet.success {
            Ok(CallReply {
                data: packet.data.unwrap_or(Value::Null),
                meta: packet.meta,
            })
        } else {
            Err(match packet.error {
                Some(wire) => wire.rehydrate(&packet.sender),
                None => BrokerError::Remote {
                    kind: "Unknown".to_string(),
                    message: "response carried no error detail".to_string(),
                    node: packet.sender.clone(),
                    retryable: false,
                },
            })
        };
        if !transit.pending().complete(&packet.id, result) {
            // Typical for a response that outlived its caller's deadline.
            debug!(id = %packet.id, node = %packet.sender, "dropping RESPONSE for unknown call");
        }
    }

    fn handle_event(self: &Rc<Self>, packet: PacketEvent) {
        let broker = Rc::clone(self);
        tokio::task::spawn_local(async move {
            broker.deliver_event(packet).await;
        });
    }

    async fn deliver_event(self: &Rc<Self>, packet: PacketEvent) {
        let endpoints = if packet.broadcast {
            self.registry.local_event_broadcast(&packet.event)
        } else {
            self.registry
                .local_event_balanced(&packet.event, packet.groups.as_deref(), &packet.data)
        };
        if endpoints.is_empty() {
            return;
        }
        let ctx = Context::for_incoming(
            self,
            packet.id.clone(),
            packet.id.clone(),
            Value::Null,
            packet.meta,
            packet.level,
            None,
            None,
            None,
            packet.sender.clone(),
        )
        .with_event(&packet.event, packet.data);
        for endpoint in endpoints {
            self.invoke_event_endpoint(&endpoint, &ctx).await;
        }
    }

    async fn handle_ping(&self, packet: PacketPing) {
        let transit = match &self.transit {
            Some(transit) => transit,
            None => return,
        };
        let pong = Packet::Pong(PacketPong {
            sender: self.node_id.clone(),
            id: packet.id.clone(),
            time: packet.time,
            arrived: unix_ms(),
        });
        if let Err(error) = transit.send_to(&packet.sender, &pong).await {
            warn!(node = %packet.sender, %error, "failed to answer PING");
        }
    }

    fn handle_pong(&self, packet: PacketPong) {
        let now = unix_ms();
        let elapsed = now.saturating_sub(packet.time);
        // Half the round trip approximates the one-way latency, so the
        // peer's clock read `arrived` when ours read `time + elapsed/2`.
        let offset_ms = packet.arrived as i64 - packet.time as i64 - (elapsed as i64) / 2;
        if let Some(node) = self.registry.node(&packet.sender) {
            node.set_offset_ms(offset_ms);
        }
        debug!(node = %packet.sender, rtt_ms = elapsed, offset_ms, "pong received");
        self.bus.publish(BrokerEvent::PongReceived {
            node: packet.sender.clone(),
            rtt: Duration::from_millis(elapsed),
            offset_ms,
        });
        if let Some(waiter) = self.pings.borrow_mut().remove(&packet.id) {
            let _ = waiter.send(PongInfo {
                node: packet.sender,
                rtt: Duration::from_millis(elapsed),
                offset_ms,
            });
        }
    }

    fn handle_disconnect(&self, packet: PacketDisconnect) {
        if !self.registry.disconnect(&packet.sender) {
            return;
        }
        info!(node = %packet.sender, "node said goodbye");
        self.handle_node_loss(&packet.sender, false);
    }

    fn handle_node_loss(&self, node: &NodeId, unexpected: bool) {
        if let Some(transit) = &self.transit {
            let rejected = transit.pending().reject_for_node(node, || {
                BrokerError::NodeUnavailable { node: node.clone() }
            });
            if rejected > 0 {
                debug!(node = %node, rejected, "rejected in-flight calls for lost node");
            }
        }
        self.bus.publish(BrokerEvent::NodeDisconnected {
            node: node.clone(),
            unexpected,
        });
    }

    // ---- announcements and loops ---------------------------------------

    async fn announce_info(&self, target: Option<&NodeId>) -> Result<(), BrokerError> {
        let transit = match &self.transit {
            Some(transit) => transit,
            None => return Ok(()),
        };
        let packet = Packet::Info(PacketInfo {
            sender: self.node_id.clone(),
            seq: self.registry.local_node().seq(),
            instance_id: self.instance_id.clone(),
            services: self.registry.local_manifest(),
            client: ClientInfo::default(),
        });
        match target {
            Some(node) => transit.send_to(node, &packet).await,
            None => transit.broadcast(&packet).await,
        }
    }

    async fn send_heartbeat(&self) -> Result<(), BrokerError> {
        let transit = match &self.transit {
            Some(transit) => transit,
            None => return Ok(()),
        };
        let cpu = self.cpu_source.as_ref().map(|source| source());
        self.registry.local_node().beat(cpu);
        transit
            .broadcast(&Packet::Heartbeat(PacketHeartbeat {
                sender: self.node_id.clone(),
                seq: self.registry.local_node().seq(),
                cpu,
            }))
            .await
    }

    fn expire_silent_nodes(&self) {
        for node in self.registry.sweep(self.options.heartbeat_timeout) {
            warn!(node = %node, "heartbeat timed out, dropping node");
            self.handle_node_loss(&node, true);
        }
    }

    fn spawn_loops(self: &Rc<Self>) {
        let transit = match &self.transit {
            Some(transit) => Rc::clone(transit),
            None => return,
        };
        let weak = Rc::downgrade(self);
        let mut tasks = self.tasks.borrow_mut();
        tasks.push(tokio::task::spawn_local(receive_loop(weak.clone(), transit)));
        tasks.push(tokio::task::spawn_local(heartbeat_loop(weak.clone())));
        tasks.push(tokio::task::spawn_local(sweep_loop(weak)));
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("node_id", &self.node_id)
            .field("state", &self.state.get())
            .field("namespace", &self.options.namespace)
            .finish()
    }
}

/// Drains inbound packets until the transport or the broker is gone.
///
/// Holds the transit, not the broker: a broker dropped without `stop`
/// must not be kept alive by its own receive loop.
async fn receive_loop(broker: Weak<Broker>, transit: Rc<Transit>) {
    while let Some(packet) = transit.recv().await {
        let strong = match broker.upgrade() {
            Some(broker) => broker,
            None => return,
        };
        strong.handle_packet(packet).await;
    }
    debug!("transport closed, receive loop ending");
}

async fn heartbeat_loop(broker: Weak<Broker>) {
    let period = match broker.upgrade() {
        Some(broker) => broker.options.heartbeat_interval,
        None => return,
    };
    if period.is_zero() {
        return;
    }
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // the first tick resolves immediately
    loop {
        ticker.tick().await;
        let strong = match broker.upgrade() {
            Some(broker) => broker,
            None => return,
        };
        if let Err(error) = strong.send_heartbeat().await {
            warn!(%error, "heartbeat publish failed");
        }
    }
}

async fn sweep_loop(broker: Weak<Broker>) {
    let (period, expiry) = match broker.upgrade() {
        Some(broker) => (
            broker.options.heartbeat_interval,
            broker.options.heartbeat_timeout,
        ),
        None => return,
    };
    if period.is_zero() || expiry.is_zero() {
        return;
    }
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let strong = match broker.upgrade() {
            Some(broker) => broker,
            None => return,
        };
        strong.expire_silent_nodes();
    }
}

/// The `$node` introspection service: registry snapshots as actions.
fn node_info_service(broker: Weak<Broker>) -> ServiceSpec {
    fn alive(broker: &Weak<Broker>) -> Result<Rc<Broker>, BrokerError> {
        broker.upgrade().ok_or_else(|| BrokerError::Handler {
            message: "broker is gone".to_string(),
        })
    }

    let list = broker.clone();
    let services = broker.clone();
    let actions = broker;
    ServiceSpec::builder("$node")
        .action(ActionSpec::new("list", move |_ctx| {
            let broker = list.clone();
            async move { Ok(alive(&broker)?.registry.nodes_snapshot()) }
        }))
        .action(ActionSpec::new("services", move |_ctx| {
            let broker = services.clone();
            async move { Ok(alive(&broker)?.registry.services_snapshot()) }
        }))
        .action(ActionSpec::new("actions", move |_ctx| {
            let broker = actions.clone();
            async move { Ok(alive(&broker)?.registry.actions_snapshot()) }
        }))
        .build()
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|since| since.as_millis() as u64)
        .unwrap_or(0)
}
