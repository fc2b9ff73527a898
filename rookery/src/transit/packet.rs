//! Wire packets exchanged between brokers.
//!
//! Every packet is a tagged JSON object (`"type": "INFO"` etc.) carrying the
//! sender's node id, so any subscriber can attribute traffic without knowing
//! the channel it arrived on. Channel names follow
//! `{prefix}.{TYPE}` for broadcast and `{prefix}.{TYPE}.{node}` for targeted
//! delivery, where the prefix isolates independent meshes sharing one
//! transport.

use serde::{Deserialize, Serialize};

use crate::error::WireError;
use crate::registry::NodeId;

/// Packet type strings as they appear in the `type` tag and in channel names.
pub(crate) mod kind {
    pub const DISCOVER: &str = "DISCOVER";
    pub const INFO: &str = "INFO";
    pub const HEARTBEAT: &str = "HEARTBEAT";
    pub const REQUEST: &str = "REQUEST";
    pub const RESPONSE: &str = "RESPONSE";
    pub const EVENT: &str = "EVENT";
    pub const PING: &str = "PING";
    pub const PONG: &str = "PONG";
    pub const DISCONNECT: &str = "DISCONNECT";
}

/// A wire packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum Packet {
    Discover(PacketDiscover),
    Info(PacketInfo),
    Heartbeat(PacketHeartbeat),
    Request(PacketRequest),
    Response(PacketResponse),
    Event(PacketEvent),
    Ping(PacketPing),
    Pong(PacketPong),
    Disconnect(PacketDisconnect),
}

impl Packet {
    /// Packet type string, matching the channel segment it travels on.
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Discover(_) => kind::DISCOVER,
            Packet::Info(_) => kind::INFO,
            Packet::Heartbeat(_) => kind::HEARTBEAT,
            Packet::Request(_) => kind::REQUEST,
            Packet::Response(_) => kind::RESPONSE,
            Packet::Event(_) => kind::EVENT,
            Packet::Ping(_) => kind::PING,
            Packet::Pong(_) => kind::PONG,
            Packet::Disconnect(_) => kind::DISCONNECT,
        }
    }

    /// Node that sent this packet.
    pub fn sender(&self) -> &NodeId {
        match self {
            Packet::Discover(p) => &p.sender,
            Packet::Info(p) => &p.sender,
            Packet::Heartbeat(p) => &p.sender,
            Packet::Request(p) => &p.sender,
            Packet::Response(p) => &p.sender,
            Packet::Event(p) => &p.sender,
            Packet::Ping(p) => &p.sender,
            Packet::Pong(p) => &p.sender,
            Packet::Disconnect(p) => &p.sender,
        }
    }
}

/// Ask peers to answer with their INFO.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketDiscover {
    pub sender: NodeId,
}

/// Full service manifest of one node.
///
/// `seq` increases on every local registry change; receivers drop packets
/// whose sequence is not newer than what they already hold. `instance_id`
/// changes on every process start, letting peers tell a restart from a
/// reordered packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PacketInfo {
    pub sender: NodeId,
    pub seq: u64,
    pub instance_id: String,
    pub services: Vec<ServiceInfo>,
    pub client: ClientInfo,
}

/// Periodic liveness beacon with an optional load sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketHeartbeat {
    pub sender: NodeId,
    pub seq: u64,
    pub cpu: Option<f32>,
}

/// Invoke an action on the target node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PacketRequest {
    pub sender: NodeId,
    /// Call id; the matching RESPONSE echoes it.
    pub id: String,
    pub action: String,
    pub params: serde_json::Value,
    pub meta: serde_json::Value,
    /// Remaining time budget of the caller, so the callee can skip work
    /// whose result nobody will wait for.
    pub timeout_ms: Option<u64>,
    pub level: u32,
    pub parent_id: Option<String>,
    pub request_id: String,
    /// Action that made this call, when nested.
    pub caller: Option<String>,
}

/// Result or error for a REQUEST, correlated by call id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketResponse {
    pub sender: NodeId,
    pub id: String,
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<WireError>,
    /// Callee meta, merged back into the caller's context.
    pub meta: serde_json::Value,
}

/// Event delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketEvent {
    pub sender: NodeId,
    pub id: String,
    pub event: String,
    pub data: serde_json::Value,
    pub meta: serde_json::Value,
    /// Groups this node should deliver to; `None` means all local groups.
    pub groups: Option<Vec<String>>,
    /// Broadcast events go to every matching handler, balanced ones to one
    /// handler per group.
    pub broadcast: bool,
    pub level: u32,
}

/// Connectivity and clock probe. `time` is the sender's clock in unix ms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketPing {
    pub sender: NodeId,
    pub id: String,
    pub time: u64,
}

/// Answer to a PING: echoes `time`, adds the arrival timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketPong {
    pub sender: NodeId,
    pub id: String,
    pub time: u64,
    pub arrived: u64,
}

/// Graceful withdrawal from the mesh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketDisconnect {
    pub sender: NodeId,
}

/// One service as announced in INFO.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    /// Full name, version prefix included (`v2.users`).
    pub name: String,
    pub version: Option<String>,
    pub settings: serde_json::Value,
    pub actions: Vec<ActionInfo>,
    pub events: Vec<EventInfo>,
}

/// One action as announced in INFO.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionInfo {
    /// Full action name (`v2.users.get`).
    pub name: String,
    /// Per-action timeout override, honored by remote callers.
    pub timeout_ms: Option<u64>,
}

/// One event subscription as announced in INFO.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventInfo {
    /// Subscription pattern; may contain `*` / `**` wildcards.
    pub name: String,
    pub group: String,
}

/// Library identification carried in INFO.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub library: String,
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            library: "rookery".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Builds wire channel names for one namespace.
///
/// An empty namespace yields `RKY.INFO`; namespace `staging` yields
/// `RKY-staging.INFO`, so two meshes can share a transport without seeing
/// each other.
#[derive(Debug, Clone)]
pub(crate) struct Channels {
    prefix: String,
}

impl Channels {
    pub fn new(namespace: &str) -> Self {
        let prefix = if namespace.is_empty() {
            "RKY".to_string()
        } else {
            format!("RKY-{namespace}")
        };
        Self { prefix }
    }

    pub fn broadcast(&self, kind: &str) -> String {
        format!("{}.{kind}", self.prefix)
    }

    pub fn targeted(&self, kind: &str, node: &NodeId) -> String {
        format!("{}.{kind}.{node}", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_tag_is_uppercase_type() {
        let packet = Packet::Heartbeat(PacketHeartbeat {
            sender: NodeId::new("node-1"),
            seq: 3,
            cpu: Some(0.25),
        });

        let json = serde_json::to_value(&packet).expect("serialize");
        assert_eq!(json["type"], "HEARTBEAT");
        assert_eq!(json["sender"], "node-1");
        assert_eq!(packet.kind(), "HEARTBEAT");
    }

    #[test]
    fn test_request_round_trip() {
        let packet = Packet::Request(PacketRequest {
            sender: NodeId::new("node-1"),
            id: "abc".into(),
            action: "math.add".into(),
            params: serde_json::json!({ "a": 1, "b": 2 }),
            meta: serde_json::json!({}),
            timeout_ms: Some(5000),
            level: 1,
            parent_id: None,
            request_id: "abc".into(),
            caller: None,
        });

        let bytes = serde_json::to_vec(&packet).expect("serialize");
        let back: Packet = serde_json::from_slice(&bytes).expect("deserialize");
        assert_eq!(back, packet);
        assert_eq!(back.sender().as_str(), "node-1");
    }

    #[test]
    fn test_channel_names() {
        let plain = Channels::new("");
        assert_eq!(plain.broadcast(kind::INFO), "RKY.INFO");
        assert_eq!(
            plain.targeted(kind::REQUEST, &NodeId::new("node-7")),
            "RKY.REQUEST.node-7"
        );

        let namespaced = Channels::new("staging");
        assert_eq!(namespaced.broadcast(kind::DISCOVER), "RKY-staging.DISCOVER");
    }

    #[test]
    fn test_namespaces_do_not_collide() {
        let a = Channels::new("a");
        let b = Channels::new("b");
        assert_ne!(a.broadcast(kind::INFO), b.broadcast(kind::INFO));
    }
}
