//! Node identity and liveness state.

use std::cell::{Cell, RefCell};
use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::transit::packet::{ClientInfo, PacketInfo, ServiceInfo};

/// Unique identifier of a broker instance in the mesh.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// One known broker, local or remote.
///
/// Owned by the registry and shared into endpoints via `Rc`. All mutable
/// state sits behind `Cell`/`RefCell`; packets and the heartbeat sweep are
/// the only writers.
pub struct Node {
    id: NodeId,
    local: bool,
    seq: Cell<u64>,
    instance_id: RefCell<String>,
    available: Cell<bool>,
    last_heartbeat: Cell<Instant>,
    cpu: Cell<Option<f32>>,
    /// Estimated clock offset to this node in ms, from the latest PONG.
    offset_ms: Cell<Option<i64>>,
    client: RefCell<ClientInfo>,
    services: RefCell<Vec<ServiceInfo>>,
}

impl Node {
    pub(crate) fn new_local(id: NodeId, instance_id: String) -> Self {
        Self {
            id,
            local: true,
            seq: Cell::new(1),
            instance_id: RefCell::new(instance_id),
            available: Cell::new(true),
            last_heartbeat: Cell::new(Instant::now()),
            cpu: Cell::new(None),
            offset_ms: Cell::new(None),
            client: RefCell::new(ClientInfo::default()),
            services: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn new_remote(id: NodeId) -> Self {
        Self {
            id,
            local: false,
            seq: Cell::new(0),
            instance_id: RefCell::new(String::new()),
            available: Cell::new(false),
            last_heartbeat: Cell::new(Instant::now()),
            cpu: Cell::new(None),
            offset_ms: Cell::new(None),
            client: RefCell::new(ClientInfo::default()),
            services: RefCell::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn seq(&self) -> u64 {
        self.seq.get()
    }

    /// Bump the local sequence after a registry change. Local node only.
    pub(crate) fn bump_seq(&self) -> u64 {
        let next = self.seq.get() + 1;
        self.seq.set(next);
        next
    }

    pub fn is_available(&self) -> bool {
        self.available.get()
    }

    pub(crate) fn set_available(&self, available: bool) {
        self.available.set(available);
    }

    /// Record a heartbeat: refreshes liveness and the CPU sample.
    pub(crate) fn beat(&self, cpu: Option<f32>) {
        self.last_heartbeat.set(Instant::now());
        if cpu.is_some() {
            self.cpu.set(cpu);
        }
    }

    pub fn last_heartbeat(&self) -> Instant {
        self.last_heartbeat.get()
    }

    pub fn cpu(&self) -> Option<f32> {
        self.cpu.get()
    }

    pub fn offset_ms(&self) -> Option<i64> {
        self.offset_ms.get()
    }

    pub(crate) fn set_offset_ms(&self, offset: i64) {
        self.offset_ms.set(Some(offset));
    }

    pub fn client(&self) -> ClientInfo {
        self.client.borrow().clone()
    }

    pub fn instance_id(&self) -> String {
        self.instance_id.borrow().clone()
    }

    pub fn services(&self) -> Vec<ServiceInfo> {
        self.services.borrow().clone()
    }

    pub(crate) fn set_services(&self, services: Vec<ServiceInfo>) {
        *self.services.borrow_mut() = services;
    }

    /// Apply an INFO packet if it is newer than what we hold.
    ///
    /// A changed `instance_id` means the process restarted and its sequence
    /// counter started over, so it always wins. Otherwise the packet must
    /// carry a strictly higher sequence.
    pub(crate) fn apply_info(&self, info: &PacketInfo) -> bool {
        let restarted = *self.instance_id.borrow() != info.instance_id;
        if !restarted && info.seq <= self.seq.get() {
            return false;
        }
        self.seq.set(info.seq);
        *self.instance_id.borrow_mut() = info.instance_id.clone();
        *self.client.borrow_mut() = info.client.clone();
        *self.services.borrow_mut() = info.services.clone();
        self.available.set(true);
        self.last_heartbeat.set(Instant::now());
        true
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("local", &self.local)
            .field("seq", &self.seq.get())
            .field("available", &self.available.get())
            .field("cpu", &self.cpu.get())
            .finish()
    }
}
