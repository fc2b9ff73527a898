//! Wire plumbing between brokers.
//!
//! `Transit` owns the transport and serializer and speaks the packet
//! protocol: channel naming, the subscription set, encode/publish on the
//! way out, decode/filter on the way in. It holds the pending-call store
//! but stays passive; the broker's receive loop drives it.

use std::rc::Rc;

use tracing::warn;

use crate::error::BrokerError;
use crate::registry::NodeId;
use crate::serializer::Serializer;
use crate::transport::Transport;

pub mod packet;
pub(crate) mod pending;

use packet::{kind, Channels, Packet};
use pending::PendingStore;

pub(crate) struct Transit {
    node_id: NodeId,
    channels: Channels,
    transport: Rc<dyn Transport>,
    serializer: Rc<dyn Serializer>,
    pending: PendingStore,
}

impl Transit {
    pub(crate) fn new(
        node_id: NodeId,
        namespace: &str,
        transport: Rc<dyn Transport>,
        serializer: Rc<dyn Serializer>,
    ) -> Self {
        Self {
            node_id,
            channels: Channels::new(namespace),
            transport,
            serializer,
            pending: PendingStore::new(),
        }
    }

    pub(crate) fn pending(&self) -> &PendingStore {
        &self.pending
    }

    /// Connect the transport and subscribe the full packet surface:
    /// the broadcast channels plus our targeted ones.
    pub(crate) async fn connect(&self) -> Result<(), BrokerError> {
        self.transport.connect().await?;
        for packet_kind in [
            kind::DISCOVER,
            kind::INFO,
            kind::HEARTBEAT,
            kind::PING,
            kind::DISCONNECT,
        ] {
            self.transport
                .subscribe(&self.channels.broadcast(packet_kind))
                .await?;
        }
        for packet_kind in [
            kind::DISCOVER,
            kind::INFO,
            kind::REQUEST,
            kind::RESPONSE,
            kind::EVENT,
            kind::PING,
            kind::PONG,
        ] {
            self.transport
                .subscribe(&self.channels.targeted(packet_kind, &self.node_id))
                .await?;
        }
        Ok(())
    }

    pub(crate) async fn disconnect(&self) -> Result<(), BrokerError> {
        self.transport.disconnect().await?;
        Ok(())
    }

    /// Publish on the packet's broadcast channel.
    pub(crate) async fn broadcast(&self, packet: &Packet) -> Result<(), BrokerError> {
        let channel = self.channels.broadcast(packet.kind());
        self.publish(&channel, packet).await
    }

    /// Publish on the packet's targeted channel for `node`.
    pub(crate) async fn send_to(&self, node: &NodeId, packet: &Packet) -> Result<(), BrokerError> {
        let channel = self.channels.targeted(packet.kind(), node);
        self.publish(&channel, packet).await
    }

    async fn publish(&self, channel: &str, packet: &Packet) -> Result<(), BrokerError> {
        let bytes = self.serializer.encode(packet)?;
        self.transport.publish(channel, bytes).await?;
        Ok(())
    }

    /// Next inbound packet; `None` when the transport is gone.
    ///
    /// Undecodable payloads and our own broadcast echoes are dropped here.
    pub(crate) async fn recv(&self) -> Option<Packet> {
        loop {
            let (channel, bytes) = self.transport.recv().await?;
            match self.serializer.decode(&bytes) {
                Ok(packet) => {
                    if packet.sender() == &self.node_id {
                        continue;
                    }
                    return Some(packet);
                }
                Err(error) => {
                    warn!(%channel, %error, "dropping undecodable packet");
                }
            }
        }
    }
}
