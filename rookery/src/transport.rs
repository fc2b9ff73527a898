//! Byte-level pub/sub seam under the transit layer.
//!
//! A [`Transport`] moves opaque payloads between channels; it knows nothing
//! about packets. Implementations may lose, duplicate, or reorder messages;
//! the transit protocol is built to tolerate all three. The bundled
//! [`MemoryHub`] wires several brokers together inside one process, which is
//! how the integration tests run whole meshes without sockets.
//!
//! # Design
//!
//! ```text
//!   Broker A ── MemoryTransport ──┐
//!   Broker B ── MemoryTransport ──┤── MemoryHub (channel -> subscribers)
//!   Broker C ── MemoryTransport ──┘
//! ```
//!
//! Delivery is per-subscription fan-out over unbounded channels. A transport
//! never receives its own publishes.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Error type for transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Operation attempted before `connect` (or after `disconnect`).
    #[error("transport is not connected")]
    NotConnected,

    /// The transport could not hand the payload to the wire.
    #[error("publish failed: {0}")]
    PublishFailed(String),

    /// Connecting to the underlying medium failed.
    #[error("connect failed: {0}")]
    ConnectFailed(String),
}

/// Byte-level pub/sub used by the transit layer.
///
/// All methods are async suspension points; the broker treats any returned
/// error as a transient infrastructure failure.
#[async_trait(?Send)]
pub trait Transport {
    /// Establish connectivity. Called once before any subscribe/publish.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Tear down connectivity. Pending inbound messages may be dropped.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Start receiving messages published to `channel`.
    async fn subscribe(&self, channel: &str) -> Result<(), TransportError>;

    /// Publish a payload to every subscriber of `channel`.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Next inbound `(channel, payload)`. Resolves to `None` once the
    /// transport is disconnected and drained. Single consumer.
    async fn recv(&self) -> Option<(String, Vec<u8>)>;
}

type HubMessage = (String, Vec<u8>);

struct HubPort {
    subscriptions: HashSet<String>,
    tx: mpsc::UnboundedSender<HubMessage>,
}

#[derive(Default)]
struct HubInner {
    ports: HashMap<u64, HubPort>,
    next_port: u64,
}

/// In-process hub connecting multiple brokers.
///
/// Clone the hub handle and call [`MemoryHub::transport`] once per broker.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Rc<RefCell<HubInner>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new port on this hub.
    pub fn transport(&self) -> MemoryTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.borrow_mut();
        let port = inner.next_port;
        inner.next_port += 1;
        inner.ports.insert(
            port,
            HubPort {
                subscriptions: HashSet::new(),
                tx,
            },
        );
        MemoryTransport {
            hub: Rc::clone(&self.inner),
            port,
            rx: RefCell::new(rx),
            connected: Cell::new(false),
        }
    }
}

/// One broker's port on a [`MemoryHub`].
pub struct MemoryTransport {
    hub: Rc<RefCell<HubInner>>,
    port: u64,
    rx: RefCell<mpsc::UnboundedReceiver<HubMessage>>,
    connected: Cell<bool>,
}

#[async_trait(?Send)]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.connected.set(true);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.connected.set(false);
        // Dropping the port closes our receiver, so recv() drains then ends.
        self.hub.borrow_mut().ports.remove(&self.port);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<(), TransportError> {
        if !self.connected.get() {
            return Err(TransportError::NotConnected);
        }
        let mut inner = self.hub.borrow_mut();
        match inner.ports.get_mut(&self.port) {
            Some(port) => {
                port.subscriptions.insert(channel.to_string());
                Ok(())
            }
            None => Err(TransportError::NotConnected),
        }
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if !self.connected.get() {
            return Err(TransportError::NotConnected);
        }
        let inner = self.hub.borrow();
        for (id, port) in inner.ports.iter() {
            if *id == self.port || !port.subscriptions.contains(channel) {
                continue;
            }
            // A closed receiver just means that port is going away.
            let _ = port.tx.send((channel.to_string(), payload.clone()));
        }
        Ok(())
    }

    async fn recv(&self) -> Option<(String, Vec<u8>)> {
        let mut rx = self.rx.borrow_mut();
        rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_published_payloads() {
        let hub = MemoryHub::new();
        let a = hub.transport();
        let b = hub.transport();
        a.connect().await.expect("connect a");
        b.connect().await.expect("connect b");
        b.subscribe("greetings").await.expect("subscribe");

        a.publish("greetings", b"hello".to_vec())
            .await
            .expect("publish");

        let (channel, payload) = b.recv().await.expect("message");
        assert_eq!(channel, "greetings");
        assert_eq!(payload, b"hello");
    }

    #[tokio::test]
    async fn test_publisher_does_not_hear_itself() {
        let hub = MemoryHub::new();
        let a = hub.transport();
        let b = hub.transport();
        a.connect().await.expect("connect a");
        b.connect().await.expect("connect b");
        a.subscribe("loop").await.expect("subscribe a");
        b.subscribe("loop").await.expect("subscribe b");

        a.publish("loop", b"x".to_vec()).await.expect("publish");

        // Only b hears it; a's queue stays empty.
        let (_, payload) = b.recv().await.expect("message");
        assert_eq!(payload, b"x");
        a.disconnect().await.expect("disconnect");
        assert!(a.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unsubscribed_channels_are_silent() {
        let hub = MemoryHub::new();
        let a = hub.transport();
        let b = hub.transport();
        a.connect().await.expect("connect a");
        b.connect().await.expect("connect b");
        b.subscribe("wanted").await.expect("subscribe");

        a.publish("unwanted", b"noise".to_vec())
            .await
            .expect("publish");
        a.publish("wanted", b"signal".to_vec())
            .await
            .expect("publish");

        let (channel, payload) = b.recv().await.expect("message");
        assert_eq!(channel, "wanted");
        assert_eq!(payload, b"signal");
    }

    #[tokio::test]
    async fn test_disconnect_ends_recv() {
        let hub = MemoryHub::new();
        let a = hub.transport();
        a.connect().await.expect("connect");
        a.subscribe("c").await.expect("subscribe");
        a.disconnect().await.expect("disconnect");

        assert!(a.recv().await.is_none());
        assert!(matches!(
            a.subscribe("c").await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_publish_requires_connect() {
        let hub = MemoryHub::new();
        let a = hub.transport();
        let result = a.publish("c", vec![1]).await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }
}
