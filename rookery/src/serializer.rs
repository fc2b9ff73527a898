//! Pluggable packet serialization.
//!
//! The [`Serializer`] trait lets deployments bring their own wire format
//! (MessagePack, CBOR, protobuf, ...) while the crate ships a default
//! [`JsonSerializer`]. A serializer must round-trip every field of every
//! [`Packet`] variant; two brokers on one transport must of course agree on
//! the format.

use thiserror::Error;

use crate::transit::packet::Packet;

/// Error type for serializer operations.
#[derive(Debug, Error)]
pub enum SerializerError {
    /// Failed to encode a packet to bytes.
    #[error("encode failed: {0}")]
    Encode(Box<dyn std::error::Error + Send + Sync>),

    /// Failed to decode bytes to a packet.
    #[error("decode failed: {0}")]
    Decode(Box<dyn std::error::Error + Send + Sync>),
}

/// Pluggable wire format for [`Packet`]s.
pub trait Serializer {
    /// Encode a packet to bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SerializerError::Encode`] if serialization fails.
    fn encode(&self, packet: &Packet) -> Result<Vec<u8>, SerializerError>;

    /// Decode bytes back to a packet.
    ///
    /// # Errors
    ///
    /// Returns [`SerializerError::Decode`] if the bytes are not a valid
    /// packet in this format.
    fn decode(&self, bytes: &[u8]) -> Result<Packet, SerializerError>;
}

/// JSON serializer using serde_json. The default: human-readable and
/// debuggable, not the most compact.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn encode(&self, packet: &Packet) -> Result<Vec<u8>, SerializerError> {
        serde_json::to_vec(packet).map_err(|e| SerializerError::Encode(Box::new(e)))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Packet, SerializerError> {
        serde_json::from_slice(bytes).map_err(|e| SerializerError::Decode(Box::new(e)))
    }
}
