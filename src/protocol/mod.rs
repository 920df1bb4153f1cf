//! Fabric Wire Protocol
//!
//! Link-layer frames exchanged between directly connected instances, the
//! routed envelope carried inside them, and the payloads of the core
//! capabilities.
//!
//! ## Layers
//!
//! | Layer    | Carried in     | Purpose                                   |
//! |----------|----------------|-------------------------------------------|
//! | Link     | transport link | Handshake, route exchange, liveness       |
//! | Envelope | Link 0x10      | Multi-hop request/response/event delivery |
//! | Payload  | Envelope body  | Capability-specific data                  |
//!
//! All multi-byte integers are little-endian.

mod envelope;
mod error;
mod link;
mod state;
mod wire;

pub use envelope::{
    Envelope, EnvelopeKind, MessageType, ResponseStatus, ENVELOPE_HEADER_SIZE, MAX_PAYLOAD_SIZE,
};
pub use error::ProtocolError;
pub use link::{
    Disconnect, DisconnectReason, Handshake, HandshakeAck, HandshakeStatus, LinkMessage,
    LinkMessageType, RouteAdvertise, HANDSHAKE_ACK_SIZE, MAX_ADVERTISED_ROUTES,
    MAX_CREDENTIAL_LEN,
};
pub use state::{SnapshotRequest, StateValue, StreamOpen, StreamRef, Subtree};

pub(crate) use wire::Reader;
