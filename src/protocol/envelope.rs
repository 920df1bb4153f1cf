//! Request/response envelope carried between instances.

use super::wire::Reader;
use super::ProtocolError;
use crate::identity::Iid;
use std::fmt;

// ============================================================================
// Message Types
// ============================================================================

/// Capability discriminator carried in every envelope.
///
/// Core message types live below 0x1000; plugins register their own above it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageType(u16);

impl MessageType {
    /// Liveness check answered with [`PONG`](Self::PONG).
    pub const PING: MessageType = MessageType(0x0001);
    /// Reply to [`PING`](Self::PING).
    pub const PONG: MessageType = MessageType(0x0002);

    /// Open a state stream on the destination.
    pub const STREAM_OPEN: MessageType = MessageType(0x0010);
    /// Reply carrying the opened stream id.
    pub const STREAM_OPENED: MessageType = MessageType(0x0011);
    /// Close a previously opened state stream.
    pub const STREAM_CLOSE: MessageType = MessageType(0x0012);
    /// Reply to [`STREAM_CLOSE`](Self::STREAM_CLOSE).
    pub const STREAM_CLOSED: MessageType = MessageType(0x0013);
    /// One state tree change delivered on a stream.
    pub const STREAM_EVENT: MessageType = MessageType(0x0014);
    /// A stream ended without the subscriber closing it.
    pub const STREAM_END: MessageType = MessageType(0x0015);

    /// Read one attribute of the destination's state tree.
    pub const STATE_GET: MessageType = MessageType(0x0020);
    /// Reply carrying an attribute snapshot.
    pub const STATE_VALUE: MessageType = MessageType(0x0021);
    /// Copy every attribute under a prefix of the destination's tree.
    pub const STATE_SNAPSHOT: MessageType = MessageType(0x0022);
    /// Reply carrying the attributes of a subtree.
    pub const STATE_SUBTREE: MessageType = MessageType(0x0023);

    /// First message type available to plugins.
    pub const PLUGIN_BASE: u16 = 0x1000;

    /// Create from raw u16.
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    /// Get the raw u16 value.
    pub fn as_u16(&self) -> u16 {
        self.0
    }

    /// Whether this type is reserved for the core.
    pub fn is_core(&self) -> bool {
        self.0 < Self::PLUGIN_BASE
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            MessageType::PING => "Ping",
            MessageType::PONG => "Pong",
            MessageType::STREAM_OPEN => "StreamOpen",
            MessageType::STREAM_OPENED => "StreamOpened",
            MessageType::STREAM_CLOSE => "StreamClose",
            MessageType::STREAM_CLOSED => "StreamClosed",
            MessageType::STREAM_EVENT => "StreamEvent",
            MessageType::STREAM_END => "StreamEnd",
            MessageType::STATE_GET => "StateGet",
            MessageType::STATE_VALUE => "StateValue",
            MessageType::STATE_SNAPSHOT => "StateSnapshot",
            MessageType::STATE_SUBTREE => "StateSubtree",
            _ => return write!(f, "0x{:04x}", self.0),
        };
        write!(f, "{}", name)
    }
}

// ============================================================================
// Envelope Kind
// ============================================================================

/// What an envelope carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum EnvelopeKind {
    /// A capability invocation expecting exactly one response.
    Request = 0x00,
    /// The response to a request, correlated by request id.
    Response = 0x01,
    /// A stream event; the request id field carries the stream id.
    Event = 0x02,
}

impl EnvelopeKind {
    /// Try to convert from a byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(EnvelopeKind::Request),
            0x01 => Some(EnvelopeKind::Response),
            0x02 => Some(EnvelopeKind::Event),
            _ => None,
        }
    }

    /// Convert to a byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EnvelopeKind::Request => "request",
            EnvelopeKind::Response => "response",
            EnvelopeKind::Event => "event",
        };
        write!(f, "{}", name)
    }
}

// ============================================================================
// Response Status
// ============================================================================

/// Outcome carried by a response envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseStatus {
    /// The handler produced a value.
    Ok = 0x00,
    /// No route to the destination, or the next hop went away.
    RoutingFailed = 0x01,
    /// The envelope's time-to-live ran out in transit.
    TtlExpired = 0x02,
    /// The handler requires an authenticated requester.
    Unauthorized = 0x03,
    /// No handler is registered for the message type.
    NoHandler = 0x04,
    /// The handler returned an error or panicked.
    HandlerFailed = 0x05,
    /// The connection carrying the request closed.
    ConnectionClosed = 0x06,
}

impl ResponseStatus {
    /// Try to convert from a byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(ResponseStatus::Ok),
            0x01 => Some(ResponseStatus::RoutingFailed),
            0x02 => Some(ResponseStatus::TtlExpired),
            0x03 => Some(ResponseStatus::Unauthorized),
            0x04 => Some(ResponseStatus::NoHandler),
            0x05 => Some(ResponseStatus::HandlerFailed),
            0x06 => Some(ResponseStatus::ConnectionClosed),
            _ => None,
        }
    }

    /// Convert to a byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Whether this status carries a handler value.
    pub fn is_ok(&self) -> bool {
        matches!(self, ResponseStatus::Ok)
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResponseStatus::Ok => "ok",
            ResponseStatus::RoutingFailed => "routing failed",
            ResponseStatus::TtlExpired => "ttl expired",
            ResponseStatus::Unauthorized => "unauthorized",
            ResponseStatus::NoHandler => "no handler",
            ResponseStatus::HandlerFailed => "handler failed",
            ResponseStatus::ConnectionClosed => "connection closed",
        };
        write!(f, "{}", name)
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// Flag bit: the originator is authenticated along the whole path so far.
const FLAG_AUTHENTICATED: u8 = 0x01;

/// Envelope fixed header size.
pub const ENVELOPE_HEADER_SIZE: usize = 22;

/// Maximum envelope payload size.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Routing and correlation wrapper for every command exchange.
///
/// ## Wire Format (22-byte fixed header)
///
/// | Offset | Field       | Size     | Description                       |
/// |--------|-------------|----------|-----------------------------------|
/// | 0      | kind        | 1 byte   | EnvelopeKind                      |
/// | 1      | flags       | 1 byte   | bit 0: authenticated              |
/// | 2      | ttl         | 1 byte   | Decremented at each forward       |
/// | 3      | status      | 1 byte   | ResponseStatus (0 for requests)   |
/// | 4      | src         | 4 bytes  | Sender IID (LE)                   |
/// | 8      | dest        | 4 bytes  | Destination IID (LE)              |
/// | 12     | request_id  | 4 bytes  | Correlation id or stream id (LE)  |
/// | 16     | msg_type    | 2 bytes  | MessageType (LE)                  |
/// | 18     | payload_len | 4 bytes  | Payload length (LE)               |
/// | 22     | payload     | variable |                                   |
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    /// Request, response or stream event.
    pub kind: EnvelopeKind,
    /// Originating instance.
    pub src: Iid,
    /// Destination instance.
    pub dest: Iid,
    /// Correlation id (requests/responses) or stream id (events).
    pub request_id: u32,
    /// Capability discriminator.
    pub msg_type: MessageType,
    /// Response outcome; always `Ok` for requests and events.
    pub status: ResponseStatus,
    /// Whether the originator is authenticated.
    pub authenticated: bool,
    /// Remaining hops.
    pub ttl: u8,
    /// Opaque payload (a failure reason for non-`Ok` responses).
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Create a request envelope.
    pub fn request(
        src: Iid,
        dest: Iid,
        request_id: u32,
        msg_type: MessageType,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            kind: EnvelopeKind::Request,
            src,
            dest,
            request_id,
            msg_type,
            status: ResponseStatus::Ok,
            authenticated: true,
            ttl: 16,
            payload,
        }
    }

    /// Create a successful response to `request`.
    pub fn response_to(request: &Envelope, msg_type: MessageType, payload: Vec<u8>) -> Self {
        Self {
            kind: EnvelopeKind::Response,
            src: request.dest,
            dest: request.src,
            request_id: request.request_id,
            msg_type,
            status: ResponseStatus::Ok,
            authenticated: true,
            ttl: 16,
            payload,
        }
    }

    /// Create a failed response to `request` from `responder`.
    ///
    /// The responder may be a transit instance rather than the request's
    /// destination (routing failures are synthesized where they happen).
    pub fn failure_to(
        request: &Envelope,
        responder: Iid,
        status: ResponseStatus,
        reason: &str,
    ) -> Self {
        Self {
            kind: EnvelopeKind::Response,
            src: responder,
            dest: request.src,
            request_id: request.request_id,
            msg_type: request.msg_type,
            status,
            authenticated: true,
            ttl: 16,
            payload: reason.as_bytes().to_vec(),
        }
    }

    /// Create a stream event envelope.
    pub fn event(src: Iid, dest: Iid, stream_id: u32, payload: Vec<u8>) -> Self {
        Self {
            kind: EnvelopeKind::Event,
            src,
            dest,
            request_id: stream_id,
            msg_type: MessageType::STREAM_EVENT,
            status: ResponseStatus::Ok,
            authenticated: true,
            ttl: 16,
            payload,
        }
    }

    /// Tell the subscriber owning `sink_id` that its stream from `source`
    /// has ended. Sent by whichever instance saw the source go away.
    pub fn stream_end(notifier: Iid, dest: Iid, sink_id: u32, source: Iid) -> Self {
        Self {
            kind: EnvelopeKind::Event,
            src: notifier,
            dest,
            request_id: sink_id,
            msg_type: MessageType::STREAM_END,
            status: ResponseStatus::Ok,
            authenticated: true,
            ttl: 16,
            payload: source.to_le_bytes().to_vec(),
        }
    }

    /// The source named by a [`STREAM_END`](MessageType::STREAM_END) event.
    pub fn ended_source(&self) -> Option<Iid> {
        if self.kind != EnvelopeKind::Event || self.msg_type != MessageType::STREAM_END {
            return None;
        }
        let bytes: [u8; 4] = self.payload.get(..4)?.try_into().ok()?;
        Some(Iid::from_le_bytes(bytes))
    }

    /// Set the TTL.
    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the authentication flag.
    pub fn with_authenticated(mut self, authenticated: bool) -> Self {
        self.authenticated = authenticated;
        self
    }

    /// Decrement TTL, returning false once it reaches zero.
    pub fn decrement_ttl(&mut self) -> bool {
        self.ttl = self.ttl.saturating_sub(1);
        self.ttl > 0
    }

    /// Whether this is a request.
    pub fn is_request(&self) -> bool {
        self.kind == EnvelopeKind::Request
    }

    /// Whether this is a response.
    pub fn is_response(&self) -> bool {
        self.kind == EnvelopeKind::Response
    }

    /// The failure reason of a non-`Ok` response.
    pub fn reason(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Encode to wire format (without the link message type byte).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ENVELOPE_HEADER_SIZE + self.payload.len());
        buf.push(self.kind.to_byte());
        buf.push(if self.authenticated { FLAG_AUTHENTICATED } else { 0 });
        buf.push(self.ttl);
        buf.push(self.status.to_byte());
        buf.extend_from_slice(&self.src.to_le_bytes());
        buf.extend_from_slice(&self.dest.to_le_bytes());
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        buf.extend_from_slice(&self.msg_type.as_u16().to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode from wire format (after the link message type byte).
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < ENVELOPE_HEADER_SIZE {
            return Err(ProtocolError::MessageTooShort {
                expected: ENVELOPE_HEADER_SIZE,
                got: payload.len(),
            });
        }

        let mut r = Reader::new(payload);
        let kind_byte = r.u8()?;
        let kind = EnvelopeKind::from_byte(kind_byte).ok_or(ProtocolError::InvalidKind(kind_byte))?;
        let flags = r.u8()?;
        let ttl = r.u8()?;
        let status_byte = r.u8()?;
        let status =
            ResponseStatus::from_byte(status_byte).ok_or(ProtocolError::InvalidStatus(status_byte))?;
        let src = Iid::new(r.u32()?);
        let dest = Iid::new(r.u32()?);
        let request_id = r.u32()?;
        let msg_type = MessageType::new(r.u16()?);
        let len = r.u32()? as usize;

        if len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::MessageTooLong {
                max: MAX_PAYLOAD_SIZE,
                got: len,
            });
        }
        let body = r.take(len)?.to_vec();

        Ok(Self {
            kind,
            src,
            dest,
            request_id,
            msg_type,
            status,
            authenticated: flags & FLAG_AUTHENTICATED != 0,
            ttl,
            payload: body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_encode_decode() {
        let env = Envelope::request(Iid::new(1000), Iid::new(5), 7, MessageType::PING, vec![1, 2, 3])
            .with_ttl(9)
            .with_authenticated(false);
        let bytes = env.encode();
        assert_eq!(bytes.len(), ENVELOPE_HEADER_SIZE + 3);
        let decoded = Envelope::decode(&bytes).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_envelope_too_short() {
        let err = Envelope::decode(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, ProtocolError::MessageTooShort { .. }));
    }

    #[test]
    fn test_envelope_truncated_payload() {
        let env = Envelope::request(Iid::new(1), Iid::new(2), 1, MessageType::PING, vec![0; 8]);
        let bytes = env.encode();
        let err = Envelope::decode(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, ProtocolError::MessageTooShort { .. }));
    }

    #[test]
    fn test_envelope_invalid_kind() {
        let mut bytes =
            Envelope::request(Iid::new(1), Iid::new(2), 1, MessageType::PING, vec![]).encode();
        bytes[0] = 0x7f;
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(ProtocolError::InvalidKind(0x7f))
        ));
    }

    #[test]
    fn test_response_addressing() {
        let req = Envelope::request(Iid::new(1000), Iid::new(5), 42, MessageType::PING, vec![]);
        let resp = Envelope::response_to(&req, MessageType::PONG, vec![]);
        assert_eq!(resp.src, Iid::new(5));
        assert_eq!(resp.dest, Iid::new(1000));
        assert_eq!(resp.request_id, 42);
        assert!(resp.is_response());

        let fail = Envelope::failure_to(&req, Iid::new(9), ResponseStatus::RoutingFailed, "no route");
        assert_eq!(fail.src, Iid::new(9));
        assert_eq!(fail.dest, Iid::new(1000));
        assert_eq!(fail.msg_type, MessageType::PING);
        assert_eq!(fail.reason(), "no route");
    }

    #[test]
    fn test_stream_end_names_source() {
        let end = Envelope::stream_end(Iid::new(5), Iid::new(2000), 3, Iid::new(1000));
        assert_eq!(end.kind, EnvelopeKind::Event);
        assert_eq!(end.request_id, 3);
        assert_eq!(end.ended_source(), Some(Iid::new(1000)));

        let decoded = Envelope::decode(&end.encode()).unwrap();
        assert_eq!(decoded.ended_source(), Some(Iid::new(1000)));

        let event = Envelope::event(Iid::new(1000), Iid::new(2000), 3, vec![1, 2, 3, 4]);
        assert_eq!(event.ended_source(), None);
        let mut short = end.clone();
        short.payload.truncate(2);
        assert_eq!(short.ended_source(), None);
    }

    #[test]
    fn test_decrement_ttl() {
        let mut env = Envelope::request(Iid::new(1), Iid::new(2), 1, MessageType::PING, vec![])
            .with_ttl(2);
        assert!(env.decrement_ttl());
        assert_eq!(env.ttl, 1);
        assert!(!env.decrement_ttl());
        assert_eq!(env.ttl, 0);
        assert!(!env.decrement_ttl());
    }

    #[test]
    fn test_message_type_display() {
        assert_eq!(MessageType::PING.to_string(), "Ping");
        assert_eq!(MessageType::new(0x1234).to_string(), "0x1234");
        assert!(MessageType::PONG.is_core());
        assert!(!MessageType::new(MessageType::PLUGIN_BASE).is_core());
    }
}
