//! Link-layer frames exchanged between directly connected instances.

use super::wire::Reader;
use super::{Envelope, ProtocolError};
use crate::identity::{Iid, InstanceRole};
use std::fmt;

// ============================================================================
// Link-Layer Message Types
// ============================================================================

/// Link-layer message type identifiers (first byte of every frame).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkMessageType {
    // Handshake (0x01-0x0F)
    /// Dialer announces its role, IID hint and credential.
    Handshake = 0x01,
    /// Acceptor answers with the assigned IID or a rejection.
    HandshakeAck = 0x02,

    // Forwarding (0x10-0x1F)
    /// A routed request, response or stream event.
    Envelope = 0x10,

    // Routing (0x20-0x2F)
    /// Full set of IIDs reachable through the sender.
    RouteAdvertise = 0x20,

    // Link Control (0x50-0x5F)
    /// Orderly disconnect notification before link closure.
    Disconnect = 0x50,
    /// Keepalive; carries no payload.
    Heartbeat = 0x51,
}

impl LinkMessageType {
    /// Try to convert from a byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(LinkMessageType::Handshake),
            0x02 => Some(LinkMessageType::HandshakeAck),
            0x10 => Some(LinkMessageType::Envelope),
            0x20 => Some(LinkMessageType::RouteAdvertise),
            0x50 => Some(LinkMessageType::Disconnect),
            0x51 => Some(LinkMessageType::Heartbeat),
            _ => None,
        }
    }

    /// Convert to a byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for LinkMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkMessageType::Handshake => "Handshake",
            LinkMessageType::HandshakeAck => "HandshakeAck",
            LinkMessageType::Envelope => "Envelope",
            LinkMessageType::RouteAdvertise => "RouteAdvertise",
            LinkMessageType::Disconnect => "Disconnect",
            LinkMessageType::Heartbeat => "Heartbeat",
        };
        write!(f, "{}", name)
    }
}

// ============================================================================
// Handshake
// ============================================================================

/// Maximum credential length accepted in a handshake.
pub const MAX_CREDENTIAL_LEN: usize = 1024;

/// First frame sent by the dialing side.
///
/// ## Wire Format
///
/// | Offset | Field    | Size     | Notes                          |
/// |--------|----------|----------|--------------------------------|
/// | 0      | msg_type | 1 byte   | 0x01                           |
/// | 1      | role     | 1 byte   | InstanceRole                   |
/// | 2      | iid      | 4 bytes  | Hint or static IID, 0 for none |
/// | 6      | cred_len | 2 bytes  | Credential length (LE)         |
/// | 8      | cred     | variable | UTF-8 credential               |
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handshake {
    /// Role of the dialing instance.
    pub role: InstanceRole,
    /// Previously assigned IID (agents/viewers) or static IID (servers).
    pub iid: Iid,
    /// Optional credential used to authenticate the connection.
    pub credential: Option<String>,
}

impl Handshake {
    /// Create a handshake without a credential.
    pub fn new(role: InstanceRole, iid: Iid) -> Self {
        Self {
            role,
            iid,
            credential: None,
        }
    }

    /// Attach a credential.
    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    /// Encode as a link frame.
    pub fn encode(&self) -> Vec<u8> {
        let cred = self.credential.as_deref().unwrap_or("").as_bytes();
        let mut buf = Vec::with_capacity(8 + cred.len());
        buf.push(LinkMessageType::Handshake.to_byte());
        buf.push(self.role.to_byte());
        buf.extend_from_slice(&self.iid.to_le_bytes());
        buf.extend_from_slice(&(cred.len() as u16).to_le_bytes());
        buf.extend_from_slice(cred);
        buf
    }

    /// Decode from payload (after msg_type byte has been consumed).
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(payload);
        let role_byte = r.u8()?;
        let role = InstanceRole::from_byte(role_byte).ok_or(ProtocolError::UnknownRole(role_byte))?;
        let iid = Iid::new(r.u32()?);
        let cred_len = r.u16()? as usize;
        if cred_len > MAX_CREDENTIAL_LEN {
            return Err(ProtocolError::MessageTooLong {
                max: MAX_CREDENTIAL_LEN,
                got: cred_len,
            });
        }
        let cred = r.take(cred_len)?;
        let credential = if cred.is_empty() {
            None
        } else {
            Some(
                String::from_utf8(cred.to_vec())
                    .map_err(|_| ProtocolError::Malformed("credential is not UTF-8".into()))?,
            )
        };
        Ok(Self {
            role,
            iid,
            credential,
        })
    }
}

/// Outcome of a handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum HandshakeStatus {
    /// Connection established with the assigned IID.
    Accepted = 0x00,
    /// The asserted IID collides with a live connection; retry without it.
    IdentityConflict = 0x01,
    /// The acceptor does not accept peers of the dialer's role.
    RoleRejected = 0x02,
    /// The acceptor has reached its connection limit.
    Full = 0x03,
    /// No IIDs are available.
    Exhausted = 0x04,
}

impl HandshakeStatus {
    /// Try to convert from a byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(HandshakeStatus::Accepted),
            0x01 => Some(HandshakeStatus::IdentityConflict),
            0x02 => Some(HandshakeStatus::RoleRejected),
            0x03 => Some(HandshakeStatus::Full),
            0x04 => Some(HandshakeStatus::Exhausted),
            _ => None,
        }
    }

    /// Convert to a byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for HandshakeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakeStatus::Accepted => "accepted",
            HandshakeStatus::IdentityConflict => "identity conflict",
            HandshakeStatus::RoleRejected => "role rejected",
            HandshakeStatus::Full => "full",
            HandshakeStatus::Exhausted => "exhausted",
        };
        write!(f, "{}", name)
    }
}

/// Acceptor's answer to a [`Handshake`].
///
/// ## Wire Format
///
/// | Offset | Field         | Size    | Notes                   |
/// |--------|---------------|---------|-------------------------|
/// | 0      | msg_type      | 1 byte  | 0x02                    |
/// | 1      | status        | 1 byte  | HandshakeStatus         |
/// | 2      | assigned      | 4 bytes | IID for the dialer      |
/// | 6      | responder     | 4 bytes | Acceptor's own IID      |
/// | 10     | role          | 1 byte  | Acceptor's role         |
/// | 11     | authenticated | 1 byte  | Credential was accepted |
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeAck {
    /// Outcome.
    pub status: HandshakeStatus,
    /// IID assigned to (or confirmed for) the dialer.
    pub assigned: Iid,
    /// The acceptor's own IID.
    pub responder: Iid,
    /// The acceptor's role.
    pub role: InstanceRole,
    /// Whether the dialer's credential was accepted.
    pub authenticated: bool,
}

/// HandshakeAck size including msg_type.
pub const HANDSHAKE_ACK_SIZE: usize = 12;

impl HandshakeAck {
    /// Create an acceptance.
    pub fn accepted(assigned: Iid, responder: Iid, role: InstanceRole, authenticated: bool) -> Self {
        Self {
            status: HandshakeStatus::Accepted,
            assigned,
            responder,
            role,
            authenticated,
        }
    }

    /// Create a rejection.
    pub fn rejected(status: HandshakeStatus, responder: Iid, role: InstanceRole) -> Self {
        Self {
            status,
            assigned: Iid::UNSET,
            responder,
            role,
            authenticated: false,
        }
    }

    /// Encode as a link frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HANDSHAKE_ACK_SIZE);
        buf.push(LinkMessageType::HandshakeAck.to_byte());
        buf.push(self.status.to_byte());
        buf.extend_from_slice(&self.assigned.to_le_bytes());
        buf.extend_from_slice(&self.responder.to_le_bytes());
        buf.push(self.role.to_byte());
        buf.push(u8::from(self.authenticated));
        buf
    }

    /// Decode from payload (after msg_type byte has been consumed).
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(payload);
        let status_byte = r.u8()?;
        let status = HandshakeStatus::from_byte(status_byte)
            .ok_or_else(|| ProtocolError::Malformed(format!("handshake status 0x{:02x}", status_byte)))?;
        let assigned = Iid::new(r.u32()?);
        let responder = Iid::new(r.u32()?);
        let role_byte = r.u8()?;
        let role = InstanceRole::from_byte(role_byte).ok_or(ProtocolError::UnknownRole(role_byte))?;
        let authenticated = r.u8()? != 0;
        Ok(Self {
            status,
            assigned,
            responder,
            role,
            authenticated,
        })
    }
}

// ============================================================================
// Route Advertisement
// ============================================================================

/// Maximum entries in one advertisement.
pub const MAX_ADVERTISED_ROUTES: usize = 65_535;

/// IIDs reachable through the sender, with the sender's hop count to each.
///
/// Replaces every route previously learnt from the same neighbour.
///
/// ## Wire Format
///
/// | Offset | Field    | Size    | Notes               |
/// |--------|----------|---------|---------------------|
/// | 0      | msg_type | 1 byte  | 0x20                |
/// | 1      | count    | 2 bytes | Entry count (LE)    |
/// | 3      | entries  | 5 * n   | iid (4 LE), hops(1) |
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouteAdvertise {
    /// (destination, hops from the advertiser) pairs.
    pub entries: Vec<(Iid, u8)>,
}

impl RouteAdvertise {
    /// Create an advertisement.
    pub fn new(entries: Vec<(Iid, u8)>) -> Self {
        Self { entries }
    }

    /// Encode as a link frame.
    pub fn encode(&self) -> Vec<u8> {
        let count = self.entries.len().min(MAX_ADVERTISED_ROUTES);
        let mut buf = Vec::with_capacity(3 + count * 5);
        buf.push(LinkMessageType::RouteAdvertise.to_byte());
        buf.extend_from_slice(&(count as u16).to_le_bytes());
        for (iid, hops) in self.entries.iter().take(count) {
            buf.extend_from_slice(&iid.to_le_bytes());
            buf.push(*hops);
        }
        buf
    }

    /// Decode from payload (after msg_type byte has been consumed).
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(payload);
        let count = r.u16()? as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let iid = Iid::new(r.u32()?);
            let hops = r.u8()?;
            entries.push((iid, hops));
        }
        Ok(Self { entries })
    }
}

// ============================================================================
// Disconnect
// ============================================================================

/// Reason for an orderly disconnect notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DisconnectReason {
    /// Normal shutdown (operator requested).
    Shutdown = 0x00,
    /// Handshake could not complete.
    HandshakeFailed = 0x01,
    /// Protocol error encountered.
    ProtocolError = 0x02,
    /// Liveness check failed.
    Timeout = 0x03,
    /// Switching to another server.
    Failover = 0x04,
    /// Unspecified reason.
    Other = 0xFF,
}

impl DisconnectReason {
    /// Try to convert from a byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(DisconnectReason::Shutdown),
            0x01 => Some(DisconnectReason::HandshakeFailed),
            0x02 => Some(DisconnectReason::ProtocolError),
            0x03 => Some(DisconnectReason::Timeout),
            0x04 => Some(DisconnectReason::Failover),
            0xFF => Some(DisconnectReason::Other),
            _ => None,
        }
    }

    /// Convert to a byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DisconnectReason::Shutdown => "Shutdown",
            DisconnectReason::HandshakeFailed => "HandshakeFailed",
            DisconnectReason::ProtocolError => "ProtocolError",
            DisconnectReason::Timeout => "Timeout",
            DisconnectReason::Failover => "Failover",
            DisconnectReason::Other => "Other",
        };
        write!(f, "{}", name)
    }
}

/// Orderly disconnect notification sent before closing a link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Disconnect {
    /// Reason for disconnection.
    pub reason: DisconnectReason,
}

impl Disconnect {
    /// Create a new Disconnect message.
    pub fn new(reason: DisconnectReason) -> Self {
        Self { reason }
    }

    /// Encode as a link frame (msg_type + reason).
    pub fn encode(&self) -> Vec<u8> {
        vec![LinkMessageType::Disconnect.to_byte(), self.reason.to_byte()]
    }

    /// Decode from payload (after msg_type byte has been consumed).
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.is_empty() {
            return Err(ProtocolError::MessageTooShort {
                expected: 1,
                got: 0,
            });
        }
        let reason = DisconnectReason::from_byte(payload[0]).unwrap_or(DisconnectReason::Other);
        Ok(Self { reason })
    }
}

// ============================================================================
// Envelope Frame
// ============================================================================

impl Envelope {
    /// Encode as a link frame (msg_type 0x10 + envelope).
    pub fn to_frame(&self) -> Vec<u8> {
        let body = self.encode();
        let mut buf = Vec::with_capacity(1 + body.len());
        buf.push(LinkMessageType::Envelope.to_byte());
        buf.extend_from_slice(&body);
        buf
    }
}

// ============================================================================
// Decoded Frame
// ============================================================================

/// A decoded link frame.
#[derive(Clone, Debug, PartialEq)]
pub enum LinkMessage {
    Handshake(Handshake),
    HandshakeAck(HandshakeAck),
    Envelope(Envelope),
    RouteAdvertise(RouteAdvertise),
    Disconnect(Disconnect),
    Heartbeat,
}

impl LinkMessage {
    /// Decode a complete link frame.
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let (&type_byte, payload) = frame.split_first().ok_or(ProtocolError::MessageTooShort {
            expected: 1,
            got: 0,
        })?;
        let msg_type =
            LinkMessageType::from_byte(type_byte).ok_or(ProtocolError::InvalidMessageType(type_byte))?;

        Ok(match msg_type {
            LinkMessageType::Handshake => LinkMessage::Handshake(Handshake::decode(payload)?),
            LinkMessageType::HandshakeAck => LinkMessage::HandshakeAck(HandshakeAck::decode(payload)?),
            LinkMessageType::Envelope => LinkMessage::Envelope(Envelope::decode(payload)?),
            LinkMessageType::RouteAdvertise => {
                LinkMessage::RouteAdvertise(RouteAdvertise::decode(payload)?)
            }
            LinkMessageType::Disconnect => LinkMessage::Disconnect(Disconnect::decode(payload)?),
            LinkMessageType::Heartbeat => LinkMessage::Heartbeat,
        })
    }

    /// Encode as a complete link frame.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            LinkMessage::Handshake(m) => m.encode(),
            LinkMessage::HandshakeAck(m) => m.encode(),
            LinkMessage::Envelope(env) => env.to_frame(),
            LinkMessage::RouteAdvertise(m) => m.encode(),
            LinkMessage::Disconnect(m) => m.encode(),
            LinkMessage::Heartbeat => vec![LinkMessageType::Heartbeat.to_byte()],
        }
    }

    /// The frame's message type.
    pub fn msg_type(&self) -> LinkMessageType {
        match self {
            LinkMessage::Handshake(_) => LinkMessageType::Handshake,
            LinkMessage::HandshakeAck(_) => LinkMessageType::HandshakeAck,
            LinkMessage::Envelope(_) => LinkMessageType::Envelope,
            LinkMessage::RouteAdvertise(_) => LinkMessageType::RouteAdvertise,
            LinkMessage::Disconnect(_) => LinkMessageType::Disconnect,
            LinkMessage::Heartbeat => LinkMessageType::Heartbeat,
        }
    }
}
