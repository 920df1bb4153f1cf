//! Instance Identity
//!
//! Every instance on the fabric is addressed by a 32-bit instance identifier
//! (IID). Servers carry a statically configured IID; agents and viewers are
//! assigned one by the server they handshake with and offer it back as a
//! hint when they reconnect.

mod allocator;
mod persist;

pub use allocator::IidAllocator;
pub use persist::{load_iid, store_iid};

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors related to identity assignment.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("no available IIDs")]
    Exhausted,

    #[error("IID {0} not allocated")]
    NotFound(Iid),

    #[error("IID {0} already in use")]
    AlreadyInUse(Iid),

    #[error("IID {iid} is not valid for role {role}")]
    Invalid { iid: Iid, role: InstanceRole },

    #[error("unknown instance role: 0x{0:02x}")]
    UnknownRole(u8),

    #[error("failed to access IID file {path}: {source}")]
    File {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("malformed IID file {path}: {content:?}")]
    MalformedFile {
        path: std::path::PathBuf,
        content: String,
    },
}

/// A 32-bit instance identifier.
///
/// Zero is reserved and means "not yet assigned".
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Iid(u32);

impl Iid {
    /// The unassigned identifier.
    pub const UNSET: Iid = Iid(0);

    /// Create from raw u32.
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Get the raw u32 value.
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Whether this is the reserved "unassigned" value.
    pub fn is_unset(&self) -> bool {
        self.0 == 0
    }

    /// Convert to little-endian bytes.
    pub fn to_le_bytes(&self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    /// Create from little-endian bytes.
    pub fn from_le_bytes(bytes: [u8; 4]) -> Self {
        Self(u32::from_le_bytes(bytes))
    }
}

impl fmt::Display for Iid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The role an instance plays on the fabric.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum InstanceRole {
    /// Managed endpoint.
    #[default]
    Agent = 0x01,
    /// Relay and identity authority.
    Server = 0x02,
    /// Operator console.
    Viewer = 0x03,
}

impl InstanceRole {
    /// Try to convert from a byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(InstanceRole::Agent),
            0x02 => Some(InstanceRole::Server),
            0x03 => Some(InstanceRole::Viewer),
            _ => None,
        }
    }

    /// Convert to a byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Whether instances of this role assign identities to their peers.
    pub fn is_authority(&self) -> bool {
        matches!(self, InstanceRole::Server)
    }
}

impl fmt::Display for InstanceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceRole::Agent => "agent",
            InstanceRole::Server => "server",
            InstanceRole::Viewer => "viewer",
        };
        write!(f, "{}", s)
    }
}
