//! Transport Layer Abstractions
//!
//! A [`Link`] is an ordered, reliable, bidirectional frame pipe to one
//! remote instance: a bounded outbound queue and an inbound receiver of
//! complete frames. Adapters turn concrete transports into links; the
//! instance runtime only ever sees links.

pub mod memory;
pub mod tcp;

use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::memory_pair;
pub use tcp::{TcpAcceptor, MAX_FRAME_SIZE};

// ============================================================================
// Frame Channel Types
// ============================================================================

/// Sending half of a frame queue.
pub type FrameTx = mpsc::Sender<Vec<u8>>;

/// Receiving half of a frame queue.
pub type FrameRx = mpsc::Receiver<Vec<u8>>;

/// Create a frame channel with the given buffer size.
pub fn frame_channel(buffer: usize) -> (FrameTx, FrameRx) {
    mpsc::channel(buffer.max(1))
}

// ============================================================================
// Identifiers
// ============================================================================

/// Locally unique identifier of one connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Create a new connection ID.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn:{}", self.0)
    }
}

/// Direction of link establishment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkDirection {
    /// We initiated the connection.
    Outbound,
    /// They initiated the connection.
    Inbound,
}

impl fmt::Display for LinkDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkDirection::Outbound => "outbound",
            LinkDirection::Inbound => "inbound",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors related to transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    #[error("frame too large: {size} > {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("link closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Link
// ============================================================================

/// A connected frame pipe to one remote instance.
pub struct Link {
    /// Outbound frame queue.
    pub tx: FrameTx,
    /// Inbound frames, in arrival order.
    pub rx: FrameRx,
    /// Who initiated the link.
    pub direction: LinkDirection,
    /// Remote address for logging, if the transport has one.
    pub remote_addr: Option<String>,
}

impl Link {
    /// Assemble a link from its parts.
    pub fn new(tx: FrameTx, rx: FrameRx, direction: LinkDirection) -> Self {
        Self {
            tx,
            rx,
            direction,
            remote_addr: None,
        }
    }

    /// Attach a remote address.
    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    /// Remote address, or `"-"` when unknown.
    pub fn remote_label(&self) -> &str {
        self.remote_addr.as_deref().unwrap_or("-")
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("direction", &self.direction)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}
