//! Connections
//!
//! A [`Connection`] is one transport link to a directly adjacent instance.
//! It starts in the handshake phase, becomes established once the
//! [`ConnectionRegistry`] accepts its identity, and is closed exactly once.

mod registry;

pub use registry::{ConnectionObserver, ConnectionRegistry, Registration};

use crate::identity::{IdentityError, Iid, InstanceRole};
use crate::transport::{ConnectionId, FrameTx, LinkDirection};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;

/// Errors related to connection registration and sending.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("IID {0} is held by another connection")]
    IdentityConflict(Iid),

    #[error("IID {iid} is not valid for role {role}")]
    InvalidIdentity { iid: Iid, role: InstanceRole },

    #[error("connection limit reached ({0})")]
    Full(usize),

    #[error("{conn} is {phase}, expected {expected}")]
    InvalidPhase {
        conn: ConnectionId,
        phase: ConnectionPhase,
        expected: ConnectionPhase,
    },

    #[error("only the server role assigns identities")]
    NotAuthority,

    #[error("connection {0} not found")]
    NotFound(ConnectionId),

    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),
}

/// Why a frame could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("outbound queue full")]
    QueueFull,

    #[error("connection closed")]
    Closed,
}

/// Connection lifecycle phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Link up, identity not yet agreed.
    Handshaking,
    /// Registered and addressable.
    Established,
    /// Torn down; never reused.
    Closed,
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionPhase::Handshaking => "handshaking",
            ConnectionPhase::Established => "established",
            ConnectionPhase::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

/// Mutable per-connection state, guarded by one mutex.
#[derive(Debug)]
struct ConnectionState {
    phase: ConnectionPhase,
    remote_iid: Iid,
    remote_role: Option<InstanceRole>,
    authenticated: bool,
    fingerprint: Option<String>,
    last_recv: Instant,
}

/// One link to an adjacent instance.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    direction: LinkDirection,
    remote_addr: Option<String>,
    outbound: FrameTx,
    opened_at: Instant,
    state: Mutex<ConnectionState>,
}

impl Connection {
    /// Create a connection in the handshake phase.
    pub fn new(
        id: ConnectionId,
        direction: LinkDirection,
        outbound: FrameTx,
        remote_addr: Option<String>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            direction,
            remote_addr,
            outbound,
            opened_at: now,
            state: Mutex::new(ConnectionState {
                phase: ConnectionPhase::Handshaking,
                remote_iid: Iid::UNSET,
                remote_role: None,
                authenticated: false,
                fingerprint: None,
                last_recv: now,
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn direction(&self) -> LinkDirection {
        self.direction
    }

    pub fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.state.lock().phase
    }

    pub fn is_established(&self) -> bool {
        self.phase() == ConnectionPhase::Established
    }

    pub fn is_closed(&self) -> bool {
        self.phase() == ConnectionPhase::Closed
    }

    /// Remote IID; unset until the handshake completes.
    pub fn remote_iid(&self) -> Iid {
        self.state.lock().remote_iid
    }

    pub fn remote_role(&self) -> Option<InstanceRole> {
        self.state.lock().remote_role
    }

    /// Whether the remote presented an accepted credential.
    pub fn is_authenticated(&self) -> bool {
        self.state.lock().authenticated
    }

    /// Hex SHA-256 of the credential the remote presented.
    pub fn fingerprint(&self) -> Option<String> {
        self.state.lock().fingerprint.clone()
    }

    /// Record the credential outcome of the handshake.
    ///
    /// Only the fingerprint is kept, never the credential itself.
    pub fn set_credential(&self, credential: Option<&str>, accepted: bool) {
        let mut state = self.state.lock();
        state.fingerprint = credential.map(fingerprint);
        state.authenticated = accepted;
    }

    /// Record inbound activity.
    pub fn touch(&self) {
        self.state.lock().last_recv = Instant::now();
    }

    /// Time since the last inbound frame.
    pub fn idle_for(&self) -> Duration {
        self.state.lock().last_recv.elapsed()
    }

    /// Time since the link came up.
    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    /// Queue a frame without waiting.
    ///
    /// A full queue fails immediately so that callers never block on a
    /// slow peer.
    pub fn send(&self, frame: Vec<u8>) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        self.outbound.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => SendError::QueueFull,
            TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Queue a frame, waiting for room in the outbound queue.
    ///
    /// Used for stream events, which must not be dropped. Callers bound
    /// the wait themselves.
    pub async fn send_wait(&self, frame: Vec<u8>) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        self.outbound
            .send(frame)
            .await
            .map_err(|_| SendError::Closed)
    }

    /// Move to established with the agreed identity.
    fn establish(&self, iid: Iid, role: InstanceRole) -> Result<(), RegistryError> {
        let mut state = self.state.lock();
        if state.phase != ConnectionPhase::Handshaking {
            return Err(RegistryError::InvalidPhase {
                conn: self.id,
                phase: state.phase,
                expected: ConnectionPhase::Handshaking,
            });
        }
        state.phase = ConnectionPhase::Established;
        state.remote_iid = iid;
        state.remote_role = Some(role);
        Ok(())
    }

    /// Mark closed, returning false if it already was.
    fn close(&self) -> bool {
        let mut state = self.state.lock();
        if state.phase == ConnectionPhase::Closed {
            return false;
        }
        state.phase = ConnectionPhase::Closed;
        true
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        match state.remote_role {
            Some(role) => write!(f, "{} ({} {})", self.id, role, state.remote_iid),
            None => write!(f, "{} ({})", self.id, state.phase),
        }
    }
}

/// Hex SHA-256 of a credential.
pub fn fingerprint(credential: &str) -> String {
    hex::encode(Sha256::digest(credential.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::frame_channel;

    fn make_connection(queue: usize) -> (Connection, crate::transport::FrameRx) {
        let (tx, rx) = frame_channel(queue);
        (
            Connection::new(ConnectionId::new(1), LinkDirection::Inbound, tx, None),
            rx,
        )
    }

    #[test]
    fn test_lifecycle() {
        let (conn, _rx) = make_connection(4);
        assert_eq!(conn.phase(), ConnectionPhase::Handshaking);
        assert!(conn.remote_iid().is_unset());

        conn.establish(Iid::new(1000), InstanceRole::Agent).unwrap();
        assert!(conn.is_established());
        assert_eq!(conn.remote_role(), Some(InstanceRole::Agent));
        assert!(conn.establish(Iid::new(1001), InstanceRole::Agent).is_err());

        assert!(conn.close());
        assert!(!conn.close());
        assert_eq!(conn.send(vec![1]), Err(SendError::Closed));
    }

    #[test]
    fn test_send_fails_fast_when_full() {
        let (conn, mut rx) = make_connection(1);
        conn.send(vec![1]).unwrap();
        assert_eq!(conn.send(vec![2]), Err(SendError::QueueFull));
        assert_eq!(rx.try_recv().unwrap(), vec![1]);
        conn.send(vec![3]).unwrap();
        drop(rx);
        assert_eq!(conn.send(vec![4]), Err(SendError::Closed));
    }

    #[tokio::test]
    async fn test_send_wait_holds_until_room() {
        let (conn, mut rx) = make_connection(1);
        let conn = std::sync::Arc::new(conn);
        conn.send(vec![1]).unwrap();

        let waiting = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.send_wait(vec![2]).await })
        };
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());

        assert_eq!(rx.recv().await, Some(vec![1]));
        waiting.await.unwrap().unwrap();
        assert_eq!(rx.recv().await, Some(vec![2]));

        drop(rx);
        assert_eq!(conn.send_wait(vec![3]).await, Err(SendError::Closed));
    }

    #[test]
    fn test_credential_stored_as_fingerprint() {
        let (conn, _rx) = make_connection(1);
        conn.set_credential(Some("s3cret"), true);
        let fp = conn.fingerprint().unwrap();
        assert_eq!(fp.len(), 64);
        assert_ne!(fp, "s3cret");
        assert_eq!(fp, fingerprint("s3cret"));
        assert!(conn.is_authenticated());
    }
}
