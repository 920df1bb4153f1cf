//! Instance Runtime
//!
//! An [`Instance`] is one running agent, server or viewer. It owns one of
//! each component (registry, router, dispatcher, stream manager, state
//! tree) and the tasks that move frames between them and the transport:
//! one reader task per connection, an accept loop when listening, a
//! maintenance tick, and for agents and viewers the upstream loop that
//! keeps a server connection alive.

mod builder;
mod handlers;
mod handshake;
mod lifecycle;
mod retry;
#[cfg(test)]
mod tests;

pub use builder::InstanceBuilder;
pub use retry::{DialFuture, Dialer, ServerSelector, TcpDialer};

use crate::config::{Config, ConfigError};
use crate::connection::{ConnectionRegistry, RegistryError};
use crate::dispatch::{DispatchError, Dispatcher, Response, SendOptions};
use crate::identity::{IdentityError, Iid, InstanceRole};
use crate::protocol::{
    HandshakeStatus, MessageType, ProtocolError, SnapshotRequest, StateValue, Subtree,
};
use crate::router::Router;
use crate::state::{AttributeSnapshot, Oid, StateError, StateTree};
use crate::stream::{StreamError, StreamManager, Subscription};
use crate::transport::{ConnectionId, TransportError};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

/// Errors related to instance operations.
#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("instance not running")]
    NotRunning,

    #[error("instance already started")]
    AlreadyStarted,

    #[error("handshake rejected: {0}")]
    HandshakeRejected(HandshakeStatus),

    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("link closed during handshake")]
    LinkClosed,

    #[error("unexpected {0} frame during handshake")]
    UnexpectedFrame(String),

    #[error("no servers configured")]
    NoServers,

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("stream error: {0}")]
    Stream(#[from] StreamError),
}

/// Instance operational state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceState {
    /// Built but not started.
    Created,
    /// Fully operational.
    Running,
    /// Shutting down.
    Stopping,
    /// Stopped.
    Stopped,
}

impl InstanceState {
    /// Check if the instance is operational.
    pub fn is_operational(&self) -> bool {
        matches!(self, InstanceState::Running)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceState::Created => "created",
            InstanceState::Running => "running",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// A running fabric instance.
pub struct Instance {
    // === Configuration ===
    config: Config,

    // === Components ===
    registry: Arc<ConnectionRegistry>,
    router: Arc<Router>,
    dispatcher: Arc<Dispatcher>,
    streams: Arc<StreamManager>,
    tree: Arc<StateTree>,

    // === Identity ===
    /// IID to ask for at the next handshake (persisted or last assigned).
    iid_hint: Mutex<Option<Iid>>,

    // === Runtime ===
    state: RwLock<InstanceState>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Connection to the current upstream server.
    upstream: RwLock<Option<ConnectionId>>,
    /// Signalled whenever a connection task ends.
    conn_closed: Notify,
}

impl Instance {
    /// Start building an instance from a configuration.
    pub fn builder(config: Config) -> InstanceBuilder {
        InstanceBuilder::new(config)
    }

    // === Accessors ===

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn role(&self) -> InstanceRole {
        self.registry.local_role()
    }

    /// This instance's IID; unset for agents and viewers until a server
    /// has assigned one.
    pub fn local_iid(&self) -> Iid {
        self.registry.local_iid()
    }

    pub fn state(&self) -> InstanceState {
        *self.state.read()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn streams(&self) -> &Arc<StreamManager> {
        &self.streams
    }

    pub fn tree(&self) -> &Arc<StateTree> {
        &self.tree
    }

    /// Established connections.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Connection to the upstream server, if any.
    pub fn upstream(&self) -> Option<ConnectionId> {
        *self.upstream.read()
    }

    /// Whether an upstream server connection is established.
    pub fn is_connected(&self) -> bool {
        self.upstream()
            .and_then(|id| self.registry.get(id))
            .is_some_and(|conn| conn.is_established())
    }

    // === Requests ===

    /// Send a request with explicit options.
    pub async fn send(
        &self,
        dest: Iid,
        msg_type: MessageType,
        payload: Vec<u8>,
        options: SendOptions,
    ) -> Result<Response, DispatchError> {
        self.dispatcher.send(dest, msg_type, payload, options).await
    }

    /// Send a request with default options.
    pub async fn request(
        &self,
        dest: Iid,
        msg_type: MessageType,
        payload: Vec<u8>,
    ) -> Result<Response, DispatchError> {
        self.send(dest, msg_type, payload, SendOptions::default()).await
    }

    /// Round-trip time of a PING to `dest`.
    pub async fn ping(&self, dest: Iid) -> Result<Duration, DispatchError> {
        let start = Instant::now();
        let nonce = rand::random::<u64>().to_le_bytes().to_vec();
        let response = self.request(dest, MessageType::PING, nonce.clone()).await?;
        if response.msg_type != MessageType::PONG || response.payload != nonce {
            return Err(DispatchError::HandlerFailed(format!(
                "unexpected ping reply {} from {}",
                response.msg_type, response.from
            )));
        }
        Ok(start.elapsed())
    }

    /// Read one attribute of a remote instance's tree.
    pub async fn get_remote(
        &self,
        dest: Iid,
        oid: &Oid,
    ) -> Result<Option<AttributeSnapshot>, InstanceError> {
        if !oid.is_valid_depth() {
            return Err(StateError::InvalidOid(oid.clone()).into());
        }
        let response = self
            .request(dest, MessageType::STATE_GET, oid.encode())
            .await?;
        Ok(StateValue::decode(&response.payload)?.snapshot)
    }

    /// Copy every attribute under `prefix` of a remote instance's tree.
    ///
    /// A non-empty `whitelist` narrows the copy to attributes at or beneath
    /// its OIDs, each of which must lie under `prefix`.
    pub async fn snapshot_remote(
        &self,
        dest: Iid,
        prefix: &Oid,
        whitelist: &[Oid],
    ) -> Result<Vec<(Oid, AttributeSnapshot)>, InstanceError> {
        if let Some(bad) = std::iter::once(prefix)
            .chain(whitelist)
            .find(|oid| !oid.is_valid_depth() || !oid.starts_with(prefix))
        {
            return Err(StateError::InvalidOid(bad.clone()).into());
        }
        let request = SnapshotRequest {
            prefix: prefix.clone(),
            whitelist: whitelist.to_vec(),
        };
        let response = self
            .request(dest, MessageType::STATE_SNAPSHOT, request.encode())
            .await?;
        Ok(Subtree::decode(&response.payload)?.entries)
    }

    // === Streams ===

    /// Subscribe to changes under `prefix` in `dest`'s tree.
    ///
    /// Subscribing to this instance taps the local tree directly.
    pub async fn subscribe(&self, dest: Iid, prefix: Oid) -> Result<Subscription, StreamError> {
        if dest == self.local_iid() {
            return self.subscribe_local(prefix);
        }
        Subscription::open(
            Arc::clone(&self.streams),
            Arc::clone(&self.dispatcher),
            dest,
            prefix,
            SendOptions::default(),
        )
        .await
    }

    /// Subscribe to changes under `prefix` in the local tree.
    pub fn subscribe_local(&self, prefix: Oid) -> Result<Subscription, StreamError> {
        Ok(Subscription::local(self.tree.listen(prefix)?))
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("role", &self.role())
            .field("iid", &self.local_iid())
            .field("state", &self.state())
            .field("connections", &self.connection_count())
            .finish()
    }
}
