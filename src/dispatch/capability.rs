//! Capability Registry
//!
//! Maps message types to handlers. Populated while the instance is being
//! built; afterwards it is shared behind an `Arc` and never mutated.

use crate::identity::Iid;
use crate::protocol::{MessageType, ProtocolError};
use crate::state::StateError;
use crate::transport::ConnectionId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// Errors a handler may return; reported to the caller as a handler failure.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("malformed payload: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("{0}")]
    Failed(String),
}

/// What a handler knows about the request it is serving.
#[derive(Clone, Debug)]
pub struct RequestContext {
    /// Originating instance.
    pub source: Iid,
    /// This instance.
    pub local: Iid,
    /// Correlation id of the request.
    pub request_id: u32,
    /// Message type being served.
    pub msg_type: MessageType,
    /// Whether the originator is authenticated along the whole path.
    pub authenticated: bool,
    /// Adjacent connection the request arrived on; `None` if local.
    pub ingress: Option<ConnectionId>,
}

/// A handler's successful result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub msg_type: MessageType,
    pub payload: Vec<u8>,
}

impl Reply {
    pub fn new(msg_type: MessageType, payload: Vec<u8>) -> Self {
        Self { msg_type, payload }
    }

    /// A reply without payload.
    pub fn empty(msg_type: MessageType) -> Self {
        Self::new(msg_type, Vec::new())
    }
}

/// A request handler.
///
/// Handlers run on the blocking worker pool and may block.
pub trait Capability: Send + Sync {
    fn handle(&self, ctx: &RequestContext, payload: &[u8]) -> Result<Reply, HandlerError>;
}

impl<F> Capability for F
where
    F: Fn(&RequestContext, &[u8]) -> Result<Reply, HandlerError> + Send + Sync,
{
    fn handle(&self, ctx: &RequestContext, payload: &[u8]) -> Result<Reply, HandlerError> {
        self(ctx, payload)
    }
}

/// A registered handler and its access policy.
#[derive(Clone)]
pub struct HandlerDescriptor {
    /// Name for logs.
    pub name: String,
    /// The handler.
    pub handler: Arc<dyn Capability>,
    /// Reject requests whose originator is not authenticated.
    pub requires_auth: bool,
}

impl HandlerDescriptor {
    /// Describe an open handler.
    pub fn new(name: impl Into<String>, handler: impl Capability + 'static) -> Self {
        Self {
            name: name.into(),
            handler: Arc::new(handler),
            requires_auth: false,
        }
    }

    /// Require an authenticated originator.
    pub fn requires_auth(mut self) -> Self {
        self.requires_auth = true;
        self
    }
}

impl fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("name", &self.name)
            .field("requires_auth", &self.requires_auth)
            .finish()
    }
}

/// Message type to handler map.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    handlers: HashMap<MessageType, HandlerDescriptor>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; a later registration for the same type wins.
    pub fn register(&mut self, msg_type: MessageType, descriptor: HandlerDescriptor) {
        if let Some(previous) = self.handlers.get(&msg_type) {
            warn!(
                msg_type = %msg_type,
                previous = %previous.name,
                replacement = %descriptor.name,
                "Capability re-registered, overwriting"
            );
        }
        self.handlers.insert(msg_type, descriptor);
    }

    pub fn lookup(&self, msg_type: MessageType) -> Option<&HandlerDescriptor> {
        self.handlers.get(&msg_type)
    }

    pub fn contains(&self, msg_type: MessageType) -> bool {
        self.handlers.contains_key(&msg_type)
    }

    /// Registered message types in ascending order.
    pub fn message_types(&self) -> Vec<MessageType> {
        let mut types: Vec<_> = self.handlers.keys().copied().collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
