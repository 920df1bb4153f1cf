//! Fabric: instance network fabric
//!
//! Agents, servers and viewers joined by links. Servers assign instance
//! identities, route envelopes between the instances they know, and every
//! instance answers commands from a capability registry and publishes a
//! state tree that others can stream changes from.

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod identity;
pub mod instance;
pub mod plugin;
pub mod protocol;
pub mod router;
pub mod state;
pub mod stream;
pub mod transport;

// Re-export identity types
pub use identity::{IdentityError, Iid, IidAllocator, InstanceRole};

// Re-export config types
pub use config::{Config, ConfigError, FailoverPolicy, NodeConfig, ServerConfig};

// Re-export connection types
pub use connection::{Connection, ConnectionRegistry, RegistryError};

// Re-export protocol types
pub use protocol::{
    DisconnectReason, Envelope, EnvelopeKind, HandshakeStatus, LinkMessage, MessageType,
    ProtocolError, ResponseStatus,
};

// Re-export routing and dispatch types
pub use dispatch::{
    Capability, CapabilityRegistry, DispatchError, Dispatcher, HandlerDescriptor, HandlerError,
    Reply, RequestContext, Response, SendOptions,
};
pub use router::{RouteOutcome, Router};

// Re-export state and stream types
pub use state::{
    AttributeSnapshot, AttributeValue, ChangeEvent, ChangeKind, Oid, SchemaFragment, StateError,
    StateTree,
};
pub use stream::{StreamError, StreamManager, Subscription};

// Re-export transport types
pub use transport::{memory_pair, ConnectionId, Link, LinkDirection, TcpAcceptor, TransportError};

// Re-export instance types
pub use instance::{Dialer, Instance, InstanceBuilder, InstanceError, InstanceState, TcpDialer};
pub use plugin::Plugin;
