//! Node configuration subsections.
//!
//! All the `node.*` configuration parameters: identity, resource limits,
//! dispatch, routing, liveness, retry/backoff, authentication and state.

use crate::identity::{Iid, InstanceRole};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// Node Configuration Subsections
// ============================================================================

/// Identity configuration (`node.identity.*`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// IID of the server role (`node.identity.server_iid`).
    #[serde(default = "IdentityConfig::default_server_iid")]
    pub server_iid: Iid,
    /// File persisting the assigned IID across restarts (`node.identity.iid_file`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iid_file: Option<PathBuf>,
    /// Credential presented at handshake (`node.identity.credential`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            server_iid: Self::default_server_iid(),
            iid_file: None,
            credential: None,
        }
    }
}

impl IdentityConfig {
    fn default_server_iid() -> Iid { Iid::new(5) }
}

/// Resource limits (`node.limits.*`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Max established connections (`node.limits.max_connections`).
    #[serde(default = "LimitsConfig::default_max_connections")]
    pub max_connections: usize,
    /// Outbound frame queue depth per connection (`node.limits.outbound_queue`).
    #[serde(default = "LimitsConfig::default_outbound_queue")]
    pub outbound_queue: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 1024,
            outbound_queue: 1024,
        }
    }
}

impl LimitsConfig {
    fn default_max_connections() -> usize { 1024 }
    fn default_outbound_queue() -> usize { 1024 }
}

/// Command dispatch (`node.dispatch.*`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Default request timeout in milliseconds (`node.dispatch.default_timeout_ms`).
    #[serde(default = "DispatchConfig::default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Handlers running at once (`node.dispatch.max_concurrent_handlers`).
    #[serde(default = "DispatchConfig::default_max_concurrent_handlers")]
    pub max_concurrent_handlers: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 10_000,
            max_concurrent_handlers: 32,
        }
    }
}

impl DispatchConfig {
    fn default_timeout_ms() -> u64 { 10_000 }
    fn default_max_concurrent_handlers() -> usize { 32 }

    /// The default request timeout.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// Multi-hop routing (`node.routing.*`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// TTL stamped on locally originated envelopes (`node.routing.default_ttl`).
    #[serde(default = "RoutingConfig::default_ttl")]
    pub default_ttl: u8,
    /// Advertised routes at or beyond this hop count are ignored (`node.routing.max_hops`).
    #[serde(default = "RoutingConfig::default_max_hops")]
    pub max_hops: u8,
    /// Relayed requests older than this are forgotten (`node.routing.relay_expiry_secs`).
    #[serde(default = "RoutingConfig::default_relay_expiry_secs")]
    pub relay_expiry_secs: u64,
    /// A stream event waiting this long for room on its next hop marks that
    /// connection stalled and closes it (`node.routing.event_stall_secs`).
    #[serde(default = "RoutingConfig::default_event_stall_secs")]
    pub event_stall_secs: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_ttl: 16,
            max_hops: 8,
            relay_expiry_secs: 120,
            event_stall_secs: 30,
        }
    }
}

impl RoutingConfig {
    fn default_ttl() -> u8 { 16 }
    fn default_max_hops() -> u8 { 8 }
    fn default_relay_expiry_secs() -> u64 { 120 }
    fn default_event_stall_secs() -> u64 { 30 }
}

/// Link liveness (`node.liveness.*`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessConfig {
    /// Heartbeat send interval in seconds (`node.liveness.heartbeat_interval_secs`).
    #[serde(default = "LivenessConfig::default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Silence after which a link is torn down (`node.liveness.timeout_secs`).
    #[serde(default = "LivenessConfig::default_timeout_secs")]
    pub timeout_secs: u64,
    /// Max time to complete a handshake (`node.liveness.handshake_timeout_secs`).
    #[serde(default = "LivenessConfig::default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 10,
            timeout_secs: 30,
            handshake_timeout_secs: 10,
        }
    }
}

impl LivenessConfig {
    fn default_heartbeat_interval_secs() -> u64 { 10 }
    fn default_timeout_secs() -> u64 { 30 }
    fn default_handshake_timeout_secs() -> u64 { 10 }
}

/// Retry/backoff configuration (`node.retry.*`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Max attempts per server before moving on (`node.retry.max_retries`).
    #[serde(default = "RetryConfig::default_max_retries")]
    pub max_retries: u32,
    /// Base backoff interval in seconds (`node.retry.base_interval_secs`).
    #[serde(default = "RetryConfig::default_base_interval_secs")]
    pub base_interval_secs: u64,
    /// Cap on exponential backoff in seconds (`node.retry.max_backoff_secs`).
    #[serde(default = "RetryConfig::default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_interval_secs: 2,
            max_backoff_secs: 300,
        }
    }
}

impl RetryConfig {
    fn default_max_retries() -> u32 { 3 }
    fn default_base_interval_secs() -> u64 { 2 }
    fn default_max_backoff_secs() -> u64 { 300 }
}

/// Handshake authentication (`node.auth.*`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Credentials accepted from dialing peers (`node.auth.credentials`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub credentials: Vec<String>,
}

/// State tree (`node.state.*`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateConfig {
    /// Previous values retained per attribute (`node.state.history_limit`).
    #[serde(default)]
    pub history_limit: usize,
}

// ============================================================================
// Node Configuration (Root)
// ============================================================================

/// Node configuration (`node.*`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Instance role (`node.role`).
    #[serde(default)]
    pub role: InstanceRole,

    /// Identity configuration (`node.identity.*`).
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Maintenance tick period in seconds (`node.tick_interval_secs`).
    #[serde(default = "NodeConfig::default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    /// Resource limits (`node.limits.*`).
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Command dispatch (`node.dispatch.*`).
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Routing (`node.routing.*`).
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Liveness (`node.liveness.*`).
    #[serde(default)]
    pub liveness: LivenessConfig,

    /// Retry/backoff (`node.retry.*`).
    #[serde(default)]
    pub retry: RetryConfig,

    /// Authentication (`node.auth.*`).
    #[serde(default)]
    pub auth: AuthConfig,

    /// State tree (`node.state.*`).
    #[serde(default)]
    pub state: StateConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            role: InstanceRole::default(),
            identity: IdentityConfig::default(),
            tick_interval_secs: Self::default_tick_interval_secs(),
            limits: LimitsConfig::default(),
            dispatch: DispatchConfig::default(),
            routing: RoutingConfig::default(),
            liveness: LivenessConfig::default(),
            retry: RetryConfig::default(),
            auth: AuthConfig::default(),
            state: StateConfig::default(),
        }
    }
}

impl NodeConfig {
    fn default_tick_interval_secs() -> u64 { 1 }

    /// Merge another node configuration into this one.
    ///
    /// Sections of `other` that differ from their defaults override.
    pub(crate) fn merge(&mut self, other: NodeConfig) {
        let defaults = NodeConfig::default();
        if other.role != defaults.role {
            self.role = other.role;
        }
        if other.identity.server_iid != defaults.identity.server_iid {
            self.identity.server_iid = other.identity.server_iid;
        }
        if other.identity.iid_file.is_some() {
            self.identity.iid_file = other.identity.iid_file;
        }
        if other.identity.credential.is_some() {
            self.identity.credential = other.identity.credential;
        }
        if other.tick_interval_secs != defaults.tick_interval_secs {
            self.tick_interval_secs = other.tick_interval_secs;
        }
        if other.limits != defaults.limits {
            self.limits = other.limits;
        }
        if other.dispatch != defaults.dispatch {
            self.dispatch = other.dispatch;
        }
        if other.routing != defaults.routing {
            self.routing = other.routing;
        }
        if other.liveness != defaults.liveness {
            self.liveness = other.liveness;
        }
        if other.retry != defaults.retry {
            self.retry = other.retry;
        }
        if !other.auth.credentials.is_empty() {
            self.auth = other.auth;
        }
        if other.state != defaults.state {
            self.state = other.state;
        }
    }
}
