//! Fabric Configuration System
//!
//! Loads configuration from YAML files with a cascading priority system:
//! 1. `./fabric.yaml` (current directory - highest priority)
//! 2. `~/.fabric.yaml` (home directory)
//! 3. `~/.config/fabric/fabric.yaml` (user config directory)
//! 4. `/etc/fabric/fabric.yaml` (system - lowest priority)
//!
//! Values from higher priority files override those from lower priority files.
//!
//! # YAML Structure
//!
//! ```yaml
//! node:
//!   role: agent
//!   identity:
//!     iid_file: /var/lib/fabric/iid
//!     credential: "s3cret"
//! servers:
//!   - address: "10.0.0.1:8768"
//!     alias: primary
//!   - address: "10.0.0.2:8768"
//! failover: sticky
//! ```

mod node;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use node::{
    AuthConfig, DispatchConfig, IdentityConfig, LimitsConfig, LivenessConfig, NodeConfig,
    RetryConfig, RoutingConfig, StateConfig,
};

/// Default config filename.
const CONFIG_FILENAME: &str = "fabric.yaml";

/// Default listening port of the server role.
pub const DEFAULT_PORT: u16 = 8768;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// An upstream server (`servers[]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Transport address, `host:port`.
    pub address: String,
    /// Human-readable name for logs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl ServerConfig {
    /// Create a server entry.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            alias: None,
        }
    }

    /// Set the alias.
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Alias if set, otherwise the address.
    pub fn display_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.address)
    }
}

/// How the connection loop walks the server list after a failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverPolicy {
    /// Always restart from the first (preferred) server.
    #[default]
    Ordered,
    /// Keep the server that last worked; rotate only on failure.
    Sticky,
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Node configuration (`node.*`).
    #[serde(default)]
    pub node: NodeConfig,

    /// Upstream servers in preference order (`servers`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<ServerConfig>,

    /// Server list traversal policy (`failover`).
    #[serde(default)]
    pub failover: FailoverPolicy,

    /// Bind address for accepting connections (`listen`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,
}

impl Config {
    /// Create a new empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from the standard search paths.
    ///
    /// Returns a tuple of (config, paths_loaded) where paths_loaded contains
    /// the paths that were successfully loaded.
    pub fn load() -> Result<(Self, Vec<PathBuf>), ConfigError> {
        let search_paths = Self::search_paths();
        Self::load_from_paths(&search_paths)
    }

    /// Load configuration from specific paths.
    ///
    /// Paths are processed in order, with later paths overriding earlier ones.
    pub fn load_from_paths(paths: &[PathBuf]) -> Result<(Self, Vec<PathBuf>), ConfigError> {
        let mut config = Config::default();
        let mut loaded_paths = Vec::new();

        for path in paths {
            if path.exists() {
                let file_config = Self::load_file(path)?;
                config.merge(file_config);
                loaded_paths.push(path.clone());
            }
        }

        Ok((config, loaded_paths))
    }

    /// Load configuration from a single file.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        serde_yaml::from_str(&contents).map_err(|e| ConfigError::ParseYaml {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Get the standard search paths in priority order (lowest to highest).
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        // System config (lowest priority)
        paths.push(PathBuf::from("/etc/fabric").join(CONFIG_FILENAME));

        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("fabric").join(CONFIG_FILENAME));
        }

        if let Some(home_dir) = dirs::home_dir() {
            paths.push(home_dir.join(".fabric.yaml"));
        }

        // Current directory (highest priority)
        paths.push(PathBuf::from(".").join(CONFIG_FILENAME));

        paths
    }

    /// Merge another configuration into this one.
    ///
    /// Values from `other` override values in `self` when present.
    pub fn merge(&mut self, other: Config) {
        self.node.merge(other.node);
        if !other.servers.is_empty() {
            self.servers = other.servers;
        }
        if other.failover != FailoverPolicy::default() {
            self.failover = other.failover;
        }
        if other.listen.is_some() {
            self.listen = other.listen;
        }
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.identity.server_iid.is_unset() {
            return Err(ConfigError::Invalid("node.identity.server_iid must be non-zero".into()));
        }
        if self.node.routing.default_ttl == 0 {
            return Err(ConfigError::Invalid("node.routing.default_ttl must be non-zero".into()));
        }
        if self.node.routing.event_stall_secs == 0 {
            return Err(ConfigError::Invalid(
                "node.routing.event_stall_secs must be non-zero".into(),
            ));
        }
        if self.node.limits.outbound_queue == 0 {
            return Err(ConfigError::Invalid("node.limits.outbound_queue must be non-zero".into()));
        }
        if self.node.dispatch.max_concurrent_handlers == 0 {
            return Err(ConfigError::Invalid(
                "node.dispatch.max_concurrent_handlers must be non-zero".into(),
            ));
        }
        if self.node.liveness.timeout_secs <= self.node.liveness.heartbeat_interval_secs {
            return Err(ConfigError::Invalid(
                "node.liveness.timeout_secs must exceed heartbeat_interval_secs".into(),
            ));
        }
        Ok(())
    }

    /// The preferred server, if any.
    pub fn preferred_server(&self) -> Option<&ServerConfig> {
        self.servers.first()
    }

    /// Serialize this configuration to YAML.
    ///
    /// This is the form consumed when packaging an agent.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}
