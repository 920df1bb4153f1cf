//! Instance construction.
//!
//! Every capability and schema fragment is registered here, before the
//! instance exists, so the capability registry is immutable by the time
//! the first connection is accepted.

use super::{handlers, Instance, InstanceError, InstanceState};
use crate::config::Config;
use crate::connection::{ConnectionObserver, ConnectionRegistry};
use crate::dispatch::{CapabilityRegistry, Dispatcher, EventSink, HandlerDescriptor};
use crate::identity::{load_iid, IidAllocator};
use crate::plugin::Plugin;
use crate::protocol::MessageType;
use crate::router::{LocalDelivery, Router};
use crate::state::StateTree;
use crate::stream::StreamManager;
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

/// Builder for [`Instance`].
pub struct InstanceBuilder {
    config: Config,
    plugins: Vec<Box<dyn Plugin>>,
    capabilities: Vec<(MessageType, HandlerDescriptor)>,
    allocator_seed: Option<u32>,
}

impl InstanceBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            plugins: Vec::new(),
            capabilities: Vec::new(),
            allocator_seed: None,
        }
    }

    /// Add a plugin.
    pub fn plugin(mut self, plugin: impl Plugin + 'static) -> Self {
        self.plugins.push(Box::new(plugin));
        self
    }

    /// Register a single capability. Registered after plugins, so it
    /// overrides a plugin's handler for the same type.
    pub fn capability(mut self, msg_type: MessageType, descriptor: HandlerDescriptor) -> Self {
        self.capabilities.push((msg_type, descriptor));
        self
    }

    /// Seed the IID counter (server role) instead of seeding it randomly.
    pub fn allocator_seed(mut self, seed: u32) -> Self {
        self.allocator_seed = Some(seed);
        self
    }

    /// Wire the components together.
    pub fn build(self) -> Result<Arc<Instance>, InstanceError> {
        let config = self.config;
        config.validate()?;
        let node = &config.node;
        let role = node.role;

        let tree = Arc::new(StateTree::with_history_limit(node.state.history_limit));
        let allocator = match self.allocator_seed {
            Some(seed) => IidAllocator::with_seed(node.identity.server_iid, seed),
            None => IidAllocator::new(node.identity.server_iid),
        };
        let registry = Arc::new(ConnectionRegistry::with_allocator(
            role,
            allocator,
            node.limits.max_connections,
        ));
        let router = Arc::new(Router::new(registry.clone(), node.routing.clone()));
        let streams = Arc::new(StreamManager::new(tree.clone(), router.clone()));

        let mut capabilities = CapabilityRegistry::new();
        for (msg_type, descriptor) in handlers::core_capabilities(&streams) {
            capabilities.register(msg_type, descriptor);
        }
        for plugin in &self.plugins {
            if let Some(fragment) = plugin.schema() {
                tree.register_schema(&fragment)?;
            }
            let contributed = plugin.capabilities();
            debug!(
                plugin = plugin.name(),
                capabilities = contributed.len(),
                "Registering plugin"
            );
            for (msg_type, descriptor) in contributed {
                capabilities.register(msg_type, descriptor);
            }
        }
        for (msg_type, descriptor) in self.capabilities {
            capabilities.register(msg_type, descriptor);
        }
        let capability_count = capabilities.len();

        let dispatcher = Arc::new(Dispatcher::new(
            router.clone(),
            Arc::new(capabilities),
            node.dispatch.default_timeout(),
            node.dispatch.max_concurrent_handlers,
        ));

        router.set_local_delivery(Arc::downgrade(&dispatcher) as Weak<dyn LocalDelivery>);
        dispatcher.set_event_sink(Arc::downgrade(&streams) as Weak<dyn EventSink>);
        registry.add_observer(Arc::downgrade(&router) as Weak<dyn ConnectionObserver>);
        registry.add_observer(Arc::downgrade(&dispatcher) as Weak<dyn ConnectionObserver>);
        registry.add_observer(Arc::downgrade(&streams) as Weak<dyn ConnectionObserver>);

        let iid_hint = match (&node.identity.iid_file, role.is_authority()) {
            (Some(path), false) => match load_iid(path) {
                Ok(hint) => hint,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring unreadable IID file");
                    None
                }
            },
            _ => None,
        };

        info!(
            role = %role,
            iid = %registry.local_iid(),
            iid_hint = ?iid_hint,
            capabilities = capability_count,
            plugins = self.plugins.len(),
            "Instance built"
        );

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Arc::new(Instance {
            config,
            registry,
            router,
            dispatcher,
            streams,
            tree,
            iid_hint: Mutex::new(iid_hint),
            state: RwLock::new(InstanceState::Created),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            upstream: RwLock::new(None),
            conn_closed: Notify::new(),
        }))
    }
}
