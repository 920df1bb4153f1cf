use super::*;
use crate::config::{Config, ServerConfig};
use crate::identity::InstanceRole;
use crate::transport::{memory_pair, TransportError};
use std::collections::HashMap;
use std::sync::Weak;

mod failover;
mod liveness;

pub(super) const SERVER: Iid = Iid::new(5);

pub(super) fn server_config() -> Config {
    let mut config = Config::new();
    config.node.role = InstanceRole::Server;
    config
}

pub(super) fn client_config(role: InstanceRole) -> Config {
    let mut config = Config::new();
    config.node.role = role;
    config
}

/// Build and start an instance; servers hand out IIDs from 1000.
pub(super) fn start(builder: InstanceBuilder) -> Arc<Instance> {
    let instance = builder.allocator_seed(1000).build().unwrap();
    instance.start().unwrap();
    instance
}

pub(super) fn start_config(config: Config) -> Arc<Instance> {
    start(Instance::builder(config))
}

/// Connect `client` to `server` over an in-memory link.
pub(super) async fn join(server: &Arc<Instance>, client: &Arc<Instance>) -> ConnectionId {
    let (outbound, inbound) = memory_pair(64);
    server.accept(inbound);
    client.connect(outbound).await.unwrap()
}

/// Poll `cond` for up to two seconds.
pub(super) async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Dials in-process servers by configured address.
#[derive(Default)]
pub(super) struct MemoryDialer {
    servers: Mutex<HashMap<String, Weak<Instance>>>,
}

impl MemoryDialer {
    pub(super) fn add(&self, address: &str, server: &Arc<Instance>) {
        self.servers
            .lock()
            .insert(address.to_string(), Arc::downgrade(server));
    }
}

impl Dialer for MemoryDialer {
    fn dial<'a>(&'a self, server: &'a ServerConfig) -> DialFuture<'a> {
        Box::pin(async move {
            let target = self
                .servers
                .lock()
                .get(&server.address)
                .and_then(Weak::upgrade)
                .filter(|s| s.state().is_operational());
            let Some(target) = target else {
                return Err(TransportError::Connect {
                    addr: server.address.clone(),
                    source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "no server"),
                });
            };
            let (outbound, inbound) = memory_pair(64);
            target.accept(inbound);
            Ok(outbound)
        })
    }
}
