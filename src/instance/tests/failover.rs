//! Upstream server selection and failover with in-memory dialing.

use super::*;
use crate::config::FailoverPolicy;
use crate::protocol::DisconnectReason;

fn server_with_iid(iid: u32) -> Arc<Instance> {
    let mut config = server_config();
    config.node.identity.server_iid = Iid::new(iid);
    start_config(config)
}

fn agent_with_servers(policy: FailoverPolicy) -> Arc<Instance> {
    let mut config = client_config(InstanceRole::Agent);
    config.servers = vec![ServerConfig::new("mem-a"), ServerConfig::new("mem-b")];
    config.failover = policy;
    start_config(config)
}

fn upstream_iid(agent: &Instance) -> Option<Iid> {
    let conn = agent.upstream()?;
    agent.registry().get(conn).map(|c| c.remote_iid())
}

#[tokio::test]
async fn test_connects_to_preferred_server() {
    let a = server_with_iid(5);
    let b = server_with_iid(6);
    let dialer = Arc::new(MemoryDialer::default());
    dialer.add("mem-a", &a);
    dialer.add("mem-b", &b);

    let agent = agent_with_servers(FailoverPolicy::Ordered);
    agent.start_upstream(dialer).unwrap();

    assert!(wait_for(|| agent.is_connected()).await);
    assert_eq!(upstream_iid(&agent), Some(Iid::new(5)));
    assert!(agent.ping(Iid::new(5)).await.is_ok());
    assert_eq!(b.connection_count(), 0);
}

#[tokio::test]
async fn test_skips_unreachable_server() {
    let b = server_with_iid(6);
    let dialer = Arc::new(MemoryDialer::default());
    dialer.add("mem-b", &b);

    let agent = agent_with_servers(FailoverPolicy::Ordered);
    agent.start_upstream(dialer).unwrap();

    assert!(wait_for(|| upstream_iid(&agent) == Some(Iid::new(6))).await);
    assert_eq!(b.connection_count(), 1);
}

#[tokio::test]
async fn test_fails_over_when_server_stops() {
    let a = server_with_iid(5);
    let b = server_with_iid(6);
    let dialer = Arc::new(MemoryDialer::default());
    dialer.add("mem-a", &a);
    dialer.add("mem-b", &b);

    let agent = agent_with_servers(FailoverPolicy::Ordered);
    agent.start_upstream(dialer).unwrap();
    assert!(wait_for(|| upstream_iid(&agent) == Some(Iid::new(5))).await);
    let assigned = agent.local_iid();

    a.shutdown().await;

    assert!(wait_for(|| upstream_iid(&agent) == Some(Iid::new(6))).await);
    assert!(agent.ping(Iid::new(6)).await.is_ok());
    // The hint carries the identity over to the new server.
    assert_eq!(agent.local_iid(), assigned);
}

#[tokio::test]
async fn test_ordered_returns_to_preferred_server() {
    let a = server_with_iid(5);
    let b = server_with_iid(6);
    let dialer = Arc::new(MemoryDialer::default());
    dialer.add("mem-b", &b);

    let agent = agent_with_servers(FailoverPolicy::Ordered);
    agent.start_upstream(dialer.clone()).unwrap();
    assert!(wait_for(|| upstream_iid(&agent) == Some(Iid::new(6))).await);

    dialer.add("mem-a", &a);
    let conn = b.registry().lookup(agent.local_iid()).unwrap().id();
    b.disconnect(conn, DisconnectReason::Failover);

    assert!(wait_for(|| upstream_iid(&agent) == Some(Iid::new(5))).await);
}

#[tokio::test]
async fn test_sticky_keeps_last_server() {
    let a = server_with_iid(5);
    let b = server_with_iid(6);
    let dialer = Arc::new(MemoryDialer::default());
    dialer.add("mem-b", &b);

    let agent = agent_with_servers(FailoverPolicy::Sticky);
    agent.start_upstream(dialer.clone()).unwrap();
    assert!(wait_for(|| upstream_iid(&agent) == Some(Iid::new(6))).await);

    dialer.add("mem-a", &a);
    let conn = b.registry().lookup(agent.local_iid()).unwrap().id();
    b.disconnect(conn, DisconnectReason::Failover);

    assert!(wait_for(|| upstream_iid(&agent) == Some(Iid::new(6))).await);
    assert_eq!(a.connection_count(), 0);
}

#[tokio::test]
async fn test_upstream_requires_servers_and_running() {
    let lone = start_config(client_config(InstanceRole::Agent));
    let dialer = Arc::new(MemoryDialer::default());
    assert!(matches!(
        lone.start_upstream(dialer.clone()),
        Err(InstanceError::NoServers)
    ));

    let mut config = client_config(InstanceRole::Agent);
    config.servers = vec![ServerConfig::new("mem-a")];
    let idle = Instance::builder(config).build().unwrap();
    assert!(matches!(
        idle.start_upstream(dialer),
        Err(InstanceError::NotRunning)
    ));
}

#[tokio::test]
async fn test_shutdown_stops_upstream_loop() {
    let a = server_with_iid(5);
    let dialer = Arc::new(MemoryDialer::default());
    dialer.add("mem-a", &a);

    let agent = agent_with_servers(FailoverPolicy::Ordered);
    agent.start_upstream(dialer).unwrap();
    assert!(wait_for(|| agent.is_connected()).await);

    agent.shutdown().await;
    assert_eq!(agent.state(), InstanceState::Stopped);
    assert!(!agent.is_connected());
    assert!(wait_for(|| a.connection_count() == 0).await);
}

#[tokio::test]
async fn test_tcp_upstream() {
    let server = start_config(server_config());
    let addr = server.listen("127.0.0.1:0").await.unwrap();

    let mut config = client_config(InstanceRole::Agent);
    config.servers = vec![ServerConfig::new(addr.to_string()).with_alias("local")];
    let agent = start_config(config);
    agent.start_upstream(Arc::new(TcpDialer::new(64))).unwrap();

    assert!(wait_for(|| agent.is_connected()).await);
    assert_eq!(agent.local_iid(), Iid::new(1000));
    assert!(agent.ping(SERVER).await.is_ok());

    agent.shutdown().await;
    server.shutdown().await;
}
