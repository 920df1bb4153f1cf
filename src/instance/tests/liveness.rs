//! Heartbeats, liveness timeout and disconnect reasons.

use super::*;
use crate::protocol::{Disconnect, DisconnectReason, HandshakeAck, LinkMessage};

fn fast_liveness(mut config: Config) -> Config {
    config.node.liveness.heartbeat_interval_secs = 1;
    config.node.liveness.timeout_secs = 2;
    config
}

#[tokio::test]
async fn test_silent_server_times_out() {
    let agent = start_config(fast_liveness(client_config(InstanceRole::Agent)));

    // A server that completes the handshake and then never speaks again.
    let (outbound, mut inbound) = memory_pair(64);
    let peer = tokio::spawn(async move {
        let hello = inbound.rx.recv().await.unwrap();
        assert!(matches!(
            LinkMessage::decode(&hello).unwrap(),
            LinkMessage::Handshake(_)
        ));
        let ack = HandshakeAck::accepted(Iid::new(1000), SERVER, InstanceRole::Server, false);
        inbound.tx.send(ack.encode()).await.unwrap();

        let mut seen = Vec::new();
        while let Some(frame) = inbound.rx.recv().await {
            let msg = LinkMessage::decode(&frame).unwrap();
            let done = matches!(msg, LinkMessage::Disconnect(_));
            seen.push(msg);
            if done {
                break;
            }
        }
        seen
    });

    agent.connect(outbound).await.unwrap();
    assert_eq!(agent.local_iid(), Iid::new(1000));

    let seen = tokio::time::timeout(Duration::from_secs(6), peer)
        .await
        .unwrap()
        .unwrap();
    assert!(seen.iter().any(|m| matches!(m, LinkMessage::Heartbeat)));
    assert_eq!(
        seen.last(),
        Some(&LinkMessage::Disconnect(Disconnect::new(DisconnectReason::Timeout)))
    );
    assert!(wait_for(|| agent.connection_count() == 0).await);
    assert!(agent.upstream().is_none());
}

#[tokio::test]
async fn test_heartbeats_keep_link_alive() {
    let server = start_config(fast_liveness(server_config()));
    let agent = start_config(fast_liveness(client_config(InstanceRole::Agent)));
    join(&server, &agent).await;

    tokio::time::sleep(Duration::from_millis(3500)).await;

    assert!(agent.is_connected());
    assert_eq!(server.connection_count(), 1);
}

#[tokio::test]
async fn test_peer_disconnect_closes_both_sides() {
    let server = start_config(server_config());
    let agent = start_config(client_config(InstanceRole::Agent));
    let conn = join(&server, &agent).await;

    assert!(agent.disconnect(conn, DisconnectReason::Shutdown));
    assert!(!agent.disconnect(conn, DisconnectReason::Shutdown));

    assert!(wait_for(|| server.connection_count() == 0).await);
    assert!(!agent.is_connected());
}

#[tokio::test]
async fn test_server_shutdown_disconnects_clients() {
    let server = start_config(server_config());
    let agent = start_config(client_config(InstanceRole::Agent));
    let viewer = start_config(client_config(InstanceRole::Viewer));
    join(&server, &agent).await;
    join(&server, &viewer).await;

    server.shutdown().await;

    assert!(wait_for(|| agent.connection_count() == 0).await);
    assert!(wait_for(|| viewer.connection_count() == 0).await);
    assert_eq!(agent.router().route_count(), 0);
    assert_eq!(viewer.router().route_count(), 0);
}
