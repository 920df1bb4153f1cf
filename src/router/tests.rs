use super::*;
use crate::identity::InstanceRole;
use crate::protocol::{LinkMessage, MessageType};
use crate::transport::{frame_channel, FrameRx, LinkDirection};

#[derive(Default)]
struct Inbox {
    delivered: Mutex<Vec<(Envelope, Option<ConnectionId>)>>,
}

impl LocalDelivery for Inbox {
    fn deliver(&self, envelope: Envelope, ingress: Option<ConnectionId>) {
        self.delivered.lock().push((envelope, ingress));
    }
}

struct Harness {
    registry: Arc<ConnectionRegistry>,
    router: Arc<Router>,
    inbox: Arc<Inbox>,
}

fn make_router(role: InstanceRole) -> Harness {
    make_router_with(role, RoutingConfig::default())
}

fn make_router_with(role: InstanceRole, config: RoutingConfig) -> Harness {
    let registry = Arc::new(ConnectionRegistry::new(role, Iid::new(5), 64));
    if !role.is_authority() {
        registry.set_local_iid(Iid::new(1000));
    }
    let router = Arc::new(Router::new(registry.clone(), config));
    let inbox = Arc::new(Inbox::default());

    let observer: Weak<dyn ConnectionObserver> = Arc::downgrade(&router) as Weak<dyn ConnectionObserver>;
    registry.add_observer(observer);
    let target: Weak<dyn LocalDelivery> = Arc::downgrade(&inbox) as Weak<dyn LocalDelivery>;
    router.set_local_delivery(target);

    Harness {
        registry,
        router,
        inbox,
    }
}

fn connect(h: &Harness, iid: u32, role: InstanceRole, queue: usize) -> (Arc<Connection>, FrameRx) {
    let (tx, rx) = frame_channel(queue);
    let conn = h.registry.open(LinkDirection::Inbound, tx, None);
    h.registry.register(&conn, Iid::new(iid), role).unwrap();
    (conn, rx)
}

/// Next envelope queued on a connection, skipping other link frames.
fn next_envelope(rx: &mut FrameRx) -> Option<Envelope> {
    while let Ok(frame) = rx.try_recv() {
        if let Ok(LinkMessage::Envelope(env)) = LinkMessage::decode(&frame) {
            return Some(env);
        }
    }
    None
}

fn ping(src: u32, dest: u32, id: u32) -> Envelope {
    Envelope::request(Iid::new(src), Iid::new(dest), id, MessageType::PING, vec![])
}

#[test]
fn test_local_delivery() {
    let h = make_router(InstanceRole::Server);
    let (agent, _rx) = connect(&h, 1000, InstanceRole::Agent, 8);

    let outcome = h.router.route(ping(1000, 5, 1), Some(agent.id()));
    assert_eq!(outcome, RouteOutcome::Local);
    let delivered = h.inbox.delivered.lock();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].1, Some(agent.id()));
    assert_eq!(delivered[0].0.ttl, 16);
}

#[test]
fn test_forward_to_direct_neighbor() {
    let h = make_router(InstanceRole::Server);
    let (agent, mut agent_rx) = connect(&h, 1000, InstanceRole::Agent, 8);
    let (viewer, _viewer_rx) = connect(&h, 2000, InstanceRole::Viewer, 8);

    let outcome = h.router.route(ping(2000, 1000, 7), Some(viewer.id()));
    assert_eq!(outcome, RouteOutcome::Forwarded(agent.id()));

    let forwarded = next_envelope(&mut agent_rx).unwrap();
    assert_eq!(forwarded.request_id, 7);
    assert_eq!(forwarded.ttl, 15);
    assert_eq!(h.router.relay_count(), 1);

    // The response passing back clears the relay entry
    let response = Envelope::response_to(&forwarded, MessageType::PONG, vec![]);
    let outcome = h.router.route(response, Some(agent.id()));
    assert_eq!(outcome, RouteOutcome::Forwarded(viewer.id()));
    assert_eq!(h.router.relay_count(), 0);
}

#[test]
fn test_unauthenticated_ingress_clears_flag() {
    let h = make_router(InstanceRole::Server);
    let (_agent, mut agent_rx) = connect(&h, 1000, InstanceRole::Agent, 8);
    let (viewer, _viewer_rx) = connect(&h, 2000, InstanceRole::Viewer, 8);

    h.router.route(ping(2000, 1000, 1), Some(viewer.id()));
    assert!(!next_envelope(&mut agent_rx).unwrap().authenticated);

    viewer.set_credential(Some("operator"), true);
    h.router.route(ping(2000, 1000, 2), Some(viewer.id()));
    assert!(next_envelope(&mut agent_rx).unwrap().authenticated);
}

#[test]
fn test_no_route_answers_request() {
    let h = make_router(InstanceRole::Server);
    let (viewer, mut viewer_rx) = connect(&h, 2000, InstanceRole::Viewer, 8);

    let outcome = h.router.route(ping(2000, 4242, 3), Some(viewer.id()));
    assert_eq!(outcome, RouteOutcome::Failed(ResponseStatus::RoutingFailed));

    let failure = next_envelope(&mut viewer_rx).unwrap();
    assert!(failure.is_response());
    assert_eq!(failure.status, ResponseStatus::RoutingFailed);
    assert_eq!(failure.dest, Iid::new(2000));
    assert_eq!(failure.src, Iid::new(5));
    assert_eq!(failure.request_id, 3);
    assert!(failure.reason().contains("4242"));
}

#[test]
fn test_undeliverable_response_is_dropped() {
    let h = make_router(InstanceRole::Server);
    let (agent, _agent_rx) = connect(&h, 1000, InstanceRole::Agent, 8);

    let response = Envelope::response_to(&ping(4242, 1000, 1), MessageType::PONG, vec![]);
    let outcome = h.router.route(response, Some(agent.id()));
    assert_eq!(outcome, RouteOutcome::Failed(ResponseStatus::RoutingFailed));
    assert!(h.inbox.delivered.lock().is_empty());
}

#[test]
fn test_local_request_without_route_fails_locally() {
    let h = make_router(InstanceRole::Server);
    let outcome = h.router.route(ping(5, 4242, 9), None);
    assert_eq!(outcome, RouteOutcome::Failed(ResponseStatus::RoutingFailed));

    let delivered = h.inbox.delivered.lock();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].0.status, ResponseStatus::RoutingFailed);
    assert_eq!(delivered[0].0.request_id, 9);
}

#[test]
fn test_ttl_expiry() {
    let h = make_router(InstanceRole::Server);
    let (_agent, mut agent_rx) = connect(&h, 1000, InstanceRole::Agent, 8);
    let (viewer, mut viewer_rx) = connect(&h, 2000, InstanceRole::Viewer, 8);

    let outcome = h.router.route(ping(2000, 1000, 4).with_ttl(1), Some(viewer.id()));
    assert_eq!(outcome, RouteOutcome::Failed(ResponseStatus::TtlExpired));
    assert!(next_envelope(&mut agent_rx).is_none());
    assert_eq!(next_envelope(&mut viewer_rx).unwrap().status, ResponseStatus::TtlExpired);
}

#[test]
fn test_full_queue_fails_fast() {
    let h = make_router(InstanceRole::Server);
    let (agent, _agent_rx) = connect(&h, 1000, InstanceRole::Agent, 1);
    let (viewer, mut viewer_rx) = connect(&h, 2000, InstanceRole::Viewer, 8);
    agent.send(vec![0x51]).unwrap();

    let outcome = h.router.route(ping(2000, 1000, 5), Some(viewer.id()));
    assert_eq!(outcome, RouteOutcome::Failed(ResponseStatus::RoutingFailed));
    let failure = next_envelope(&mut viewer_rx).unwrap();
    assert!(failure.reason().contains("queue full"));
    assert_eq!(h.router.relay_count(), 0);
}

#[test]
fn test_closed_egress_fails_relayed_requests() {
    let h = make_router(InstanceRole::Server);
    let (agent, _agent_rx) = connect(&h, 1000, InstanceRole::Agent, 8);
    let (viewer, mut viewer_rx) = connect(&h, 2000, InstanceRole::Viewer, 8);

    h.router.route(ping(2000, 1000, 11), Some(viewer.id()));
    h.router.route(ping(2000, 1000, 12), Some(viewer.id()));
    assert_eq!(h.router.relay_count(), 2);

    h.registry.deregister(agent.id());

    let mut failed = vec![];
    while let Some(env) = next_envelope(&mut viewer_rx) {
        assert_eq!(env.status, ResponseStatus::RoutingFailed);
        failed.push(env.request_id);
    }
    failed.sort_unstable();
    assert_eq!(failed, vec![11, 12]);
    assert_eq!(h.router.relay_count(), 0);
}

#[test]
fn test_default_route_and_no_bounce() {
    let h = make_router(InstanceRole::Agent);
    let (server, mut server_rx) = connect(&h, 5, InstanceRole::Server, 8);
    h.router.set_default_route(Some(server.id()));

    let outcome = h.router.route(ping(1000, 2000, 1), None);
    assert_eq!(outcome, RouteOutcome::Forwarded(server.id()));
    assert_eq!(next_envelope(&mut server_rx).unwrap().dest, Iid::new(2000));

    // Never sent back out the connection it came in on
    let outcome = h.router.route(ping(2000, 3000, 2), Some(server.id()));
    assert_eq!(outcome, RouteOutcome::Failed(ResponseStatus::RoutingFailed));

    h.registry.deregister(server.id());
    assert_eq!(h.router.default_route(), None);
}

#[test]
fn test_advertised_route_and_split_horizon() {
    let h = make_router(InstanceRole::Server);
    let (peer, mut peer_rx) = connect(&h, 6, InstanceRole::Server, 8);
    let (agent, mut agent_rx) = connect(&h, 1000, InstanceRole::Agent, 8);

    let advert = RouteAdvertise::new(vec![(Iid::new(3000), 0)]);
    assert!(h.router.handle_advertisement(peer.id(), &advert));
    assert!(!h.router.handle_advertisement(peer.id(), &advert));

    let hop = h.router.resolve(Iid::new(3000)).unwrap();
    assert_eq!(hop.conn, peer.id());
    assert_eq!(hop.hops, 1);

    // The agent learns about 3000 and the peer; the peer only about the agent
    let to_agent = h.router.advertisement_for(agent.id());
    assert_eq!(to_agent.entries, vec![(Iid::new(6), 0), (Iid::new(3000), 1)]);
    let to_peer = h.router.advertisement_for(peer.id());
    assert_eq!(to_peer.entries, vec![(Iid::new(1000), 0)]);

    // The change was broadcast
    let frame = agent_rx.try_recv().unwrap();
    assert!(matches!(LinkMessage::decode(&frame), Ok(LinkMessage::RouteAdvertise(_))));
    assert!(peer_rx.try_recv().is_ok());

    h.registry.deregister(peer.id());
    assert!(h.router.resolve(Iid::new(3000)).is_none());
    assert_eq!(h.router.route_count(), 0);
}

#[test]
fn test_tick_expires_relays() {
    let h = make_router(InstanceRole::Server);
    let (_agent, _agent_rx) = connect(&h, 1000, InstanceRole::Agent, 8);
    let (viewer, _viewer_rx) = connect(&h, 2000, InstanceRole::Viewer, 8);

    h.router.route(ping(2000, 1000, 1), Some(viewer.id()));
    h.router.tick(Instant::now());
    assert_eq!(h.router.relay_count(), 1);
    h.router.tick(Instant::now() + Duration::from_secs(3600));
    assert_eq!(h.router.relay_count(), 0);
}

async fn recv_envelope(rx: &mut FrameRx) -> Envelope {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no frame within 2s")
            .expect("link closed");
        if let Ok(LinkMessage::Envelope(env)) = LinkMessage::decode(&frame) {
            return env;
        }
    }
}

fn event(src: u32, dest: u32, sink: u32, n: u8) -> Envelope {
    Envelope::event(Iid::new(src), Iid::new(dest), sink, vec![n])
}

#[tokio::test]
async fn test_forward_event_waits_for_room() {
    let h = make_router(InstanceRole::Server);
    let (viewer, mut viewer_rx) = connect(&h, 2000, InstanceRole::Viewer, 1);

    assert_eq!(
        h.router.forward_event(event(5, 2000, 1, 1), None).await,
        RouteOutcome::Forwarded(viewer.id())
    );
    // The queue is full; route() would drop this one.
    let router = h.router.clone();
    let pending = tokio::spawn(async move { router.forward_event(event(5, 2000, 1, 2), None).await });
    tokio::task::yield_now().await;
    assert!(!pending.is_finished());

    assert_eq!(recv_envelope(&mut viewer_rx).await.payload, vec![1]);
    assert_eq!(pending.await.unwrap(), RouteOutcome::Forwarded(viewer.id()));
    assert_eq!(recv_envelope(&mut viewer_rx).await.payload, vec![2]);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_next_hop_is_closed() {
    let config = RoutingConfig {
        event_stall_secs: 1,
        ..RoutingConfig::default()
    };
    let h = make_router_with(InstanceRole::Server, config);
    let (viewer, _viewer_rx) = connect(&h, 2000, InstanceRole::Viewer, 1);

    h.router.forward_event(event(5, 2000, 1, 1), None).await;
    let outcome = h.router.forward_event(event(5, 2000, 1, 2), None).await;
    assert_eq!(outcome, RouteOutcome::Failed(ResponseStatus::ConnectionClosed));
    assert!(viewer.is_closed());
    assert!(h.registry.get(viewer.id()).is_none());
}

#[tokio::test]
async fn test_forward_event_without_route_fails() {
    let h = make_router(InstanceRole::Server);
    let outcome = h.router.forward_event(event(5, 4242, 1, 1), None).await;
    assert_eq!(outcome, RouteOutcome::Failed(ResponseStatus::RoutingFailed));
    assert_eq!(h.router.relay_count(), 0);
}

#[tokio::test]
async fn test_relayed_stream_ends_when_source_closes() {
    let h = make_router(InstanceRole::Server);
    let (agent, _agent_rx) = connect(&h, 1000, InstanceRole::Agent, 8);
    let (viewer, mut viewer_rx) = connect(&h, 2000, InstanceRole::Viewer, 8);

    let outcome = h.router.forward_event(event(1000, 2000, 7, 1), Some(agent.id())).await;
    assert_eq!(outcome, RouteOutcome::Forwarded(viewer.id()));
    assert_eq!(recv_envelope(&mut viewer_rx).await.payload, vec![1]);
    assert_eq!(h.router.relayed_stream_count(), 1);

    h.registry.deregister(agent.id());
    let notice = recv_envelope(&mut viewer_rx).await;
    assert_eq!(notice.msg_type, MessageType::STREAM_END);
    assert_eq!(notice.src, Iid::new(5));
    assert_eq!(notice.request_id, 7);
    assert_eq!(notice.ended_source(), Some(Iid::new(1000)));
    assert_eq!(h.router.relayed_stream_count(), 0);
}

#[tokio::test]
async fn test_relayed_stream_forgotten_with_subscriber() {
    let h = make_router(InstanceRole::Server);
    let (agent, _agent_rx) = connect(&h, 1000, InstanceRole::Agent, 8);
    let (viewer, _viewer_rx) = connect(&h, 2000, InstanceRole::Viewer, 8);

    h.router.forward_event(event(1000, 2000, 7, 1), Some(agent.id())).await;
    assert_eq!(h.router.relayed_stream_count(), 1);
    h.registry.deregister(viewer.id());
    assert_eq!(h.router.relayed_stream_count(), 0);
}

#[tokio::test]
async fn test_opened_stream_ends_before_any_event() {
    let h = make_router(InstanceRole::Server);
    let (agent, _agent_rx) = connect(&h, 1000, InstanceRole::Agent, 8);
    let (viewer, mut viewer_rx) = connect(&h, 2000, InstanceRole::Viewer, 8);

    let open = crate::protocol::StreamOpen {
        sink_id: 3,
        prefix: crate::state::Oid::from([1]),
    };
    let request = Envelope::request(
        Iid::new(2000),
        Iid::new(1000),
        21,
        MessageType::STREAM_OPEN,
        open.encode(),
    );
    h.router.route(request.clone(), Some(viewer.id()));
    let opened = Envelope::response_to(&request, MessageType::STREAM_OPENED, vec![1, 0, 0, 0]);
    h.router.route(opened, Some(agent.id()));
    assert_eq!(recv_envelope(&mut viewer_rx).await.msg_type, MessageType::STREAM_OPENED);
    assert_eq!(h.router.relayed_stream_count(), 1);

    h.registry.deregister(agent.id());
    let notice = recv_envelope(&mut viewer_rx).await;
    assert_eq!(notice.ended_source(), Some(Iid::new(1000)));
    assert_eq!(notice.request_id, 3);
}
