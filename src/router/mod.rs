//! Router
//!
//! Delivers envelopes addressed to this instance and forwards the rest one
//! hop closer to their destination. Resolution prefers a direct neighbour,
//! then the best advertised route, then the default route to the preferred
//! server. [`Router::route`] never waits: a full outbound queue is a
//! routing failure. Stream events go through [`Router::forward_event`]
//! instead, which waits for room on the next hop so that no event is lost
//! to a burst.
//!
//! Failures are answered only for requests. The synthesized failure
//! response travels back to the request's source; a response or event that
//! cannot be delivered is dropped, so failures never cascade. When the
//! connection feeding a relayed stream closes, each subscriber is sent a
//! stream-end notice instead.

mod relay;
mod table;

pub use relay::{RelayTracker, RelayedRequest, RelayedStream};
pub use table::{RouteEntry, RouteTable};

use crate::config::RoutingConfig;
use crate::connection::{Connection, ConnectionObserver, ConnectionRegistry};
use crate::identity::Iid;
use crate::protocol::{Envelope, ResponseStatus, RouteAdvertise};
use crate::transport::ConnectionId;
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Receiver of envelopes addressed to this instance.
pub trait LocalDelivery: Send + Sync {
    /// Accept an envelope; must not block.
    fn deliver(&self, envelope: Envelope, ingress: Option<ConnectionId>);
}

/// Where to send an envelope next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NextHop {
    /// Adjacent connection.
    pub conn: ConnectionId,
    /// Intermediate instances beyond it (0 for a direct neighbour).
    pub hops: u8,
    /// Whether this is the default route rather than a known one.
    pub default_route: bool,
}

/// What happened to a routed envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Handed to local delivery.
    Local,
    /// Queued on an adjacent connection.
    Forwarded(ConnectionId),
    /// Not deliverable; requests were answered with this status.
    Failed(ResponseStatus),
}

/// Envelope router for one instance.
pub struct Router {
    registry: Arc<ConnectionRegistry>,
    config: RoutingConfig,
    table: RwLock<RouteTable>,
    relays: Mutex<RelayTracker>,
    default_route: RwLock<Option<ConnectionId>>,
    local: OnceLock<Weak<dyn LocalDelivery>>,
}

impl Router {
    pub fn new(registry: Arc<ConnectionRegistry>, config: RoutingConfig) -> Self {
        Self {
            registry,
            config,
            table: RwLock::new(RouteTable::new()),
            relays: Mutex::new(RelayTracker::new()),
            default_route: RwLock::new(None),
            local: OnceLock::new(),
        }
    }

    /// Install the local delivery target. Only the first call has effect.
    pub fn set_local_delivery(&self, target: Weak<dyn LocalDelivery>) {
        let _ = self.local.set(target);
    }

    /// Point the default route at a server connection.
    pub fn set_default_route(&self, conn: Option<ConnectionId>) {
        *self.default_route.write() = conn;
        debug!(conn = ?conn, "Default route updated");
    }

    pub fn default_route(&self) -> Option<ConnectionId> {
        *self.default_route.read()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// This instance's IID.
    pub fn local_iid(&self) -> Iid {
        self.registry.local_iid()
    }

    /// TTL for envelopes originated here.
    pub fn default_ttl(&self) -> u8 {
        self.config.default_ttl
    }

    /// Choose the next hop toward `dest`.
    pub fn resolve(&self, dest: Iid) -> Option<NextHop> {
        if let Some(conn) = self.registry.lookup(dest) {
            if conn.is_established() {
                return Some(NextHop {
                    conn: conn.id(),
                    hops: 0,
                    default_route: false,
                });
            }
        }
        if let Some(entry) = self.table.read().best(dest) {
            return Some(NextHop {
                conn: entry.next_hop,
                hops: entry.hops,
                default_route: false,
            });
        }
        self.default_route().map(|conn| NextHop {
            conn,
            hops: 0,
            default_route: true,
        })
    }

    /// Route one envelope.
    ///
    /// `ingress` is the connection it arrived on, `None` if it originated
    /// here.
    pub fn route(&self, mut envelope: Envelope, ingress: Option<ConnectionId>) -> RouteOutcome {
        if let Some(ingress) = ingress {
            if !self.admit(&mut envelope, ingress) {
                return RouteOutcome::Failed(ResponseStatus::ConnectionClosed);
            }
        }

        if envelope.dest == self.registry.local_iid() {
            return self.deliver_local(envelope, ingress);
        }

        if !envelope.decrement_ttl() {
            return self.fail(&envelope, ResponseStatus::TtlExpired, "ttl expired");
        }

        let hop = match self.resolve(envelope.dest) {
            Some(hop) if Some(hop.conn) != ingress => hop,
            _ => {
                let reason = format!("no route to {}", envelope.dest);
                return self.fail(&envelope, ResponseStatus::RoutingFailed, &reason);
            }
        };
        let Some(conn) = self.registry.get(hop.conn) else {
            let reason = format!("next hop toward {} closed", envelope.dest);
            return self.fail(&envelope, ResponseStatus::RoutingFailed, &reason);
        };

        match conn.send(envelope.to_frame()) {
            Ok(()) => {
                trace!(
                    src = %envelope.src,
                    dest = %envelope.dest,
                    kind = ?envelope.kind,
                    next_hop = %hop.conn,
                    "Envelope forwarded"
                );
                if let (true, Some(origin)) = (envelope.is_request(), ingress) {
                    self.relays
                        .lock()
                        .record(hop.conn, origin, &envelope, Instant::now());
                }
                RouteOutcome::Forwarded(hop.conn)
            }
            Err(e) => {
                let reason = format!("{} unreachable via {}: {}", envelope.dest, hop.conn, e);
                self.fail(&envelope, ResponseStatus::RoutingFailed, &reason)
            }
        }
    }

    /// Route a stream event, waiting for room on the next hop.
    ///
    /// A next hop whose queue stays full for `event_stall_secs` is closed
    /// as stalled. Events arriving on `ingress` are recorded as relayed
    /// streams so their subscribers can be told when the ingress closes.
    pub async fn forward_event(
        &self,
        mut envelope: Envelope,
        ingress: Option<ConnectionId>,
    ) -> RouteOutcome {
        if let Some(ingress) = ingress {
            if !self.admit(&mut envelope, ingress) {
                return RouteOutcome::Failed(ResponseStatus::ConnectionClosed);
            }
        }

        if envelope.dest == self.registry.local_iid() {
            return self.deliver_local(envelope, ingress);
        }

        if !envelope.decrement_ttl() {
            return self.fail(&envelope, ResponseStatus::TtlExpired, "ttl expired");
        }

        let hop = match self.resolve(envelope.dest) {
            Some(hop) if Some(hop.conn) != ingress => hop,
            _ => {
                let reason = format!("no route to {}", envelope.dest);
                return self.fail(&envelope, ResponseStatus::RoutingFailed, &reason);
            }
        };
        let Some(conn) = self.registry.get(hop.conn) else {
            let reason = format!("next hop toward {} closed", envelope.dest);
            return self.fail(&envelope, ResponseStatus::RoutingFailed, &reason);
        };

        let stall = Duration::from_secs(self.config.event_stall_secs);
        match tokio::time::timeout(stall, conn.send_wait(envelope.to_frame())).await {
            Ok(Ok(())) => {
                trace!(
                    src = %envelope.src,
                    dest = %envelope.dest,
                    sink = envelope.request_id,
                    next_hop = %hop.conn,
                    "Event forwarded"
                );
                if let Some(ingress) = ingress {
                    let mut relays = self.relays.lock();
                    match envelope.ended_source() {
                        Some(source) => {
                            relays.forget_stream(
                                ingress,
                                &RelayedStream {
                                    source,
                                    subscriber: envelope.dest,
                                    sink_id: envelope.request_id,
                                },
                            );
                        }
                        None => relays.record_stream(ingress, hop.conn, RelayedStream::of(&envelope)),
                    }
                }
                RouteOutcome::Forwarded(hop.conn)
            }
            Ok(Err(e)) => {
                let reason = format!("{} unreachable via {}: {}", envelope.dest, hop.conn, e);
                self.fail(&envelope, ResponseStatus::RoutingFailed, &reason)
            }
            Err(_) => {
                warn!(
                    conn = %hop.conn,
                    iid = %conn.remote_iid(),
                    stall_secs = stall.as_secs(),
                    "Next hop stalled on stream events, closing connection"
                );
                drop(conn);
                self.registry.deregister(hop.conn);
                self.fail(&envelope, ResponseStatus::ConnectionClosed, "next hop stalled")
            }
        }
    }

    /// Apply ingress checks; false if the ingress is no longer registered.
    fn admit(&self, envelope: &mut Envelope, ingress: ConnectionId) -> bool {
        match self.registry.get(ingress) {
            Some(conn) if !conn.is_authenticated() => envelope.authenticated = false,
            Some(_) => {}
            None => {
                debug!(conn = %ingress, "Envelope from unregistered connection, dropping");
                return false;
            }
        }
        if envelope.is_response() {
            self.relays.lock().complete(ingress, envelope);
        }
        true
    }

    /// Queue a notice toward its destination, waiting for room if a
    /// runtime is available.
    fn send_notice(&self, envelope: Envelope) {
        let Some(conn) = self
            .resolve(envelope.dest)
            .and_then(|hop| self.registry.get(hop.conn))
        else {
            debug!(dest = %envelope.dest, msg_type = %envelope.msg_type, "Notice has no route");
            return;
        };
        let frame = envelope.to_frame();
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            if let Err(e) = conn.send(frame) {
                debug!(dest = %envelope.dest, error = %e, "Notice not queued");
            }
            return;
        };
        let stall = Duration::from_secs(self.config.event_stall_secs);
        handle.spawn(async move {
            match tokio::time::timeout(stall, conn.send_wait(frame)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(conn = %conn.id(), error = %e, "Notice not queued"),
                Err(_) => debug!(conn = %conn.id(), "Notice not queued, next hop stalled"),
            }
        });
    }

    /// Relayed streams currently tracked.
    pub fn relayed_stream_count(&self) -> usize {
        self.relays.lock().stream_count()
    }

    fn deliver_local(&self, envelope: Envelope, ingress: Option<ConnectionId>) -> RouteOutcome {
        match self.local.get().and_then(Weak::upgrade) {
            Some(target) => {
                target.deliver(envelope, ingress);
                RouteOutcome::Local
            }
            None => {
                debug!(src = %envelope.src, "No local delivery target, dropping envelope");
                RouteOutcome::Failed(ResponseStatus::NoHandler)
            }
        }
    }

    /// Answer an undeliverable request; drop anything else.
    fn fail(&self, envelope: &Envelope, status: ResponseStatus, reason: &str) -> RouteOutcome {
        if envelope.is_request() {
            debug!(
                src = %envelope.src,
                dest = %envelope.dest,
                request_id = envelope.request_id,
                status = %status,
                reason,
                "Request not routable, answering with failure"
            );
            let failure = Envelope::failure_to(envelope, self.registry.local_iid(), status, reason)
                .with_ttl(self.config.default_ttl);
            self.route(failure, None);
        } else {
            debug!(
                src = %envelope.src,
                dest = %envelope.dest,
                kind = ?envelope.kind,
                reason,
                "Undeliverable envelope dropped"
            );
        }
        RouteOutcome::Failed(status)
    }

    // === Route exchange ===

    /// Apply a neighbour's advertisement; re-advertise if anything changed.
    pub fn handle_advertisement(&self, from: ConnectionId, advert: &RouteAdvertise) -> bool {
        let changed = self.table.write().advertise(
            from,
            &advert.entries,
            self.registry.local_iid(),
            self.config.max_hops,
        );
        debug!(
            from = %from,
            entries = advert.entries.len(),
            changed,
            "Route advertisement received"
        );
        if changed {
            self.broadcast_routes();
        }
        changed
    }

    /// What we tell `to` we can reach, omitting routes learnt through it.
    pub fn advertisement_for(&self, to: ConnectionId) -> RouteAdvertise {
        let to_iid = self.registry.get(to).map(|c| c.remote_iid());
        let mut entries: Vec<(Iid, u8)> = self
            .registry
            .connections()
            .iter()
            .filter(|c| c.id() != to && c.is_established())
            .map(|c| (c.remote_iid(), 0))
            .collect();
        for (iid, hops) in self.table.read().reachable_except(to) {
            if Some(iid) != to_iid && !entries.iter().any(|(e, _)| *e == iid) {
                entries.push((iid, hops));
            }
        }
        entries.sort_unstable();
        RouteAdvertise::new(entries)
    }

    /// Send every neighbour its split-horizon advertisement.
    pub fn broadcast_routes(&self) {
        self.registry.for_each_connection(|conn| {
            let frame = self.advertisement_for(conn.id()).encode();
            if let Err(e) = conn.send(frame) {
                debug!(conn = %conn.id(), error = %e, "Failed to send route advertisement");
            }
        });
    }

    // === Maintenance ===

    /// Forget relayed requests older than the relay expiry.
    pub fn tick(&self, now: Instant) {
        let expiry = Duration::from_secs(self.config.relay_expiry_secs);
        let dropped = self.relays.lock().expire(now, expiry);
        if dropped > 0 {
            debug!(dropped, "Expired relayed requests");
        }
    }

    /// Relayed requests awaiting a response.
    pub fn relay_count(&self) -> usize {
        self.relays.lock().len()
    }

    /// Destinations known through advertisements.
    pub fn route_count(&self) -> usize {
        self.table.read().len()
    }
}

impl ConnectionObserver for Router {
    fn connection_closed(&self, conn: &Connection) {
        let id = conn.id();
        let routes_changed = self.table.write().remove_neighbor(id);
        {
            let mut default_route = self.default_route.write();
            if *default_route == Some(id) {
                *default_route = None;
            }
        }

        let orphaned = self.relays.lock().take_connection(id);
        for relayed in &orphaned {
            let reason = format!("connection to {} closed", conn.remote_iid());
            let failure = Envelope::failure_to(
                &relayed.to_request(),
                self.registry.local_iid(),
                ResponseStatus::RoutingFailed,
                &reason,
            )
            .with_ttl(self.config.default_ttl);
            self.route(failure, None);
        }
        if !orphaned.is_empty() {
            debug!(
                conn = %id,
                failed = orphaned.len(),
                "Failed relayed requests of closed connection"
            );
        }

        let ended = self.relays.lock().take_streams(id);
        for stream in &ended {
            let notice = Envelope::stream_end(
                self.registry.local_iid(),
                stream.subscriber,
                stream.sink_id,
                stream.source,
            )
            .with_ttl(self.config.default_ttl);
            self.send_notice(notice);
        }
        if !ended.is_empty() {
            debug!(
                conn = %id,
                streams = ended.len(),
                "Ended relayed streams of closed connection"
            );
        }

        if routes_changed {
            self.broadcast_routes();
        }
    }
}

#[cfg(test)]
mod tests;
