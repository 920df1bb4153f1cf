//! Instance lifecycle: start, accept, dial, connection tasks, shutdown.

use super::handshake::OutboundHandshake;
use super::{Instance, InstanceError, InstanceState};
use crate::connection::Connection;
use crate::protocol::{Disconnect, DisconnectReason, EnvelopeKind, LinkMessage};
use crate::transport::{ConnectionId, FrameRx, Link, TcpAcceptor};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// How long shutdown waits for tasks to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

impl Instance {
    /// Move to running and start the maintenance tick.
    pub fn start(self: &Arc<Self>) -> Result<(), InstanceError> {
        {
            let mut state = self.state.write();
            if *state != InstanceState::Created {
                return Err(InstanceError::AlreadyStarted);
            }
            *state = InstanceState::Running;
        }

        let this = Arc::clone(self);
        let interval = Duration::from_secs(self.config.node.tick_interval_secs.max(1));
        let mut shutdown = self.shutdown_tx.subscribe();
        self.spawn_task(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = tick.tick() => this.router.tick(Instant::now()),
                    _ = shutdown.changed() => break,
                }
            }
        });

        info!(role = %self.role(), iid = %self.local_iid(), "Instance started");
        Ok(())
    }

    pub(super) fn spawn_task<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    fn ensure_running(&self) -> Result<(), InstanceError> {
        if self.state().is_operational() {
            Ok(())
        } else {
            Err(InstanceError::NotRunning)
        }
    }

    // === Accepting ===

    /// Bind a TCP listener and accept peers on it.
    pub async fn listen(self: &Arc<Self>, addr: &str) -> Result<SocketAddr, InstanceError> {
        self.ensure_running()?;
        let acceptor = TcpAcceptor::bind(addr, self.config.node.limits.outbound_queue).await?;
        let local_addr = acceptor.local_addr();
        info!(addr = %local_addr, "Listening");

        let this = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        self.spawn_task(async move {
            loop {
                tokio::select! {
                    accepted = acceptor.accept() => match accepted {
                        Ok(link) => this.accept(link),
                        Err(e) => warn!(error = %e, "Accept failed"),
                    },
                    _ = shutdown.changed() => break,
                }
            }
            debug!(addr = %local_addr, "Listener stopped");
        });
        Ok(local_addr)
    }

    /// Take ownership of an inbound link.
    ///
    /// The handshake runs on the link's own task so that a slow peer never
    /// holds up the accept path.
    pub fn accept(self: &Arc<Self>, link: Link) {
        let Link {
            tx,
            mut rx,
            direction,
            remote_addr,
        } = link;
        let conn = self.registry.open(direction, tx, remote_addr);
        let this = Arc::clone(self);
        self.spawn_task(async move {
            match this.handshake_inbound(&conn, &mut rx).await {
                Ok(()) => {
                    this.router.broadcast_routes();
                    this.run_connection(conn, rx, Vec::new()).await;
                }
                Err(e) => {
                    debug!(
                        conn = %conn.id(),
                        remote_addr = conn.remote_addr().unwrap_or("-"),
                        error = %e,
                        "Inbound handshake failed"
                    );
                }
            }
        });
    }

    // === Dialing ===

    /// Handshake over an outbound link and start serving it.
    ///
    /// A server on the other end becomes the default route of an agent or
    /// viewer.
    pub async fn connect(self: &Arc<Self>, link: Link) -> Result<ConnectionId, InstanceError> {
        self.ensure_running()?;
        let Link {
            tx,
            mut rx,
            direction,
            remote_addr,
        } = link;
        let conn = self.registry.open(direction, tx, remote_addr);
        let OutboundHandshake { ack, early } = self.handshake_outbound(&conn, &mut rx).await?;
        let id = conn.id();

        if ack.role.is_authority() && !self.role().is_authority() {
            *self.upstream.write() = Some(id);
            self.router.set_default_route(Some(id));
        }
        self.router.broadcast_routes();

        let this = Arc::clone(self);
        self.spawn_task(async move {
            this.run_connection(conn, rx, early).await;
        });
        Ok(id)
    }

    // === Connection task ===

    /// Read frames until the link closes, the peer disconnects, liveness
    /// expires or the instance shuts down.
    async fn run_connection(
        self: Arc<Self>,
        conn: Arc<Connection>,
        mut rx: FrameRx,
        early: Vec<Vec<u8>>,
    ) {
        let liveness = &self.config.node.liveness;
        let timeout = Duration::from_secs(liveness.timeout_secs);
        let mut heartbeat =
            tokio::time::interval(Duration::from_secs(liveness.heartbeat_interval_secs.max(1)));
        heartbeat.tick().await;
        let mut shutdown = self.shutdown_tx.subscribe();

        let mut open = true;
        for frame in early {
            if !self.handle_frame(&conn, &frame).await {
                open = false;
                break;
            }
        }

        while open {
            tokio::select! {
                frame = rx.recv() => match frame {
                    Some(frame) => {
                        conn.touch();
                        open = self.handle_frame(&conn, &frame).await;
                    }
                    None => {
                        debug!(conn = %conn.id(), "Link closed by transport");
                        open = false;
                    }
                },
                _ = heartbeat.tick() => {
                    if conn.is_closed() {
                        open = false;
                    } else if conn.idle_for() > timeout {
                        warn!(
                            conn = %conn.id(),
                            iid = %conn.remote_iid(),
                            idle_secs = conn.idle_for().as_secs(),
                            "Peer liveness timeout"
                        );
                        let _ = conn.send(Disconnect::new(DisconnectReason::Timeout).encode());
                        open = false;
                    } else if let Err(e) = conn.send(LinkMessage::Heartbeat.encode()) {
                        trace!(conn = %conn.id(), error = %e, "Heartbeat not queued");
                    }
                },
                _ = shutdown.changed() => {
                    let _ = conn.send(Disconnect::new(DisconnectReason::Shutdown).encode());
                    open = false;
                },
            }
        }

        self.registry.deregister(conn.id());
        {
            let mut upstream = self.upstream.write();
            if *upstream == Some(conn.id()) {
                *upstream = None;
            }
        }
        self.conn_closed.notify_waiters();
    }

    /// Process one frame; returns false when the connection should close.
    ///
    /// Stream events wait for room on their next hop, holding back further
    /// reads from this connection until they are queued.
    async fn handle_frame(&self, conn: &Arc<Connection>, frame: &[u8]) -> bool {
        match LinkMessage::decode(frame) {
            Ok(LinkMessage::Envelope(envelope)) if envelope.kind == EnvelopeKind::Event => {
                self.router.forward_event(envelope, Some(conn.id())).await;
            }
            Ok(LinkMessage::Envelope(envelope)) => {
                self.router.route(envelope, Some(conn.id()));
            }
            Ok(LinkMessage::RouteAdvertise(advert)) => {
                self.router.handle_advertisement(conn.id(), &advert);
            }
            Ok(LinkMessage::Heartbeat) => {
                trace!(conn = %conn.id(), "Heartbeat");
            }
            Ok(LinkMessage::Disconnect(d)) => {
                info!(
                    conn = %conn.id(),
                    iid = %conn.remote_iid(),
                    reason = %d.reason,
                    "Peer disconnected"
                );
                return false;
            }
            Ok(other) => {
                debug!(
                    conn = %conn.id(),
                    msg_type = %other.msg_type(),
                    "Unexpected frame on established connection"
                );
            }
            Err(e) => {
                debug!(
                    conn = %conn.id(),
                    len = frame.len(),
                    error = %e,
                    "Malformed frame dropped"
                );
            }
        }
        true
    }

    // === Teardown ===

    /// Close one connection with a reason.
    pub fn disconnect(&self, id: ConnectionId, reason: DisconnectReason) -> bool {
        let Some(conn) = self.registry.get(id) else {
            return false;
        };
        let _ = conn.send(Disconnect::new(reason).encode());
        self.registry.deregister(id).is_some()
    }

    /// Stop every task, fail pending requests and close every connection.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.write();
            if matches!(*state, InstanceState::Stopping | InstanceState::Stopped) {
                return;
            }
            *state = InstanceState::Stopping;
        }
        info!(role = %self.role(), iid = %self.local_iid(), "Instance stopping");

        let _ = self.shutdown_tx.send(true);
        self.dispatcher.shutdown();
        for conn in self.registry.connections() {
            let _ = conn.send(Disconnect::new(DisconnectReason::Shutdown).encode());
        }
        self.registry.close_all();
        self.streams.close_all();

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                abort.abort();
            }
        }

        *self.state.write() = InstanceState::Stopped;
        info!("Instance stopped");
    }
}
