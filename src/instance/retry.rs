//! Upstream server connection with failover.
//!
//! Agents and viewers keep one connection to a server from the configured
//! list. A failed dial moves on to the next candidate; once every
//! candidate has failed in a row the loop backs off exponentially
//! (`base_interval_secs * 2^(passes - 1)`, capped at `max_backoff_secs`)
//! and gives up after `max_retries` failed passes. When an established
//! connection drops, the [`FailoverPolicy`] decides where to start again.

use super::{Instance, InstanceError};
use crate::config::{FailoverPolicy, ServerConfig};
use crate::transport::{tcp, ConnectionId, Link, TransportError};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Future returned by [`Dialer::dial`].
pub type DialFuture<'a> = Pin<Box<dyn Future<Output = Result<Link, TransportError>> + Send + 'a>>;

/// Opens links to servers.
pub trait Dialer: Send + Sync {
    fn dial<'a>(&'a self, server: &'a ServerConfig) -> DialFuture<'a>;
}

/// Dials servers over TCP.
#[derive(Clone, Copy, Debug)]
pub struct TcpDialer {
    buffer: usize,
}

impl TcpDialer {
    /// `buffer` is the outbound frame queue depth of each link.
    pub fn new(buffer: usize) -> Self {
        Self { buffer }
    }
}

impl Dialer for TcpDialer {
    fn dial<'a>(&'a self, server: &'a ServerConfig) -> DialFuture<'a> {
        Box::pin(tcp::connect(&server.address, self.buffer))
    }
}

/// Chooses which configured server to try next.
#[derive(Clone, Debug)]
pub struct ServerSelector {
    count: usize,
    policy: FailoverPolicy,
    current: usize,
    failed_in_pass: usize,
    passes: u32,
}

impl ServerSelector {
    pub fn new(count: usize, policy: FailoverPolicy) -> Self {
        Self {
            count: count.max(1),
            policy,
            current: 0,
            failed_in_pass: 0,
            passes: 0,
        }
    }

    /// Index of the candidate to try next.
    pub fn current(&self) -> usize {
        self.current
    }

    /// Consecutive passes in which every candidate failed.
    pub fn passes(&self) -> u32 {
        self.passes
    }

    /// A connection was established with the current candidate.
    pub fn on_success(&mut self) {
        self.failed_in_pass = 0;
        self.passes = 0;
    }

    /// The current candidate failed; returns true when this completed a
    /// pass over every candidate.
    pub fn on_failure(&mut self) -> bool {
        self.current = (self.current + 1) % self.count;
        self.failed_in_pass += 1;
        if self.failed_in_pass >= self.count {
            self.failed_in_pass = 0;
            self.passes += 1;
            true
        } else {
            false
        }
    }

    /// An established connection was lost.
    pub fn on_disconnect(&mut self) {
        if self.policy == FailoverPolicy::Ordered {
            self.current = 0;
        }
        self.failed_in_pass = 0;
    }

    /// Delay before the next pass.
    pub fn backoff(&self, base: Duration, max: Duration) -> Duration {
        let exponent = self.passes.saturating_sub(1);
        let multiplier = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        base.saturating_mul(multiplier).min(max)
    }
}

impl Instance {
    /// Start the upstream loop over the configured servers.
    pub fn start_upstream(self: &Arc<Self>, dialer: Arc<dyn Dialer>) -> Result<(), InstanceError> {
        if self.config.servers.is_empty() {
            return Err(InstanceError::NoServers);
        }
        if !self.state().is_operational() {
            return Err(InstanceError::NotRunning);
        }
        let this = Arc::clone(self);
        self.spawn_task(async move { this.run_upstream(dialer).await });
        Ok(())
    }

    async fn run_upstream(self: Arc<Self>, dialer: Arc<dyn Dialer>) {
        let servers = self.config.servers.clone();
        let retry = self.config.node.retry.clone();
        let base = Duration::from_secs(retry.base_interval_secs);
        let max = Duration::from_secs(retry.max_backoff_secs);
        let mut selector = ServerSelector::new(servers.len(), self.config.failover);
        let mut shutdown = self.shutdown_tx.subscribe();

        while !*shutdown.borrow() {
            let server = &servers[selector.current()];
            debug!(server = %server.display_name(), "Connecting to server");

            match self.dial_server(dialer.as_ref(), server).await {
                Ok(conn) => {
                    selector.on_success();
                    info!(server = %server.display_name(), conn = %conn, "Upstream connected");
                    if !self.wait_closed(conn, &mut shutdown).await {
                        break;
                    }
                    warn!(server = %server.display_name(), "Upstream connection lost");
                    selector.on_disconnect();
                }
                Err(e) => {
                    warn!(server = %server.display_name(), error = %e, "Server connection failed");
                    if !selector.on_failure() {
                        continue;
                    }
                    if selector.passes() > retry.max_retries {
                        warn!(
                            attempts = selector.passes(),
                            "Max retries exhausted, giving up on servers"
                        );
                        break;
                    }
                    let delay = selector.backoff(base, max);
                    info!(
                        retry = selector.passes(),
                        delay_secs = delay.as_secs(),
                        "All servers failed, scheduling retry"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }
        debug!("Upstream loop finished");
    }

    async fn dial_server(
        self: &Arc<Self>,
        dialer: &dyn Dialer,
        server: &ServerConfig,
    ) -> Result<ConnectionId, InstanceError> {
        let timeout = Duration::from_secs(self.config.node.liveness.handshake_timeout_secs);
        let link = tokio::time::timeout(timeout, dialer.dial(server))
            .await
            .map_err(|_| InstanceError::HandshakeTimeout(timeout))??;
        self.connect(link).await
    }

    /// Wait until `conn` is gone; returns false on shutdown.
    async fn wait_closed(&self, conn: ConnectionId, shutdown: &mut watch::Receiver<bool>) -> bool {
        loop {
            let closed = self.conn_closed.notified();
            tokio::pin!(closed);
            closed.as_mut().enable();
            if self.registry.get(conn).is_none() {
                return true;
            }
            tokio::select! {
                _ = &mut closed => {}
                _ = shutdown.changed() => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordered_restarts_from_first() {
        let mut sel = ServerSelector::new(3, FailoverPolicy::Ordered);
        assert_eq!(sel.current(), 0);
        assert!(!sel.on_failure());
        assert_eq!(sel.current(), 1);
        sel.on_success();
        sel.on_disconnect();
        assert_eq!(sel.current(), 0);
    }

    #[test]
    fn test_sticky_keeps_last_working() {
        let mut sel = ServerSelector::new(3, FailoverPolicy::Sticky);
        sel.on_failure();
        assert_eq!(sel.current(), 1);
        sel.on_success();
        sel.on_disconnect();
        assert_eq!(sel.current(), 1);
        sel.on_failure();
        assert_eq!(sel.current(), 2);
    }

    #[test]
    fn test_pass_completion_and_backoff() {
        let base = Duration::from_secs(2);
        let max = Duration::from_secs(300);
        let mut sel = ServerSelector::new(2, FailoverPolicy::Ordered);

        assert!(!sel.on_failure());
        assert!(sel.on_failure());
        assert_eq!(sel.passes(), 1);
        assert_eq!(sel.current(), 0);
        assert_eq!(sel.backoff(base, max), Duration::from_secs(2));

        sel.on_failure();
        sel.on_failure();
        assert_eq!(sel.passes(), 2);
        assert_eq!(sel.backoff(base, max), Duration::from_secs(4));

        for _ in 0..20 {
            sel.on_failure();
        }
        assert_eq!(sel.backoff(base, max), max);

        sel.on_success();
        assert_eq!(sel.passes(), 0);
    }

    #[test]
    fn test_single_server() {
        let mut sel = ServerSelector::new(1, FailoverPolicy::Sticky);
        assert!(sel.on_failure());
        assert_eq!(sel.current(), 0);
        assert_eq!(sel.passes(), 1);
    }
}
