//! Command Dispatcher
//!
//! Issues requests to other instances and correlates their responses by
//! request id, and serves requests addressed to this instance by running
//! the handler registered for the message type.
//!
//! ## Outbound
//!
//! `send()` reserves a pending slot, hands the request to the router and
//! waits on the slot with a timeout. The slot is removed however the wait
//! ends, so a response arriving after the timeout finds nothing and is
//! dropped.
//!
//! ## Inbound
//!
//! Handlers run on the blocking pool, bounded by a semaphore, never on the
//! connection reader that delivered the request. Handler errors and panics
//! become `HandlerFailed` responses.

pub mod capability;

pub use capability::{
    Capability, CapabilityRegistry, HandlerDescriptor, HandlerError, Reply, RequestContext,
};

use crate::connection::{Connection, ConnectionObserver};
use crate::identity::Iid;
use crate::protocol::{Envelope, EnvelopeKind, MessageType, ResponseStatus};
use crate::router::{LocalDelivery, RouteOutcome, Router};
use crate::transport::ConnectionId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, trace, warn};

/// Why a request produced no value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("routing failed: {0}")]
    Routing(String),

    #[error("ttl expired: {0}")]
    TtlExpired(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("no handler for message type {0}")]
    NoHandler(MessageType),

    #[error("handler failed: {0}")]
    HandlerFailed(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("dispatcher shut down")]
    Shutdown,
}

impl DispatchError {
    /// Map a failed response to the caller-facing error.
    fn from_failure(envelope: &Envelope) -> Self {
        let reason = envelope.reason();
        match envelope.status {
            ResponseStatus::RoutingFailed | ResponseStatus::Ok => DispatchError::Routing(reason),
            ResponseStatus::TtlExpired => DispatchError::TtlExpired(reason),
            ResponseStatus::Unauthorized => DispatchError::Unauthorized(reason),
            ResponseStatus::NoHandler => DispatchError::NoHandler(envelope.msg_type),
            ResponseStatus::HandlerFailed => DispatchError::HandlerFailed(reason),
            ResponseStatus::ConnectionClosed => DispatchError::ConnectionClosed,
        }
    }
}

/// Per-request options.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Reject a response that did not travel an authenticated path.
    pub auth_required: bool,
    /// Overrides the dispatcher's default timeout.
    pub timeout: Option<Duration>,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn auth_required(mut self) -> Self {
        self.auth_required = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A successful response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    /// Instance that answered.
    pub from: Iid,
    /// Reply message type.
    pub msg_type: MessageType,
    /// Reply payload.
    pub payload: Vec<u8>,
    /// Whether the reply travelled an authenticated path.
    pub authenticated: bool,
}

/// Receiver of stream events addressed to this instance.
pub trait EventSink: Send + Sync {
    fn deliver_event(&self, envelope: Envelope);
}

type SlotResult = Result<Envelope, DispatchError>;

struct PendingSlot {
    tx: oneshot::Sender<SlotResult>,
    dest: Iid,
    conn: Option<ConnectionId>,
}

struct PendingTable {
    next_id: u32,
    slots: HashMap<u32, PendingSlot>,
}

impl PendingTable {
    /// Next id that is non-zero and not outstanding.
    fn allocate_id(&mut self) -> u32 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if id != 0 && !self.slots.contains_key(&id) {
                return id;
            }
        }
    }
}

/// Request/response engine for one instance.
pub struct Dispatcher {
    router: Arc<Router>,
    capabilities: Arc<CapabilityRegistry>,
    pending: Mutex<PendingTable>,
    workers: Arc<Semaphore>,
    default_timeout: Duration,
    shutdown: AtomicBool,
    events: OnceLock<Weak<dyn EventSink>>,
}

impl Dispatcher {
    /// Create a dispatcher.
    ///
    /// `max_concurrent_handlers` bounds handler bodies running at once.
    pub fn new(
        router: Arc<Router>,
        capabilities: Arc<CapabilityRegistry>,
        default_timeout: Duration,
        max_concurrent_handlers: usize,
    ) -> Self {
        Self {
            router,
            capabilities,
            pending: Mutex::new(PendingTable {
                next_id: rand::random(),
                slots: HashMap::new(),
            }),
            workers: Arc::new(Semaphore::new(max_concurrent_handlers.max(1))),
            default_timeout,
            shutdown: AtomicBool::new(false),
            events: OnceLock::new(),
        }
    }

    /// Install the stream event target. Only the first call has effect.
    pub fn set_event_sink(&self, sink: Weak<dyn EventSink>) {
        let _ = self.events.set(sink);
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn capabilities(&self) -> &Arc<CapabilityRegistry> {
        &self.capabilities
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().slots.len()
    }

    // === Outbound ===

    /// Send a request and wait for its response.
    pub async fn send(
        &self,
        dest: Iid,
        msg_type: MessageType,
        payload: Vec<u8>,
        options: SendOptions,
    ) -> Result<Response, DispatchError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(DispatchError::Shutdown);
        }
        let timeout = options.timeout.unwrap_or(self.default_timeout);
        let local = self.router.local_iid();

        let (tx, rx) = oneshot::channel();
        let request_id = {
            let mut pending = self.pending.lock();
            let id = pending.allocate_id();
            pending.slots.insert(
                id,
                PendingSlot {
                    tx,
                    dest,
                    conn: None,
                },
            );
            id
        };

        let request = Envelope::request(local, dest, request_id, msg_type, payload)
            .with_ttl(self.router.default_ttl());
        trace!(dest = %dest, request_id, msg_type = %msg_type, "Sending request");

        if let RouteOutcome::Forwarded(conn) = self.router.route(request, None) {
            self.bind_connection(request_id, conn);
        }

        let result = tokio::time::timeout(timeout, rx).await;
        // Present only if the wait ended by timeout.
        self.pending.lock().slots.remove(&request_id);

        let envelope = match result {
            Ok(Ok(Ok(envelope))) => envelope,
            Ok(Ok(Err(e))) => return Err(e),
            Ok(Err(_)) => return Err(DispatchError::Shutdown),
            Err(_) => {
                debug!(
                    dest = %dest,
                    request_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Request timed out"
                );
                return Err(DispatchError::Timeout(timeout));
            }
        };

        if !envelope.status.is_ok() {
            return Err(DispatchError::from_failure(&envelope));
        }
        if options.auth_required && !envelope.authenticated {
            return Err(DispatchError::Unauthorized(format!(
                "response from {} did not travel an authenticated path",
                envelope.src
            )));
        }
        Ok(Response {
            from: envelope.src,
            msg_type: envelope.msg_type,
            payload: envelope.payload,
            authenticated: envelope.authenticated,
        })
    }

    /// Remember the egress of a pending request so its closure fails it.
    fn bind_connection(&self, request_id: u32, conn: ConnectionId) {
        let mut pending = self.pending.lock();
        let Some(slot) = pending.slots.get_mut(&request_id) else {
            return;
        };
        slot.conn = Some(conn);
        // The egress may have closed between forwarding and binding.
        if self.router.registry().get(conn).is_none() {
            if let Some(slot) = pending.slots.remove(&request_id) {
                let _ = slot.tx.send(Err(DispatchError::ConnectionClosed));
            }
        }
    }

    /// Fail every pending request and refuse new ones.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let slots: Vec<_> = self.pending.lock().slots.drain().collect();
        if !slots.is_empty() {
            debug!(count = slots.len(), "Failing pending requests on shutdown");
        }
        for (_, slot) in slots {
            let _ = slot.tx.send(Err(DispatchError::Shutdown));
        }
    }

    // === Inbound ===

    fn resolve(&self, envelope: Envelope) {
        let mut pending = self.pending.lock();
        let matches = match pending.slots.get(&envelope.request_id) {
            Some(slot) => !envelope.status.is_ok() || slot.dest == envelope.src,
            None => false,
        };
        if !matches {
            drop(pending);
            debug!(
                src = %envelope.src,
                request_id = envelope.request_id,
                "Discarding response with no pending request"
            );
            return;
        }
        if let Some(slot) = pending.slots.remove(&envelope.request_id) {
            let _ = slot.tx.send(Ok(envelope));
        }
    }

    fn serve(&self, mut request: Envelope, ingress: Option<ConnectionId>) {
        let local = self.router.local_iid();
        let Some(descriptor) = self.capabilities.lookup(request.msg_type).cloned() else {
            debug!(src = %request.src, msg_type = %request.msg_type, "No handler for request");
            let reason = format!("no handler for {}", request.msg_type);
            self.respond(Envelope::failure_to(&request, local, ResponseStatus::NoHandler, &reason));
            return;
        };
        if descriptor.requires_auth && !request.authenticated {
            warn!(
                src = %request.src,
                handler = %descriptor.name,
                "Unauthenticated request for protected capability"
            );
            self.respond(Envelope::failure_to(
                &request,
                local,
                ResponseStatus::Unauthorized,
                "authentication required",
            ));
            return;
        }

        let ctx = RequestContext {
            source: request.src,
            local,
            request_id: request.request_id,
            msg_type: request.msg_type,
            authenticated: request.authenticated,
            ingress,
        };
        let payload = std::mem::take(&mut request.payload);
        let router = Arc::clone(&self.router);
        let workers = Arc::clone(&self.workers);
        tokio::spawn(async move {
            let Ok(_permit) = workers.acquire_owned().await else {
                return;
            };
            let handler = Arc::clone(&descriptor.handler);
            let outcome =
                tokio::task::spawn_blocking(move || handler.handle(&ctx, &payload)).await;

            let response = match outcome {
                Ok(Ok(reply)) => Envelope::response_to(&request, reply.msg_type, reply.payload),
                Ok(Err(e)) => {
                    warn!(
                        handler = %descriptor.name,
                        src = %request.src,
                        error = %e,
                        "Handler failed"
                    );
                    let reason = e.to_string();
                    Envelope::failure_to(&request, local, ResponseStatus::HandlerFailed, &reason)
                }
                Err(e) => {
                    warn!(
                        handler = %descriptor.name,
                        src = %request.src,
                        error = %e,
                        "Handler panicked"
                    );
                    Envelope::failure_to(
                        &request,
                        local,
                        ResponseStatus::HandlerFailed,
                        "handler panicked",
                    )
                }
            };
            router.route(response.with_ttl(router.default_ttl()), None);
        });
    }

    fn respond(&self, response: Envelope) {
        self.router
            .route(response.with_ttl(self.router.default_ttl()), None);
    }
}

impl LocalDelivery for Dispatcher {
    fn deliver(&self, envelope: Envelope, ingress: Option<ConnectionId>) {
        match envelope.kind {
            EnvelopeKind::Response => self.resolve(envelope),
            EnvelopeKind::Request => self.serve(envelope, ingress),
            EnvelopeKind::Event => match self.events.get().and_then(Weak::upgrade) {
                Some(sink) => sink.deliver_event(envelope),
                None => trace!(src = %envelope.src, "Stream event with no sink, dropping"),
            },
        }
    }
}

impl ConnectionObserver for Dispatcher {
    fn connection_closed(&self, conn: &Connection) {
        let id = conn.id();
        let failed: Vec<PendingSlot> = {
            let mut pending = self.pending.lock();
            let ids: Vec<u32> = pending
                .slots
                .iter()
                .filter(|(_, slot)| slot.conn == Some(id))
                .map(|(request_id, _)| *request_id)
                .collect();
            ids.iter()
                .filter_map(|request_id| pending.slots.remove(request_id))
                .collect()
        };
        if !failed.is_empty() {
            debug!(
                conn = %id,
                count = failed.len(),
                "Failing pending requests of closed connection"
            );
        }
        for slot in failed {
            let _ = slot.tx.send(Err(DispatchError::ConnectionClosed));
        }
    }
}
