//! Stream Manager
//!
//! Serving side: a stream is a tree listener bound to one subscriber. A
//! forwarding task per stream turns each change event into a stream-event
//! envelope routed to the subscriber, in the order the tree emitted them.
//! The task waits for room on the next hop rather than dropping events; a
//! subscriber that cannot be reached ends the stream. Streams are scoped to
//! the connection the opening request arrived on and are closed with it.
//!
//! Subscribing side: a sink is registered before the stream is requested so
//! that no event can arrive unclaimed. Event envelopes carry the sink id in
//! their correlation field. A sink ends when the connection toward its
//! source closes, or when a relay reports the source gone.

mod subscription;

pub use subscription::Subscription;

use crate::connection::{Connection, ConnectionObserver};
use crate::dispatch::{DispatchError, EventSink};
use crate::identity::Iid;
use crate::protocol::{Envelope, ProtocolError};
use crate::router::{RouteOutcome, Router};
use crate::state::{ChangeEvent, Oid, StateError, StateTree};
use crate::transport::ConnectionId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Locally unique stream identifier.
pub type StreamId = u32;

/// Errors from stream operations.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream {0} not found")]
    NotFound(StreamId),

    #[error("stream {stream} is not owned by {iid}")]
    NotOwner { stream: StreamId, iid: Iid },

    #[error("stream {0} already subscribed")]
    AlreadySubscribed(StreamId),

    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("state error: {0}")]
    State(#[from] StateError),
}

struct StreamEntry {
    conn: Option<ConnectionId>,
    subscriber: Iid,
    sink_id: u32,
    prefix: Option<Oid>,
    task: Option<JoinHandle<()>>,
}

struct Sink {
    source: Iid,
    conn: Option<ConnectionId>,
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

/// Streams served by this instance and sinks for streams it subscribed to.
pub struct StreamManager {
    tree: Arc<StateTree>,
    router: Arc<Router>,
    streams: Mutex<HashMap<StreamId, StreamEntry>>,
    sinks: Mutex<HashMap<u32, Sink>>,
    next_stream: AtomicU32,
    next_sink: AtomicU32,
}

impl StreamManager {
    pub fn new(tree: Arc<StateTree>, router: Arc<Router>) -> Self {
        Self {
            tree,
            router,
            streams: Mutex::new(HashMap::new()),
            sinks: Mutex::new(HashMap::new()),
            next_stream: AtomicU32::new(1),
            next_sink: AtomicU32::new(1),
        }
    }

    pub fn tree(&self) -> &Arc<StateTree> {
        &self.tree
    }

    // === Serving side ===

    /// Allocate a stream for `subscriber`, scoped to `conn`.
    ///
    /// `sink_id` is the subscriber's sink the events are addressed to.
    pub fn open(&self, conn: Option<ConnectionId>, subscriber: Iid, sink_id: u32) -> StreamId {
        let mut streams = self.streams.lock();
        let id = loop {
            let id = self.next_stream.fetch_add(1, Ordering::Relaxed);
            if id != 0 && !streams.contains_key(&id) {
                break id;
            }
        };
        streams.insert(
            id,
            StreamEntry {
                conn,
                subscriber,
                sink_id,
                prefix: None,
                task: None,
            },
        );
        debug!(stream = id, subscriber = %subscriber, conn = ?conn, "Stream opened");
        id
    }

    /// Start forwarding changes under `prefix` on a stream.
    ///
    /// Must run inside the runtime; the forwarding task is spawned on it.
    pub fn subscribe(self: &Arc<Self>, stream_id: StreamId, prefix: Oid) -> Result<(), StreamError> {
        let mut streams = self.streams.lock();
        let entry = streams
            .get_mut(&stream_id)
            .ok_or(StreamError::NotFound(stream_id))?;
        if entry.task.is_some() {
            return Err(StreamError::AlreadySubscribed(stream_id));
        }

        let mut listener = self.tree.listen(prefix.clone())?;
        let router = Arc::clone(&self.router);
        let subscriber = entry.subscriber;
        let sink_id = entry.sink_id;
        let manager = Arc::downgrade(self);
        entry.task = Some(tokio::spawn(async move {
            while let Some(event) = listener.recv().await {
                let payload = event.encode();
                let envelope = Envelope::event(router.local_iid(), subscriber, sink_id, payload)
                    .with_ttl(router.default_ttl());
                if let RouteOutcome::Failed(status) = router.forward_event(envelope, None).await {
                    debug!(
                        stream = stream_id,
                        subscriber = %subscriber,
                        oid = %event.oid,
                        status = %status,
                        "Subscriber unreachable, ending stream"
                    );
                    if let Some(manager) = manager.upgrade() {
                        manager.detach(stream_id);
                    }
                    break;
                }
            }
        }));
        debug!(stream = stream_id, prefix = %prefix, "Stream subscribed");
        entry.prefix = Some(prefix);
        Ok(())
    }

    /// Close a stream, detaching its listener.
    pub fn close(&self, stream_id: StreamId) -> Result<(), StreamError> {
        let entry = self
            .streams
            .lock()
            .remove(&stream_id)
            .ok_or(StreamError::NotFound(stream_id))?;
        Self::stop(stream_id, entry);
        Ok(())
    }

    /// Close a stream on behalf of `requester`, which must be its subscriber.
    pub fn close_for(&self, stream_id: StreamId, requester: Iid) -> Result<(), StreamError> {
        let mut streams = self.streams.lock();
        let entry = streams
            .get(&stream_id)
            .ok_or(StreamError::NotFound(stream_id))?;
        if entry.subscriber != requester {
            return Err(StreamError::NotOwner {
                stream: stream_id,
                iid: requester,
            });
        }
        if let Some(entry) = streams.remove(&stream_id) {
            drop(streams);
            Self::stop(stream_id, entry);
        }
        Ok(())
    }

    /// Close every stream scoped to `conn`; returns how many.
    pub fn close_connection(&self, conn: ConnectionId) -> usize {
        let closed: Vec<(StreamId, StreamEntry)> = {
            let mut streams = self.streams.lock();
            let ids: Vec<StreamId> = streams
                .iter()
                .filter(|(_, e)| e.conn == Some(conn))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| streams.remove(&id).map(|e| (id, e)))
                .collect()
        };
        let count = closed.len();
        for (id, entry) in closed {
            Self::stop(id, entry);
        }
        count
    }

    /// Remove a stream from inside its own forwarding task.
    fn detach(&self, stream_id: StreamId) {
        let entry = self.streams.lock().remove(&stream_id);
        if let Some(mut entry) = entry {
            entry.task.take();
            Self::stop(stream_id, entry);
        }
    }

    fn stop(stream_id: StreamId, entry: StreamEntry) {
        if let Some(task) = entry.task {
            task.abort();
        }
        debug!(
            stream = stream_id,
            subscriber = %entry.subscriber,
            prefix = ?entry.prefix.map(|p| p.to_string()),
            "Stream closed"
        );
    }

    /// Streams currently served.
    pub fn stream_count(&self) -> usize {
        self.streams.lock().len()
    }

    /// Whether a stream is open.
    pub fn contains(&self, stream_id: StreamId) -> bool {
        self.streams.lock().contains_key(&stream_id)
    }

    /// Close everything on both sides.
    pub fn close_all(&self) {
        let streams: Vec<_> = self.streams.lock().drain().collect();
        for (id, entry) in streams {
            Self::stop(id, entry);
        }
        self.sinks.lock().clear();
    }

    // === Subscribing side ===

    /// Register a sink for events from `source`.
    ///
    /// `conn` is the egress toward the source; the sink ends when it closes.
    pub fn register_sink(
        &self,
        source: Iid,
        conn: Option<ConnectionId>,
    ) -> (u32, mpsc::UnboundedReceiver<ChangeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut sinks = self.sinks.lock();
        let id = loop {
            let id = self.next_sink.fetch_add(1, Ordering::Relaxed);
            if id != 0 && !sinks.contains_key(&id) {
                break id;
            }
        };
        sinks.insert(id, Sink { source, conn, tx });
        (id, rx)
    }

    /// Forget a sink; later events for it are dropped.
    pub fn remove_sink(&self, sink_id: u32) -> bool {
        self.sinks.lock().remove(&sink_id).is_some()
    }

    /// Sinks currently registered.
    pub fn sink_count(&self) -> usize {
        self.sinks.lock().len()
    }
}

impl EventSink for StreamManager {
    fn deliver_event(&self, envelope: Envelope) {
        if let Some(source) = envelope.ended_source() {
            let mut sinks = self.sinks.lock();
            if sinks
                .get(&envelope.request_id)
                .is_some_and(|sink| sink.source == source)
            {
                sinks.remove(&envelope.request_id);
                debug!(
                    source = %source,
                    notifier = %envelope.src,
                    sink = envelope.request_id,
                    "Stream ended upstream"
                );
            }
            return;
        }
        let event = match ChangeEvent::decode(&envelope.payload) {
            Ok(event) => event,
            Err(e) => {
                debug!(src = %envelope.src, error = %e, "Malformed stream event");
                return;
            }
        };
        let mut sinks = self.sinks.lock();
        let Some(sink) = sinks.get(&envelope.request_id) else {
            trace!(src = %envelope.src, sink = envelope.request_id, "Event for unknown sink");
            return;
        };
        if sink.source != envelope.src {
            debug!(
                src = %envelope.src,
                expected = %sink.source,
                sink = envelope.request_id,
                "Event from unexpected source, dropping"
            );
            return;
        }
        if sink.tx.send(event).is_err() {
            sinks.remove(&envelope.request_id);
        }
    }
}

impl ConnectionObserver for StreamManager {
    fn connection_closed(&self, conn: &Connection) {
        let id = conn.id();
        let closed = self.close_connection(id);
        let dropped = {
            let mut sinks = self.sinks.lock();
            let before = sinks.len();
            sinks.retain(|_, sink| sink.conn != Some(id));
            before - sinks.len()
        };
        if closed > 0 || dropped > 0 {
            debug!(
                conn = %id,
                streams = closed,
                sinks = dropped,
                "Streams of closed connection torn down"
            );
        }
    }
}
