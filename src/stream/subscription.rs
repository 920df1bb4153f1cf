//! Subscriber handle for a state stream.

use super::{StreamError, StreamId, StreamManager};
use crate::dispatch::{Dispatcher, SendOptions};
use crate::identity::Iid;
use crate::protocol::{MessageType, StreamOpen, StreamRef};
use crate::state::{ChangeEvent, Listener, Oid, StateError};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

enum Source {
    Remote {
        source: Iid,
        stream_id: StreamId,
        sink_id: u32,
        rx: mpsc::UnboundedReceiver<ChangeEvent>,
        streams: Arc<StreamManager>,
        dispatcher: Arc<Dispatcher>,
        closed: bool,
    },
    Local(Listener),
}

/// Ordered change events for one OID prefix.
///
/// Dropping a remote subscription without [`close`](Self::close) still
/// asks the source to close the stream, provided a runtime is available.
pub struct Subscription {
    prefix: Oid,
    source: Source,
}

impl Subscription {
    /// Open a stream on `dest` for changes under `prefix`.
    pub async fn open(
        streams: Arc<StreamManager>,
        dispatcher: Arc<Dispatcher>,
        dest: Iid,
        prefix: Oid,
        options: SendOptions,
    ) -> Result<Self, StreamError> {
        if !prefix.is_valid_depth() {
            return Err(StateError::InvalidOid(prefix).into());
        }
        let egress = dispatcher.router().resolve(dest).map(|hop| hop.conn);
        let (sink_id, rx) = streams.register_sink(dest, egress);
        let request = StreamOpen {
            sink_id,
            prefix: prefix.clone(),
        };

        let opened = dispatcher
            .send(dest, MessageType::STREAM_OPEN, request.encode(), options)
            .await
            .map_err(StreamError::from)
            .and_then(|resp| Ok(StreamRef::decode(&resp.payload)?));
        let stream_id = match opened {
            Ok(stream) => stream.stream_id,
            Err(e) => {
                streams.remove_sink(sink_id);
                return Err(e);
            }
        };
        debug!(
            source = %dest,
            stream = stream_id,
            sink = sink_id,
            prefix = %prefix,
            "Subscribed"
        );

        Ok(Self {
            prefix,
            source: Source::Remote {
                source: dest,
                stream_id,
                sink_id,
                rx,
                streams,
                dispatcher,
                closed: false,
            },
        })
    }

    /// Tap the local tree directly.
    pub fn local(listener: Listener) -> Self {
        Self {
            prefix: listener.prefix().clone(),
            source: Source::Local(listener),
        }
    }

    pub fn prefix(&self) -> &Oid {
        &self.prefix
    }

    /// Instance producing the events; `None` for a local tap.
    pub fn source(&self) -> Option<Iid> {
        match &self.source {
            Source::Remote { source, .. } => Some(*source),
            Source::Local(_) => None,
        }
    }

    /// The source's stream id; `None` for a local tap.
    pub fn stream_id(&self) -> Option<StreamId> {
        match &self.source {
            Source::Remote { stream_id, .. } => Some(*stream_id),
            Source::Local(_) => None,
        }
    }

    /// Wait for the next event.
    ///
    /// Returns `None` once the stream has ended (closed, or the connection
    /// toward the source went away).
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        match &mut self.source {
            Source::Remote { rx, .. } => rx.recv().await,
            Source::Local(listener) => listener.recv().await,
        }
    }

    /// Take an already-queued event without waiting.
    pub fn try_next(&mut self) -> Option<ChangeEvent> {
        match &mut self.source {
            Source::Remote { rx, .. } => rx.try_recv().ok(),
            Source::Local(listener) => listener.try_recv(),
        }
    }

    /// End the subscription, closing the remote stream.
    pub async fn close(mut self) -> Result<(), StreamError> {
        let Source::Remote {
            source,
            stream_id,
            sink_id,
            streams,
            dispatcher,
            closed,
            ..
        } = &mut self.source
        else {
            return Ok(());
        };
        *closed = true;
        streams.remove_sink(*sink_id);
        let request = StreamRef {
            stream_id: *stream_id,
        };
        dispatcher
            .send(*source, MessageType::STREAM_CLOSE, request.encode(), SendOptions::new())
            .await?;
        Ok(())
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("prefix", &self.prefix)
            .field("source", &self.source())
            .field("stream_id", &self.stream_id())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Source::Remote {
            source,
            stream_id,
            sink_id,
            streams,
            dispatcher,
            closed,
            ..
        } = &self.source
        else {
            return;
        };
        if *closed {
            return;
        }
        streams.remove_sink(*sink_id);
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let dispatcher = Arc::clone(dispatcher);
        let dest = *source;
        let payload = StreamRef {
            stream_id: *stream_id,
        }
        .encode();
        handle.spawn(async move {
            let _ = dispatcher
                .send(dest, MessageType::STREAM_CLOSE, payload, SendOptions::new())
                .await;
        });
    }
}
