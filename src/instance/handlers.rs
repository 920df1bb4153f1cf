//! Core capabilities every instance serves.

use crate::dispatch::{HandlerDescriptor, HandlerError, Reply, RequestContext};
use crate::protocol::{
    MessageType, SnapshotRequest, StateValue, StreamOpen, StreamRef, Subtree, MAX_PAYLOAD_SIZE,
};
use crate::state::{Oid, StateTree};
use crate::stream::{StreamError, StreamManager};
use std::sync::Arc;
use tracing::debug;

/// PING → PONG, echoing the payload.
fn ping(_: &RequestContext, payload: &[u8]) -> Result<Reply, HandlerError> {
    Ok(Reply::new(MessageType::PONG, payload.to_vec()))
}

fn stream_open(
    streams: &Arc<StreamManager>,
    ctx: &RequestContext,
    payload: &[u8],
) -> Result<Reply, HandlerError> {
    let request = StreamOpen::decode(payload)?;
    let stream_id = streams.open(ctx.ingress, ctx.source, request.sink_id);
    if let Err(e) = streams.subscribe(stream_id, request.prefix) {
        let _ = streams.close(stream_id);
        return Err(HandlerError::Failed(e.to_string()));
    }
    Ok(Reply::new(MessageType::STREAM_OPENED, StreamRef { stream_id }.encode()))
}

fn stream_close(
    streams: &StreamManager,
    ctx: &RequestContext,
    payload: &[u8],
) -> Result<Reply, HandlerError> {
    let request = StreamRef::decode(payload)?;
    match streams.close_for(request.stream_id, ctx.source) {
        Ok(()) => {}
        // Already gone; closing is idempotent for the subscriber.
        Err(StreamError::NotFound(id)) => {
            debug!(stream = id, src = %ctx.source, "Close for unknown stream");
        }
        Err(e) => return Err(HandlerError::InvalidRequest(e.to_string())),
    }
    Ok(Reply::new(MessageType::STREAM_CLOSED, request.encode()))
}

fn state_get(tree: &StateTree, payload: &[u8]) -> Result<Reply, HandlerError> {
    let (oid, _) = Oid::decode(payload)?;
    let value = StateValue {
        snapshot: tree.snapshot(&oid),
    };
    Ok(Reply::new(MessageType::STATE_VALUE, value.encode()))
}

fn state_snapshot(tree: &StateTree, payload: &[u8]) -> Result<Reply, HandlerError> {
    let request = SnapshotRequest::decode(payload)?;
    if let Some(stray) = request.whitelist.iter().find(|w| !w.starts_with(&request.prefix)) {
        return Err(HandlerError::InvalidRequest(format!(
            "whitelisted {} is outside {}",
            stray, request.prefix
        )));
    }
    let subtree = Subtree {
        entries: tree.snapshot_subtree(&request.prefix, &request.whitelist),
    };
    let encoded = subtree.encode();
    if encoded.len() > MAX_PAYLOAD_SIZE {
        return Err(HandlerError::Failed(format!(
            "snapshot of {} is {} bytes, over the payload limit",
            request.prefix,
            encoded.len()
        )));
    }
    Ok(Reply::new(MessageType::STATE_SUBTREE, encoded))
}

/// Handlers for the core message types.
pub(super) fn core_capabilities(
    streams: &Arc<StreamManager>,
) -> Vec<(MessageType, HandlerDescriptor)> {
    let open = Arc::clone(streams);
    let close = Arc::clone(streams);
    let tree = Arc::clone(streams.tree());
    let subtree = Arc::clone(streams.tree());
    vec![
        (MessageType::PING, HandlerDescriptor::new("ping", ping)),
        (
            MessageType::STREAM_OPEN,
            HandlerDescriptor::new(
                "stream-open",
                move |ctx: &RequestContext, payload: &[u8]| -> Result<Reply, HandlerError> {
                    stream_open(&open, ctx, payload)
                },
            ),
        ),
        (
            MessageType::STREAM_CLOSE,
            HandlerDescriptor::new(
                "stream-close",
                move |ctx: &RequestContext, payload: &[u8]| -> Result<Reply, HandlerError> {
                    stream_close(&close, ctx, payload)
                },
            ),
        ),
        (
            MessageType::STATE_GET,
            HandlerDescriptor::new(
                "state-get",
                move |_: &RequestContext, payload: &[u8]| -> Result<Reply, HandlerError> {
                    state_get(&tree, payload)
                },
            ),
        ),
        (
            MessageType::STATE_SNAPSHOT,
            HandlerDescriptor::new(
                "state-snapshot",
                move |_: &RequestContext, payload: &[u8]| -> Result<Reply, HandlerError> {
                    state_snapshot(&subtree, payload)
                },
            ),
        ),
    ]
}
