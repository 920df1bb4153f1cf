//! Requests and streams relayed on behalf of other instances.
//!
//! A transit instance remembers each request it forwards, keyed by the
//! egress connection, until the matching response passes back. When the
//! egress connection closes the remembered requests are answered with a
//! routing failure so that remote callers fail fast.
//!
//! Relayed streams are remembered per ingress connection, one entry per
//! source and subscriber sink, from the moment their STREAM_OPEN is
//! answered and again with every event. When the ingress closes, the
//! source is gone and each subscriber is told its stream ended.

use crate::identity::Iid;
use crate::protocol::{Envelope, MessageType, ResponseStatus, StreamOpen};
use crate::transport::ConnectionId;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Enough of a relayed request to synthesize its failure response.
#[derive(Clone, Debug)]
pub struct RelayedRequest {
    pub src: Iid,
    pub dest: Iid,
    pub request_id: u32,
    pub msg_type: MessageType,
    /// Connection the request arrived on.
    pub origin: ConnectionId,
    /// Subscriber sink of a relayed STREAM_OPEN.
    pub sink_id: Option<u32>,
    pub forwarded_at: Instant,
}

impl RelayedRequest {
    /// Rebuild a request envelope carrying the original addressing.
    pub fn to_request(&self) -> Envelope {
        Envelope::request(self.src, self.dest, self.request_id, self.msg_type, Vec::new())
    }
}

/// A stream whose events pass through this instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RelayedStream {
    /// Instance serving the stream.
    pub source: Iid,
    /// Instance receiving its events.
    pub subscriber: Iid,
    /// Subscriber's sink the events are addressed to.
    pub sink_id: u32,
}

impl RelayedStream {
    /// The stream an event envelope belongs to.
    pub fn of(event: &Envelope) -> Self {
        Self {
            source: event.src,
            subscriber: event.dest,
            sink_id: event.request_id,
        }
    }
}

/// Relayed requests by egress connection, relayed streams by ingress.
#[derive(Debug, Default)]
pub struct RelayTracker {
    by_egress: HashMap<ConnectionId, HashMap<(Iid, u32), RelayedRequest>>,
    streams: HashMap<ConnectionId, HashMap<RelayedStream, ConnectionId>>,
}

impl RelayTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a request that arrived on `origin` and left through `egress`.
    pub fn record(
        &mut self,
        egress: ConnectionId,
        origin: ConnectionId,
        request: &Envelope,
        now: Instant,
    ) {
        let sink_id = (request.msg_type == MessageType::STREAM_OPEN)
            .then(|| StreamOpen::decode(&request.payload).ok())
            .flatten()
            .map(|open| open.sink_id);
        self.by_egress.entry(egress).or_default().insert(
            (request.src, request.request_id),
            RelayedRequest {
                src: request.src,
                dest: request.dest,
                request_id: request.request_id,
                msg_type: request.msg_type,
                origin,
                sink_id,
                forwarded_at: now,
            },
        );
    }

    /// Forget the request answered by a response arriving on `ingress`.
    ///
    /// A successful STREAM_OPEN answer starts tracking the opened stream.
    pub fn complete(&mut self, ingress: ConnectionId, response: &Envelope) -> Option<RelayedRequest> {
        let pending = self.by_egress.get_mut(&ingress)?;
        let removed = pending.remove(&(response.dest, response.request_id));
        if pending.is_empty() {
            self.by_egress.remove(&ingress);
        }
        let relayed = removed?;
        if let Some(sink_id) = relayed.sink_id {
            if response.status == ResponseStatus::Ok {
                let stream = RelayedStream {
                    source: response.src,
                    subscriber: response.dest,
                    sink_id,
                };
                self.record_stream(ingress, relayed.origin, stream);
            }
        }
        Some(relayed)
    }

    /// Take every request still awaiting a response through `egress`.
    pub fn take_connection(&mut self, egress: ConnectionId) -> Vec<RelayedRequest> {
        self.by_egress
            .remove(&egress)
            .map(|m| m.into_values().collect())
            .unwrap_or_default()
    }

    /// Remember a stream whose events arrive on `ingress` and leave on `egress`.
    pub fn record_stream(&mut self, ingress: ConnectionId, egress: ConnectionId, stream: RelayedStream) {
        self.streams.entry(ingress).or_default().insert(stream, egress);
    }

    /// Forget a stream that ended upstream of `ingress`.
    pub fn forget_stream(&mut self, ingress: ConnectionId, stream: &RelayedStream) -> bool {
        let Some(flows) = self.streams.get_mut(&ingress) else {
            return false;
        };
        let removed = flows.remove(stream).is_some();
        if flows.is_empty() {
            self.streams.remove(&ingress);
        }
        removed
    }

    /// Take every stream fed through `conn`.
    ///
    /// Streams delivered through `conn` are forgotten as well; their
    /// subscribers are behind it and cannot be told.
    pub fn take_streams(&mut self, conn: ConnectionId) -> Vec<RelayedStream> {
        self.streams.retain(|_, flows| {
            flows.retain(|_, egress| *egress != conn);
            !flows.is_empty()
        });
        self.streams
            .remove(&conn)
            .map(|flows| flows.into_keys().collect())
            .unwrap_or_default()
    }

    /// Number of relayed streams.
    pub fn stream_count(&self) -> usize {
        self.streams.values().map(HashMap::len).sum()
    }

    /// Drop entries older than `expiry`, returning how many were dropped.
    pub fn expire(&mut self, now: Instant, expiry: Duration) -> usize {
        let mut dropped = 0;
        self.by_egress.retain(|_, pending| {
            let before = pending.len();
            pending.retain(|_, r| now.duration_since(r.forwarded_at) < expiry);
            dropped += before - pending.len();
            !pending.is_empty()
        });
        dropped
    }

    /// Number of requests awaiting a response.
    pub fn len(&self) -> usize {
        self.by_egress.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_egress.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(src: u32, id: u32) -> Envelope {
        Envelope::request(Iid::new(src), Iid::new(1000), id, MessageType::PING, vec![])
    }

    #[test]
    fn test_complete_on_response() {
        let mut tracker = RelayTracker::new();
        let now = Instant::now();
        let req = request(2000, 7);
        tracker.record(ConnectionId::new(1), ConnectionId::new(9), &req, now);
        assert_eq!(tracker.len(), 1);

        let resp = Envelope::response_to(&req, MessageType::PONG, vec![]);
        assert!(tracker.complete(ConnectionId::new(2), &resp).is_none());
        let done = tracker.complete(ConnectionId::new(1), &resp).unwrap();
        assert_eq!(done.origin, ConnectionId::new(9));
        assert_eq!(done.sink_id, None);
        assert_eq!(tracker.stream_count(), 0);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_take_connection() {
        let mut tracker = RelayTracker::new();
        let now = Instant::now();
        tracker.record(ConnectionId::new(1), ConnectionId::new(9), &request(2000, 1), now);
        tracker.record(ConnectionId::new(1), ConnectionId::new(9), &request(2001, 1), now);
        tracker.record(ConnectionId::new(2), ConnectionId::new(9), &request(2000, 2), now);

        let taken = tracker.take_connection(ConnectionId::new(1));
        assert_eq!(taken.len(), 2);
        assert_eq!(tracker.len(), 1);
        let failure_source = taken[0].to_request();
        assert_eq!(failure_source.dest, Iid::new(1000));
    }

    #[test]
    fn test_streams_by_ingress() {
        let mut tracker = RelayTracker::new();
        let agent = ConnectionId::new(1);
        let viewer = ConnectionId::new(2);
        let other_viewer = ConnectionId::new(3);

        let event = Envelope::event(Iid::new(1000), Iid::new(2000), 7, vec![]);
        let stream = RelayedStream::of(&event);
        tracker.record_stream(agent, viewer, stream);
        tracker.record_stream(agent, viewer, stream);
        let second = RelayedStream {
            sink_id: 8,
            subscriber: Iid::new(2001),
            ..stream
        };
        tracker.record_stream(agent, other_viewer, second);
        assert_eq!(tracker.stream_count(), 2);
        // Streams are not requests.
        assert!(tracker.is_empty());

        // A subscriber's link closing forgets its streams without notice.
        assert!(tracker.take_streams(other_viewer).is_empty());
        assert_eq!(tracker.stream_count(), 1);

        let ended = tracker.take_streams(agent);
        assert_eq!(ended, vec![stream]);
        assert_eq!(ended[0].source, Iid::new(1000));
        assert_eq!(ended[0].sink_id, 7);
        assert_eq!(tracker.stream_count(), 0);
    }

    #[test]
    fn test_stream_open_answer_tracks_stream() {
        let mut tracker = RelayTracker::new();
        let agent = ConnectionId::new(1);
        let viewer = ConnectionId::new(2);
        let open = StreamOpen {
            sink_id: 4,
            prefix: crate::state::Oid::from([1]),
        };
        let req = Envelope::request(
            Iid::new(2000),
            Iid::new(1000),
            11,
            MessageType::STREAM_OPEN,
            open.encode(),
        );
        tracker.record(agent, viewer, &req, Instant::now());

        let opened = Envelope::response_to(&req, MessageType::STREAM_OPENED, vec![1, 0, 0, 0]);
        let done = tracker.complete(agent, &opened).unwrap();
        assert_eq!(done.sink_id, Some(4));
        assert_eq!(
            tracker.take_streams(agent),
            vec![RelayedStream {
                source: Iid::new(1000),
                subscriber: Iid::new(2000),
                sink_id: 4,
            }]
        );

        // A refused open tracks nothing.
        tracker.record(agent, viewer, &req, Instant::now());
        let refused = Envelope::failure_to(&req, Iid::new(1000), ResponseStatus::HandlerFailed, "no");
        assert!(tracker.complete(agent, &refused).is_some());
        assert_eq!(tracker.stream_count(), 0);
    }

    #[test]
    fn test_forget_stream() {
        let mut tracker = RelayTracker::new();
        let stream = RelayedStream {
            source: Iid::new(1000),
            subscriber: Iid::new(2000),
            sink_id: 1,
        };
        tracker.record_stream(ConnectionId::new(1), ConnectionId::new(2), stream);
        assert!(!tracker.forget_stream(ConnectionId::new(2), &stream));
        assert!(tracker.forget_stream(ConnectionId::new(1), &stream));
        assert!(tracker.take_streams(ConnectionId::new(1)).is_empty());
    }

    #[test]
    fn test_expire() {
        let mut tracker = RelayTracker::new();
        let start = Instant::now();
        tracker.record(ConnectionId::new(1), ConnectionId::new(9), &request(2000, 1), start);
        let later = start + Duration::from_secs(50);
        tracker.record(ConnectionId::new(1), ConnectionId::new(9), &request(2000, 2), later);

        let dropped = tracker.expire(start + Duration::from_secs(60), Duration::from_secs(30));
        assert_eq!(dropped, 1);
        assert_eq!(tracker.len(), 1);
    }
}
