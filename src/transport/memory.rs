//! In-process links backed by a pair of channels.

use super::{frame_channel, Link, LinkDirection};

/// Create two connected links, `(outbound, inbound)`.
///
/// Frames sent on one end arrive in order on the other. Dropping either
/// end closes the pipe in both directions once queued frames are drained.
pub fn memory_pair(buffer: usize) -> (Link, Link) {
    let (a_tx, b_rx) = frame_channel(buffer);
    let (b_tx, a_rx) = frame_channel(buffer);
    (
        Link::new(a_tx, a_rx, LinkDirection::Outbound).with_remote_addr("memory"),
        Link::new(b_tx, b_rx, LinkDirection::Inbound).with_remote_addr("memory"),
    )
}
