//! TCP Transport
//!
//! Length-prefixed framing over any byte stream: each frame is a 4-byte
//! little-endian length followed by that many bytes. The stream is wrapped
//! in a [`Framed`] codec and split; a reader task and a writer task bridge
//! the two halves to a [`Link`].

use super::{frame_channel, FrameRx, FrameTx, Link, LinkDirection, TransportError};
use crate::protocol::{ENVELOPE_HEADER_SIZE, MAX_PAYLOAD_SIZE};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

/// Largest frame accepted: a full envelope plus the link type byte.
pub const MAX_FRAME_SIZE: usize = 1 + ENVELOPE_HEADER_SIZE + MAX_PAYLOAD_SIZE;

/// Codec for fabric frames: u32 little-endian length, bounded by
/// [`MAX_FRAME_SIZE`] in both directions.
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .little_endian()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_SIZE)
        .new_codec()
}

/// Listening socket producing inbound links.
pub struct TcpAcceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
    buffer: usize,
}

impl TcpAcceptor {
    /// Bind a listening socket.
    pub async fn bind(addr: &str, buffer: usize) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::Bind {
                addr: addr.to_string(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        info!(local_addr = %local_addr, "TCP acceptor listening");
        Ok(Self {
            listener,
            local_addr,
            buffer,
        })
    }

    /// The bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the next inbound connection.
    pub async fn accept(&self) -> Result<Link, TransportError> {
        let (stream, remote_addr) = self.listener.accept().await?;
        let _ = stream.set_nodelay(true);
        debug!(remote_addr = %remote_addr, "TCP connection accepted");
        Ok(framed(
            stream,
            self.buffer,
            LinkDirection::Inbound,
            remote_addr.to_string(),
        ))
    }
}

/// Dial a remote instance.
pub async fn connect(addr: &str, buffer: usize) -> Result<Link, TransportError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| TransportError::Connect {
            addr: addr.to_string(),
            source: e,
        })?;
    let _ = stream.set_nodelay(true);
    debug!(remote_addr = %addr, "TCP connection established");
    Ok(framed(stream, buffer, LinkDirection::Outbound, addr.to_string()))
}

/// Bridge a byte stream to a link, spawning its reader and writer tasks.
pub fn framed<S>(stream: S, buffer: usize, direction: LinkDirection, remote_addr: String) -> Link
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, frames) = Framed::new(stream, frame_codec()).split();
    let (out_tx, out_rx) = frame_channel(buffer);
    let (in_tx, in_rx) = frame_channel(buffer);

    let label = remote_addr.clone();
    tokio::spawn(async move {
        read_loop(frames, in_tx, &label).await;
    });
    let label = remote_addr.clone();
    tokio::spawn(async move {
        write_loop(sink, out_rx, &label).await;
    });

    Link::new(out_tx, in_rx, direction).with_remote_addr(remote_addr)
}

async fn read_loop<S>(
    mut frames: SplitStream<Framed<S, LengthDelimitedCodec>>,
    inbound: FrameTx,
    remote: &str,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match frames.next().await {
            Some(Ok(frame)) => {
                if inbound.send(frame.to_vec()).await.is_err() {
                    break;
                }
            }
            Some(Err(e)) => {
                warn!(remote_addr = %remote, error = %e, "TCP read failed");
                break;
            }
            None => {
                debug!(remote_addr = %remote, "TCP stream closed by peer");
                break;
            }
        }
    }
}

async fn write_loop<S>(
    mut sink: SplitSink<Framed<S, LengthDelimitedCodec>, Bytes>,
    mut outbound: FrameRx,
    remote: &str,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(frame) = outbound.recv().await {
        if frame.len() > MAX_FRAME_SIZE {
            let e = TransportError::FrameTooLarge {
                size: frame.len(),
                max: MAX_FRAME_SIZE,
            };
            warn!(remote_addr = %remote, error = %e, "Dropping outbound frame");
            continue;
        }
        if let Err(e) = sink.send(Bytes::from(frame)).await {
            warn!(remote_addr = %remote, error = %e, "TCP write failed");
            break;
        }
    }
    let _ = sink.close().await;
    debug!(remote_addr = %remote, "TCP writer stopped");
}
