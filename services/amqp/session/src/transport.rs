//! Transport abstraction and the tokio TCP adapter.
//!
//! The engine only needs an ordered, fire-and-forget sink for encoded
//! frames. [`ChannelTransport`] provides one by pushing into an unbounded
//! queue that a single writer task drains into the socket, so write order is
//! the order of `send` calls.

use crate::error::TransportError;
use bytes::Bytes;
use std::net::SocketAddr;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

/// Outbound half of a connection as seen by the engine
pub trait Transport {
    /// Queue one encoded frame (or the protocol header) for writing
    fn send(&mut self, frame: Bytes) -> Result<(), TransportError>;

    /// Stop accepting frames and shut the connection down
    fn close(&mut self);
}

/// Transport that hands frames to a writer task
#[derive(Debug)]
pub struct ChannelTransport {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
}

impl ChannelTransport {
    /// Create the transport and the receiver its writer task drains
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }
}

impl Transport for ChannelTransport {
    fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        match &self.tx {
            Some(tx) => tx.send(frame).map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    fn close(&mut self) {
        // dropping the sender ends the writer loop, which shuts the socket down
        self.tx = None;
    }
}

/// Spawn the task that writes queued frames in order
pub fn spawn_writer<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Bytes>) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            trace!("Writing {} bytes", frame.len());
            if let Err(e) = writer.write_all(&frame).await {
                error!("Failed to write frame: {}", e);
                break;
            }
        }
        if let Err(e) = writer.shutdown().await {
            debug!("Writer shutdown: {}", e);
        }
        debug!("Writer task stopped");
    })
}

/// Connect to a broker over TCP with Nagle disabled
pub async fn connect_tcp(
    addr: impl ToSocketAddrs,
) -> Result<(TcpStream, SocketAddr), TransportError> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    let peer = stream.peer_addr()?;
    Ok((stream, peer))
}
