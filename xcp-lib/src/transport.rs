use crate::constants::STREAM_BUFFER_SIZE;
use crate::error::TransportError;
use crate::packet::Framing;
use bytes::Bytes;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info};

/// Byte link to a slave.
///
/// Methods take `&self`: one transport is shared by the command engine and
/// the DTO receiver, and the engine's command lock decides who talks.
pub trait Transport: Send + Sync + 'static {
    /// Frame layout expected by the link
    fn framing(&self) -> Framing;

    /// Send one complete frame
    fn send(&self, frame: Bytes) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Wait up to `timeout` for one packet. Returns `TransportError::Timeout`
    /// if nothing arrived.
    fn receive(&self, timeout: Duration) -> impl Future<Output = Result<Bytes, TransportError>> + Send;
}

/// Stream-framed transport over a TCP socket
pub struct TcpTransport {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    peer: SocketAddr,
}

impl TcpTransport {
    /// Open a TCP connection to a slave
    pub async fn connect(addr: impl ToSocketAddrs, connect_timeout: Duration) -> Result<Self, TransportError> {
        let stream = timeout(connect_timeout, TcpStream::connect(addr)).await??;
        Self::from_stream(stream)
    }

    pub fn from_stream(stream: TcpStream) -> Result<Self, TransportError> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        info!(%peer, "Connected to XCP slave");
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            peer,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl Transport for TcpTransport {
    fn framing(&self) -> Framing {
        Framing::Stream
    }

    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        debug!(len = frame.len(), "Sent frame");
        Ok(())
    }

    async fn receive(&self, wait: Duration) -> Result<Bytes, TransportError> {
        let mut reader = self.reader.lock().await;
        let mut buffer = vec![0u8; STREAM_BUFFER_SIZE];
        let n = timeout(wait, reader.read(&mut buffer)).await??;
        if n == 0 {
            return Err(TransportError::Closed);
        }
        buffer.truncate(n);
        Ok(Bytes::from(buffer))
    }
}
