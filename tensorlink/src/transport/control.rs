//! Length-prefixed control frames over TCP.
//!
//! Each frame is `[len: u32 LE][payload]`, where the payload is an encoded
//! `ControlFrame`.

use crate::error::{Result, TransportError};
use crate::protocol::ControlFrame;
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

/// Maximum control frame size (64 MiB, about 2.4M region descriptors).
const MAX_CONTROL_FRAME: usize = 64 * 1024 * 1024;

/// Read half of a control channel.
pub struct ControlReader {
    inner: OwnedReadHalf,
}

/// Write half of a control channel.
pub struct ControlWriter {
    inner: OwnedWriteHalf,
}

/// A connected control channel.
pub struct ControlChannel {
    reader: ControlReader,
    writer: ControlWriter,
    local: SocketAddr,
    peer: SocketAddr,
}

impl ControlChannel {
    fn from_stream(stream: TcpStream) -> Result<Self> {
        stream
            .set_nodelay(true)
            .map_err(|e| TransportError::transport_io("control set_nodelay", e))?;
        let local = stream.local_addr()?;
        let peer = stream.peer_addr()?;
        let (rd, wr) = stream.into_split();
        Ok(Self {
            reader: ControlReader { inner: rd },
            writer: ControlWriter { inner: wr },
            local,
            peer,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub async fn send(&mut self, frame: &ControlFrame) -> Result<()> {
        self.writer.send(frame).await
    }

    pub async fn recv(&mut self) -> Result<ControlFrame> {
        self.reader.recv().await
    }

    pub fn into_split(self) -> (ControlReader, ControlWriter) {
        (self.reader, self.writer)
    }
}

impl ControlWriter {
    pub async fn send(&mut self, frame: &ControlFrame) -> Result<()> {
        let payload = frame.encode()?;
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|&n| n as usize <= MAX_CONTROL_FRAME)
            .ok_or_else(|| {
                TransportError::Protocol(format!(
                    "control frame of {} bytes exceeds limit",
                    payload.len()
                ))
            })?;
        self.inner
            .write_all(&len.to_le_bytes())
            .await
            .map_err(|e| TransportError::transport_io("control write len", e))?;
        self.inner
            .write_all(&payload)
            .await
            .map_err(|e| TransportError::transport_io("control write payload", e))?;
        self.inner
            .flush()
            .await
            .map_err(|e| TransportError::transport_io("control flush", e))?;
        Ok(())
    }
}

impl ControlReader {
    /// Read the next frame. EOF maps to `ConnectionLost`.
    pub async fn recv(&mut self) -> Result<ControlFrame> {
        let mut len_buf = [0u8; 4];
        self.inner
            .read_exact(&mut len_buf)
            .await
            .map_err(|e| TransportError::transport_io("control read len", e))?;
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_CONTROL_FRAME {
            return Err(TransportError::Protocol(format!(
                "control frame of {len} bytes exceeds limit"
            )));
        }
        let mut payload = vec![0u8; len];
        self.inner
            .read_exact(&mut payload)
            .await
            .map_err(|e| TransportError::transport_io("control read payload", e))?;
        ControlFrame::decode(Bytes::from(payload))
    }
}

/// Bind a control listener.
pub async fn control_listen(addr: SocketAddr) -> Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| TransportError::connect(addr, format!("bind: {e}")))?;
    let local = listener.local_addr()?;
    Ok((listener, local))
}

/// Dial a control listener, bounded by `timeout`.
pub async fn control_connect(addr: SocketAddr, timeout: Duration) -> Result<ControlChannel> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::connect(addr, format!("timed out after {timeout:?}")))?
        .map_err(|e| TransportError::connect(addr, e.to_string()))?;
    ControlChannel::from_stream(stream)
}

/// Accept one control connection.
///
/// Failures are `Connect` errors against the listen address, the same class
/// as a failed dial.
pub async fn control_accept(listener: &TcpListener) -> Result<ControlChannel> {
    let (stream, _addr) = listener
        .accept()
        .await
        .map_err(|e| accept_error(listener.local_addr().ok(), &e))?;
    ControlChannel::from_stream(stream)
}

fn accept_error(local: Option<SocketAddr>, e: &std::io::Error) -> TransportError {
    let addr = local.map_or_else(|| "control listener".to_string(), |a| a.to_string());
    TransportError::connect(addr, format!("accept: {e}"))
}
