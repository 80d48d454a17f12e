//! Control channel frames.
//!
//! ```text
//! Hello:  [0x01][version: u16][fabric: u8][recv_depth: u32][max_message: u32]
//!         [ep_len: u16][endpoint][BufferSet]
//! Ready:  [0x02]
//! Reject: [0x03][reason_len: u16][reason: utf-8]
//! Close:  [0x04]
//! ```
//!
//! The server speaks first: `Hello` (or `Reject` when it already has a peer),
//! then the client answers with its own `Hello`, then the server confirms
//! with `Ready` once its queue pair is connected.

use crate::error::{Result, TransportError};
use crate::memory::BufferSet;
use bytes::{Buf, BufMut, Bytes, BytesMut};

const TYPE_HELLO: u8 = 1;
const TYPE_READY: u8 = 2;
const TYPE_REJECT: u8 = 3;
const TYPE_CLOSE: u8 = 4;

/// One side's half of the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub version: u16,
    pub fabric: u8,
    /// Two-sided messages this side can buffer before returning credits.
    pub recv_depth: u32,
    /// Largest tag + payload this side accepts in one message.
    pub max_message_bytes: u32,
    /// Fabric-specific queue pair endpoint.
    pub endpoint: Bytes,
    pub buffers: BufferSet,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    Hello(Hello),
    Ready,
    Reject { reason: String },
    Close,
}

impl ControlFrame {
    pub fn name(&self) -> &'static str {
        match self {
            ControlFrame::Hello(_) => "hello",
            ControlFrame::Ready => "ready",
            ControlFrame::Reject { .. } => "reject",
            ControlFrame::Close => "close",
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        match self {
            ControlFrame::Hello(h) => {
                let ep_len = u16::try_from(h.endpoint.len()).map_err(|_| {
                    TransportError::Protocol(format!(
                        "endpoint of {} bytes is too large",
                        h.endpoint.len()
                    ))
                })?;
                buf.reserve(14 + h.endpoint.len() + h.buffers.encoded_len());
                buf.put_u8(TYPE_HELLO);
                buf.put_u16_le(h.version);
                buf.put_u8(h.fabric);
                buf.put_u32_le(h.recv_depth);
                buf.put_u32_le(h.max_message_bytes);
                buf.put_u16_le(ep_len);
                buf.put_slice(&h.endpoint);
                h.buffers.encode(&mut buf);
            }
            ControlFrame::Ready => buf.put_u8(TYPE_READY),
            ControlFrame::Reject { reason } => {
                let reason = truncate_utf8(reason, u16::MAX as usize);
                buf.put_u8(TYPE_REJECT);
                buf.put_u16_le(reason.len() as u16);
                buf.put_slice(reason.as_bytes());
            }
            ControlFrame::Close => buf.put_u8(TYPE_CLOSE),
        }
        Ok(buf.freeze())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        if buf.is_empty() {
            return Err(TransportError::Protocol("empty control frame".into()));
        }
        let frame = match buf.get_u8() {
            TYPE_HELLO => {
                if buf.remaining() < 13 {
                    return Err(TransportError::Protocol("hello truncated".into()));
                }
                let version = buf.get_u16_le();
                let fabric = buf.get_u8();
                let recv_depth = buf.get_u32_le();
                let max_message_bytes = buf.get_u32_le();
                let ep_len = buf.get_u16_le() as usize;
                if buf.remaining() < ep_len {
                    return Err(TransportError::Protocol("hello endpoint truncated".into()));
                }
                let endpoint = buf.split_to(ep_len);
                let buffers = BufferSet::decode(&mut buf)?;
                ControlFrame::Hello(Hello {
                    version,
                    fabric,
                    recv_depth,
                    max_message_bytes,
                    endpoint,
                    buffers,
                })
            }
            TYPE_READY => ControlFrame::Ready,
            TYPE_REJECT => {
                if buf.remaining() < 2 {
                    return Err(TransportError::Protocol("reject truncated".into()));
                }
                let len = buf.get_u16_le() as usize;
                if buf.remaining() < len {
                    return Err(TransportError::Protocol("reject reason truncated".into()));
                }
                let reason = String::from_utf8_lossy(&buf.split_to(len)).into_owned();
                ControlFrame::Reject { reason }
            }
            TYPE_CLOSE => ControlFrame::Close,
            other => {
                return Err(TransportError::Protocol(format!(
                    "unknown control frame type {other}"
                )));
            }
        };
        if buf.has_remaining() {
            return Err(TransportError::Protocol(format!(
                "{} trailing bytes after {} frame",
                buf.remaining(),
                frame.name()
            )));
        }
        Ok(frame)
    }
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
