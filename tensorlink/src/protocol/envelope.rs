//! Two-sided message framing.
//!
//! Every message on the two-sided path is a `DataFrame`:
//!
//! ```text
//! [frame_type: u8][body]
//! ```
//!
//! An envelope body is a fixed 24-byte header followed by the tag and the
//! payload (little-endian):
//!
//! ```text
//! [id: u64][length: u64][tag_len: u16][kind: u8][reserved: u8][region: u32][tag][payload]
//! ```
//!
//! For `EnvelopeKind::Message`, `length` is the payload size. For a write
//! notice there is no payload and `length` is the number of bytes written.

use crate::error::{Result, TransportError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the fixed envelope header.
pub const ENVELOPE_HEADER_SIZE: usize = 24;

const FRAME_ENVELOPE: u8 = 1;
const FRAME_CREDIT: u8 = 2;

const KIND_MESSAGE: u8 = 0;
const KIND_WRITE_NOTICE: u8 = 1;

/// What an envelope announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    /// Payload carried inline.
    Message,
    /// A one-sided write of `length` bytes into the receiver's region
    /// `region` has completed.
    WriteNotice { region: u32 },
}

/// A tagged message delivered through `recv_message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub id: u64,
    pub length: u64,
    pub tag: Bytes,
    pub payload: Bytes,
    pub kind: EnvelopeKind,
}

impl Envelope {
    pub fn new(id: u64, tag: impl Into<Bytes>, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        Self {
            id,
            length: payload.len() as u64,
            tag: tag.into(),
            payload,
            kind: EnvelopeKind::Message,
        }
    }

    /// Notice that `length` bytes were written into the receiver's `region`.
    pub fn write_notice(id: u64, region: u32, length: u64, tag: impl Into<Bytes>) -> Self {
        Self {
            id,
            length,
            tag: tag.into(),
            payload: Bytes::new(),
            kind: EnvelopeKind::WriteNotice { region },
        }
    }

    /// Tag as UTF-8, if it is valid UTF-8.
    pub fn tag_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.tag).ok()
    }

    /// Bytes this envelope occupies as a data frame.
    pub fn frame_len(&self) -> usize {
        1 + ENVELOPE_HEADER_SIZE + self.tag.len() + self.payload.len()
    }

    /// Encode the frame type, header and tag, leaving `payload_len` bytes of
    /// payload to be appended (or gathered) by the caller.
    pub(crate) fn encode_prefix(
        id: u64,
        payload_len: u64,
        tag: &[u8],
        kind: EnvelopeKind,
        buf: &mut impl BufMut,
    ) -> Result<()> {
        let tag_len = u16::try_from(tag.len()).map_err(|_| {
            TransportError::Protocol(format!("tag of {} bytes exceeds {}", tag.len(), u16::MAX))
        })?;
        let (kind_byte, region) = match kind {
            EnvelopeKind::Message => (KIND_MESSAGE, 0),
            EnvelopeKind::WriteNotice { region } => (KIND_WRITE_NOTICE, region),
        };
        buf.put_u8(FRAME_ENVELOPE);
        buf.put_u64_le(id);
        buf.put_u64_le(payload_len);
        buf.put_u16_le(tag_len);
        buf.put_u8(kind_byte);
        buf.put_u8(0);
        buf.put_u32_le(region);
        buf.put_slice(tag);
        Ok(())
    }

    /// Encode as a complete data frame.
    pub(crate) fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.frame_len());
        Self::encode_prefix(self.id, self.length, &self.tag, self.kind, &mut buf)?;
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    fn decode_body(mut buf: Bytes) -> Result<Self> {
        if buf.remaining() < ENVELOPE_HEADER_SIZE {
            return Err(TransportError::Protocol(format!(
                "envelope header truncated ({} bytes)",
                buf.remaining()
            )));
        }
        let id = buf.get_u64_le();
        let length = buf.get_u64_le();
        let tag_len = buf.get_u16_le() as usize;
        let kind_byte = buf.get_u8();
        let _reserved = buf.get_u8();
        let region = buf.get_u32_le();

        let kind = match kind_byte {
            KIND_MESSAGE => EnvelopeKind::Message,
            KIND_WRITE_NOTICE => EnvelopeKind::WriteNotice { region },
            other => {
                return Err(TransportError::Protocol(format!(
                    "unknown envelope kind {other}"
                )));
            }
        };
        let payload_len = match kind {
            EnvelopeKind::Message => length,
            EnvelopeKind::WriteNotice { .. } => 0,
        };
        let expected = (tag_len as u64).checked_add(payload_len);
        if expected != Some(buf.remaining() as u64) {
            return Err(TransportError::Protocol(format!(
                "envelope body is {} bytes, header announces tag {tag_len} + payload {payload_len}",
                buf.remaining()
            )));
        }
        let tag = buf.split_to(tag_len);
        Ok(Self {
            id,
            length,
            tag,
            payload: buf,
            kind,
        })
    }
}

/// A message on the two-sided path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DataFrame {
    Envelope(Envelope),
    /// The receiver consumed this many messages; the sender may post that
    /// many more.
    Credit(u32),
}

impl DataFrame {
    pub(crate) fn credit(n: u32) -> Bytes {
        let mut buf = BytesMut::with_capacity(5);
        buf.put_u8(FRAME_CREDIT);
        buf.put_u32_le(n);
        buf.freeze()
    }

    pub(crate) fn decode(mut buf: Bytes) -> Result<Self> {
        if buf.is_empty() {
            return Err(TransportError::Protocol("empty data frame".into()));
        }
        match buf.get_u8() {
            FRAME_ENVELOPE => Ok(DataFrame::Envelope(Envelope::decode_body(buf)?)),
            FRAME_CREDIT => {
                if buf.remaining() != 4 {
                    return Err(TransportError::Protocol(format!(
                        "credit frame body is {} bytes",
                        buf.remaining()
                    )));
                }
                Ok(DataFrame::Credit(buf.get_u32_le()))
            }
            other => Err(TransportError::Protocol(format!(
                "unknown data frame type {other}"
            ))),
        }
    }
}
