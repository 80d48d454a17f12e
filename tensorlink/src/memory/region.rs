//! Registered region descriptors and the BufferSet exchanged at handshake.
//!
//! Descriptor wire layout (little-endian, 28 bytes):
//!
//! ```text
//! [base_address: u64][offset: u64][length: u64][access_key: u32]
//! ```
//!
//! A BufferSet is `[count: u32]` followed by `count` descriptors.

use crate::error::{Result, TransportError};
use bytes::{Buf, BufMut};
use std::fmt;

/// Size of one encoded region descriptor.
pub const REGION_DESCRIPTOR_SIZE: usize = 28;

/// Remote key the fabric issued for a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AccessKey(pub u32);

impl fmt::Display for AccessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// A contiguous span the fabric may read and write remotely.
///
/// Covers `[base_address + offset, base_address + offset + length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base_address: u64,
    pub offset: u64,
    pub length: u64,
    pub access_key: AccessKey,
}

impl MemoryRegion {
    /// First byte of the registered span.
    pub fn start(&self) -> u64 {
        self.base_address.wrapping_add(self.offset)
    }

    /// Absolute address of `[offset, offset + len)` within this region, or
    /// `None` when the range does not fit.
    pub fn resolve(&self, offset: u64, len: u64) -> Option<u64> {
        let end = offset.checked_add(len)?;
        if end > self.length {
            return None;
        }
        self.start().checked_add(offset)
    }

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.base_address);
        buf.put_u64_le(self.offset);
        buf.put_u64_le(self.length);
        buf.put_u32_le(self.access_key.0);
    }

    fn decode(buf: &mut impl Buf) -> Self {
        Self {
            base_address: buf.get_u64_le(),
            offset: buf.get_u64_le(),
            length: buf.get_u64_le(),
            access_key: AccessKey(buf.get_u32_le()),
        }
    }
}

/// Ordered, append-only collection of region descriptors.
///
/// Indices are stable: a region keeps its index for the lifetime of the set,
/// and peers address each other's regions by these indices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferSet {
    regions: Vec<MemoryRegion>,
}

impl BufferSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a region and return its index.
    pub fn add(&mut self, region: MemoryRegion) -> usize {
        self.regions.push(region);
        self.regions.len() - 1
    }

    pub fn get(&self, index: usize) -> Option<&MemoryRegion> {
        self.regions.get(index)
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.regions.iter()
    }

    /// Base addresses in index order.
    pub fn get_base_addresses(&self) -> Vec<u64> {
        self.regions.iter().map(|r| r.base_address).collect()
    }

    /// Index of the first region with the given base address.
    pub fn position_of(&self, base_address: u64) -> Option<usize> {
        self.regions
            .iter()
            .position(|r| r.base_address == base_address)
    }

    /// Sum of all region lengths.
    pub fn total_bytes(&self) -> u64 {
        self.regions.iter().map(|r| r.length).sum()
    }

    pub fn encoded_len(&self) -> usize {
        4 + self.regions.len() * REGION_DESCRIPTOR_SIZE
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.regions.len() as u32);
        for r in &self.regions {
            r.encode(buf);
        }
    }

    /// Decode a set, consuming exactly `encoded_len()` bytes from `buf`.
    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < 4 {
            return Err(TransportError::Protocol(
                "buffer set truncated before region count".into(),
            ));
        }
        let count = buf.get_u32_le() as usize;
        let needed = count
            .checked_mul(REGION_DESCRIPTOR_SIZE)
            .ok_or_else(|| TransportError::Protocol(format!("region count {count} overflows")))?;
        if buf.remaining() < needed {
            return Err(TransportError::Protocol(format!(
                "buffer set truncated: {count} regions need {needed} bytes, have {}",
                buf.remaining()
            )));
        }
        let regions = (0..count).map(|_| MemoryRegion::decode(buf)).collect();
        Ok(Self { regions })
    }
}

impl FromIterator<MemoryRegion> for BufferSet {
    fn from_iter<I: IntoIterator<Item = MemoryRegion>>(iter: I) -> Self {
        Self {
            regions: iter.into_iter().collect(),
        }
    }
}
