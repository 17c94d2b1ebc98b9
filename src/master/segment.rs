//! Segment wire format: the unit in which log entries travel between
//! servers during recovery and migration.
//!
//! A segment on the wire is a sequence of `{type: u8, length: u32 LE,
//! payload}` entries, accompanied by a certificate `{length, crc32}` that the
//! receiver verifies before replaying anything.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::utils::EmberError;

/// Per-entry header size: 1 byte type tag + 4 bytes length.
pub(crate) const ENTRY_HEADER_LEN: usize = 5;

/// Types of entries that may appear in a log segment.
#[derive(
    Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum EntryType {
    /// A live or superseded object value.
    Object = 1,

    /// A deletion marker for some previous object version.
    Tombstone = 2,

    /// A transaction commit/abort decision record.
    TxDecision = 3,
}

impl EntryType {
    fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(EntryType::Object),
            2 => Some(EntryType::Tombstone),
            3 => Some(EntryType::TxDecision),
            _ => None,
        }
    }
}

/// Compact integrity tag accompanying a segment on the wire. The checksum
/// covers exactly the first `len` bytes of the segment.
#[derive(
    Debug, Default, PartialEq, Eq, Clone, Copy, Serialize, Deserialize,
)]
pub struct Certificate {
    /// Number of valid bytes in the segment.
    pub len: u32,

    /// CRC-32 over those bytes.
    pub checksum: u32,
}

impl Certificate {
    /// Computes the certificate for a byte slice.
    pub fn over(bytes: &[u8]) -> Self {
        Certificate {
            len: bytes.len() as u32,
            checksum: crc32fast::hash(bytes),
        }
    }
}

/// An append-only segment buffer with a fixed byte capacity. Used both for
/// the in-memory log's segments and for transfer segments built during
/// recovery and migration.
#[derive(Debug, Clone)]
pub struct SegmentBuf {
    buf: BytesMut,
    capacity: usize,
}

impl SegmentBuf {
    /// Creates an empty segment with the given byte capacity.
    pub fn new(capacity: usize) -> Self {
        SegmentBuf {
            buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends one entry. Returns `false` (leaving the segment unchanged) if
    /// the entry does not fit in the remaining capacity.
    pub fn append(&mut self, ty: EntryType, payload: &[u8]) -> bool {
        if self.buf.len() + ENTRY_HEADER_LEN + payload.len() > self.capacity {
            return false;
        }
        self.buf.extend_from_slice(&[ty as u8]);
        self.buf
            .extend_from_slice(&(payload.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(payload);
        true
    }

    /// Byte offset at which the next entry would land.
    #[inline]
    pub fn tail_offset(&self) -> u32 {
        self.buf.len() as u32
    }

    /// Whether no entry has been appended yet.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Whether an entry of `payload_len` bytes could ever fit into an empty
    /// segment of this capacity.
    #[inline]
    pub fn could_ever_fit(&self, payload_len: usize) -> bool {
        ENTRY_HEADER_LEN + payload_len <= self.capacity
    }

    /// Freezes the segment, returning its bytes and their certificate.
    pub fn close(self) -> (Bytes, Certificate) {
        let bytes = self.buf.freeze();
        let cert = Certificate::over(&bytes);
        (bytes, cert)
    }

    /// Reads the entry starting at `offset` without consuming the segment.
    /// Used by the in-memory log to resolve a `LogPosition` reference.
    pub fn entry_at(&self, offset: u32) -> Option<(EntryType, &[u8])> {
        let off = offset as usize;
        if off + ENTRY_HEADER_LEN > self.buf.len() {
            return None;
        }
        let ty = EntryType::from_u8(self.buf[off])?;
        let len = u32::from_le_bytes(
            self.buf[off + 1..off + ENTRY_HEADER_LEN].try_into().unwrap(),
        ) as usize;
        let start = off + ENTRY_HEADER_LEN;
        if start + len > self.buf.len() {
            return None;
        }
        Some((ty, &self.buf[start..start + len]))
    }
}

/// One decoded entry yielded by `SegmentIter`.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct SegmentEntry<'s> {
    /// Entry type tag.
    pub ty: EntryType,

    /// Byte offset of the entry header within the segment.
    pub offset: u32,

    /// The entry's payload bytes.
    pub payload: &'s [u8],
}

/// Verifying iterator over a segment's entries. Construction checks the
/// certificate and walks the entry headers once, so that iteration itself is
/// infallible; a corrupt or truncated segment never yields a single entry.
#[derive(Debug)]
pub struct SegmentIter<'s> {
    bytes: &'s [u8],
    offset: usize,
}

impl<'s> SegmentIter<'s> {
    /// Verifies the certificate and the entry framing over `bytes`.
    pub fn new(
        bytes: &'s [u8],
        certificate: &Certificate,
    ) -> Result<Self, EmberError> {
        if bytes.len() != certificate.len as usize {
            return Err(EmberError(format!(
                "segment length {} does not match certificate {}",
                bytes.len(),
                certificate.len
            )));
        }
        if crc32fast::hash(bytes) != certificate.checksum {
            return Err(EmberError::msg("segment checksum mismatch"));
        }

        // walk entry headers once to reject malformed framing up front
        let mut off = 0usize;
        while off < bytes.len() {
            if off + ENTRY_HEADER_LEN > bytes.len() {
                return Err(EmberError::msg("truncated entry header"));
            }
            if EntryType::from_u8(bytes[off]).is_none() {
                return Err(EmberError(format!(
                    "unknown entry type tag {}",
                    bytes[off]
                )));
            }
            let len = u32::from_le_bytes(
                bytes[off + 1..off + ENTRY_HEADER_LEN].try_into().unwrap(),
            ) as usize;
            off += ENTRY_HEADER_LEN + len;
        }
        if off != bytes.len() {
            return Err(EmberError::msg("entry overruns segment end"));
        }

        Ok(SegmentIter { bytes, offset: 0 })
    }
}

impl<'s> Iterator for SegmentIter<'s> {
    type Item = SegmentEntry<'s>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.bytes.len() {
            return None;
        }
        let off = self.offset;
        // framing was validated in new(), so these cannot be out of bounds
        let ty = EntryType::from_u8(self.bytes[off]).unwrap();
        let len = u32::from_le_bytes(
            self.bytes[off + 1..off + ENTRY_HEADER_LEN].try_into().unwrap(),
        ) as usize;
        let start = off + ENTRY_HEADER_LEN;
        self.offset = start + len;
        Some(SegmentEntry {
            ty,
            offset: off as u32,
            payload: &self.bytes[start..start + len],
        })
    }
}
