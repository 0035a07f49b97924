//! CTF packet header layout and lifecycle helpers.
//!
//! Every packet begins with a fixed 44-byte header (all little-endian):
//!
//! ```text
//! Offset  Size  Description
//!   0       4   Magic: 0xc1fc1fc1
//!   4       4   Packet size in bits (header excluded)
//!   8       4   Content size in bits (must equal packet size)
//!  12       8   Begin timestamp, microsecond ticks
//!  20       8   End timestamp, microsecond ticks
//!  28       8   First allocation ID assigned in this packet
//!  36       8   One past the last allocation ID assigned in this packet
//! ```
//!
//! The writer lays down a placeholder header, appends events, then
//! backpatches the final sizes, timestamps and allocation-ID interval
//! before emitting the packet.

use heapscope_error::{HeapscopeError, Result};

use crate::buf::{ReadBuf, WriteBuf};

/// Packet magic number.
pub const TRACE_MAGIC: u32 = 0xc1fc_1fc1;

/// Fixed header size in bytes.
pub const PACKET_HEADER_SIZE: usize = 44;

/// Width of the truncated per-event timestamp.
pub const EVENT_TS_BITS: u32 = 25;

/// Mask selecting the truncated per-event timestamp bits.
pub const EVENT_TS_MASK: u64 = (1 << EVENT_TS_BITS) - 1;

const PACKET_SIZE_OFFSET: usize = 4;

/// A validated packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Event-content size in bytes (the bits fields divided by 8).
    pub content_size: usize,
    /// Timestamp of the packet's first event, microsecond ticks.
    pub ts_begin: u64,
    /// Timestamp of the packet's last event, microsecond ticks.
    pub ts_end: u64,
    /// First allocation ID assigned inside the packet.
    pub alloc_id_begin: u64,
    /// One past the last allocation ID assigned inside the packet.
    pub alloc_id_end: u64,
}

impl PacketHeader {
    /// Parse and validate a header from the cursor.
    #[allow(clippy::cast_possible_truncation)]
    pub fn parse(buf: &mut ReadBuf<'_>) -> Result<Self> {
        let magic = buf.get_u32()?;
        HeapscopeError::check_format(
            magic == TRACE_MAGIC,
            format!("bad packet magic: {magic:#010x}"),
        )?;
        let packet_size_bits = buf.get_u32()?;
        let content_size_bits = buf.get_u32()?;
        HeapscopeError::check_format(
            packet_size_bits == content_size_bits,
            format!("packet size {packet_size_bits} != content size {content_size_bits} (bits)"),
        )?;
        HeapscopeError::check_format(
            content_size_bits % 8 == 0,
            format!("content size {content_size_bits} bits is not a whole byte count"),
        )?;
        let ts_begin = buf.get_u64()?;
        let ts_end = buf.get_u64()?;
        HeapscopeError::check_format(
            ts_begin <= ts_end,
            format!("packet timestamps regress: begin {ts_begin} > end {ts_end}"),
        )?;
        let alloc_id_begin = buf.get_u64()?;
        let alloc_id_end = buf.get_u64()?;
        HeapscopeError::check_format(
            alloc_id_begin <= alloc_id_end,
            format!("packet allocation IDs regress: begin {alloc_id_begin} > end {alloc_id_end}"),
        )?;
        Ok(Self {
            content_size: (content_size_bits / 8) as usize,
            ts_begin,
            ts_end,
            alloc_id_begin,
            alloc_id_end,
        })
    }

    /// Write a placeholder header carrying only the magic; everything else
    /// is backpatched by [`PacketHeader::patch`] at seal time.
    pub fn write_placeholder(buf: &mut WriteBuf) -> Result<()> {
        buf.put_u32(TRACE_MAGIC)?;
        for _ in 0..(PACKET_HEADER_SIZE - 4) / 8 {
            buf.put_u64(0)?;
        }
        Ok(())
    }

    /// Backpatch the final header fields over the placeholder at offset 0.
    ///
    /// `self.content_size` must equal the bytes appended after the header.
    pub fn patch(&self, buf: &mut WriteBuf) -> Result<()> {
        let size_bits =
            u32::try_from(self.content_size * 8).map_err(|_| HeapscopeError::Overflow {
                pos: self.content_size,
            })?;
        buf.patch_u32(PACKET_SIZE_OFFSET, size_bits)?;
        buf.patch_u32(PACKET_SIZE_OFFSET + 4, size_bits)?;
        buf.patch_u64(12, self.ts_begin)?;
        buf.patch_u64(20, self.ts_end)?;
        buf.patch_u64(28, self.alloc_id_begin)?;
        buf.patch_u64(36, self.alloc_id_end)?;
        Ok(())
    }
}

/// Reconstruct a full timestamp from the packet's begin time and a stored
/// 25-bit low field. If the low bits fall below the begin time's low bits,
/// one overflow of the 25-bit counter is assumed.
#[must_use]
pub const fn splice_timestamp(ts_begin: u64, low_bits: u64) -> u64 {
    let ts = (ts_begin & !EVENT_TS_MASK) | (low_bits & EVENT_TS_MASK);
    if ts < ts_begin {
        ts + (1 << EVENT_TS_BITS)
    } else {
        ts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealed(header: &PacketHeader) -> Vec<u8> {
        let mut buf = WriteBuf::new(PACKET_HEADER_SIZE);
        PacketHeader::write_placeholder(&mut buf).unwrap();
        header.patch(&mut buf).unwrap();
        buf.written().to_vec()
    }

    #[test]
    fn header_round_trip() {
        let header = PacketHeader {
            content_size: 128,
            ts_begin: 5_000_000,
            ts_end: 6_000_000,
            alloc_id_begin: 10,
            alloc_id_end: 42,
        };
        let bytes = sealed(&header);
        assert_eq!(bytes.len(), PACKET_HEADER_SIZE);
        let parsed = PacketHeader::parse(&mut ReadBuf::new(&bytes)).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn bad_magic_rejected() {
        let header = PacketHeader {
            content_size: 0,
            ts_begin: 0,
            ts_end: 0,
            alloc_id_begin: 0,
            alloc_id_end: 0,
        };
        let mut bytes = sealed(&header);
        bytes[0] ^= 0xff;
        let err = PacketHeader::parse(&mut ReadBuf::new(&bytes)).unwrap_err();
        assert!(err.to_string().contains("bad packet magic"));
    }

    #[test]
    fn inconsistent_sizes_rejected() {
        let mut bytes = sealed(&PacketHeader {
            content_size: 16,
            ts_begin: 0,
            ts_end: 0,
            alloc_id_begin: 0,
            alloc_id_end: 0,
        });
        bytes[8] ^= 0x01; // content_size_bits no longer matches
        assert!(PacketHeader::parse(&mut ReadBuf::new(&bytes)).is_err());
    }

    #[test]
    fn regressing_intervals_rejected() {
        let bad_ts = PacketHeader {
            content_size: 0,
            ts_begin: 10,
            ts_end: 5,
            alloc_id_begin: 0,
            alloc_id_end: 0,
        };
        assert!(PacketHeader::parse(&mut ReadBuf::new(&sealed(&bad_ts))).is_err());

        let bad_ids = PacketHeader {
            content_size: 0,
            ts_begin: 0,
            ts_end: 0,
            alloc_id_begin: 9,
            alloc_id_end: 3,
        };
        assert!(PacketHeader::parse(&mut ReadBuf::new(&sealed(&bad_ids))).is_err());
    }

    #[test]
    fn timestamp_splice_without_overflow() {
        let ts_begin = (3 << EVENT_TS_BITS) | 100;
        let ts = splice_timestamp(ts_begin, 250);
        assert_eq!(ts, (3 << EVENT_TS_BITS) | 250);
    }

    #[test]
    fn timestamp_splice_single_overflow() {
        // Low bits below the begin time's low bits mean the 25-bit counter
        // wrapped once inside the packet.
        let ts_begin = (3 << EVENT_TS_BITS) | 100;
        let ts = splice_timestamp(ts_begin, 7);
        assert_eq!(ts, (4 << EVENT_TS_BITS) | 7);
        assert!(ts > ts_begin);
    }
}
