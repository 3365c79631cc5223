//! On-disk layout of the point index file.
//!
//! ```text
//! 0   magic "ODPI"
//! 4   version        u16
//! 6   flags          u16   bit 0: open for writing
//! 8   block_records  u64   records per block
//! 16  block_count    u64
//! 24  overflow_len   u64   byte length of the overflow section
//! 32  blocks         block_count × block_records × 16 bytes (lon bits, lat bits)
//! ..  directory      block_count × u64, the block number stored in each slot
//! ..  overflow       bincode Vec<(i64, [f64; 2])>
//! ```
//!
//! Block `n` covers ids `[n * block_records, (n + 1) * block_records)`. All
//! integers are little endian.

use geo::Coord;
use serde::{Deserialize, Serialize};

/// File identifier for point index files.
pub(crate) const MAGIC: [u8; 4] = *b"ODPI";

/// Supported version of the point index format.
pub(crate) const VERSION: u16 = 2;

/// Size of the fixed header.
pub(crate) const HEADER_LEN: u64 = 32;

/// Size of one record.
pub(crate) const RECORD_LEN: u64 = 16;

/// Ids per block are `1 << BLOCK_SHIFT`.
pub(crate) const BLOCK_SHIFT: u32 = 10;

/// Records held by one block.
pub(crate) const BLOCK_RECORDS: u64 = 1 << BLOCK_SHIFT;

/// Bytes occupied by one block.
pub(crate) const BLOCK_LEN: u64 = BLOCK_RECORDS * RECORD_LEN;

/// Size of one directory entry.
pub(crate) const DIRECTORY_ENTRY_LEN: u64 = 8;

/// Header flag set while a writer holds the file open.
pub(crate) const FLAG_OPEN: u16 = 1;

/// Bit pattern marking an unset record. A quiet NaN never produced by
/// arithmetic, so it cannot collide with a stored coordinate.
pub(crate) const UNSET_BITS: u64 = 0x7ff8_dead_beef_0001;

/// Decoded fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
    pub(crate) version: u16,
    pub(crate) flags: u16,
    pub(crate) block_records: u64,
    pub(crate) block_count: u64,
    pub(crate) overflow_len: u64,
}

impl Header {
    pub(crate) const fn empty() -> Self {
        Self {
            version: VERSION,
            flags: 0,
            block_records: BLOCK_RECORDS,
            block_count: 0,
            overflow_len: 0,
        }
    }

    pub(crate) fn encode(&self) -> [u8; 32] {
        let mut out = [0_u8; 32];
        let fields = MAGIC
            .into_iter()
            .chain(self.version.to_le_bytes())
            .chain(self.flags.to_le_bytes())
            .chain(self.block_records.to_le_bytes())
            .chain(self.block_count.to_le_bytes())
            .chain(self.overflow_len.to_le_bytes());
        for (slot, byte) in out.iter_mut().zip(fields) {
            *slot = byte;
        }
        out
    }

    /// Decode a header, returning the magic separately so the caller can
    /// report it.
    pub(crate) fn decode(bytes: &[u8; 32]) -> ([u8; 4], Self) {
        let magic = [bytes[0], bytes[1], bytes[2], bytes[3]];
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        let flags = u16::from_le_bytes([bytes[6], bytes[7]]);
        (
            magic,
            Self {
                version,
                flags,
                block_records: read_u64(bytes, 8),
                block_count: read_u64(bytes, 16),
                overflow_len: read_u64(bytes, 24),
            },
        )
    }

    /// Offset of the directory, which directly follows the last block.
    pub(crate) fn directory_offset(&self) -> Option<u64> {
        self.block_count
            .checked_mul(BLOCK_LEN)
            .and_then(|blocks| blocks.checked_add(HEADER_LEN))
    }

    /// Offset of the overflow section.
    pub(crate) fn overflow_offset(&self) -> Option<u64> {
        self.block_count
            .checked_mul(DIRECTORY_ENTRY_LEN)
            .and_then(|directory| self.directory_offset()?.checked_add(directory))
    }

    /// File length implied by the header.
    pub(crate) fn expected_len(&self) -> Option<u64> {
        self.overflow_offset()?.checked_add(self.overflow_len)
    }
}

pub(crate) fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut word = [0_u8; 8];
    if let Some(slice) = bytes.get(offset..offset + 8) {
        word.copy_from_slice(slice);
    }
    u64::from_le_bytes(word)
}

/// File offset of `record` inside the block stored at `slot`.
pub(crate) const fn record_offset(slot: u64, record: u64) -> u64 {
    HEADER_LEN + slot * BLOCK_LEN + record * RECORD_LEN
}

/// Encode one record.
pub(crate) fn encode_record(coord: Option<Coord<f64>>) -> [u8; 16] {
    let (x, y) = coord.map_or((UNSET_BITS, UNSET_BITS), |c| (c.x.to_bits(), c.y.to_bits()));
    let mut out = [0_u8; 16];
    for (slot, byte) in out.iter_mut().zip(x.to_le_bytes().into_iter().chain(y.to_le_bytes())) {
        *slot = byte;
    }
    out
}

/// Decode one record; the unset sentinel decodes to `None`.
pub(crate) fn decode_record(bytes: &[u8]) -> Option<Coord<f64>> {
    if bytes.len() < 16 {
        return None;
    }
    let x_bits = read_u64(bytes, 0);
    let y_bits = read_u64(bytes, 8);
    if x_bits == UNSET_BITS && y_bits == UNSET_BITS {
        return None;
    }
    Some(Coord {
        x: f64::from_bits(x_bits),
        y: f64::from_bits(y_bits),
    })
}

/// Overflow section payload.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct OverflowSection {
    pub(crate) entries: Vec<(i64, [f64; 2])>,
}
