//! Wire fragments the encoder serializes or parses.
//!
//! Three pieces cross the API boundary:
//!
//! - varints: LEB128, low groups first, high bit marks continuation. Used
//!   for packet numbers, payload lengths, and acknowledgement loss ranges.
//! - the length prefix stored ahead of each original payload in the window.
//! - the recovery metadata footer trailing every recovery packet. Footers
//!   instead of headers let the packet body start at offset zero, saving a
//!   copy on both sides.
//!
//! The footer packs `{ sum_count, ldpc_count, column_start, row }` into 6-8
//! bytes and is parsed backwards from the end of the packet:
//!
//! ```text
//! [ sum_count: 1-2B LE ][ ldpc_count: 1-2B LE ][ tail word: 4B LE ]
//! tail word bits 0..21  column_start
//!           bit  22     sum_count took 2 bytes
//!           bit  23     ldpc_count took 2 bytes
//!           bits 24..31 row
//! ```

use crate::{COLUMN_PERIOD, MAX_ENCODE_OVERHEAD, MAX_PACKETS, ROW_PERIOD};

/// Maximum bytes in a serialized varint accepted by [`read_varint`].
pub const MAX_VARINT_BYTES: usize = 5;

/// Bytes needed to encode `value` as a varint.
#[inline]
pub fn varint_len(value: u32) -> usize {
    match value {
        0..=0x7f => 1,
        0x80..=0x3fff => 2,
        0x4000..=0x1f_ffff => 3,
        0x20_0000..=0xfff_ffff => 4,
        _ => 5,
    }
}

/// Write `value` as a varint into `out`, returning the bytes written.
/// `out` must hold at least [`MAX_VARINT_BYTES`].
pub fn write_varint(mut value: u32, out: &mut [u8]) -> usize {
    let mut n = 0;
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out[n] = byte;
            return n + 1;
        }
        out[n] = byte | 0x80;
        n += 1;
    }
}

/// Read a varint from the front of `data`, returning the value and bytes
/// consumed. Fails on truncation or a value exceeding 32 bits.
pub fn read_varint(data: &[u8]) -> Option<(u32, usize)> {
    let mut value: u32 = 0;
    for (i, &byte) in data.iter().take(MAX_VARINT_BYTES).enumerate() {
        let group = (byte & 0x7f) as u32;
        if i == MAX_VARINT_BYTES - 1 && group > 0x0f {
            return None; // would overflow 32 bits
        }
        value |= group << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

/// Read a varint packet number, rejecting values outside the column space.
pub fn read_packet_num(data: &[u8]) -> Option<(u32, usize)> {
    let (value, bytes) = read_varint(data)?;
    if value >= COLUMN_PERIOD {
        return None;
    }
    Some((value, bytes))
}

// =============================================================================
// Recovery metadata footer
// =============================================================================

/// The algebraic description of a recovery packet, serialized as its footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryMetadata {
    /// Width of the dense sum span, including erased elements.
    pub sum_count: u32,
    /// Number of in-flight packets covered by the light columns.
    pub ldpc_count: u32,
    /// First column of the sum span.
    pub column_start: u32,
    /// Row number: generator row for dense rows; 0 = parity and
    /// `1..=CAUCHY_MAX_ROWS` = Cauchy for small-window rows.
    pub row: u32,
}

/// Serialize `meta` into `out`, returning the footer length (6 to 8 bytes).
/// `out` must hold at least [`MAX_ENCODE_OVERHEAD`] bytes.
pub fn serialize_footer(meta: &RecoveryMetadata, out: &mut [u8]) -> usize {
    debug_assert!(meta.sum_count as usize <= MAX_PACKETS);
    debug_assert!(meta.ldpc_count as usize <= MAX_PACKETS);
    debug_assert!(meta.column_start < COLUMN_PERIOD);
    debug_assert!(meta.row < ROW_PERIOD);

    let sum_wide = meta.sum_count > 0xff;
    let ldpc_wide = meta.ldpc_count > 0xff;

    let mut n = 0;
    out[n] = meta.sum_count as u8;
    n += 1;
    if sum_wide {
        out[n] = (meta.sum_count >> 8) as u8;
        n += 1;
    }
    out[n] = meta.ldpc_count as u8;
    n += 1;
    if ldpc_wide {
        out[n] = (meta.ldpc_count >> 8) as u8;
        n += 1;
    }

    let tail = meta.column_start
        | (u32::from(sum_wide) << 22)
        | (u32::from(ldpc_wide) << 23)
        | (meta.row << 24);
    out[n..n + 4].copy_from_slice(&tail.to_le_bytes());
    n + 4
}

/// Parse the footer off the end of `packet`, returning the metadata and the
/// footer length.
pub fn deserialize_footer(packet: &[u8]) -> Option<(RecoveryMetadata, usize)> {
    if packet.len() < 6 {
        return None;
    }
    let tail = u32::from_le_bytes(packet[packet.len() - 4..].try_into().ok()?);
    let column_start = tail & (COLUMN_PERIOD - 1);
    let sum_wide = tail & (1 << 22) != 0;
    let ldpc_wide = tail & (1 << 23) != 0;
    let row = tail >> 24;

    let footer_bytes = 4 + 1 + usize::from(sum_wide) + 1 + usize::from(ldpc_wide);
    if packet.len() < footer_bytes {
        return None;
    }

    let mut at = packet.len() - footer_bytes;
    let mut sum_count = packet[at] as u32;
    at += 1;
    if sum_wide {
        sum_count |= (packet[at] as u32) << 8;
        at += 1;
    }
    let mut ldpc_count = packet[at] as u32;
    at += 1;
    if ldpc_wide {
        ldpc_count |= (packet[at] as u32) << 8;
    }

    Some((
        RecoveryMetadata {
            sum_count,
            ldpc_count,
            column_start,
            row,
        },
        footer_bytes,
    ))
}

const _: () = assert!(2 + 2 + 4 <= MAX_ENCODE_OVERHEAD);
