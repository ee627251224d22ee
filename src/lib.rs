//! windrow - Streaming Erasure Code Encoder
//!
//! A sender-side engine for protecting an append-only stream of packets on a
//! lossy network. Packets are appended to a sliding window and assigned
//! sequential 22-bit column numbers; on demand the encoder emits recovery
//! packets carrying algebraic combinations of the window over GF(256) that a
//! peer can use to reconstruct lost originals. A selective-acknowledgement
//! feedback channel prunes the window and drives retransmission of packets
//! the peer reports missing, making the engine suitable as the core of a
//! Hybrid-ARQ transport.
//!
//! Recovery rows come in three kinds:
//!
//! - **Dense rows** built from per-lane running sums, so generating one costs
//!   time proportional to the longest packet rather than the window size.
//! - **Light (LDPC) perturbations**: a few PRNG-chosen packet pairs XORed on
//!   top of each dense row to break up the regular structure.
//! - **Parity/Cauchy rows** used while the in-flight window is small, where
//!   an MDS row is cheaper than maintaining the running sums.
//!
//! # Example
//!
//! ```rust
//! use windrow::Encoder;
//!
//! let mut encoder = Encoder::new();
//!
//! // Protect some packets
//! let col0 = encoder.add(&[1, 2, 3]).unwrap();
//! let col1 = encoder.add(&[4, 5, 6]).unwrap();
//! assert_eq!((col0, col1), (0, 1));
//!
//! // Emit a recovery packet (payload followed by a metadata footer)
//! let recovery = encoder.encode().unwrap();
//! assert!(!recovery.is_empty());
//! ```
//!
//! The encoder is single-threaded: no internal locks or threads, and every
//! operation completes synchronously. Callers serialize access.

mod ack;
mod buffer;
mod column;
mod encoder;
mod gf;
mod rowgen;
pub mod serialize;
mod stats;
mod window;


pub use encoder::{Encoder, Retransmit};
pub use gf::Gf256;
pub use stats::EncoderStats;

// =============================================================================
// Codec constants
// =============================================================================
//
// These are interoperability constants shared bit-exactly with the decoder,
// not tuning knobs.

/// Maximum number of packets held in the window at a time.
///
/// Practically only about 2000 packets per round-trip makes sense; the hard
/// cap bounds the width of any recovery row.
pub const MAX_PACKETS: usize = 16000;

/// Size of the column number space. Column arithmetic is modular on this.
pub const COLUMN_PERIOD: u32 = 1 << 22;

/// Number of column lanes. Each lane covers one residue class of
/// `column % COLUMN_LANE_COUNT`.
pub const COLUMN_LANE_COUNT: usize = 8;

/// Number of running sums maintained per lane.
pub const COLUMN_SUM_COUNT: usize = 3;

/// Number of recovery rows before row numbers repeat.
pub const ROW_PERIOD: u32 = 256;

/// Elements per subwindow. The window stores its packets as a rotating
/// sequence of fixed-size subwindows so prefix removal is cheap.
pub const SUBWINDOW_SIZE: usize = 8 * COLUMN_LANE_COUNT;

/// One light (LDPC) pair is added per this many summed packets, rounded up.
pub const PAIR_ADD_RATE: usize = 16;

/// Minimum bytes in an original packet.
pub const MIN_PACKET_BYTES: usize = 1;

/// Maximum bytes in an original packet (up to 536 million bytes).
pub const MAX_PACKET_BYTES: usize = 0x1fff_ffff;

/// Maximum bytes `encode` appends beyond the longest packet buffer.
/// The footer is usually closer to 6 bytes.
pub const MAX_ENCODE_OVERHEAD: usize = 8;

/// Minimum size of an acknowledgement buffer on the feedback channel.
pub const ACK_MIN_BYTES: usize = 16;

/// Rows in the Cauchy matrix used at small window sizes. Row values occupy
/// `0..CAUCHY_MAX_ROWS` of the field and column values the rest, so the
/// Cauchy denominator is never zero.
pub const CAUCHY_MAX_ROWS: u32 = 64;

/// Columns in the Cauchy matrix; column indices cycle modulo this.
pub const CAUCHY_MAX_COLUMNS: u32 = 256 - CAUCHY_MAX_ROWS;

/// In-flight packet count at or below which a Cauchy/parity row is emitted
/// instead of rebuilding unusable running sums.
pub const CAUCHY_THRESHOLD: usize = 64;

/// In-flight packet count at or below which healthy running sums are
/// abandoned in favor of Cauchy/parity rows.
pub const SUM_RESET_THRESHOLD: usize = 32;

const _: () = assert!(SUM_RESET_THRESHOLD <= CAUCHY_THRESHOLD);
const _: () = assert!(SUBWINDOW_SIZE % COLUMN_LANE_COUNT == 0);

/// Window elements that must be acknowledged before compaction runs.
pub(crate) const REMOVE_THRESHOLD: usize = 2 * SUBWINDOW_SIZE;

// =============================================================================
// Errors
// =============================================================================

/// Error type for encoder operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// A parameter or message was malformed. No state was changed.
    InvalidInput,
    /// There is nothing to emit for this operation; normal control flow.
    NeedMoreData,
    /// The window already holds `MAX_PACKETS` packets.
    MaxPacketsReached,
    /// Duplicate data was received.
    DuplicateData,
    /// The encoder entered a permanent disabled state after an allocation
    /// failure or a broken internal invariant. Every later call returns this;
    /// the codec must be recreated.
    Disabled,
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::InvalidInput => write!(f, "invalid input"),
            CodecError::NeedMoreData => write!(f, "more data needed"),
            CodecError::MaxPacketsReached => write!(f, "window packet limit reached"),
            CodecError::DuplicateData => write!(f, "duplicate data"),
            CodecError::Disabled => write!(f, "codec disabled"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, CodecError>;
