//! Encoder statistics counters.

/// Monotonic counters collected by the encoder for all time.
///
/// Returned by [`crate::Encoder::statistics`] as a snapshot; `memory_used`
/// is sampled from live buffer allocations at snapshot time, everything
/// else only ever increases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncoderStats {
    /// Original packets added.
    pub original_count: u64,
    /// Original payload bytes added.
    pub original_bytes: u64,
    /// Recovery packets emitted.
    pub recovery_count: u64,
    /// Recovery bytes emitted, footers included.
    pub recovery_bytes: u64,
    /// Originals handed back for retransmission.
    pub retransmit_count: u64,
    /// Payload bytes handed back for retransmission.
    pub retransmit_bytes: u64,
    /// Acknowledgements processed.
    pub ack_count: u64,
    /// Acknowledgement bytes processed.
    pub ack_bytes: u64,
    /// Bytes of buffer memory currently allocated by the codec.
    pub memory_used: u64,
}
