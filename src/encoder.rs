//! The encoder: window management, recovery synthesis, retransmission.
//!
//! `encode` picks between three row kinds based on the window state:
//!
//! - exactly one packet in flight: the packet itself is the recovery data
//! - a small in-flight window, or unusable sums: a parity or Cauchy row
//!   over just the unacknowledged region
//! - otherwise: a dense row folded out of the lane running sums, plus a
//!   sparse LDPC perturbation and a scaled product workspace
//!
//! Recovery packets and retransmitted originals are returned as borrows
//! into encoder-owned buffers; the next call reuses them.

use std::time::Instant;

use tracing::{debug, trace};

use crate::ack::AckState;
use crate::buffer::{next_aligned, AlignedBuffer};
use crate::gf;
use crate::rowgen::{row_opcode, row_value, PcgRandom};
use crate::serialize::{serialize_footer, RecoveryMetadata};
use crate::stats::EncoderStats;
use crate::window::PacketWindow;
use crate::{CodecError, Result};
use crate::{
    COLUMN_LANE_COUNT, COLUMN_PERIOD, COLUMN_SUM_COUNT, MAX_ENCODE_OVERHEAD, MAX_PACKETS,
    MAX_PACKET_BYTES, PAIR_ADD_RATE, REMOVE_THRESHOLD, ROW_PERIOD,
};
#[cfg(feature = "cauchy")]
use crate::column::{add_columns, is_column_delta_negative};
#[cfg(feature = "cauchy")]
use crate::rowgen::cauchy_element;
#[cfg(feature = "cauchy")]
use crate::{CAUCHY_MAX_COLUMNS, CAUCHY_MAX_ROWS, CAUCHY_THRESHOLD, SUM_RESET_THRESHOLD};

/// An original packet handed back for retransmission.
#[derive(Debug)]
pub struct Retransmit<'a> {
    /// Column number the packet was assigned by [`Encoder::add`].
    pub column: u32,
    /// Payload bytes, length prefix stripped.
    pub data: &'a [u8],
}

/// Sender-side streaming erasure code engine.
///
/// See the crate docs for the data flow. All operations are synchronous and
/// the encoder is not internally synchronized; callers serialize access.
#[derive(Debug)]
pub struct Encoder {
    /// Sliding window of protected originals.
    window: PacketWindow,

    /// State of the last acknowledgement.
    ack: AckState,

    /// Output and scratch buffer for `encode`, reused across calls.
    recovery_packet: AlignedBuffer,

    /// Next dense row number to generate.
    next_row: u32,

    /// Next start column eligible for an all-ones parity row.
    #[cfg(feature = "cauchy")]
    next_parity_column: u32,

    /// Next Cauchy row number to generate.
    #[cfg(feature = "cauchy")]
    next_cauchy_row: u32,

    stats: EncoderStats,

    /// Clock origin for retransmission timestamps.
    epoch: Instant,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    pub fn new() -> Self {
        Self {
            window: PacketWindow::new(),
            ack: AckState::new(),
            recovery_packet: AlignedBuffer::new(),
            next_row: 0,
            #[cfg(feature = "cauchy")]
            next_parity_column: 0,
            #[cfg(feature = "cauchy")]
            next_cauchy_row: 0,
            stats: EncoderStats::default(),
            epoch: Instant::now(),
        }
    }

    #[inline]
    fn now_msec(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    // =========================================================================
    // Window input
    // =========================================================================

    /// Add a packet to the end of the protected set, returning its assigned
    /// column number.
    pub fn add(&mut self, data: &[u8]) -> Result<u32> {
        if data.is_empty() || data.len() > MAX_PACKET_BYTES {
            return Err(CodecError::InvalidInput);
        }

        let now_msec = self.now_msec();
        let column = self.window.add(data, now_msec)?;

        self.stats.original_count += 1;
        self.stats.original_bytes += data.len() as u64;
        Ok(column)
    }

    /// Look up a packet still held in the window.
    ///
    /// Useful when the loss rate exceeds what recovery packets can repair
    /// and data must be re-sent some other way. Fails with `NeedMoreData`
    /// once the packet has been acknowledged away.
    pub fn get(&self, column: u32) -> Result<&[u8]> {
        if self.window.emergency_disabled {
            return Err(CodecError::Disabled);
        }

        let element = self.window.column_to_element(column);
        if self.window.invalid_element(element) {
            return Err(CodecError::NeedMoreData);
        }

        let original = self.window.get_window_element(element);
        if original.buffer.is_empty() {
            return Err(CodecError::NeedMoreData);
        }
        Ok(original.payload())
    }

    /// Drop all packets before `first_kept_column` from the protected set.
    ///
    /// Prefer [`Self::acknowledge`], which does this from the receiver's
    /// feedback directly.
    pub fn remove_before(&mut self, first_kept_column: u32) -> Result<()> {
        if self.window.emergency_disabled {
            return Err(CodecError::Disabled);
        }
        if first_kept_column >= COLUMN_PERIOD {
            return Err(CodecError::InvalidInput);
        }
        self.window.remove_before(first_kept_column);
        Ok(())
    }

    // =========================================================================
    // Feedback
    // =========================================================================

    /// Process an acknowledgement from the receiver: prunes the window and
    /// stages any reported loss ranges for [`Self::retransmit`].
    pub fn acknowledge(&mut self, message: &[u8]) -> Result<()> {
        if self.window.emergency_disabled {
            return Err(CodecError::Disabled);
        }

        if !self.ack.on_acknowledgement(&mut self.window, message) {
            return Err(CodecError::InvalidInput);
        }

        self.stats.ack_count += 1;
        self.stats.ack_bytes += message.len() as u64;
        Ok(())
    }

    /// Return the next original that should be retransmitted.
    ///
    /// Walks the loss ranges from the last acknowledgement, skipping
    /// packets sent within the last `retransmit_msec` milliseconds. When
    /// the list is exhausted the iterator restarts for the next call cycle
    /// and `NeedMoreData` is returned.
    pub fn retransmit(&mut self, retransmit_msec: u64) -> Result<Retransmit<'_>> {
        if self.window.emergency_disabled {
            return Err(CodecError::Disabled);
        }
        if !self.ack.has_negative_acknowledgements() {
            return Err(CodecError::NeedMoreData);
        }

        let now_msec = self.now_msec();
        let mut found = None;

        while let Some(column) = self.ack.next_loss_column() {
            let element = self.window.column_to_element(column);
            if self.window.invalid_element(element) {
                // The loss refers to data no longer in the window
                break;
            }

            let original = self.window.get_window_element_mut(element);
            if original.buffer.is_empty() {
                break;
            }

            // Too soon to resend this one
            if now_msec.saturating_sub(original.last_send_msec) < retransmit_msec {
                trace!(column, "retransmit: resent recently, skipping");
                continue;
            }

            original.last_send_msec = now_msec;
            found = Some((column, element));
            break;
        }

        if let Some((column, element)) = found {
            let original = self.window.get_window_element(element);
            let length = original.buffer.len() - original.header_bytes;
            debug_assert!(original.header_bytes > 0 && length > 0);

            self.stats.retransmit_count += 1;
            self.stats.retransmit_bytes += length as u64;
            debug!(column, length, "retransmitting original");

            return Ok(Retransmit {
                column,
                data: original.payload(),
            });
        }

        self.ack.restart_loss_iterator();
        trace!("retransmit: restarted loss iterator");
        Err(CodecError::NeedMoreData)
    }

    // =========================================================================
    // Recovery synthesis
    // =========================================================================

    /// Generate the next recovery packet over the current window.
    ///
    /// The returned bytes are the recovery payload followed by the metadata
    /// footer, valid until the next call. This is the only CPU-heavy
    /// operation in the API.
    pub fn encode(&mut self) -> Result<&[u8]> {
        if self.window.emergency_disabled {
            return Err(CodecError::Disabled);
        }
        if self.window.count == 0 {
            return Err(CodecError::NeedMoreData);
        }

        let unacknowledged = self.window.unacknowledged_count();
        if unacknowledged == 1 {
            return self.generate_single_packet();
        }

        // Upper bound on the sum span if we keep extending the current sums
        let new_sum_count_ub =
            self.window.count + self.window.sum_erased_count - self.window.sum_start_element;

        let sums_unusable = self.window.sum_end_element <= self.window.sum_start_element
            || new_sum_count_ub >= MAX_PACKETS;

        if sums_unusable {
            #[cfg(feature = "cauchy")]
            if unacknowledged <= CAUCHY_THRESHOLD {
                return self.generate_cauchy_packet();
            }

            let first = self.window.first_unremoved_element;
            debug!(element = first, "resetting lane sums");
            self.window.reset_sums(first);
        }

        #[cfg(feature = "cauchy")]
        if !sums_unusable
            && (unacknowledged <= SUM_RESET_THRESHOLD || new_sum_count_ub <= CAUCHY_THRESHOLD)
        {
            debug_assert!(new_sum_count_ub >= unacknowledged);

            // Stop extending the sums; the next dense row rebuilds them
            self.window.sum_end_element = self.window.sum_start_element;

            return self.generate_cauchy_packet();
        }

        // Compact acknowledged subwindows before doing the heavy work
        if self.window.first_unremoved_element >= REMOVE_THRESHOLD {
            self.window.remove_elements();
        }

        let row = self.next_row;
        self.next_row += 1;
        if self.next_row >= ROW_PERIOD {
            self.next_row = 0;
        }

        // First half of the buffer is the output row, second half is the
        // product workspace, footer space at the end
        let recovery_bytes = self.window.longest_packet;
        let aligned_bytes = next_aligned(recovery_bytes);
        if !self
            .recovery_packet
            .reset_zeroed(2 * aligned_bytes + MAX_ENCODE_OVERHEAD)
        {
            self.window.emergency_disabled = true;
            return Err(CodecError::Disabled);
        }

        self.add_dense_columns(row);
        self.add_light_columns(row);

        // output += RX * workspace
        let rx = row_value(row);
        let (output, workspace) = self.recovery_packet.as_mut_slice().split_at_mut(aligned_bytes);
        gf::muladd_mem(&mut output[..recovery_bytes], rx, &workspace[..recovery_bytes]);

        let metadata = RecoveryMetadata {
            sum_count: (self.window.sum_end_element + self.window.sum_erased_count
                - self.window.sum_start_element) as u32,
            ldpc_count: unacknowledged as u32,
            column_start: self.window.sum_column_start,
            row,
        };

        // Serializing the footer right after the recovery bytes saves a
        // copy; it may spill into the spent workspace region
        let buf = self.recovery_packet.as_mut_slice();
        let footer_bytes = serialize_footer(
            &metadata,
            &mut buf[recovery_bytes..recovery_bytes + MAX_ENCODE_OVERHEAD],
        );

        self.stats.recovery_count += 1;
        self.stats.recovery_bytes += (recovery_bytes + footer_bytes) as u64;
        debug!(
            start = metadata.column_start,
            ldpc_count = metadata.ldpc_count,
            sum_count = metadata.sum_count,
            row = metadata.row,
            "generated dense recovery packet"
        );

        Ok(&self.recovery_packet.as_slice()[..recovery_bytes + footer_bytes])
    }

    /// Fold the selected lane sums into the output row and the product
    /// workspace, extending each sum to the window end on the way.
    fn add_dense_columns(&mut self, row: u32) {
        let recovery_bytes = self.window.longest_packet;
        let aligned_bytes = next_aligned(recovery_bytes);
        let element_end = self.window.count;

        for lane_index in 0..COLUMN_LANE_COUNT {
            let opcode = row_opcode(lane_index, row);
            let mut mask = 1u32;

            // Bits 0..2: sums folded into the output row
            for sum_index in 0..COLUMN_SUM_COUNT {
                if opcode & mask != 0 {
                    let sum = self.window.get_sum(lane_index, sum_index, element_end);
                    let add_bytes = sum.len().min(recovery_bytes);
                    if add_bytes > 0 {
                        let src = &sum.as_slice()[..add_bytes];
                        gf::xor_mem(&mut self.recovery_packet.as_mut_slice()[..add_bytes], src);
                    }
                }
                mask <<= 1;
            }

            // Bits 3..5: sums folded into the product workspace
            for sum_index in 0..COLUMN_SUM_COUNT {
                if opcode & mask != 0 {
                    let sum = self.window.get_sum(lane_index, sum_index, element_end);
                    let add_bytes = sum.len().min(recovery_bytes);
                    if add_bytes > 0 {
                        let src = &sum.as_slice()[..add_bytes];
                        gf::xor_mem(
                            &mut self.recovery_packet.as_mut_slice()
                                [aligned_bytes..aligned_bytes + add_bytes],
                            src,
                        );
                    }
                }
                mask <<= 1;
            }
        }

        self.window.sum_end_element = element_end;
    }

    /// XOR the PRNG-chosen light column pairs into the output row and the
    /// product workspace.
    fn add_light_columns(&mut self, row: u32) {
        let start_element = self.window.first_unremoved_element;
        debug_assert!(self.window.sum_end_element >= start_element);
        let count = self.window.sum_end_element - start_element;
        debug_assert!(count >= 2 && count <= self.window.count);
        let aligned_bytes = next_aligned(self.window.longest_packet);

        let mut prng = PcgRandom::seed(row as u64, count as u64);

        let pair_count = (count + PAIR_ADD_RATE - 1) / PAIR_ADD_RATE;
        for _ in 0..pair_count {
            let element1 = start_element + prng.next() as usize % count;
            let element_rx = start_element + prng.next() as usize % count;
            trace!(element1, element_rx, "light column pair");

            let buf = self.recovery_packet.as_mut_slice();

            let original1 = self.window.get_window_element(element1);
            debug_assert!(original1.buffer.len() <= self.window.longest_packet);
            gf::xor_mem(
                &mut buf[..original1.buffer.len()],
                original1.buffer.as_slice(),
            );

            let original_rx = self.window.get_window_element(element_rx);
            debug_assert!(original_rx.buffer.len() <= self.window.longest_packet);
            gf::xor_mem(
                &mut buf[aligned_bytes..aligned_bytes + original_rx.buffer.len()],
                original_rx.buffer.as_slice(),
            );
        }
    }

    /// Recovery output when exactly one packet is in flight: the packet
    /// buffer itself with a footer, no arithmetic.
    fn generate_single_packet(&mut self) -> Result<&[u8]> {
        let element = self.window.first_unremoved_element;
        let original = self.window.get_window_element(element);
        let original_bytes = original.buffer.len();
        let column = original.column;

        if !self
            .recovery_packet
            .reset_zeroed(original_bytes + MAX_ENCODE_OVERHEAD)
        {
            self.window.emergency_disabled = true;
            return Err(CodecError::Disabled);
        }

        let buf = self.recovery_packet.as_mut_slice();
        buf[..original_bytes].copy_from_slice(original.buffer.as_slice());

        let metadata = RecoveryMetadata {
            sum_count: 1,
            ldpc_count: 1,
            column_start: column,
            row: 0,
        };
        let footer_bytes = serialize_footer(&metadata, &mut buf[original_bytes..]);

        self.stats.recovery_count += 1;
        self.stats.recovery_bytes += (original_bytes + footer_bytes) as u64;
        debug!(
            start = column,
            "generated single-packet recovery packet"
        );

        Ok(&self.recovery_packet.as_slice()[..original_bytes + footer_bytes])
    }

    /// Small-window recovery: an all-ones parity row when the parity cursor
    /// has wrapped back into the unremoved region, otherwise the next
    /// Cauchy row. Only covers the unacknowledged span, so the packet can
    /// be shorter than the full window's longest buffer.
    #[cfg(feature = "cauchy")]
    fn generate_cauchy_packet(&mut self) -> Result<&[u8]> {
        let first_element = self.window.first_unremoved_element;
        let recovery_bytes = self.window.longest_packet;
        if !self
            .recovery_packet
            .reset_zeroed(recovery_bytes + MAX_ENCODE_OVERHEAD)
        {
            self.window.emergency_disabled = true;
            return Err(CodecError::Disabled);
        }

        let unacknowledged = self.window.unacknowledged_count();
        let column_start = self.window.element_to_column(first_element);
        let mut used_bytes;
        let row;

        let next_parity_element = self.window.column_to_element(self.next_parity_column);
        if next_parity_element <= first_element
            || is_column_delta_negative(next_parity_element as u32)
        {
            // Parity row: next one becomes eligible after the current span
            self.next_parity_column = add_columns(column_start, unacknowledged as u32);
            row = 0;

            let buf = self.recovery_packet.as_mut_slice();
            let original = self.window.get_window_element(first_element);
            let first_bytes = original.buffer.len();
            buf[..first_bytes].copy_from_slice(original.buffer.as_slice());
            used_bytes = first_bytes;

            for element in first_element + 1..self.window.count {
                let original = self.window.get_window_element(element);
                let original_bytes = original.buffer.len();
                gf::xor_mem(&mut buf[..original_bytes], original.buffer.as_slice());
                if used_bytes < original_bytes {
                    used_bytes = original_bytes;
                }
            }
        } else {
            let cauchy_row = self.next_cauchy_row;
            row = cauchy_row + 1;
            self.next_cauchy_row += 1;
            if self.next_cauchy_row >= CAUCHY_MAX_ROWS {
                self.next_cauchy_row = 0;
            }

            let mut cauchy_column = column_start % CAUCHY_MAX_COLUMNS;
            let buf = self.recovery_packet.as_mut_slice();
            let original = self.window.get_window_element(first_element);
            let first_bytes = original.buffer.len();
            gf::mul_mem(
                &mut buf[..first_bytes],
                original.buffer.as_slice(),
                cauchy_element(cauchy_row, cauchy_column),
            );
            used_bytes = first_bytes;

            for element in first_element + 1..self.window.count {
                cauchy_column = (cauchy_column + 1) % CAUCHY_MAX_COLUMNS;
                let original = self.window.get_window_element(element);
                let original_bytes = original.buffer.len();
                gf::muladd_mem(
                    &mut buf[..original_bytes],
                    cauchy_element(cauchy_row, cauchy_column),
                    original.buffer.as_slice(),
                );
                if used_bytes < original_bytes {
                    used_bytes = original_bytes;
                }
            }
        }

        let metadata = RecoveryMetadata {
            sum_count: unacknowledged as u32,
            ldpc_count: unacknowledged as u32,
            column_start,
            row,
        };
        let buf = self.recovery_packet.as_mut_slice();
        let footer_bytes = serialize_footer(
            &metadata,
            &mut buf[used_bytes..used_bytes + MAX_ENCODE_OVERHEAD],
        );

        self.stats.recovery_count += 1;
        self.stats.recovery_bytes += (used_bytes + footer_bytes) as u64;
        debug!(
            start = column_start,
            ldpc_count = metadata.ldpc_count,
            sum_count = metadata.sum_count,
            row = metadata.row,
            "generated Cauchy/parity recovery packet"
        );

        Ok(&self.recovery_packet.as_slice()[..used_bytes + footer_bytes])
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Snapshot of the collected statistics.
    pub fn statistics(&self) -> EncoderStats {
        let mut stats = self.stats;
        stats.memory_used = self.memory_allocated_bytes() as u64;
        stats
    }

    /// Bytes of buffer memory currently allocated by the codec.
    pub fn memory_allocated_bytes(&self) -> usize {
        self.window.allocated_bytes()
            + self.ack.allocated_bytes()
            + self.recovery_packet.capacity()
    }

    /// Drive the codec into its permanent disabled state, as an allocation
    /// failure would.
    #[cfg(test)]
    pub(crate) fn force_disable(&mut self) {
        self.window.emergency_disabled = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_encoder_needs_data() {
        let mut encoder = Encoder::new();
        assert_eq!(encoder.encode().unwrap_err(), CodecError::NeedMoreData);
        assert_eq!(encoder.retransmit(0).unwrap_err(), CodecError::NeedMoreData);
    }

    #[test]
    fn test_add_validates_length() {
        let mut encoder = Encoder::new();
        assert_eq!(encoder.add(&[]).unwrap_err(), CodecError::InvalidInput);
        assert_eq!(encoder.add(&[1]).unwrap(), 0);
    }

    #[test]
    fn test_remove_before_validates_column() {
        let mut encoder = Encoder::new();
        encoder.add(&[1]).unwrap();
        assert_eq!(
            encoder.remove_before(COLUMN_PERIOD).unwrap_err(),
            CodecError::InvalidInput
        );
        assert!(encoder.remove_before(1).is_ok());
    }

    #[test]
    fn test_get_returns_payload() {
        let mut encoder = Encoder::new();
        encoder.add(&[10, 20, 30]).unwrap();
        encoder.add(&[40]).unwrap();

        assert_eq!(encoder.get(0).unwrap(), &[10, 20, 30]);
        assert_eq!(encoder.get(1).unwrap(), &[40]);
        assert_eq!(encoder.get(2).unwrap_err(), CodecError::NeedMoreData);
    }

    #[test]
    fn test_statistics_track_adds() {
        let mut encoder = Encoder::new();
        encoder.add(&[0; 100]).unwrap();
        encoder.add(&[0; 50]).unwrap();

        let stats = encoder.statistics();
        assert_eq!(stats.original_count, 2);
        assert_eq!(stats.original_bytes, 150);
        assert!(stats.memory_used > 0);
    }
}
