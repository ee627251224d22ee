//! Selective-acknowledgement ingestion and the loss iterator.
//!
//! An acknowledgement is `varint(next_column_expected)` followed by zero or
//! more `(varint relative_start, varint loss_count_minus_1)` loss ranges.
//! The header prunes the window; the ranges are kept as raw bytes and
//! decoded lazily by an iterator that yields one lost column per call, so
//! retransmission can stop mid-list and resume.

use tracing::trace;

use crate::column::{add_columns, increment_column};
use crate::serialize::{read_packet_num, read_varint};
use crate::window::PacketWindow;

/// Zero guard bytes appended to the loss-range data so range decoding can
/// read past a truncated message and fail cleanly.
const PADDING_BYTES: usize = 8;

/// State of the most recent acknowledgement.
#[derive(Debug, Default)]
pub(crate) struct AckState {
    /// Raw loss-range bytes plus padding; `None` until the first
    /// acknowledgement carrying ranges arrives.
    data: Option<Vec<u8>>,

    /// Bytes of real loss-range data (excluding padding).
    data_bytes: usize,

    /// Next byte of loss-range data to decode.
    offset: usize,

    /// Next lost column, or the base for the next range's relative start.
    loss_column: u32,

    /// Losses remaining in the current range.
    loss_count: u32,

    /// Next column the receiver expects.
    pub next_column_expected: u32,
}

impl AckState {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if the last acknowledgement reported any losses.
    pub fn has_negative_acknowledgements(&self) -> bool {
        self.data_bytes > 0
    }

    /// Ingest an acknowledgement message, pruning the window.
    ///
    /// Returns false if the message is malformed. A byte-identical repeat of
    /// the previous message is accepted without touching any state.
    pub fn on_acknowledgement(&mut self, window: &mut PacketWindow, message: &[u8]) -> bool {
        let Some((next_column_expected, header_bytes)) = read_packet_num(message) else {
            return false;
        };
        let ranges = &message[header_bytes..];

        // Ignore duplicate data
        if self.next_column_expected == next_column_expected {
            if let Some(data) = &self.data {
                if ranges.len() == self.data_bytes && ranges == &data[..self.data_bytes] {
                    return true;
                }
            }
        }

        self.next_column_expected = next_column_expected;
        window.remove_before(next_column_expected);

        // Reset the range decoder
        self.offset = 0;
        self.loss_column = next_column_expected;
        self.loss_count = 0;
        self.data_bytes = ranges.len();

        if ranges.is_empty() {
            return true;
        }

        let data = self.data.get_or_insert_with(Vec::new);
        data.clear();
        data.extend_from_slice(ranges);
        data.extend_from_slice(&[0u8; PADDING_BYTES]);

        // False if the first loss range is malformed
        self.decode_next_range()
    }

    /// Decode the next loss range from the stored bytes.
    fn decode_next_range(&mut self) -> bool {
        if self.offset >= self.data_bytes {
            return false;
        }
        let Some(data) = &self.data else {
            return false;
        };

        let slice = &data[self.offset..];
        let Some((relative_start, start_bytes)) = read_varint(slice) else {
            return false;
        };
        let Some((loss_count_m1, count_bytes)) = read_varint(&slice[start_bytes..]) else {
            return false;
        };

        self.offset += start_bytes + count_bytes;
        if self.offset > self.data_bytes {
            // The varints ran into the padding: truncated message
            return false;
        }

        self.loss_column = add_columns(self.loss_column, relative_start);
        self.loss_count = loss_count_m1 + 1;
        trace!(
            column = self.loss_column,
            count = self.loss_count,
            "decoded loss range"
        );
        true
    }

    /// Yield the next lost column, or `None` when the list is exhausted.
    /// Call [`Self::restart_loss_iterator`] to walk the list again.
    pub fn next_loss_column(&mut self) -> Option<u32> {
        if self.loss_count == 0 {
            // loss_column doubles as the base for the next range's relative
            // start; move it one beyond the end of the current region first
            self.loss_column = increment_column(self.loss_column);

            if !self.decode_next_range() {
                return None;
            }
        }

        let column = self.loss_column;
        self.loss_column = increment_column(self.loss_column);
        self.loss_count -= 1;
        Some(column)
    }

    /// Rewind the loss iterator to just after ingestion.
    pub fn restart_loss_iterator(&mut self) {
        self.offset = 0;
        self.loss_column = self.next_column_expected;
        self.loss_count = 0;

        // A malformed tail shows up again on the next iteration
        let _ = self.decode_next_range();
    }

    /// Bytes of buffer memory held by the acknowledgement state.
    pub fn allocated_bytes(&self) -> usize {
        self.data.as_ref().map_or(0, |data| data.capacity())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialize::{write_varint, MAX_VARINT_BYTES};

    /// Build an ack message: next_column_expected plus loss ranges given as
    /// (relative_start, loss_count_minus_1).
    fn ack_bytes(next_column_expected: u32, ranges: &[(u32, u32)]) -> Vec<u8> {
        let mut message = Vec::new();
        let mut scratch = [0u8; MAX_VARINT_BYTES];
        let n = write_varint(next_column_expected, &mut scratch);
        message.extend_from_slice(&scratch[..n]);
        for &(relative_start, count_m1) in ranges {
            let n = write_varint(relative_start, &mut scratch);
            message.extend_from_slice(&scratch[..n]);
            let n = write_varint(count_m1, &mut scratch);
            message.extend_from_slice(&scratch[..n]);
        }
        message
    }

    fn window_with(count: usize) -> PacketWindow {
        let mut window = PacketWindow::new();
        for _ in 0..count {
            window.add(&[0xee], 0).unwrap();
        }
        window
    }

    #[test]
    fn test_header_prunes_window() {
        let mut window = window_with(20);
        let mut ack = AckState::new();

        assert!(ack.on_acknowledgement(&mut window, &ack_bytes(7, &[])));
        assert_eq!(ack.next_column_expected, 7);
        assert_eq!(window.first_unremoved_element, 7);
        assert!(!ack.has_negative_acknowledgements());
    }

    #[test]
    fn test_malformed_header_rejected() {
        let mut window = window_with(5);
        let mut ack = AckState::new();

        assert!(!ack.on_acknowledgement(&mut window, &[0x80]));
        assert_eq!(window.first_unremoved_element, 0);
    }

    #[test]
    fn test_loss_iterator_single_range() {
        let mut window = window_with(20);
        let mut ack = AckState::new();

        // Receiver expects 0, lost columns 3 and 4
        assert!(ack.on_acknowledgement(&mut window, &ack_bytes(0, &[(3, 1)])));
        assert!(ack.has_negative_acknowledgements());

        assert_eq!(ack.next_loss_column(), Some(3));
        assert_eq!(ack.next_loss_column(), Some(4));
        assert_eq!(ack.next_loss_column(), None);
    }

    #[test]
    fn test_loss_iterator_multiple_ranges() {
        let mut window = window_with(40);
        let mut ack = AckState::new();

        // Lost: 5, then a second range further along. After range one ends
        // at column 5, the next relative start is measured from column 7.
        assert!(ack.on_acknowledgement(&mut window, &ack_bytes(2, &[(3, 0), (4, 2)])));

        assert_eq!(ack.next_loss_column(), Some(5));
        assert_eq!(ack.next_loss_column(), Some(11));
        assert_eq!(ack.next_loss_column(), Some(12));
        assert_eq!(ack.next_loss_column(), Some(13));
        assert_eq!(ack.next_loss_column(), None);
    }

    #[test]
    fn test_restart_loss_iterator() {
        let mut window = window_with(20);
        let mut ack = AckState::new();

        assert!(ack.on_acknowledgement(&mut window, &ack_bytes(0, &[(3, 1)])));
        assert_eq!(ack.next_loss_column(), Some(3));

        ack.restart_loss_iterator();
        assert_eq!(ack.next_loss_column(), Some(3));
        assert_eq!(ack.next_loss_column(), Some(4));
        assert_eq!(ack.next_loss_column(), None);

        // Exhaustion does not consume the list permanently
        ack.restart_loss_iterator();
        assert_eq!(ack.next_loss_column(), Some(3));
    }

    #[test]
    fn test_duplicate_ack_skipped() {
        let mut window = window_with(20);
        let mut ack = AckState::new();

        let message = ack_bytes(5, &[(2, 0)]);
        assert!(ack.on_acknowledgement(&mut window, &message));
        assert_eq!(ack.next_loss_column(), Some(7));

        // Identical bytes again: accepted, but the iterator position and
        // window state are untouched
        assert!(ack.on_acknowledgement(&mut window, &message));
        assert_eq!(ack.next_loss_column(), None);
    }

    #[test]
    fn test_changed_ack_reprocessed() {
        let mut window = window_with(30);
        let mut ack = AckState::new();

        assert!(ack.on_acknowledgement(&mut window, &ack_bytes(5, &[(2, 0)])));
        assert!(ack.on_acknowledgement(&mut window, &ack_bytes(9, &[(1, 0)])));

        assert_eq!(ack.next_column_expected, 9);
        assert_eq!(window.first_unremoved_element, 9);
        assert_eq!(ack.next_loss_column(), Some(10));
    }

    #[test]
    fn test_truncated_range_rejected() {
        let mut window = window_with(20);
        let mut ack = AckState::new();

        // Header parses, then a dangling continuation byte for the range
        let mut message = ack_bytes(0, &[]);
        message.push(0x80);
        assert!(!ack.on_acknowledgement(&mut window, &message));
    }
}
