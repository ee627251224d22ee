//! The sliding packet window and its per-lane running sums.
//!
//! Originals are stored in a rotating sequence of fixed-size subwindows and
//! indexed by *element*: a 0-based offset from `column_start` with the
//! invariant `element % 8 == column % 8`. Elements below
//! `first_unremoved_element` have been acknowledged and are logically
//! erased, though their storage lingers until compaction.
//!
//! Each of the eight lanes keeps three GF(256) running sums over the
//! originals in its residue class:
//!
//! - sum 0: plain XOR of the packet buffers
//! - sum 1: XOR of `column_value(c) * buffer`
//! - sum 2: XOR of `column_value(c)^2 * buffer`
//!
//! Sums extend lazily: [`PacketWindow::get_sum`] walks a lane forward from
//! its high-water mark to a target element, so generating a recovery row
//! touches each packet once no matter how many rows are emitted.

use tracing::{debug, trace};

use crate::buffer::AlignedBuffer;
use crate::column::{
    add_columns, increment_column, is_column_delta_negative, next_lane_element, subtract_columns,
};
use crate::gf;
use crate::rowgen::column_value;
use crate::serialize::{varint_len, write_varint};
use crate::{CodecError, Result};
use crate::{COLUMN_LANE_COUNT, COLUMN_SUM_COUNT, MAX_PACKETS, SUBWINDOW_SIZE};

/// An original packet held in the window.
///
/// The buffer is the varint length prefix followed by the payload;
/// `header_bytes` caches the prefix width so the payload can be returned
/// without reparsing.
#[derive(Debug, Default)]
pub(crate) struct OriginalPacket {
    pub column: u32,
    pub buffer: AlignedBuffer,
    pub header_bytes: usize,
    /// Milliseconds (encoder clock) when this original was last sent,
    /// either the initial transmission at add time or a retransmit.
    pub last_send_msec: u64,
}

impl OriginalPacket {
    /// Payload with the length prefix stripped.
    pub fn payload(&self) -> &[u8] {
        &self.buffer.as_slice()[self.header_bytes..]
    }
}

/// Fixed-size block of window storage. Evicted subwindows rotate to the
/// back of the window's vector and their buffers are reused.
#[derive(Debug)]
pub(crate) struct Subwindow {
    pub originals: Vec<OriginalPacket>,
}

impl Subwindow {
    fn new() -> Self {
        let mut originals = Vec::new();
        originals.resize_with(SUBWINDOW_SIZE, OriginalPacket::default);
        Self { originals }
    }
}

/// One residue class of the window with its three running sums.
#[derive(Debug, Default)]
pub(crate) struct ColumnLane {
    /// Next element to accumulate into each sum, always congruent to the
    /// lane index mod the lane count.
    pub next_element: [usize; COLUMN_SUM_COUNT],
    pub sums: [AlignedBuffer; COLUMN_SUM_COUNT],
    /// Longest packet buffer seen in this lane. Kept per-lane so highly
    /// variable packet sizes do not force every sum to the global maximum.
    pub longest_packet: usize,
}

/// The encoder's sliding window of original packets.
#[derive(Debug)]
pub(crate) struct PacketWindow {
    /// Next column number to assign.
    pub next_column: u32,

    /// Elements in the window, including the logically erased prefix.
    pub count: usize,

    /// Column of element 0. Undefined while `count == 0`.
    pub column_start: u32,

    /// Longest packet buffer in the unremoved region.
    pub longest_packet: usize,

    /// First element not yet acknowledged. Advanced by `remove_before`.
    pub first_unremoved_element: usize,

    /// Element range currently reflected in the lane sums, plus the number
    /// of summed elements that compaction has since removed. Together with
    /// `sum_column_start` these describe the recovery metadata of a dense
    /// row.
    pub sum_start_element: usize,
    pub sum_end_element: usize,
    pub sum_column_start: u32,
    pub sum_erased_count: usize,

    pub subwindows: Vec<Subwindow>,

    pub lanes: [ColumnLane; COLUMN_LANE_COUNT],

    /// Set on allocation failure or a broken invariant; the codec stays
    /// disabled forever after.
    pub emergency_disabled: bool,
}

impl PacketWindow {
    pub fn new() -> Self {
        let mut window = Self {
            next_column: 0,
            count: 0,
            column_start: 0,
            longest_packet: 0,
            first_unremoved_element: 0,
            sum_start_element: 0,
            sum_end_element: 0,
            sum_column_start: 0,
            sum_erased_count: 0,
            subwindows: Vec::new(),
            lanes: Default::default(),
            emergency_disabled: false,
        };
        window.clear_window();
        window
    }

    fn clear_window(&mut self) {
        self.first_unremoved_element = 0;
        self.count = 0;
        self.longest_packet = 0;
        self.sum_start_element = 0;
        self.sum_end_element = 0;

        for (lane_index, lane) in self.lanes.iter_mut().enumerate() {
            for sum_index in 0..COLUMN_SUM_COUNT {
                lane.sums[sum_index].clear();
                lane.next_element[sum_index] = lane_index;
            }
            lane.longest_packet = 0;
        }
    }

    // =========================================================================
    // Element addressing
    // =========================================================================

    #[inline]
    pub fn column_to_element(&self, column: u32) -> usize {
        subtract_columns(column, self.column_start) as usize
    }

    #[inline]
    pub fn element_to_column(&self, element: usize) -> u32 {
        add_columns(self.column_start, element as u32)
    }

    #[inline]
    pub fn invalid_element(&self, element: usize) -> bool {
        element >= self.count
    }

    /// Precondition: `element < count`.
    #[inline]
    pub fn get_window_element(&self, element: usize) -> &OriginalPacket {
        debug_assert!(element < self.count);
        &self.subwindows[element / SUBWINDOW_SIZE].originals[element % SUBWINDOW_SIZE]
    }

    #[inline]
    pub fn get_window_element_mut(&mut self, element: usize) -> &mut OriginalPacket {
        debug_assert!(element < self.count);
        &mut self.subwindows[element / SUBWINDOW_SIZE].originals[element % SUBWINDOW_SIZE]
    }

    /// Elements in flight: appended but not yet acknowledged.
    #[inline]
    pub fn unacknowledged_count(&self) -> usize {
        debug_assert!(self.first_unremoved_element < self.count || self.count == 0);
        self.count - self.first_unremoved_element
    }

    // =========================================================================
    // Append
    // =========================================================================

    /// Append a packet, assigning it the next column number.
    pub fn add(&mut self, data: &[u8], now_msec: u64) -> Result<u32> {
        if self.emergency_disabled {
            return Err(CodecError::Disabled);
        }
        if self.count >= MAX_PACKETS {
            return Err(CodecError::MaxPacketsReached);
        }

        let column = self.next_column;
        let mut element = self.count;

        // Keep a lane's worth of headroom so the element chosen by a window
        // restart always has storage behind it
        if element + COLUMN_LANE_COUNT >= self.subwindows.len() * SUBWINDOW_SIZE {
            self.subwindows.push(Subwindow::new());
        }

        if self.count > 0 {
            self.count += 1;
        } else {
            element = column as usize % COLUMN_LANE_COUNT;
            self.start_new_window(column);
        }
        debug_assert!(element % COLUMN_LANE_COUNT == column as usize % COLUMN_LANE_COUNT);

        // Store as length prefix + payload, reusing any buffer capacity left
        // behind by an evicted packet
        let header_bytes = varint_len(data.len() as u32);
        let total_bytes = header_bytes + data.len();
        let original = self.get_window_element_mut(element);
        if !original.buffer.reset_zeroed(total_bytes) {
            self.emergency_disabled = true;
            debug!("window add: buffer allocation failed, codec disabled");
            return Err(CodecError::Disabled);
        }
        original.column = column;
        original.header_bytes = header_bytes;
        original.last_send_msec = now_msec;
        let buf = original.buffer.as_mut_slice();
        let written = write_varint(data.len() as u32, buf);
        debug_assert_eq!(written, header_bytes);
        buf[header_bytes..].copy_from_slice(data);

        self.next_column = increment_column(column);

        let original_bytes = total_bytes;
        let lane = &mut self.lanes[column as usize % COLUMN_LANE_COUNT];
        if lane.longest_packet < original_bytes {
            lane.longest_packet = original_bytes;
        }
        if self.longest_packet < original_bytes {
            self.longest_packet = original_bytes;
        }

        Ok(column)
    }

    fn start_new_window(&mut self, column: u32) {
        // Skip ahead so element % 8 == column % 8 holds from the first packet
        let element = column as usize % COLUMN_LANE_COUNT;
        self.column_start = column - element as u32;
        self.sum_start_element = element;
        self.sum_end_element = element;
        self.first_unremoved_element = element;
        self.count = element + 1;

        self.longest_packet = 0;
        for lane in &mut self.lanes {
            lane.longest_packet = 0;
        }

        debug!(column_start = self.column_start, "starting a new window");
    }

    // =========================================================================
    // Prefix removal
    // =========================================================================

    /// Logically erase everything before `first_kept_column`. Physical
    /// removal is deferred to [`Self::remove_elements`].
    pub fn remove_before(&mut self, first_kept_column: u32) {
        if self.emergency_disabled {
            return;
        }

        let first_kept_element = self.column_to_element(first_kept_column);

        if self.invalid_element(first_kept_element) {
            if is_column_delta_negative(first_kept_element as u32) {
                trace!(
                    column = first_kept_column,
                    "remove before: ignored, before window"
                );
            } else {
                self.count = 0;
                trace!(column = first_kept_column, "remove before: cleared window");
            }
        } else if self.first_unremoved_element < first_kept_element {
            // Never regresses
            self.first_unremoved_element = first_kept_element;
        }
    }

    /// Rebuild every lane sum from scratch starting at `element_start`.
    pub fn reset_sums(&mut self, element_start: usize) {
        for (lane_index, lane) in self.lanes.iter_mut().enumerate() {
            let next_element = next_lane_element(element_start, lane_index);
            for sum_index in 0..COLUMN_SUM_COUNT {
                lane.next_element[sum_index] = next_element;
                lane.sums[sum_index].clear();
            }
        }

        self.sum_start_element = element_start;
        self.sum_end_element = element_start;
        self.sum_column_start = self.element_to_column(element_start);
        self.sum_erased_count = 0;
    }

    /// Physically remove whole acknowledged subwindows from the front.
    ///
    /// Precondition: `first_unremoved_element >= SUBWINDOW_SIZE`.
    pub fn remove_elements(&mut self) {
        let first_kept_subwindow = self.first_unremoved_element / SUBWINDOW_SIZE;
        let removed_count = first_kept_subwindow * SUBWINDOW_SIZE;
        debug_assert!(first_kept_subwindow >= 1);
        debug_assert!(removed_count % COLUMN_LANE_COUNT == 0);
        debug_assert!(removed_count <= self.first_unremoved_element);

        debug!(
            first_unremoved = self.first_unremoved_element,
            column_start = self.column_start,
            "removing acknowledged window prefix"
        );

        // If there are running sums, roll them forward past the removal
        // point so the removed packets stay represented in the sum span
        if self.sum_end_element > self.sum_start_element {
            for lane_index in 0..COLUMN_LANE_COUNT {
                for sum_index in 0..COLUMN_SUM_COUNT {
                    self.get_sum(lane_index, sum_index, removed_count);

                    let next = &mut self.lanes[lane_index].next_element[sum_index];
                    debug_assert!(*next >= removed_count);
                    *next = next.saturating_sub(removed_count);
                }
            }

            if removed_count > self.sum_start_element {
                self.sum_erased_count += removed_count - self.sum_start_element;
            }
            self.sum_end_element = self.sum_end_element.saturating_sub(removed_count);
            self.sum_start_element = self.sum_start_element.saturating_sub(removed_count);
        }

        // Kept subwindows shift to the front; evicted ones cycle to the back
        // so their storage is reused
        self.subwindows.rotate_left(first_kept_subwindow);

        debug_assert!(self.count >= removed_count);
        self.count -= removed_count;

        self.column_start = self.element_to_column(removed_count);
        debug_assert_eq!(self.column_start, self.subwindows[0].originals[0].column);

        debug_assert!(self.first_unremoved_element >= removed_count);
        self.first_unremoved_element -= removed_count;

        // Recompute the longest surviving packets
        let mut longest_packet = 0;
        let mut lane_longest = [0usize; COLUMN_LANE_COUNT];
        for element in self.first_unremoved_element..self.count {
            let original = self.get_window_element(element);
            let original_bytes = original.buffer.len();
            debug_assert!(
                original.column as usize % COLUMN_LANE_COUNT == element % COLUMN_LANE_COUNT
            );
            if longest_packet < original_bytes {
                longest_packet = original_bytes;
            }
            let lane_index = element % COLUMN_LANE_COUNT;
            if lane_longest[lane_index] < original_bytes {
                lane_longest[lane_index] = original_bytes;
            }
        }
        self.longest_packet = longest_packet;
        for (lane, &longest) in self.lanes.iter_mut().zip(&lane_longest) {
            lane.longest_packet = longest;
        }

        if self.sum_end_element <= self.sum_start_element {
            self.reset_sums(self.first_unremoved_element);
        }
    }

    // =========================================================================
    // Running sums
    // =========================================================================

    /// Extend a lane sum up to (exclusive) `element_end` and return it.
    ///
    /// On allocation failure the codec is disabled and the sum is returned
    /// unextended; the caller observes the disabled flag on its next call.
    pub fn get_sum(
        &mut self,
        lane_index: usize,
        sum_index: usize,
        element_end: usize,
    ) -> &AlignedBuffer {
        let lanes = &mut self.lanes;
        let subwindows = &self.subwindows;

        let lane = &mut lanes[lane_index];
        let mut element = lane.next_element[sum_index];
        debug_assert!(element % COLUMN_LANE_COUNT == lane_index);
        debug_assert!(element < self.count + COLUMN_LANE_COUNT);

        let mut failed = false;
        if element < element_end {
            let sum = &mut lane.sums[sum_index];

            // Make room for the widest packet in the lane up front
            if lane.longest_packet > 0 && !sum.grow_zero_padded(lane.longest_packet) {
                failed = true;
            } else {
                loop {
                    let original =
                        &subwindows[element / SUBWINDOW_SIZE].originals[element % SUBWINDOW_SIZE];
                    let add_bytes = original.buffer.len();
                    trace!(
                        lane = lane_index,
                        sum = sum_index,
                        column = original.column,
                        "accumulating into lane sum"
                    );

                    // A packet flushed from the erased prefix can still be
                    // wider than the lane's current longest
                    if !sum.grow_zero_padded(add_bytes) {
                        failed = true;
                        break;
                    }

                    let dst = &mut sum.as_mut_slice()[..add_bytes];
                    if sum_index == 0 {
                        gf::xor_mem(dst, original.buffer.as_slice());
                    } else {
                        let mut cx = column_value(original.column);
                        if sum_index == 2 {
                            cx = gf::sqr(cx);
                        }
                        gf::muladd_mem(dst, cx, original.buffer.as_slice());
                    }

                    element += COLUMN_LANE_COUNT;
                    if element >= element_end {
                        break;
                    }
                }

                if !failed {
                    lane.next_element[sum_index] = element;
                }
            }
        }

        if failed {
            self.emergency_disabled = true;
            debug!("lane sum growth failed, codec disabled");
        }
        &self.lanes[lane_index].sums[sum_index]
    }

    // =========================================================================
    // Accounting
    // =========================================================================

    /// Bytes of buffer memory currently allocated by the window.
    pub fn allocated_bytes(&self) -> usize {
        let packets: usize = self
            .subwindows
            .iter()
            .flat_map(|subwindow| &subwindow.originals)
            .map(|original| original.buffer.capacity())
            .sum();
        let sums: usize = self
            .lanes
            .iter()
            .flat_map(|lane| &lane.sums)
            .map(|sum| sum.capacity())
            .sum();
        packets + sums
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::REMOVE_THRESHOLD;

    fn window_with(count: usize, payload: &[u8]) -> PacketWindow {
        let mut window = PacketWindow::new();
        for _ in 0..count {
            window.add(payload, 0).unwrap();
        }
        window
    }

    /// Reference sum: direct accumulation over the window, bypassing the
    /// incremental path.
    fn reference_sum(window: &PacketWindow, lane: usize, sum_index: usize, end: usize) -> Vec<u8> {
        let mut expected = vec![0u8; window.longest_packet.max(1)];
        let mut element = lane;
        while element < end {
            let original = window.get_window_element(element);
            let bytes = original.buffer.len();
            match sum_index {
                0 => gf::xor_mem(&mut expected[..bytes], original.buffer.as_slice()),
                1 => gf::muladd_mem(
                    &mut expected[..bytes],
                    column_value(original.column),
                    original.buffer.as_slice(),
                ),
                _ => gf::muladd_mem(
                    &mut expected[..bytes],
                    gf::sqr(column_value(original.column)),
                    original.buffer.as_slice(),
                ),
            }
            element += COLUMN_LANE_COUNT;
        }
        expected
    }

    #[test]
    fn test_add_assigns_sequential_columns() {
        let mut window = PacketWindow::new();
        for expected in 0..20u32 {
            assert_eq!(window.add(&[expected as u8], 0).unwrap(), expected);
        }
        assert_eq!(window.count, 20);
        assert_eq!(window.column_start, 0);
    }

    #[test]
    fn test_element_column_lane_invariant() {
        let window = window_with(50, &[0x5a; 17]);
        for element in window.first_unremoved_element..window.count {
            let original = window.get_window_element(element);
            assert_eq!(original.column, window.element_to_column(element));
            assert_eq!(window.column_to_element(original.column), element);
            assert_eq!(
                element % COLUMN_LANE_COUNT,
                original.column as usize % COLUMN_LANE_COUNT
            );
        }
    }

    #[test]
    fn test_stored_packet_layout() {
        let mut window = PacketWindow::new();
        window.add(&[9, 8, 7], 0).unwrap();
        let original = window.get_window_element(0);
        assert_eq!(original.header_bytes, 1);
        assert_eq!(original.buffer.as_slice(), &[3, 9, 8, 7]);
        assert_eq!(original.payload(), &[9, 8, 7]);
        assert_eq!(window.longest_packet, 4);
    }

    #[test]
    fn test_longest_packet_per_lane() {
        let mut window = PacketWindow::new();
        window.add(&[0; 10], 0).unwrap(); // lane 0: 11 bytes stored
        window.add(&[0; 100], 0).unwrap(); // lane 1: 101 bytes stored
        assert_eq!(window.lanes[0].longest_packet, 11);
        assert_eq!(window.lanes[1].longest_packet, 101);
        assert_eq!(window.longest_packet, 101);
    }

    #[test]
    fn test_max_packets_reached() {
        let mut window = window_with(MAX_PACKETS, &[1]);
        assert_eq!(window.add(&[1], 0), Err(CodecError::MaxPacketsReached));
    }

    #[test]
    fn test_remove_before_cases() {
        let mut window = window_with(20, &[1]);

        // Advance into the window
        window.remove_before(5);
        assert_eq!(window.first_unremoved_element, 5);

        // Never regresses
        window.remove_before(3);
        assert_eq!(window.first_unremoved_element, 5);

        // Negative delta (before the window start) is ignored
        window.remove_before(crate::COLUMN_PERIOD - 10);
        assert_eq!(window.first_unremoved_element, 5);
        assert_eq!(window.count, 20);

        // Beyond the window clears everything
        window.remove_before(25);
        assert_eq!(window.count, 0);
    }

    #[test]
    fn test_window_restart_preserves_lane_invariant() {
        let mut window = window_with(13, &[1]);
        window.remove_before(13); // clears: 13 is one past the last column
        assert_eq!(window.count, 0);

        // Next add restarts the window; column 13 must land on element 5
        let column = window.add(&[2], 0).unwrap();
        assert_eq!(column, 13);
        assert_eq!(window.column_start, 8);
        assert_eq!(window.count, 6);
        assert_eq!(window.first_unremoved_element, 5);
        let original = window.get_window_element(5);
        assert_eq!(original.column, 13);
    }

    #[test]
    fn test_get_sum_matches_reference() {
        let mut window = PacketWindow::new();
        for i in 0..40u32 {
            let len = 5 + (i as usize % 11);
            let payload: Vec<u8> = (0..len).map(|j| (i as usize * 31 + j * 7) as u8).collect();
            window.add(&payload, 0).unwrap();
        }
        window.reset_sums(0);

        for lane in 0..COLUMN_LANE_COUNT {
            for sum_index in 0..COLUMN_SUM_COUNT {
                let expected = reference_sum(&window, lane, sum_index, 40);
                // The sum buffer only spans the lane's own longest packet
                let sum = window.get_sum(lane, sum_index, 40).as_slice();
                assert_eq!(sum, &expected[..sum.len()], "lane {lane} sum {sum_index}");
                assert!(expected[sum.len()..].iter().all(|&byte| byte == 0));
            }
        }
        assert!(!window.emergency_disabled);
    }

    #[test]
    fn test_get_sum_is_incremental() {
        let mut window = window_with(32, &[0xc3; 20]);
        window.reset_sums(0);

        // Extend halfway, then fully; must equal a one-shot accumulation
        window.get_sum(2, 1, 16);
        let incremental = window.get_sum(2, 1, 32).as_slice().to_vec();

        let expected = reference_sum(&window, 2, 1, 32);
        assert_eq!(&incremental[..expected.len()], &expected[..]);
        assert_eq!(window.lanes[2].next_element[1], 34);
    }

    #[test]
    fn test_remove_elements_rebases_window() {
        let mut window = window_with(200, &[7; 30]);
        window.reset_sums(0);
        // Activate the sums so compaction has something to roll up
        for lane in 0..COLUMN_LANE_COUNT {
            for sum_index in 0..COLUMN_SUM_COUNT {
                window.get_sum(lane, sum_index, window.count);
            }
        }
        window.sum_end_element = window.count;

        window.remove_before(REMOVE_THRESHOLD as u32 + 10);
        assert_eq!(window.first_unremoved_element, REMOVE_THRESHOLD + 10);

        window.remove_elements();

        // Two whole subwindows went away
        assert_eq!(window.count, 200 - REMOVE_THRESHOLD);
        assert_eq!(window.column_start, REMOVE_THRESHOLD as u32);
        assert_eq!(window.first_unremoved_element, 10);
        assert_eq!(window.get_window_element(0).column, REMOVE_THRESHOLD as u32);

        // Sum bookkeeping shifted with the removal
        assert_eq!(window.sum_erased_count, REMOVE_THRESHOLD);
        assert_eq!(window.sum_end_element, window.count);
        for lane in &window.lanes {
            for &next in &lane.next_element {
                assert!(next <= window.count + COLUMN_LANE_COUNT);
            }
        }

        // Longest packet recomputed over survivors
        assert_eq!(window.longest_packet, 31);
        assert!(!window.emergency_disabled);
    }

    #[test]
    fn test_allocated_bytes_grows_with_adds() {
        let mut window = PacketWindow::new();
        let before = window.allocated_bytes();
        for _ in 0..10 {
            window.add(&[0; 500], 0).unwrap();
        }
        assert!(window.allocated_bytes() > before);
    }

    #[test]
    fn test_disabled_window_rejects_operations() {
        let mut window = window_with(3, &[1]);
        window.emergency_disabled = true;
        assert_eq!(window.add(&[1], 0), Err(CodecError::Disabled));
        // remove_before becomes a no-op
        window.remove_before(2);
        assert_eq!(window.first_unremoved_element, 0);
    }
}
