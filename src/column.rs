//! Packet number (column) arithmetic.
//!
//! Columns live in a circular 22-bit space; all comparisons are deltas
//! modulo [`COLUMN_PERIOD`]. A delta in the upper half of the space means
//! the subtracted column was ahead of the other ("negative delta"). Raw
//! signed comparison is never valid on columns.

use crate::{COLUMN_LANE_COUNT, COLUMN_PERIOD};

const COLUMN_MASK: u32 = COLUMN_PERIOD - 1;

/// `(a + b) mod COLUMN_PERIOD`
#[inline]
pub fn add_columns(a: u32, b: u32) -> u32 {
    (a.wrapping_add(b)) & COLUMN_MASK
}

/// `(a - b) mod COLUMN_PERIOD`
#[inline]
pub fn subtract_columns(a: u32, b: u32) -> u32 {
    (a.wrapping_sub(b)) & COLUMN_MASK
}

/// `(a + 1) mod COLUMN_PERIOD`
#[inline]
pub fn increment_column(a: u32) -> u32 {
    (a.wrapping_add(1)) & COLUMN_MASK
}

/// True if a column delta lands in the upper half of the space, meaning the
/// subtraction wrapped and the result is really negative.
#[inline]
pub fn is_column_delta_negative(delta: u32) -> bool {
    delta >= COLUMN_PERIOD / 2
}

/// First element at or after `element` that falls in `lane`.
#[inline]
pub fn next_lane_element(element: usize, lane: usize) -> usize {
    debug_assert!(lane < COLUMN_LANE_COUNT);
    let mut next = element - (element % COLUMN_LANE_COUNT) + lane;
    if next < element {
        next += COLUMN_LANE_COUNT;
    }
    debug_assert!(next >= element && next % COLUMN_LANE_COUNT == lane);
    next
}
