//! Free block list mapper: translates block sizes into `(fl, sl)` indices
//! of the segregated free lists.

use crate::{
    block::{
        BLOCK_SIZE_MAX, BLOCK_SIZE_MIN, FL_INDEX_SHIFT, SL_INDEX_COUNT, SL_INDEX_COUNT_LOG2,
        SMALL_BLOCK_SIZE,
    },
    utils::fls_size,
};

/// Find the free list to store a free block of the specified size.
///
/// Sizes below [`SMALL_BLOCK_SIZE`] all map into first-level class 0, which
/// is linearly subdivided; larger sizes use their base-2 magnitude as the
/// first level and the next [`SL_INDEX_COUNT_LOG2`] bits as the second.
#[inline]
pub(crate) fn mapping_insert(size: usize) -> (usize, usize) {
    debug_assert!(size >= BLOCK_SIZE_MIN);
    if size < SMALL_BLOCK_SIZE {
        (0, size / (SMALL_BLOCK_SIZE / SL_INDEX_COUNT))
    } else {
        let fl = fls_size(size) as u32;
        let sl = (size >> (fl - SL_INDEX_COUNT_LOG2)) ^ (1 << SL_INDEX_COUNT_LOG2);
        ((fl - (FL_INDEX_SHIFT - 1)) as usize, sl)
    }
}

/// Find the first free list whose every member is at least as large as the
/// specified size.
///
/// Rounds the size up to the next class boundary first, so any block found
/// at or after the returned indices satisfies the request without a size
/// comparison. The returned `fl` may be one past the last valid class for
/// requests near [`BLOCK_SIZE_MAX`]; callers reject that range.
///
/// [`BLOCK_SIZE_MAX`]: crate::BLOCK_SIZE_MAX
#[inline]
pub(crate) fn mapping_search(mut size: usize) -> (usize, usize) {
    if size >= SMALL_BLOCK_SIZE {
        let round = (1usize << (fls_size(size) as u32 - SL_INDEX_COUNT_LOG2)) - 1;
        size += round;
    }
    mapping_insert(size)
}

/// Adjust an allocation request upward to the pool's granularity.
///
/// Returns 0 for a zero request and for requests whose aligned size would
/// reach [`BLOCK_SIZE_MAX`] (or overflow entirely).
///
/// [`BLOCK_SIZE_MAX`]: crate::BLOCK_SIZE_MAX
#[inline]
pub(crate) fn adjust_request_size(size: usize, align: usize) -> usize {
    if size == 0 {
        return 0;
    }
    let aligned = match size.checked_add(align - 1) {
        Some(padded) => padded & !(align - 1),
        None => return 0,
    };
    if aligned < BLOCK_SIZE_MAX {
        aligned.max(BLOCK_SIZE_MIN)
    } else {
        0
    }
}
