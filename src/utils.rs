//! Alignment helpers shared by the bootstrap and the allocation path.

use std::mem;

/// Machine word size. Every request is rounded up to a multiple of this so
/// that the chunk headers written after it stay aligned.
pub const WORD_SIZE: usize = mem::size_of::<usize>();

/// It aligns `to_be_aligned` up to the next multiple of `alignment`.
///
/// `alignment` must be a power of two. Returns `None` if rounding up
/// overflows, which only happens for requests no arena could satisfy.
pub fn align(to_be_aligned: usize, alignment: usize) -> Option<usize> {
    debug_assert!(alignment.is_power_of_two());

    to_be_aligned
        .checked_add(alignment - 1)
        .map(|value| value & !(alignment - 1))
}

/// It aligns `to_be_aligned` down to the previous multiple of `alignment`.
pub fn align_down(to_be_aligned: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());

    to_be_aligned & !(alignment - 1)
}
