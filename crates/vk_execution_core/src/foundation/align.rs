//! Alignment helpers

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be a power of two. Zero alignment returns the value unchanged.
#[inline]
#[must_use]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return value;
    }
    (value + alignment - 1) & !(alignment - 1)
}

/// Round `value` down to the nearest multiple of `alignment` (power of two)
#[inline]
#[must_use]
pub const fn align_down(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return value;
    }
    value & !(alignment - 1)
}
