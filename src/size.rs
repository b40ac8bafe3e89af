//! Size arithmetic shared by buffer sizing and launch geometry

/// Smallest power of two that is `>= size` (`0` maps to `1`)
///
/// # Panics
/// * If `size` is above the largest power of two a `usize` can hold
pub fn power_of_2ify(size: usize) -> usize {
    match size.max(1).checked_next_power_of_two() {
        Some(p) => p,
        None => panic!("no power of two >= {} fits in usize", size),
    }
}

/// Smallest multiple of `of_this` that is `>= size`
///
/// # Panics
/// * If `of_this` is zero
pub fn round_up_to_multiple(size: usize, of_this: usize) -> usize {
    assert!(of_this > 0, "cannot round up to a multiple of zero");
    size.div_ceil(of_this) * of_this
}
