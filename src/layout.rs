// layout.rs — Block alignment arithmetic shared by both engines.
//
// Every buffer the host hands to a device is sized to a whole number of
// groups. The logical length N is rounded up to
//
//   alignedN = ceil(N / block) * block
//
// and the tail [N, alignedN) is zero-filled. Zero is the identity of the
// only operation that ever touches padding (addition), so the padding is
// numerically inert: it never changes a block total and never reaches a
// valid output index.
//
// The scan recursion shrinks a level of `size` elements to one of
// `align(size / block, block)` elements until a single group remains, which
// makes the number of levels ceil(log_block(alignedN)). `scan_depth`
// reproduces that loop without touching a device so the engine can assert
// against it.

/// Round `n` up to the next multiple of `block`.
///
/// # Panics
/// Panics if `block` is zero.
#[inline]
pub fn align(n: usize, block: usize) -> usize {
    assert!(block > 0, "block size must be non-zero");
    n.div_ceil(block) * block
}

/// Number of groups of `block` workers needed to cover `n` elements.
#[inline]
pub fn group_count(n: usize, block: usize) -> usize {
    assert!(block > 0, "block size must be non-zero");
    n.div_ceil(block)
}

/// Copy `values` into a zero-filled vector of length `align(values.len(), block)`.
pub fn pad_to_block(values: &[f32], block: usize) -> Vec<f32> {
    let mut padded = vec![0.0f32; align(values.len(), block)];
    padded[..values.len()].copy_from_slice(values);
    padded
}

/// Size of the level that follows a level of `size` elements.
///
/// One element per group, rounded back up to a whole group.
#[inline]
pub fn next_level_size(size: usize, block: usize) -> usize {
    align(size / block, block)
}

/// Number of recursion levels the scan performs for `aligned_n` elements,
/// equal to the depth of the propagation stack before it is drained.
///
/// Returns 0 for an empty input.
pub fn scan_depth(aligned_n: usize, block: usize) -> usize {
    assert!(block >= 2, "scan block size must be at least 2 (got {block})");
    if aligned_n == 0 {
        return 0;
    }
    let mut size = aligned_n;
    let mut levels = 1;
    while size > block {
        size = next_level_size(size, block);
        levels += 1;
    }
    levels
}
