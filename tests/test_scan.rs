// tests/test_scan.rs — Integration tests for the recursive block scan.

use approx::assert_relative_eq;
use proptest::prelude::*;

use tilescan::device::cpu::CpuDevice;
use tilescan::layout::{align, scan_depth};
use tilescan::reference::{inclusive_scan, max_abs_diff, scan_tolerance};
use tilescan::{Host, ScanEngine, ScanOutcome};

fn scan_with(dev: &CpuDevice, values: &[f32], block: usize) -> ScanOutcome {
    let mut host = Host::new(dev);
    ScanEngine::new(block).unwrap().run(&mut host, values).unwrap()
}

fn scan(values: &[f32], block: usize) -> ScanOutcome {
    scan_with(&CpuDevice::new(), values, block)
}

fn ramp(n: usize) -> Vec<f32> {
    (0..n).map(|i| ((i * 37) % 11) as f32 - 5.0).collect()
}

// ===== Boundaries =====

#[test]
fn empty_input_yields_empty_output() {
    let out = scan(&[], 256);
    assert!(out.values.is_empty());
    assert_eq!(out.levels, 0);
}

#[test]
fn single_element_is_identity() {
    let out = scan(&[-3.25], 256);
    assert_eq!(out.values, vec![-3.25]);
    assert_eq!(out.levels, 1);
}

#[test]
fn end_to_end_five_elements() {
    let out = scan(&[1.0, 2.0, 3.0, 4.0, 5.0], 256);
    assert_eq!(out.values, vec![1.0, 3.0, 6.0, 10.0, 15.0]);
}

#[test]
fn exact_multiple_and_one_past() {
    // Small integers: every partial sum is exact in f32, in any order.
    for n in [256usize, 257, 512, 513, 65_536, 65_537] {
        let values = ramp(n);
        let out = scan(&values, 256);
        assert_eq!(out.values.len(), n);
        assert_eq!(out.aligned_len, align(n, 256));
        assert_eq!(out.values, inclusive_scan(&values), "n = {n}");
    }
}

// ===== Recursion depth =====

#[test]
fn depth_is_ceil_log_of_aligned_length() {
    let cases = [
        (1usize, 256usize, 1usize),
        (256, 256, 1),
        (257, 256, 2),
        (65_536, 256, 2),
        (65_537, 256, 3),
        (100, 4, 4),
    ];
    for (n, block, levels) in cases {
        let out = scan(&ramp(n), block);
        assert_eq!(out.levels, levels, "n = {n}, block = {block}");
        assert_eq!(out.levels, scan_depth(align(n, block), block));
    }
}

#[test]
fn million_elements_three_levels() {
    let values = vec![1.0f32; 1_000_000];
    let out = scan(&values, 256);
    assert_eq!(out.levels, 3);
    assert_relative_eq!(out.values[999_999], 1_000_000.0);
    assert_relative_eq!(out.values[511], 512.0);
}

// ===== Padding independence =====

#[test]
fn result_independent_of_block_size() {
    let values = ramp(1_000);
    let reference = scan(&values, 256).values;
    for block in [2usize, 3, 16, 100, 128] {
        assert_eq!(scan(&values, block).values, reference, "block = {block}");
    }
}

#[test]
fn small_group_limit_rejects_large_block() {
    let dev = CpuDevice::new().with_max_group_size(64);
    let mut host = Host::new(&dev);
    let err = ScanEngine::new(256).unwrap().run(&mut host, &[1.0; 10]).unwrap_err();
    assert_eq!(err.code(), Some(-54));
}

// ===== Properties =====

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn matches_sequential_scan(
        values in prop::collection::vec(-100.0f32..100.0, 0..3000),
        block in 2usize..=256,
    ) {
        let out = scan(&values, block);
        prop_assert_eq!(out.values.len(), values.len());
        let want = inclusive_scan(&values);
        prop_assert!(max_abs_diff(&out.values, &want) <= scan_tolerance(&values));
    }

    #[test]
    fn levels_match_scan_depth(n in 1usize..100_000, block in 2usize..64) {
        let out = scan(&vec![0.0; n], block);
        prop_assert_eq!(out.levels, scan_depth(align(n, block), block));
        prop_assert!(out.values.iter().all(|&v| v == 0.0));
    }
}
