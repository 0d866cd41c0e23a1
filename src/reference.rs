// reference.rs — Direct host-side implementations of both primitives.
//
// These are the authoritative baselines. Every device result, simulated or
// real, is validated against them in tests and by `--verify`.
//
// CONVOLUTION
//   C[i][j] = Σ_{u,v} A[i + u - c][j + v - c] * B[u][v],   c = (M - 1) / 2
//
// BORDER HANDLING: Zero (not clamp). A kernel tap that lands outside A
// contributes nothing. For odd M the kernel is centred on the output cell;
// for even M the extra tap falls on the bottom/right side.
//
// SCAN
//   B[i] = Σ_{k <= i} A[k], accumulated strictly left to right in f32.
// The device scan adds in a tree order inside each group, so the two agree
// only within rounding tolerance, not bit for bit.

use crate::matrix::Matrix;

/// Offset from a kernel index to the input index it multiplies.
#[inline]
pub fn kernel_center(m: usize) -> usize {
    m.saturating_sub(1) / 2
}

/// Zero-padded dense 2D convolution of `a` (N×N) with `b` (M×M).
///
/// # Panics
/// Panics if `b` is larger than `a`.
pub fn convolve_direct(a: &Matrix, b: &Matrix) -> Matrix {
    let n = a.side();
    let m = b.side();
    assert!(m <= n, "kernel side ({m}) must not exceed input side ({n})");
    let center = kernel_center(m) as isize;

    Matrix::from_fn(n, |i, j| {
        let mut acc = 0.0f32;
        for u in 0..m {
            let row = i as isize + u as isize - center;
            for v in 0..m {
                let col = j as isize + v as isize - center;
                acc += a.get_or_zero(row, col) * b.get(u, v);
            }
        }
        acc
    })
}

/// Inclusive prefix sum, accumulated left to right.
pub fn inclusive_scan(values: &[f32]) -> Vec<f32> {
    let mut acc = 0.0f32;
    values
        .iter()
        .map(|&v| {
            acc += v;
            acc
        })
        .collect()
}

/// Largest absolute element-wise difference between two equal-length slices.
pub fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len(), "length mismatch ({} vs {})", a.len(), b.len());
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0f32, f32::max)
}

/// Tolerance for comparing a tree-ordered device scan with
/// `inclusive_scan`: relative to the running magnitude of the input.
pub fn scan_tolerance(values: &[f32]) -> f32 {
    let magnitude: f32 = values.iter().map(|v| v.abs()).sum();
    1e-5 * magnitude.max(1.0) * (values.len().max(2) as f32).log2()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_kernel_scales() {
        let a = Matrix::from_vec(3, (1..=9).map(|v| v as f32).collect());
        let b = Matrix::from_vec(1, vec![2.0]);
        let c = convolve_direct(&a, &b);
        let expected: Vec<f32> = (1..=9).map(|v| 2.0 * v as f32).collect();
        assert_eq!(c.as_slice(), expected.as_slice());
    }

    #[test]
    fn test_identity_kernel() {
        let a = Matrix::from_fn(5, |r, c| (r * 5 + c) as f32);
        let mut k = Matrix::new(3);
        k.set(1, 1, 1.0);
        let c = convolve_direct(&a, &k);
        assert_eq!(c, a);
    }

    #[test]
    fn test_zero_border() {
        // All-ones input, all-ones 3×3 kernel: each output counts the number
        // of in-range neighbours.
        let a = Matrix::from_vec(3, vec![1.0; 9]);
        let b = Matrix::from_vec(3, vec![1.0; 9]);
        let c = convolve_direct(&a, &b);
        assert_eq!(c.get(0, 0), 4.0); // corner
        assert_eq!(c.get(0, 1), 6.0); // edge
        assert_eq!(c.get(1, 1), 9.0); // interior
    }

    #[test]
    fn test_shift_kernel_moves_content() {
        // Kernel with a single tap at (0, 0) reads A[i - 1][j - 1].
        let a = Matrix::from_fn(4, |r, c| (r * 4 + c + 1) as f32);
        let mut k = Matrix::new(3);
        k.set(0, 0, 1.0);
        let c = convolve_direct(&a, &k);
        assert_eq!(c.get(0, 0), 0.0);
        assert_eq!(c.get(1, 1), a.get(0, 0));
        assert_eq!(c.get(3, 3), a.get(2, 2));
    }

    #[test]
    #[should_panic(expected = "must not exceed")]
    fn test_kernel_larger_than_input_panics() {
        convolve_direct(&Matrix::new(2), &Matrix::new(3));
    }

    #[test]
    fn test_inclusive_scan_small() {
        assert_eq!(inclusive_scan(&[1.0, 2.0, 3.0, 4.0, 5.0]), vec![1.0, 3.0, 6.0, 10.0, 15.0]);
        assert!(inclusive_scan(&[]).is_empty());
        assert_eq!(inclusive_scan(&[7.5]), vec![7.5]);
    }

    #[test]
    fn test_kernel_center() {
        assert_eq!(kernel_center(1), 0);
        assert_eq!(kernel_center(3), 1);
        assert_eq!(kernel_center(4), 1);
        assert_eq!(kernel_center(5), 2);
    }
}
