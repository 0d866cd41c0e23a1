// matrix.rs — Square, row-major single-precision matrix.
//
// Both convolution operands and its result are square. The input matrix A
// and the kernel B are immutable once loaded; the result C is written once
// by the device and then read back.
//
// Memory layout (side = 3, stride = 4):
//
//   data index:  0  1  2 [3]  4  5  6 [7]  8  9 10 [11]
//   element:     ■  ■  ■  ·   ■  ■  ■  ·   ■  ■  ■  ·
//   row:         |- row 0 -|  |- row 1 -|  |- row 2 -|
//
// A stride larger than the side appears when a result is read back from a
// device grid that was over-allocated to alignedN × alignedN. `compact()`
// strips that padding again. Matrices built from host data always have
// stride == side.

use std::fmt;

/// A square matrix of `f32` with runtime side length.
#[derive(Clone, PartialEq)]
pub struct Matrix {
    /// Elements in row-major order. Length = stride * rows, where rows is
    /// `side` for compact matrices and at least `side` for padded ones.
    data: Vec<f32>,
    side: usize,
    stride: usize,
}

impl Matrix {
    /// Zero-initialised `side × side` matrix.
    pub fn new(side: usize) -> Self {
        Matrix {
            data: vec![0.0; side * side],
            side,
            stride: side,
        }
    }

    /// Wrap an existing row-major vector.
    ///
    /// # Panics
    /// Panics if `data.len() != side * side`.
    pub fn from_vec(side: usize, data: Vec<f32>) -> Self {
        assert_eq!(
            data.len(),
            side * side,
            "data length ({}) must equal side * side ({})",
            data.len(),
            side * side,
        );
        Matrix { data, side, stride: side }
    }

    /// Wrap a padded grid whose rows are `stride` elements apart.
    ///
    /// Only the top-left `side × side` region is logically part of the
    /// matrix; the rest is padding.
    ///
    /// # Panics
    /// Panics if `stride < side` or `data` is shorter than `stride * side`.
    pub fn from_vec_with_stride(side: usize, stride: usize, data: Vec<f32>) -> Self {
        assert!(stride >= side, "stride ({stride}) must be >= side ({side})");
        assert!(
            data.len() >= stride * side,
            "data length ({}) must cover stride * side ({})",
            data.len(),
            stride * side,
        );
        Matrix { data, side, stride }
    }

    /// Build a matrix by evaluating `f(row, col)` for every cell.
    pub fn from_fn(side: usize, mut f: impl FnMut(usize, usize) -> f32) -> Self {
        let mut data = Vec::with_capacity(side * side);
        for row in 0..side {
            for col in 0..side {
                data.push(f(row, col));
            }
        }
        Matrix { data, side, stride: side }
    }

    #[inline]
    pub fn side(&self) -> usize {
        self.side
    }

    #[inline]
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Value at (`row`, `col`).
    ///
    /// # Panics
    /// Panics if the position lies outside the logical `side × side` region.
    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.bounds_check(row, col);
        self.data[row * self.stride + col]
    }

    /// Value at a signed position, or 0.0 outside the matrix.
    ///
    /// This is the zero-padding boundary policy of the convolution.
    #[inline]
    pub fn get_or_zero(&self, row: isize, col: isize) -> f32 {
        let side = self.side as isize;
        if row < 0 || col < 0 || row >= side || col >= side {
            0.0
        } else {
            self.data[row as usize * self.stride + col as usize]
        }
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, value: f32) {
        self.bounds_check(row, col);
        self.data[row * self.stride + col] = value;
    }

    /// Borrow one logical row (padding excluded).
    #[inline]
    pub fn row(&self, row: usize) -> &[f32] {
        assert!(row < self.side, "row {row} out of bounds (side {})", self.side);
        let start = row * self.stride;
        &self.data[start..start + self.side]
    }

    /// Iterate over logical rows.
    pub fn rows(&self) -> impl Iterator<Item = &[f32]> + '_ {
        (0..self.side).map(move |r| self.row(r))
    }

    /// Borrow the underlying buffer, padding included.
    ///
    /// For a compact matrix this is exactly the row-major element list.
    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Drop stride padding, returning a matrix with stride == side.
    pub fn compact(self) -> Matrix {
        if self.stride == self.side && self.data.len() == self.side * self.side {
            return self;
        }
        let mut data = Vec::with_capacity(self.side * self.side);
        for r in 0..self.side {
            data.extend_from_slice(self.row(r));
        }
        Matrix { data, side: self.side, stride: self.side }
    }

    /// Largest absolute element-wise difference against `other`.
    ///
    /// # Panics
    /// Panics if the sides differ.
    pub fn max_abs_diff(&self, other: &Matrix) -> f32 {
        assert_eq!(self.side, other.side, "matrix sides differ");
        self.rows()
            .zip(other.rows())
            .flat_map(|(a, b)| a.iter().zip(b).map(|(x, y)| (x - y).abs()))
            .fold(0.0f32, f32::max)
    }

    #[inline]
    fn bounds_check(&self, row: usize, col: usize) {
        assert!(
            row < self.side && col < self.side,
            "({row}, {col}) out of bounds for {}x{} matrix",
            self.side,
            self.side,
        );
    }
}

impl fmt::Debug for Matrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Matrix({}x{}", self.side, self.side)?;
        if self.stride != self.side {
            write!(f, ", stride={}", self.stride)?;
        }
        write!(f, ")")
    }
}
