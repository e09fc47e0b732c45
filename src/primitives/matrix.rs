//! Matrix type for 2D numeric data (row-major storage).

use crate::error::{HablarError, Result};
use serde::{Deserialize, Serialize};

/// A 2D matrix of floating-point values (row-major storage).
///
/// An observation matrix holds one feature vector per row; all rows share
/// the column dimension by construction.
///
/// # Examples
///
/// ```
/// use hablar::primitives::Matrix;
///
/// let m = Matrix::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
/// assert_eq!(m.shape(), (2, 3));
/// assert_eq!(m.row_slice(1), &[4.0, 5.0, 6.0]);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix<T> {
    data: Vec<T>,
    rows: usize,
    cols: usize,
}

impl<T: Copy> Matrix<T> {
    /// Creates a new matrix from a vector of data.
    ///
    /// # Errors
    ///
    /// Returns an error if data length doesn't match rows * cols.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<T>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(HablarError::DimensionMismatch {
                expected: format!("{rows}x{cols} = {} elements", rows * cols),
                actual: format!("{} elements", data.len()),
            });
        }
        Ok(Self { data, rows, cols })
    }

    /// Returns the shape as (rows, cols).
    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Returns the number of rows.
    #[must_use]
    pub fn n_rows(&self) -> usize {
        self.rows
    }

    /// Returns the number of columns.
    #[must_use]
    pub fn n_cols(&self) -> usize {
        self.cols
    }

    /// Gets element at (row, col).
    ///
    /// # Panics
    ///
    /// Panics if indices are out of bounds.
    #[must_use]
    pub fn get(&self, row: usize, col: usize) -> T {
        self.data[row * self.cols + col]
    }

    /// Sets element at (row, col).
    ///
    /// # Panics
    ///
    /// Panics if indices are out of bounds.
    pub fn set(&mut self, row: usize, col: usize, value: T) {
        self.data[row * self.cols + col] = value;
    }

    /// Returns a row as a borrowed slice (no copy).
    ///
    /// # Panics
    ///
    /// Panics if `row_idx` is out of bounds.
    #[must_use]
    pub fn row_slice(&self, row_idx: usize) -> &[T] {
        let start = row_idx * self.cols;
        &self.data[start..start + self.cols]
    }

    /// Returns the underlying data as a slice.
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }
}

impl Matrix<f64> {
    /// Creates a matrix of zeros.
    #[must_use]
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            data: vec![0.0; rows * cols],
            rows,
            cols,
        }
    }

    /// Creates an identity matrix.
    #[must_use]
    pub fn eye(n: usize) -> Self {
        let mut data = vec![0.0; n * n];
        for i in 0..n {
            data[i * n + i] = 1.0;
        }
        Self {
            data,
            rows: n,
            cols: n,
        }
    }

    /// Computes the determinant via LU decomposition with partial pivoting.
    ///
    /// # Errors
    ///
    /// Returns an error if the matrix is not square.
    pub fn determinant(&self) -> Result<f64> {
        let (lu, sign) = self.lu_decompose()?;
        let n = self.rows;
        let mut det = sign;
        for i in 0..n {
            det *= lu.get(i, i);
        }
        Ok(det)
    }

    /// Inverts the matrix, returning the inverse and the determinant.
    ///
    /// Uses Gauss-Jordan elimination with partial pivoting.
    ///
    /// # Errors
    ///
    /// Returns [`HablarError::SingularMatrix`] when a pivot (and hence the
    /// determinant) is effectively zero, or a dimension mismatch for a
    /// non-square matrix.
    pub fn inverse(&self) -> Result<(Self, f64)> {
        if self.rows != self.cols {
            return Err(HablarError::DimensionMismatch {
                expected: "square matrix".to_string(),
                actual: format!("{}x{}", self.rows, self.cols),
            });
        }
        let n = self.rows;
        let mut a = self.clone();
        let mut inv = Self::eye(n);
        let mut det = 1.0;

        for col in 0..n {
            // Partial pivoting: swap in the row with the largest pivot.
            let mut pivot_row = col;
            let mut pivot_abs = a.get(col, col).abs();
            for row in (col + 1)..n {
                let candidate = a.get(row, col).abs();
                if candidate > pivot_abs {
                    pivot_abs = candidate;
                    pivot_row = row;
                }
            }
            if pivot_abs < SINGULARITY_TOLERANCE {
                return Err(HablarError::SingularMatrix { det: 0.0 });
            }
            if pivot_row != col {
                a.swap_rows(col, pivot_row);
                inv.swap_rows(col, pivot_row);
                det = -det;
            }

            let pivot = a.get(col, col);
            det *= pivot;
            for j in 0..n {
                a.set(col, j, a.get(col, j) / pivot);
                inv.set(col, j, inv.get(col, j) / pivot);
            }
            for row in 0..n {
                if row == col {
                    continue;
                }
                let factor = a.get(row, col);
                if factor == 0.0 {
                    continue;
                }
                for j in 0..n {
                    a.set(row, j, a.get(row, j) - factor * a.get(col, j));
                    inv.set(row, j, inv.get(row, j) - factor * inv.get(col, j));
                }
            }
        }

        Ok((inv, det))
    }

    fn lu_decompose(&self) -> Result<(Self, f64)> {
        if self.rows != self.cols {
            return Err(HablarError::DimensionMismatch {
                expected: "square matrix".to_string(),
                actual: format!("{}x{}", self.rows, self.cols),
            });
        }
        let n = self.rows;
        let mut lu = self.clone();
        let mut sign = 1.0;

        for col in 0..n {
            let mut pivot_row = col;
            let mut pivot_abs = lu.get(col, col).abs();
            for row in (col + 1)..n {
                let candidate = lu.get(row, col).abs();
                if candidate > pivot_abs {
                    pivot_abs = candidate;
                    pivot_row = row;
                }
            }
            if pivot_row != col {
                lu.swap_rows(col, pivot_row);
                sign = -sign;
            }
            let pivot = lu.get(col, col);
            if pivot == 0.0 {
                // Determinant is exactly zero; remaining elimination is moot.
                return Ok((lu, sign));
            }
            for row in (col + 1)..n {
                let factor = lu.get(row, col) / pivot;
                lu.set(row, col, factor);
                for j in (col + 1)..n {
                    lu.set(row, j, lu.get(row, j) - factor * lu.get(col, j));
                }
            }
        }

        Ok((lu, sign))
    }

    fn swap_rows(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        for j in 0..self.cols {
            self.data.swap(a * self.cols + j, b * self.cols + j);
        }
    }
}

/// Pivots below this magnitude are treated as zero during inversion.
const SINGULARITY_TOLERANCE: f64 = 1e-12;
