//! Two-dimensional sparse array.

use super::{impl_nz_ops, union_interval, wrap_index};
use crate::{Error, Result};
use ndarray::{s, Array1, Array2, ArrayView2, Zip};
use std::ops::Range;

/// A 2D array storing only the bounding box `[r_lo, r_hi) × [c_lo, c_hi)` of
/// its non-zero values.
#[derive(Debug, Clone, PartialEq)]
pub struct NzArray2 {
    shape: (usize, usize),
    corners: [usize; 4],
    data: Array2<f64>,
}

impl NzArray2 {
    /// An all-zero array of the given shape.
    #[must_use]
    pub fn zeros(shape: (usize, usize)) -> Self {
        Self {
            shape,
            corners: [0; 4],
            data: Array2::zeros((0, 0)),
        }
    }

    /// Builds the sparse form of a dense array.
    #[must_use]
    pub fn from_dense(dense: ArrayView2<'_, f64>) -> Self {
        let mut rows: Option<(usize, usize)> = None;
        let mut cols: Option<(usize, usize)> = None;
        for ((r, c), &v) in dense.indexed_iter() {
            if v != 0.0 {
                rows = Some(rows.map_or((r, r + 1), |(lo, hi)| (lo.min(r), hi.max(r + 1))));
                cols = Some(cols.map_or((c, c + 1), |(lo, hi)| (lo.min(c), hi.max(c + 1))));
            }
        }
        match (rows, cols) {
            (Some((r_lo, r_hi)), Some((c_lo, c_hi))) => Self {
                shape: dense.dim(),
                corners: [r_lo, r_hi, c_lo, c_hi],
                data: dense.slice(s![r_lo..r_hi, c_lo..c_hi]).to_owned(),
            },
            _ => Self::zeros(dense.dim()),
        }
    }

    /// Reassembles an array from its stored parts.
    ///
    /// # Errors
    /// Returns an error if the corners fall outside `shape` or the data block
    /// does not match the box size.
    pub fn from_parts(shape: (usize, usize), corners: [usize; 4], data: Array2<f64>) -> Result<Self> {
        let [r_lo, r_hi, c_lo, c_hi] = corners;
        if r_lo > r_hi || c_lo > c_hi || r_hi > shape.0 || c_hi > shape.1 {
            return Err(Error::Parse(format!(
                "corners {corners:?} outside shape {shape:?}"
            )));
        }
        let expected = (r_hi - r_lo, c_hi - c_lo);
        if data.dim() != expected {
            return Err(Error::shape(
                &[expected.0, expected.1],
                &[data.nrows(), data.ncols()],
            ));
        }
        if expected.0 == 0 || expected.1 == 0 {
            return Ok(Self::zeros(shape));
        }
        Ok(Self {
            shape,
            corners,
            data,
        })
    }

    /// Logical dimensions `(rows, cols)`.
    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    /// Bounding box `[r_lo, r_hi, c_lo, c_hi]` of the stored block.
    #[must_use]
    pub fn corners(&self) -> [usize; 4] {
        self.corners
    }

    /// The stored block.
    #[must_use]
    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    /// True when nothing is stored, i.e. the array is logically all zero.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Dense view with the block placed into a zero array of shape `shape`.
    #[must_use]
    pub fn full(&self) -> Array2<f64> {
        let mut out = Array2::zeros(self.shape);
        let [r_lo, r_hi, c_lo, c_hi] = self.corners;
        out.slice_mut(s![r_lo..r_hi, c_lo..c_hi]).assign(&self.data);
        out
    }

    /// Element at `(row, col)`; negative indices count from the end.
    #[must_use]
    pub fn get(&self, row: isize, col: isize) -> Option<f64> {
        let r = wrap_index(row, self.shape.0)?;
        let c = wrap_index(col, self.shape.1)?;
        let [r_lo, r_hi, c_lo, c_hi] = self.corners;
        if (r_lo..r_hi).contains(&r) && (c_lo..c_hi).contains(&c) {
            Some(self.data[[r - r_lo, c - c_lo]])
        } else {
            Some(0.0)
        }
    }

    /// Dense copy of a rectangular region.
    ///
    /// # Panics
    /// Panics if the region extends past the logical shape.
    #[must_use]
    pub fn slice(&self, rows: Range<usize>, cols: Range<usize>) -> Array2<f64> {
        assert!(
            rows.start <= rows.end
                && rows.end <= self.shape.0
                && cols.start <= cols.end
                && cols.end <= self.shape.1,
            "slice {rows:?} x {cols:?} out of bounds for shape {:?}",
            self.shape
        );
        let [r_lo, r_hi, c_lo, c_hi] = self.corners;
        if rows.start >= r_lo && rows.end <= r_hi && cols.start >= c_lo && cols.end <= c_hi {
            self.data
                .slice(s![
                    rows.start - r_lo..rows.end - r_lo,
                    cols.start - c_lo..cols.end - c_lo
                ])
                .to_owned()
        } else {
            self.full().slice(s![rows, cols]).to_owned()
        }
    }

    /// One logical row as a dense array.
    ///
    /// # Panics
    /// Panics if `row` is out of range.
    #[must_use]
    pub fn row(&self, row: isize) -> Array1<f64> {
        let r = wrap_index(row, self.shape.0)
            .unwrap_or_else(|| panic!("row {row} out of range for {:?}", self.shape));
        self.slice(r..r + 1, 0..self.shape.1)
            .row(0)
            .to_owned()
    }

    /// Values selected by a boolean mask of the full shape, in row-major order.
    ///
    /// # Panics
    /// Panics if the mask shape differs from the logical shape.
    #[must_use]
    pub fn masked(&self, mask: &Array2<bool>) -> Array1<f64> {
        assert_eq!(mask.dim(), self.shape, "mask must match the logical shape");
        mask.indexed_iter()
            .filter(|&(_, &keep)| keep)
            .map(|((r, c), _)| {
                let [r_lo, r_hi, c_lo, c_hi] = self.corners;
                if (r_lo..r_hi).contains(&r) && (c_lo..c_hi).contains(&c) {
                    self.data[[r - r_lo, c - c_lo]]
                } else {
                    0.0
                }
            })
            .collect()
    }

    /// Applies `f` to every stored element; the bounding box is unchanged.
    #[must_use]
    pub fn map_data<F: Fn(f64) -> f64>(&self, f: F) -> Self {
        Self {
            shape: self.shape,
            corners: self.corners,
            data: self.data.mapv(f),
        }
    }

    /// Elementwise `f(x, rhs)` over the logical array.
    ///
    /// Stays on the stored block when `f` maps zero to zero, otherwise the
    /// result is built from the dense array.
    #[must_use]
    pub fn scalar<F: Fn(f64, f64) -> f64>(&self, rhs: f64, f: F) -> Self {
        if f(0.0, rhs) == 0.0 {
            self.map_data(|x| f(x, rhs))
        } else {
            let out = self.full().mapv(|x| f(x, rhs));
            Self::from_dense(out.view())
        }
    }

    /// `self // other` with safe division.
    ///
    /// # Panics
    /// Panics if the logical shapes differ.
    #[must_use]
    pub fn floor_div(&self, other: &Self) -> Self {
        self.binary(other, super::safe_floor_divide)
    }

    /// Fallible elementwise operation over the union of both boxes.
    ///
    /// # Errors
    /// Returns [`Error::ShapeMismatch`] if the logical shapes differ.
    pub fn checked_binary<F: Fn(f64, f64) -> f64>(&self, other: &Self, f: F) -> Result<Self> {
        if self.shape != other.shape {
            return Err(Error::shape(
                &[self.shape.0, self.shape.1],
                &[other.shape.0, other.shape.1],
            ));
        }
        Ok(self.combine(other, f))
    }

    fn binary<F: Fn(f64, f64) -> f64>(&self, other: &Self, f: F) -> Self {
        assert_eq!(
            self.shape, other.shape,
            "NzArray2 operands must share a logical shape"
        );
        self.combine(other, f)
    }

    fn combine<F: Fn(f64, f64) -> f64>(&self, other: &Self, f: F) -> Self {
        let (r_lo, r_hi) = union_interval(self.row_span(), other.row_span());
        let (c_lo, c_hi) = union_interval(self.col_span(), other.col_span());
        let corners = [r_lo, r_hi, c_lo, c_hi];
        let a = self.embed(corners);
        let b = other.embed(corners);
        let data = Zip::from(&a).and(&b).map_collect(|&x, &y| f(x, y));
        Self {
            shape: self.shape,
            corners,
            data,
        }
    }

    fn binary_dense<F: Fn(f64, f64) -> f64>(&self, dense: &Array2<f64>, f: F) -> Self {
        assert_eq!(
            self.shape,
            dense.dim(),
            "dense operand must match the logical shape"
        );
        let full = self.full();
        let out = Zip::from(&full).and(dense).map_collect(|&x, &y| f(x, y));
        Self::from_dense(out.view())
    }

    fn row_span(&self) -> (usize, usize) {
        if self.is_empty() {
            (0, 0)
        } else {
            (self.corners[0], self.corners[1])
        }
    }

    fn col_span(&self) -> (usize, usize) {
        if self.is_empty() {
            (0, 0)
        } else {
            (self.corners[2], self.corners[3])
        }
    }

    fn embed(&self, corners: [usize; 4]) -> Array2<f64> {
        let [r_lo, r_hi, c_lo, c_hi] = corners;
        let mut out = Array2::zeros((r_hi - r_lo, c_hi - c_lo));
        if !self.is_empty() {
            let [a, b, c, d] = self.corners;
            out.slice_mut(s![a - r_lo..b - r_lo, c - c_lo..d - c_lo])
                .assign(&self.data);
        }
        out
    }
}

impl From<Array2<f64>> for NzArray2 {
    fn from(dense: Array2<f64>) -> Self {
        Self::from_dense(dense.view())
    }
}

impl_nz_ops!(NzArray2, Array2<f64>);
