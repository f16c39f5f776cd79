//! One-dimensional sparse array.

use super::{impl_nz_ops, union_interval, wrap_index};
use crate::{Error, Result};
use ndarray::{s, Array1, ArrayView1, Zip};
use std::ops::Range;

/// A 1D array storing only the bounding box `[lo, hi)` of its non-zero values.
#[derive(Debug, Clone, PartialEq)]
pub struct NzArray1 {
    shape: usize,
    corners: (usize, usize),
    data: Array1<f64>,
}

impl NzArray1 {
    /// An all-zero array of the given length.
    #[must_use]
    pub fn zeros(shape: usize) -> Self {
        Self {
            shape,
            corners: (0, 0),
            data: Array1::zeros(0),
        }
    }

    /// Builds the sparse form of a dense array.
    #[must_use]
    pub fn from_dense(dense: ArrayView1<'_, f64>) -> Self {
        let mut lo = None;
        let mut hi = 0;
        for (i, &v) in dense.iter().enumerate() {
            if v != 0.0 {
                lo.get_or_insert(i);
                hi = i + 1;
            }
        }
        match lo {
            Some(lo) => Self {
                shape: dense.len(),
                corners: (lo, hi),
                data: dense.slice(s![lo..hi]).to_owned(),
            },
            None => Self::zeros(dense.len()),
        }
    }

    /// Reassembles an array from its stored parts.
    ///
    /// # Errors
    /// Returns an error if the corners fall outside `shape` or the data block
    /// does not match the box size.
    pub fn from_parts(shape: usize, corners: (usize, usize), data: Array1<f64>) -> Result<Self> {
        let (lo, hi) = corners;
        if lo > hi || hi > shape {
            return Err(Error::Parse(format!(
                "corners {corners:?} outside shape {shape}"
            )));
        }
        if data.len() != hi - lo {
            return Err(Error::shape(&[hi - lo], &[data.len()]));
        }
        if lo == hi {
            return Ok(Self::zeros(shape));
        }
        Ok(Self {
            shape,
            corners,
            data,
        })
    }

    /// Logical length.
    #[must_use]
    pub fn shape(&self) -> usize {
        self.shape
    }

    /// Half-open bounding box of the stored block.
    #[must_use]
    pub fn corners(&self) -> (usize, usize) {
        self.corners
    }

    /// The stored block.
    #[must_use]
    pub fn data(&self) -> &Array1<f64> {
        &self.data
    }

    /// True when nothing is stored, i.e. the array is logically all zero.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Dense view with the block placed into a zero array of length `shape`.
    #[must_use]
    pub fn full(&self) -> Array1<f64> {
        let mut out = Array1::zeros(self.shape);
        let (lo, hi) = self.corners;
        out.slice_mut(s![lo..hi]).assign(&self.data);
        out
    }

    /// Element at `i`; negative indices count from the end.
    #[must_use]
    pub fn get(&self, i: isize) -> Option<f64> {
        let idx = wrap_index(i, self.shape)?;
        let (lo, hi) = self.corners;
        if (lo..hi).contains(&idx) {
            Some(self.data[idx - lo])
        } else {
            Some(0.0)
        }
    }

    /// Dense copy of `range`, served from the block when it lies inside.
    ///
    /// # Panics
    /// Panics if `range` extends past the logical shape.
    #[must_use]
    pub fn slice(&self, range: Range<usize>) -> Array1<f64> {
        assert!(
            range.start <= range.end && range.end <= self.shape,
            "slice {range:?} out of bounds for shape {}",
            self.shape
        );
        let (lo, hi) = self.corners;
        if range.start >= lo && range.end <= hi {
            self.data
                .slice(s![range.start - lo..range.end - lo])
                .to_owned()
        } else {
            self.full().slice(s![range]).to_owned()
        }
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
            return Err(Error::shape(&[self.shape], &[other.shape]));
        }
        let corners = union_interval(self.corners, other.corners);
        let a = self.embed(corners);
        let b = other.embed(corners);
        let data = Zip::from(&a).and(&b).map_collect(|&x, &y| f(x, y));
        Ok(Self {
            shape: self.shape,
            corners,
            data,
        })
    }

    fn binary<F: Fn(f64, f64) -> f64>(&self, other: &Self, f: F) -> Self {
        assert_eq!(
            self.shape, other.shape,
            "NzArray1 operands must share a logical shape"
        );
        let corners = union_interval(self.corners, other.corners);
        let a = self.embed(corners);
        let b = other.embed(corners);
        let data = Zip::from(&a).and(&b).map_collect(|&x, &y| f(x, y));
        Self {
            shape: self.shape,
            corners,
            data,
        }
    }

    fn binary_dense<F: Fn(f64, f64) -> f64>(&self, dense: &Array1<f64>, f: F) -> Self {
        assert_eq!(
            self.shape,
            dense.len(),
            "dense operand must match the logical shape"
        );
        let full = self.full();
        let out = Zip::from(&full).and(dense).map_collect(|&x, &y| f(x, y));
        Self::from_dense(out.view())
    }

    /// Copies the block into a zero block spanning `corners`.
    fn embed(&self, corners: (usize, usize)) -> Array1<f64> {
        let mut out = Array1::zeros(corners.1 - corners.0);
        if !self.is_empty() {
            let start = self.corners.0 - corners.0;
            let end = self.corners.1 - corners.0;
            out.slice_mut(s![start..end]).assign(&self.data);
        }
        out
    }
}

impl From<Array1<f64>> for NzArray1 {
    fn from(dense: Array1<f64>) -> Self {
        Self::from_dense(dense.view())
    }
}

impl_nz_ops!(NzArray1, Array1<f64>);
