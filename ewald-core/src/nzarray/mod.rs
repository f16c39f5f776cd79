//! Sparse "non-zero" arrays.
//!
//! Binned 2D histograms are mostly empty: a detector at a given scan point only
//! covers a narrow band of the full radial range. `NzArray1`/`NzArray2` keep the
//! logical shape, the half-open bounding box of the non-zero content, and a dense
//! block covering just that box.
//!
//! Binary operators between two arrays of equal shape work on the union of both
//! boxes. Division is "safe": `x / 0 == 0`, so empty bins stay finite through
//! aggregation. Operators with a scalar that keep zero at zero act on the stored
//! block only; the others, and operators with a dense array, go through
//! [`full`](NzArray1::full) and re-sparsify.

mod one;
mod two;

pub use one::NzArray1;
pub use two::NzArray2;

/// Division that maps a zero divisor to zero.
#[inline]
#[must_use]
pub fn safe_divide(x: f64, y: f64) -> f64 {
    if y == 0.0 {
        0.0
    } else {
        x / y
    }
}

/// Floor of [`safe_divide`], the `//` operator of the sparse arrays.
#[inline]
#[must_use]
pub fn safe_floor_divide(x: f64, y: f64) -> f64 {
    safe_divide(x, y).floor()
}

/// Union of two half-open intervals where `(lo, lo)` is the empty interval.
fn union_interval(a: (usize, usize), b: (usize, usize)) -> (usize, usize) {
    match (a.0 == a.1, b.0 == b.1) {
        (true, true) => (0, 0),
        (true, false) => b,
        (false, true) => a,
        (false, false) => (a.0.min(b.0), a.1.max(b.1)),
    }
}

/// Wraps a possibly negative index against a length.
fn wrap_index(i: isize, len: usize) -> Option<usize> {
    let len_i = isize::try_from(len).ok()?;
    let idx = if i < 0 { i + len_i } else { i };
    if (0..len_i).contains(&idx) {
        usize::try_from(idx).ok()
    } else {
        None
    }
}

macro_rules! impl_nz_ops {
    ($ty:ty, $dense:ty) => {
        impl_nz_ops!(@op $ty, $dense, Add, add, |x: f64, y: f64| x + y);
        impl_nz_ops!(@op $ty, $dense, Sub, sub, |x: f64, y: f64| x - y);
        impl_nz_ops!(@op $ty, $dense, Mul, mul, |x: f64, y: f64| x * y);
        impl_nz_ops!(@op $ty, $dense, Div, div, $crate::nzarray::safe_divide);

        impl std::ops::AddAssign<&$ty> for $ty {
            fn add_assign(&mut self, rhs: &$ty) {
                *self = &*self + rhs;
            }
        }

        impl std::ops::SubAssign<&$ty> for $ty {
            fn sub_assign(&mut self, rhs: &$ty) {
                *self = &*self - rhs;
            }
        }
    };
    (@op $ty:ty, $dense:ty, $trait:ident, $method:ident, $f:expr) => {
        impl std::ops::$trait<&$ty> for &$ty {
            type Output = $ty;

            fn $method(self, rhs: &$ty) -> $ty {
                self.binary(rhs, $f)
            }
        }

        impl std::ops::$trait<$ty> for $ty {
            type Output = $ty;

            fn $method(self, rhs: $ty) -> $ty {
                self.binary(&rhs, $f)
            }
        }

        impl std::ops::$trait<f64> for &$ty {
            type Output = $ty;

            fn $method(self, rhs: f64) -> $ty {
                self.scalar(rhs, $f)
            }
        }

        impl std::ops::$trait<f64> for $ty {
            type Output = $ty;

            fn $method(self, rhs: f64) -> $ty {
                self.scalar(rhs, $f)
            }
        }

        impl std::ops::$trait<&$dense> for &$ty {
            type Output = $ty;

            fn $method(self, rhs: &$dense) -> $ty {
                self.binary_dense(rhs, $f)
            }
        }
    };
}

pub(crate) use impl_nz_ops;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_divide() {
        assert!((safe_divide(4.0, 2.0) - 2.0).abs() < f64::EPSILON);
        assert!(safe_divide(4.0, 0.0).abs() < f64::EPSILON);
        assert!((safe_floor_divide(7.0, 2.0) - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_union_interval() {
        assert_eq!(union_interval((20, 70), (50, 80)), (20, 80));
        assert_eq!(union_interval((0, 0), (50, 80)), (50, 80));
        assert_eq!(union_interval((5, 9), (0, 0)), (5, 9));
        assert_eq!(union_interval((0, 0), (0, 0)), (0, 0));
    }

    #[test]
    fn test_wrap_index() {
        assert_eq!(wrap_index(-1, 10), Some(9));
        assert_eq!(wrap_index(3, 10), Some(3));
        assert_eq!(wrap_index(10, 10), None);
        assert_eq!(wrap_index(-11, 10), None);
    }
}
