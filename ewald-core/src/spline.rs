//! Cubic-spline resampling of polar images onto a new radial axis.
#![allow(clippy::many_single_char_names)]

use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

/// Natural cubic spline through strictly increasing knots.
#[derive(Debug, Clone)]
pub struct CubicSpline {
    x: Vec<f64>,
    y: Vec<f64>,
    m: Vec<f64>,
}

impl CubicSpline {
    /// Fits a natural spline (zero curvature at both ends).
    ///
    /// # Errors
    /// Returns an error if fewer than two knots are given, lengths differ, or
    /// `x` is not strictly increasing.
    pub fn new(x: ArrayView1<'_, f64>, y: ArrayView1<'_, f64>) -> Result<Self> {
        let n = x.len();
        if n != y.len() {
            return Err(Error::Interpolation(format!(
                "knot count {n} does not match value count {}",
                y.len()
            )));
        }
        if n < 2 {
            return Err(Error::Interpolation("need at least two knots".to_string()));
        }
        if x.windows(2).into_iter().any(|w| w[1] <= w[0]) {
            return Err(Error::Interpolation(
                "knots must be strictly increasing".to_string(),
            ));
        }

        let x: Vec<f64> = x.to_vec();
        let y: Vec<f64> = y.to_vec();
        let mut m = vec![0.0; n];
        if n > 2 {
            // Thomas algorithm on the interior second derivatives.
            let mut c_prime = vec![0.0; n];
            let mut d_prime = vec![0.0; n];
            for i in 1..n - 1 {
                let h0 = x[i] - x[i - 1];
                let h1 = x[i + 1] - x[i];
                let a = h0;
                let b = 2.0 * (h0 + h1);
                let c = h1;
                let d = 6.0 * ((y[i + 1] - y[i]) / h1 - (y[i] - y[i - 1]) / h0);
                let denom = b - a * c_prime[i - 1];
                c_prime[i] = c / denom;
                d_prime[i] = (d - a * d_prime[i - 1]) / denom;
            }
            for i in (1..n - 1).rev() {
                m[i] = d_prime[i] - c_prime[i] * m[i + 1];
            }
        }
        Ok(Self { x, y, m })
    }

    /// Evaluates the spline; points outside the knot range return `fill`.
    #[must_use]
    pub fn eval(&self, xq: f64, fill: f64) -> f64 {
        let n = self.x.len();
        if !(self.x[0]..=self.x[n - 1]).contains(&xq) {
            return fill;
        }
        let k = self.x.partition_point(|&v| v <= xq).clamp(1, n - 1);
        let (x0, x1) = (self.x[k - 1], self.x[k]);
        let h = x1 - x0;
        let a = (x1 - xq) / h;
        let b = (xq - x0) / h;
        a * self.y[k - 1]
            + b * self.y[k]
            + ((a * a * a - a) * self.m[k - 1] + (b * b * b - b) * self.m[k]) * h * h / 6.0
    }
}

/// Uniformly spaced axis spanning the range of `axis`.
#[must_use]
pub fn uniform_axis(axis: ArrayView1<'_, f64>) -> Array1<f64> {
    let lo = axis.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = axis.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if axis.is_empty() || !lo.is_finite() || !hi.is_finite() {
        return Array1::zeros(axis.len());
    }
    let mut out = Array1::linspace(lo, hi, axis.len());
    // linspace can overshoot the upper knot by an ulp.
    if let Some(last) = out.last_mut() {
        *last = hi;
    }
    out
}

/// Resamples each row of `image` from `src_axis` onto `dst_axis`.
///
/// Rows are indexed by the azimuthal axis, which is shared between source and
/// destination, so the bivariate resample reduces to one spline per row.
///
/// # Errors
/// Returns an error if the source axis is unusable as spline knots or its
/// length does not match the image columns.
pub fn resample_rows(
    image: ArrayView2<'_, f64>,
    src_axis: ArrayView1<'_, f64>,
    dst_axis: ArrayView1<'_, f64>,
) -> Result<Array2<f64>> {
    if image.ncols() != src_axis.len() {
        return Err(Error::Interpolation(format!(
            "image has {} columns but axis has {} points",
            image.ncols(),
            src_axis.len()
        )));
    }
    let mut out = Array2::zeros((image.nrows(), dst_axis.len()));
    for (row, mut out_row) in image.axis_iter(Axis(0)).zip(out.axis_iter_mut(Axis(0))) {
        let spline = CubicSpline::new(src_axis, row)?;
        for (dst, &xq) in out_row.iter_mut().zip(dst_axis.iter()) {
            *dst = spline.eval(xq, 0.0);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_spline_reproduces_knots() {
        let x = array![0.0, 1.0, 2.5, 4.0];
        let y = array![1.0, -2.0, 0.5, 3.0];
        let spline = CubicSpline::new(x.view(), y.view()).unwrap();
        for (&xi, &yi) in x.iter().zip(y.iter()) {
            assert_abs_diff_eq!(spline.eval(xi, f64::NAN), yi, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_spline_exact_for_lines() {
        let x = Array1::linspace(0.0, 10.0, 11);
        let y = x.mapv(|v| 3.0 * v - 2.0);
        let spline = CubicSpline::new(x.view(), y.view()).unwrap();
        assert_abs_diff_eq!(spline.eval(4.25, 0.0), 10.75, epsilon = 1e-12);
        assert_abs_diff_eq!(spline.eval(11.0, -1.0), -1.0);
    }

    #[test]
    fn test_spline_rejects_bad_knots() {
        let x = array![0.0, 0.0, 1.0];
        let y = array![1.0, 2.0, 3.0];
        assert!(CubicSpline::new(x.view(), y.view()).is_err());
    }

    #[test]
    fn test_resample_rows_smooth_signal() {
        let src = Array1::from_iter((0..40).map(|i| (f64::from(i) * 0.05).powf(1.3)));
        let dst = uniform_axis(src.view());
        let image = Array2::from_shape_fn((3, src.len()), |(r, c)| {
            f64::from(u32::try_from(r).unwrap() + 1) * src[c].sin()
        });
        let out = resample_rows(image.view(), src.view(), dst.view()).unwrap();
        assert_eq!(out.dim(), (3, 40));
        for (r, row) in out.axis_iter(Axis(0)).enumerate() {
            let scale = f64::from(u32::try_from(r).unwrap() + 1);
            for (&q, &v) in dst.iter().zip(row.iter()) {
                assert_abs_diff_eq!(v, scale * q.sin(), epsilon = 1e-2);
            }
        }
    }
}
