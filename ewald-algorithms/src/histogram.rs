//! Pixel histogramming shared by every integrator.
//!
//! Each valid pixel drops its whole signal into one `(azimuthal, radial)` bin
//! (no pixel splitting). The bin accumulates the signal and the pixel's
//! normalization factor.
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]

use ndarray::{Array1, Array2, ArrayView2};
use rayon::prelude::*;
use std::ops::AddAssign;

/// Uniform bins over `[lo, hi]`; the upper edge belongs to the last bin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Bins {
    lo: f64,
    hi: f64,
    n: usize,
}

impl Bins {
    pub(crate) fn new(range: [f64; 2], n: usize) -> Self {
        let [a, b] = range;
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        // A degenerate range still needs a positive width.
        let hi = if hi > lo { hi } else { lo + f64::EPSILON.max(lo.abs() * 1e-9) };
        Self { lo, hi, n }
    }

    /// A single bin accepting every value.
    pub(crate) fn unbounded() -> Self {
        Self {
            lo: f64::NEG_INFINITY,
            hi: f64::INFINITY,
            n: 1,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.n
    }

    pub(crate) fn index(&self, v: f64) -> Option<usize> {
        if self.lo == f64::NEG_INFINITY {
            return v.is_finite().then_some(0);
        }
        if !(self.lo..=self.hi).contains(&v) || self.n == 0 {
            return None;
        }
        let k = ((v - self.lo) / (self.hi - self.lo) * self.n as f64) as usize;
        Some(k.min(self.n - 1))
    }

    pub(crate) fn centers(&self) -> Array1<f64> {
        let width = (self.hi - self.lo) / self.n as f64;
        Array1::from_iter((0..self.n).map(|k| self.lo + (k as f64 + 0.5) * width))
    }
}

/// Per-pixel inputs of one detector image, all of the detector shape.
pub(crate) struct PixelInputs<'a> {
    pub image: ArrayView2<'a, f64>,
    pub mask: Option<&'a Array2<bool>>,
    pub radial: ArrayView2<'a, f64>,
    pub azimuth: ArrayView2<'a, f64>,
    /// Normalization factor (solid angle × polarization).
    pub weight: ArrayView2<'a, f64>,
}

impl PixelInputs<'_> {
    fn valid(&self, r: usize, c: usize) -> bool {
        let v = self.image[[r, c]];
        v.is_finite() && v >= 0.0 && !self.mask.is_some_and(|m| m[[r, c]])
    }

    /// Radial extent of valid pixels inside the azimuthal window.
    pub(crate) fn radial_extent(&self, azimuth: &Bins) -> Option<[f64; 2]> {
        let (rows, cols) = self.image.dim();
        let (lo, hi) = (0..rows)
            .into_par_iter()
            .map(|r| {
                let mut lo = f64::INFINITY;
                let mut hi = f64::NEG_INFINITY;
                for c in 0..cols {
                    if self.valid(r, c) && azimuth.index(self.azimuth[[r, c]]).is_some() {
                        let v = self.radial[[r, c]];
                        lo = lo.min(v);
                        hi = hi.max(v);
                    }
                }
                (lo, hi)
            })
            .reduce(
                || (f64::INFINITY, f64::NEG_INFINITY),
                |a, b| (a.0.min(b.0), a.1.max(b.1)),
            );
        (lo <= hi).then_some([lo, hi])
    }
}

/// Summed signal and normalization, `(n_azimuthal, n_radial)`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Histogram {
    pub sum: Array2<f64>,
    pub count: Array2<f64>,
}

impl Histogram {
    pub(crate) fn zeros(shape: (usize, usize)) -> Self {
        Self {
            sum: Array2::zeros(shape),
            count: Array2::zeros(shape),
        }
    }

    /// `sum / count`, zero where nothing was binned.
    pub(crate) fn intensity(&self) -> Array2<f64> {
        ndarray::Zip::from(&self.sum)
            .and(&self.count)
            .map_collect(|&s, &c| ewald_core::safe_divide(s, c))
    }
}

impl AddAssign<&Histogram> for Histogram {
    fn add_assign(&mut self, rhs: &Histogram) {
        self.sum += &rhs.sum;
        self.count += &rhs.count;
    }
}

/// Bins every valid pixel; rows are processed in parallel.
pub(crate) fn histogram(inputs: &PixelInputs<'_>, radial: &Bins, azimuth: &Bins) -> Histogram {
    let (rows, cols) = inputs.image.dim();
    let n_rad = radial.len();
    let n = azimuth.len() * n_rad;
    let (sum, count) = (0..rows)
        .into_par_iter()
        .fold(
            || (vec![0.0; n], vec![0.0; n]),
            |(mut sum, mut count), r| {
                for c in 0..cols {
                    if !inputs.valid(r, c) {
                        continue;
                    }
                    let (Some(i), Some(j)) = (
                        azimuth.index(inputs.azimuth[[r, c]]),
                        radial.index(inputs.radial[[r, c]]),
                    ) else {
                        continue;
                    };
                    let k = i * n_rad + j;
                    sum[k] += inputs.image[[r, c]];
                    count[k] += inputs.weight[[r, c]];
                }
                (sum, count)
            },
        )
        .reduce(
            || (vec![0.0; n], vec![0.0; n]),
            |(mut sa, mut ca), (sb, cb)| {
                for (a, b) in sa.iter_mut().zip(sb) {
                    *a += b;
                }
                for (a, b) in ca.iter_mut().zip(cb) {
                    *a += b;
                }
                (sa, ca)
            },
        );
    let shape = (azimuth.len(), n_rad);
    Histogram {
        sum: Array2::from_shape_vec(shape, sum).unwrap_or_else(|_| Array2::zeros(shape)),
        count: Array2::from_shape_vec(shape, count).unwrap_or_else(|_| Array2::zeros(shape)),
    }
}
