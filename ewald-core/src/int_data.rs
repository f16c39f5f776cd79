//! Integration-result containers.
//!
//! Every container carries both radial axes (2θ and q); whichever one the
//! integrator did not produce is derived through Bragg's relation. Adding two
//! containers sums `raw`, `pcount` and `sigma_raw`, then recomputes `norm` and
//! `sigma`, which makes a running aggregate a single `+=`.

use crate::integration::{Integrate1dResult, Integrate2dResult};
use crate::nzarray::{NzArray1, NzArray2};
use crate::spline::{resample_rows, uniform_axis};
use crate::units::{q_axis_to_tth, tth_axis_to_q};
use crate::{Error, RadialUnit, Result};
use ndarray::{Array1, Array2, Axis};
use std::ops::{Add, AddAssign};

fn radial_axes(radial: &Array1<f64>, unit: RadialUnit, wavelength: f64) -> (Array1<f64>, Array1<f64>) {
    match unit {
        RadialUnit::TwoThetaDeg => (radial.clone(), tth_axis_to_q(radial, wavelength)),
        RadialUnit::QInvAngstrom => (q_axis_to_tth(radial, wavelength), radial.clone()),
    }
}

fn monitor_scale(monitor: Option<f64>) -> f64 {
    match monitor {
        Some(m) if m != 0.0 => m,
        _ => 1.0,
    }
}

/// 1D integration: intensity versus radial coordinate.
#[derive(Debug, Clone, PartialEq)]
pub struct IntData1D {
    /// Summed signal per bin.
    pub raw: NzArray1,
    /// Pixel count per bin.
    pub pcount: NzArray1,
    /// `raw / pcount`.
    pub norm: NzArray1,
    pub sigma: NzArray1,
    /// `(pcount · sigma)²`, the additive variance of `raw`.
    pub sigma_raw: NzArray1,
    /// Radial axis, degrees 2θ.
    pub ttheta: Array1<f64>,
    /// Radial axis, Å⁻¹.
    pub q: Array1<f64>,
}

impl Default for IntData1D {
    fn default() -> Self {
        Self::zeros(0)
    }
}

impl IntData1D {
    /// All-zero container with `n` bins and zero axes.
    #[must_use]
    pub fn zeros(n: usize) -> Self {
        Self {
            raw: NzArray1::zeros(n),
            pcount: NzArray1::zeros(n),
            norm: NzArray1::zeros(n),
            sigma: NzArray1::zeros(n),
            sigma_raw: NzArray1::zeros(n),
            ttheta: Array1::zeros(n),
            q: Array1::zeros(n),
        }
    }

    /// Number of radial bins.
    #[must_use]
    pub fn len(&self) -> usize {
        self.raw.shape()
    }

    /// True when the container has no bins.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Builds the container from an integrator result.
    ///
    /// With a monitor value every signal field is divided by it (variances by
    /// its square). A zero monitor is ignored.
    #[must_use]
    pub fn from_result(result: &Integrate1dResult, wavelength: f64, monitor: Option<f64>) -> Self {
        let (ttheta, q) = radial_axes(&result.radial, result.unit, wavelength);
        let m = monitor_scale(monitor);

        let raw = NzArray1::from(&result.sum_signal / m);
        let pcount = NzArray1::from(result.count.clone());
        let norm = &raw / &pcount;
        let sigma = match &result.sigma {
            Some(sigma) => NzArray1::from(sigma / m),
            None => &raw.map_data(|v| v.max(0.0).sqrt() / m.sqrt()) / &pcount,
        };
        let sigma_raw = (&pcount * &sigma).map_data(|v| v * v);
        Self {
            raw,
            pcount,
            norm,
            sigma,
            sigma_raw,
            ttheta,
            q,
        }
    }

    /// True when both containers have the same number of bins.
    #[must_use]
    pub fn same_shape(&self, other: &Self) -> bool {
        self.len() == other.len()
    }

    /// Fallible `+`.
    ///
    /// # Errors
    /// Returns [`Error::ShapeMismatch`] if the bin counts differ.
    pub fn checked_add(&self, other: &Self) -> Result<Self> {
        if !self.same_shape(other) {
            return Err(Error::shape(&[self.len()], &[other.len()]));
        }
        Ok(self + other)
    }

    fn combine(&self, other: &Self) -> Self {
        let raw = &self.raw + &other.raw;
        let pcount = &self.pcount + &other.pcount;
        let sigma_raw = &self.sigma_raw + &other.sigma_raw;
        let norm = &raw / &pcount;
        let sigma = &sigma_raw.map_data(f64::sqrt) / &pcount;
        Self {
            raw,
            pcount,
            norm,
            sigma,
            sigma_raw,
            ttheta: self.ttheta.clone(),
            q: self.q.clone(),
        }
    }
}

impl Add<&IntData1D> for &IntData1D {
    type Output = IntData1D;

    fn add(self, rhs: &IntData1D) -> IntData1D {
        self.combine(rhs)
    }
}

impl AddAssign<&IntData1D> for IntData1D {
    fn add_assign(&mut self, rhs: &IntData1D) {
        *self = self.combine(rhs);
    }
}

/// 2D polar integration for scanning geometry, arrays `(chi, radial)`.
#[derive(Debug, Clone, PartialEq)]
pub struct IntData2D {
    pub raw: NzArray2,
    pub pcount: NzArray2,
    pub norm: NzArray2,
    pub sigma: NzArray2,
    pub sigma_raw: NzArray2,
    pub ttheta: Array1<f64>,
    pub q: Array1<f64>,
    /// Azimuthal axis, degrees.
    pub chi: Array1<f64>,
}

impl Default for IntData2D {
    fn default() -> Self {
        Self::zeros((0, 0))
    }
}

impl IntData2D {
    /// All-zero container of shape `(n_chi, n_radial)`.
    #[must_use]
    pub fn zeros(shape: (usize, usize)) -> Self {
        Self {
            raw: NzArray2::zeros(shape),
            pcount: NzArray2::zeros(shape),
            norm: NzArray2::zeros(shape),
            sigma: NzArray2::zeros(shape),
            sigma_raw: NzArray2::zeros(shape),
            ttheta: Array1::zeros(shape.1),
            q: Array1::zeros(shape.1),
            chi: Array1::zeros(shape.0),
        }
    }

    /// Logical shape `(n_chi, n_radial)`.
    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        self.raw.shape()
    }

    /// Builds the container from an integrator result; see
    /// [`IntData1D::from_result`].
    #[must_use]
    pub fn from_result(result: &Integrate2dResult, wavelength: f64, monitor: Option<f64>) -> Self {
        let (ttheta, q) = radial_axes(&result.radial, result.unit, wavelength);
        let m = monitor_scale(monitor);

        let raw = NzArray2::from(&result.sum_signal / m);
        let pcount = NzArray2::from(result.count.clone());
        let norm = &raw / &pcount;
        let sigma = match &result.sigma {
            Some(sigma) => NzArray2::from(sigma / m),
            None => &raw.map_data(|v| v.max(0.0).sqrt() / m.sqrt()) / &pcount,
        };
        let sigma_raw = (&pcount * &sigma).map_data(|v| v * v);
        Self {
            raw,
            pcount,
            norm,
            sigma,
            sigma_raw,
            ttheta,
            q,
            chi: result.azimuthal.clone(),
        }
    }

    #[must_use]
    pub fn same_shape(&self, other: &Self) -> bool {
        self.shape() == other.shape()
    }

    /// Fallible `+`.
    ///
    /// # Errors
    /// Returns [`Error::ShapeMismatch`] if the shapes differ.
    pub fn checked_add(&self, other: &Self) -> Result<Self> {
        if !self.same_shape(other) {
            let (a, b) = (self.shape(), other.shape());
            return Err(Error::shape(&[a.0, a.1], &[b.0, b.1]));
        }
        Ok(self + other)
    }

    fn combine(&self, other: &Self) -> Self {
        let raw = &self.raw + &other.raw;
        let pcount = &self.pcount + &other.pcount;
        let sigma_raw = &self.sigma_raw + &other.sigma_raw;
        let norm = &raw / &pcount;
        let sigma = &sigma_raw.map_data(f64::sqrt) / &pcount;
        Self {
            raw,
            pcount,
            norm,
            sigma,
            sigma_raw,
            ttheta: self.ttheta.clone(),
            q: self.q.clone(),
            chi: self.chi.clone(),
        }
    }
}

impl Add<&IntData2D> for &IntData2D {
    type Output = IntData2D;

    fn add(self, rhs: &IntData2D) -> IntData2D {
        self.combine(rhs)
    }
}

impl AddAssign<&IntData2D> for IntData2D {
    fn add_assign(&mut self, rhs: &IntData2D) {
        *self = self.combine(rhs);
    }
}

/// 2D integration for static geometry: dense polar views in both units plus
/// the reciprocal `(qz, qxy)` view for grazing incidence.
#[derive(Debug, Clone, PartialEq)]
pub struct IntData2DStatic {
    /// Intensity on `(chi, ttheta)`.
    pub i_tth_chi: Array2<f64>,
    /// Intensity on `(chi, q)`.
    pub i_q_chi: Array2<f64>,
    /// Intensity on `(qz, qxy)`, qz ascending with row index.
    pub i_qxy_qz: Array2<f64>,
    pub qz: Array1<f64>,
    pub qxy: Array1<f64>,
    pub ttheta: Array1<f64>,
    pub q: Array1<f64>,
    pub chi: Array1<f64>,
    /// The q view was resampled from the 2θ view.
    pub q_from_tth: bool,
    /// The 2θ view was resampled from the q view.
    pub tth_from_q: bool,
}

impl Default for IntData2DStatic {
    fn default() -> Self {
        Self {
            i_tth_chi: Array2::zeros((0, 0)),
            i_q_chi: Array2::zeros((0, 0)),
            i_qxy_qz: Array2::zeros((0, 0)),
            qz: Array1::zeros(0),
            qxy: Array1::zeros(0),
            ttheta: Array1::zeros(0),
            q: Array1::zeros(0),
            chi: Array1::zeros(0),
            q_from_tth: false,
            tth_from_q: false,
        }
    }
}

impl IntData2DStatic {
    /// Zeroed container with the same array shapes as `other`.
    #[must_use]
    pub fn zeros_like(other: &Self) -> Self {
        Self {
            i_tth_chi: Array2::zeros(other.i_tth_chi.dim()),
            i_q_chi: Array2::zeros(other.i_q_chi.dim()),
            i_qxy_qz: Array2::zeros(other.i_qxy_qz.dim()),
            qz: Array1::zeros(other.qz.len()),
            qxy: Array1::zeros(other.qxy.len()),
            ttheta: Array1::zeros(other.ttheta.len()),
            q: Array1::zeros(other.q.len()),
            chi: Array1::zeros(other.chi.len()),
            q_from_tth: other.q_from_tth,
            tth_from_q: other.tth_from_q,
        }
    }

    /// Builds the polar views from an integrator result.
    ///
    /// # Errors
    /// Returns an error if the radial axis cannot be resampled.
    pub fn from_result(result: &Integrate2dResult, wavelength: f64) -> Result<Self> {
        let mut out = Self::default();
        out.set_polar(
            &result.intensity,
            &result.radial,
            &result.azimuthal,
            result.unit,
            wavelength,
        )?;
        Ok(out)
    }

    /// Stores a polar image and resamples it onto a uniform axis in the other
    /// radial unit.
    ///
    /// # Errors
    /// Returns an error if the radial axis is not strictly increasing or has
    /// fewer than two points.
    pub fn set_polar(
        &mut self,
        intensity: &Array2<f64>,
        radial: &Array1<f64>,
        chi: &Array1<f64>,
        unit: RadialUnit,
        wavelength: f64,
    ) -> Result<()> {
        match unit {
            RadialUnit::TwoThetaDeg => {
                let q_src = tth_axis_to_q(radial, wavelength);
                let q = uniform_axis(q_src.view());
                self.i_q_chi = resample_rows(intensity.view(), q_src.view(), q.view())?;
                self.i_tth_chi = intensity.clone();
                self.ttheta = radial.clone();
                self.q = q;
                self.q_from_tth = true;
                self.tth_from_q = false;
            }
            RadialUnit::QInvAngstrom => {
                let tth_src = q_axis_to_tth(radial, wavelength);
                let ttheta = uniform_axis(tth_src.view());
                self.i_tth_chi = resample_rows(intensity.view(), tth_src.view(), ttheta.view())?;
                self.i_q_chi = intensity.clone();
                self.q = radial.clone();
                self.ttheta = ttheta;
                self.tth_from_q = true;
                self.q_from_tth = false;
            }
        }
        self.chi = chi.clone();
        Ok(())
    }

    /// Stores a reciprocal-space image given in raster order (highest qz in
    /// the first row); rows are flipped so qz ascends with row index.
    pub fn set_reciprocal(&mut self, raster: &Array2<f64>, qxy: &Array1<f64>, qz: &Array1<f64>) {
        let mut flipped = raster.clone();
        flipped.invert_axis(Axis(0));
        self.i_qxy_qz = flipped;
        self.qxy = qxy.clone();
        let mut qz = qz.clone();
        if qz.len() > 1 && qz[0] > qz[qz.len() - 1] {
            qz.invert_axis(Axis(0));
        }
        self.qz = qz;
    }

    /// True when all three images share their shapes with `other`.
    #[must_use]
    pub fn same_shape(&self, other: &Self) -> bool {
        self.i_tth_chi.dim() == other.i_tth_chi.dim()
            && self.i_q_chi.dim() == other.i_q_chi.dim()
            && self.i_qxy_qz.dim() == other.i_qxy_qz.dim()
    }

    /// Fallible `+`.
    ///
    /// # Errors
    /// Returns [`Error::ShapeMismatch`] if any image shape differs.
    pub fn checked_add(&self, other: &Self) -> Result<Self> {
        if !self.same_shape(other) {
            let (a, b) = (self.i_tth_chi.dim(), other.i_tth_chi.dim());
            return Err(Error::shape(&[a.0, a.1], &[b.0, b.1]));
        }
        Ok(self + other)
    }
}

impl Add<&IntData2DStatic> for &IntData2DStatic {
    type Output = IntData2DStatic;

    fn add(self, rhs: &IntData2DStatic) -> IntData2DStatic {
        let mut out = self.clone();
        out += rhs;
        out
    }
}

impl AddAssign<&IntData2DStatic> for IntData2DStatic {
    fn add_assign(&mut self, rhs: &IntData2DStatic) {
        assert!(
            self.same_shape(rhs),
            "IntData2DStatic operands must share image shapes"
        );
        self.i_tth_chi += &rhs.i_tth_chi;
        self.i_q_chi += &rhs.i_q_chi;
        self.i_qxy_qz += &rhs.i_qxy_qz;
    }
}

/// The 2D integration of an arch or aggregate, by geometry.
#[derive(Debug, Clone, PartialEq)]
pub enum Integration2D {
    Scanning(IntData2D),
    Static(IntData2DStatic),
}

impl Integration2D {
    /// Empty container for the given geometry.
    #[must_use]
    pub fn empty(static_scan: bool) -> Self {
        if static_scan {
            Self::Static(IntData2DStatic::default())
        } else {
            Self::Scanning(IntData2D::default())
        }
    }

    #[must_use]
    pub fn is_static(&self) -> bool {
        matches!(self, Self::Static(_))
    }

    /// The scanning variant, if that is what this holds.
    #[must_use]
    pub fn as_scanning(&self) -> Option<&IntData2D> {
        match self {
            Self::Scanning(data) => Some(data),
            Self::Static(_) => None,
        }
    }

    /// The static variant, if that is what this holds.
    #[must_use]
    pub fn as_static(&self) -> Option<&IntData2DStatic> {
        match self {
            Self::Static(data) => Some(data),
            Self::Scanning(_) => None,
        }
    }

    /// Shape of the primary polar view.
    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        match self {
            Self::Scanning(data) => data.shape(),
            Self::Static(data) => data.i_tth_chi.dim(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::tth_to_q;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    const WAVELENGTH: f64 = 1.0e-10;

    fn result_1d(sum: Array1<f64>, count: Array1<f64>) -> Integrate1dResult {
        let n = sum.len();
        let intensity = ndarray::Zip::from(&sum)
            .and(&count)
            .map_collect(|&s, &c| crate::nzarray::safe_divide(s, c));
        Integrate1dResult {
            radial: Array1::linspace(1.0, 50.0, n),
            sum_signal: sum,
            count,
            intensity,
            sigma: None,
            unit: RadialUnit::TwoThetaDeg,
        }
    }

    #[test]
    fn test_from_result_fills_both_axes() {
        let result = result_1d(array![0.0, 4.0, 9.0, 0.0], array![0.0, 2.0, 3.0, 0.0]);
        let data = IntData1D::from_result(&result, WAVELENGTH, None);
        for (&t, &q) in data.ttheta.iter().zip(data.q.iter()) {
            assert_abs_diff_eq!(q, tth_to_q(t, WAVELENGTH), epsilon = 1e-6);
        }
        assert_eq!(data.norm.full(), array![0.0, 2.0, 3.0, 0.0]);
        assert_eq!(data.raw.corners(), (1, 3));
        // sqrt(raw) / pcount
        assert_abs_diff_eq!(data.sigma.get(1).unwrap(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(data.sigma_raw.get(2).unwrap(), 9.0, epsilon = 1e-12);
    }

    #[test]
    fn test_from_q_result() {
        let mut result = result_1d(array![1.0, 1.0], array![1.0, 1.0]);
        result.radial = array![1.0, 2.0];
        result.unit = RadialUnit::QInvAngstrom;
        let data = IntData1D::from_result(&result, WAVELENGTH, None);
        assert_eq!(data.q, array![1.0, 2.0]);
        assert_abs_diff_eq!(tth_to_q(data.ttheta[1], WAVELENGTH), 2.0, epsilon = 1e-9);
    }

    #[test]
    fn test_monitor_scales_signal() {
        let result = result_1d(array![10.0, 20.0], array![1.0, 2.0]);
        let data = IntData1D::from_result(&result, WAVELENGTH, Some(10.0));
        assert_eq!(data.raw.full(), array![1.0, 2.0]);
        assert_eq!(data.pcount.full(), array![1.0, 2.0]);
        assert_eq!(data.norm.full(), array![1.0, 1.0]);
    }

    #[test]
    fn test_add_keeps_norm_consistent() {
        let a = IntData1D::from_result(
            &result_1d(array![0.0, 4.0, 6.0, 0.0], array![0.0, 2.0, 2.0, 0.0]),
            WAVELENGTH,
            None,
        );
        let b = IntData1D::from_result(
            &result_1d(array![0.0, 0.0, 3.0, 5.0], array![0.0, 0.0, 1.0, 1.0]),
            WAVELENGTH,
            None,
        );
        let mut acc = IntData1D::zeros(4);
        acc += &a;
        acc += &b;
        assert_eq!(acc.raw.full(), array![0.0, 4.0, 9.0, 5.0]);
        assert_eq!(acc.pcount.full(), array![0.0, 2.0, 3.0, 1.0]);
        let expected = array![0.0, 2.0, 3.0, 5.0];
        assert_eq!(acc.norm.full(), expected);
        assert_eq!(acc.sigma_raw.full(), &a.sigma_raw.full() + &b.sigma_raw.full());
    }

    #[test]
    fn test_checked_add_mismatch() {
        let a = IntData1D::zeros(3);
        let b = IntData1D::zeros(4);
        assert!(a.checked_add(&b).is_err());
        assert!(IntData2D::zeros((2, 3))
            .checked_add(&IntData2D::zeros((3, 2)))
            .is_err());
    }

    #[test]
    fn test_2d_from_result() {
        let sum = array![[0.0, 2.0, 0.0], [0.0, 3.0, 6.0]];
        let count = array![[0.0, 1.0, 0.0], [0.0, 1.0, 2.0]];
        let result = Integrate2dResult {
            radial: array![5.0, 10.0, 15.0],
            azimuthal: array![-45.0, 45.0],
            intensity: sum.clone(),
            sum_signal: sum,
            count,
            sigma: None,
            unit: RadialUnit::TwoThetaDeg,
        };
        let data = IntData2D::from_result(&result, WAVELENGTH, None);
        assert_eq!(data.shape(), (2, 3));
        assert_eq!(data.raw.corners(), [0, 2, 1, 3]);
        assert_eq!(data.norm.full(), array![[0.0, 2.0, 0.0], [0.0, 3.0, 3.0]]);
        assert_eq!(data.chi, array![-45.0, 45.0]);
        let doubled = &data + &data;
        assert_eq!(doubled.norm.full(), data.norm.full());
        assert_eq!(doubled.raw.full(), &data.raw.full() * 2.0);
    }

    #[test]
    fn test_static_resample_and_flags() {
        let radial = Array1::linspace(2.0, 40.0, 64);
        let chi = array![-10.0, 0.0, 10.0];
        let intensity = Array2::from_shape_fn((3, 64), |(_, c)| radial[c]);
        let result = Integrate2dResult {
            radial: radial.clone(),
            azimuthal: chi,
            sum_signal: intensity.clone(),
            count: Array2::ones((3, 64)),
            intensity,
            sigma: None,
            unit: RadialUnit::TwoThetaDeg,
        };
        let data = IntData2DStatic::from_result(&result, WAVELENGTH).unwrap();
        assert!(data.q_from_tth);
        assert!(!data.tth_from_q);
        assert_eq!(data.i_q_chi.dim(), (3, 64));
        // A row that is linear in 2θ, sampled on the q grid, reads back the 2θ of
        // each q point.
        for (&q, &v) in data.q.iter().zip(data.i_q_chi.row(1).iter()) {
            assert_abs_diff_eq!(v, crate::units::q_to_tth(q, WAVELENGTH), epsilon = 1e-3);
        }
    }

    #[test]
    fn test_static_reciprocal_flip_and_add() {
        let mut a = IntData2DStatic::default();
        let raster = array![[3.0, 3.0], [2.0, 2.0], [1.0, 1.0]];
        a.set_reciprocal(&raster, &array![-1.0, 1.0], &array![2.0, 1.0, 0.0]);
        assert_eq!(a.i_qxy_qz.row(0).to_vec(), vec![1.0, 1.0]);
        assert_eq!(a.qz, array![0.0, 1.0, 2.0]);

        let mut acc = IntData2DStatic::zeros_like(&a);
        assert!(acc.same_shape(&a));
        acc += &a;
        acc += &a;
        assert_eq!(acc.i_qxy_qz.row(2).to_vec(), vec![6.0, 6.0]);
    }

    #[test]
    fn test_integration_2d_variants() {
        let scanning = Integration2D::empty(false);
        assert!(!scanning.is_static());
        assert!(scanning.as_scanning().is_some());
        let fixed = Integration2D::empty(true);
        assert!(fixed.as_static().is_some());
        assert_eq!(fixed.shape(), (0, 0));
    }
}
