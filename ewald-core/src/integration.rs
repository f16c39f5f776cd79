//! Azimuthal-integrator call contract.
//!
//! Integrators turn one detector image into a 1D pattern (intensity versus a
//! radial coordinate) or a 2D polar rebinning (azimuth × radial). The engine
//! only depends on the traits and result records defined here.

use crate::{Result, RadialUnit};
use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};

/// Arguments of a 1D integration, persisted as `bai_1d_args`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Integrate1dArgs {
    /// Number of radial bins.
    pub numpoints: usize,
    /// Radial unit of the output axis.
    pub unit: RadialUnit,
    /// Radial range in `unit`; `None` spans the image.
    pub radial_range: Option<[f64; 2]>,
    /// Azimuthal range in degrees; `None` keeps every pixel.
    pub azimuth_range: Option<[f64; 2]>,
    /// Metadata key used as monitor normalization.
    pub monitor: Option<String>,
    /// Divide by the relative solid angle of each pixel.
    pub correct_solid_angle: bool,
    /// Polarization factor in `[-1, 1]`; `None` disables the correction.
    pub polarization_factor: Option<f64>,
}

impl Default for Integrate1dArgs {
    fn default() -> Self {
        Self {
            numpoints: 3000,
            unit: RadialUnit::TwoThetaDeg,
            radial_range: None,
            azimuth_range: None,
            monitor: None,
            correct_solid_angle: true,
            polarization_factor: None,
        }
    }
}

impl Integrate1dArgs {
    /// Sets the bin count.
    #[must_use]
    pub fn with_numpoints(mut self, numpoints: usize) -> Self {
        self.numpoints = numpoints;
        self
    }

    /// Sets the radial unit.
    #[must_use]
    pub fn with_unit(mut self, unit: RadialUnit) -> Self {
        self.unit = unit;
        self
    }

    /// Sets the radial range.
    #[must_use]
    pub fn with_radial_range(mut self, range: Option<[f64; 2]>) -> Self {
        self.radial_range = range;
        self
    }

    /// Sets the azimuthal range.
    #[must_use]
    pub fn with_azimuth_range(mut self, range: Option<[f64; 2]>) -> Self {
        self.azimuth_range = range;
        self
    }

    /// Sets the monitor key.
    #[must_use]
    pub fn with_monitor(mut self, monitor: Option<String>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Enables or disables the solid-angle correction.
    #[must_use]
    pub fn with_solid_angle(mut self, enabled: bool) -> Self {
        self.correct_solid_angle = enabled;
        self
    }
}

/// Arguments of a 2D integration, persisted as `bai_2d_args`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Integrate2dArgs {
    /// Number of radial bins.
    pub npt_rad: usize,
    /// Number of azimuthal bins.
    pub npt_azim: usize,
    pub unit: RadialUnit,
    pub radial_range: Option<[f64; 2]>,
    pub azimuth_range: Option<[f64; 2]>,
    /// Grazing incidence: qxy crop of the reciprocal view.
    pub x_range: Option<[f64; 2]>,
    /// Grazing incidence: qz crop of the reciprocal view.
    pub y_range: Option<[f64; 2]>,
    pub monitor: Option<String>,
    pub correct_solid_angle: bool,
    pub polarization_factor: Option<f64>,
}

impl Default for Integrate2dArgs {
    fn default() -> Self {
        Self {
            npt_rad: 1000,
            npt_azim: 1000,
            unit: RadialUnit::TwoThetaDeg,
            radial_range: None,
            azimuth_range: None,
            x_range: None,
            y_range: None,
            monitor: None,
            correct_solid_angle: true,
            polarization_factor: None,
        }
    }
}

impl Integrate2dArgs {
    /// Sets both bin counts.
    #[must_use]
    pub fn with_bins(mut self, npt_rad: usize, npt_azim: usize) -> Self {
        self.npt_rad = npt_rad;
        self.npt_azim = npt_azim;
        self
    }

    /// Sets the radial unit.
    #[must_use]
    pub fn with_unit(mut self, unit: RadialUnit) -> Self {
        self.unit = unit;
        self
    }

    /// Sets the radial range.
    #[must_use]
    pub fn with_radial_range(mut self, range: Option<[f64; 2]>) -> Self {
        self.radial_range = range;
        self
    }

    /// Sets the azimuthal range.
    #[must_use]
    pub fn with_azimuth_range(mut self, range: Option<[f64; 2]>) -> Self {
        self.azimuth_range = range;
        self
    }

    /// Sets the monitor key.
    #[must_use]
    pub fn with_monitor(mut self, monitor: Option<String>) -> Self {
        self.monitor = monitor;
        self
    }

    /// The 1D arguments sharing this record's radial settings.
    #[must_use]
    pub fn radial_args(&self) -> Integrate1dArgs {
        Integrate1dArgs {
            numpoints: self.npt_rad,
            unit: self.unit,
            radial_range: self.radial_range,
            azimuth_range: self.azimuth_range,
            monitor: self.monitor.clone(),
            correct_solid_angle: self.correct_solid_angle,
            polarization_factor: self.polarization_factor,
        }
    }
}

/// Arguments of a multi-geometry integration, persisted as `mg_args`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiGeometryArgs {
    pub unit: RadialUnit,
    pub radial_range: [f64; 2],
    pub azimuth_range: [f64; 2],
    /// Radial bins of the 1D result.
    pub npt: usize,
    pub npt_rad: usize,
    pub npt_azim: usize,
}

impl Default for MultiGeometryArgs {
    fn default() -> Self {
        Self {
            unit: RadialUnit::TwoThetaDeg,
            radial_range: [0.0, 180.0],
            azimuth_range: [-180.0, 180.0],
            npt: 10_000,
            npt_rad: 1000,
            npt_azim: 1000,
        }
    }
}

/// Output of a 1D integration.
#[derive(Debug, Clone, PartialEq)]
pub struct Integrate1dResult {
    /// Bin centers in `unit`.
    pub radial: Array1<f64>,
    /// Summed (corrected) signal per bin.
    pub sum_signal: Array1<f64>,
    /// Summed normalization per bin (pixel count when uncorrected).
    pub count: Array1<f64>,
    /// `sum_signal / count`, zero for empty bins.
    pub intensity: Array1<f64>,
    /// Standard error per bin when the integrator propagates one.
    pub sigma: Option<Array1<f64>>,
    pub unit: RadialUnit,
}

/// Output of a 2D integration; arrays are `(azimuthal, radial)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Integrate2dResult {
    pub radial: Array1<f64>,
    /// Azimuthal bin centers, degrees.
    pub azimuthal: Array1<f64>,
    pub sum_signal: Array2<f64>,
    pub count: Array2<f64>,
    pub intensity: Array2<f64>,
    pub sigma: Option<Array2<f64>>,
    pub unit: RadialUnit,
}

/// Output of a grazing-incidence image transform.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformResult {
    /// Rebinned image, `(axis2, axis1)`.
    pub intensity: Array2<f64>,
    /// Horizontal axis: q for polar, qxy for reciprocal.
    pub axis1: Array1<f64>,
    /// Vertical axis: chi for polar, qz for reciprocal.
    pub axis2: Array1<f64>,
    /// Summed signal per bin, same layout as `intensity`.
    pub sum_signal: Array2<f64>,
    /// Summed normalization per bin.
    pub count: Array2<f64>,
}

impl TransformResult {
    /// Reinterprets a polar transform as a 2D integration result in q.
    #[must_use]
    pub fn into_polar_result(self) -> Integrate2dResult {
        Integrate2dResult {
            radial: self.axis1,
            azimuthal: self.axis2,
            sum_signal: self.sum_signal,
            count: self.count,
            intensity: self.intensity,
            sigma: None,
            unit: RadialUnit::QInvAngstrom,
        }
    }
}

/// Grazing-incidence transform output view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformProcess {
    /// `(|q|, chi)` rebinning.
    Polar,
    /// `(qxy, qz)` rebinning.
    Reciprocal,
}

/// Request for [`GrazingTransform::transform_image`].
#[derive(Debug, Clone, PartialEq)]
pub struct TransformRequest {
    pub process: TransformProcess,
    /// Bins along `(axis1, axis2)`.
    pub npt: (usize, usize),
    pub x_range: Option<[f64; 2]>,
    pub y_range: Option<[f64; 2]>,
    pub unit: RadialUnit,
}

/// Transmission-geometry azimuthal integrator.
pub trait AzimuthalIntegration {
    /// Integrates an image into a 1D pattern. Pixels where `mask` is true are
    /// excluded.
    ///
    /// # Errors
    /// Returns an error if the image and geometry shapes disagree.
    fn integrate1d(
        &self,
        image: ArrayView2<'_, f64>,
        mask: Option<&Array2<bool>>,
        args: &Integrate1dArgs,
    ) -> Result<Integrate1dResult>;

    /// Rebins an image onto an `(azimuthal, radial)` grid.
    ///
    /// # Errors
    /// Returns an error if the image and geometry shapes disagree.
    fn integrate2d(
        &self,
        image: ArrayView2<'_, f64>,
        mask: Option<&Array2<bool>>,
        args: &Integrate2dArgs,
    ) -> Result<Integrate2dResult>;
}

/// Grazing-incidence transform with mutable sample orientation.
pub trait GrazingTransform {
    /// Sets the incident angle, degrees.
    fn set_incident_angle(&mut self, degrees: f64);

    /// Sets the sample tilt about the beam, degrees.
    fn set_tilt_angle(&mut self, degrees: f64);

    /// Integrates to a 1D pattern in q; `p0_range` bounds |q| and `p1_range`
    /// bounds chi.
    ///
    /// # Errors
    /// Returns an error if the image and geometry shapes disagree.
    fn integrate_1d(
        &self,
        image: ArrayView2<'_, f64>,
        mask: Option<&Array2<bool>>,
        npt: usize,
        p0_range: Option<[f64; 2]>,
        p1_range: Option<[f64; 2]>,
    ) -> Result<Integrate1dResult>;

    /// Rebins an image into the polar or reciprocal view.
    ///
    /// # Errors
    /// Returns an error if the image and geometry shapes disagree.
    fn transform_image(
        &self,
        image: ArrayView2<'_, f64>,
        mask: Option<&Array2<bool>>,
        request: &TransformRequest,
    ) -> Result<TransformResult>;
}
