//! Grazing-incidence transform.
//!
//! The sample surface normal is tilted out of the vertical by the incident
//! angle `αi` (towards the beam) and rotated about the beam by the tilt angle
//! `τ`. Each pixel's scattering vector `q = k_f - k_i` is split into the
//! out-of-plane component `qz = q·n` and the signed in-plane magnitude
//! `qxy = sign(q·y_s)·|q - qz·n|`.
#![allow(clippy::cast_precision_loss)]

use crate::geometry::Geometry;
use crate::histogram::{histogram, Bins, PixelInputs};
use ewald_core::units::{tth_to_q, wavelength_angstrom};
use ewald_core::{
    Error, GrazingTransform, Integrate1dResult, Poni, RadialUnit, Result, TransformProcess,
    TransformRequest, TransformResult,
};
use ndarray::{Array2, ArrayView2, Axis};
use std::f64::consts::PI;

/// Per-pixel reciprocal-space coordinates.
struct QMaps {
    qxy: Array2<f64>,
    qz: Array2<f64>,
    /// |q|, Å⁻¹.
    q: Array2<f64>,
    /// Angle from the surface normal, degrees.
    chi: Array2<f64>,
}

/// Grazing-incidence integrator for one calibration.
#[derive(Debug, Clone)]
pub struct GrazingIntegrator {
    poni: Poni,
    geometry: Geometry,
    solid_angle: Array2<f64>,
    incident_angle: f64,
    tilt_angle: f64,
    sample_orientation: u8,
}

impl GrazingIntegrator {
    /// Builds the transform with zero incident and tilt angles.
    ///
    /// # Errors
    /// Returns an error if the calibration is invalid.
    pub fn new(poni: &Poni) -> Result<Self> {
        let geometry = Geometry::from_poni(poni)?;
        let solid_angle = geometry.solid_angle();
        Ok(Self {
            poni: poni.clone(),
            geometry,
            solid_angle,
            incident_angle: 0.0,
            tilt_angle: 0.0,
            sample_orientation: 1,
        })
    }

    /// Sets the sample orientation (1–4): each step rotates the surface
    /// normal a further 90° about the beam.
    #[must_use]
    pub fn with_sample_orientation(mut self, orientation: u8) -> Self {
        self.sample_orientation = orientation.clamp(1, 4);
        self
    }

    /// Incident angle, degrees.
    #[must_use]
    pub fn incident_angle(&self) -> f64 {
        self.incident_angle
    }

    /// Tilt angle, degrees.
    #[must_use]
    pub fn tilt_angle(&self) -> f64 {
        self.tilt_angle
    }

    /// Sample orientation (1–4).
    #[must_use]
    pub fn sample_orientation(&self) -> u8 {
        self.sample_orientation
    }

    /// Calibration the transform was built from.
    #[must_use]
    pub fn poni(&self) -> &Poni {
        &self.poni
    }

    fn q_maps(&self) -> QMaps {
        let k = 2.0 * PI / wavelength_angstrom(self.geometry.wavelength());
        let alpha = self.incident_angle.to_radians();
        let tau = (self.tilt_angle + f64::from(self.sample_orientation - 1) * 90.0).to_radians();
        // Components are (vertical, horizontal, beam).
        let n = [
            alpha.cos() * tau.cos(),
            alpha.cos() * tau.sin(),
            -alpha.sin(),
        ];
        let x_s = normalize(add(
            [0.0, 0.0, 1.0],
            scale(n, alpha.sin()),
        ));
        let y_s = cross(n, x_s);

        let values = self.geometry.per_pixel(|t| {
            let u = normalize(t);
            let q = [k * u[0], k * u[1], k * u[2] - k];
            let qz = dot(q, n);
            let qx = dot(q, x_s);
            let qy = dot(q, y_s);
            let qxy = (qx * qx + qy * qy).sqrt().copysign(if qy < 0.0 { -1.0 } else { 1.0 });
            (qxy, qz)
        });
        let shape = self.geometry.shape();
        let mut qxy = Array2::zeros(shape);
        let mut qz = Array2::zeros(shape);
        for ((a, b), (x, z)) in qxy.iter_mut().zip(qz.iter_mut()).zip(values) {
            *a = x;
            *b = z;
        }
        let q = ndarray::Zip::from(&qxy)
            .and(&qz)
            .map_collect(|&x: &f64, &z: &f64| x.hypot(z));
        let chi = ndarray::Zip::from(&qxy)
            .and(&qz)
            .map_collect(|&x: &f64, &z: &f64| x.atan2(z).to_degrees());
        QMaps { qxy, qz, q, chi }
    }

    fn check_image(&self, image: &ArrayView2<'_, f64>, mask: Option<&Array2<bool>>) -> Result<()> {
        let shape = self.geometry.shape();
        if image.dim() != shape || mask.is_some_and(|m| m.dim() != shape) {
            return Err(Error::Integration(format!(
                "image is {:?}, detector is {shape:?}",
                image.dim()
            )));
        }
        Ok(())
    }
}

impl GrazingTransform for GrazingIntegrator {
    fn set_incident_angle(&mut self, degrees: f64) {
        self.incident_angle = degrees;
    }

    fn set_tilt_angle(&mut self, degrees: f64) {
        self.tilt_angle = degrees;
    }

    fn integrate_1d(
        &self,
        image: ArrayView2<'_, f64>,
        mask: Option<&Array2<bool>>,
        npt: usize,
        p0_range: Option<[f64; 2]>,
        p1_range: Option<[f64; 2]>,
    ) -> Result<Integrate1dResult> {
        self.check_image(&image, mask)?;
        if npt == 0 {
            return Err(Error::Integration(
                "number of radial points must be positive".to_string(),
            ));
        }
        let maps = self.q_maps();
        let inputs = PixelInputs {
            image: image.view(),
            mask,
            radial: maps.q.view(),
            azimuth: maps.chi.view(),
            weight: self.solid_angle.view(),
        };
        let azimuth = p1_range.map_or_else(Bins::unbounded, |r| Bins::new(r, 1));
        let range = p0_range
            .or_else(|| inputs.radial_extent(&azimuth))
            .unwrap_or([0.0, 1.0]);
        let bins = Bins::new(range, npt);
        let hist = histogram(&inputs, &bins, &azimuth);
        let intensity = hist.intensity();
        Ok(Integrate1dResult {
            radial: bins.centers(),
            sum_signal: hist.sum.index_axis(Axis(0), 0).to_owned(),
            count: hist.count.index_axis(Axis(0), 0).to_owned(),
            intensity: intensity.index_axis(Axis(0), 0).to_owned(),
            sigma: None,
            unit: RadialUnit::QInvAngstrom,
        })
    }

    fn transform_image(
        &self,
        image: ArrayView2<'_, f64>,
        mask: Option<&Array2<bool>>,
        request: &TransformRequest,
    ) -> Result<TransformResult> {
        self.check_image(&image, mask)?;
        let (n1, n2) = request.npt;
        if n1 == 0 || n2 == 0 {
            return Err(Error::Integration(format!(
                "transform bins must be positive, got {:?}",
                request.npt
            )));
        }
        let maps = self.q_maps();
        let (axis1, axis2) = match request.process {
            TransformProcess::Polar => (&maps.q, &maps.chi),
            TransformProcess::Reciprocal => (&maps.qxy, &maps.qz),
        };
        let x_range = match (request.process, request.unit, request.x_range) {
            (TransformProcess::Polar, RadialUnit::TwoThetaDeg, Some([a, b])) => {
                let wavelength = self.geometry.wavelength();
                Some([tth_to_q(a, wavelength), tth_to_q(b, wavelength)])
            }
            (_, _, range) => range,
        };

        let extent = |along: &Array2<f64>, other: &Array2<f64>| {
            PixelInputs {
                image: image.view(),
                mask,
                radial: along.view(),
                azimuth: other.view(),
                weight: self.solid_angle.view(),
            }
            .radial_extent(&Bins::unbounded())
            .unwrap_or([0.0, 1.0])
        };
        let bins1 = Bins::new(x_range.unwrap_or_else(|| extent(axis1, axis2)), n1);
        let bins2 = match (request.process, request.y_range) {
            (_, Some(range)) => Bins::new(range, n2),
            (TransformProcess::Polar, None) => Bins::new([-180.0, 180.0], n2),
            (TransformProcess::Reciprocal, None) => Bins::new(extent(axis2, axis1), n2),
        };

        let inputs = PixelInputs {
            image: image.view(),
            mask,
            radial: axis1.view(),
            azimuth: axis2.view(),
            weight: self.solid_angle.view(),
        };
        let hist = histogram(&inputs, &bins1, &bins2);
        let mut intensity = hist.intensity();
        let mut sum_signal = hist.sum;
        let mut count = hist.count;
        let mut axis2_centers = bins2.centers();
        if request.process == TransformProcess::Reciprocal {
            // Raster order: highest qz in the first row.
            for array in [&mut intensity, &mut sum_signal, &mut count] {
                array.invert_axis(Axis(0));
            }
            axis2_centers.invert_axis(Axis(0));
        }
        Ok(TransformResult {
            intensity: intensity.as_standard_layout().to_owned(),
            axis1: bins1.centers(),
            axis2: axis2_centers.as_standard_layout().to_owned(),
            sum_signal: sum_signal.as_standard_layout().to_owned(),
            count: count.as_standard_layout().to_owned(),
        })
    }
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn add(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

fn scale(a: [f64; 3], s: f64) -> [f64; 3] {
    [a[0] * s, a[1] * s, a[2] * s]
}

fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn normalize(a: [f64; 3]) -> [f64; 3] {
    let norm = dot(a, a).sqrt();
    if norm == 0.0 {
        a
    } else {
        scale(a, 1.0 / norm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ewald_core::Detector;

    fn grazing() -> GrazingIntegrator {
        let poni = Poni {
            dist: 0.2,
            poni1: 3.2e-3,
            poni2: 3.2e-3,
            rot1: 0.0,
            rot2: 0.0,
            rot3: 0.0,
            wavelength: 1e-10,
            detector: Detector::new("test", 1e-4, 1e-4, (64, 64)),
        };
        GrazingIntegrator::new(&poni).unwrap()
    }

    #[test]
    fn test_q_magnitude_matches_bragg() {
        let mut gi = grazing();
        gi.set_incident_angle(0.2);
        gi.set_tilt_angle(1.0);
        let maps = gi.q_maps();
        let geo = &gi.geometry;
        let (tth, _) = geo.polar_maps();
        for (r, c) in [(0, 0), (10, 50), (63, 63)] {
            let expected = tth_to_q(tth[[r, c]].to_degrees(), 1e-10);
            assert_abs_diff_eq!(maps.q[[r, c]], expected, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_qz_sign_follows_vertical_axis() {
        let gi = grazing();
        let maps = gi.q_maps();
        // Rows below the PONI scatter towards +axis 1, which is the surface
        // normal at zero incidence.
        assert!(maps.qz[[63, 32]] > 0.0);
        assert!(maps.qz[[0, 32]] < 0.0);
        assert!(maps.qxy[[32, 63]].abs() > maps.qxy[[32, 40]].abs());
    }

    #[test]
    fn test_reciprocal_raster_order() {
        let gi = grazing();
        let image = Array2::ones((64, 64));
        let request = TransformRequest {
            process: TransformProcess::Reciprocal,
            npt: (16, 12),
            x_range: None,
            y_range: None,
            unit: RadialUnit::QInvAngstrom,
        };
        let result = gi.transform_image(image.view(), None, &request).unwrap();
        assert_eq!(result.intensity.dim(), (12, 16));
        assert!(result.axis2[0] > result.axis2[11]);
        assert_eq!(result.axis1.len(), 16);
    }

    #[test]
    fn test_polar_and_1d() {
        let gi = grazing();
        let image = Array2::from_elem((64, 64), 2.0);
        let request = TransformRequest {
            process: TransformProcess::Polar,
            npt: (20, 36),
            x_range: None,
            y_range: None,
            unit: RadialUnit::QInvAngstrom,
        };
        let polar = gi.transform_image(image.view(), None, &request).unwrap();
        assert_eq!(polar.intensity.dim(), (36, 20));
        assert_abs_diff_eq!(polar.axis2[0], -175.0, epsilon = 1e-9);
        for (&i, &c) in polar.intensity.iter().zip(polar.count.iter()) {
            if c > 0.0 {
                assert!(i > 2.0 - 1e-9);
            }
        }

        let result = gi.integrate_1d(image.view(), None, 25, None, None).unwrap();
        assert_eq!(result.unit, RadialUnit::QInvAngstrom);
        assert_eq!(result.radial.len(), 25);
        assert!(result.count.sum() > 0.0);
    }

    #[test]
    fn test_orientation_clamped() {
        let gi = grazing().with_sample_orientation(7);
        assert_eq!(gi.sample_orientation(), 4);
    }
}
