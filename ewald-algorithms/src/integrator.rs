//! Transmission-geometry azimuthal integrator.

use crate::geometry::Geometry;
use crate::histogram::{histogram, Bins, PixelInputs};
use ewald_core::{
    AzimuthalIntegration, Error, Integrate1dArgs, Integrate1dResult, Integrate2dArgs,
    Integrate2dResult, Poni, RadialUnit, Result,
};
use ndarray::{Array2, ArrayView2, Axis};

/// Integrator with the per-pixel maps of one calibration precomputed.
#[derive(Debug, Clone)]
pub struct AzimuthalIntegrator {
    poni: Poni,
    geometry: Geometry,
    /// 2θ in degrees.
    tth: Array2<f64>,
    /// χ in degrees.
    chi: Array2<f64>,
    solid_angle: Array2<f64>,
}

impl AzimuthalIntegrator {
    /// Precomputes the pixel maps of `poni`.
    ///
    /// # Errors
    /// Returns an error if the calibration is invalid.
    pub fn new(poni: &Poni) -> Result<Self> {
        let geometry = Geometry::from_poni(poni)?;
        let (tth, chi) = geometry.polar_maps();
        let solid_angle = geometry.solid_angle();
        Ok(Self {
            poni: poni.clone(),
            tth: tth.mapv(f64::to_degrees),
            chi: chi.mapv(f64::to_degrees),
            solid_angle,
            geometry,
        })
    }

    /// Calibration the integrator was built from.
    #[must_use]
    pub fn poni(&self) -> &Poni {
        &self.poni
    }

    /// Detector geometry.
    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Radial coordinate of every pixel in `unit`.
    #[must_use]
    pub fn radial_map(&self, unit: RadialUnit) -> Array2<f64> {
        match unit {
            RadialUnit::TwoThetaDeg => self.tth.clone(),
            RadialUnit::QInvAngstrom => {
                let wavelength = self.poni.wavelength;
                self.tth
                    .mapv(|t| ewald_core::units::tth_to_q(t, wavelength))
            }
        }
    }

    /// Azimuth of every pixel, degrees in `(-180, 180]`.
    #[must_use]
    pub fn chi_map(&self) -> &Array2<f64> {
        &self.chi
    }

    /// Normalization factor of every pixel.
    #[must_use]
    pub fn weights(&self, correct_solid_angle: bool, polarization_factor: Option<f64>) -> Array2<f64> {
        let mut weight = if correct_solid_angle {
            self.solid_angle.clone()
        } else {
            Array2::ones(self.geometry.shape())
        };
        if let Some(factor) = polarization_factor {
            weight *= &self.geometry.polarization(factor);
        }
        weight
    }

    pub(crate) fn check_image(&self, image: &ArrayView2<'_, f64>, mask: Option<&Array2<bool>>) -> Result<()> {
        let shape = self.geometry.shape();
        if image.dim() != shape {
            return Err(Error::Integration(format!(
                "image is {:?}, detector is {shape:?}",
                image.dim()
            )));
        }
        if let Some(mask) = mask {
            if mask.dim() != shape {
                return Err(Error::Integration(format!(
                    "mask is {:?}, detector is {shape:?}",
                    mask.dim()
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn bins_for(
        inputs: &PixelInputs<'_>,
        npt: usize,
        range: Option<[f64; 2]>,
        azimuth: &Bins,
    ) -> Result<Bins> {
        if npt == 0 {
            return Err(Error::Integration(
                "number of radial points must be positive".to_string(),
            ));
        }
        let range = match range {
            Some(range) => range,
            // Nothing valid to bin: any range gives an all-zero result.
            None => inputs.radial_extent(azimuth).unwrap_or([0.0, 1.0]),
        };
        Ok(Bins::new(range, npt))
    }
}

fn azimuth_bins(range: Option<[f64; 2]>, n: usize) -> Bins {
    match (range, n) {
        (None, 1) => Bins::unbounded(),
        (None, n) => Bins::new([-180.0, 180.0], n),
        (Some(range), n) => Bins::new(range, n),
    }
}

impl AzimuthalIntegration for AzimuthalIntegrator {
    fn integrate1d(
        &self,
        image: ArrayView2<'_, f64>,
        mask: Option<&Array2<bool>>,
        args: &Integrate1dArgs,
    ) -> Result<Integrate1dResult> {
        self.check_image(&image, mask)?;
        let radial = self.radial_map(args.unit);
        let weight = self.weights(args.correct_solid_angle, args.polarization_factor);
        let inputs = PixelInputs {
            image: image.view(),
            mask,
            radial: radial.view(),
            azimuth: self.chi.view(),
            weight: weight.view(),
        };
        let azimuth = azimuth_bins(args.azimuth_range, 1);
        let bins = Self::bins_for(&inputs, args.numpoints, args.radial_range, &azimuth)?;
        let hist = histogram(&inputs, &bins, &azimuth);
        let intensity = hist.intensity();
        log::debug!(
            "integrate1d: {} bins over {:?} {}",
            args.numpoints,
            args.radial_range,
            args.unit
        );
        Ok(Integrate1dResult {
            radial: bins.centers(),
            sum_signal: hist.sum.index_axis(Axis(0), 0).to_owned(),
            count: hist.count.index_axis(Axis(0), 0).to_owned(),
            intensity: intensity.index_axis(Axis(0), 0).to_owned(),
            sigma: None,
            unit: args.unit,
        })
    }

    fn integrate2d(
        &self,
        image: ArrayView2<'_, f64>,
        mask: Option<&Array2<bool>>,
        args: &Integrate2dArgs,
    ) -> Result<Integrate2dResult> {
        self.check_image(&image, mask)?;
        if args.npt_azim == 0 {
            return Err(Error::Integration(
                "number of azimuthal points must be positive".to_string(),
            ));
        }
        let radial = self.radial_map(args.unit);
        let weight = self.weights(args.correct_solid_angle, args.polarization_factor);
        let inputs = PixelInputs {
            image: image.view(),
            mask,
            radial: radial.view(),
            azimuth: self.chi.view(),
            weight: weight.view(),
        };
        let azimuth = Bins::new(args.azimuth_range.unwrap_or([-180.0, 180.0]), args.npt_azim);
        let bins = Self::bins_for(&inputs, args.npt_rad, args.radial_range, &azimuth)?;
        let hist = histogram(&inputs, &bins, &azimuth);
        Ok(Integrate2dResult {
            radial: bins.centers(),
            azimuthal: azimuth.centers(),
            intensity: hist.intensity(),
            sum_signal: hist.sum,
            count: hist.count,
            sigma: None,
            unit: args.unit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ewald_core::Detector;

    fn integrator() -> AzimuthalIntegrator {
        let poni = Poni {
            dist: 0.2,
            poni1: 0.0,
            poni2: 0.0,
            rot1: 0.0,
            rot2: 0.0,
            rot3: 0.0,
            wavelength: 1e-10,
            detector: Detector::new("test", 1e-4, 1e-4, (64, 64)),
        };
        AzimuthalIntegrator::new(&poni).unwrap()
    }

    #[test]
    fn test_uniform_image_without_corrections() {
        let ai = integrator();
        let image = Array2::from_elem((64, 64), 3.0);
        let args = Integrate1dArgs::default()
            .with_numpoints(20)
            .with_solid_angle(false);
        let result = ai.integrate1d(image.view(), None, &args).unwrap();
        assert_eq!(result.radial.len(), 20);
        for (&i, &c) in result.intensity.iter().zip(result.count.iter()) {
            if c > 0.0 {
                assert_relative_eq!(i, 3.0, epsilon = 1e-12);
            }
        }
        let total: f64 = result.count.sum();
        assert_relative_eq!(total, 64.0 * 64.0);
    }

    #[test]
    fn test_solid_angle_flattens_projected_signal() {
        let ai = integrator();
        // An isotropic scatterer seen through a flat detector.
        let image = ai.weights(true, None).mapv(|w| 100.0 * w);
        let args = Integrate1dArgs::default().with_numpoints(30);
        let result = ai.integrate1d(image.view(), None, &args).unwrap();
        for (&i, &c) in result.intensity.iter().zip(result.count.iter()) {
            if c > 0.0 {
                assert_relative_eq!(i, 100.0, max_relative = 1e-9);
            }
        }
    }

    #[test]
    fn test_mask_and_radial_range() {
        let ai = integrator();
        let image = Array2::ones((64, 64));
        let mask = Array2::from_shape_fn((64, 64), |(r, _)| r < 32);
        let args = Integrate1dArgs::default()
            .with_numpoints(10)
            .with_radial_range(Some([0.0, 1.0]))
            .with_solid_angle(false);
        let result = ai.integrate1d(image.view(), Some(&mask), &args).unwrap();
        assert_relative_eq!(result.radial[0], 0.05);
        assert!(result.count.sum() <= 32.0 * 64.0);
        assert!(result.count.sum() > 0.0);
    }

    #[test]
    fn test_q_unit() {
        let ai = integrator();
        let image = Array2::ones((64, 64));
        let args = Integrate1dArgs::default()
            .with_numpoints(16)
            .with_unit(RadialUnit::QInvAngstrom);
        let result = ai.integrate1d(image.view(), None, &args).unwrap();
        assert_eq!(result.unit, RadialUnit::QInvAngstrom);
        let q_max = ai
            .radial_map(RadialUnit::QInvAngstrom)
            .iter()
            .copied()
            .fold(0.0, f64::max);
        assert!(result.radial[15] < q_max);
    }

    #[test]
    fn test_integrate2d_shape() {
        let ai = integrator();
        let image = Array2::ones((64, 64));
        let args = Integrate2dArgs::default().with_bins(12, 8);
        let result = ai.integrate2d(image.view(), None, &args).unwrap();
        assert_eq!(result.intensity.dim(), (8, 12));
        assert_eq!(result.azimuthal.len(), 8);
        // The detector sits in one quadrant: chi in [0, 90].
        let filled: Vec<usize> = (0..8)
            .filter(|&i| result.count.row(i).sum() > 0.0)
            .collect();
        assert!(filled.iter().all(|&i| i == 4 || i == 5));
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let ai = integrator();
        let image = Array2::ones((10, 10));
        let err = ai
            .integrate1d(image.view(), None, &Integrate1dArgs::default())
            .unwrap_err();
        assert!(matches!(err, Error::Integration(_)));
    }
}
