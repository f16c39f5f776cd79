//! Multi-geometry integration: several detector positions onto one grid.

use crate::histogram::{histogram, Bins, Histogram, PixelInputs};
use crate::integrator::AzimuthalIntegrator;
use ewald_core::{
    Error, Integrate1dResult, Integrate2dResult, MultiGeometryArgs, Poni, Result,
};
use ndarray::{Array2, ArrayView2, Axis};

/// One frame: image plus optional mask.
pub type Frame<'a> = (ArrayView2<'a, f64>, Option<&'a Array2<bool>>);

/// Integrates frames taken at different calibrations onto a common grid.
///
/// Only the calibrations are held; each frame's pixel maps are built when it
/// is integrated.
#[derive(Debug, Clone)]
pub struct MultiGeometry {
    ponis: Vec<Poni>,
    args: MultiGeometryArgs,
}

impl MultiGeometry {
    /// Creates the integrator for the given calibrations.
    #[must_use]
    pub fn new(ponis: Vec<Poni>, args: MultiGeometryArgs) -> Self {
        Self { ponis, args }
    }

    /// Calibrations, one per frame.
    #[must_use]
    pub fn ponis(&self) -> &[Poni] {
        &self.ponis
    }

    /// Grid settings.
    #[must_use]
    pub fn args(&self) -> &MultiGeometryArgs {
        &self.args
    }

    /// Number of geometries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ponis.len()
    }

    /// True when no geometry is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ponis.is_empty()
    }

    /// Sums every frame into one 1D pattern over `args.radial_range`.
    ///
    /// # Errors
    /// Returns an error if the number of frames differs from the number of
    /// calibrations or any frame does not fit its detector.
    pub fn integrate1d(&self, frames: &[Frame<'_>]) -> Result<Integrate1dResult> {
        let radial = Bins::new(self.args.radial_range, self.args.npt);
        let azimuth = Bins::new(self.args.azimuth_range, 1);
        let hist = self.accumulate(frames, &radial, &azimuth)?;
        let intensity = hist.intensity();
        Ok(Integrate1dResult {
            radial: radial.centers(),
            sum_signal: hist.sum.index_axis(Axis(0), 0).to_owned(),
            count: hist.count.index_axis(Axis(0), 0).to_owned(),
            intensity: intensity.index_axis(Axis(0), 0).to_owned(),
            sigma: None,
            unit: self.args.unit,
        })
    }

    /// Sums every frame into one `(azimuthal, radial)` image.
    ///
    /// # Errors
    /// See [`integrate1d`](Self::integrate1d).
    pub fn integrate2d(&self, frames: &[Frame<'_>]) -> Result<Integrate2dResult> {
        let radial = Bins::new(self.args.radial_range, self.args.npt_rad);
        let azimuth = Bins::new(self.args.azimuth_range, self.args.npt_azim);
        let hist = self.accumulate(frames, &radial, &azimuth)?;
        Ok(Integrate2dResult {
            radial: radial.centers(),
            azimuthal: azimuth.centers(),
            intensity: hist.intensity(),
            sum_signal: hist.sum,
            count: hist.count,
            sigma: None,
            unit: self.args.unit,
        })
    }

    fn accumulate(&self, frames: &[Frame<'_>], radial: &Bins, azimuth: &Bins) -> Result<Histogram> {
        if frames.len() != self.ponis.len() {
            return Err(Error::Integration(format!(
                "{} frames for {} geometries",
                frames.len(),
                self.ponis.len()
            )));
        }
        if radial.len() == 0 || azimuth.len() == 0 {
            return Err(Error::Integration("bin counts must be positive".to_string()));
        }
        let mut total = Histogram::zeros((azimuth.len(), radial.len()));
        for (poni, (image, mask)) in self.ponis.iter().zip(frames) {
            let ai = AzimuthalIntegrator::new(poni)?;
            ai.check_image(image, *mask)?;
            let radial_map = ai.radial_map(self.args.unit);
            let weight = ai.weights(true, None);
            let inputs = PixelInputs {
                image: image.view(),
                mask: *mask,
                radial: radial_map.view(),
                azimuth: ai.chi_map().view(),
                weight: weight.view(),
            };
            total += &histogram(&inputs, radial, azimuth);
        }
        log::debug!("multi-geometry accumulated {} frames", frames.len());
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ewald_core::{Detector, RadialUnit};

    fn poni(rot2: f64) -> Poni {
        Poni {
            dist: 0.2,
            poni1: 3.2e-3,
            poni2: 3.2e-3,
            rot1: 0.0,
            rot2,
            rot3: 0.0,
            wavelength: 1e-10,
            detector: Detector::new("test", 1e-4, 1e-4, (64, 64)),
        }
    }

    #[test]
    fn test_union_of_ranges() {
        let mg = MultiGeometry::new(
            vec![poni(0.0), poni(-5f64.to_radians())],
            MultiGeometryArgs {
                unit: RadialUnit::TwoThetaDeg,
                radial_range: [0.0, 10.0],
                azimuth_range: [-180.0, 180.0],
                npt: 100,
                npt_rad: 50,
                npt_azim: 36,
            },
        );
        let a = Array2::from_elem((64, 64), 1.0);
        let b = Array2::from_elem((64, 64), 1.0);
        let result = mg
            .integrate1d(&[(a.view(), None), (b.view(), None)])
            .unwrap();
        // Both the direct-beam region and the 5° region are covered.
        assert!(result.count[2] > 0.0);
        assert!(result.count[50] > 0.0);
        for (&i, &c) in result.intensity.iter().zip(result.count.iter()) {
            if c > 0.0 {
                assert!(i >= 1.0 - 1e-12);
            }
        }

        let result2d = mg
            .integrate2d(&[(a.view(), None), (b.view(), None)])
            .unwrap();
        assert_eq!(result2d.intensity.dim(), (36, 50));
        assert_relative_eq!(result2d.radial[0], 0.1);
    }

    #[test]
    fn test_frame_count_checked() {
        let mg = MultiGeometry::new(vec![poni(0.0)], MultiGeometryArgs::default());
        assert!(mg.integrate1d(&[]).is_err());
        assert_eq!(mg.len(), 1);
    }
}
