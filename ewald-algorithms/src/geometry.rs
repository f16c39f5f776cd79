//! Detector geometry: pixel positions in the laboratory frame.
//!
//! The laboratory frame has axis 1 vertical, axis 2 horizontal and axis 3
//! along the beam. A pixel at `(row, col)` sits at `p1 = (row + ½)·pixel1 - poni1`,
//! `p2 = (col + ½)·pixel2 - poni2` on the detector plane, a distance `dist`
//! from the sample. The detector is then rotated by `rot1` about axis 1,
//! `rot2` about axis 2 and `rot3` about the beam.
#![allow(clippy::cast_precision_loss)]

use ewald_core::{Error, Poni, Result};
use ndarray::Array2;
use rayon::prelude::*;

/// Calibrated detector geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct Geometry {
    dist: f64,
    poni1: f64,
    poni2: f64,
    pixel1: f64,
    pixel2: f64,
    wavelength: f64,
    shape: (usize, usize),
    // cos/sin of rot1, rot2, rot3
    c: [f64; 3],
    s: [f64; 3],
}

impl Geometry {
    /// Builds the geometry of a validated calibration.
    ///
    /// # Errors
    /// Returns an error if the calibration is invalid or the detector shape is
    /// empty.
    pub fn from_poni(poni: &Poni) -> Result<Self> {
        poni.validate()?;
        let shape = poni.detector.max_shape;
        if shape.0 == 0 || shape.1 == 0 {
            return Err(Error::InvalidPoni(format!(
                "detector shape {shape:?} is empty"
            )));
        }
        let rots = [poni.rot1, poni.rot2, poni.rot3];
        Ok(Self {
            dist: poni.dist,
            poni1: poni.poni1,
            poni2: poni.poni2,
            pixel1: poni.detector.pixel1,
            pixel2: poni.detector.pixel2,
            wavelength: poni.wavelength,
            shape,
            c: rots.map(f64::cos),
            s: rots.map(f64::sin),
        })
    }

    /// Detector shape `(rows, cols)`.
    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    /// Wavelength in meters.
    #[must_use]
    pub fn wavelength(&self) -> f64 {
        self.wavelength
    }

    /// Sample → pixel-center vector `(t1, t2, t3)` in meters.
    #[must_use]
    pub fn lab_vector(&self, row: usize, col: usize) -> [f64; 3] {
        let p1 = (row as f64 + 0.5) * self.pixel1 - self.poni1;
        let p2 = (col as f64 + 0.5) * self.pixel2 - self.poni2;
        let l = self.dist;
        let [c1, c2, c3] = self.c;
        let [s1, s2, s3] = self.s;
        let t1 = p1 * c2 * c3 + p2 * (c3 * s1 * s2 - c1 * s3) - l * (c1 * c3 * s2 + s1 * s3);
        let t2 = p1 * c2 * s3 + p2 * (c1 * c3 + s1 * s2 * s3) - l * (-c3 * s1 + c1 * s2 * s3);
        let t3 = p1 * s2 - p2 * c2 * s1 + l * c1 * c2;
        [t1, t2, t3]
    }

    /// Scattering angle 2θ (radians) and azimuth χ (radians) of every pixel.
    #[must_use]
    pub fn polar_maps(&self) -> (Array2<f64>, Array2<f64>) {
        let (tth, chi): (Vec<f64>, Vec<f64>) = self
            .per_pixel(|[t1, t2, t3]| ((t1 * t1 + t2 * t2).sqrt().atan2(t3), t1.atan2(t2)))
            .into_iter()
            .unzip();
        (self.to_image(tth), self.to_image(chi))
    }

    /// Solid angle of every pixel relative to a pixel at normal incidence.
    #[must_use]
    pub fn solid_angle(&self) -> Array2<f64> {
        let dist = self.dist;
        let values = self.per_pixel(|[t1, t2, t3]| {
            let r = (t1 * t1 + t2 * t2 + t3 * t3).sqrt();
            (dist / r).powi(3)
        });
        self.to_image(values)
    }

    /// Polarization factor of every pixel for a beam with the given
    /// polarization (`0` unpolarized, `1` fully horizontal).
    #[must_use]
    pub fn polarization(&self, factor: f64) -> Array2<f64> {
        let values = self.per_pixel(|[t1, t2, t3]| {
            let tth = (t1 * t1 + t2 * t2).sqrt().atan2(t3);
            let chi = t1.atan2(t2);
            let cos2 = tth.cos().powi(2);
            0.5 * (1.0 + cos2 - factor * (2.0 * chi).cos() * (1.0 - cos2))
        });
        self.to_image(values)
    }

    /// Evaluates `f` on every lab vector in parallel, row-major.
    pub(crate) fn per_pixel<T, F>(&self, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn([f64; 3]) -> T + Sync,
    {
        let (rows, cols) = self.shape;
        (0..rows * cols)
            .into_par_iter()
            .map(|k| f(self.lab_vector(k / cols, k % cols)))
            .collect()
    }

    fn to_image(&self, values: Vec<f64>) -> Array2<f64> {
        // per_pixel yields exactly rows * cols values.
        Array2::from_shape_vec(self.shape, values).unwrap_or_else(|_| Array2::zeros(self.shape))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ewald_core::Detector;

    fn poni(rot1: f64, rot2: f64, rot3: f64) -> Poni {
        Poni {
            dist: 0.1,
            poni1: 0.00495,
            poni2: 0.00495,
            rot1,
            rot2,
            rot3,
            wavelength: 1e-10,
            detector: Detector::new("test", 1e-4, 1e-4, (100, 100)),
        }
    }

    #[test]
    fn test_untilted_detector() {
        let geo = Geometry::from_poni(&poni(0.0, 0.0, 0.0)).unwrap();
        let [t1, t2, t3] = geo.lab_vector(49, 49);
        assert_abs_diff_eq!(t1, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(t2, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(t3, 0.1, epsilon = 1e-12);

        let (tth, _) = geo.polar_maps();
        let [t1, t2, t3] = geo.lab_vector(0, 99);
        assert_abs_diff_eq!(
            tth[[0, 99]],
            ((t1 * t1 + t2 * t2).sqrt() / t3).atan(),
            epsilon = 1e-12
        );
        let sa = geo.solid_angle();
        assert!(sa[[49, 49]] > sa[[0, 0]]);
        assert!(sa.iter().all(|&v| v > 0.0 && v <= 1.0 + 1e-12));
    }

    #[test]
    fn test_rotation_preserves_distance() {
        let flat = Geometry::from_poni(&poni(0.0, 0.0, 0.0)).unwrap();
        let tilted = Geometry::from_poni(&poni(0.1, -0.2, 0.3)).unwrap();
        for (r, c) in [(0, 0), (10, 80), (99, 99)] {
            let a = flat.lab_vector(r, c);
            let b = tilted.lab_vector(r, c);
            let na: f64 = a.iter().map(|v| v * v).sum();
            let nb: f64 = b.iter().map(|v| v * v).sum();
            assert_abs_diff_eq!(na, nb, epsilon = 1e-15);
        }
    }

    #[test]
    fn test_rot2_shifts_beam_center() {
        // Tilting by rot2 moves the direct beam off the PONI pixel.
        let geo = Geometry::from_poni(&poni(0.0, 0.05, 0.0)).unwrap();
        let (tth, _) = geo.polar_maps();
        assert!(tth[[49, 49]] > 0.04);
    }

    #[test]
    fn test_chi_quadrants() {
        let geo = Geometry::from_poni(&poni(0.0, 0.0, 0.0)).unwrap();
        let (_, chi) = geo.polar_maps();
        // Along +axis 2 (columns) chi is 0; along +axis 1 (rows) it is +90°.
        assert_abs_diff_eq!(chi[[49, 99]].to_degrees(), 0.0, epsilon = 1.0);
        assert_abs_diff_eq!(chi[[99, 49]].to_degrees(), 90.0, epsilon = 1.0);
    }

    #[test]
    fn test_polarization_unpolarized() {
        let geo = Geometry::from_poni(&poni(0.0, 0.0, 0.0)).unwrap();
        let pol = geo.polarization(0.0);
        let (tth, _) = geo.polar_maps();
        let expected = 0.5 * (1.0 + tth[[0, 0]].cos().powi(2));
        assert_abs_diff_eq!(pol[[0, 0]], expected, epsilon = 1e-12);
    }

    #[test]
    fn test_rejects_invalid_poni() {
        let mut bad = poni(0.0, 0.0, 0.0);
        bad.wavelength = -1.0;
        assert!(Geometry::from_poni(&bad).is_err());
    }
}
