//! Radial units and Bragg conversions.

use crate::{Error, Result};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

/// Radial coordinate used when binning an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RadialUnit {
    /// Scattering angle 2θ in degrees.
    #[default]
    #[serde(rename = "2th_deg")]
    TwoThetaDeg,
    /// Momentum transfer in inverse angstrom.
    #[serde(rename = "q_A^-1")]
    QInvAngstrom,
}

impl RadialUnit {
    /// Canonical string form, as stored on disk.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TwoThetaDeg => "2th_deg",
            Self::QInvAngstrom => "q_A^-1",
        }
    }
}

impl fmt::Display for RadialUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RadialUnit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "2th_deg" => Ok(Self::TwoThetaDeg),
            "q_A^-1" => Ok(Self::QInvAngstrom),
            other => Err(Error::InvalidUnit(other.to_string())),
        }
    }
}

/// Converts a wavelength in meters to angstrom.
#[must_use]
pub fn wavelength_angstrom(wavelength_m: f64) -> f64 {
    wavelength_m * 1.0e10
}

/// q (Å⁻¹) from 2θ (degrees): `q = 4π/λ · sin(2θ/2)`.
#[must_use]
pub fn tth_to_q(tth_deg: f64, wavelength_m: f64) -> f64 {
    let lambda = wavelength_angstrom(wavelength_m);
    4.0 * PI / lambda * (tth_deg.to_radians() / 2.0).sin()
}

/// 2θ (degrees) from q (Å⁻¹). Values beyond the Ewald limit clamp to 180°.
#[must_use]
pub fn q_to_tth(q: f64, wavelength_m: f64) -> f64 {
    let lambda = wavelength_angstrom(wavelength_m);
    let s = (q * lambda / (4.0 * PI)).clamp(-1.0, 1.0);
    2.0 * s.asin().to_degrees()
}

/// Elementwise [`tth_to_q`].
#[must_use]
pub fn tth_axis_to_q(tth_deg: &Array1<f64>, wavelength_m: f64) -> Array1<f64> {
    tth_deg.mapv(|t| tth_to_q(t, wavelength_m))
}

/// Elementwise [`q_to_tth`].
#[must_use]
pub fn q_axis_to_tth(q: &Array1<f64>, wavelength_m: f64) -> Array1<f64> {
    q.mapv(|v| q_to_tth(v, wavelength_m))
}
