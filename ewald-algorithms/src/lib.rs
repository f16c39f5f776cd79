//! ewald-algorithms: azimuthal integration of area-detector images.
//!
//! This crate provides the integrators behind the reduction pipeline:
//! - **Geometry** - per-pixel scattering angles, solid angle and polarization
//! - **AzimuthalIntegrator** - 1D and 2D histogramming in 2θ or q
//! - **GrazingIntegrator** - polar and reciprocal (qxy, qz) transforms
//! - **MultiGeometry** - several detector positions onto one grid
//!
#![warn(missing_docs)]

mod geometry;
mod grazing;
mod histogram;
mod integrator;
mod multi;

pub use geometry::Geometry;
pub use grazing::GrazingIntegrator;
pub use integrator::AzimuthalIntegrator;
pub use multi::{Frame, MultiGeometry};

// Re-export the call contract
pub use ewald_core::{AzimuthalIntegration, GrazingTransform};
