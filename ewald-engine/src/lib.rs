//! ewald-engine: scan-level reduction of 2D diffraction images.
//!
//! # Key Components
//!
//! - [`EwaldArch`] - One detector frame with its calibration, metadata and
//!   per-frame integration results
//! - [`ArchSeries`] - Disk-backed ordered collection of arches
//! - [`EwaldSphere`] - A scan: arches plus scan table, running aggregates,
//!   multi-geometry results and HDF5 persistence
//! - [`Wrangler`] - Background worker that ingests frames as they appear
//!
//! Lock order is sphere, then arch, then file. Readers sharing a sphere
//! with a running wrangler only ever observe fully added arches.

mod error;
pub mod arch;
pub mod series;
pub mod sphere;
pub mod state;
pub mod wrangler;

pub use arch::{ArchArgs, EwaldArch, FileLock, ARCH_TYPE};
pub use error::{Error, Result};
pub use series::ArchSeries;
pub use sphere::{AddArchOptions, EwaldSphere, SPHERE_TYPE};
pub use state::{SphereStatus, WorkerState};
pub use wrangler::{Command, Signal, SourceConfig, Wrangler, WranglerConfig};
