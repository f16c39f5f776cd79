//! ewald-core: core types for 2D X-ray diffraction reduction.
//!
//! This crate provides the sparse arrays used for binned histograms, the
//! detector calibration record, the integration-result containers and the
//! call contract the azimuthal integrators implement.
//!

pub mod error;
pub mod int_data;
pub mod integration;
pub mod nzarray;
pub mod poni;
pub mod spline;
pub mod table;
pub mod units;

pub use error::{Error, Result};
pub use int_data::{IntData1D, IntData2D, IntData2DStatic, Integration2D};
pub use integration::{
    AzimuthalIntegration, GrazingTransform, Integrate1dArgs, Integrate1dResult, Integrate2dArgs,
    Integrate2dResult, MultiGeometryArgs, TransformProcess, TransformRequest, TransformResult,
};
pub use nzarray::{safe_divide, NzArray1, NzArray2};
pub use poni::{Detector, Poni, RotationMotors};
pub use table::{Index, ScanTable, Series};
pub use units::RadialUnit;
