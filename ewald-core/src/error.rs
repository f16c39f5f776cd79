//! Error types for ewald-core.

use thiserror::Error;

/// Result type alias for ewald operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for ewald operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Two arrays that must share a logical shape do not.
    #[error("shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    /// Calibration record failed validation.
    #[error("invalid PONI: {0}")]
    InvalidPoni(String),

    /// Unknown radial unit string.
    #[error("invalid unit: {0}")]
    InvalidUnit(String),

    /// A required key is absent from a metadata or calibration mapping.
    #[error("missing key: {0}")]
    MissingKey(String),

    /// A table row does not carry the table's columns.
    #[error("mismatched columns: expected {expected:?}, found {found:?}")]
    MismatchedColumns {
        expected: Vec<String>,
        found: Vec<String>,
    },

    /// Text could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Interpolation input was not usable.
    #[error("interpolation error: {0}")]
    Interpolation(String),

    /// The azimuthal integrator rejected its input.
    #[error("integration error: {0}")]
    Integration(String),

    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn shape(expected: &[usize], found: &[usize]) -> Self {
        Self::ShapeMismatch {
            expected: expected.to_vec(),
            found: found.to_vec(),
        }
    }
}
