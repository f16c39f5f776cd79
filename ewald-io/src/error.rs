//! Persistence error types.

use thiserror::Error;

/// Result type for persistence operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Persistence error types.
#[derive(Error, Debug)]
pub enum Error {
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HDF5 library error.
    #[error("HDF5 error: {0}")]
    Hdf5(#[from] hdf5::Error),

    /// Stored node does not have the expected layout.
    #[error("invalid file format: {0}")]
    InvalidFormat(String),

    /// Value cannot be encoded, or a stored tag cannot be decoded.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Requested node is absent.
    #[error("missing node: {0}")]
    MissingNode(String),

    /// JSON text encoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML text encoding error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Core library error.
    #[error("core error: {0}")]
    Core(#[from] ewald_core::Error),
}
