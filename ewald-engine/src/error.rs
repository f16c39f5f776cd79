//! Engine error types.

use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Engine error types.
#[derive(Error, Debug)]
pub enum Error {
    /// Core library error.
    #[error("core error: {0}")]
    Core(#[from] ewald_core::Error),

    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Image or metadata reading error.
    #[error("format error: {0}")]
    Formats(#[from] ewald_formats::Error),

    /// Persistence helper error.
    #[error("store error: {0}")]
    Store(#[from] ewald_io::Error),

    /// HDF5 library error.
    #[error("HDF5 error: {0}")]
    Hdf5(#[from] hdf5::Error),

    /// No arch with this id is stored.
    #[error("arch {0} not found")]
    ArchNotFound(i64),

    /// Operation not allowed in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// JSON configuration error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The other end of a wrangler queue has gone away.
    #[error("wrangler queue disconnected")]
    Disconnected,
}

impl Error {
    /// True for errors the wrangler retries until its timeout: files not yet
    /// (fully) written, metadata keys not yet present, and integrator
    /// failures.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Formats(e) => e.is_incomplete() || matches!(e, ewald_formats::Error::Core(c) if core_recoverable(c)),
            Self::Core(e) => core_recoverable(e),
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

fn core_recoverable(e: &ewald_core::Error) -> bool {
    match e {
        ewald_core::Error::MissingKey(_) | ewald_core::Error::Integration(_) => true,
        ewald_core::Error::Io(io) => io.kind() == std::io::ErrorKind::NotFound,
        _ => false,
    }
}
