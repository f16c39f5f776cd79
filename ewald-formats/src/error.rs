//! Format error types.

use thiserror::Error;

/// Result type for format operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Image and metadata format errors.
#[derive(Error, Debug)]
pub enum Error {
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The file holds fewer bytes than the detector shape requires.
    #[error("truncated image: expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },

    /// Invalid file format.
    #[error("invalid file format: {0}")]
    InvalidFormat(String),

    /// TIFF decoding error.
    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    /// JSON configuration error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Core library error.
    #[error("core error: {0}")]
    Core(#[from] ewald_core::Error),
}

impl Error {
    /// True for errors expected while a frame is still being written: the
    /// file is absent or shorter than a full image.
    #[must_use]
    pub fn is_incomplete(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::UnexpectedEof
            ),
            Self::Truncated { .. } => true,
            _ => false,
        }
    }
}
