//! Detector frame readers.
//!
//! Raw frames are headerless little-endian pixel dumps and are read through a
//! memory map. TIFF frames go through the `tiff` decoder. Both produce an
//! `f64` image of the detector shape.
#![allow(clippy::cast_precision_loss)]

use crate::{DetectorConfig, Error, PixelType, Result};
use memmap2::Mmap;
use ndarray::Array2;
use rayon::prelude::*;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tiff::decoder::{Decoder, DecodingResult};

/// Value written into insensitive columns.
pub const INSENSITIVE_VALUE: f64 = -2.0;

/// A memory-mapped file reader.
pub struct MappedFileReader {
    mmap: Mmap,
    path: PathBuf,
}

impl MappedFileReader {
    /// Opens a file for memory-mapped reading.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or memory-mapped.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(&path)?;
        // SAFETY: The file is opened read-only and frames are not rewritten
        // once the detector has closed them.
        #[allow(unsafe_code)]
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self {
            mmap,
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Returns the file contents as a byte slice.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap[..]
    }

    /// Returns the file size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    /// Returns true if the file is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Path the map was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// On-disk frame encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Raw,
    Tiff,
}

impl ImageKind {
    /// Encoding implied by the file extension; anything but `.tif`/`.tiff`
    /// is treated as raw.
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("tif" | "tiff") => Self::Tiff,
            _ => Self::Raw,
        }
    }
}

/// Reads a frame, choosing the decoder from the file extension.
///
/// # Errors
/// Returns an error if the file is missing, truncated or does not match the
/// detector shape.
pub fn read_image<P: AsRef<Path>>(path: P, config: &DetectorConfig) -> Result<Array2<f64>> {
    let path = path.as_ref();
    match ImageKind::from_path(path) {
        ImageKind::Raw => read_raw(path, config),
        ImageKind::Tiff => {
            let image = read_tiff(path)?;
            if image.dim() != config.shape {
                return Err(Error::InvalidFormat(format!(
                    "TIFF is {:?}, detector is {:?}",
                    image.dim(),
                    config.shape
                )));
            }
            Ok(image)
        }
    }
}

/// Reads a headerless raw frame.
///
/// Trailing bytes past one full frame are ignored.
///
/// # Errors
/// Returns [`Error::Truncated`] if the file is shorter than one frame.
pub fn read_raw<P: AsRef<Path>>(path: P, config: &DetectorConfig) -> Result<Array2<f64>> {
    let reader = MappedFileReader::open(path)?;
    let bytes = reader.as_bytes();
    let expected = config.raw_frame_bytes();
    if bytes.len() < expected {
        return Err(Error::Truncated {
            expected,
            found: bytes.len(),
        });
    }
    let body = &bytes[config.header_bytes..expected];
    let values: Vec<f64> = match config.pixel_type {
        PixelType::I32 => body
            .par_chunks_exact(4)
            .map(|c| f64::from(i32::from_le_bytes([c[0], c[1], c[2], c[3]])))
            .collect(),
        PixelType::U16 => body
            .par_chunks_exact(2)
            .map(|c| f64::from(u16::from_le_bytes([c[0], c[1]])))
            .collect(),
    };
    Array2::from_shape_vec(config.shape, values)
        .map_err(|e| Error::InvalidFormat(format!("raw frame shape: {e}")))
}

/// Decodes a single-channel TIFF into `(height, width)`.
///
/// # Errors
/// Returns an error if decoding fails or the sample type is unsupported.
pub fn read_tiff<P: AsRef<Path>>(path: P) -> Result<Array2<f64>> {
    let file = File::open(path)?;
    let mut decoder = Decoder::new(BufReader::new(file))?;
    let (width, height) = decoder.dimensions()?;
    let values: Vec<f64> = match decoder.read_image()? {
        DecodingResult::U8(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U64(v) => v.into_iter().map(|x| x as f64).collect(),
        DecodingResult::I8(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I64(v) => v.into_iter().map(|x| x as f64).collect(),
        DecodingResult::F32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::F64(v) => v,
        #[allow(unreachable_patterns)]
        _ => {
            return Err(Error::InvalidFormat(
                "unsupported TIFF sample type".to_string(),
            ))
        }
    };
    let shape = (height as usize, width as usize);
    Array2::from_shape_vec(shape, values)
        .map_err(|e| Error::InvalidFormat(format!("TIFF is not single-channel: {e}")))
}

/// Marks insensitive detector columns with [`INSENSITIVE_VALUE`] so they are
/// excluded by the negative-pixel mask. Out-of-range columns are ignored.
pub fn apply_column_mask(image: &mut Array2<f64>, columns: &[usize]) {
    let ncols = image.ncols();
    for &col in columns.iter().filter(|&&c| c < ncols) {
        image.column_mut(col).fill(INSENSITIVE_VALUE);
    }
}
