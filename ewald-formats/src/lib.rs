//! ewald-formats: detector configuration, image readers and metadata parsers.
//!
//! # Key Components
//!
//! - [`DetectorConfig`] - Image shape, pixel pitch, raw pixel type and the
//!   insensitive columns of an area detector, loadable from JSON
//! - [`read_image`] - Raw (memory-mapped) and TIFF frame readers
//! - [`read_metadata`] - PDI and sidecar scan-metadata parsers

mod error;
pub mod image;
pub mod metadata;

pub use error::{Error, Result};
pub use image::{apply_column_mask, read_image, read_raw, read_tiff, ImageKind, MappedFileReader};
pub use metadata::{parse_pdi, parse_sidecar, read_metadata, MetadataKind};

use ewald_core::Detector;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Pixel value type of headerless raw frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelType {
    /// Signed 32-bit little endian.
    #[default]
    I32,
    /// Unsigned 16-bit little endian.
    U16,
}

impl PixelType {
    /// Bytes per pixel.
    #[must_use]
    pub fn size(self) -> usize {
        match self {
            Self::I32 => 4,
            Self::U16 => 2,
        }
    }
}

/// Area-detector configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Detector model name.
    pub name: String,
    /// Image shape `(rows, cols)`.
    pub shape: (usize, usize),
    /// Pixel pitch along rows, meters.
    pub pixel1: f64,
    /// Pixel pitch along columns, meters.
    pub pixel2: f64,
    /// Pixel type of raw frames.
    pub pixel_type: PixelType,
    /// Bytes to skip before the pixel data of raw frames.
    pub header_bytes: usize,
    /// Columns set to a negative value on read so they end up masked.
    pub insensitive_columns: Vec<usize>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self::pilatus_100k()
    }
}

#[derive(Deserialize)]
struct JsonConfig {
    detector: JsonDetector,
}

#[derive(Deserialize)]
#[serde(default)]
struct JsonDetector {
    name: String,
    layout: JsonLayout,
    raw: JsonRaw,
    insensitive_columns: Vec<usize>,
}

impl Default for JsonDetector {
    fn default() -> Self {
        Self {
            name: "Pilatus100k".to_string(),
            layout: JsonLayout::default(),
            raw: JsonRaw::default(),
            insensitive_columns: Vec::new(),
        }
    }
}

#[derive(Deserialize)]
#[serde(default)]
struct JsonLayout {
    rows: usize,
    cols: usize,
    pixel1: f64,
    pixel2: f64,
}

impl Default for JsonLayout {
    fn default() -> Self {
        Self {
            rows: 195,
            cols: 487,
            pixel1: 172e-6,
            pixel2: 172e-6,
        }
    }
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct JsonRaw {
    pixel_type: PixelType,
    header_bytes: usize,
}

impl DetectorConfig {
    /// Dectris Pilatus 100K defaults: 195 × 487 pixels at 172 µm, `i32` raw frames.
    #[must_use]
    pub fn pilatus_100k() -> Self {
        Self {
            name: "Pilatus100k".to_string(),
            shape: (195, 487),
            pixel1: 172e-6,
            pixel2: 172e-6,
            pixel_type: PixelType::I32,
            header_bytes: 0,
            insensitive_columns: Vec::new(),
        }
    }

    /// Sets the image shape.
    #[must_use]
    pub fn with_shape(mut self, rows: usize, cols: usize) -> Self {
        self.shape = (rows, cols);
        self
    }

    /// Sets the raw pixel type.
    #[must_use]
    pub fn with_pixel_type(mut self, pixel_type: PixelType) -> Self {
        self.pixel_type = pixel_type;
        self
    }

    /// Sets the insensitive columns.
    #[must_use]
    pub fn with_insensitive_columns(mut self, columns: Vec<usize>) -> Self {
        self.insensitive_columns = columns;
        self
    }

    /// Load configuration from a JSON file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let json_config: JsonConfig = serde_json::from_reader(BufReader::new(file))?;
        Self::from_json_config(json_config)
    }

    /// Load configuration from a JSON string. Missing sections fall back to
    /// the Pilatus 100K defaults.
    ///
    /// # Errors
    /// Returns an error if the JSON is malformed or fails validation.
    pub fn from_json(json: &str) -> Result<Self> {
        let json_config: JsonConfig = serde_json::from_str(json)?;
        Self::from_json_config(json_config)
    }

    fn from_json_config(config: JsonConfig) -> Result<Self> {
        let detector = config.detector;
        let config = Self {
            name: detector.name,
            shape: (detector.layout.rows, detector.layout.cols),
            pixel1: detector.layout.pixel1,
            pixel2: detector.layout.pixel2,
            pixel_type: detector.raw.pixel_type,
            header_bytes: detector.raw.header_bytes,
            insensitive_columns: detector.insensitive_columns,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks the shape is non-empty, the pitches positive and every
    /// insensitive column inside the image.
    ///
    /// # Errors
    /// Returns [`Error::InvalidFormat`] describing the violation.
    pub fn validate(&self) -> Result<()> {
        if self.shape.0 == 0 || self.shape.1 == 0 {
            return Err(Error::InvalidFormat(format!(
                "detector shape {:?} is empty",
                self.shape
            )));
        }
        if !(self.pixel1 > 0.0 && self.pixel2 > 0.0) {
            return Err(Error::InvalidFormat(
                "pixel pitch must be positive".to_string(),
            ));
        }
        if let Some(&col) = self.insensitive_columns.iter().find(|&&c| c >= self.shape.1) {
            return Err(Error::InvalidFormat(format!(
                "insensitive column {col} outside {} columns",
                self.shape.1
            )));
        }
        Ok(())
    }

    /// Bytes a raw frame of this detector occupies.
    #[must_use]
    pub fn raw_frame_bytes(&self) -> usize {
        self.header_bytes + self.shape.0 * self.shape.1 * self.pixel_type.size()
    }

    /// Calibration detector descriptor for this configuration.
    #[must_use]
    pub fn detector(&self) -> Detector {
        Detector::new(self.name.clone(), self.pixel1, self.pixel2, self.shape)
    }

    /// Reads a frame and applies the insensitive-column mask.
    ///
    /// # Errors
    /// Returns an error if the frame cannot be read or has the wrong shape.
    pub fn read_frame<P: AsRef<Path>>(&self, path: P) -> Result<Array2<f64>> {
        let mut image = read_image(path, self)?;
        apply_column_mask(&mut image, &self.insensitive_columns);
        Ok(image)
    }
}
