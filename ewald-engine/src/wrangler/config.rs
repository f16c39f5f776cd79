//! Wrangler configuration.

use crate::error::{Error, Result};
use ewald_core::RotationMotors;
use ewald_formats::{DetectorConfig, MetadataKind};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where frames come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    /// Poll a directory for new images whose stem ends in an index.
    DirectoryWatch {
        directory: PathBuf,
        /// Only files with this extension are picked up; any image file
        /// when absent.
        #[serde(default)]
        extension: Option<String>,
    },
    /// Walk a fixed list of indices through a filename template holding
    /// `{index}` or a zero-padded `{index:0N}`.
    ScanPlan { template: String, indices: Vec<i64> },
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self::DirectoryWatch {
            directory: PathBuf::from("."),
            extension: None,
        }
    }
}

/// Settings of one live ingest run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WranglerConfig {
    pub source: SourceConfig,
    /// Base calibration; rotations are offset per frame.
    pub poni_file: PathBuf,
    pub rotation_motors: RotationMotors,
    pub metadata: MetadataKind,
    /// Seconds without a readable frame before the run gives up.
    pub timeout_secs: f64,
    pub poll_interval_ms: u64,
    /// Capacity of the command and signal queues.
    pub queue_capacity: usize,
    /// Detector configuration file in the `{"detector": {...}}` layout.
    /// Takes precedence over `detector`.
    pub detector_file: Option<PathBuf>,
    pub detector: DetectorConfig,
    /// Incident-angle motor for grazing scans; the sphere's own setting is
    /// kept when absent.
    pub th_mtr: Option<String>,
}

impl Default for WranglerConfig {
    fn default() -> Self {
        Self {
            source: SourceConfig::default(),
            poni_file: PathBuf::from("calibration.poni"),
            rotation_motors: RotationMotors::default(),
            metadata: MetadataKind::default(),
            timeout_secs: 60.0,
            poll_interval_ms: 100,
            queue_capacity: 64,
            detector_file: None,
            detector: DetectorConfig::default(),
            th_mtr: None,
        }
    }
}

impl WranglerConfig {
    /// Loads the configuration from a JSON file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let config: Self = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the configuration from a JSON string.
    ///
    /// # Errors
    /// Returns an error if the JSON is malformed or fails validation.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn with_source(mut self, source: SourceConfig) -> Self {
        self.source = source;
        self
    }

    #[must_use]
    pub fn with_poni_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.poni_file = path.into();
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs_f64();
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn with_detector(mut self, detector: DetectorConfig) -> Self {
        self.detector = detector;
        self.detector_file = None;
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, kind: MetadataKind) -> Self {
        self.metadata = kind;
        self
    }

    #[must_use]
    pub fn with_rotation_motors(mut self, motors: RotationMotors) -> Self {
        self.rotation_motors = motors;
        self
    }

    /// Checks value ranges.
    ///
    /// # Errors
    /// Returns [`Error::InvalidState`] for a non-positive timeout or queue
    /// capacity.
    pub fn validate(&self) -> Result<()> {
        if !(self.timeout_secs > 0.0 && self.timeout_secs.is_finite()) {
            return Err(Error::InvalidState(format!(
                "timeout must be positive, got {}",
                self.timeout_secs
            )));
        }
        if self.queue_capacity == 0 {
            return Err(Error::InvalidState("queue capacity must be positive".to_string()));
        }
        Ok(())
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs.max(0.0))
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Detector configuration, read from `detector_file` when set.
    ///
    /// # Errors
    /// Returns an error if the detector file cannot be loaded.
    pub fn resolved_detector(&self) -> Result<DetectorConfig> {
        match &self.detector_file {
            Some(path) => Ok(DetectorConfig::from_file(path)?),
            None => Ok(self.detector.clone()),
        }
    }
}
