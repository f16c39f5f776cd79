//! Detector calibration (PONI: point of normal incidence).
//!
//! A PONI fixes how every detector pixel maps onto scattering angles: sample to
//! detector distance, the PONI coordinates on the detector plane, three
//! rotations, the wavelength, and the detector pixel layout.
//!
//! The text format is one `Key: value` pair per line:
//!
//! ```text
//! Detector: Pilatus100k
//! Detector_config: {"pixel1": 0.000172, "pixel2": 0.000172, "max_shape": [195, 487]}
//! Distance: 0.5
//! Poni1: 0.0168
//! Poni2: 0.0419
//! Rot1: 0.0
//! Rot2: 0.0
//! Rot3: 0.0
//! Wavelength: 9.762e-11
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

/// File key → field name for the seven numeric calibration parameters.
pub const PONI_KEYS: [(&str, &str); 7] = [
    ("Distance", "dist"),
    ("Poni1", "poni1"),
    ("Poni2", "poni2"),
    ("Rot1", "rot1"),
    ("Rot2", "rot2"),
    ("Rot3", "rot3"),
    ("Wavelength", "wavelength"),
];

/// Detector pixel layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detector {
    /// Detector model name.
    pub name: String,
    /// Pixel pitch along axis 1 (rows), meters.
    pub pixel1: f64,
    /// Pixel pitch along axis 2 (columns), meters.
    pub pixel2: f64,
    /// Full detector shape `(rows, cols)`.
    pub max_shape: (usize, usize),
}

impl Detector {
    /// Creates a detector description.
    #[must_use]
    pub fn new(name: impl Into<String>, pixel1: f64, pixel2: f64, max_shape: (usize, usize)) -> Self {
        Self {
            name: name.into(),
            pixel1,
            pixel2,
            max_shape,
        }
    }

    /// Dectris Pilatus 100K: 195 × 487 pixels at 172 µm.
    #[must_use]
    pub fn pilatus_100k() -> Self {
        Self::new("Pilatus100k", 172e-6, 172e-6, (195, 487))
    }

    fn config_value(&self) -> Value {
        serde_json::json!({
            "pixel1": self.pixel1,
            "pixel2": self.pixel2,
            "max_shape": [self.max_shape.0, self.max_shape.1],
        })
    }
}

impl Default for Detector {
    fn default() -> Self {
        Self::pilatus_100k()
    }
}

#[derive(Deserialize)]
struct DetectorConfigJson {
    pixel1: f64,
    pixel2: f64,
    max_shape: Option<(usize, usize)>,
}

/// Calibration record.
#[derive(Debug, Clone, PartialEq)]
pub struct Poni {
    /// Sample to detector distance, meters.
    pub dist: f64,
    /// PONI coordinate along axis 1, meters.
    pub poni1: f64,
    /// PONI coordinate along axis 2, meters.
    pub poni2: f64,
    /// Rotation about axis 1, radians.
    pub rot1: f64,
    /// Rotation about axis 2, radians.
    pub rot2: f64,
    /// Rotation about the beam, radians.
    pub rot3: f64,
    /// Wavelength, meters.
    pub wavelength: f64,
    /// Detector pixel layout.
    pub detector: Detector,
}

impl Default for Poni {
    fn default() -> Self {
        Self {
            dist: 0.1,
            poni1: 0.0,
            poni2: 0.0,
            rot1: 0.0,
            rot2: 0.0,
            rot3: 0.0,
            wavelength: 1.0e-10,
            detector: Detector::default(),
        }
    }
}

/// Motor names whose positions (degrees) are subtracted from the base rotations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationMotors {
    pub rot1: Option<String>,
    pub rot2: Option<String>,
    pub rot3: Option<String>,
}

impl Poni {
    /// Checks pixel pitches, wavelength and distance are positive.
    ///
    /// # Errors
    /// Returns [`Error::InvalidPoni`] describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if !(self.detector.pixel1 > 0.0 && self.detector.pixel2 > 0.0) {
            return Err(Error::InvalidPoni(format!(
                "pixel pitch must be positive, got ({}, {})",
                self.detector.pixel1, self.detector.pixel2
            )));
        }
        if !(self.wavelength > 0.0) {
            return Err(Error::InvalidPoni(format!(
                "wavelength must be positive, got {}",
                self.wavelength
            )));
        }
        if !(self.dist > 0.0) {
            return Err(Error::InvalidPoni(format!(
                "distance must be positive, got {}",
                self.dist
            )));
        }
        Ok(())
    }

    /// Builds a PONI from a mapping keyed by file keys (`Distance`, `Poni1`, …)
    /// or by field names (`dist`, `poni1`, …).
    ///
    /// # Errors
    /// Returns an error if a numeric key is missing or not a number, or if the
    /// result fails [`validate`](Self::validate).
    pub fn from_dict(dict: &Map<String, Value>) -> Result<Self> {
        let mut values = [0.0_f64; 7];
        for (slot, (file_key, field)) in values.iter_mut().zip(PONI_KEYS) {
            let value = dict
                .get(file_key)
                .or_else(|| dict.get(field))
                .ok_or_else(|| Error::MissingKey(file_key.to_string()))?;
            *slot = number(value, file_key)?;
        }
        let [dist, poni1, poni2, rot1, rot2, rot3, wavelength] = values;

        let mut detector = Detector::default();
        if let Some(name) = dict
            .get("Detector")
            .or_else(|| dict.get("detector"))
            .and_then(Value::as_str)
        {
            detector.name = name.to_string();
        }
        if let Some(config) = dict
            .get("Detector_config")
            .or_else(|| dict.get("detector_config"))
        {
            let config = match config {
                Value::String(text) => serde_json::from_str::<DetectorConfigJson>(text),
                other => serde_json::from_value::<DetectorConfigJson>(other.clone()),
            }
            .map_err(|e| Error::Parse(format!("Detector_config: {e}")))?;
            detector.pixel1 = config.pixel1;
            detector.pixel2 = config.pixel2;
            if let Some(shape) = config.max_shape {
                detector.max_shape = shape;
            }
        }

        let poni = Self {
            dist,
            poni1,
            poni2,
            rot1,
            rot2,
            rot3,
            wavelength,
            detector,
        };
        poni.validate()?;
        Ok(poni)
    }

    /// Mapping in the same shape [`from_dict`](Self::from_dict) accepts.
    #[must_use]
    pub fn to_dict(&self) -> Map<String, Value> {
        let mut dict = Map::new();
        for ((file_key, _), value) in PONI_KEYS.iter().zip(self.values()) {
            dict.insert((*file_key).to_string(), Value::from(value));
        }
        dict.insert("Detector".to_string(), Value::from(self.detector.name.clone()));
        dict.insert("Detector_config".to_string(), self.detector.config_value());
        dict
    }

    /// Parses the `Key: value` text format.
    ///
    /// Version 1 files carrying `PixelSize1`/`PixelSize2` instead of
    /// `Detector_config` are accepted as well.
    ///
    /// # Errors
    /// Returns an error on malformed lines or missing keys.
    pub fn parse(text: &str) -> Result<Self> {
        let mut dict = Map::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once(':').ok_or_else(|| {
                Error::Parse(format!("line {}: expected `Key: value`", lineno + 1))
            })?;
            let key = key.trim();
            let value = value.trim();
            let parsed = match key {
                "Detector" => Value::from(value),
                "Detector_config" => serde_json::from_str(value)
                    .map_err(|e| Error::Parse(format!("Detector_config: {e}")))?,
                _ => match value.parse::<f64>() {
                    Ok(v) => Value::from(v),
                    Err(_) => Value::from(value),
                },
            };
            dict.insert(key.to_string(), parsed);
        }

        if !dict.contains_key("Detector_config") {
            if let (Some(p1), Some(p2)) = (dict.get("PixelSize1"), dict.get("PixelSize2")) {
                let config = serde_json::json!({ "pixel1": p1, "pixel2": p2 });
                dict.insert("Detector_config".to_string(), config);
            }
        }
        Self::from_dict(&dict)
    }

    /// Reads a `.poni` file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Renders the `Key: value` text format.
    #[must_use]
    pub fn to_file_string(&self) -> String {
        let mut out = String::from("# Nota: C-Order, 1 refers to the Y axis, 2 to the X axis\n");
        out.push_str("poni_version: 2\n");
        let _ = writeln!(out, "Detector: {}", self.detector.name);
        let _ = writeln!(out, "Detector_config: {}", self.detector.config_value());
        for ((file_key, _), value) in PONI_KEYS.iter().zip(self.values()) {
            let _ = writeln!(out, "{file_key}: {value:?}");
        }
        out
    }

    /// Applies scan-dependent rotation corrections:
    /// `rot_i ← rot_i - radians(scan_info[motor_i])` for every mapped motor.
    ///
    /// # Errors
    /// Returns [`Error::MissingKey`] if a mapped motor is absent from `scan_info`.
    pub fn with_rotation_offsets(
        &self,
        motors: &RotationMotors,
        scan_info: &BTreeMap<String, f64>,
    ) -> Result<Self> {
        let lookup = |motor: &Option<String>| -> Result<f64> {
            match motor {
                Some(name) => scan_info
                    .get(name)
                    .map(|deg| deg.to_radians())
                    .ok_or_else(|| Error::MissingKey(name.clone())),
                None => Ok(0.0),
            }
        };
        let mut poni = self.clone();
        poni.rot1 -= lookup(&motors.rot1)?;
        poni.rot2 -= lookup(&motors.rot2)?;
        poni.rot3 -= lookup(&motors.rot3)?;
        Ok(poni)
    }

    fn values(&self) -> [f64; 7] {
        [
            self.dist,
            self.poni1,
            self.poni2,
            self.rot1,
            self.rot2,
            self.rot3,
            self.wavelength,
        ]
    }
}

fn number(value: &Value, key: &str) -> Result<f64> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| Error::Parse(format!("{key}: not representable as f64"))),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| Error::Parse(format!("{key}: `{s}` is not a number"))),
        other => Err(Error::Parse(format!("{key}: expected a number, got {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::io::Write;

    const SAMPLE: &str = "\
# Nota: C-Order, 1 refers to the Y axis, 2 to the X axis
poni_version: 2
Detector: Pilatus100k
Detector_config: {\"pixel1\": 0.000172, \"pixel2\": 0.000172, \"max_shape\": [195, 487]}
Distance: 0.4822
Poni1: 0.0168
Poni2: 0.0419
Rot1: 0.0012
Rot2: -0.0031
Rot3: 0.0
Wavelength: 9.762e-11
";

    #[test]
    fn test_parse_file_format() {
        let poni = Poni::parse(SAMPLE).unwrap();
        assert_relative_eq!(poni.dist, 0.4822);
        assert_relative_eq!(poni.rot2, -0.0031);
        assert_relative_eq!(poni.wavelength, 9.762e-11);
        assert_eq!(poni.detector.max_shape, (195, 487));
        assert_eq!(poni.detector.name, "Pilatus100k");
    }

    #[test]
    fn test_dict_roundtrip() {
        let poni = Poni::parse(SAMPLE).unwrap();
        let back = Poni::from_dict(&poni.to_dict()).unwrap();
        assert_eq!(poni, back);
    }

    #[test]
    fn test_file_string_roundtrip() {
        let poni = Poni::parse(SAMPLE).unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(poni.to_file_string().as_bytes()).unwrap();
        let back = Poni::from_file(file.path()).unwrap();
        assert_eq!(poni, back);
    }

    #[test]
    fn test_field_name_keys_accepted() {
        let dict = serde_json::json!({
            "dist": 0.2, "poni1": 0.01, "poni2": 0.02,
            "rot1": 0.0, "rot2": 0.0, "rot3": 0.0, "wavelength": 1.0e-10,
        });
        let poni = Poni::from_dict(dict.as_object().unwrap()).unwrap();
        assert_relative_eq!(poni.poni2, 0.02);
        assert_eq!(poni.detector, Detector::pilatus_100k());
    }

    #[test]
    fn test_validation() {
        let mut poni = Poni::default();
        assert!(poni.validate().is_ok());
        poni.wavelength = 0.0;
        assert!(matches!(poni.validate(), Err(Error::InvalidPoni(_))));
        poni.wavelength = 1e-10;
        poni.detector.pixel1 = -1.0;
        assert!(poni.validate().is_err());
    }

    #[test]
    fn test_missing_key() {
        let text = "Distance: 0.1\nPoni1: 0.0\n";
        assert!(matches!(Poni::parse(text), Err(Error::MissingKey(_))));
    }

    #[test]
    fn test_rotation_offsets() {
        let base = Poni::default();
        let motors = RotationMotors {
            rot2: Some("TwoTheta".to_string()),
            ..RotationMotors::default()
        };
        let mut scan_info = BTreeMap::new();
        scan_info.insert("TwoTheta".to_string(), 10.0);
        let moved = base.with_rotation_offsets(&motors, &scan_info).unwrap();
        assert_relative_eq!(moved.rot2, -10.0_f64.to_radians());
        assert_relative_eq!(moved.rot1, 0.0);

        scan_info.clear();
        assert!(matches!(
            base.with_rotation_offsets(&motors, &scan_info),
            Err(Error::MissingKey(_))
        ));
    }

    #[test]
    fn test_v1_pixel_sizes() {
        let text = "PixelSize1: 1e-4\nPixelSize2: 2e-4\nDistance: 0.1\nPoni1: 0\nPoni2: 0\n\
                    Rot1: 0\nRot2: 0\nRot3: 0\nWavelength: 1e-10\n";
        let poni = Poni::parse(text).unwrap();
        assert_relative_eq!(poni.detector.pixel1, 1e-4);
        assert_relative_eq!(poni.detector.pixel2, 2e-4);
    }
}
