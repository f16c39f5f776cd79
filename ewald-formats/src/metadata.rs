//! Scan metadata readers.
//!
//! Each detector frame is accompanied by a small text file holding the
//! motor positions and counter values at the time of the exposure.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const COUNTERS: &str = "All Counters";
const MOTORS: &str = "All Motors";
const DIFFRACTOMETER: &str = "Diffractometer Motor Positions";

/// Metadata file flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataKind {
    /// `<image>.pdi` with `All Counters` / `All Motors` sections.
    #[default]
    Pdi,
    /// `<image stem>.txt` with `name=value` pairs.
    Sidecar,
}

impl MetadataKind {
    /// Metadata path belonging to an image path.
    #[must_use]
    pub fn path_for(self, image: &Path) -> PathBuf {
        match self {
            Self::Pdi => {
                let mut name = image.as_os_str().to_os_string();
                name.push(".pdi");
                PathBuf::from(name)
            }
            Self::Sidecar => image.with_extension("txt"),
        }
    }
}

/// Reads and parses the metadata file of `image`.
///
/// # Errors
/// Returns an error if the file is missing or cannot be parsed.
pub fn read_metadata(image: &Path, kind: MetadataKind) -> Result<BTreeMap<String, f64>> {
    let path = kind.path_for(image);
    let text = std::fs::read_to_string(&path)?;
    match kind {
        MetadataKind::Pdi => parse_pdi(&text),
        MetadataKind::Sidecar => parse_sidecar(&text),
    }
}

/// Parses PDI text into a flat name → value map.
///
/// The counters and motors sections are merged; when neither is present the
/// `Diffractometer Motor Positions` block is used instead.
///
/// # Errors
/// Returns [`Error::InvalidFormat`] if no recognised section is found.
pub fn parse_pdi(text: &str) -> Result<BTreeMap<String, f64>> {
    let counters = section(text, COUNTERS);
    let motors = section(text, MOTORS);
    if counters.is_none() && motors.is_none() {
        log::debug!("PDI without counter/motor sections, trying diffractometer block");
        let block = section(text, DIFFRACTOMETER).ok_or_else(|| {
            Error::InvalidFormat("PDI has no counter, motor or diffractometer section".to_string())
        })?;
        return Ok(pairs(block, &[';', '\n']));
    }
    let mut out = BTreeMap::new();
    for body in [counters, motors].into_iter().flatten() {
        out.extend(pairs(body, &[';', '\n']));
    }
    Ok(out)
}

/// Parses `name=value` pairs separated by newlines or `;`. Text after `#` on
/// a line is a comment.
///
/// # Errors
/// Returns [`Error::InvalidFormat`] if no pair is found.
pub fn parse_sidecar(text: &str) -> Result<BTreeMap<String, f64>> {
    let mut out = BTreeMap::new();
    for line in text.lines() {
        let line = line.split('#').next().unwrap_or_default();
        out.extend(pairs(line, &[';']));
    }
    if out.is_empty() {
        return Err(Error::InvalidFormat(
            "sidecar has no name=value pairs".to_string(),
        ));
    }
    Ok(out)
}

/// Body of a `<marker>; ...; #` section.
fn section<'a>(text: &'a str, marker: &str) -> Option<&'a str> {
    let start = text.find(marker)? + marker.len();
    let rest = &text[start..];
    let end = rest.find('#').unwrap_or(rest.len());
    Some(&rest[..end])
}

/// Numeric `name=value` tokens; non-numeric values are skipped.
fn pairs(body: &str, separators: &[char]) -> BTreeMap<String, f64> {
    body.split(separators)
        .filter_map(|token| {
            let (name, value) = token.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            value
                .trim()
                .parse::<f64>()
                .ok()
                .map(|v| (name.to_string(), v))
        })
        .collect()
}
