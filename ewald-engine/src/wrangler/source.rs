//! Frame discovery.

use super::config::SourceConfig;
use crate::error::{Error, Result};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// An image to ingest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub idx: i64,
    pub image_path: PathBuf,
}

/// Outcome of polling a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Poll {
    Ready(Frame),
    /// Nothing new yet.
    Pending,
    /// The source will produce no more frames.
    Finished,
}

/// Produces the frames of a scan in order.
pub trait FrameSource: Send {
    /// Returns the next frame if one is available.
    ///
    /// A frame that fails to ingest with a recoverable error is offered
    /// again by the caller, not by the source.
    ///
    /// # Errors
    /// Returns an error if the source itself cannot be read.
    fn next_frame(&mut self) -> Result<Poll>;
}

/// Builds the source described by `config`.
///
/// # Errors
/// Returns an error for an invalid scan-plan template.
pub fn from_config(config: &SourceConfig) -> Result<Box<dyn FrameSource>> {
    Ok(match config {
        SourceConfig::DirectoryWatch {
            directory,
            extension,
        } => Box::new(DirectoryWatch::new(directory, extension.clone())),
        SourceConfig::ScanPlan { template, indices } => {
            Box::new(ScanPlan::new(template, indices.clone())?)
        }
    })
}

/// Extensions never treated as images.
const SIDECAR_EXTENSIONS: &[&str] = &["pdi", "txt", "poni", "h5", "json"];

/// Watches a directory for images whose file stem ends in an integer index.
///
/// Each poll lists the directory and returns the lowest index not yet
/// handed out.
#[derive(Debug)]
pub struct DirectoryWatch {
    directory: PathBuf,
    extension: Option<String>,
    seen: BTreeSet<i64>,
}

impl DirectoryWatch {
    pub fn new(directory: impl Into<PathBuf>, extension: Option<String>) -> Self {
        Self {
            directory: directory.into(),
            extension: extension.map(|e| e.trim_start_matches('.').to_ascii_lowercase()),
            seen: BTreeSet::new(),
        }
    }

    fn accepts(&self, path: &Path) -> bool {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match (&self.extension, ext) {
            (Some(wanted), Some(ext)) => *wanted == ext,
            (Some(_), None) => false,
            (None, Some(ext)) => !SIDECAR_EXTENSIONS.contains(&ext.as_str()),
            (None, None) => true,
        }
    }
}

impl FrameSource for DirectoryWatch {
    fn next_frame(&mut self) -> Result<Poll> {
        let entries = match std::fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            // The directory may be created once the scan starts.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Poll::Pending),
            Err(e) => return Err(e.into()),
        };
        let mut best: Option<Frame> = None;
        for entry in entries {
            let path = entry?.path();
            if !path.is_file() || !self.accepts(&path) {
                continue;
            }
            let Some(idx) = trailing_index(&path) else {
                continue;
            };
            if self.seen.contains(&idx) || best.as_ref().is_some_and(|b| b.idx <= idx) {
                continue;
            }
            best = Some(Frame {
                idx,
                image_path: path,
            });
        }
        Ok(match best {
            Some(frame) => {
                self.seen.insert(frame.idx);
                Poll::Ready(frame)
            }
            None => Poll::Pending,
        })
    }
}

/// Integer formed by the trailing digits of the file stem.
#[must_use]
pub fn trailing_index(path: &Path) -> Option<i64> {
    let stem = path.file_stem()?.to_str()?;
    let digits = stem.len() - stem.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 {
        return None;
    }
    stem[stem.len() - digits..].parse().ok()
}

/// Fixed list of indices expanded through a filename template.
#[derive(Debug)]
pub struct ScanPlan {
    template: Template,
    indices: std::vec::IntoIter<i64>,
}

#[derive(Debug)]
struct Template {
    prefix: String,
    suffix: String,
    width: usize,
}

impl Template {
    fn parse(template: &str) -> Result<Self> {
        let start = template.find("{index").ok_or_else(|| {
            Error::InvalidState(format!("template {template:?} has no {{index}} field"))
        })?;
        let end = template[start..]
            .find('}')
            .map(|e| start + e)
            .ok_or_else(|| Error::InvalidState(format!("unclosed field in {template:?}")))?;
        let field = &template[start + "{index".len()..end];
        let width = match field.strip_prefix(":0").or_else(|| field.strip_prefix(':')) {
            Some(width) => width
                .parse()
                .map_err(|_| Error::InvalidState(format!("bad width {field:?} in {template:?}")))?,
            None if field.is_empty() => 0,
            None => return Err(Error::InvalidState(format!("bad field {field:?} in {template:?}"))),
        };
        Ok(Self {
            prefix: template[..start].to_string(),
            suffix: template[end + 1..].to_string(),
            width,
        })
    }

    fn render(&self, idx: i64) -> PathBuf {
        PathBuf::from(format!(
            "{}{idx:0width$}{}",
            self.prefix,
            self.suffix,
            width = self.width
        ))
    }
}

impl ScanPlan {
    /// # Errors
    /// Returns [`Error::InvalidState`] if `template` has no usable `{index}`
    /// field.
    pub fn new(template: &str, indices: Vec<i64>) -> Result<Self> {
        Ok(Self {
            template: Template::parse(template)?,
            indices: indices.into_iter(),
        })
    }
}

impl FrameSource for ScanPlan {
    fn next_frame(&mut self) -> Result<Poll> {
        Ok(match self.indices.next() {
            Some(idx) => Poll::Ready(Frame {
                idx,
                image_path: self.template.render(idx),
            }),
            None => Poll::Finished,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_trailing_index() {
        assert_eq!(trailing_index(Path::new("/d/scan_0012.raw")), Some(12));
        assert_eq!(trailing_index(Path::new("scan7.tif")), Some(7));
        assert_eq!(trailing_index(Path::new("dark.raw")), None);
    }

    #[test]
    fn test_directory_watch_order() {
        let dir = tempdir().unwrap();
        let mut source = DirectoryWatch::new(dir.path(), None);
        assert_eq!(source.next_frame().unwrap(), Poll::Pending);

        for name in ["s_3.raw", "s_1.raw", "s_1.raw.pdi", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let ids: Vec<i64> = (0..2)
            .map(|_| match source.next_frame().unwrap() {
                Poll::Ready(frame) => frame.idx,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(source.next_frame().unwrap(), Poll::Pending);
    }

    #[test]
    fn test_scan_plan_template() {
        let mut plan = ScanPlan::new("/data/img_{index:04}.raw", vec![7, 12]).unwrap();
        let Poll::Ready(frame) = plan.next_frame().unwrap() else {
            panic!("expected a frame");
        };
        assert_eq!(frame.image_path, PathBuf::from("/data/img_0007.raw"));
        assert!(matches!(plan.next_frame().unwrap(), Poll::Ready(_)));
        assert_eq!(plan.next_frame().unwrap(), Poll::Finished);

        let plain = ScanPlan::new("f{index}.tif", vec![3]).unwrap();
        assert_eq!(plain.template.render(3), PathBuf::from("f3.tif"));
        assert!(ScanPlan::new("no_field.raw", vec![]).is_err());
    }
}
