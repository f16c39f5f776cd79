//! Disk-backed arch collection.

use crate::arch::{arch_group, EwaldArch, FileLock};
use crate::error::{Error, Result};
use ewald_core::Poni;
use ewald_io::{load_record, remove_node, safe_open, OpenMode, DEFAULT_TRIES};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The arches of one sphere, stored under `<root>/arches`.
///
/// Only the sorted list of ids is held in memory. Every access reads the
/// arch back from the backing file, so at most one arch is resident per
/// caller at a time.
#[derive(Debug, Clone)]
pub struct ArchSeries {
    data_file: PathBuf,
    root: String,
    file_lock: FileLock,
    index: Vec<i64>,
    /// Detector not swept during the scan.
    pub static_scan: bool,
    /// Grazing-incidence geometry.
    pub gi: bool,
}

impl ArchSeries {
    /// Creates an empty series over `data_file`.
    #[must_use]
    pub fn new(data_file: impl Into<PathBuf>, root: impl Into<String>, file_lock: FileLock) -> Self {
        Self {
            data_file: data_file.into(),
            root: root.into(),
            file_lock,
            index: Vec::new(),
            static_scan: false,
            gi: false,
        }
    }

    /// Backing file.
    #[must_use]
    pub fn data_file(&self) -> &Path {
        &self.data_file
    }

    /// Points the series at another backing file without touching either.
    pub fn set_data_file(&mut self, data_file: impl Into<PathBuf>) {
        self.data_file = data_file.into();
    }

    /// Stored ids, ascending.
    #[must_use]
    pub fn index(&self) -> &[i64] {
        &self.index
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    #[must_use]
    pub fn contains(&self, idx: i64) -> bool {
        self.index.binary_search(&idx).is_ok()
    }

    /// Loads arch `idx` with both integrations.
    ///
    /// # Errors
    /// Returns [`Error::ArchNotFound`] if `idx` is not in the series.
    pub fn get(&self, idx: i64) -> Result<EwaldArch> {
        self.load(idx, true)
    }

    /// Loads arch `idx` without its 2D integration.
    ///
    /// # Errors
    /// Returns [`Error::ArchNotFound`] if `idx` is not in the series.
    pub fn get_1d(&self, idx: i64) -> Result<EwaldArch> {
        self.load(idx, false)
    }

    fn load(&self, idx: i64, with_2d: bool) -> Result<EwaldArch> {
        if !self.contains(idx) {
            return Err(Error::ArchNotFound(idx));
        }
        EwaldArch::load_from_h5(&self.data_file, &self.root, idx, with_2d, &self.file_lock)
    }

    /// Loads the arch at position `i` of the index.
    ///
    /// # Errors
    /// Returns [`Error::InvalidState`] if `i` is out of range.
    pub fn iloc(&self, i: usize) -> Result<EwaldArch> {
        let idx = *self.index.get(i).ok_or_else(|| {
            Error::InvalidState(format!("position {i} out of {} arches", self.index.len()))
        })?;
        self.get(idx)
    }

    /// Writes `arch` and records its id. An arch with the same id is
    /// replaced.
    ///
    /// # Errors
    /// Returns an error if the arch cannot be written.
    pub fn set(&mut self, arch: &mut EwaldArch) -> Result<()> {
        arch.bind_file_lock(&self.file_lock);
        arch.save_to_h5(&self.data_file, &self.root)?;
        if let Err(pos) = self.index.binary_search(&arch.idx) {
            self.index.insert(pos, arch.idx);
        }
        Ok(())
    }

    /// Deletes arch `idx` from the file and the index.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or the group removed.
    pub fn remove(&mut self, idx: i64) -> Result<bool> {
        let Ok(pos) = self.index.binary_search(&idx) else {
            return Ok(false);
        };
        {
            let _guard = self.file_lock.lock();
            let file = safe_open(&self.data_file, OpenMode::ReadWrite, DEFAULT_TRIES)?;
            if file.link_exists(&self.root) {
                let root = file.group(&self.root)?;
                if root.link_exists("arches") {
                    remove_node(&root.group("arches")?, &idx.to_string())?;
                }
            }
        }
        self.index.remove(pos);
        Ok(true)
    }

    /// Restores ascending order of the index.
    pub fn sort_index(&mut self) {
        self.index.sort_unstable();
        self.index.dedup();
    }

    /// Forgets every id. The file is not touched.
    pub fn clear(&mut self) {
        self.index.clear();
    }

    /// Rebuilds the index from the groups present under `<root>/arches`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened.
    pub fn refresh_index(&mut self) -> Result<()> {
        let _guard = self.file_lock.lock();
        self.index.clear();
        if !self.data_file.exists() {
            return Ok(());
        }
        let file = safe_open(&self.data_file, OpenMode::Read, DEFAULT_TRIES)?;
        if file.link_exists(&self.root) {
            let root = file.group(&self.root)?;
            if root.link_exists("arches") {
                for name in root.group("arches")?.member_names()? {
                    match name.parse::<i64>() {
                        Ok(idx) => self.index.push(idx),
                        Err(_) => log::warn!("ignoring non-numeric arch group {name}"),
                    }
                }
            }
        }
        self.sort_index();
        Ok(())
    }

    /// Iterates the arches in index order, reading each from disk.
    pub fn iter(&self) -> impl Iterator<Item = Result<EwaldArch>> + '_ {
        self.index.iter().map(move |&idx| self.get(idx))
    }

    /// Calibrations of every arch in index order, read without the images.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or a calibration is
    /// missing.
    pub fn ponis(&self) -> Result<Vec<Poni>> {
        if self.index.is_empty() {
            return Ok(Vec::new());
        }
        let _guard = self.file_lock.lock();
        let file = safe_open(&self.data_file, OpenMode::Read, DEFAULT_TRIES)?;
        self.index
            .iter()
            .map(|&idx| {
                let group = arch_group(&file, &self.root, idx)?.ok_or(Error::ArchNotFound(idx))?;
                Ok(load_record(&group, "poni")?)
            })
            .collect()
    }

    /// Shared file lock.
    #[must_use]
    pub fn file_lock(&self) -> FileLock {
        Arc::clone(&self.file_lock)
    }
}
