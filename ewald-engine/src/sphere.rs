//! A full scan: arches, scan table and running aggregates.
//!
//! All mutable state sits behind one mutex. Operations that touch arches
//! take it first, then the arch lock, then the file lock, so the three are
//! always acquired in the same order.

use crate::arch::{index_list, mask_value, EwaldArch, FileLock};
use crate::error::{Error, Result};
use crate::series::ArchSeries;
use crate::state::SphereStatus;
use ewald_algorithms::{Frame, MultiGeometry};
use ewald_core::{
    IntData1D, IntData2D, IntData2DStatic, Integrate1dArgs, Integrate2dArgs, Integration2D,
    MultiGeometryArgs, Poni, ScanTable,
};
use ewald_io::{
    data_to_h5, h5_to_data, h5_to_serialized, load_record, read_scalar_node, read_str_attr,
    read_str_node, require_group, safe_open, save_record, set_str_attr, H5Group, H5Value,
    OpenMode, DEFAULT_TRIES,
};
use ndarray::Array2;
use parking_lot::{Mutex, ReentrantMutex};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Value of the `type` attribute on a sphere group.
pub const SPHERE_TYPE: &str = "EwaldSphere";

/// Flags for [`EwaldSphere::add_arch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddArchOptions {
    /// Integrate the arch with the sphere's arguments before storing it.
    pub calculate: bool,
    /// Add the arch's integrations to the aggregates.
    pub update: bool,
    /// Append the arch's scan info to the scan table.
    pub get_sd: bool,
    /// Rebuild the multi-geometry integrator.
    pub set_mg: bool,
}

impl Default for AddArchOptions {
    fn default() -> Self {
        Self {
            calculate: true,
            update: true,
            get_sd: true,
            set_mg: true,
        }
    }
}

impl AddArchOptions {
    #[must_use]
    pub fn with_calculate(mut self, calculate: bool) -> Self {
        self.calculate = calculate;
        self
    }

    #[must_use]
    pub fn with_update(mut self, update: bool) -> Self {
        self.update = update;
        self
    }

    #[must_use]
    pub fn with_scan_data(mut self, get_sd: bool) -> Self {
        self.get_sd = get_sd;
        self
    }

    #[must_use]
    pub fn with_multi_geometry(mut self, set_mg: bool) -> Self {
        self.set_mg = set_mg;
        self
    }
}

#[derive(Debug)]
struct SphereData {
    data_file: PathBuf,
    arches: ArchSeries,
    scan_data: ScanTable,
    global_mask: Option<Vec<usize>>,
    mg_args: MultiGeometryArgs,
    bai_1d_args: Integrate1dArgs,
    bai_2d_args: Integrate2dArgs,
    bai_1d: IntData1D,
    bai_2d: Integration2D,
    mgi_1d: IntData1D,
    mgi_2d: IntData2D,
    multi_geo: Option<MultiGeometry>,
    overall_raw: Option<Array2<f64>>,
    static_scan: bool,
    gi: bool,
    th_mtr: String,
    single_img: bool,
    poni: Option<Poni>,
    status: SphereStatus,
}

/// A scan backed by one HDF5 file.
#[derive(Debug)]
pub struct EwaldSphere {
    name: String,
    file_lock: FileLock,
    data: Mutex<SphereData>,
}

impl EwaldSphere {
    /// Creates an in-memory sphere named `name` over `data_file`. Nothing is
    /// written until [`create`](Self::create) or a save.
    pub fn new(name: impl Into<String>, data_file: impl Into<PathBuf>) -> Self {
        let name = name.into();
        let data_file = data_file.into();
        let file_lock: FileLock = Arc::new(ReentrantMutex::new(()));
        let arches = ArchSeries::new(&data_file, &name, Arc::clone(&file_lock));
        Self {
            file_lock,
            data: Mutex::new(SphereData {
                data_file,
                arches,
                scan_data: ScanTable::new(),
                global_mask: None,
                mg_args: MultiGeometryArgs::default(),
                bai_1d_args: Integrate1dArgs::default(),
                bai_2d_args: Integrate2dArgs::default(),
                bai_1d: IntData1D::default(),
                bai_2d: Integration2D::empty(false),
                mgi_1d: IntData1D::default(),
                mgi_2d: IntData2D::default(),
                multi_geo: None,
                overall_raw: None,
                static_scan: false,
                gi: false,
                th_mtr: "th".to_string(),
                single_img: false,
                poni: None,
                status: SphereStatus::Empty,
            }),
            name,
        }
    }

    /// Sets the scan geometry.
    #[must_use]
    pub fn with_geometry(mut self, static_scan: bool, gi: bool) -> Self {
        let data = self.data.get_mut();
        data.static_scan = static_scan;
        data.gi = gi;
        data.arches.static_scan = static_scan;
        data.arches.gi = gi;
        data.bai_2d = Integration2D::empty(static_scan);
        self
    }

    #[must_use]
    pub fn with_th_mtr(mut self, th_mtr: impl Into<String>) -> Self {
        self.data.get_mut().th_mtr = th_mtr.into();
        self
    }

    #[must_use]
    pub fn with_single_img(mut self, single_img: bool) -> Self {
        self.data.get_mut().single_img = single_img;
        self
    }

    #[must_use]
    pub fn with_bai_1d_args(mut self, args: Integrate1dArgs) -> Self {
        self.data.get_mut().bai_1d_args = args;
        self
    }

    #[must_use]
    pub fn with_bai_2d_args(mut self, args: Integrate2dArgs) -> Self {
        self.data.get_mut().bai_2d_args = args;
        self
    }

    #[must_use]
    pub fn with_mg_args(mut self, args: MultiGeometryArgs) -> Self {
        self.data.get_mut().mg_args = args;
        self
    }

    #[must_use]
    pub fn with_global_mask(mut self, mask: Option<Vec<usize>>) -> Self {
        self.data.get_mut().global_mask = mask;
        self
    }

    #[must_use]
    pub fn with_poni(mut self, poni: Option<Poni>) -> Self {
        self.data.get_mut().poni = poni;
        self
    }

    /// Truncates the backing file and writes the full sphere state.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created or written.
    pub fn create(self) -> Result<Self> {
        {
            let data = self.data.lock();
            let _guard = self.file_lock.lock();
            drop(safe_open(&data.data_file, OpenMode::Create, DEFAULT_TRIES)?);
            self.save_locked(&data, false)?;
        }
        log::info!("created sphere {} in {}", self.name, self.data_file().display());
        Ok(self)
    }

    /// Loads the sphere `name` stored in `data_file`.
    ///
    /// # Errors
    /// Returns an error if the file or the sphere group does not exist.
    pub fn open(data_file: impl Into<PathBuf>, name: impl Into<String>) -> Result<Self> {
        let sphere = Self::new(name, data_file);
        sphere.load_from_h5(false)?;
        Ok(sphere)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared lock serializing access to the backing file.
    #[must_use]
    pub fn file_lock(&self) -> FileLock {
        Arc::clone(&self.file_lock)
    }

    #[must_use]
    pub fn data_file(&self) -> PathBuf {
        self.data.lock().data_file.clone()
    }

    #[must_use]
    pub fn status(&self) -> SphereStatus {
        self.data.lock().status
    }

    #[must_use]
    pub fn is_static(&self) -> bool {
        self.data.lock().static_scan
    }

    #[must_use]
    pub fn is_gi(&self) -> bool {
        self.data.lock().gi
    }

    #[must_use]
    pub fn th_mtr(&self) -> String {
        self.data.lock().th_mtr.clone()
    }

    /// Stored arch ids, ascending.
    #[must_use]
    pub fn arch_ids(&self) -> Vec<i64> {
        self.data.lock().arches.index().to_vec()
    }

    /// Reads arch `idx` from the backing file.
    ///
    /// # Errors
    /// Returns [`Error::ArchNotFound`] if no such arch is stored.
    pub fn get_arch(&self, idx: i64) -> Result<EwaldArch> {
        let data = self.data.lock();
        data.arches.get(idx)
    }

    /// Snapshot of the 1D aggregate.
    #[must_use]
    pub fn bai_1d(&self) -> IntData1D {
        self.data.lock().bai_1d.clone()
    }

    /// Snapshot of the 2D aggregate.
    #[must_use]
    pub fn bai_2d(&self) -> Integration2D {
        self.data.lock().bai_2d.clone()
    }

    /// Snapshot of the multi-geometry 1D result.
    #[must_use]
    pub fn mgi_1d(&self) -> IntData1D {
        self.data.lock().mgi_1d.clone()
    }

    /// Snapshot of the multi-geometry 2D result.
    #[must_use]
    pub fn mgi_2d(&self) -> IntData2D {
        self.data.lock().mgi_2d.clone()
    }

    #[must_use]
    pub fn scan_data(&self) -> ScanTable {
        self.data.lock().scan_data.clone()
    }

    /// Sum of `map_raw - bg_raw` over every added arch.
    #[must_use]
    pub fn overall_raw(&self) -> Option<Array2<f64>> {
        self.data.lock().overall_raw.clone()
    }

    #[must_use]
    pub fn bai_1d_args(&self) -> Integrate1dArgs {
        self.data.lock().bai_1d_args.clone()
    }

    #[must_use]
    pub fn bai_2d_args(&self) -> Integrate2dArgs {
        self.data.lock().bai_2d_args.clone()
    }

    #[must_use]
    pub fn mg_args(&self) -> MultiGeometryArgs {
        self.data.lock().mg_args.clone()
    }

    #[must_use]
    pub fn global_mask(&self) -> Option<Vec<usize>> {
        self.data.lock().global_mask.clone()
    }

    #[must_use]
    pub fn poni(&self) -> Option<Poni> {
        self.data.lock().poni.clone()
    }

    /// Number of geometries in the current multi-geometry integrator.
    #[must_use]
    pub fn multi_geo_len(&self) -> Option<usize> {
        self.data.lock().multi_geo.as_ref().map(MultiGeometry::len)
    }

    pub fn set_bai_1d_args(&self, args: Integrate1dArgs) {
        self.data.lock().bai_1d_args = args;
    }

    pub fn set_bai_2d_args(&self, args: Integrate2dArgs) {
        self.data.lock().bai_2d_args = args;
    }

    pub fn set_mg_args(&self, args: MultiGeometryArgs) {
        self.data.lock().mg_args = args;
    }

    pub fn set_global_mask(&self, mask: Option<Vec<usize>>) {
        self.data.lock().global_mask = mask;
    }

    pub fn set_th_mtr(&self, th_mtr: impl Into<String>) {
        self.data.lock().th_mtr = th_mtr.into();
    }

    pub fn set_poni(&self, poni: Option<Poni>) {
        self.data.lock().poni = poni;
    }

    /// Stores `arch` and folds it into the scan state.
    ///
    /// An arch whose id is already stored replaces the old one; the
    /// aggregates then still contain the old arch until a by-arch
    /// re-integration.
    ///
    /// Without `calculate`, an integration made with other arguments than
    /// the sphere's current ones, or in the other 2D geometry, is redone.
    /// Integrations that were never run are stored empty and left out of the
    /// aggregates.
    ///
    /// # Errors
    /// Returns an error if integration or persistence fails.
    pub fn add_arch(&self, mut arch: EwaldArch, options: AddArchOptions) -> Result<()> {
        let mut guard = self.data.lock();
        let data = &mut *guard;
        arch.static_scan = data.static_scan;
        arch.gi = data.gi;
        arch.th_mtr.clone_from(&data.th_mtr);
        let mask = data.global_mask.as_deref();
        match &arch.ai_args.integrate_1d {
            Some(args) if !options.calculate && *args == data.bai_1d_args => {}
            None if !options.calculate => arch.int_1d = IntData1D::default(),
            _ => arch.integrate_1d(&data.bai_1d_args, mask)?,
        }
        let geometry_matches = arch.int_2d.is_static() == data.static_scan;
        match &arch.ai_args.integrate_2d {
            Some(args) if !options.calculate && *args == data.bai_2d_args && geometry_matches => {}
            None if !options.calculate => arch.int_2d = Integration2D::empty(data.static_scan),
            _ => arch.integrate_2d(&data.bai_2d_args, mask)?,
        }
        arch.bind_file_lock(&self.file_lock);
        data.arches.set(&mut arch)?;
        data.arches.sort_index();

        if options.get_sd && !arch.scan_info.is_empty() {
            match data.scan_data.append_row(arch.idx, &arch.scan_info) {
                Ok(()) => {}
                Err(ewald_core::Error::MismatchedColumns { expected, found }) => {
                    log::warn!("Mismatched columns");
                    log::debug!("arch {}: expected {expected:?}, found {found:?}", arch.idx);
                }
                Err(e) => return Err(e.into()),
            }
        }
        accumulate_raw(data, &arch)?;
        self.with_root(&data.data_file, |root| {
            data_to_h5(&H5Value::DataFrame(data.scan_data.clone()), root, "scan_data")?;
            data_to_h5(&overall_raw_value(data.overall_raw.as_ref()), root, "overall_raw")?;
            Ok(())
        })?;

        if options.update {
            if arch.ai_args.integrate_1d.is_some() {
                self.update_bai_1d(data, &arch)?;
            }
            if arch.ai_args.integrate_2d.is_some() {
                self.update_bai_2d(data, &arch)?;
            }
        }
        if options.set_mg && !data.static_scan {
            set_multi_geo_locked(data)?;
        }
        if matches!(data.status, SphereStatus::Empty | SphereStatus::Closed) {
            data.status = SphereStatus::Accumulating;
        }
        log::debug!("sphere {}: added arch {}", self.name, arch.idx);
        Ok(())
    }

    /// Removes arch `idx` and its scan table row. Aggregates are left as
    /// they are.
    ///
    /// # Errors
    /// Returns an error if the file cannot be updated.
    pub fn remove_arch(&self, idx: i64) -> Result<bool> {
        let mut guard = self.data.lock();
        let data = &mut *guard;
        let removed = data.arches.remove(idx)?;
        if data.scan_data.remove(idx) {
            self.with_root(&data.data_file, |root| {
                data_to_h5(&H5Value::DataFrame(data.scan_data.clone()), root, "scan_data")?;
                Ok(())
            })?;
        }
        Ok(removed)
    }

    fn update_bai_1d(&self, data: &mut SphereData, arch: &EwaldArch) -> Result<()> {
        if !data.bai_1d.same_shape(&arch.int_1d) {
            log::info!(
                "bai_1d: reallocating from {} to {} bins",
                data.bai_1d.len(),
                arch.int_1d.len()
            );
            data.bai_1d = IntData1D::zeros(arch.int_1d.len());
        }
        data.bai_1d += &arch.int_1d;
        data.bai_1d.ttheta = arch.int_1d.ttheta.clone();
        data.bai_1d.q = arch.int_1d.q.clone();
        self.with_root(&data.data_file, |root| {
            save_record(root, "bai_1d", &data.bai_1d)?;
            Ok(())
        })
    }

    fn update_bai_2d(&self, data: &mut SphereData, arch: &EwaldArch) -> Result<()> {
        match (&mut data.bai_2d, &arch.int_2d) {
            (Integration2D::Scanning(agg), Integration2D::Scanning(new)) if agg.same_shape(new) => {
                *agg += new;
            }
            (Integration2D::Static(agg), Integration2D::Static(new)) if agg.same_shape(new) => {
                *agg += new;
            }
            (agg, new) => {
                log::info!("bai_2d: reallocating from {:?} to {:?}", agg.shape(), new.shape());
                *agg = match new {
                    Integration2D::Scanning(new) => {
                        let mut zeros = IntData2D::zeros(new.shape());
                        zeros += new;
                        Integration2D::Scanning(zeros)
                    }
                    Integration2D::Static(new) => {
                        let mut zeros = IntData2DStatic::zeros_like(new);
                        zeros += new;
                        Integration2D::Static(zeros)
                    }
                };
            }
        }
        match (&mut data.bai_2d, &arch.int_2d) {
            (Integration2D::Scanning(agg), Integration2D::Scanning(new)) => {
                agg.ttheta = new.ttheta.clone();
                agg.q = new.q.clone();
                agg.chi = new.chi.clone();
            }
            (Integration2D::Static(agg), Integration2D::Static(new)) => {
                agg.ttheta = new.ttheta.clone();
                agg.q = new.q.clone();
                agg.chi = new.chi.clone();
                agg.qxy = new.qxy.clone();
                agg.qz = new.qz.clone();
                agg.q_from_tth = new.q_from_tth;
                agg.tth_from_q = new.tth_from_q;
            }
            _ => {}
        }
        self.with_root(&data.data_file, |root| {
            save_record(root, "bai_2d", &data.bai_2d)?;
            Ok(())
        })
    }

    /// Re-integrates every arch in 1D with `args` and rebuilds `bai_1d`.
    ///
    /// # Errors
    /// Returns the first integration or persistence error; the status
    /// returns to accumulating either way.
    pub fn by_arch_integrate_1d(&self, args: Integrate1dArgs) -> Result<()> {
        let mut guard = self.data.lock();
        let data = &mut *guard;
        data.status = SphereStatus::Reintegrating;
        data.bai_1d_args = args;
        data.bai_1d = IntData1D::default();

        let result = self.reintegrate_1d(data);
        data.status = settled_status(data);
        log::info!("sphere {}: re-integrated {} arches in 1D", self.name, data.arches.len());
        result
    }

    /// Re-integrates every arch in 2D with `args` and rebuilds `bai_2d`.
    ///
    /// # Errors
    /// See [`by_arch_integrate_1d`](Self::by_arch_integrate_1d).
    pub fn by_arch_integrate_2d(&self, args: Integrate2dArgs) -> Result<()> {
        let mut guard = self.data.lock();
        let data = &mut *guard;
        data.status = SphereStatus::Reintegrating;
        data.bai_2d_args = args;
        data.bai_2d = Integration2D::empty(data.static_scan);

        let result = self.reintegrate_2d(data);
        data.status = settled_status(data);
        log::info!("sphere {}: re-integrated {} arches in 2D", self.name, data.arches.len());
        result
    }

    fn reintegrate_1d(&self, data: &mut SphereData) -> Result<()> {
        for idx in data.arches.index().to_vec() {
            let mut arch = data.arches.get(idx)?;
            arch.integrate_1d(&data.bai_1d_args, data.global_mask.as_deref())?;
            data.arches.set(&mut arch)?;
            self.update_bai_1d(data, &arch)?;
        }
        self.with_root(&data.data_file, |root| {
            data_to_h5(&json_value(&data.bai_1d_args)?, root, "bai_1d_args")?;
            Ok(())
        })
    }

    fn reintegrate_2d(&self, data: &mut SphereData) -> Result<()> {
        for idx in data.arches.index().to_vec() {
            let mut arch = data.arches.get(idx)?;
            arch.integrate_2d(&data.bai_2d_args, data.global_mask.as_deref())?;
            data.arches.set(&mut arch)?;
            self.update_bai_2d(data, &arch)?;
        }
        self.with_root(&data.data_file, |root| {
            data_to_h5(&json_value(&data.bai_2d_args)?, root, "bai_2d_args")?;
            Ok(())
        })
    }

    /// Rebuilds the multi-geometry integrator from the stored calibrations.
    /// Does nothing for static scans.
    ///
    /// # Errors
    /// Returns an error if a calibration cannot be read.
    pub fn set_multi_geo(&self) -> Result<()> {
        let mut guard = self.data.lock();
        set_multi_geo_locked(&mut guard)
    }

    /// Integrates every arch onto the common 1D grid of `mg_args` into
    /// `mgi_1d`. Does nothing for static scans.
    ///
    /// # Errors
    /// Returns an error if an arch cannot be read or integrated.
    pub fn multigeometry_integrate_1d(&self) -> Result<()> {
        let mut guard = self.data.lock();
        let data = &mut *guard;
        if data.static_scan {
            return Ok(());
        }
        let Some((mg, images, masks)) = multi_geo_frames(data)? else {
            return Ok(());
        };
        let frames: Vec<Frame<'_>> = images.iter().zip(&masks).map(|(i, m)| (i.view(), Some(m))).collect();
        let result = mg.integrate1d(&frames)?;
        let wavelength = mg.ponis()[0].wavelength;
        data.mgi_1d = IntData1D::from_result(&result, wavelength, None);
        data.multi_geo = Some(mg);
        self.with_root(&data.data_file, |root| {
            save_record(root, "mgi_1d", &data.mgi_1d)?;
            Ok(())
        })
    }

    /// Integrates every arch onto the common 2D grid of `mg_args` into
    /// `mgi_2d`. Does nothing for static scans.
    ///
    /// # Errors
    /// Returns an error if an arch cannot be read or integrated.
    pub fn multigeometry_integrate_2d(&self) -> Result<()> {
        let mut guard = self.data.lock();
        let data = &mut *guard;
        if data.static_scan {
            return Ok(());
        }
        let Some((mg, images, masks)) = multi_geo_frames(data)? else {
            return Ok(());
        };
        let frames: Vec<Frame<'_>> = images.iter().zip(&masks).map(|(i, m)| (i.view(), Some(m))).collect();
        let result = mg.integrate2d(&frames)?;
        let wavelength = mg.ponis()[0].wavelength;
        data.mgi_2d = IntData2D::from_result(&result, wavelength, None);
        data.multi_geo = Some(mg);
        self.with_root(&data.data_file, |root| {
            save_record(root, "mgi_2d", &data.mgi_2d)?;
            Ok(())
        })
    }

    /// Clears the in-memory scan state and closes the sphere. The backing
    /// file is left untouched.
    pub fn reset(&self) {
        let mut data = self.data.lock();
        data.arches.clear();
        data.scan_data.clear();
        data.bai_1d = IntData1D::default();
        data.bai_2d = Integration2D::empty(data.static_scan);
        data.mgi_1d = IntData1D::default();
        data.mgi_2d = IntData2D::default();
        data.multi_geo = None;
        data.overall_raw = None;
        data.status = SphereStatus::Closed;
    }

    /// Writes the sphere state to the backing file. Arches are written by
    /// [`add_arch`](Self::add_arch) and are not rewritten here.
    ///
    /// With `data_only`, only the scan table, the global mask, the summed
    /// image and the aggregates are written.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or written.
    pub fn save_to_h5(&self, data_only: bool) -> Result<()> {
        let data = self.data.lock();
        self.save_locked(&data, data_only)
    }

    fn save_locked(&self, data: &SphereData, data_only: bool) -> Result<()> {
        self.with_root(&data.data_file, |root| {
            data_to_h5(&H5Value::DataFrame(data.scan_data.clone()), root, "scan_data")?;
            data_to_h5(&mask_value(data.global_mask.as_deref()), root, "global_mask")?;
            data_to_h5(&overall_raw_value(data.overall_raw.as_ref()), root, "overall_raw")?;
            if !data_only {
                data_to_h5(&json_value(&data.mg_args)?, root, "mg_args")?;
                data_to_h5(&json_value(&data.bai_1d_args)?, root, "bai_1d_args")?;
                data_to_h5(&json_value(&data.bai_2d_args)?, root, "bai_2d_args")?;
                data_to_h5(&H5Value::from(data.static_scan), root, "static")?;
                data_to_h5(&H5Value::from(data.gi), root, "gi")?;
                data_to_h5(&H5Value::from(data.single_img), root, "single_img")?;
                data_to_h5(&H5Value::from(data.th_mtr.as_str()), root, "th_mtr")?;
                let poni = match &data.poni {
                    Some(poni) => H5Value::from_json(&serde_json::Value::Object(poni.to_dict())),
                    None => H5Value::None,
                };
                data_to_h5(&poni, root, "poni_dict")?;
            }
            save_record(root, "bai_1d", &data.bai_1d)?;
            save_record(root, "bai_2d", &data.bai_2d)?;
            if !data.static_scan {
                save_record(root, "mgi_1d", &data.mgi_1d)?;
                save_record(root, "mgi_2d", &data.mgi_2d)?;
            }
            require_group(root, "arches")?;
            Ok(())
        })
    }

    /// Replaces the in-memory state with what the backing file holds.
    ///
    /// # Errors
    /// Returns an error if the file or the sphere group is missing or
    /// malformed.
    pub fn load_from_h5(&self, data_only: bool) -> Result<()> {
        let mut guard = self.data.lock();
        self.load_locked(&mut guard, data_only)
    }

    fn load_locked(&self, data: &mut SphereData, data_only: bool) -> Result<()> {
        {
            let _guard = self.file_lock.lock();
            let file = safe_open(&data.data_file, OpenMode::Read, DEFAULT_TRIES)?;
            if !file.link_exists(&self.name) {
                return Err(Error::InvalidState(format!(
                    "{} holds no sphere named {}",
                    data.data_file.display(),
                    self.name
                )));
            }
            let root = file.group(&self.name)?;
            if let Some(kind) = read_str_attr(&root, "type")? {
                if kind != SPHERE_TYPE {
                    return Err(Error::InvalidState(format!("{} is a {kind}", self.name)));
                }
            }

            data.scan_data = match optional(h5_to_data(&root, "scan_data"))? {
                Some(H5Value::DataFrame(table)) => table,
                _ => ScanTable::new(),
            };
            data.global_mask = optional(h5_to_data(&root, "global_mask"))?
                .as_ref()
                .and_then(index_list);
            data.overall_raw = match optional(h5_to_data(&root, "overall_raw"))? {
                Some(H5Value::Array(_)) => Some(ewald_io::read_array2(&root, "overall_raw")?),
                _ => None,
            };
            if !data_only {
                if let Some(args) = optional(h5_to_serialized(&root, "mg_args"))? {
                    data.mg_args = args;
                }
                if let Some(args) = optional(h5_to_serialized(&root, "bai_1d_args"))? {
                    data.bai_1d_args = args;
                }
                if let Some(args) = optional(h5_to_serialized(&root, "bai_2d_args"))? {
                    data.bai_2d_args = args;
                }
                data.static_scan = read_flag(&root, "static")?;
                data.gi = read_flag(&root, "gi")?;
                data.single_img = read_flag(&root, "single_img")?;
                if let Some(th_mtr) = optional(read_str_node(&root, "th_mtr"))? {
                    data.th_mtr = th_mtr;
                }
                data.poni = match optional(h5_to_data(&root, "poni_dict"))? {
                    Some(value @ H5Value::Dict(_)) => match value.to_json()? {
                        serde_json::Value::Object(map) => Some(Poni::from_dict(&map)?),
                        _ => None,
                    },
                    _ => None,
                };
            }
            data.bai_1d = optional(load_record(&root, "bai_1d"))?.unwrap_or_default();
            data.bai_2d = optional(load_record(&root, "bai_2d"))?
                .unwrap_or_else(|| Integration2D::empty(data.static_scan));
            if !data.static_scan {
                data.mgi_1d = optional(load_record(&root, "mgi_1d"))?.unwrap_or_default();
                data.mgi_2d = optional(load_record(&root, "mgi_2d"))?.unwrap_or_default();
            }
        }

        data.arches.static_scan = data.static_scan;
        data.arches.gi = data.gi;
        data.arches.set_data_file(&data.data_file);
        data.arches.refresh_index()?;
        data.multi_geo = None;
        data.status = settled_status(data);
        log::debug!(
            "sphere {}: loaded {} arches from {}",
            self.name,
            data.arches.len(),
            data.data_file.display()
        );
        Ok(())
    }

    /// Switches the backing file.
    ///
    /// If `path` exists and `keep_current_data` is false the sphere is
    /// loaded from it. Otherwise `path` is truncated and the current state,
    /// arches included, is written to it.
    ///
    /// # Errors
    /// Returns an error if either file cannot be read or written.
    pub fn set_datafile(&self, path: impl AsRef<Path>, keep_current_data: bool) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        let mut guard = self.data.lock();
        let data = &mut *guard;
        if path.exists() && !keep_current_data {
            data.data_file = path;
            return self.load_locked(data, false);
        }

        if path == data.data_file {
            return self.save_locked(data, false);
        }
        {
            let _guard = self.file_lock.lock();
            drop(safe_open(&path, OpenMode::Create, DEFAULT_TRIES)?);
        }
        let old_file = std::mem::replace(&mut data.data_file, path);
        data.arches.set_data_file(&data.data_file);
        self.save_locked(data, false)?;
        let copied = copy_arches(data, &old_file);
        data.arches.set_data_file(&data.data_file);
        copied
    }

    /// Opens the backing file and runs `write` on the sphere group, creating
    /// it when absent.
    fn with_root<F>(&self, data_file: &Path, write: F) -> Result<()>
    where
        F: FnOnce(&H5Group) -> Result<()>,
    {
        let _guard = self.file_lock.lock();
        let file = safe_open(data_file, OpenMode::Append, DEFAULT_TRIES)?;
        let root = require_group(&file, &self.name)?;
        set_str_attr(&root, "type", SPHERE_TYPE)?;
        write(&root)
    }
}

/// Copies every arch from `from` into the current data file, one at a time.
fn copy_arches(data: &mut SphereData, from: &Path) -> Result<()> {
    for idx in data.arches.index().to_vec() {
        data.arches.set_data_file(from);
        let mut arch = data.arches.get(idx)?;
        data.arches.set_data_file(&data.data_file);
        data.arches.set(&mut arch)?;
    }
    Ok(())
}

fn settled_status(data: &SphereData) -> SphereStatus {
    if data.arches.is_empty() {
        SphereStatus::Empty
    } else {
        SphereStatus::Accumulating
    }
}

fn accumulate_raw(data: &mut SphereData, arch: &EwaldArch) -> Result<()> {
    let image = arch.background_subtracted()?;
    match &mut data.overall_raw {
        Some(total) if total.dim() == image.dim() => *total += &image,
        other => {
            if let Some(total) = other {
                log::info!(
                    "overall_raw: reallocating from {:?} to {:?}",
                    total.dim(),
                    image.dim()
                );
            }
            *other = Some(image);
        }
    }
    Ok(())
}

fn set_multi_geo_locked(data: &mut SphereData) -> Result<()> {
    if data.static_scan {
        return Ok(());
    }
    let ponis = data.arches.ponis()?;
    data.multi_geo = Some(MultiGeometry::new(ponis, data.mg_args.clone()));
    Ok(())
}

type FrameSet = (MultiGeometry, Vec<Array2<f64>>, Vec<Array2<bool>>);

/// Reads every arch once, taking each calibration and frame from the same
/// read so the two lists always line up.
fn multi_geo_frames(data: &SphereData) -> Result<Option<FrameSet>> {
    if data.arches.is_empty() {
        return Ok(None);
    }
    let mut ponis = Vec::with_capacity(data.arches.len());
    let mut images = Vec::with_capacity(data.arches.len());
    let mut masks = Vec::with_capacity(data.arches.len());
    for arch in data.arches.iter() {
        let arch = arch?;
        images.push(arch.corrected_image()?);
        masks.push(arch.pixel_mask(data.global_mask.as_deref()));
        ponis.push(arch.poni);
    }
    Ok(Some((
        MultiGeometry::new(ponis, data.mg_args.clone()),
        images,
        masks,
    )))
}

fn overall_raw_value(raw: Option<&Array2<f64>>) -> H5Value {
    raw.map_or(H5Value::from(0.0), |raw| H5Value::Array(raw.clone().into_dyn()))
}

fn json_value<T: Serialize>(value: &T) -> Result<H5Value> {
    Ok(H5Value::from_json(&serde_json::to_value(value)?))
}

fn read_flag(root: &H5Group, key: &str) -> Result<bool> {
    Ok(optional(read_scalar_node(root, key))?.is_some_and(|s| s.as_bool()))
}

/// Maps a missing node to `None`.
fn optional<T>(result: ewald_io::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(ewald_io::Error::MissingNode(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ewald_core::{Detector, RadialUnit};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn poni() -> Poni {
        Poni {
            dist: 0.1,
            poni1: 0.0,
            poni2: 0.0,
            rot1: 0.0,
            rot2: 0.0,
            rot3: 0.0,
            wavelength: 1e-10,
            detector: Detector::new("test", 1e-4, 1e-4, (24, 24)),
        }
    }

    fn arch(idx: i64, value: f64) -> EwaldArch {
        let info = BTreeMap::from([("i0".to_string(), 1.0), ("x".to_string(), idx as f64)]);
        EwaldArch::new(idx, Array2::from_elem((24, 24), value), poni()).with_scan_info(info)
    }

    fn sphere(path: &Path) -> EwaldSphere {
        EwaldSphere::new("scan", path)
            .with_bai_1d_args(Integrate1dArgs::default().with_numpoints(30).with_solid_angle(false))
            .with_bai_2d_args(Integrate2dArgs::default().with_bins(16, 8))
            .create()
            .unwrap()
    }

    #[test]
    fn test_status_transitions() {
        let dir = tempdir().unwrap();
        let sphere = sphere(&dir.path().join("scan.h5"));
        assert_eq!(sphere.status(), SphereStatus::Empty);
        sphere.add_arch(arch(0, 1.0), AddArchOptions::default()).unwrap();
        assert_eq!(sphere.status(), SphereStatus::Accumulating);
        sphere
            .by_arch_integrate_1d(Integrate1dArgs::default().with_numpoints(12))
            .unwrap();
        assert_eq!(sphere.status(), SphereStatus::Accumulating);
        sphere.reset();
        assert_eq!(sphere.status(), SphereStatus::Closed);
        assert!(sphere.arch_ids().is_empty());
    }

    #[test]
    fn test_aggregate_is_sum_of_arches() {
        let dir = tempdir().unwrap();
        let sphere = sphere(&dir.path().join("scan.h5"));
        sphere.add_arch(arch(1, 2.0), AddArchOptions::default()).unwrap();
        sphere.add_arch(arch(0, 3.0), AddArchOptions::default()).unwrap();
        assert_eq!(sphere.arch_ids(), vec![0, 1]);

        let a = sphere.get_arch(0).unwrap();
        let b = sphere.get_arch(1).unwrap();
        let bai = sphere.bai_1d();
        assert_eq!(bai.raw.full(), &a.int_1d.raw.full() + &b.int_1d.raw.full());
        assert_eq!(bai.pcount.full(), &a.int_1d.pcount.full() + &b.int_1d.pcount.full());
        let raw = sphere.overall_raw().unwrap();
        assert_relative_eq!(raw[[3, 3]], 5.0);
        assert_eq!(sphere.scan_data().loc(1, "x"), Some(1.0));
    }

    #[test]
    fn test_static_aggregate_keeps_geometry_without_calculate() {
        let dir = tempdir().unwrap();
        let sphere = EwaldSphere::new("scan", dir.path().join("scan.h5"))
            .with_bai_1d_args(Integrate1dArgs::default().with_numpoints(30))
            .with_bai_2d_args(Integrate2dArgs::default().with_bins(16, 8))
            .with_geometry(true, false)
            .create()
            .unwrap();
        sphere.add_arch(arch(0, 1.0), AddArchOptions::default()).unwrap();
        assert!(sphere.bai_2d().is_static());
        let filled = sphere.bai_1d();

        // A bare arch carries a scanning 2D container and no integrations.
        let bare = arch(1, 1.0);
        assert!(!bare.int_2d.is_static());
        sphere
            .add_arch(bare, AddArchOptions::default().with_calculate(false))
            .unwrap();
        assert!(sphere.bai_2d().is_static());
        assert_eq!(sphere.bai_2d().shape(), (8, 16));
        assert_eq!(sphere.bai_1d(), filled);
        assert!(sphere.get_arch(1).unwrap().int_2d.is_static());

        // Integrated in the wrong geometry: redone as static.
        let mut scanning = arch(2, 1.0);
        scanning.integrate_2d(&sphere.bai_2d_args(), None).unwrap();
        sphere
            .add_arch(scanning, AddArchOptions::default().with_calculate(false))
            .unwrap();
        assert!(sphere.bai_2d().is_static());
        assert!(sphere.get_arch(2).unwrap().int_2d.is_static());
    }

    #[test]
    fn test_stale_integration_is_redone_on_add() {
        let dir = tempdir().unwrap();
        let sphere = sphere(&dir.path().join("scan.h5"));
        sphere.add_arch(arch(0, 1.0), AddArchOptions::default()).unwrap();

        // Integrated with the old arguments, then the sphere is re-binned
        // before the arch is added.
        let mut late = arch(1, 2.0);
        late.integrate_1d(&sphere.bai_1d_args(), None).unwrap();
        late.integrate_2d(&sphere.bai_2d_args(), None).unwrap();
        sphere
            .by_arch_integrate_1d(Integrate1dArgs::default().with_numpoints(45))
            .unwrap();
        let rebuilt = sphere.get_arch(0).unwrap().int_1d;
        sphere
            .add_arch(late, AddArchOptions::default().with_calculate(false))
            .unwrap();

        let stored = sphere.get_arch(1).unwrap();
        assert_eq!(stored.int_1d.len(), 45);
        assert_eq!(stored.ai_args.integrate_1d, Some(sphere.bai_1d_args()));
        let bai = sphere.bai_1d();
        assert_eq!(bai.len(), 45);
        assert_eq!(bai.raw.full(), &rebuilt.raw.full() + &stored.int_1d.raw.full());
    }

    #[test]
    fn test_mismatched_columns_skip_row() {
        let dir = tempdir().unwrap();
        let sphere = sphere(&dir.path().join("scan.h5"));
        sphere.add_arch(arch(0, 1.0), AddArchOptions::default()).unwrap();
        let odd = arch(1, 1.0).with_scan_info(BTreeMap::from([("y".to_string(), 2.0)]));
        sphere.add_arch(odd, AddArchOptions::default()).unwrap();
        assert_eq!(sphere.arch_ids(), vec![0, 1]);
        assert_eq!(sphere.scan_data().index(), &[0]);
    }

    #[test]
    fn test_reintegration_reallocates_aggregate() {
        let dir = tempdir().unwrap();
        let sphere = sphere(&dir.path().join("scan.h5"));
        for idx in 0..3 {
            sphere.add_arch(arch(idx, 1.0), AddArchOptions::default()).unwrap();
        }
        assert_eq!(sphere.bai_1d().len(), 30);
        let args = Integrate1dArgs::default()
            .with_numpoints(50)
            .with_unit(RadialUnit::QInvAngstrom);
        sphere.by_arch_integrate_1d(args.clone()).unwrap();
        assert_eq!(sphere.bai_1d().len(), 50);
        assert_eq!(sphere.bai_1d_args(), args);
        assert_eq!(sphere.get_arch(2).unwrap().int_1d.len(), 50);

        sphere
            .by_arch_integrate_2d(Integrate2dArgs::default().with_bins(20, 4))
            .unwrap();
        assert_eq!(sphere.bai_2d().shape(), (4, 20));
    }

    #[test]
    fn test_multi_geometry_scanning_only() {
        let dir = tempdir().unwrap();
        let sphere = sphere(&dir.path().join("scan.h5"));
        sphere.set_mg_args(MultiGeometryArgs {
            radial_range: [0.0, 20.0],
            npt: 40,
            ..MultiGeometryArgs::default()
        });
        for idx in 0..2 {
            sphere.add_arch(arch(idx, 1.0), AddArchOptions::default()).unwrap();
        }
        assert_eq!(sphere.multi_geo_len(), Some(2));
        sphere.multigeometry_integrate_1d().unwrap();
        assert_eq!(sphere.mgi_1d().len(), 40);

        let static_dir = tempdir().unwrap();
        let stat = EwaldSphere::new("scan", static_dir.path().join("s.h5"))
            .with_geometry(true, false)
            .create()
            .unwrap();
        stat.add_arch(arch(0, 1.0), AddArchOptions::default()).unwrap();
        assert_eq!(stat.multi_geo_len(), None);
        stat.multigeometry_integrate_1d().unwrap();
        assert!(stat.mgi_1d().is_empty());
    }

    #[test]
    fn test_set_datafile_copies_arches() {
        let dir = tempdir().unwrap();
        let sphere = sphere(&dir.path().join("a.h5"));
        for idx in [4, 1, 9] {
            sphere.add_arch(arch(idx, 1.0), AddArchOptions::default()).unwrap();
        }
        let moved = dir.path().join("b.h5");
        sphere.set_datafile(&moved, true).unwrap();
        assert_eq!(sphere.data_file(), moved);

        let reopened = EwaldSphere::open(&moved, "scan").unwrap();
        assert_eq!(reopened.arch_ids(), vec![1, 4, 9]);
        assert_eq!(reopened.bai_1d(), sphere.bai_1d());
        let original = EwaldSphere::open(dir.path().join("a.h5"), "scan").unwrap();
        for idx in [1, 4, 9] {
            let copied = reopened.get_arch(idx).unwrap();
            assert_eq!(copied.int_1d, original.get_arch(idx).unwrap().int_1d);
        }

        // Keeping data on the current file leaves its arches in place.
        sphere.set_datafile(&moved, true).unwrap();
        assert_eq!(EwaldSphere::open(&moved, "scan").unwrap().arch_ids(), vec![1, 4, 9]);
    }

    #[test]
    fn test_open_missing_sphere() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scan.h5");
        sphere(&path);
        assert!(matches!(
            EwaldSphere::open(&path, "other"),
            Err(Error::InvalidState(_))
        ));
    }
}
