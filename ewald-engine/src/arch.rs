//! A single detector image at one scan point.
//!
//! An arch owns the raw image, its calibration and scan readings, and the
//! 1D and 2D integrations computed from them. It is persisted as one group
//! under `<sphere>/arches/<idx>` in the backing file.

use crate::error::{Error, Result};
use ewald_algorithms::{AzimuthalIntegrator, GrazingIntegrator};
use ewald_core::units::tth_to_q;
use ewald_core::{
    AzimuthalIntegration, GrazingTransform, IntData1D, IntData2D, IntData2DStatic,
    Integrate1dArgs, Integrate2dArgs, Integration2D, Poni, RadialUnit, TransformProcess,
    TransformRequest,
};
use ewald_io::{
    data_to_h5, h5_to_data, h5_to_serialized, load_record, read_scalar_node, read_str_attr,
    require_group, safe_open, save_record, serialized_to_h5, set_str_attr, H5Group, H5Value,
    OpenMode, Scalar, TextFormat, DEFAULT_TRIES,
};
use ndarray::{Array2, ArrayD, IxDyn};
use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Value of the `type` attribute on an arch group.
pub const ARCH_TYPE: &str = "EwaldArch";

/// Shared lock serializing access to a backing file.
pub type FileLock = Arc<ReentrantMutex<()>>;

/// Integration settings last applied to an arch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchArgs {
    pub integrate_1d: Option<Integrate1dArgs>,
    pub integrate_2d: Option<Integrate2dArgs>,
}

/// One image with its calibration, readings and integrations.
#[derive(Debug, Clone)]
pub struct EwaldArch {
    /// Id, unique within the owning sphere.
    pub idx: i64,
    pub map_raw: Array2<f64>,
    /// Background subtracted before integration; absent means zero.
    pub bg_raw: Option<Array2<f64>>,
    /// Flat indices of excluded pixels. Filled from the negative pixels of
    /// `map_raw` on first integration when absent.
    pub mask: Option<Vec<usize>>,
    /// Monitor normalization applied to the image.
    pub map_norm: f64,
    /// Motor and counter readings.
    pub scan_info: BTreeMap<String, f64>,
    pub poni: Poni,
    pub poni_file: Option<PathBuf>,
    pub ai_args: ArchArgs,
    pub int_1d: IntData1D,
    pub int_2d: Integration2D,
    /// Grazing-incidence geometry.
    pub gi: bool,
    /// Detector not swept during the scan.
    pub static_scan: bool,
    /// Scan-info key holding the incident angle in grazing mode.
    pub th_mtr: String,
    /// Sample tilt about the beam, degrees.
    pub tilt_angle: f64,
    /// Sample orientation (1–4) for the grazing transform.
    pub sample_orientation: u8,
    arch_lock: Arc<Mutex<()>>,
    file_lock: FileLock,
}

impl EwaldArch {
    /// Creates an arch with no integrations yet.
    #[must_use]
    pub fn new(idx: i64, map_raw: Array2<f64>, poni: Poni) -> Self {
        Self {
            idx,
            map_raw,
            bg_raw: None,
            mask: None,
            map_norm: 1.0,
            scan_info: BTreeMap::new(),
            poni,
            poni_file: None,
            ai_args: ArchArgs::default(),
            int_1d: IntData1D::default(),
            int_2d: Integration2D::empty(false),
            gi: false,
            static_scan: false,
            th_mtr: "th".to_string(),
            tilt_angle: 0.0,
            sample_orientation: 1,
            arch_lock: Arc::new(Mutex::new(())),
            file_lock: Arc::new(ReentrantMutex::new(())),
        }
    }

    #[must_use]
    pub fn with_scan_info(mut self, scan_info: BTreeMap<String, f64>) -> Self {
        self.scan_info = scan_info;
        self
    }

    #[must_use]
    pub fn with_mask(mut self, mask: Option<Vec<usize>>) -> Self {
        self.mask = mask;
        self
    }

    #[must_use]
    pub fn with_background(mut self, bg_raw: Option<Array2<f64>>) -> Self {
        self.bg_raw = bg_raw;
        self
    }

    #[must_use]
    pub fn with_poni_file(mut self, path: Option<PathBuf>) -> Self {
        self.poni_file = path;
        self
    }

    /// Sets the scan geometry; the 2D container follows `static_scan`.
    #[must_use]
    pub fn with_geometry(mut self, static_scan: bool, gi: bool) -> Self {
        self.static_scan = static_scan;
        self.gi = gi;
        self.int_2d = Integration2D::empty(static_scan);
        self
    }

    #[must_use]
    pub fn with_th_mtr(mut self, th_mtr: impl Into<String>) -> Self {
        self.th_mtr = th_mtr.into();
        self
    }

    #[must_use]
    pub fn with_tilt_angle(mut self, degrees: f64) -> Self {
        self.tilt_angle = degrees;
        self
    }

    #[must_use]
    pub fn with_sample_orientation(mut self, orientation: u8) -> Self {
        self.sample_orientation = orientation;
        self
    }

    /// Shares `lock` as this arch's file lock.
    pub fn bind_file_lock(&mut self, lock: &FileLock) {
        self.file_lock = Arc::clone(lock);
    }

    /// Integrates the image into `int_1d`.
    ///
    /// `global_mask` holds flat pixel indices excluded in addition to the
    /// arch's own mask.
    ///
    /// # Errors
    /// Returns [`ewald_core::Error::MissingKey`] if the monitor or incident
    /// angle motor is not in `scan_info`, or the integrator's error.
    pub fn integrate_1d(&mut self, args: &Integrate1dArgs, global_mask: Option<&[usize]>) -> Result<()> {
        let lock = Arc::clone(&self.arch_lock);
        let _guard = lock.lock();

        let (image, mask) = self.prepare(args.monitor.as_deref(), global_mask)?;
        let result = if self.gi {
            let grazing = self.grazing()?;
            let radial_range = match args.unit {
                RadialUnit::TwoThetaDeg => args.radial_range.map(|[a, b]| {
                    [tth_to_q(a, self.poni.wavelength), tth_to_q(b, self.poni.wavelength)]
                }),
                RadialUnit::QInvAngstrom => args.radial_range,
            };
            grazing.integrate_1d(
                image.view(),
                Some(&mask),
                args.numpoints,
                radial_range,
                args.azimuth_range,
            )?
        } else {
            AzimuthalIntegrator::new(&self.poni)?.integrate1d(image.view(), Some(&mask), args)?
        };
        self.int_1d = IntData1D::from_result(&result, self.poni.wavelength, None);
        self.ai_args.integrate_1d = Some(args.clone());
        log::debug!("arch {}: integrated 1D over {} bins", self.idx, self.int_1d.len());
        Ok(())
    }

    /// Integrates the image into `int_2d`.
    ///
    /// In grazing mode the polar view comes from the grazing transform, and
    /// static scans also store the reciprocal `(qxy, qz)` view.
    ///
    /// # Errors
    /// See [`integrate_1d`](Self::integrate_1d).
    pub fn integrate_2d(&mut self, args: &Integrate2dArgs, global_mask: Option<&[usize]>) -> Result<()> {
        let lock = Arc::clone(&self.arch_lock);
        let _guard = lock.lock();

        let (image, mask) = self.prepare(args.monitor.as_deref(), global_mask)?;
        let wavelength = self.poni.wavelength;
        self.int_2d = if self.gi {
            let grazing = self.grazing()?;
            let polar = grazing.transform_image(
                image.view(),
                Some(&mask),
                &TransformRequest {
                    process: TransformProcess::Polar,
                    npt: (args.npt_rad, args.npt_azim),
                    x_range: args.radial_range,
                    y_range: args.azimuth_range,
                    unit: args.unit,
                },
            )?;
            if self.static_scan {
                let reciprocal = grazing.transform_image(
                    image.view(),
                    Some(&mask),
                    &TransformRequest {
                        process: TransformProcess::Reciprocal,
                        npt: (args.npt_rad, args.npt_azim),
                        x_range: args.x_range,
                        y_range: args.y_range,
                        unit: RadialUnit::QInvAngstrom,
                    },
                )?;
                let mut data = IntData2DStatic::default();
                data.set_polar(
                    &polar.intensity,
                    &polar.axis1,
                    &polar.axis2,
                    RadialUnit::QInvAngstrom,
                    wavelength,
                )?;
                data.set_reciprocal(&reciprocal.intensity, &reciprocal.axis1, &reciprocal.axis2);
                Integration2D::Static(data)
            } else {
                let result = polar.into_polar_result();
                Integration2D::Scanning(IntData2D::from_result(&result, wavelength, None))
            }
        } else {
            let result =
                AzimuthalIntegrator::new(&self.poni)?.integrate2d(image.view(), Some(&mask), args)?;
            if self.static_scan {
                Integration2D::Static(IntData2DStatic::from_result(&result, wavelength)?)
            } else {
                Integration2D::Scanning(IntData2D::from_result(&result, wavelength, None))
            }
        };
        self.ai_args.integrate_2d = Some(args.clone());
        log::debug!("arch {}: integrated 2D to {:?}", self.idx, self.int_2d.shape());
        Ok(())
    }

    /// Normalized, background-subtracted image and the combined pixel mask.
    fn prepare(
        &mut self,
        monitor: Option<&str>,
        global_mask: Option<&[usize]>,
    ) -> Result<(Array2<f64>, Array2<bool>)> {
        self.map_norm = match monitor {
            Some(key) => *self
                .scan_info
                .get(key)
                .ok_or_else(|| ewald_core::Error::MissingKey(key.to_string()))?,
            None => 1.0,
        };
        if self.mask.is_none() {
            self.mask = Some(negative_pixels(&self.map_raw));
        }
        Ok((self.corrected_image()?, self.pixel_mask(global_mask)))
    }

    /// `(map_raw - bg_raw) / map_norm`.
    ///
    /// # Errors
    /// Returns [`ewald_core::Error::ShapeMismatch`] if the background does
    /// not match the image.
    pub fn corrected_image(&self) -> Result<Array2<f64>> {
        let mut image = self.background_subtracted()?;
        if self.map_norm != 0.0 {
            let norm = self.map_norm;
            image.mapv_inplace(|v| v / norm);
        }
        Ok(image)
    }

    /// `map_raw - bg_raw`.
    ///
    /// # Errors
    /// Returns [`ewald_core::Error::ShapeMismatch`] if the background does
    /// not match the image.
    pub fn background_subtracted(&self) -> Result<Array2<f64>> {
        match &self.bg_raw {
            Some(bg) if bg.dim() == self.map_raw.dim() => Ok(&self.map_raw - bg),
            Some(bg) => Err(ewald_core::Error::ShapeMismatch {
                expected: self.map_raw.shape().to_vec(),
                found: bg.shape().to_vec(),
            }
            .into()),
            None => Ok(self.map_raw.clone()),
        }
    }

    /// Pixels excluded from integration: the arch mask (or its negative
    /// pixels when no mask is set) plus `global_mask`.
    #[must_use]
    pub fn pixel_mask(&self, global_mask: Option<&[usize]>) -> Array2<bool> {
        let (rows, cols) = self.map_raw.dim();
        let mut flat = vec![false; rows * cols];
        let own = match &self.mask {
            Some(mask) => mask.clone(),
            None => negative_pixels(&self.map_raw),
        };
        for &i in own.iter().chain(global_mask.into_iter().flatten()) {
            if let Some(slot) = flat.get_mut(i) {
                *slot = true;
            }
        }
        Array2::from_shape_vec((rows, cols), flat)
            .unwrap_or_else(|_| Array2::from_elem((rows, cols), false))
    }

    fn grazing(&self) -> Result<GrazingIntegrator> {
        let incident = *self
            .scan_info
            .get(&self.th_mtr)
            .ok_or_else(|| ewald_core::Error::MissingKey(self.th_mtr.clone()))?;
        let mut grazing =
            GrazingIntegrator::new(&self.poni)?.with_sample_orientation(self.sample_orientation);
        grazing.set_incident_angle(incident);
        grazing.set_tilt_angle(self.tilt_angle);
        Ok(grazing)
    }

    /// Writes the arch under `<root>/arches/<idx>` in `data_file`.
    ///
    /// Takes the arch lock, then the file lock.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or written.
    pub fn save_to_h5(&self, data_file: &Path, root: &str) -> Result<()> {
        let arch_lock = Arc::clone(&self.arch_lock);
        let _arch_guard = arch_lock.lock();
        let _file_guard = self.file_lock.lock();
        let file = safe_open(data_file, OpenMode::Append, DEFAULT_TRIES)?;
        let arches = require_group(&require_group(&file, root)?, "arches")?;
        let group = require_group(&arches, &self.idx.to_string())?;
        self.write_group(&group)
    }

    /// Writes the arch's members into `group`.
    ///
    /// # Errors
    /// Returns an error if a member cannot be written.
    pub fn write_group(&self, group: &H5Group) -> Result<()> {
        set_str_attr(group, "type", ARCH_TYPE)?;
        data_to_h5(&H5Value::Array(self.map_raw.clone().into_dyn()), group, "map_raw")?;
        let bg = self
            .bg_raw
            .as_ref()
            .map_or(H5Value::None, |bg| H5Value::Array(bg.clone().into_dyn()));
        data_to_h5(&bg, group, "bg_raw")?;
        data_to_h5(&mask_value(self.mask.as_deref()), group, "mask")?;
        data_to_h5(&H5Value::from(self.map_norm), group, "map_norm")?;
        let scan_info = self
            .scan_info
            .iter()
            .map(|(k, v)| (k.clone(), H5Value::from(*v)))
            .collect();
        data_to_h5(&H5Value::Dict(scan_info), group, "scan_info")?;
        let poni_file = self
            .poni_file
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned());
        data_to_h5(&H5Value::from(poni_file), group, "poni_file")?;
        serialized_to_h5(&self.ai_args, group, "ai_args", TextFormat::Yaml)?;
        data_to_h5(&H5Value::from(self.gi), group, "gi")?;
        data_to_h5(&H5Value::from(self.static_scan), group, "static")?;
        data_to_h5(&H5Value::from(self.th_mtr.as_str()), group, "th_mtr")?;
        data_to_h5(&H5Value::from(self.tilt_angle), group, "tilt_angle")?;
        data_to_h5(
            &H5Value::from(i64::from(self.sample_orientation)),
            group,
            "sample_orientation",
        )?;
        save_record(group, "int_1d", &self.int_1d)?;
        save_record(group, "int_2d", &self.int_2d)?;
        save_record(group, "poni", &self.poni)?;
        Ok(())
    }

    /// Loads arch `idx` from `<root>/arches/<idx>` in `data_file`. The 2D
    /// integration is skipped unless `with_2d` is set.
    ///
    /// # Errors
    /// Returns [`Error::ArchNotFound`] if the group is absent.
    pub fn load_from_h5(
        data_file: &Path,
        root: &str,
        idx: i64,
        with_2d: bool,
        file_lock: &FileLock,
    ) -> Result<Self> {
        let mut arch = {
            let _guard = file_lock.lock();
            let file = safe_open(data_file, OpenMode::Read, DEFAULT_TRIES)?;
            let group = arch_group(&file, root, idx)?.ok_or(Error::ArchNotFound(idx))?;
            Self::read_group(&group, idx, with_2d)?
        };
        arch.bind_file_lock(file_lock);
        Ok(arch)
    }

    /// Reads an arch from its group.
    ///
    /// # Errors
    /// Returns an error if a required member is missing or malformed.
    pub fn read_group(group: &H5Group, idx: i64, with_2d: bool) -> Result<Self> {
        if let Some(kind) = read_str_attr(group, "type")? {
            if kind != ARCH_TYPE {
                return Err(Error::InvalidState(format!(
                    "{} is a {kind}, not an arch",
                    group.name()
                )));
            }
        }
        let map_raw = ewald_io::read_array2(group, "map_raw")?;
        let poni: Poni = load_record(group, "poni")?;
        let mut arch = Self::new(idx, map_raw, poni);

        arch.bg_raw = match h5_to_data(group, "bg_raw") {
            Ok(H5Value::None) | Err(ewald_io::Error::MissingNode(_)) => None,
            Ok(_) => Some(ewald_io::read_array2(group, "bg_raw")?),
            Err(e) => return Err(e.into()),
        };
        arch.mask = match h5_to_data(group, "mask") {
            Ok(value) => index_list(&value),
            Err(ewald_io::Error::MissingNode(_)) => None,
            Err(e) => return Err(e.into()),
        };
        arch.map_norm = read_scalar_node(group, "map_norm")?.as_f64();
        if let H5Value::Dict(entries) = h5_to_data(group, "scan_info")? {
            arch.scan_info = entries
                .into_iter()
                .filter_map(|(k, v)| match v {
                    H5Value::Scalar(s) => Some((k, s.as_f64())),
                    _ => None,
                })
                .collect();
        }
        arch.poni_file = match h5_to_data(group, "poni_file")? {
            H5Value::Str(path) => Some(PathBuf::from(path)),
            _ => None,
        };
        arch.ai_args = h5_to_serialized(group, "ai_args")?;
        arch.gi = read_scalar_node(group, "gi")?.as_bool();
        arch.static_scan = read_scalar_node(group, "static")?.as_bool();
        if let Ok(th_mtr) = ewald_io::read_str_node(group, "th_mtr") {
            arch.th_mtr = th_mtr;
        }
        if let Ok(tilt) = read_scalar_node(group, "tilt_angle") {
            arch.tilt_angle = tilt.as_f64();
        }
        if let Ok(Scalar::Int(orientation)) = read_scalar_node(group, "sample_orientation") {
            arch.sample_orientation = u8::try_from(orientation).unwrap_or(1);
        }
        arch.int_1d = load_record(group, "int_1d")?;
        arch.int_2d = if with_2d {
            load_record(group, "int_2d")?
        } else {
            Integration2D::empty(arch.static_scan)
        };
        Ok(arch)
    }
}

/// The group of arch `idx` under `<root>/arches`, if stored.
pub(crate) fn arch_group(file: &H5Group, root: &str, idx: i64) -> Result<Option<H5Group>> {
    let key = idx.to_string();
    if !file.link_exists(root) {
        return Ok(None);
    }
    let root = file.group(root)?;
    if !root.link_exists("arches") {
        return Ok(None);
    }
    let arches = root.group("arches")?;
    if !arches.link_exists(&key) {
        return Ok(None);
    }
    Ok(Some(arches.group(&key)?))
}

/// Flat indices of the pixels with a negative value.
#[must_use]
pub fn negative_pixels(image: &Array2<f64>) -> Vec<usize> {
    image
        .iter()
        .enumerate()
        .filter_map(|(i, &v)| (v < 0.0).then_some(i))
        .collect()
}

pub(crate) fn mask_value(mask: Option<&[usize]>) -> H5Value {
    match mask {
        Some(indices) => {
            let data: Vec<i64> = indices
                .iter()
                .map(|&i| i64::try_from(i).unwrap_or(i64::MAX))
                .collect();
            let len = data.len();
            ArrayD::from_shape_vec(IxDyn(&[len]), data).map_or(H5Value::None, H5Value::IntArray)
        }
        None => H5Value::None,
    }
}

pub(crate) fn index_list(value: &H5Value) -> Option<Vec<usize>> {
    match value {
        H5Value::IntArray(a) => Some(a.iter().filter_map(|&i| usize::try_from(i).ok()).collect()),
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        H5Value::Array(a) => Some(a.iter().filter(|v| **v >= 0.0).map(|&v| v as usize).collect()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ewald_core::Detector;
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
            detector: Detector::new("test", 1e-4, 1e-4, (32, 32)),
        }
    }

    fn arch() -> EwaldArch {
        let mut image = Array2::from_elem((32, 32), 10.0);
        image[[0, 5]] = -2.0;
        let info = BTreeMap::from([("i0".to_string(), 2.0), ("th".to_string(), 0.5)]);
        EwaldArch::new(7, image, poni()).with_scan_info(info)
    }

    #[test]
    fn test_negative_pixels_become_mask() {
        let mut arch = arch();
        let args = Integrate1dArgs::default().with_numpoints(16).with_solid_angle(false);
        arch.integrate_1d(&args, None).unwrap();
        assert_eq!(arch.mask.as_deref(), Some(&[5][..]));
        let total: f64 = arch.int_1d.pcount.full().sum();
        assert_relative_eq!(total, 32.0 * 32.0 - 1.0);
    }

    #[test]
    fn test_monitor_normalizes_image() {
        let mut arch = arch();
        let args = Integrate1dArgs::default()
            .with_numpoints(8)
            .with_solid_angle(false)
            .with_monitor(Some("i0".to_string()));
        arch.integrate_1d(&args, Some(&[0, 1, 2])).unwrap();
        assert_relative_eq!(arch.map_norm, 2.0);
        let norm = arch.int_1d.norm.full();
        let pcount = arch.int_1d.pcount.full();
        for (n, c) in norm.iter().zip(pcount.iter()) {
            if *c > 0.0 {
                assert_relative_eq!(*n, 5.0, epsilon = 1e-9);
            }
        }
        assert_eq!(arch.ai_args.integrate_1d, Some(args));
    }

    #[test]
    fn test_missing_monitor_is_reported() {
        let mut arch = arch();
        let args = Integrate1dArgs::default().with_monitor(Some("absent".to_string()));
        let err = arch.integrate_1d(&args, None).unwrap_err();
        assert!(matches!(err, Error::Core(ewald_core::Error::MissingKey(_))));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_static_grazing_stores_both_views() {
        let mut arch = arch().with_geometry(true, true);
        let args = Integrate2dArgs::default().with_bins(12, 10);
        arch.integrate_2d(&args, None).unwrap();
        let data = arch.int_2d.as_static().unwrap();
        assert_eq!(data.i_q_chi.dim(), (10, 12));
        assert!(data.tth_from_q);
        assert_eq!(data.qxy.len(), 12);
        assert!(data.qz[0] <= data.qz[data.qz.len() - 1]);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scan.h5");
        let mut arch = arch().with_background(Some(Array2::ones((32, 32))));
        arch.integrate_1d(&Integrate1dArgs::default().with_numpoints(20), None)
            .unwrap();
        arch.integrate_2d(&Integrate2dArgs::default().with_bins(10, 6), None)
            .unwrap();
        arch.save_to_h5(&path, "scan").unwrap();

        let lock: FileLock = Arc::new(ReentrantMutex::new(()));
        let back = EwaldArch::load_from_h5(&path, "scan", 7, true, &lock).unwrap();
        assert_eq!(back.map_raw, arch.map_raw);
        assert_eq!(back.bg_raw, arch.bg_raw);
        assert_eq!(back.mask, arch.mask);
        assert_eq!(back.scan_info, arch.scan_info);
        assert_eq!(back.int_1d, arch.int_1d);
        assert_eq!(back.int_2d, arch.int_2d);
        assert_eq!(back.ai_args, arch.ai_args);
        assert_relative_eq!(back.poni.dist, arch.poni.dist);

        let light = EwaldArch::load_from_h5(&path, "scan", 7, false, &lock).unwrap();
        assert_eq!(light.int_2d.shape(), (0, 0));
        assert!(matches!(
            EwaldArch::load_from_h5(&path, "scan", 8, false, &lock),
            Err(Error::ArchNotFound(8))
        ));
    }
}
