use approx::assert_relative_eq;
use ewald_core::units::tth_to_q;
use ewald_core::{safe_divide, Integrate1dArgs, Integrate2dArgs, Poni, RadialUnit, RotationMotors};
use ewald_engine::{
    AddArchOptions, EwaldArch, EwaldSphere, Signal, SourceConfig, Wrangler, WranglerConfig,
};
use ewald_formats::{DetectorConfig, MetadataKind};
use ewald_io::{node_encoding, H5File, H5Group};
use ndarray::Array2;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

const ROWS: usize = 195;
const COLS: usize = 487;

fn base_poni() -> Poni {
    let detector = DetectorConfig::pilatus_100k().detector();
    Poni {
        dist: 0.2,
        poni1: ROWS as f64 * 172e-6 / 2.0,
        poni2: COLS as f64 * 172e-6 / 2.0,
        rot1: 0.0,
        rot2: 0.0,
        rot3: 0.0,
        wavelength: 1e-10,
        detector,
    }
}

/// Writes `img_NNNN.raw` holding a uniform i32 frame and its sidecar.
fn write_frame(dir: &Path, idx: i64, value: i32, info: &[(&str, f64)]) -> PathBuf {
    let path = dir.join(format!("img_{idx:04}.raw"));
    let bytes: Vec<u8> = std::iter::repeat(value.to_le_bytes())
        .take(ROWS * COLS)
        .flatten()
        .collect();
    std::fs::write(&path, bytes).unwrap();
    let sidecar: Vec<String> = info.iter().map(|(k, v)| format!("{k}={v}")).collect();
    std::fs::write(path.with_extension("txt"), sidecar.join(";")).unwrap();
    path
}

/// Half-open range from the first to one past the last non-zero value.
fn nonzero_span(values: &[f64]) -> (usize, usize) {
    let lo = values.iter().position(|&v| v != 0.0).unwrap_or(0);
    let hi = values.iter().rposition(|&v| v != 0.0).map_or(0, |i| i + 1);
    (lo, hi)
}

/// Every node path in the file with its `encoded` tag, in traversal order.
fn file_layout(path: &Path) -> Vec<(String, String)> {
    fn walk(group: &H5Group, prefix: &str, out: &mut Vec<(String, String)>) {
        let mut names = group.member_names().unwrap();
        names.sort();
        for name in names {
            let tag = format!("{:?}", node_encoding(group, &name).ok().flatten());
            let node = format!("{prefix}/{name}");
            out.push((node.clone(), tag));
            if let Ok(child) = group.group(&name) {
                walk(&child, &node, out);
            }
        }
    }
    let file = H5File::open(path).unwrap();
    let mut out = Vec::new();
    walk(&file, "", &mut out);
    out
}

fn two_theta(idx: i64) -> f64 {
    -5.0 + 2.0 * idx as f64
}

fn scan_config(dir: &Path, indices: Vec<i64>) -> WranglerConfig {
    let poni_file = dir.join("cal.poni");
    std::fs::write(&poni_file, base_poni().to_file_string()).unwrap();
    WranglerConfig::default()
        .with_source(SourceConfig::ScanPlan {
            template: dir.join("img_{index:04}.raw").to_string_lossy().into_owned(),
            indices,
        })
        .with_poni_file(poni_file)
        .with_metadata(MetadataKind::Sidecar)
        .with_rotation_motors(RotationMotors {
            rot1: None,
            rot2: Some("TwoTheta".to_string()),
            rot3: None,
        })
        .with_timeout(Duration::from_secs(20))
        .with_poll_interval(Duration::from_millis(10))
}

fn scan_sphere(path: &Path) -> Arc<EwaldSphere> {
    let sphere = EwaldSphere::new("scan", path)
        .with_bai_1d_args(
            Integrate1dArgs::default()
                .with_numpoints(500)
                .with_radial_range(Some([0.0, 40.0]))
                .with_monitor(Some("i0".to_string())),
        )
        .with_bai_2d_args(Integrate2dArgs::default().with_bins(100, 36))
        .create()
        .unwrap();
    Arc::new(sphere)
}

#[test]
fn test_wrangler_ingests_scan_plan() {
    let dir = tempdir().unwrap();
    for idx in 0..6 {
        write_frame(dir.path(), idx, 100, &[("TwoTheta", two_theta(idx)), ("i0", 1000.0)]);
    }
    let sphere = scan_sphere(&dir.path().join("scan.h5"));
    let config = scan_config(dir.path(), (0..6).collect());
    let wrangler = Wrangler::spawn(&config, Arc::clone(&sphere)).unwrap();
    let signals = wrangler.join().unwrap();

    let mut expected: Vec<Signal> = (0..6).map(Signal::Update).collect();
    expected.push(Signal::Message("Scan complete".to_string()));
    expected.push(Signal::Terminate);
    assert_eq!(signals, expected);

    assert_eq!(sphere.arch_ids(), vec![0, 1, 2, 3, 4, 5]);
    let bai = sphere.bai_1d();
    assert_eq!(bai.len(), 500);
    assert!(bai.raw.full().iter().any(|&v| v > 0.0));
    assert_eq!(sphere.scan_data().loc(3, "TwoTheta"), Some(1.0));

    // The aggregate is non-zero exactly over the union of the arch ranges.
    let mut union = (usize::MAX, 0);
    for idx in 0..6 {
        let (lo, hi) = nonzero_span(&sphere.get_arch(idx).unwrap().int_1d.norm.full().to_vec());
        union = (union.0.min(lo), union.1.max(hi));
    }
    let norm = bai.norm.full().to_vec();
    assert!(union.0 < union.1);
    assert_eq!(nonzero_span(&norm), union);
    for (i, v) in norm.iter().enumerate() {
        if !(union.0..union.1).contains(&i) {
            assert_eq!(*v, 0.0, "bin {i}");
        }
    }

    // Each arch carries the motor offset on its calibration.
    let arch = sphere.get_arch(5).unwrap();
    assert_relative_eq!(arch.poni.rot2, -5f64.to_radians(), epsilon = 1e-12);
    assert_relative_eq!(arch.map_norm, 1000.0);
}

#[test]
fn test_reintegration_matches_bragg_axis() {
    let dir = tempdir().unwrap();
    let sphere = scan_sphere(&dir.path().join("scan.h5"));
    for idx in 0..3 {
        let info = BTreeMap::from([("i0".to_string(), 1000.0)]);
        let arch = EwaldArch::new(idx, Array2::from_elem((ROWS, COLS), 50.0), base_poni())
            .with_scan_info(info);
        sphere
            .add_arch(arch, AddArchOptions::default().with_calculate(false))
            .unwrap();
    }
    assert!(sphere.bai_1d().is_empty());

    let args = Integrate1dArgs::default()
        .with_numpoints(1000)
        .with_unit(RadialUnit::TwoThetaDeg)
        .with_radial_range(Some([0.0, 30.0]));
    sphere.by_arch_integrate_1d(args).unwrap();

    let bai = sphere.bai_1d();
    assert_eq!(bai.len(), 1000);
    assert_eq!(bai.q.len(), 1000);
    assert_relative_eq!(bai.ttheta[0], 0.015, epsilon = 1e-9);
    assert_relative_eq!(bai.ttheta[999], 29.985, epsilon = 1e-9);
    let wavelength = base_poni().wavelength;
    for (tth, q) in bai.ttheta.iter().zip(bai.q.iter()) {
        assert_relative_eq!(*q, tth_to_q(*tth, wavelength), max_relative = 1e-9);
    }
    for idx in 0..3 {
        assert_eq!(sphere.get_arch(idx).unwrap().int_1d.len(), 1000);
    }
}

#[test]
fn test_uniform_image_normalizes_to_value() {
    let dir = tempdir().unwrap();
    let sphere = EwaldSphere::new("flat", dir.path().join("flat.h5"))
        .with_bai_1d_args(
            Integrate1dArgs::default()
                .with_numpoints(200)
                .with_monitor(Some("i0".to_string()))
                .with_solid_angle(false),
        )
        .with_bai_2d_args(Integrate2dArgs::default().with_bins(50, 18))
        .create()
        .unwrap();
    let info = BTreeMap::from([("i0".to_string(), 2.0)]);
    let arch = EwaldArch::new(0, Array2::from_elem((ROWS, COLS), 4.0), base_poni())
        .with_scan_info(info);
    sphere.add_arch(arch, AddArchOptions::default()).unwrap();

    let bai = sphere.bai_1d();
    let pcount = bai.pcount.full();
    let norm = bai.norm.full();
    let filled = pcount.iter().filter(|&&c| c > 0.0).count();
    assert!(filled > 0);
    for (n, c) in norm.iter().zip(pcount.iter()) {
        if *c > 0.0 {
            assert_relative_eq!(*n, 2.0, max_relative = 1e-9);
        }
    }
}

#[test]
fn test_readers_see_consistent_aggregates() {
    let dir = tempdir().unwrap();
    let n = 8;
    for idx in 0..n {
        write_frame(dir.path(), idx, 10 + idx as i32, &[("TwoTheta", 0.0), ("i0", 1.0)]);
    }
    let sphere = scan_sphere(&dir.path().join("scan.h5"));
    let config = scan_config(dir.path(), (0..n).collect());
    let wrangler = Wrangler::spawn(&config, Arc::clone(&sphere)).unwrap();

    let mut checks = 0;
    loop {
        let bai = sphere.bai_1d();
        let raw = bai.raw.full();
        let pcount = bai.pcount.full();
        let norm = bai.norm.full();
        for i in 0..bai.len() {
            assert_relative_eq!(norm[i], safe_divide(raw[i], pcount[i]), max_relative = 1e-12);
        }
        checks += 1;
        if wrangler.is_finished() {
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(checks > 0);
    wrangler.join().unwrap();
    assert_eq!(sphere.arch_ids().len(), n as usize);
}

#[test]
fn test_wrangler_times_out_on_empty_directory() {
    let dir = tempdir().unwrap();
    let watched = dir.path().join("incoming");
    std::fs::create_dir(&watched).unwrap();
    let sphere = scan_sphere(&dir.path().join("scan.h5"));
    let config = scan_config(dir.path(), Vec::new())
        .with_source(SourceConfig::DirectoryWatch {
            directory: watched,
            extension: None,
        })
        .with_timeout(Duration::from_millis(300));
    let wrangler = Wrangler::spawn(&config, Arc::clone(&sphere)).unwrap();
    let signals = wrangler.join().unwrap();
    assert_eq!(
        signals,
        vec![Signal::Message("Timeout occurred".to_string()), Signal::Terminate]
    );
    assert!(sphere.arch_ids().is_empty());
}

#[test]
fn test_directory_watch_waits_for_sidecar() {
    let dir = tempdir().unwrap();
    let watched = dir.path().join("incoming");
    std::fs::create_dir(&watched).unwrap();
    let sphere = scan_sphere(&dir.path().join("scan.h5"));
    let config = scan_config(dir.path(), Vec::new())
        .with_source(SourceConfig::DirectoryWatch {
            directory: watched.clone(),
            extension: Some("raw".to_string()),
        })
        .with_timeout(Duration::from_secs(2));

    // The image lands before its metadata; the frame is retried until the
    // sidecar appears.
    let image = write_frame(&watched, 7, 5, &[("TwoTheta", 1.0), ("i0", 1.0)]);
    let sidecar = image.with_extension("txt");
    let text = std::fs::read_to_string(&sidecar).unwrap();
    std::fs::remove_file(&sidecar).unwrap();

    let wrangler = Wrangler::spawn(&config, Arc::clone(&sphere)).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    std::fs::write(&sidecar, text).unwrap();

    let first = wrangler.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(first, Some(Signal::Update(7)));
    wrangler.stop().unwrap();
    let rest = wrangler.join().unwrap();
    assert_eq!(rest.last(), Some(&Signal::Terminate));
    assert_eq!(sphere.arch_ids(), vec![7]);
}

#[test]
fn test_saved_sphere_reopens() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("scan.h5");
    let sphere = scan_sphere(&path);
    let mut originals = BTreeMap::new();
    for idx in [2, 0, 1] {
        let info = BTreeMap::from([("i0".to_string(), 10.0), ("TwoTheta".to_string(), idx as f64)]);
        let mut poni = base_poni();
        poni.rot2 = (idx as f64).to_radians();
        let mut arch = EwaldArch::new(idx, Array2::from_elem((ROWS, COLS), 1.0 + idx as f64), poni)
            .with_scan_info(info)
            .with_mask(Some(vec![0, 1, COLS + 3]));
        arch.integrate_1d(&sphere.bai_1d_args(), None).unwrap();
        arch.integrate_2d(&sphere.bai_2d_args(), None).unwrap();
        originals.insert(idx, arch.clone());
        sphere
            .add_arch(arch, AddArchOptions::default().with_calculate(false))
            .unwrap();
    }

    // Saving twice leaves the file equivalent to saving once.
    sphere.save_to_h5(false).unwrap();
    let first = file_layout(&path);
    assert!(first.iter().any(|(node, _)| node == "/scan/bai_1d"));
    sphere.save_to_h5(false).unwrap();
    assert_eq!(file_layout(&path), first);

    let reopened = EwaldSphere::open(&path, "scan").unwrap();
    assert_eq!(reopened.arch_ids(), vec![0, 1, 2]);
    assert_eq!(reopened.bai_1d_args(), sphere.bai_1d_args());
    assert_eq!(reopened.bai_2d_args(), sphere.bai_2d_args());
    assert_eq!(reopened.bai_1d(), sphere.bai_1d());
    assert_eq!(reopened.bai_2d(), sphere.bai_2d());
    assert_eq!(reopened.scan_data(), sphere.scan_data());
    assert_eq!(reopened.overall_raw(), sphere.overall_raw());

    for (idx, original) in &originals {
        let arch = reopened.get_arch(*idx).unwrap();
        assert_eq!(arch.map_raw, original.map_raw);
        assert_eq!(arch.mask, original.mask);
        assert_eq!(arch.poni, original.poni);
        assert_eq!(arch.int_1d, original.int_1d);
        assert_eq!(arch.int_2d, original.int_2d);
        assert_eq!(arch.scan_info, original.scan_info);
    }
}
