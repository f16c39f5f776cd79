//! ewald command-line interface.
//!
//! Runs a live ingest into an HDF5 scan file, inspects a saved scan, or
//! re-integrates every arch of a saved scan with new 1D arguments.
#![allow(clippy::uninlined_format_args)]

use clap::{Parser, Subcommand, ValueEnum};
use ewald_core::RadialUnit;
use ewald_engine::{EwaldSphere, Signal, Wrangler, WranglerConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Result type for CLI operations.
type Result<T> = std::result::Result<T, CliError>;

/// CLI error types.
#[derive(Error, Debug)]
enum CliError {
    #[error("Engine error: {0}")]
    Engine(#[from] ewald_engine::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Radial unit selection.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Unit {
    /// Scattering angle 2θ in degrees
    Tth,
    /// Momentum transfer in inverse angstrom
    Q,
}

impl From<Unit> for RadialUnit {
    fn from(unit: Unit) -> Self {
        match unit {
            Unit::Tth => Self::TwoThetaDeg,
            Unit::Q => Self::QInvAngstrom,
        }
    }
}

/// Live 2D X-ray diffraction reduction.
#[derive(Parser)]
#[command(name = "ewald")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest frames into a new scan file until the scan ends
    Wrangle {
        /// Wrangler configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Output HDF5 file, truncated if it exists
        #[arg(short, long)]
        output: PathBuf,

        /// Scan name, used as the root group
        #[arg(short, long, default_value = "scan")]
        name: String,

        /// Detector is not swept during the scan
        #[arg(long)]
        static_scan: bool,

        /// Grazing-incidence geometry
        #[arg(long)]
        gi: bool,
    },

    /// Show the content of a scan file
    Info {
        /// Input HDF5 file
        input: PathBuf,

        /// Scan name
        #[arg(short, long, default_value = "scan")]
        name: String,
    },

    /// Re-integrate every arch of a scan in 1D and rebuild the aggregate
    Reintegrate {
        /// Scan HDF5 file, updated in place
        input: PathBuf,

        /// Scan name
        #[arg(short, long, default_value = "scan")]
        name: String,

        /// Number of radial bins
        #[arg(long, default_value = "3000")]
        numpoints: usize,

        /// Radial unit
        #[arg(long, value_enum, default_value = "tth")]
        unit: Unit,

        /// Radial range in the chosen unit
        #[arg(long, num_args = 2, value_names = ["LOW", "HIGH"])]
        radial_range: Option<Vec<f64>>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Commands::Wrangle {
            config,
            output,
            name,
            static_scan,
            gi,
        } => wrangle(&config, &output, &name, static_scan, gi),
        Commands::Info { input, name } => info(&input, &name),
        Commands::Reintegrate {
            input,
            name,
            numpoints,
            unit,
            radial_range,
        } => {
            let radial_range = match radial_range.as_deref() {
                Some(&[low, high]) if low < high => Some([low, high]),
                Some(range) => {
                    return Err(CliError::InvalidArgument(format!(
                        "radial range {:?} must be increasing",
                        range
                    )))
                }
                None => None,
            };
            reintegrate(&input, &name, numpoints, unit.into(), radial_range)
        }
    }
}

fn wrangle(config: &Path, output: &Path, name: &str, static_scan: bool, gi: bool) -> Result<()> {
    let config = WranglerConfig::from_file(config)?;
    let sphere = EwaldSphere::new(name, output)
        .with_geometry(static_scan, gi)
        .create()?;
    let sphere = Arc::new(sphere);
    let start = Instant::now();
    let wrangler = Wrangler::spawn(&config, Arc::clone(&sphere))?;

    let mut frames = 0usize;
    loop {
        match wrangler.recv_timeout(Duration::from_millis(500)) {
            Ok(Some(Signal::Update(idx))) => {
                frames += 1;
                println!("Frame {} integrated", idx);
            }
            Ok(Some(Signal::Message(text))) => println!("{}", text),
            Ok(Some(Signal::Terminate)) | Err(ewald_engine::Error::Disconnected) => break,
            Ok(None) => {}
            Err(e) => return Err(e.into()),
        }
    }
    wrangler.join()?;

    println!(
        "Wrote {} frame(s) to {} in {:.2?}",
        frames,
        output.display(),
        start.elapsed()
    );
    Ok(())
}

fn info(input: &Path, name: &str) -> Result<()> {
    let sphere = EwaldSphere::open(input, name)?;
    let ids = sphere.arch_ids();
    println!("File: {}", input.display());
    println!("Scan: {} ({:?})", sphere.name(), sphere.status());
    println!(
        "Geometry: {}{}",
        if sphere.is_static() { "static" } else { "scanning" },
        if sphere.is_gi() { ", grazing incidence" } else { "" }
    );
    match (ids.first(), ids.last()) {
        (Some(first), Some(last)) => println!("Arches: {} ({} - {})", ids.len(), first, last),
        _ => println!("Arches: 0"),
    }

    let args = sphere.bai_1d_args();
    println!(
        "1D aggregate: {} bins, unit {}",
        sphere.bai_1d().len(),
        args.unit
    );
    let (rows, cols) = sphere.bai_2d().shape();
    println!("2D aggregate: {} x {}", rows, cols);
    if let Some(raw) = sphere.overall_raw() {
        println!("Summed image: {:?}", raw.dim());
    }

    let scan_data = sphere.scan_data();
    println!(
        "Scan columns ({} rows): {}",
        scan_data.index().len(),
        scan_data.columns().join(", ")
    );
    Ok(())
}

fn reintegrate(
    input: &Path,
    name: &str,
    numpoints: usize,
    unit: RadialUnit,
    radial_range: Option<[f64; 2]>,
) -> Result<()> {
    let sphere = EwaldSphere::open(input, name)?;
    if sphere.arch_ids().is_empty() {
        return Err(CliError::InvalidArgument(format!(
            "scan {} in {} has no arches",
            name,
            input.display()
        )));
    }
    let args = sphere
        .bai_1d_args()
        .with_numpoints(numpoints)
        .with_unit(unit)
        .with_radial_range(radial_range);
    let start = Instant::now();
    sphere.by_arch_integrate_1d(args)?;
    println!(
        "Re-integrated {} arch(es) onto {} bins in {:.2?}",
        sphere.arch_ids().len(),
        numpoints,
        start.elapsed()
    );
    Ok(())
}
