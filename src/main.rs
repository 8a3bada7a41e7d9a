use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use clem_correlate::config::{load_config_or_default, Config};
use clem_correlate::logging::{init_logging, OperationSpan};
use clem_correlate::visualization::{print_grid, print_peak_summary, print_precision};
use clem_correlate::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "correlate")]
#[command(about = "Correlative light and electron microscopy registration")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Assemble a tiled EM montage into one image
    Assemble {
        /// Tile manifest listing tile images and stage offsets
        #[arg(short, long)]
        manifest: PathBuf,

        /// Output PNG
        #[arg(short, long)]
        output: PathBuf,

        /// Pixel-count reduction factor (overrides the configuration)
        #[arg(short, long)]
        downsampling: Option<usize>,
    },

    /// Detect fiducial peaks in one or more images
    Peaks {
        /// Input images
        #[arg(required = true)]
        images: Vec<PathBuf>,

        /// Physical pixel size of the images
        #[arg(short, long, default_value = "1.0")]
        pixel_size: f64,

        /// Output JSON file (stdout summary only when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Treat the images as ordered slices of one z-stack and fit z per peak
        #[arg(long)]
        stack: bool,

        /// Physical slice spacing of the z-stack
        #[arg(long, default_value = "1.0")]
        z_step: f64,
    },

    /// Define a grid square and resample the image onto it
    Grid {
        #[arg(short, long)]
        image: PathBuf,

        /// Four corners as "x,y;x,y;x,y;x,y"
        #[arg(short = 'C', long)]
        corners: String,

        /// Disable shearing
        #[arg(long)]
        rotation_only: bool,

        /// Transformed image output
        #[arg(short, long)]
        output: PathBuf,

        /// Grid definition JSON output
        #[arg(short, long)]
        grid_json: Option<PathBuf>,
    },

    /// Register two modalities from a job file and report the precision
    Register {
        /// Job description (JSON)
        #[arg(short, long)]
        job: PathBuf,

        /// Report JSON output
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Session snapshot JSON output
        #[arg(short, long)]
        snapshot: Option<PathBuf>,

        /// Merged source/target overlay PNG (2-D targets only)
        #[arg(short, long)]
        merged: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config_or_default(cli.config.as_deref().and_then(Path::to_str));
    let logging = config.logging.clone().with_verbosity(cli.verbose);
    let _guard = init_logging(&logging)?;

    match cli.command {
        Commands::Assemble { manifest, output, downsampling } => {
            handle_assemble(&config, manifest, output, downsampling)?;
        }
        Commands::Peaks { images, pixel_size, output, stack, z_step } => {
            if stack {
                handle_stack_peaks(&config, images, pixel_size, z_step, output)?;
            } else {
                handle_peaks(&config, images, pixel_size, output)?;
            }
        }
        Commands::Grid { image, corners, rotation_only, output, grid_json } => {
            handle_grid(&config, image, corners, rotation_only, output, grid_json)?;
        }
        Commands::Register { job, output, snapshot, merged } => {
            handle_register(&config, job, output, snapshot, merged)?;
        }
    }

    Ok(())
}

fn handle_assemble(
    config: &Config,
    manifest: PathBuf,
    output: PathBuf,
    downsampling: Option<usize>,
) -> anyhow::Result<()> {
    println!("Loading tiles from {:?}...", manifest);
    let stack = load_tile_stack(&manifest)?;
    let mut mosaic_config = config.mosaic.clone();
    if let Some(factor) = downsampling {
        mosaic_config.downsampling = factor;
    }
    let stride = mosaic_config.stride();
    let stack = stack.downsample(stride);
    println!("Tiles: {}, stride: {}", stack.len(), stride);

    let mosaic = assemble_mosaic(&Montage::Tiled(stack));
    println!("Canvas: {}x{}", mosaic.image.width(), mosaic.image.height());
    save_image(&mosaic.image, &output)?;
    println!("Mosaic saved to {:?}", output);
    Ok(())
}

#[derive(Serialize)]
struct PeakReport {
    image: PathBuf,
    threshold: f64,
    unresolved: usize,
    peaks: Vec<Peak>,
    #[serde(skip)]
    detection: Option<PeakDetection>,
}

fn handle_peaks(
    config: &Config,
    images: Vec<PathBuf>,
    pixel_size: f64,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    println!("Finding peaks in {} image(s)...", images.len());
    let settings = &config.peak_finding;

    let reports = images
        .par_iter()
        .map(|path| {
            let span = OperationSpan::new("find_peaks", None);
            let _enter = span.enter();
            let image = load_image(path, pixel_size)?;
            let detection = find_peaks(&image, settings);
            span.record_peaks(
                detection.positions(settings.overlap_policy).len(),
                detection.unresolved_count(),
            );
            Ok(PeakReport {
                image: path.clone(),
                threshold: detection.threshold,
                unresolved: detection.unresolved_count(),
                peaks: detection.peaks(settings.overlap_policy),
                detection: Some(detection),
            })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    for report in &reports {
        if let Some(detection) = &report.detection {
            print_peak_summary(&report.image.display().to_string(), detection, report.peaks.len());
        }
    }

    if let Some(output_path) = output {
        let json = serde_json::to_string_pretty(&reports)?;
        std::fs::write(&output_path, json)?;
        println!("Peaks saved to {:?}", output_path);
    }
    Ok(())
}

fn handle_stack_peaks(
    config: &Config,
    slices: Vec<PathBuf>,
    pixel_size: f64,
    z_step: f64,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    println!("Loading a z-stack of {} slice(s)...", slices.len());
    let stack = load_z_stack(&slices, pixel_size, z_step)?;
    let settings = &config.peak_finding;

    let span = OperationSpan::new("find_stack_peaks", None);
    let _enter = span.enter();
    let (detection, peaks, fits) = span.finish(find_stack_peaks(&stack, settings, &config.z_fit))?;
    span.record_peaks(peaks.len(), detection.unresolved_count());

    let name = slices
        .first()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    print_peak_summary(&name, &detection, peaks.len());
    let failed = fits.iter().filter(|f| f.is_err()).count();
    println!("z fitted for {} of {} peaks", peaks.len() - failed, peaks.len());

    if let Some(output_path) = output {
        let report = PeakReport {
            image: slices.first().cloned().unwrap_or_default(),
            threshold: detection.threshold,
            unresolved: detection.unresolved_count(),
            peaks,
            detection: None,
        };
        std::fs::write(&output_path, serde_json::to_string_pretty(&report)?)?;
        println!("Peaks saved to {:?}", output_path);
    }
    Ok(())
}

fn parse_corners(text: &str) -> anyhow::Result<Vec<Point2>> {
    text.split(';')
        .map(|pair| {
            let (x, y) = pair
                .split_once(',')
                .ok_or_else(|| anyhow!("corner '{}' is not of the form x,y", pair))?;
            Ok(Point2::new(x.trim().parse()?, y.trim().parse()?))
        })
        .collect()
}

fn handle_grid(
    config: &Config,
    image_path: PathBuf,
    corners: String,
    rotation_only: bool,
    output: PathBuf,
    grid_json: Option<PathBuf>,
) -> anyhow::Result<()> {
    let image = load_image(&image_path, 1.0)?;
    validate_image_size(&image, 2)?;
    let corners = parse_corners(&corners)?;
    let mode = if rotation_only || config.registration.rotation_only {
        GridMode::RotationOnly
    } else {
        GridMode::Affine
    };

    let grid = define_grid(&corners, image.shape(), mode)?;
    print_grid(&image_path.display().to_string(), &grid);

    let transformed = apply_transform(&image, &grid)?;
    save_image(&transformed, &output)?;
    println!("Transformed image saved to {:?}", output);

    if let Some(path) = grid_json {
        std::fs::write(&path, serde_json::to_string_pretty(&grid)?)?;
        println!("Grid saved to {:?}", path);
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct JobImage {
    path: PathBuf,
    pixel_size: f64,
    modality: Modality,
    corners: Vec<Point2>,
    #[serde(default)]
    orientation: Orientation,
}

/// Everything needed for one registration run.
#[derive(Debug, Deserialize)]
struct RegistrationJob {
    source: JobImage,
    target: JobImage,
    #[serde(default)]
    fib: Option<JobFib>,
    pairs: Vec<MatchedPointPair>,
}

/// FIB slice geometry; the tilt falls back to the configured stage tilt.
#[derive(Debug, Deserialize)]
struct JobFib {
    #[serde(default)]
    tilt_degrees: Option<f64>,
    z_scale: f64,
    z_origin: f64,
}

#[derive(Serialize)]
struct RegistrationReport {
    session_id: uuid::Uuid,
    state: RegistrationState,
    correspondence: Option<Transform>,
    refinement: Transform,
    precision: Option<PrecisionEstimate>,
}

fn handle_register(
    config: &Config,
    job_path: PathBuf,
    output: Option<PathBuf>,
    snapshot: Option<PathBuf>,
    merged: Option<PathBuf>,
) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(&job_path)
        .with_context(|| format!("failed to read job {}", job_path.display()))?;
    let job: RegistrationJob = serde_json::from_str(&content)?;
    let base = job_path.parent().unwrap_or_else(|| Path::new("."));

    let source_image = load_image(base.join(&job.source.path), job.source.pixel_size)?;
    let target_image = load_image(base.join(&job.target.path), job.target.pixel_size)?;

    let mut session = CorrelationSession::with_config(
        ModalityState::new(job.source.modality, source_image),
        ModalityState::new(job.target.modality, target_image),
        config.registration.clone(),
    );
    println!("Session {}", session.id());

    session.set_source_orientation(job.source.orientation)?;
    print_grid("source", session.define_source_grid(&job.source.corners, None)?);
    print_grid("target", session.define_target_grid(&job.target.corners, None)?);
    session.transform_target_image()?;
    if let Some(fib) = job.fib {
        let mut geometry = config.registration.fib_geometry(fib.z_scale, fib.z_origin);
        if let Some(tilt) = fib.tilt_degrees {
            geometry.tilt_degrees = tilt;
        }
        session.set_fib_projection(geometry)?;
    }

    for pair in &job.pairs {
        session.add_pair(pair.source, pair.z, pair.target)?;
    }
    if !job.pairs.is_empty() {
        print_precision(session.refine_selected()?);
    }

    let report = RegistrationReport {
        session_id: session.id(),
        state: session.state(),
        correspondence: session.correspondence().copied(),
        refinement: session.history().accumulated(),
        precision: session.precision().cloned(),
    };

    if let Some(path) = output {
        std::fs::write(&path, serde_json::to_string_pretty(&report)?)?;
        println!("Report saved to {:?}", path);
    }
    if let Some(path) = merged {
        let merged = session.merge()?;
        save_image(&merged.overlay(), &path)?;
        println!("Merged overlay saved to {:?}", path);
    }
    if let Some(path) = snapshot {
        session.snapshot().save_json(&path)?;
        println!("Snapshot saved to {:?}", path);
    }
    Ok(())
}
