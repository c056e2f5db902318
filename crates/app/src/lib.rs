use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use midframe_core::config::{
    config_path, data_dir, initialize_data_dir, resolve_relative_to, AppConfig,
};
use midframe_core::interpolator::{validate_timestep, Interpolator};
use midframe_core::logging::{self, FileSinkPlan, LoggingInitOptions, PanicHookInstallPlan};
use midframe_core::runtime::{log_runtime_lib_status, setup_runtime_libs};
use midframe_core::types::Frame;

#[derive(Parser, Debug)]
#[command(
    name = "midframe",
    about = "Depth-aware video frame interpolation between two images"
)]
struct Cli {
    #[arg(short = '0', long = "input0", value_name = "PATH", help = "First input frame")]
    input0: PathBuf,

    #[arg(short = '1', long = "input1", value_name = "PATH", help = "Second input frame")]
    input1: PathBuf,

    #[arg(short = 'o', long, value_name = "PATH", help = "Output frame path (png/jpg)")]
    output: PathBuf,

    #[arg(short = 's', long, help = "Temporal position between the inputs, 0.0..=1.0")]
    timestep: Option<f32>,

    #[arg(
        short = 't',
        long = "tile-size",
        help = "Tile edge (>=128, multiple of 32), 0 for whole-image mode"
    )]
    tile_size: Option<usize>,

    #[arg(short = 'g', long = "gpu-id", allow_hyphen_values = true, help = "GPU index, -1 for CPU")]
    gpu_id: Option<i32>,

    #[arg(long, help = "Context margin around each tile (multiple of 16)")]
    prepadding: Option<usize>,

    #[arg(long, value_name = "cpu|cuda|tensorrt", help = "ONNX Runtime execution provider")]
    backend: Option<String>,

    #[arg(long = "models-dir", value_name = "DIR")]
    models_dir: Option<PathBuf>,

    #[arg(short = 'j', long, help = "Worker threads for CPU kernels")]
    threads: Option<usize>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

pub fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    let runtime_libs = setup_runtime_libs();
    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_runtime_lib_status(&runtime_libs);
    log_startup_metadata(&resolved_data_dir);

    run_interpolation(cli, resolved_data_dir)
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let panic_hook_plan = logging::install_panic_hook(data_dir);
    if let PanicHookInstallPlan::Fallback { reason } = &panic_hook_plan {
        eprintln!(
            "Warning: panic crash artifact hook unavailable ({reason}). Panics will not be persisted to crash logs."
        );
    }

    let options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let filters = logging::compose_logging_filters(&options);
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(&filters.console_filter, "console"));

    match logging::build_file_sink_plan(&options) {
        FileSinkPlan::Rolling { appender, .. } => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(appender)
                .with_filter(parse_env_filter_with_fallback(&filters.file_filter, "file"));
            let subscriber = tracing_subscriber::registry()
                .with(console_layer)
                .with(file_layer);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::ConsoleOnly {
            attempted_log_dir,
            reason,
        } => {
            let subscriber = tracing_subscriber::registry().with(console_layer);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }
            warn!(
                attempted_log_dir = ?attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }

    if let PanicHookInstallPlan::Fallback { reason } = panic_hook_plan {
        warn!(reason = %reason, "Panic crash artifact hook unavailable");
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{}'.",
            logging::DEFAULT_LOG_FILTER
        );
        tracing_subscriber::EnvFilter::new(logging::DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path) {
    info!(
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(error) = initialize_data_dir(data_dir) {
        warn!(error = %format!("{error:#}"), "Failed to initialize data directory");
    }
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(error) => {
            warn!(error = %format!("{error:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

/// Command-line values win over the config file.
fn apply_overrides(config: &mut AppConfig, cli: &Cli) {
    let interp = &mut config.interpolation;
    if let Some(timestep) = cli.timestep {
        interp.timestep = timestep;
    }
    if let Some(tile_size) = cli.tile_size {
        interp.tile_size = tile_size;
    }
    if let Some(gpu_id) = cli.gpu_id {
        interp.gpu_id = gpu_id;
    }
    if let Some(prepadding) = cli.prepadding {
        interp.prepadding = prepadding;
    }
    if let Some(backend) = &cli.backend {
        interp.backend = backend.clone();
    }
    if let Some(models_dir) = &cli.models_dir {
        config.paths.models_dir = models_dir.clone();
    }
    if let Some(threads) = cli.threads {
        config.performance.threads = threads;
    }
}

fn configure_thread_pool(threads: usize) -> Result<()> {
    if threads == 0 {
        return Ok(());
    }
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
        .context("failed to configure worker thread pool")
}

fn load_frame(path: &Path) -> Result<Frame> {
    let image = image::open(path)
        .with_context(|| format!("failed to decode image: {}", path.display()))?
        .to_rgb8();
    let (width, height) = image.dimensions();
    Frame::new(width, height, image.into_raw())
        .with_context(|| format!("invalid frame: {}", path.display()))
}

fn save_frame(frame: &Frame, path: &Path) -> Result<()> {
    let image = image::RgbImage::from_raw(frame.width, frame.height, frame.data.clone())
        .context("frame buffer does not match its dimensions")?;
    image
        .save(path)
        .with_context(|| format!("failed to encode image: {}", path.display()))
}

fn check_frame_pair(frame0: &Frame, frame1: &Frame) -> Result<()> {
    if !frame0.same_extent(frame1) {
        bail!(
            "input frames differ in size: {}x{} vs {}x{}",
            frame0.width,
            frame0.height,
            frame1.width,
            frame1.height
        );
    }
    Ok(())
}

fn run_interpolation(cli: Cli, data_dir: PathBuf) -> Result<()> {
    let mut config = load_config(&data_dir);
    apply_overrides(&mut config, &cli);

    let timestep = config.interpolation.timestep;
    validate_timestep(timestep)?;
    let options = config.interpolation.to_options();
    options.validate()?;
    configure_thread_pool(config.performance.threads)?;

    let frame0 = load_frame(&cli.input0)?;
    let frame1 = load_frame(&cli.input1)?;
    check_frame_pair(&frame0, &frame1)?;

    let models_dir = match &cli.models_dir {
        Some(dir) => dir.clone(),
        None => resolve_relative_to(&data_dir, &config.paths.models_dir),
    };
    let backend = config.backend_options(&data_dir);
    let interpolator = Interpolator::load(&models_dir, options, &backend)
        .with_context(|| format!("failed to load models from {}", models_dir.display()))?;

    let started = Instant::now();
    let frame = interpolator.process(&frame0, &frame1, timestep)?;
    eprintln!("{:.6}", started.elapsed().as_secs_f64());

    save_frame(&frame, &cli.output)?;
    info!(
        output = %cli.output.display(),
        width = frame.width,
        height = frame.height,
        timestep,
        "Wrote interpolated frame"
    );
    Ok(())
}
