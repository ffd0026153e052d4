use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use tilerp_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use tilerp_core::logging::{self, FileSink, LoggingOptions, PanicHookStatus, DEFAULT_LOG_FILTER};
use tilerp_core::onnx::{InferenceBackend, OrtEngine};
use tilerp_core::tiling::{self, TilingMode};
use tilerp_core::{
    ComputeBackend, Frame, HostBackend, InferenceEngine, InterpolationPipeline, Normalization,
};

pub mod io;

#[derive(Parser, Debug)]
#[command(name = "tilerp", about = "Tiled pairwise frame interpolation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

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

    #[arg(long, global = true, help = "Config file (default: <data-dir>/config.toml)")]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Synthesize the frame between two images.
    Interpolate(InterpolateArgs),
    /// Print the tile grid for a frame size as JSON.
    Plan(PlanArgs),
}

#[derive(Args, Debug, Default)]
struct TilingArgs {
    #[arg(long, conflicts_with_all = ["no_tiling", "auto_tiling"])]
    tile_size: Option<u32>,
    #[arg(long)]
    overlap: Option<u32>,
    #[arg(long, conflicts_with = "auto_tiling")]
    no_tiling: bool,
    #[arg(long)]
    auto_tiling: bool,
}

#[derive(Args, Debug)]
struct InterpolateArgs {
    frame0: PathBuf,
    frame1: PathBuf,
    #[arg(short = 'o', long)]
    output: PathBuf,
    #[arg(long, default_value_t = 0.5)]
    factor: f32,
    #[arg(long, help = "ONNX model (overrides [model].path)")]
    model: Option<PathBuf>,
    #[command(flatten)]
    tiling: TilingArgs,
    #[arg(long, value_enum)]
    normalization: Option<NormalizationArg>,
    #[arg(long, help = "Execution provider: cuda, tensorrt or cpu")]
    provider: Option<String>,
}

#[derive(Args, Debug)]
struct PlanArgs {
    width: u32,
    height: u32,
    #[command(flatten)]
    tiling: TilingArgs,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum NormalizationArg {
    Mean,
    Raw,
}

impl From<NormalizationArg> for Normalization {
    fn from(value: NormalizationArg) -> Self {
        match value {
            NormalizationArg::Mean => Normalization::MeanCentered,
            NormalizationArg::Raw => Normalization::Raw,
        }
    }
}

impl TilingArgs {
    fn apply(&self, config: &mut AppConfig) {
        if self.no_tiling {
            config.tiling.mode = TilingMode::None;
        } else if self.auto_tiling {
            config.tiling.mode = TilingMode::Auto;
        } else if let Some(tile_size) = self.tile_size {
            config.tiling.mode = TilingMode::Fixed;
            config.tiling.tile_size = tile_size;
        }
        if let Some(overlap) = self.overlap {
            config.tiling.overlap = overlap;
        }
    }
}

pub fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    let runtime_libs = tilerp_core::runtime::setup_runtime_libs();
    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    runtime_libs.log_status();

    let cfg_path = cli
        .config
        .clone()
        .unwrap_or_else(|| config_path(&resolved_data_dir));
    info!(
        pid = std::process::id(),
        data_dir = %resolved_data_dir.display(),
        config_path = %cfg_path.display(),
        "Runtime startup metadata"
    );

    if cli.config.is_none() {
        if let Err(e) = initialize_data_dir(&resolved_data_dir) {
            warn!(error = %e, "Failed to initialize data directory");
        }
    }
    let config = AppConfig::load_from_path(&cfg_path)?;

    match cli.command {
        Commands::Interpolate(args) => run_interpolate(args, config, &resolved_data_dir),
        Commands::Plan(args) => {
            println!("{}", plan_json(&args, config)?);
            Ok(())
        }
    }
}

fn run_interpolate(args: InterpolateArgs, mut config: AppConfig, data_dir: &Path) -> Result<()> {
    args.tiling.apply(&mut config);
    if let Some(model) = args.model {
        config.model.path = model;
    }
    if let Some(normalization) = args.normalization {
        config.model.normalization = normalization.into();
    }
    if let Some(provider) = args.provider.as_deref() {
        config.engine.provider = InferenceBackend::from_str_lossy(provider);
    }

    let options = config.pipeline_options()?;
    let frame0 = io::load_frame(&args.frame0, options.layout)?;
    let frame1 = io::load_frame(&args.frame1, options.layout)?;

    let engine_config = config.engine_config(data_dir);
    info!(
        model = %engine_config.model_path.display(),
        provider = %engine_config.backend,
        "Loading interpolation model"
    );
    let engine: Arc<dyn InferenceEngine> =
        Arc::new(OrtEngine::load(&engine_config).context("failed to load interpolation model")?);

    let mut host = HostBackend::new();
    if let Some(budget) = config.device.heap_budget_bytes() {
        host = host.with_heap_budget(budget);
    }
    let backend: Arc<dyn ComputeBackend> = Arc::new(host);
    let mut pipeline = InterpolationPipeline::load(backend, engine, options)?;

    let mut out = Frame::blank(frame0.width(), frame0.height(), options.layout);
    let report = pipeline
        .process(&frame0, &frame1, args.factor, &mut out)
        .with_context(|| {
            format!(
                "failed to interpolate {} and {}",
                args.frame0.display(),
                args.frame1.display()
            )
        })?;

    io::save_frame(&out, &args.output)?;
    info!(
        output = %args.output.display(),
        tiles = report.tiles,
        barriers = report.barriers,
        elapsed_ms = format!("{:.1}", report.elapsed.as_secs_f64() * 1000.0),
        "Wrote interpolated frame"
    );
    Ok(())
}

fn plan_json(args: &PlanArgs, mut config: AppConfig) -> Result<String> {
    args.tiling.apply(&mut config);
    let options = config.pipeline_options()?;
    let spec = options
        .tiling
        .resolve(args.width, args.height, config.device.heap_budget_bytes());
    let grid = tiling::plan(args.width, args.height, &spec)?;
    serde_json::to_string_pretty(&grid).context("failed to encode tile grid")
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let hook_status = logging::install_panic_hook(data_dir);
    if let PanicHookStatus::Unavailable { crash_dir, reason } = &hook_status {
        let crash_dir = crash_dir
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "<none>".to_string());
        eprintln!(
            "Warning: panic crash artifact hook unavailable (path: {crash_dir}; reason: {reason}). Panics will not be persisted to crash logs."
        );
    }

    let options = LoggingOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_filter: cli_log_filter.map(ToString::to_string),
        rust_log: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let filters = logging::plan_filters(&options);
    let console_filter = parse_env_filter_with_fallback(&filters.console, "console");
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(console_filter);

    match logging::open_file_sink(&options) {
        FileSink::Ready { appender, .. } => {
            let file_filter = parse_env_filter_with_fallback(&filters.file, "file");
            let subscriber = tracing_subscriber::registry().with(console_layer).with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(appender)
                    .with_filter(file_filter),
            );
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSink::Unavailable { log_dir, reason } => {
            let log_dir = log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            let subscriber = tracing_subscriber::registry().with(console_layer);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }
            eprintln!(
                "Warning: persistent file logging unavailable (path: {log_dir}; reason: {reason}). Continuing with console-only logging."
            );
            warn!(log_dir = %log_dir, reason = %reason, "Continuing with console-only logging");
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}
