//! PDF Image Watermarker CLI
//!
//! Command-line interface for watermarking every page of a PDF.

use anyhow::Context;
use clap::Parser;
use pdf_watermark::{
    default_max_workers, CancelFlag, Pipeline, Thresholds, WatermarkError, WatermarkOptions,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

/// Place a semi-transparent image beneath every page of a PDF
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input PDF file path
    input: PathBuf,

    /// Output PDF file path
    output: PathBuf,

    /// Watermark image path (PNG, JPEG, WebP or BMP)
    watermark: PathBuf,

    /// Watermark opacity (0.0-1.0)
    #[arg(long, default_value = "0.2")]
    opacity: f32,

    /// Initial number of page workers
    #[arg(short, long, default_value = "4")]
    workers: usize,

    /// Largest worker count the pool may grow to [default: max(workers, CPUs)]
    #[arg(long)]
    max_workers: Option<usize>,

    /// CPU utilization (%) above which a worker is shed
    #[arg(long, default_value = "80")]
    cpu_threshold: f32,

    /// Memory utilization (%) above which a worker is shed
    #[arg(long, default_value = "80")]
    memory_threshold: f32,

    /// Completed pages between resource checks
    #[arg(long, default_value = "50")]
    checkpoint: usize,

    /// CPU sampling window in milliseconds
    #[arg(long, default_value = "100")]
    sample_window_ms: u64,

    /// Do not compress PDF streams
    #[arg(long)]
    no_compress: bool,

    /// Add per-page timing statistics to the report
    #[arg(long)]
    profile: bool,
}

impl Args {
    fn options(&self) -> WatermarkOptions {
        WatermarkOptions {
            opacity: self.opacity,
            workers: self.workers,
            max_workers: self
                .max_workers
                .unwrap_or_else(|| default_max_workers(self.workers)),
            thresholds: Thresholds {
                cpu_percent: self.cpu_threshold,
                memory_percent: self.memory_threshold,
            },
            checkpoint_interval: self.checkpoint,
            sample_window: Duration::from_millis(self.sample_window_ms),
            compress_streams: !self.no_compress,
            profile: self.profile,
            asset_dir: None,
        }
    }
}

/// Exit status when the output was saved but some pages kept their original content.
const EXIT_PAGE_FAILURES: u8 = 2;
/// Conventional 128 + SIGINT.
const EXIT_CANCELLED: u8 = 130;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_ansi(false)
        .with_writer(std::io::stdout)
        .init();

    match run(Args::parse()) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> anyhow::Result<ExitCode> {
    let cancel = CancelFlag::new();
    register_signal_handlers(&cancel)?;

    let mut pipeline = Pipeline::new(args.options())
        .context("Invalid options")?
        .with_cancel_flag(cancel);

    let report = match pipeline.run(&args.input, &args.output, &args.watermark) {
        Ok(report) => report,
        Err(WatermarkError::Cancelled) => return Ok(ExitCode::from(EXIT_CANCELLED)),
        Err(e) => return Err(e.into()),
    };

    tracing::info!(
        pages = report.total_pages,
        failed = report.failed_pages().count(),
        workers = report.final_workers,
        resizes = report.resizes,
        "Output saved to: {:?}",
        args.output
    );

    // The timing line is always the last thing written to stdout.
    let line = report
        .timing
        .to_json_line()
        .context("Failed to serialize timing report")?;
    println!("{}", line);

    if report.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(EXIT_PAGE_FAILURES))
    }
}

#[cfg(unix)]
fn register_signal_handlers(cancel: &CancelFlag) -> anyhow::Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::flag;

    // The first signal asks the run to stop; a second one while the flag is
    // already raised exits immediately.
    for signal in [SIGINT, SIGTERM] {
        let code = i32::from(EXIT_CANCELLED);
        flag::register_conditional_shutdown(signal, code, cancel.as_arc())
            .with_context(|| format!("Failed to register shutdown for signal {}", signal))?;
        flag::register(signal, cancel.as_arc())
            .with_context(|| format!("Failed to register handler for signal {}", signal))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn register_signal_handlers(_cancel: &CancelFlag) -> anyhow::Result<()> {
    Ok(())
}
