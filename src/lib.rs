//! PDF Image Watermarker Library
//!
//! Places a semi-transparent image beneath the content of every page of a PDF.
//! Pages are composited in parallel on a worker pool whose size follows host
//! CPU and memory load, and the result is written in page order so the output
//! does not depend on the number of workers.

pub mod asset;
pub mod compositor;
pub mod controller;
pub mod embed;
pub mod error;
pub mod monitor;
pub mod pipeline;
pub mod pool;
pub mod timing;

pub use asset::{prepare_watermark, WatermarkAsset};
pub use compositor::{composite, PageBox, PageComposite, PageSnapshot, Placement};
pub use controller::{adjust, AdaptiveController, Thresholds};
pub use error::{
    AssetError, CompositeError, ConfigError, DocumentError, ResourceSampleError, WatermarkError,
};
pub use monitor::{ResourceMonitor, ResourceSample, SystemMonitor};
pub use pipeline::{PageOutcome, Pipeline, RunReport, RunState};
pub use pool::{CancelFlag, WorkerPool, WorkerPoolState};
pub use timing::TimingReport;

use std::path::PathBuf;
use std::time::Duration;

/// Options for PDF watermarking
#[derive(Debug, Clone)]
pub struct WatermarkOptions {
    /// Opacity applied to the watermark's alpha channel (0.0-1.0)
    pub opacity: f32,
    /// Initial number of concurrent page workers
    pub workers: usize,
    /// Upper bound the adaptive controller may grow the pool to
    pub max_workers: usize,
    /// CPU and memory utilization above which the pool sheds a worker
    pub thresholds: Thresholds,
    /// Completed pages between resource checkpoints
    pub checkpoint_interval: usize,
    /// How long CPU counters are observed per resource sample
    pub sample_window: Duration,
    /// Compress PDF streams (reduces file size)
    pub compress_streams: bool,
    /// Record per-page timings in the report
    pub profile: bool,
    /// Directory for the transient watermark asset (OS temp dir when unset)
    pub asset_dir: Option<PathBuf>,
}

/// Default worker ceiling: the larger of `workers` and the host's parallelism.
pub fn default_max_workers(workers: usize) -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    workers.max(cpus)
}

impl Default for WatermarkOptions {
    fn default() -> Self {
        Self {
            opacity: 0.2,
            workers: 4,
            max_workers: default_max_workers(4),
            thresholds: Thresholds::default(),
            checkpoint_interval: 50,
            sample_window: Duration::from_millis(100),
            compress_streams: true,
            profile: false,
            asset_dir: None,
        }
    }
}

impl WatermarkOptions {
    /// Check every field before any work starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.opacity) {
            return Err(ConfigError::InvalidOpacity(self.opacity));
        }
        if self.workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.workers > self.max_workers {
            return Err(ConfigError::WorkersAboveCeiling {
                workers: self.workers,
                ceiling: self.max_workers,
            });
        }
        check_threshold("cpu", self.thresholds.cpu_percent)?;
        check_threshold("memory", self.thresholds.memory_percent)?;
        if self.checkpoint_interval == 0 {
            return Err(ConfigError::ZeroCheckpoint);
        }
        if self.sample_window.is_zero() {
            return Err(ConfigError::ZeroSampleWindow);
        }
        Ok(())
    }
}

fn check_threshold(name: &'static str, value: f32) -> Result<(), ConfigError> {
    // NaN fails both comparisons
    if value > 0.0 && value <= 100.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidThreshold { name, value })
    }
}

pub mod file_ops {
    use super::*;
    use std::path::Path;

    /// Watermark a PDF from file path to file path
    pub fn watermark_pdf_file(
        input_path: &Path,
        output_path: &Path,
        watermark_path: &Path,
        options: &WatermarkOptions,
    ) -> Result<RunReport, WatermarkError> {
        let mut pipeline = Pipeline::new(options.clone())?;
        pipeline.run(input_path, output_path, watermark_path)
    }
}
