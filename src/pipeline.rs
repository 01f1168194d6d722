//! The page-watermarking pipeline
//!
//! `Idle -> Preparing -> Running -> Saving -> Done`, with `Failed` reachable
//! from every step. The watermark asset lives for exactly one run and its file
//! is gone on every exit path.

use crate::asset::WatermarkAsset;
use crate::compositor::{composite, PageComposite, PageSnapshot};
use crate::controller::AdaptiveController;
use crate::embed::embed_watermark;
use crate::error::{CompositeError, ConfigError, DocumentError, Result, WatermarkError};
use crate::monitor::{ResourceMonitor, SystemMonitor};
use crate::pool::{CancelFlag, WorkerPool};
use crate::timing::TimingReport;
use crate::WatermarkOptions;
use lopdf::Document;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Preparing,
    Running,
    Saving,
    Done,
    Failed,
}

/// What happened to one page.
#[derive(Debug, Clone, PartialEq)]
pub struct PageOutcome {
    /// Zero-based page index.
    pub index: usize,
    pub error: Option<CompositeError>,
    pub elapsed: Duration,
}

impl PageOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Summary of a run that reached the output document.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub total_pages: usize,
    /// One outcome per page, in page order.
    pub outcomes: Vec<PageOutcome>,
    /// Worker count in effect when the fan-out finished.
    pub final_workers: usize,
    /// Number of times a checkpoint changed the worker count.
    pub resizes: usize,
    pub timing: TimingReport,
    /// Where the (now deleted) watermark asset was written.
    pub asset_path: PathBuf,
}

impl RunReport {
    pub fn failed_pages(&self) -> impl Iterator<Item = &PageOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    /// True when every page was watermarked.
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(PageOutcome::is_success)
    }
}

/// Watermarks whole documents with a fixed set of options.
pub struct Pipeline {
    options: WatermarkOptions,
    monitor: Arc<dyn ResourceMonitor>,
    cancel: CancelFlag,
    state: RunState,
}

impl Pipeline {
    /// Validate `options` and build a pipeline sampling the local host.
    pub fn new(options: WatermarkOptions) -> std::result::Result<Self, ConfigError> {
        options.validate()?;
        let monitor = Arc::new(SystemMonitor::new(options.sample_window));
        Ok(Self {
            options,
            monitor,
            cancel: CancelFlag::new(),
            state: RunState::Idle,
        })
    }

    /// Replace the resource monitor consulted at checkpoints.
    pub fn with_monitor(mut self, monitor: Arc<dyn ResourceMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Use an externally owned stop flag.
    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn options(&self) -> &WatermarkOptions {
        &self.options
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Watermark every page of `input` with `watermark` and write `output`.
    ///
    /// Page failures do not abort the run; they show up in the report.
    #[instrument(name = "watermark_run", skip_all, fields(input = %input.display()))]
    pub fn run(&mut self, input: &Path, output: &Path, watermark: &Path) -> Result<RunReport> {
        let result = self.execute(input, output, watermark);
        match &result {
            Ok(_) => self.transition(RunState::Done),
            Err(e) => {
                error!(error = %e, "Watermarking failed");
                self.transition(RunState::Failed);
            }
        }
        result
    }

    fn transition(&mut self, next: RunState) {
        debug!(from = ?self.state, to = ?next, "Pipeline state");
        self.state = next;
    }

    fn execute(&mut self, input: &Path, output: &Path, watermark: &Path) -> Result<RunReport> {
        let total_start = Instant::now();

        self.transition(RunState::Preparing);
        let asset = WatermarkAsset::prepare(
            watermark,
            self.options.opacity,
            self.options.asset_dir.as_deref(),
        )?;
        let preparation = total_start.elapsed();
        // Any early return from here on drops `asset`, which deletes its file.

        self.transition(RunState::Running);
        let work_start = Instant::now();
        let mut doc = Document::load(input).map_err(|e| DocumentError::Load {
            path: input.to_path_buf(),
            message: e.to_string(),
        })?;
        let watermark_id = embed_watermark(&mut doc, &asset)?;

        let pages: Vec<PageSnapshot> = doc
            .get_pages()
            .values()
            .enumerate()
            .map(|(index, page_id)| PageSnapshot::capture(&doc, index, *page_id))
            .collect();
        let total = pages.len();

        let pool = WorkerPool::new(self.options.workers, self.options.max_workers);
        let controller = AdaptiveController::new(
            Arc::clone(&self.monitor),
            self.options.thresholds,
            self.options.checkpoint_interval,
            pool.ceiling(),
        );
        info!(
            total_pages = total,
            workers = pool.current(),
            ceiling = pool.ceiling(),
            "Watermarking pages"
        );

        let mut composites: Vec<PageComposite> = Vec::with_capacity(total);
        let mut outcomes: Vec<PageOutcome> = Vec::with_capacity(total);
        let mut completed = 0usize;
        let mut resizes = 0usize;
        let profile = self.options.profile;

        pool.run(
            &pages,
            &self.cancel,
            &Span::current(),
            |page| {
                let start = Instant::now();
                let result = composite(page, watermark_id);
                (page.index, result, start.elapsed())
            },
            |(index, result, elapsed)| {
                completed += 1;
                let error = match result {
                    Ok(page_composite) => {
                        composites.push(page_composite);
                        None
                    }
                    Err(e) => {
                        error!(page = index, error = %e, "Failed to watermark page");
                        Some(e)
                    }
                };
                outcomes.push(PageOutcome {
                    index,
                    error,
                    elapsed,
                });
                if profile {
                    debug!(
                        page = index,
                        elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                        "Page timing"
                    );
                }
                info!("Watermarked page {}/{}", completed, total);

                if controller.is_checkpoint(completed) && completed < total {
                    let decision = controller.evaluate(pool.current());
                    if decision.changes() {
                        match pool.compare_and_resize(decision.current, decision.suggested) {
                            Ok(now) => {
                                resizes += 1;
                                info!(
                                    cpu = decision.sample.cpu_percent,
                                    memory = decision.sample.memory_percent,
                                    from = decision.current,
                                    to = now,
                                    "Adjusted worker count"
                                );
                            }
                            Err(actual) => warn!(
                                expected = decision.current,
                                actual,
                                "Worker count changed during checkpoint, skipping resize"
                            ),
                        }
                    }
                }
            },
        );

        if self.cancel.is_cancelled() {
            warn!(completed, total, "Cancelled, discarding partial output");
            return Err(WatermarkError::Cancelled);
        }
        drop(pages);

        // Apply in page order so the output does not depend on scheduling.
        composites.sort_by_key(|c| c.index);
        for page_composite in composites {
            let index = page_composite.index;
            if let Err(e) = page_composite.apply(&mut doc) {
                error!(page = index, error = %e, "Failed to write page");
                if let Some(outcome) = outcomes.iter_mut().find(|o| o.index == index) {
                    outcome.error = Some(e);
                }
            }
        }
        outcomes.sort_by_key(|o| o.index);
        let watermarking = work_start.elapsed();

        self.transition(RunState::Saving);
        let save_start = Instant::now();
        if self.cancel.is_cancelled() {
            warn!("Cancelled before saving, discarding output");
            return Err(WatermarkError::Cancelled);
        }
        if self.options.compress_streams {
            doc.compress();
        }
        save_document(&mut doc, output, &self.cancel)?;
        let save = save_start.elapsed();
        let watermarking_and_saving = work_start.elapsed();
        info!(output = %output.display(), "Watermarked PDF saved");

        let asset_path = asset.path().to_path_buf();
        if let Err(e) = asset.remove() {
            error!(error = %e, "Failed to remove watermark asset");
        }

        let mut timing = TimingReport {
            watermark_preparation: preparation.as_secs_f64(),
            watermarking: watermarking.as_secs_f64(),
            save: save.as_secs_f64(),
            watermarking_and_saving: watermarking_and_saving.as_secs_f64(),
            total_time: total_start.elapsed().as_secs_f64(),
            ..Default::default()
        };
        if profile {
            let page_times: Vec<Duration> = outcomes.iter().map(|o| o.elapsed).collect();
            timing = timing.with_page_stats(&page_times);
        }

        let report = RunReport {
            total_pages: total,
            outcomes,
            final_workers: pool.current(),
            resizes,
            timing,
            asset_path,
        };
        let failed = report.failed_pages().count();
        if failed > 0 {
            error!(failed, total, "Some pages could not be watermarked");
        } else {
            info!(total, "All pages watermarked");
        }
        Ok(report)
    }
}

/// Write `doc` next to `output` and rename it into place, so a failed or
/// interrupted save never leaves a truncated file at `output`. A cancel raised
/// while writing discards the temporary file instead of renaming it.
fn save_document(doc: &mut Document, output: &Path, cancel: &CancelFlag) -> Result<()> {
    let save_err = |message: String| DocumentError::Save {
        path: output.to_path_buf(),
        message,
    };

    let dir = output
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::Builder::new()
        .prefix(".watermarked-")
        .suffix(".pdf")
        .tempfile_in(dir)
        .map_err(|e| save_err(e.to_string()))?;

    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        doc.save_to(&mut writer)
            .map_err(|e| save_err(e.to_string()))?;
        writer.flush().map_err(|e| save_err(e.to_string()))?;
    }

    if cancel.is_cancelled() {
        warn!("Cancelled while saving, discarding output");
        return Err(WatermarkError::Cancelled);
    }
    tmp.persist(output)
        .map_err(|e| save_err(e.error.to_string()))?;
    Ok(())
}
