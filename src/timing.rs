//! Run timing report
//!
//! Emitted once per successful run as a single JSON line; phase durations are
//! in seconds.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingReport {
    /// Decoding the watermark and scaling its alpha.
    pub watermark_preparation: f64,
    /// Opening the document, embedding the watermark and compositing pages.
    pub watermarking: f64,
    /// Compressing and writing the output document.
    pub save: f64,
    pub watermarking_and_saving: f64,
    pub total_time: f64,
    /// Fastest single page. Only reported when profiling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_mean: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_max: Option<f64>,
}

impl TimingReport {
    /// Fill the per-page statistics from individual page durations. Leaves
    /// them unset when there were no pages.
    pub fn with_page_stats(mut self, pages: &[Duration]) -> Self {
        if pages.is_empty() {
            return self;
        }
        let secs: Vec<f64> = pages.iter().map(Duration::as_secs_f64).collect();
        self.page_min = secs.iter().copied().reduce(f64::min);
        self.page_max = secs.iter().copied().reduce(f64::max);
        self.page_mean = Some(secs.iter().sum::<f64>() / secs.len() as f64);
        self
    }

    /// One-line JSON record for the end of the output stream.
    pub fn to_json_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
