//! Error types for the watermarking pipeline.
//!
//! Asset, document and configuration errors abort a run. Composite errors are
//! page-scoped and travel inside a [`crate::PageOutcome`] instead.

use std::path::PathBuf;
use thiserror::Error;

/// Invalid [`crate::WatermarkOptions`] values. Raised before any work starts.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("opacity must be between 0 and 1, got {0}")]
    InvalidOpacity(f32),
    #[error("worker count must be at least 1")]
    ZeroWorkers,
    #[error("worker count {workers} exceeds the worker ceiling {ceiling}")]
    WorkersAboveCeiling { workers: usize, ceiling: usize },
    #[error("{name} threshold must be in (0, 100], got {value}")]
    InvalidThreshold { name: &'static str, value: f32 },
    #[error("checkpoint interval must be at least 1 page")]
    ZeroCheckpoint,
    #[error("resource sampling window must be non-zero")]
    ZeroSampleWindow,
}

/// Failures while turning the source image into a watermark asset.
#[derive(Debug, Error)]
pub enum AssetError {
    #[error("failed to decode watermark image {path:?}: {message}")]
    Decode { path: PathBuf, message: String },
    #[error("opacity must be between 0 and 1, got {0}")]
    InvalidOpacity(f32),
    #[error("failed to write watermark asset: {0}")]
    Write(String),
    #[error("failed to remove watermark asset {path:?}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failures opening, preparing or persisting the PDF itself.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("failed to load PDF {path:?}: {message}")]
    Load { path: PathBuf, message: String },
    #[error("failed to embed watermark: {0}")]
    Embed(String),
    #[error("failed to save PDF {path:?}: {message}")]
    Save { path: PathBuf, message: String },
}

/// A single page could not be watermarked. Sibling pages are unaffected.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("page {page_index}: {message}")]
pub struct CompositeError {
    pub page_index: usize,
    pub message: String,
}

impl CompositeError {
    pub fn new(page_index: usize, message: impl Into<String>) -> Self {
        Self {
            page_index,
            message: message.into(),
        }
    }
}

/// A host utilization reading failed. Never fatal; the reading defaults to 0.
#[derive(Debug, Error)]
pub enum ResourceSampleError {
    #[error("failed to read {source_name}: {message}")]
    Read {
        source_name: &'static str,
        message: String,
    },
    #[error("{0} is not available on this platform")]
    Unsupported(&'static str),
}

/// Fatal errors that end a run.
#[derive(Debug, Error)]
pub enum WatermarkError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Asset(#[from] AssetError),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error("watermarking was cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, WatermarkError>;
