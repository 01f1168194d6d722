//! Watermark preprocessing
//!
//! Decodes the source image, scales its alpha channel to the requested opacity
//! and persists the result as a PNG in a process-unique temporary file. The
//! asset is shared read-only by every page task for the rest of the run.

use crate::error::AssetError;
use image::{DynamicImage, ImageFormat, RgbaImage};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument, warn};

/// Opacity-adjusted copy of the watermark image.
///
/// The backing file is deleted when the asset is dropped, so every exit path
/// of a run cleans it up. [`WatermarkAsset::remove`] does the same but reports
/// failures.
#[derive(Debug)]
pub struct WatermarkAsset {
    image: RgbaImage,
    opacity: f32,
    path: PathBuf,
    file: Option<NamedTempFile>,
}

/// Load `source`, scale its alpha by `opacity` and write the asset to the OS
/// temporary directory.
pub fn prepare_watermark(source: &Path, opacity: f32) -> Result<WatermarkAsset, AssetError> {
    WatermarkAsset::prepare(source, opacity, None)
}

impl WatermarkAsset {
    /// Load `source`, scale its alpha by `opacity` and write the asset into
    /// `dir` (or the OS temporary directory).
    #[instrument(skip_all, fields(source = %source.display(), opacity))]
    pub fn prepare(
        source: &Path,
        opacity: f32,
        dir: Option<&Path>,
    ) -> Result<Self, AssetError> {
        check_opacity(opacity)?;

        let img = image::open(source).map_err(|e| AssetError::Decode {
            path: source.to_path_buf(),
            message: e.to_string(),
        })?;
        if !img.color().has_alpha() {
            debug!("Watermark has no alpha channel, treating it as fully opaque");
        }

        Self::from_image(img, opacity, dir)
    }

    /// Build an asset from an already decoded image.
    pub fn from_image(
        img: DynamicImage,
        opacity: f32,
        dir: Option<&Path>,
    ) -> Result<Self, AssetError> {
        check_opacity(opacity)?;

        // RGBA8 conversion synthesizes an opaque alpha channel when missing.
        let mut rgba = img.to_rgba8();
        scale_alpha(&mut rgba, opacity);

        let mut builder = tempfile::Builder::new();
        builder.prefix("watermark-").suffix(".png");
        let mut file = match dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .map_err(|e| AssetError::Write(e.to_string()))?;

        rgba.write_to(file.as_file_mut(), ImageFormat::Png)
            .map_err(|e| AssetError::Write(e.to_string()))?;

        let path = file.path().to_path_buf();
        info!(
            width = rgba.width(),
            height = rgba.height(),
            path = %path.display(),
            "Watermark prepared"
        );

        Ok(Self {
            image: rgba,
            opacity,
            path,
            file: Some(file),
        })
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn opacity(&self) -> f32 {
        self.opacity
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Location of the persisted PNG. It no longer exists once the asset is
    /// removed or dropped.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the backing file now.
    pub fn remove(mut self) -> Result<(), AssetError> {
        match self.file.take() {
            Some(file) => file.close().map_err(|source| AssetError::Remove {
                path: self.path.clone(),
                source,
            })?,
            None => warn!(path = %self.path.display(), "Watermark asset already removed"),
        }
        debug!(path = %self.path.display(), "Watermark asset removed");
        Ok(())
    }
}

fn check_opacity(opacity: f32) -> Result<(), AssetError> {
    if (0.0..=1.0).contains(&opacity) {
        Ok(())
    } else {
        Err(AssetError::InvalidOpacity(opacity))
    }
}

/// Multiply every alpha sample by `opacity`, rounding to the nearest integer.
/// Colour channels are left untouched.
pub fn scale_alpha(image: &mut RgbaImage, opacity: f32) {
    for pixel in image.pixels_mut() {
        pixel.0[3] = scale_sample(pixel.0[3], opacity);
    }
}

fn scale_sample(alpha: u8, opacity: f32) -> u8 {
    (f64::from(alpha) * f64::from(opacity)).round().clamp(0.0, 255.0) as u8
}
