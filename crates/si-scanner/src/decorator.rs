//! Per-kind enrichment of new and changed files.
//!
//! A [`Decorator`] fills in [`FileDetails`] for the media kinds it accepts.
//! The scanner runs every accepting decorator after fingerprinting, on the
//! same worker as the fingerprint.

use std::io::BufReader;

use image::ImageReader;
use si_core::{File, FileDetails, ImageDetails};
use tracing::trace;

use crate::error::ScanError;
use crate::filter::MediaKind;
use crate::fs::FileSystem;

/// Reads kind-specific properties of a file.
pub trait Decorator: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Returns `true` if this decorator handles files of `kind`.
    fn accepts(&self, kind: MediaKind) -> bool;

    /// Fills in details for `file`, reading content through `fs`.
    ///
    /// # Errors
    ///
    /// Returns [`ScanError::Read`] or [`ScanError::Decorate`] if the file
    /// can't be inspected.
    fn decorate(&self, fs: &dyn FileSystem, file: &mut File) -> Result<(), ScanError>;
}

/// Reads image dimensions and container format from the file header.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageDecorator;

impl Decorator for ImageDecorator {
    fn name(&self) -> &'static str {
        "image"
    }

    fn accepts(&self, kind: MediaKind) -> bool {
        kind == MediaKind::Image
    }

    fn decorate(&self, fs: &dyn FileSystem, file: &mut File) -> Result<(), ScanError> {
        let path = file.path().to_owned();
        let reader = fs.open(&path).map_err(|e| ScanError::read(&path, e))?;
        let reader = ImageReader::new(BufReader::new(reader))
            .with_guessed_format()
            .map_err(|e| ScanError::read(&path, e))?;

        let format = reader
            .format()
            .and_then(|f| f.extensions_str().first())
            .map(|ext| (*ext).to_owned());
        let (width, height) = reader
            .into_dimensions()
            .map_err(|e| ScanError::decorate(&path, e))?;

        trace!(path = %path, width, height, "Read image dimensions");
        file.details = FileDetails::Image(ImageDetails {
            width,
            height,
            format,
        });
        Ok(())
    }
}
