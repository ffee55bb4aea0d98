//! Error types for the si-scanner crate.
//!
//! This module provides [`ScanError`] for failures during a scan pass and
//! [`FingerprintError`] for failures while hashing a single file.

use std::io;

use camino::Utf8PathBuf;

use crate::repository::RepositoryError;

/// Errors that can occur while computing fingerprints for one file.
#[derive(Debug, thiserror::Error)]
pub enum FingerprintError {
    /// The file is too small for a partial-content hash.
    #[error("file size {size} is too small for oshash")]
    TooSmall {
        /// Size of the file in bytes.
        size: u64,
    },

    /// Reading the file content failed.
    #[error("failed to read content: {0}")]
    Io(#[from] io::Error),

    /// Decoding or composing frame images failed.
    #[error("failed to process frames: {0}")]
    Image(#[from] image::ImageError),

    /// The frame sampler produced an unusable result.
    #[error("frame sampling failed: {0}")]
    Sampling(String),
}

/// Errors that can occur during scanning operations.
///
/// # Error Recovery Strategy
///
/// - **Per-entry errors** ([`ScanError::Read`], [`ScanError::Fingerprint`],
///   [`ScanError::Decorate`], [`ScanError::Handler`], [`ScanError::Walk`]):
///   log a warning, skip the entry, continue the scan
/// - **Repository errors** ([`ScanError::Repository`]): fatal, the scan stops
/// - **Root and configuration errors**: fatal, reported before any work
///
/// # Examples
///
/// ```
/// use si_scanner::ScanError;
///
/// fn handle_error(err: &ScanError) {
///     if err.is_recoverable() {
///         eprintln!("skipping {:?}: {err}", err.path());
///     } else {
///         eprintln!("scan failed: {err}");
///     }
/// }
/// ```
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    /// Failed to list a directory.
    #[error("failed to walk directory {path}: {source}")]
    Walk {
        /// The directory that couldn't be listed.
        path: Utf8PathBuf,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Failed to stat or read a file.
    #[error("failed to read file {path}: {source}")]
    Read {
        /// The path of the file that couldn't be read.
        path: Utf8PathBuf,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Failed to fingerprint a file.
    #[error("failed to fingerprint {path}: {source}")]
    Fingerprint {
        /// The path of the file.
        path: Utf8PathBuf,
        /// The underlying fingerprint error.
        #[source]
        source: FingerprintError,
    },

    /// A decorator failed to read media properties.
    #[error("failed to decorate {path}: {source}")]
    Decorate {
        /// The path of the file.
        path: Utf8PathBuf,
        /// The underlying decoder error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A [`FileHandler`](crate::handler::FileHandler) failed.
    #[error("handler {handler} failed for {path}: {source}")]
    Handler {
        /// The path of the file.
        path: Utf8PathBuf,
        /// Name of the failing handler.
        handler: &'static str,
        /// The handler's error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The repository rejected an operation.
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// A scan root does not exist or is not a directory.
    #[error("scan root not found: {0}")]
    RootNotFound(Utf8PathBuf),

    /// Invalid scanner configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The scan was cancelled before completing.
    #[error("scan cancelled")]
    Cancelled,

    /// A path is not valid UTF-8.
    #[error("path is not valid UTF-8: {}", _0.display())]
    NonUtf8Path(std::path::PathBuf),
}

impl ScanError {
    /// Creates a new [`ScanError::Walk`] error.
    #[inline]
    pub fn walk(path: impl Into<Utf8PathBuf>, source: io::Error) -> Self {
        Self::Walk {
            path: path.into(),
            source,
        }
    }

    /// Creates a new [`ScanError::Read`] error.
    #[inline]
    pub fn read(path: impl Into<Utf8PathBuf>, source: io::Error) -> Self {
        Self::Read {
            path: path.into(),
            source,
        }
    }

    /// Creates a new [`ScanError::Fingerprint`] error.
    #[inline]
    pub fn fingerprint(path: impl Into<Utf8PathBuf>, source: FingerprintError) -> Self {
        Self::Fingerprint {
            path: path.into(),
            source,
        }
    }

    /// Creates a new [`ScanError::Decorate`] error.
    #[inline]
    pub fn decorate(
        path: impl Into<Utf8PathBuf>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Decorate {
            path: path.into(),
            source: source.into(),
        }
    }

    /// Creates a new [`ScanError::Handler`] error.
    #[inline]
    pub fn handler(
        path: impl Into<Utf8PathBuf>,
        handler: &'static str,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Handler {
            path: path.into(),
            handler,
            source: source.into(),
        }
    }

    /// Creates a new [`ScanError::Config`] error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Returns `true` if this error is recoverable (scanning can continue).
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Walk { .. }
                | Self::Read { .. }
                | Self::Fingerprint { .. }
                | Self::Decorate { .. }
                | Self::Handler { .. }
        )
    }

    /// Returns `true` if this error is fatal (scanning should stop).
    #[inline]
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !self.is_recoverable()
    }

    /// Returns the path associated with this error, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Utf8PathBuf> {
        match self {
            Self::Walk { path, .. }
            | Self::Read { path, .. }
            | Self::Fingerprint { path, .. }
            | Self::Decorate { path, .. }
            | Self::Handler { path, .. }
            | Self::RootNotFound(path) => Some(path),
            Self::Repository(_) | Self::Config(_) | Self::Cancelled | Self::NonUtf8Path(_) => None,
        }
    }
}
