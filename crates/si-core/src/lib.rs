//! Core types, errors, and configuration for stash-ingest.
//!
//! This crate provides the foundational types shared by the scanner, the job
//! subsystem, the watcher, and the CLI:
//!
//! - Domain records ([`File`], [`Folder`], [`Fingerprint`]) addressed by
//!   arena-style identifiers ([`FileId`], [`FolderId`])
//! - Configuration structures loaded from JSON ([`Config`])
//! - [`ConfigError`] for configuration failures
//! - [`ProgressReporter`], the progress seam between work and job status
//! - Type aliases for `FxHashMap`/`FxHashSet`
//!
//! # Crate Dependencies
//!
//! ```text
//! si-cli ──► si-watcher ──► si-core
//!        ├─► si-jobs ─────► si-core
//!        └─► si-scanner ──► si-core
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod hash;
pub mod progress;
pub mod types;

pub use config::{Config, JobConfig, LibraryConfig, ScanConfig, WatchConfig};
pub use error::ConfigError;
pub use hash::{FxHashMap, FxHashSet, fx_hash_map, fx_hash_set};
pub use progress::{NoopProgress, ProgressReporter};
pub use types::{
    BaseFile, File, FileDetails, FileId, Fingerprint, FingerprintKind, Fingerprints, Folder,
    FolderId, ImageDetails, VideoDetails,
};
