//! Configuration structures for stash-ingest.
//!
//! This module provides configuration types for every component:
//!
//! - [`LibraryConfig`] - A library root and which media kinds it contributes
//! - [`ScanConfig`] - Extensions, exclude patterns, fingerprinting, parallelism
//! - [`WatchConfig`] - Auto-scan toggle and debounce window
//! - [`JobConfig`] - Job concurrency, task pool sizing, history length
//! - [`Config`] - Root configuration combining all settings
//!
//! All configuration types implement [`Default`] and deserialize with
//! `#[serde(default)]`, so a configuration file only needs to name the values
//! it overrides.
//!
//! # Examples
//!
//! ```
//! use si_core::Config;
//!
//! let json = r#"{ "libraries": [{ "path": "/media/videos" }], "watch": { "debounce_ms": 250 } }"#;
//! let config: Config = serde_json::from_str(json).unwrap();
//! assert_eq!(config.libraries.len(), 1);
//! assert_eq!(config.watch.debounce_ms, 250);
//! assert_eq!(config.jobs.max_concurrent_jobs, 1);
//! ```

use std::num::NonZeroUsize;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default extensions treated as video files.
pub const DEFAULT_VIDEO_EXTENSIONS: &[&str] = &[
    "m4v", "mp4", "mov", "wmv", "avi", "mpg", "mpeg", "rmvb", "rm", "flv", "asf", "mkv", "webm",
];

/// Default extensions treated as image files.
pub const DEFAULT_IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp"];

/// Default extensions treated as zip galleries.
pub const DEFAULT_GALLERY_EXTENSIONS: &[&str] = &["zip", "cbz"];

/// Default caption extensions associated with video files.
pub const DEFAULT_CAPTION_EXTENSIONS: &[&str] = &["vtt", "srt"];

/// Default interactive script extensions associated with video files.
pub const DEFAULT_SCRIPT_EXTENSIONS: &[&str] = &["funscript"];

fn owned(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| (*s).to_owned()).collect()
}

/// A single library root.
///
/// # Examples
///
/// ```
/// use si_core::LibraryConfig;
///
/// let lib = LibraryConfig::new("/media/videos");
/// assert!(!lib.exclude_video);
/// assert!(!lib.exclude_image);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    /// Absolute path to the library root.
    pub path: Utf8PathBuf,

    /// Skip video files found under this root.
    pub exclude_video: bool,

    /// Skip image and gallery files found under this root.
    pub exclude_image: bool,
}

impl LibraryConfig {
    /// Creates a library that contributes every media kind.
    #[must_use]
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            path: path.into(),
            exclude_video: false,
            exclude_image: false,
        }
    }
}

/// Configuration for the scanner.
///
/// # Examples
///
/// ```
/// use si_core::ScanConfig;
///
/// let config = ScanConfig::default();
/// assert!(config.video_extensions.iter().any(|e| e == "mp4"));
/// assert!((config.rename_match_ratio - 0.5).abs() < f64::EPSILON);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Video file extensions, without the leading dot.
    pub video_extensions: Vec<String>,

    /// Image file extensions, without the leading dot.
    pub image_extensions: Vec<String>,

    /// Zip gallery extensions, without the leading dot.
    pub gallery_extensions: Vec<String>,

    /// Caption file extensions associated with a sibling video.
    pub caption_extensions: Vec<String>,

    /// Interactive script extensions associated with a sibling video.
    pub script_extensions: Vec<String>,

    /// Regular expressions excluding video paths.
    pub exclude_video_patterns: Vec<String>,

    /// Regular expressions excluding image and gallery paths.
    pub exclude_image_patterns: Vec<String>,

    /// Compute a whole-file cryptographic checksum during scans.
    pub calculate_checksum: bool,

    /// Compute a perceptual hash for video files during scans.
    pub calculate_phash: bool,

    /// Number of files fingerprinted concurrently.
    /// `None` means use all available CPU cores.
    pub parallel_tasks: Option<usize>,

    /// Follow symbolic links to their targets.
    pub follow_links: bool,

    /// Minimum fraction of a folder's known files that must be found at a new
    /// location for the folder to be treated as moved.
    pub rename_match_ratio: f64,

    /// Directory holding generated artifacts, never scanned.
    pub generated_path: Option<Utf8PathBuf>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            video_extensions: owned(DEFAULT_VIDEO_EXTENSIONS),
            image_extensions: owned(DEFAULT_IMAGE_EXTENSIONS),
            gallery_extensions: owned(DEFAULT_GALLERY_EXTENSIONS),
            caption_extensions: owned(DEFAULT_CAPTION_EXTENSIONS),
            script_extensions: owned(DEFAULT_SCRIPT_EXTENSIONS),
            exclude_video_patterns: Vec::new(),
            exclude_image_patterns: Vec::new(),
            calculate_checksum: false,
            calculate_phash: false,
            parallel_tasks: None,
            follow_links: true,
            rename_match_ratio: 0.5,
            generated_path: None,
        }
    }
}

impl ScanConfig {
    /// Returns the effective number of concurrent fingerprinting tasks.
    #[must_use]
    pub fn effective_parallelism(&self) -> usize {
        self.parallel_tasks
            .filter(|n| *n > 0)
            .unwrap_or_else(available_cpus)
    }
}

/// Configuration for the filesystem watcher.
///
/// # Examples
///
/// ```
/// use si_core::WatchConfig;
///
/// let config = WatchConfig::default();
/// assert_eq!(config.debounce_ms, 1000);
/// assert!(config.recursive);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Whether library roots are watched and rescanned automatically.
    pub enabled: bool,

    /// Quiet period in milliseconds before a changed path is scanned.
    ///
    /// Every new event for the same path restarts the window.
    pub debounce_ms: u64,

    /// Whether to watch subdirectories recursively.
    pub recursive: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: 1000,
            recursive: true,
        }
    }
}

/// Configuration for the job manager and task queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Number of jobs allowed to run at the same time.
    pub max_concurrent_jobs: usize,

    /// Worker count for task queues created by jobs.
    /// `None` means use all available CPU cores.
    pub task_parallelism: Option<usize>,

    /// Number of tasks that may wait in a queue before submission blocks.
    pub task_queue_capacity: usize,

    /// Number of finished jobs kept for inspection.
    pub history_size: usize,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 1,
            task_parallelism: None,
            task_queue_capacity: 1000,
            history_size: 10,
        }
    }
}

impl JobConfig {
    /// Returns the effective task worker count.
    #[must_use]
    pub fn effective_task_parallelism(&self) -> usize {
        self.task_parallelism
            .filter(|n| *n > 0)
            .unwrap_or_else(available_cpus)
    }
}

/// Root configuration for stash-ingest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Library roots to scan and watch.
    pub libraries: Vec<LibraryConfig>,

    /// Scanner configuration.
    pub scan: ScanConfig,

    /// Watcher configuration.
    pub watch: WatchConfig,

    /// Job subsystem configuration.
    pub jobs: JobConfig,
}

impl Config {
    /// Loads a configuration file and validates it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Parse`] if it is not valid JSON, or any error from
    /// [`Config::validate`].
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration as pretty-printed JSON.
    pub fn save(&self, path: &Utf8Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Checks option values that would make scanning meaningless.
    ///
    /// Library roots are not required to exist here; missing roots are
    /// reported by the scan that tries to walk them.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for lib in &self.libraries {
            if !lib.path.is_absolute() {
                return Err(ConfigError::InvalidPath {
                    path: lib.path.clone(),
                    reason: "library paths must be absolute".to_owned(),
                });
            }
        }

        if self.scan.video_extensions.is_empty()
            && self.scan.image_extensions.is_empty()
            && self.scan.gallery_extensions.is_empty()
        {
            return Err(ConfigError::invalid_option(
                "scan",
                "at least one media extension is required",
            ));
        }

        if self.scan.parallel_tasks == Some(0) {
            return Err(ConfigError::invalid_option(
                "scan.parallel_tasks",
                "must be positive",
            ));
        }

        let ratio = self.scan.rename_match_ratio;
        if ratio.is_nan() || ratio <= 0.0 || ratio > 1.0 {
            return Err(ConfigError::invalid_option(
                "scan.rename_match_ratio",
                "must be in (0, 1]",
            ));
        }

        if self.jobs.max_concurrent_jobs == 0 {
            return Err(ConfigError::invalid_option(
                "jobs.max_concurrent_jobs",
                "must be positive",
            ));
        }

        if self.jobs.task_queue_capacity == 0 {
            return Err(ConfigError::invalid_option(
                "jobs.task_queue_capacity",
                "must be positive",
            ));
        }

        Ok(())
    }

    /// Returns the library whose root contains `path`, preferring the deepest.
    #[must_use]
    pub fn library_for(&self, path: &Utf8Path) -> Option<&LibraryConfig> {
        self.libraries
            .iter()
            .filter(|lib| path.starts_with(&lib.path))
            .max_by_key(|lib| lib.path.as_str().len())
    }
}

fn available_cpus() -> usize {
    std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
}
