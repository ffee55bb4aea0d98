//! Library watching with debounced scan triggers.
//!
//! This crate turns filesystem notifications from the `notify` crate into
//! requests to rescan library paths.
//!
//! # Overview
//!
//! - [`FileWatcher`] runs the `notify` backend on a blocking thread and
//!   streams [`FileEvent`]s to async code
//! - [`EventRouter`] maps each event to the path worth scanning: media files
//!   and directories map to themselves, captions and scripts to their video
//! - [`Debouncer`] keeps one timer per path and calls the [`ScanTrigger`]
//!   once a path has been quiet for the configured delay
//! - [`LibraryWatcher`] ties these together and restarts the watch when the
//!   set of library roots changes
//!
//! # Architecture
//!
//! ```text
//! notify backend ──► FileWatcher ──► EventRouter ──► Debouncer ──► ScanTrigger
//!  (blocking)         (mpsc)          (auxiliary      (per-path      (enqueue a
//!                                      mapping)        timers)        scan job)
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use camino::{Utf8Path, Utf8PathBuf};
//! use si_core::{ScanConfig, WatchConfig};
//! use si_scanner::fs::OsFs;
//! use si_watcher::{EventRouter, LibraryWatcher, ScanTrigger};
//!
//! # async fn example() -> Result<(), si_watcher::WatchError> {
//! let router = EventRouter::new(Arc::new(OsFs), &ScanConfig::default());
//! let trigger: Arc<dyn ScanTrigger> = Arc::new(|path: &Utf8Path| {
//!     println!("scan {path}");
//! });
//!
//! let mut watcher = LibraryWatcher::new(WatchConfig::default(), router, trigger);
//! watcher.start(vec![Utf8PathBuf::from("/media/library")]).await?;
//! # Ok(())
//! # }
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod associate;
pub mod debounce;
pub mod error;
pub mod events;
pub mod library;
pub mod watcher;

pub use associate::{AuxiliaryKind, AuxiliaryResolver};
pub use debounce::{Debouncer, ScanTrigger};
pub use error::WatchError;
pub use events::{ChangeKind, FileEvent};
pub use library::{EventRouter, LibraryWatcher, owning_root};
pub use watcher::FileWatcher;
