//! Bridge from the synchronous `notify` backend to async consumers.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │              Blocking Thread (spawn_blocking)            │
//! │  ┌────────────────────┐          ┌───────────────────┐   │
//! │  │ RecommendedWatcher │ ───────► │ Callback          │   │
//! │  │ (one per root set) │          │ (UTF-8, by kind)  │   │
//! │  └────────────────────┘          └─────────┬─────────┘   │
//! └────────────────────────────────────────────│─────────────┘
//!                                blocking_send │
//!                                              ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                   Async Runtime (tokio)                  │
//! │  FileWatcher::recv() ──► LibraryWatcher event loop       │
//! └──────────────────────────────────────────────────────────┘
//! ```

use camino::{Utf8Path, Utf8PathBuf};
use notify::{RecursiveMode, Watcher};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::WatchError;
use crate::events::{FileEvent, from_notify};

/// Default channel capacity for file events.
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Watches a set of roots and streams their changes.
///
/// Roots that don't exist or can't be registered are skipped with a warning;
/// [`FileWatcher::roots`] lists the ones actually watched.
pub struct FileWatcher {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task_handle: Option<JoinHandle<Result<(), WatchError>>>,
    event_rx: mpsc::Receiver<FileEvent>,
    roots: Vec<Utf8PathBuf>,
    skipped: Vec<WatchError>,
}

impl std::fmt::Debug for FileWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWatcher")
            .field("roots", &self.roots)
            .field("is_running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl FileWatcher {
    /// Starts watching `roots`.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Notify`] if the backend can't be created, or
    /// [`WatchError::ChannelClosed`] if the watcher thread exits during
    /// setup. Per-root failures don't fail the call.
    pub async fn new(roots: &[Utf8PathBuf], recursive: bool) -> Result<Self, WatchError> {
        Self::with_capacity(roots, recursive, DEFAULT_CHANNEL_CAPACITY).await
    }

    /// Starts watching `roots` with a custom event channel capacity.
    ///
    /// # Errors
    ///
    /// See [`FileWatcher::new`].
    pub async fn with_capacity(
        roots: &[Utf8PathBuf],
        recursive: bool,
        channel_capacity: usize,
    ) -> Result<Self, WatchError> {
        let mut skipped = Vec::new();
        let mut resolved = Vec::new();
        for root in roots {
            match root.canonicalize_utf8() {
                Ok(path) => resolved.push(path),
                Err(_) => {
                    warn!(path = %root, "Watch root does not exist");
                    skipped.push(WatchError::path_not_found(root.clone()));
                }
            }
        }

        let (event_tx, event_rx) = mpsc::channel(channel_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let task_handle = tokio::task::spawn_blocking(move || {
            run_watcher_loop(resolved, recursive, event_tx, ready_tx, shutdown_rx)
        });

        let Ok(outcome) = ready_rx.await else {
            return match task_handle.await {
                Ok(Err(e)) => Err(e),
                _ => Err(WatchError::ChannelClosed),
            };
        };
        let (watched, failed) = outcome;
        skipped.extend(failed);

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            task_handle: Some(task_handle),
            event_rx,
            roots: watched,
            skipped,
        })
    }

    /// Receives the next event. Returns `None` once the watcher has stopped.
    pub async fn recv(&mut self) -> Option<FileEvent> {
        self.event_rx.recv().await
    }

    /// Tries to receive an event without waiting.
    pub fn try_recv(&mut self) -> Result<FileEvent, mpsc::error::TryRecvError> {
        self.event_rx.try_recv()
    }

    /// Canonical roots currently watched.
    #[must_use]
    pub fn roots(&self) -> &[Utf8PathBuf] {
        &self.roots
    }

    /// Roots that could not be watched.
    #[must_use]
    pub fn skipped(&self) -> &[WatchError] {
        &self.skipped
    }

    /// Returns `true` if `path` is inside a watched root.
    #[must_use]
    pub fn covers(&self, path: &Utf8Path) -> bool {
        self.roots.iter().any(|root| path.starts_with(root))
    }

    /// Returns `true` while the watcher thread is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some() && self.task_handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stops the backend and waits for the watcher thread to exit.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::ChannelClosed`] if the watcher thread panicked.
    pub async fn shutdown(mut self) -> Result<(), WatchError> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.task_handle.take() {
            match handle.await {
                Ok(result) => result?,
                Err(_join_error) => return Err(WatchError::ChannelClosed),
            }
        }
        Ok(())
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

type Ready = (Vec<Utf8PathBuf>, Vec<WatchError>);

/// Runs the notify backend until shutdown is signalled.
#[allow(clippy::needless_pass_by_value)] // Owned for the blocking task lifetime
fn run_watcher_loop(
    roots: Vec<Utf8PathBuf>,
    recursive: bool,
    event_tx: mpsc::Sender<FileEvent>,
    ready_tx: oneshot::Sender<Ready>,
    shutdown_rx: oneshot::Receiver<()>,
) -> Result<(), WatchError> {
    let tx = event_tx;
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            Ok(event) => {
                for file_event in from_notify(event) {
                    if tx.blocking_send(file_event).is_err() {
                        debug!("Event channel closed, dropping file events");
                        return;
                    }
                }
            }
            Err(error) => warn!(error = %error, "Watcher backend error"),
        }
    })?;

    let mode = if recursive {
        RecursiveMode::Recursive
    } else {
        RecursiveMode::NonRecursive
    };

    let mut watched = Vec::new();
    let mut failed = Vec::new();
    for root in roots {
        match watcher.watch(root.as_std_path(), mode) {
            Ok(()) => {
                info!(path = %root, recursive, "Watching library root");
                watched.push(root);
            }
            Err(e) => {
                warn!(path = %root, error = %e, "Failed to watch library root");
                failed.push(WatchError::watch(root, e));
            }
        }
    }

    let _ = ready_tx.send((watched.clone(), failed));
    let _ = shutdown_rx.blocking_recv();

    for root in &watched {
        let _ = watcher.unwatch(root.as_std_path());
    }
    info!(roots = watched.len(), "File watcher stopped");
    Ok(())
}
