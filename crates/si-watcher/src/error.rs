//! Error types for the si-watcher crate.

use camino::Utf8PathBuf;

/// Errors that can occur while watching library roots.
///
/// # Error Recovery Strategy
///
/// - **Watch setup** ([`WatchError::Watch`], [`WatchError::PathNotFound`]):
///   only the affected root goes unwatched; other roots keep working
/// - **Backend** ([`WatchError::Notify`]): fatal, no root can be watched
/// - **Channel closed** ([`WatchError::ChannelClosed`]): fatal, the watcher
///   thread is gone
/// - **Non-UTF-8 path** ([`WatchError::NonUtf8Path`]): recoverable, the
///   event is skipped
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// The notify backend could not be created.
    #[error("notify watcher error: {0}")]
    Notify(#[from] notify::Error),

    /// A root could not be registered with the backend.
    #[error("failed to watch {path}: {source}")]
    Watch {
        /// The root that could not be watched.
        path: Utf8PathBuf,
        /// The underlying notify error.
        #[source]
        source: notify::Error,
    },

    /// A root does not exist.
    #[error("path does not exist: {0}")]
    PathNotFound(Utf8PathBuf),

    /// The watcher thread ended unexpectedly.
    #[error("event channel closed unexpectedly")]
    ChannelClosed,

    /// An event path is not valid UTF-8.
    #[error("path is not valid UTF-8: {}", _0.display())]
    NonUtf8Path(std::path::PathBuf),
}

impl WatchError {
    /// Creates a new [`WatchError::PathNotFound`] error.
    #[inline]
    pub fn path_not_found(path: impl Into<Utf8PathBuf>) -> Self {
        Self::PathNotFound(path.into())
    }

    /// Creates a new [`WatchError::Watch`] error.
    #[inline]
    pub fn watch(path: impl Into<Utf8PathBuf>, source: notify::Error) -> Self {
        Self::Watch {
            path: path.into(),
            source,
        }
    }

    /// Creates a new [`WatchError::NonUtf8Path`] error.
    #[inline]
    pub fn non_utf8_path(path: impl Into<std::path::PathBuf>) -> Self {
        Self::NonUtf8Path(path.into())
    }

    /// Returns `true` if watching can continue after this error.
    ///
    /// Root-level errors are recoverable: the other roots stay watched.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NonUtf8Path(_) | Self::Watch { .. } | Self::PathNotFound(_)
        )
    }

    /// Returns `true` if the watcher cannot continue.
    #[inline]
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !self.is_recoverable()
    }

    /// Returns the root associated with this error, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Utf8PathBuf> {
        match self {
            Self::PathNotFound(path) | Self::Watch { path, .. } => Some(path),
            Self::Notify(_) | Self::ChannelClosed | Self::NonUtf8Path(_) => None,
        }
    }
}
