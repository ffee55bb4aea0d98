//! Error types for the si-jobs crate.

use camino::Utf8PathBuf;
use si_scanner::ScanError;
use si_scanner::repository::RepositoryError;

use crate::job::JobId;

/// Errors returned by jobs and the job subsystem.
///
/// A job's own error becomes its `Failed` status message, except
/// [`JobError::Cancelled`], which ends the job as `Cancelled`.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// No active or remembered job has this id.
    #[error("job {0} not found")]
    NotFound(JobId),

    /// The job observed its cancellation token.
    #[error("job cancelled")]
    Cancelled,

    /// The task queue no longer accepts work.
    #[error("task queue is closed")]
    QueueClosed,

    /// A scan run by the job failed.
    #[error(transparent)]
    Scan(#[from] ScanError),

    /// The repository rejected an operation.
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// Reading a file failed.
    #[error("failed to read {path}: {source}")]
    Io {
        /// The file being read.
        path: Utf8PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Any other failure, described by a message.
    #[error("{0}")]
    Failed(String),
}

impl JobError {
    /// Creates a new [`JobError::Io`] error.
    #[inline]
    pub fn io(path: impl Into<Utf8PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a new [`JobError::Failed`] error.
    #[inline]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Returns `true` if this error means the job was cancelled rather than
    /// failed.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Scan(ScanError::Cancelled))
    }
}
