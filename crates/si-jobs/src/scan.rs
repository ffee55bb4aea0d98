//! Scan job: runs a [`Scanner`] pass under job control.

use si_scanner::{ScanError, ScanOptions, Scanner};
use tracing::{info, warn};

use crate::error::JobError;
use crate::job::JobContext;

/// A library scan submitted to the [`JobManager`](crate::JobManager).
///
/// The scan runs on the blocking pool; the job's token and progress handle
/// are passed straight to [`Scanner::scan`].
#[derive(Debug, Clone)]
pub struct ScanJob {
    scanner: Scanner,
    options: ScanOptions,
}

impl ScanJob {
    /// Creates a scan job.
    #[must_use]
    pub const fn new(scanner: Scanner, options: ScanOptions) -> Self {
        Self { scanner, options }
    }

    /// Human-readable description for the job list.
    #[must_use]
    pub fn description(&self) -> String {
        match self.options.paths.as_slice() {
            [] => "Scanning libraries".to_owned(),
            [path] => format!("Scanning {path}"),
            paths => format!("Scanning {} paths", paths.len()),
        }
    }

    /// Runs the scan.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Cancelled`] if the job is cancelled, or
    /// [`JobError::Scan`] for a fatal scan error. Per-file errors are logged
    /// and do not fail the job.
    pub async fn run(self, ctx: JobContext) -> Result<(), JobError> {
        let token = ctx.token.clone();
        let progress = ctx.progress.clone();
        let Self { scanner, options } = self;

        let result = tokio::task::spawn_blocking(move || scanner.scan(&options, &token, &progress))
            .await
            .map_err(|e| JobError::failed(format!("scan task failed: {e}")))?;

        match result {
            Ok(result) => {
                for error in &result.errors {
                    warn!(job_id = %ctx.id, error = %error, "Skipped entry");
                }
                info!(
                    job_id = %ctx.id,
                    new = result.stats.new,
                    updated = result.stats.updated,
                    moved = result.stats.moved,
                    unchanged = result.stats.unchanged,
                    errors = result.stats.errors,
                    "Scan finished"
                );
                Ok(())
            }
            Err(ScanError::Cancelled) => Err(JobError::Cancelled),
            Err(e) => Err(e.into()),
        }
    }
}
