//! Progress reporting seam between long-running work and its observer.
//!
//! The scanner and generation tasks report through [`ProgressReporter`]; the
//! job subsystem provides the implementation that feeds job status.

/// Receives progress updates from a running unit of work.
///
/// # Examples
///
/// ```
/// use si_core::{NoopProgress, ProgressReporter};
///
/// let progress = NoopProgress;
/// progress.set_total(3);
/// progress.execute_task("hashing a.mp4", &mut || {});
/// progress.increment();
/// ```
pub trait ProgressReporter: Send + Sync {
    /// Sets the number of units the work will perform.
    fn set_total(&self, total: u64);

    /// Records one completed unit.
    fn increment(&self);

    /// Runs `task`, labelling the progress with `description` while it runs.
    fn execute_task(&self, description: &str, task: &mut dyn FnMut());
}

/// A reporter that discards every update.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    #[inline]
    fn set_total(&self, _total: u64) {}

    #[inline]
    fn increment(&self) {}

    #[inline]
    fn execute_task(&self, _description: &str, task: &mut dyn FnMut()) {
        task();
    }
}

impl<P: ProgressReporter + ?Sized> ProgressReporter for std::sync::Arc<P> {
    fn set_total(&self, total: u64) {
        (**self).set_total(total);
    }

    fn increment(&self) {
        (**self).increment();
    }

    fn execute_task(&self, description: &str, task: &mut dyn FnMut()) {
        (**self).execute_task(description, task);
    }
}
