//! Progress handle shared between a running job and its observers.
//!
//! The running work writes through [`ProgressReporter`]; the manager reads
//! [`JobProgress::percent`] and [`JobProgress::current_tasks`] when building
//! a [`JobInfo`](crate::JobInfo). Every write also wakes
//! [`JobProgress::changed`], which the manager turns into throttled
//! [`JobEvent::Updated`](crate::JobEvent::Updated) notifications.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use si_core::ProgressReporter;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct State {
    total: AtomicU64,
    processed: AtomicU64,
    has_total: AtomicBool,
    tasks: Mutex<Vec<String>>,
    changed: Notify,
}

/// Cloneable progress handle of one job.
///
/// # Examples
///
/// ```
/// use si_core::ProgressReporter;
/// use si_jobs::JobProgress;
///
/// let progress = JobProgress::new();
/// assert_eq!(progress.percent(), None);
///
/// progress.set_total(4);
/// progress.increment();
/// assert_eq!(progress.percent(), Some(25.0));
/// ```
#[derive(Debug, Clone, Default)]
pub struct JobProgress {
    state: Arc<State>,
}

impl JobProgress {
    /// Creates a handle with no total.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `n` units to the total.
    pub fn add_total(&self, n: u64) {
        self.state.total.fetch_add(n, Ordering::Relaxed);
        self.state.has_total.store(true, Ordering::Relaxed);
        self.touch();
    }

    /// Sets the number of completed units.
    pub fn set_processed(&self, n: u64) {
        self.state.processed.store(n, Ordering::Relaxed);
        self.touch();
    }

    /// Waits until the progress changes.
    ///
    /// Changes made while nobody waits are remembered as one pending wakeup,
    /// so bursts of writes resolve a single call.
    pub async fn changed(&self) {
        self.state.changed.notified().await;
    }

    fn touch(&self) {
        self.state.changed.notify_one();
    }

    /// Number of completed units.
    #[must_use]
    pub fn processed(&self) -> u64 {
        self.state.processed.load(Ordering::Relaxed)
    }

    /// Total units, once set.
    #[must_use]
    pub fn total(&self) -> Option<u64> {
        self.state
            .has_total
            .load(Ordering::Relaxed)
            .then(|| self.state.total.load(Ordering::Relaxed))
    }

    /// Completion in percent, clamped to 100, once a total is known.
    #[must_use]
    #[allow(clippy::cast_precision_loss)] // Acceptable for progress display
    pub fn percent(&self) -> Option<f64> {
        let total = self.total()?;
        if total == 0 {
            return Some(100.0);
        }
        let processed = self.processed().min(total);
        Some(processed as f64 / total as f64 * 100.0)
    }

    /// Descriptions of the sub-tasks currently executing.
    #[must_use]
    pub fn current_tasks(&self) -> Vec<String> {
        self.state.tasks.lock().clone()
    }

    /// Labels the progress with `description` until the guard drops.
    #[must_use]
    pub fn track(&self, description: impl Into<String>) -> TaskLabel {
        let description = description.into();
        self.state.tasks.lock().push(description.clone());
        self.touch();
        TaskLabel {
            progress: self.clone(),
            description,
        }
    }
}

impl ProgressReporter for JobProgress {
    fn set_total(&self, total: u64) {
        self.state.total.store(total, Ordering::Relaxed);
        self.state.has_total.store(true, Ordering::Relaxed);
        self.touch();
    }

    fn increment(&self) {
        self.state.processed.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    fn execute_task(&self, description: &str, task: &mut dyn FnMut()) {
        let _label = self.track(description);
        task();
    }
}

/// Removes a sub-task description from its [`JobProgress`] on drop.
#[derive(Debug)]
pub struct TaskLabel {
    progress: JobProgress,
    description: String,
}

impl Drop for TaskLabel {
    fn drop(&mut self) {
        let mut tasks = self.progress.state.tasks.lock();
        if let Some(pos) = tasks.iter().position(|t| *t == self.description) {
            tasks.remove(pos);
        }
        drop(tasks);
        self.progress.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_requires_total() {
        let progress = JobProgress::new();
        progress.increment();
        assert_eq!(progress.percent(), None);

        progress.set_total(0);
        assert_eq!(progress.percent(), Some(100.0));

        progress.set_total(3);
        progress.set_processed(10);
        assert_eq!(progress.percent(), Some(100.0));
    }

    #[test]
    fn test_add_total_accumulates() {
        let progress = JobProgress::new();
        progress.add_total(2);
        progress.add_total(2);
        progress.increment();
        assert_eq!(progress.total(), Some(4));
        assert_eq!(progress.percent(), Some(25.0));
    }

    #[test]
    fn test_execute_task_labels_while_running() {
        let progress = JobProgress::new();
        let observer = progress.clone();
        let mut seen = Vec::new();
        progress.execute_task("hashing a.mp4", &mut || {
            seen = observer.current_tasks();
        });
        assert_eq!(seen, vec!["hashing a.mp4".to_owned()]);
        assert!(progress.current_tasks().is_empty());
    }

    #[test]
    fn test_duplicate_labels_removed_one_at_a_time() {
        let progress = JobProgress::new();
        let first = progress.track("scan");
        let second = progress.track("scan");
        drop(first);
        assert_eq!(progress.current_tasks().len(), 1);
        drop(second);
        assert!(progress.current_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_changes_wake_waiter_once() {
        let progress = JobProgress::new();
        progress.set_total(2);
        progress.increment();
        progress.increment();

        tokio::time::timeout(std::time::Duration::from_secs(1), progress.changed())
            .await
            .unwrap();
        let again =
            tokio::time::timeout(std::time::Duration::from_millis(20), progress.changed()).await;
        assert!(again.is_err());
    }
}
