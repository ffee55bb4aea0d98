//! Job identity, status, and the context handed to running work.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::progress::JobProgress;

/// Identifier of a job, unique within one [`JobManager`](crate::JobManager).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a job.
///
/// Transitions only move forward:
/// `Queued -> Running -> {Completed | Failed | Cancelled}`. A queued job may
/// also go straight to `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a free job slot.
    Queued,
    /// Executing.
    Running,
    /// Finished without error.
    Completed,
    /// Finished with an error or a panic.
    Failed,
    /// Stopped by cancellation.
    Cancelled,
}

impl JobStatus {
    /// Returns `true` for `Completed`, `Failed`, and `Cancelled`.
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns `true` if moving from `self` to `next` is allowed.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Queued => matches!(next, Self::Running | Self::Cancelled),
            Self::Running => next.is_terminal(),
            Self::Completed | Self::Failed | Self::Cancelled => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A point-in-time view of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    /// Job identifier.
    pub id: JobId,
    /// Human-readable description given at submission.
    pub description: String,
    /// Current status.
    pub status: JobStatus,
    /// When the job was submitted.
    pub added_time: SystemTime,
    /// When the job started running.
    pub start_time: Option<SystemTime>,
    /// When the job reached a terminal status.
    pub end_time: Option<SystemTime>,
    /// Completion percentage in `0.0..=100.0`, once a total is known.
    pub progress: Option<f64>,
    /// Descriptions of the sub-tasks currently executing.
    pub details: Vec<String>,
    /// Failure message for `Failed` jobs.
    pub error: Option<String>,
}

impl JobInfo {
    pub(crate) fn queued(id: JobId, description: String) -> Self {
        Self {
            id,
            description,
            status: JobStatus::Queued,
            added_time: SystemTime::now(),
            start_time: None,
            end_time: None,
            progress: None,
            details: Vec::new(),
            error: None,
        }
    }

    /// Applies a status change, stamping start and end times.
    ///
    /// Returns `false` and leaves the record untouched if the transition
    /// isn't allowed.
    pub(crate) fn transition(&mut self, next: JobStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        let now = SystemTime::now();
        if next == JobStatus::Running {
            self.start_time = Some(now);
        }
        if next.is_terminal() {
            self.end_time = Some(now);
        }
        self.status = next;
        true
    }
}

/// A change to a job, as seen by [`JobManager::subscribe_events`](crate::JobManager::subscribe_events).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "job", rename_all = "snake_case")]
pub enum JobEvent {
    /// The job was submitted.
    Added(JobInfo),
    /// The job started running or reported progress.
    Updated(JobInfo),
    /// The job finished and moved to the history.
    Removed(JobInfo),
}

impl JobEvent {
    /// The job view carried by the event.
    #[must_use]
    pub const fn info(&self) -> &JobInfo {
        match self {
            Self::Added(info) | Self::Updated(info) | Self::Removed(info) => info,
        }
    }
}

/// What a running job receives.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// The job's id.
    pub id: JobId,
    /// Fires when the job is cancelled or the manager shuts down.
    pub token: CancellationToken,
    /// Progress handle feeding the job's [`JobInfo`].
    pub progress: JobProgress,
}

impl JobContext {
    /// Creates a context for work run outside a manager, e.g. in tests.
    #[must_use]
    pub fn detached(token: CancellationToken) -> Self {
        Self {
            id: JobId::default(),
            token,
            progress: JobProgress::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use JobStatus::{Cancelled, Completed, Failed, Queued, Running};
        assert!(Queued.can_transition_to(Running));
        assert!(Queued.can_transition_to(Cancelled));
        assert!(!Queued.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(!Running.can_transition_to(Queued));
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Queued, Running, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_transition_stamps_times() {
        let mut info = JobInfo::queued(JobId(1), "scan".to_owned());
        assert!(info.transition(JobStatus::Running));
        assert!(info.start_time.is_some());
        assert!(info.end_time.is_none());
        assert!(info.transition(JobStatus::Completed));
        assert!(info.end_time.is_some());

        assert!(!info.transition(JobStatus::Failed));
        assert_eq!(info.status, JobStatus::Completed);
    }

    #[test]
    fn test_status_serialization() {
        insta::assert_json_snapshot!(
            [JobStatus::Queued, JobStatus::Running, JobStatus::Cancelled],
            @r###"
        [
          "queued",
          "running",
          "cancelled"
        ]
        "###
        );
    }
}
