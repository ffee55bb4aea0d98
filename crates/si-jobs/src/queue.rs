//! Bounded task queue drained by a fixed pool of async workers.
//!
//! Jobs that fan out per-file work (hashing, generation) submit tasks here.
//! [`TaskQueue::submit`] waits once `capacity` tasks are pending, so a job
//! producing work faster than the workers consume it is throttled instead of
//! buffering without limit.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;

use futures_util::FutureExt;
use si_core::{JobConfig, ProgressReporter};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::JobError;
use crate::job::JobContext;
use crate::progress::JobProgress;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

struct Task {
    description: String,
    future: BoxFuture,
}

/// A bounded backlog of tasks with a fixed number of workers.
///
/// Workers stop taking tasks as soon as the token is cancelled; pending tasks
/// are dropped without running. A task that is already running keeps going
/// and is expected to watch the token itself.
///
/// Must be created inside a Tokio runtime.
#[derive(Debug)]
pub struct TaskQueue {
    tx: async_channel::Sender<Task>,
    workers: JoinSet<()>,
    token: CancellationToken,
    progress: Option<JobProgress>,
}

impl TaskQueue {
    /// Starts `parallelism` workers over a backlog of `capacity` tasks.
    ///
    /// Both values are raised to at least one.
    #[must_use]
    pub fn new(parallelism: usize, capacity: usize, token: CancellationToken) -> Self {
        Self::build(parallelism, capacity, token, None)
    }

    /// Creates a queue for a running job.
    ///
    /// The queue shares the job's cancellation token. Each task labels the
    /// job's progress while it runs and counts one unit when it ends.
    #[must_use]
    pub fn for_job(ctx: &JobContext, config: &JobConfig) -> Self {
        Self::build(
            config.effective_task_parallelism(),
            config.task_queue_capacity,
            ctx.token.clone(),
            Some(ctx.progress.clone()),
        )
    }

    fn build(
        parallelism: usize,
        capacity: usize,
        token: CancellationToken,
        progress: Option<JobProgress>,
    ) -> Self {
        let (tx, rx) = async_channel::bounded(capacity.max(1));
        let mut workers = JoinSet::new();
        for index in 0..parallelism.max(1) {
            workers.spawn(worker(index, rx.clone(), token.clone(), progress.clone()));
        }
        Self {
            tx,
            workers,
            token,
            progress,
        }
    }

    /// Queues a task, waiting while the backlog is full.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Cancelled`] if the token fires before the task is
    /// accepted, or [`JobError::QueueClosed`] if every worker has exited.
    pub async fn submit<F>(&self, description: impl Into<String>, future: F) -> Result<(), JobError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.token.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        let task = Task {
            description: description.into(),
            future: Box::pin(future),
        };

        tokio::select! {
            biased;
            () = self.token.cancelled() => Err(JobError::Cancelled),
            sent = self.tx.send(task) => sent.map_err(|_| JobError::QueueClosed),
        }
    }

    /// Number of tasks waiting for a worker.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    /// Returns `true` if no task is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    /// Returns the progress handle tasks report to, if any.
    #[must_use]
    pub const fn progress(&self) -> Option<&JobProgress> {
        self.progress.as_ref()
    }

    /// Stops accepting tasks and waits for the workers to drain the backlog.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Cancelled`] if the token fired, in which case some
    /// queued tasks may not have run.
    pub async fn finish(mut self) -> Result<(), JobError> {
        self.tx.close();
        while let Some(joined) = self.workers.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Task worker ended abnormally");
            }
        }
        if self.token.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        Ok(())
    }
}

async fn worker(
    index: usize,
    rx: async_channel::Receiver<Task>,
    token: CancellationToken,
    progress: Option<JobProgress>,
) {
    loop {
        let task = tokio::select! {
            biased;
            () = token.cancelled() => {
                debug!(worker = index, "Task worker cancelled");
                break;
            }
            task = rx.recv() => match task {
                Ok(task) => task,
                Err(_) => break,
            },
        };

        let _label = progress.as_ref().map(|p| p.track(task.description.clone()));
        if AssertUnwindSafe(task.future).catch_unwind().await.is_err() {
            warn!(task = %task.description, "Task panicked");
        }
        if let Some(progress) = &progress {
            progress.increment();
        }
    }
}
