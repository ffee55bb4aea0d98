//! The job manager: submission, scheduling, cancellation, and history.
//!
//! Jobs are spawned as Tokio tasks on submission and wait for one of
//! `max_concurrent_jobs` slots before running, unless started with
//! [`JobManager::start`]. Every job gets its own cancellation token, a child
//! of the manager's shutdown token, and a [`JobProgress`] handle the manager
//! reads when building [`JobInfo`]s.
//!
//! Subscribers receive either completions only ([`JobManager::subscribe`])
//! or every [`JobEvent`] ([`JobManager::subscribe_events`]). Progress
//! updates are sent at most once per [`UPDATE_THROTTLE`] per job.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use si_core::{FxHashMap, JobConfig};
use tokio::sync::{Semaphore, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::error::JobError;
use crate::job::{JobContext, JobEvent, JobId, JobInfo, JobStatus};
use crate::progress::JobProgress;

/// Capacity of each completion subscription channel.
///
/// Notifications to a full subscriber are dropped.
const SUBSCRIPTION_CAPACITY: usize = 64;

/// Minimum interval between two progress notifications of one job.
const UPDATE_THROTTLE: Duration = Duration::from_millis(100);

struct Entry {
    info: watch::Sender<JobInfo>,
    token: CancellationToken,
    progress: JobProgress,
}

impl Entry {
    fn snapshot(&self) -> JobInfo {
        let mut info = self.info.borrow().clone();
        info.progress = self.progress.percent();
        info.details = self.progress.current_tasks();
        info
    }
}

enum Sink {
    Completions(mpsc::Sender<JobInfo>),
    Events(mpsc::Sender<JobEvent>),
}

struct Subscriber {
    id: u64,
    sink: Sink,
}

impl Subscriber {
    /// Offers `event` without blocking. Returns `false` once the receiver
    /// is gone.
    fn offer(&self, event: &JobEvent) -> bool {
        match (&self.sink, event) {
            (Sink::Events(tx), _) => still_open(tx.try_send(event.clone())),
            (Sink::Completions(tx), JobEvent::Removed(info)) => {
                still_open(tx.try_send(info.clone()))
            }
            (Sink::Completions(tx), _) => !tx.is_closed(),
        }
    }
}

fn still_open<T>(result: Result<(), mpsc::error::TrySendError<T>>) -> bool {
    !matches!(result, Err(mpsc::error::TrySendError::Closed(_)))
}

#[derive(Default)]
struct State {
    active: FxHashMap<JobId, Entry>,
    order: Vec<JobId>,
    history: VecDeque<JobInfo>,
    subscribers: Vec<Subscriber>,
    next_subscriber: u64,
}

impl State {
    fn broadcast(&mut self, event: &JobEvent) {
        self.subscribers.retain(|s| s.offer(event));
    }
}

struct Inner {
    config: JobConfig,
    state: Mutex<State>,
    slots: Arc<Semaphore>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Inner {
    fn start(&self, id: JobId) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.active.get(&id) else {
            return false;
        };
        if !entry
            .info
            .send_if_modified(|info| info.transition(JobStatus::Running))
        {
            return false;
        }
        let event = JobEvent::Updated(entry.snapshot());
        state.broadcast(&event);
        true
    }

    /// Notifies subscribers of a running job's current progress.
    fn updated(&self, id: JobId) {
        let mut state = self.state.lock();
        let Some(entry) = state.active.get(&id) else {
            return;
        };
        let info = entry.snapshot();
        if info.status == JobStatus::Running {
            state.broadcast(&JobEvent::Updated(info));
        }
    }

    fn finish(&self, id: JobId, status: JobStatus, message: Option<String>) {
        let info = {
            let mut state = self.state.lock();
            let Some(entry) = state.active.remove(&id) else {
                return;
            };
            state.order.retain(|j| *j != id);

            entry.info.send_modify(|info| {
                info.transition(status);
                info.error = message;
                info.progress = entry.progress.percent();
                info.details.clear();
            });
            let info = entry.info.borrow().clone();

            if self.config.history_size > 0 {
                while state.history.len() >= self.config.history_size {
                    state.history.pop_front();
                }
                state.history.push_back(info.clone());
            }

            state.broadcast(&JobEvent::Removed(info.clone()));
            info
        };

        match info.status {
            JobStatus::Failed => error!(
                job_id = %id,
                description = %info.description,
                error = info.error.as_deref().unwrap_or_default(),
                "Job failed"
            ),
            JobStatus::Cancelled => info!(job_id = %id, description = %info.description, "Job cancelled"),
            _ => info!(job_id = %id, description = %info.description, "Job completed"),
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.state.lock().subscribers.retain(|s| s.id != id);
        debug!(subscriber = id, "Subscription removed");
    }
}

/// Runs jobs with bounded concurrency and keeps a short history.
///
/// Cheap to clone; clones share state. Must be used inside a Tokio runtime.
///
/// # Examples
///
/// ```no_run
/// use si_core::JobConfig;
/// use si_jobs::{JobManager, JobStatus};
///
/// # async fn example() -> Result<(), si_jobs::JobError> {
/// let manager = JobManager::new(JobConfig::default());
/// let id = manager.add("Say hello", |_ctx| async { Ok(()) });
///
/// let info = manager.wait(id).await?;
/// assert_eq!(info.status, JobStatus::Completed);
///
/// manager.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("config", &self.inner.config)
            .field("available_slots", &self.inner.slots.available_permits())
            .finish_non_exhaustive()
    }
}

impl JobManager {
    /// Creates a manager. `max_concurrent_jobs` is raised to at least one.
    #[must_use]
    pub fn new(config: JobConfig) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State::default()),
                slots,
                next_id: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// The configuration the manager was created with.
    #[must_use]
    pub fn config(&self) -> &JobConfig {
        &self.inner.config
    }

    /// Submits a job and returns its id. The job starts `Queued`.
    ///
    /// `work` receives the job's [`JobContext`]. Returning
    /// [`JobError::Cancelled`], or returning after the token fired, ends the
    /// job as `Cancelled`; any other error or a panic ends it as `Failed`.
    pub fn add<F, Fut>(&self, description: impl Into<String>, work: F) -> JobId
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        self.submit(description.into(), work, false)
    }

    /// Submits a job that runs at once, alongside any other jobs.
    ///
    /// The job is `Running` when this returns and doesn't take one of the
    /// `max_concurrent_jobs` slots. Otherwise it behaves like [`add`](Self::add).
    pub fn start<F, Fut>(&self, description: impl Into<String>, work: F) -> JobId
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        self.submit(description.into(), work, true)
    }

    fn submit<F, Fut>(&self, description: String, work: F, immediate: bool) -> JobId
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        let id = JobId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let token = self.inner.shutdown.child_token();
        let progress = JobProgress::new();
        let queued = JobInfo::queued(id, description.clone());
        let (info, _) = watch::channel(queued.clone());

        {
            let mut state = self.inner.state.lock();
            state.active.insert(
                id,
                Entry {
                    info,
                    token: token.clone(),
                    progress: progress.clone(),
                },
            );
            state.order.push(id);
            state.broadcast(&JobEvent::Added(queued));
        }
        info!(job_id = %id, description = %description, immediate, "Job queued");

        let started = immediate && self.inner.start(id);
        let ctx = JobContext {
            id,
            token,
            progress,
        };
        self.inner
            .tracker
            .spawn(run(Arc::clone(&self.inner), ctx, work, started));
        id
    }

    /// Returns the current view of an active or remembered job.
    #[must_use]
    pub fn get(&self, id: JobId) -> Option<JobInfo> {
        let state = self.inner.state.lock();
        if let Some(entry) = state.active.get(&id) {
            return Some(entry.snapshot());
        }
        state.history.iter().find(|info| info.id == id).cloned()
    }

    /// Queued and running jobs, in submission order.
    #[must_use]
    pub fn queue(&self) -> Vec<JobInfo> {
        let state = self.inner.state.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.active.get(id))
            .map(Entry::snapshot)
            .collect()
    }

    /// Finished jobs, oldest first, at most `history_size` of them.
    #[must_use]
    pub fn history(&self) -> Vec<JobInfo> {
        self.inner.state.lock().history.iter().cloned().collect()
    }

    /// Requests cancellation of a job.
    ///
    /// A queued job is cancelled without running; a running job sees its
    /// token fire. Cancelling a finished job does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::NotFound`] if the id is unknown.
    pub fn cancel(&self, id: JobId) -> Result<(), JobError> {
        let state = self.inner.state.lock();
        if let Some(entry) = state.active.get(&id) {
            entry.token.cancel();
            debug!(job_id = %id, "Job cancellation requested");
            return Ok(());
        }
        if state.history.iter().any(|info| info.id == id) {
            return Ok(());
        }
        Err(JobError::NotFound(id))
    }

    /// Requests cancellation of every queued and running job.
    pub fn cancel_all(&self) {
        let state = self.inner.state.lock();
        for entry in state.active.values() {
            entry.token.cancel();
        }
    }

    /// Waits until a job is finished and returns its final view.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::NotFound`] if the id is unknown or has already
    /// left the history.
    pub async fn wait(&self, id: JobId) -> Result<JobInfo, JobError> {
        let mut rx = {
            let state = self.inner.state.lock();
            match state.active.get(&id) {
                Some(entry) => entry.info.subscribe(),
                None => {
                    return state
                        .history
                        .iter()
                        .find(|info| info.id == id)
                        .cloned()
                        .ok_or(JobError::NotFound(id));
                }
            }
        };
        let info = rx
            .wait_for(|info| info.status.is_terminal())
            .await
            .map_err(|_| JobError::NotFound(id))?;
        Ok(info.clone())
    }

    /// Subscribes to job completions.
    ///
    /// The receiver gets the final [`JobInfo`] of every job that finishes
    /// afterwards. The subscription is removed when `token` fires or the
    /// manager shuts down, which closes the receiver.
    pub fn subscribe(&self, token: CancellationToken) -> mpsc::Receiver<JobInfo> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        self.register(Sink::Completions(tx), token);
        rx
    }

    /// Subscribes to every job change: submissions, starts, progress, and
    /// completions.
    ///
    /// Events to a full receiver are dropped. The subscription ends like one
    /// from [`subscribe`](Self::subscribe).
    pub fn subscribe_events(&self, token: CancellationToken) -> mpsc::Receiver<JobEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        self.register(Sink::Events(tx), token);
        rx
    }

    fn register(&self, sink: Sink, token: CancellationToken) {
        let id = {
            let mut state = self.inner.state.lock();
            let id = state.next_subscriber;
            state.next_subscriber += 1;
            state.subscribers.push(Subscriber { id, sink });
            id
        };

        let inner = Arc::clone(&self.inner);
        self.inner.tracker.spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = inner.shutdown.cancelled() => {}
            }
            inner.unsubscribe(id);
        });
    }

    /// Cancels every job and waits for all of them to finish.
    pub async fn shutdown(&self) {
        info!("Shutting down job manager");
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}

/// Runs one job. `started` jobs skip the wait for a slot.
async fn run<F, Fut>(inner: Arc<Inner>, ctx: JobContext, work: F, started: bool)
where
    F: FnOnce(JobContext) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    let id = ctx.id;
    let _slot = if started {
        None
    } else {
        let permit = tokio::select! {
            biased;
            () = ctx.token.cancelled() => None,
            permit = Arc::clone(&inner.slots).acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            inner.finish(id, JobStatus::Cancelled, None);
            return;
        };
        if !inner.start(id) {
            return;
        }
        Some(permit)
    };
    info!(job_id = %id, "Job started");

    let token = ctx.token.clone();
    let updates = CancellationToken::new();
    inner.tracker.spawn(forward_progress(
        Arc::clone(&inner),
        id,
        ctx.progress.clone(),
        updates.clone(),
    ));
    let outcome = tokio::spawn(work(ctx)).await;
    updates.cancel();
    let (status, message) = match outcome {
        Ok(Ok(())) if token.is_cancelled() => (JobStatus::Cancelled, None),
        Ok(Ok(())) => (JobStatus::Completed, None),
        Ok(Err(e)) if e.is_cancelled() || token.is_cancelled() => (JobStatus::Cancelled, None),
        Ok(Err(e)) => (JobStatus::Failed, Some(e.to_string())),
        Err(e) if e.is_panic() => (JobStatus::Failed, Some(panic_message(e.into_panic()))),
        Err(_) => (JobStatus::Cancelled, None),
    };
    inner.finish(id, status, message);
}

/// Sends a job's progress to subscribers until `stop` fires, at most once per
/// [`UPDATE_THROTTLE`].
async fn forward_progress(
    inner: Arc<Inner>,
    id: JobId,
    progress: JobProgress,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            () = stop.cancelled() => return,
            () = progress.changed() => {}
        }
        inner.updated(id);
        tokio::select! {
            () = stop.cancelled() => return,
            () = tokio::time::sleep(UPDATE_THROTTLE) => {}
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned());
    format!("job panicked: {detail}")
}
