//! Per-path debouncing of scan triggers.
//!
//! Every event for a path restarts that path's timer. When a timer expires
//! without being reset, the path is handed to the [`ScanTrigger`] once.

use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use parking_lot::Mutex;
use si_core::FxHashMap;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Receives paths whose debounce timer expired.
pub trait ScanTrigger: Send + Sync {
    /// Requests a scan of `path`.
    fn trigger(&self, path: &Utf8Path);
}

impl<F> ScanTrigger for F
where
    F: Fn(&Utf8Path) + Send + Sync,
{
    fn trigger(&self, path: &Utf8Path) {
        self(path);
    }
}

struct Timer {
    generation: u64,
    handle: AbortHandle,
}

#[derive(Default)]
struct Timers {
    pending: FxHashMap<Utf8PathBuf, Timer>,
    generation: u64,
}

/// Coalesces bursts of events per path into one trigger.
///
/// Must be used inside a Tokio runtime.
pub struct Debouncer {
    delay: Duration,
    trigger: Arc<dyn ScanTrigger>,
    timers: Arc<Mutex<Timers>>,
    token: CancellationToken,
}

impl std::fmt::Debug for Debouncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Debouncer")
            .field("delay", &self.delay)
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

impl Debouncer {
    /// Creates a debouncer firing `delay` after the last event for a path.
    pub fn new(delay: Duration, trigger: Arc<dyn ScanTrigger>) -> Self {
        Self {
            delay,
            trigger,
            timers: Arc::new(Mutex::new(Timers::default())),
            token: CancellationToken::new(),
        }
    }

    /// Starts or restarts the timer for `path`.
    ///
    /// Paths are normalised lexically, so `/lib/a/../b.mp4` and `/lib/b.mp4`
    /// share a timer. Does nothing after [`Debouncer::stop`].
    pub fn touch(&self, path: &Utf8Path) {
        if self.token.is_cancelled() {
            return;
        }
        let key = normalize(path);

        let mut timers = self.timers.lock();
        timers.generation += 1;
        let generation = timers.generation;

        let task = tokio::spawn(fire(
            key.clone(),
            generation,
            self.delay,
            Arc::clone(&self.trigger),
            Arc::clone(&self.timers),
            self.token.clone(),
        ));
        let timer = Timer {
            generation,
            handle: task.abort_handle(),
        };
        if let Some(previous) = timers.pending.insert(key, timer) {
            previous.handle.abort();
            trace!(path = %path, "Debounce timer reset");
        }
    }

    /// Number of timers waiting to fire.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.timers.lock().pending.len()
    }

    /// Stops every timer without firing it.
    pub fn stop(&self) {
        self.token.cancel();
        let mut timers = self.timers.lock();
        for (_, timer) in timers.pending.drain() {
            timer.handle.abort();
        }
        debug!("Debouncer stopped");
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn fire(
    path: Utf8PathBuf,
    generation: u64,
    delay: Duration,
    trigger: Arc<dyn ScanTrigger>,
    timers: Arc<Mutex<Timers>>,
    token: CancellationToken,
) {
    tokio::select! {
        () = token.cancelled() => return,
        () = tokio::time::sleep(delay) => {}
    }

    {
        let mut timers = timers.lock();
        match timers.pending.get(&path) {
            Some(timer) if timer.generation == generation => {
                timers.pending.remove(&path);
            }
            _ => return,
        }
    }
    if token.is_cancelled() {
        return;
    }
    debug!(path = %path, "Debounce timer expired");
    trigger.trigger(&path);
}

/// Lexically normalises a path: drops `.` components, resolves `..`
/// against earlier components and strips trailing separators.
#[must_use]
pub fn normalize(path: &Utf8Path) -> Utf8PathBuf {
    let mut out = Utf8PathBuf::new();
    for component in path.components() {
        match component {
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct Recorder {
        paths: Mutex<Vec<Utf8PathBuf>>,
        count: AtomicUsize,
    }

    impl ScanTrigger for Recorder {
        fn trigger(&self, path: &Utf8Path) {
            self.paths.lock().push(path.to_owned());
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn debouncer() -> (Debouncer, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let trigger: Arc<dyn ScanTrigger> = Arc::clone(&recorder) as Arc<dyn ScanTrigger>;
        (Debouncer::new(Duration::from_secs(1), trigger), recorder)
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(Utf8Path::new("/lib/a/./b.mp4")), Utf8PathBuf::from("/lib/a/b.mp4"));
        assert_eq!(normalize(Utf8Path::new("/lib/a/../b.mp4")), Utf8PathBuf::from("/lib/b.mp4"));
        assert_eq!(normalize(Utf8Path::new("/lib/dir/")), Utf8PathBuf::from("/lib/dir"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_into_one_trigger() {
        let (debouncer, recorder) = debouncer();
        let path = Utf8Path::new("/lib/a.mp4");

        for _ in 0..5 {
            debouncer.touch(path);
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        assert_eq!(recorder.count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(recorder.count.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.paths.lock().as_slice(), [Utf8PathBuf::from("/lib/a.mp4")]);
        assert_eq!(debouncer.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_paths_have_independent_timers() {
        let (debouncer, recorder) = debouncer();
        debouncer.touch(Utf8Path::new("/lib/a.mp4"));
        debouncer.touch(Utf8Path::new("/lib/./a.mp4"));
        debouncer.touch(Utf8Path::new("/lib/b.mp4"));
        assert_eq!(debouncer.pending(), 2);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let mut paths = recorder.paths.lock().clone();
        paths.sort();
        assert_eq!(
            paths,
            vec![Utf8PathBuf::from("/lib/a.mp4"), Utf8PathBuf::from("/lib/b.mp4")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_without_firing() {
        let (debouncer, recorder) = debouncer();
        debouncer.touch(Utf8Path::new("/lib/a.mp4"));
        debouncer.stop();
        debouncer.touch(Utf8Path::new("/lib/b.mp4"));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(recorder.count.load(Ordering::SeqCst), 0);
        assert_eq!(debouncer.pending(), 0);
    }
}
