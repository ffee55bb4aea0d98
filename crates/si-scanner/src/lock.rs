//! Advisory read locks keyed by path.
//!
//! Readers (the scanner while fingerprinting, checksum tasks) take a
//! [`ReadLock`] on the file they are reading. A writer that wants to move the
//! file or replace its record calls [`ReadLockManager::cancel_all`] to ask
//! every reader to stop, then waits until they have, either with
//! [`ReadLockManager::wait_released`] from async code or
//! [`ReadLockManager::wait_released_blocking`] from a blocking thread.
//! [`ReadLockManager::evict`] does both.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::{Condvar, Mutex};
use si_core::FxHashMap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long a writer waits for cancelled readers before going ahead.
pub const RELEASE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct Holder {
    id: u64,
    token: CancellationToken,
}

#[derive(Debug, Default)]
struct Inner {
    holders: Mutex<FxHashMap<Utf8PathBuf, Vec<Holder>>>,
    next_id: AtomicU64,
    released: Notify,
    released_sync: Condvar,
}

impl Inner {
    fn release(&self, key: &Utf8Path, id: u64) {
        {
            let mut holders = self.holders.lock();
            if let Some(list) = holders.get_mut(key) {
                list.retain(|h| h.id != id);
                if list.is_empty() {
                    holders.remove(key);
                }
            }
        }
        self.released.notify_waiters();
        self.released_sync.notify_all();
    }
}

/// Tracks readers per key. Cheap to clone; clones share state.
///
/// Any number of readers may hold the same key. Holders are identified by a
/// unique id, so releasing one never removes a lock acquired concurrently for
/// the same key.
///
/// # Examples
///
/// ```
/// use camino::Utf8Path;
/// use si_scanner::lock::ReadLockManager;
///
/// let locks = ReadLockManager::new();
/// let lock = locks.acquire("/lib/a.mp4");
/// assert_eq!(locks.readers(Utf8Path::new("/lib/a.mp4")), 1);
///
/// assert_eq!(locks.cancel_all(Utf8Path::new("/lib/a.mp4")), 1);
/// assert!(lock.token().is_cancelled());
///
/// drop(lock);
/// assert_eq!(locks.readers(Utf8Path::new("/lib/a.mp4")), 0);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ReadLockManager {
    inner: Arc<Inner>,
}

impl ReadLockManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a reader of `key`.
    ///
    /// The lock is released when the returned guard drops.
    pub fn acquire(&self, key: impl Into<Utf8PathBuf>) -> ReadLock {
        let key = key.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.inner
            .holders
            .lock()
            .entry(key.clone())
            .or_default()
            .push(Holder {
                id,
                token: token.clone(),
            });
        ReadLock {
            inner: Arc::clone(&self.inner),
            key,
            id,
            token,
        }
    }

    /// Cancels the token of every current reader of `key`.
    ///
    /// Readers keep their locks until they release them. Returns how many
    /// readers were signalled.
    pub fn cancel_all(&self, key: &Utf8Path) -> usize {
        let holders = self.inner.holders.lock();
        let Some(list) = holders.get(key) else {
            return 0;
        };
        for holder in list {
            holder.token.cancel();
        }
        debug!(path = %key, readers = list.len(), "Cancelled readers");
        list.len()
    }

    /// Number of readers currently holding `key`.
    #[must_use]
    pub fn readers(&self, key: &Utf8Path) -> usize {
        self.inner.holders.lock().get(key).map_or(0, Vec::len)
    }

    /// Waits until no reader holds `key`.
    pub async fn wait_released(&self, key: &Utf8Path) {
        loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.readers(key) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Blocks until no reader holds `key`, or `timeout` passes.
    ///
    /// Returns `false` on timeout.
    pub fn wait_released_blocking(&self, key: &Utf8Path, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut holders = self.inner.holders.lock();
        while holders.contains_key(key) {
            if self
                .inner
                .released_sync
                .wait_until(&mut holders, deadline)
                .timed_out()
            {
                return !holders.contains_key(key);
            }
        }
        true
    }

    /// Cancels every reader of `key` and blocks until they have released it.
    ///
    /// Returns `false` if readers were still holding `key` after `timeout`;
    /// the caller goes ahead regardless.
    pub fn evict(&self, key: &Utf8Path, timeout: Duration) -> bool {
        if self.cancel_all(key) == 0 {
            return true;
        }
        let released = self.wait_released_blocking(key, timeout);
        if !released {
            warn!(path = %key, readers = self.readers(key), "Readers did not release in time");
        }
        released
    }
}

/// A held read lock. Released on drop.
#[derive(Debug)]
pub struct ReadLock {
    inner: Arc<Inner>,
    key: Utf8PathBuf,
    id: u64,
    token: CancellationToken,
}

impl ReadLock {
    /// Cancelled when a writer calls [`ReadLockManager::cancel_all`] for this
    /// key.
    #[must_use]
    pub const fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// The locked key.
    #[must_use]
    pub fn key(&self) -> &Utf8Path {
        &self.key
    }

    /// Releases the lock now.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for ReadLock {
    fn drop(&mut self) {
        self.inner.release(&self.key, self.id);
    }
}
