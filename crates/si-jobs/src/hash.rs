//! Checksum generation job.
//!
//! Computes missing BLAKE3 checksums for every stored file, one task per
//! file on a [`TaskQueue`]. Each task holds a [`ReadLock`](crate::ReadLock)
//! on the file it reads, so a writer can cancel it before touching the file.
//!
//! A digest is only stored if the lock wasn't cancelled and the record still
//! has the path, size, and modification time it had when the task started.
//! Otherwise it is discarded.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use si_core::{File, Fingerprint, JobConfig, ProgressReporter};
use si_scanner::fingerprint::checksum;
use si_scanner::fs::FileSystem;
use si_scanner::repository::Repository;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::JobError;
use crate::ReadLockManager;
use crate::job::JobContext;
use crate::queue::TaskQueue;

/// Fills in checksums for stored files.
#[derive(Clone)]
pub struct HashJob {
    repo: Arc<dyn Repository>,
    fs: Arc<dyn FileSystem>,
    locks: ReadLockManager,
    config: JobConfig,
    overwrite: bool,
}

impl std::fmt::Debug for HashJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashJob")
            .field("config", &self.config)
            .field("overwrite", &self.overwrite)
            .finish_non_exhaustive()
    }
}

impl HashJob {
    /// Creates a job that only hashes files without a checksum.
    #[must_use]
    pub fn new(
        repo: Arc<dyn Repository>,
        fs: Arc<dyn FileSystem>,
        locks: ReadLockManager,
        config: JobConfig,
    ) -> Self {
        Self {
            repo,
            fs,
            locks,
            config,
            overwrite: false,
        }
    }

    /// Recomputes checksums that already exist as well.
    #[must_use]
    pub const fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    fn wants(&self, file: &File) -> bool {
        file.base.zip_file_id.is_none()
            && (self.overwrite || file.base.fingerprints.checksum().is_none())
    }

    /// Runs the job.
    ///
    /// Files that can't be read are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Repository`] if the file list can't be loaded, or
    /// [`JobError::Cancelled`] if the job is cancelled.
    pub async fn run(self, ctx: JobContext) -> Result<(), JobError> {
        let pending: Vec<File> = self
            .repo
            .all_files()?
            .into_iter()
            .filter(|f| self.wants(f))
            .collect();
        info!(job_id = %ctx.id, files = pending.len(), "Generating checksums");
        ctx.progress.set_total(pending.len() as u64);

        let queue = TaskQueue::for_job(&ctx, &self.config);
        let failures = Arc::new(AtomicU64::new(0));

        for file in pending {
            let lock = self.locks.acquire(file.path());
            let repo = Arc::clone(&self.repo);
            let fs = Arc::clone(&self.fs);
            let failures = Arc::clone(&failures);
            let description = format!("Hashing {}", file.path());

            queue
                .submit(description, async move {
                    if lock.token().is_cancelled() {
                        debug!(path = %lock.key(), "Checksum skipped, reader cancelled");
                        return;
                    }
                    if let Err(e) = hash_file(repo, fs, file, lock.token().clone()).await {
                        warn!(path = %lock.key(), error = %e, "Failed to compute checksum");
                        failures.fetch_add(1, Ordering::Relaxed);
                    }
                    drop(lock);
                })
                .await?;
        }

        queue.finish().await?;
        info!(
            job_id = %ctx.id,
            failures = failures.load(Ordering::Relaxed),
            "Checksums generated"
        );
        Ok(())
    }
}

async fn hash_file(
    repo: Arc<dyn Repository>,
    fs: Arc<dyn FileSystem>,
    file: File,
    token: CancellationToken,
) -> Result<(), JobError> {
    let path = file.path().to_owned();
    let digest = tokio::task::spawn_blocking(move || {
        let mut reader = fs.open(&path).map_err(|e| JobError::io(path.clone(), e))?;
        checksum(&mut reader).map_err(|e| JobError::io(path, e))
    })
    .await
    .map_err(|e| JobError::failed(format!("checksum task failed: {e}")))??;

    if token.is_cancelled() {
        debug!(path = %file.path(), "Checksum discarded, file changed while it was being read");
        return Ok(());
    }
    let Some(mut current) = repo.find_file(file.id())? else {
        debug!(path = %file.path(), "Checksum discarded, file was removed");
        return Ok(());
    };
    if current.base.path != file.base.path
        || current.base.size != file.base.size
        || current.base.mod_time != file.base.mod_time
    {
        debug!(path = %file.path(), "Checksum discarded, file record changed");
        return Ok(());
    }
    current.base.fingerprints.set(Fingerprint::Checksum(digest));
    repo.update_file(&current)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io;

    use camino::{Utf8Path, Utf8PathBuf};
    use si_core::{BaseFile, LibraryConfig, NoopProgress, ScanConfig};
    use si_scanner::fs::{FileInfo, OsFs, ReadSeek};
    use si_scanner::repository::MemoryRepository;
    use si_scanner::{ScanOptions, Scanner};
    use tempfile::TempDir;
    use tokio::sync::Notify;

    use super::*;
    use crate::{JobManager, JobStatus};

    fn setup() -> (TempDir, Arc<MemoryRepository>, Utf8PathBuf) {
        let dir = TempDir::new().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let repo = Arc::new(MemoryRepository::new());
        for (name, byte) in [("a.mp4", 1_u8), ("b.mp4", 2)] {
            let path = root.join(name);
            std::fs::write(&path, vec![byte; 1024]).unwrap();
            repo.create_file(File::new(BaseFile::new(path, 1024, 0))).unwrap();
        }
        (dir, repo, root)
    }

    fn job(repo: &Arc<MemoryRepository>, locks: &ReadLockManager) -> HashJob {
        let repo: Arc<dyn Repository> = Arc::clone(repo) as Arc<dyn Repository>;
        HashJob::new(repo, Arc::new(OsFs), locks.clone(), JobConfig::default())
    }

    #[tokio::test]
    async fn test_hash_job_fills_checksums() {
        let (_dir, repo, root) = setup();
        let locks = ReadLockManager::new();
        let manager = JobManager::new(JobConfig::default());

        let hash = job(&repo, &locks);
        let id = manager.add("hash", |ctx| hash.run(ctx));
        let info = manager.wait(id).await.unwrap();
        assert_eq!(info.status, JobStatus::Completed);
        assert_eq!(info.progress, Some(100.0));

        let a = repo.find_file_by_path(&root.join("a.mp4")).unwrap().unwrap();
        let expected = checksum(&mut &[1_u8; 1024][..]).unwrap();
        assert_eq!(a.base.fingerprints.checksum(), Some(expected.as_str()));
        assert_eq!(locks.readers(&root.join("a.mp4")), 0);
    }

    #[tokio::test]
    async fn test_existing_checksums_are_kept() {
        let (_dir, repo, root) = setup();
        let mut a = repo.find_file_by_path(&root.join("a.mp4")).unwrap().unwrap();
        a.base
            .fingerprints
            .set(Fingerprint::Checksum("existing".to_owned()));
        repo.update_file(&a).unwrap();

        let locks = ReadLockManager::new();
        job(&repo, &locks)
            .run(JobContext::detached(CancellationToken::new()))
            .await
            .unwrap();
        let a = repo.find_file_by_path(&root.join("a.mp4")).unwrap().unwrap();
        assert_eq!(a.base.fingerprints.checksum(), Some("existing"));

        job(&repo, &locks)
            .with_overwrite(true)
            .run(JobContext::detached(CancellationToken::new()))
            .await
            .unwrap();
        let a = repo.find_file_by_path(&root.join("a.mp4")).unwrap().unwrap();
        assert_ne!(a.base.fingerprints.checksum(), Some("existing"));
    }

    #[tokio::test]
    async fn test_unreadable_file_is_skipped() {
        let (_dir, repo, root) = setup();
        std::fs::remove_file(root.join("a.mp4")).unwrap();

        let locks = ReadLockManager::new();
        job(&repo, &locks)
            .run(JobContext::detached(CancellationToken::new()))
            .await
            .unwrap();

        let a = repo.find_file_by_path(&root.join("a.mp4")).unwrap().unwrap();
        let b = repo.find_file_by_path(&root.join("b.mp4")).unwrap().unwrap();
        assert!(a.base.fingerprints.checksum().is_none());
        assert!(b.base.fingerprints.checksum().is_some());
    }

    #[tokio::test]
    async fn test_cancelled_hash_job() {
        let (_dir, repo, _root) = setup();
        let token = CancellationToken::new();
        token.cancel();
        let result = job(&repo, &ReadLockManager::new())
            .run(JobContext::detached(token))
            .await;
        assert!(matches!(result, Err(JobError::Cancelled)));
    }

    /// Rewrites the record of every file it opens, as a concurrent scan
    /// would after the file changed on disk.
    struct RewritingFs {
        repo: Arc<MemoryRepository>,
    }

    impl FileSystem for RewritingFs {
        fn stat(&self, path: &Utf8Path) -> io::Result<FileInfo> {
            OsFs.stat(path)
        }
        fn lstat(&self, path: &Utf8Path) -> io::Result<FileInfo> {
            OsFs.lstat(path)
        }
        fn read_dir(&self, path: &Utf8Path) -> io::Result<Vec<FileInfo>> {
            OsFs.read_dir(path)
        }
        fn open(&self, path: &Utf8Path) -> io::Result<Box<dyn ReadSeek>> {
            let mut file = self.repo.find_file_by_path(path).unwrap().unwrap();
            file.base.size = 2048;
            file.base.mod_time = 999;
            self.repo.update_file(&file).unwrap();
            OsFs.open(path)
        }
        fn canonicalize(&self, path: &Utf8Path) -> io::Result<Utf8PathBuf> {
            OsFs.canonicalize(path)
        }
    }

    #[tokio::test]
    async fn test_checksum_is_discarded_when_record_changed() {
        let (_dir, repo, root) = setup();
        let fs = Arc::new(RewritingFs {
            repo: Arc::clone(&repo),
        });
        HashJob::new(
            Arc::clone(&repo) as Arc<dyn Repository>,
            fs,
            ReadLockManager::new(),
            JobConfig::default(),
        )
        .run(JobContext::detached(CancellationToken::new()))
        .await
        .unwrap();

        let a = repo.find_file_by_path(&root.join("a.mp4")).unwrap().unwrap();
        assert_eq!(a.base.size, 2048);
        assert_eq!(a.base.mod_time, 999);
        assert!(a.base.fingerprints.checksum().is_none());
    }

    /// Opens `a.mp4`, then holds the read until a writer cancels readers of
    /// that path.
    struct GatedFs {
        locks: ReadLockManager,
        entered: Arc<Notify>,
    }

    impl FileSystem for GatedFs {
        fn stat(&self, path: &Utf8Path) -> io::Result<FileInfo> {
            OsFs.stat(path)
        }
        fn lstat(&self, path: &Utf8Path) -> io::Result<FileInfo> {
            OsFs.lstat(path)
        }
        fn read_dir(&self, path: &Utf8Path) -> io::Result<Vec<FileInfo>> {
            OsFs.read_dir(path)
        }
        fn open(&self, path: &Utf8Path) -> io::Result<Box<dyn ReadSeek>> {
            let reader = OsFs.open(path)?;
            if path.file_name() == Some("a.mp4") {
                let witness = self.locks.acquire(path);
                self.entered.notify_one();
                while !witness.token().is_cancelled() {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
            }
            Ok(reader)
        }
        fn canonicalize(&self, path: &Utf8Path) -> io::Result<Utf8PathBuf> {
            OsFs.canonicalize(path)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_move_cancels_in_flight_checksum() {
        let dir = TempDir::new().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        std::fs::write(root.join("a.mp4"), vec![1_u8; 1024]).unwrap();
        std::fs::write(root.join("b.mp4"), vec![2_u8; 1024]).unwrap();

        let repo = Arc::new(MemoryRepository::new());
        let locks = ReadLockManager::new();
        let config = ScanConfig {
            calculate_checksum: false,
            ..ScanConfig::default()
        };
        let scanner = Scanner::new(Arc::new(OsFs), Arc::clone(&repo) as Arc<dyn Repository>, config)
            .with_libraries(vec![LibraryConfig::new(root.clone())])
            .with_read_locks(locks.clone());
        let scan = |scanner: Scanner| {
            tokio::task::spawn_blocking(move || {
                scanner
                    .scan(&ScanOptions::default(), &CancellationToken::new(), &NoopProgress)
                    .unwrap()
            })
        };
        scan(scanner.clone()).await.unwrap();
        let id = repo.find_file_by_path(&root.join("a.mp4")).unwrap().unwrap().id();

        let entered = Arc::new(Notify::new());
        let fs = Arc::new(GatedFs {
            locks: locks.clone(),
            entered: Arc::clone(&entered),
        });
        let hash = HashJob::new(
            Arc::clone(&repo) as Arc<dyn Repository>,
            fs,
            locks.clone(),
            JobConfig::default(),
        );
        let running = tokio::spawn(hash.run(JobContext::detached(CancellationToken::new())));
        entered.notified().await;

        std::fs::rename(root.join("a.mp4"), root.join("c.mp4")).unwrap();
        let result = scan(scanner).await.unwrap();
        assert_eq!(result.stats.moved, 1);
        running.await.unwrap().unwrap();

        let c = repo.find_file_by_path(&root.join("c.mp4")).unwrap().unwrap();
        assert_eq!(c.id(), id);
        assert!(c.base.fingerprints.checksum().is_none());
        let b = repo.find_file_by_path(&root.join("b.mp4")).unwrap().unwrap();
        assert!(b.base.fingerprints.checksum().is_some());
        assert_eq!(locks.readers(&root.join("a.mp4")), 0);
    }
}
