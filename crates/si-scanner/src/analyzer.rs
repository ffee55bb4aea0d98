//! Parallel fingerprinting and decoration of walked files.
//!
//! Uses the "collect-then-parallelize" pattern:
//!
//! 1. The walk collects accepted files as [`Entry`] values, in walk order
//! 2. [`FileAnalyzer`] classifies and fingerprints them with `rayon::par_iter()`
//!    on a pool sized by the scan parallelism
//! 3. Results come back in input order, so persisting them stays
//!    deterministic
//!
//! Analysis only reads the repository. Writes happen afterwards, one entry at
//! a time, in the scanner. Each entry is read under a
//! [`ReadLock`](crate::lock::ReadLock); if a writer cancels it mid-read, the
//! entry is reported as a read error instead of being persisted.

use std::io;
use std::sync::Arc;

use camino::Utf8PathBuf;
use rayon::prelude::*;
use si_core::{BaseFile, File, FileDetails, FileId, ImageDetails, ProgressReporter, VideoDetails};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::decorator::Decorator;
use crate::error::ScanError;
use crate::filter::MediaKind;
use crate::fingerprint::{FingerprintCalculator, FingerprintRequest};
use crate::fs::{FileInfo, FileSystem, FsOpener};
use crate::lock::ReadLockManager;
use crate::repository::{Repository, RepositoryLookup};

/// A walked file waiting for analysis.
#[derive(Clone)]
pub(crate) struct Entry {
    pub path: Utf8PathBuf,
    pub info: FileInfo,
    pub kind: MediaKind,
    /// Filesystem the entry is read through, a [`ZipFs`](crate::fs::ZipFs)
    /// for archive members.
    pub fs: Arc<dyn FileSystem>,
    /// Containing archive, for archive members.
    pub zip: Option<FileId>,
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("zip", &self.zip)
            .finish_non_exhaustive()
    }
}

/// How a file relates to what the repository already knows.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Analysis {
    /// Known, unchanged, and nothing requested was missing.
    Unchanged(File),
    /// Known and unchanged, but fingerprints were added or refreshed.
    Refreshed(File),
    /// Known, but size or modification time changed.
    Changed(File),
    /// Not known at this path.
    New(File),
}

/// Options shared by every entry of one pass.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct AnalyzeOptions {
    pub checksum: bool,
    pub phash: bool,
    pub force_rescan: bool,
    pub fingerprint_cutoff: Option<i64>,
}

/// Classifies, fingerprints, and decorates entries in parallel.
pub(crate) struct FileAnalyzer<'a> {
    pub calculator: &'a FingerprintCalculator,
    pub decorators: &'a [Arc<dyn Decorator>],
    pub repo: &'a dyn Repository,
    pub locks: &'a ReadLockManager,
    pub options: AnalyzeOptions,
}

impl FileAnalyzer<'_> {
    /// Analyzes `entries` on `pool`, returning one result per entry in input
    /// order.
    ///
    /// Entries reached after `token` fires yield [`ScanError::Cancelled`].
    pub fn analyze_files(
        &self,
        entries: &[Entry],
        pool: &rayon::ThreadPool,
        token: &CancellationToken,
        progress: &dyn ProgressReporter,
    ) -> Vec<Result<Analysis, ScanError>> {
        pool.install(|| {
            entries
                .par_iter()
                .map(|entry| {
                    if token.is_cancelled() {
                        return Err(ScanError::Cancelled);
                    }
                    let mut result = Err(ScanError::Cancelled);
                    progress.execute_task(&format!("Scanning {}", entry.path), &mut || {
                        result = self.analyze_locked(entry);
                    });
                    result
                })
                .collect()
        })
    }

    /// Analyzes an entry while holding a read lock on its path.
    fn analyze_locked(&self, entry: &Entry) -> Result<Analysis, ScanError> {
        let lock = self.locks.acquire(&entry.path);
        let result = self.analyze(entry);
        if lock.token().is_cancelled() {
            debug!(path = %entry.path, "File changed while it was being read");
            return Err(ScanError::read(
                entry.path.clone(),
                io::Error::new(io::ErrorKind::Interrupted, "file changed while it was being read"),
            ));
        }
        result
    }

    /// Analyzes a single entry.
    pub fn analyze(&self, entry: &Entry) -> Result<Analysis, ScanError> {
        let Some(existing) = self.repo.find_file_by_path(&entry.path)? else {
            let mut base = BaseFile::new(&entry.path, entry.info.size, entry.info.mod_time);
            base.zip_file_id = entry.zip;
            let mut file = File::new(base);
            file.details = initial_details(entry.kind);
            self.fingerprint(entry, &mut file, false, false)?;
            self.decorate(entry, &mut file)?;
            debug!(path = %entry.path, "New file");
            return Ok(Analysis::New(file));
        };

        let changed = existing.base.size != entry.info.size
            || existing.base.mod_time != entry.info.mod_time;
        if changed || self.options.force_rescan {
            let mut file = existing;
            file.base.size = entry.info.size;
            file.base.mod_time = entry.info.mod_time;
            self.fingerprint(entry, &mut file, false, false)?;
            self.decorate(entry, &mut file)?;
            debug!(path = %entry.path, changed, "Updating known file");
            return Ok(Analysis::Changed(file));
        }

        if self.is_stale(&existing) {
            let mut file = existing;
            self.fingerprint(entry, &mut file, false, true)?;
            debug!(path = %entry.path, "Refreshing fingerprints older than cutoff");
            return Ok(Analysis::Refreshed(file));
        }

        if !self.missing_fingerprints(entry.kind, &existing) {
            trace!(path = %entry.path, "Unchanged");
            return Ok(Analysis::Unchanged(existing));
        }
        let mut file = existing;
        self.fingerprint(entry, &mut file, true, false)?;
        debug!(path = %entry.path, "Adding missing fingerprints");
        Ok(Analysis::Refreshed(file))
    }

    fn is_stale(&self, file: &File) -> bool {
        self.options
            .fingerprint_cutoff
            .is_some_and(|cutoff| file.base.fingerprinted_at.is_none_or(|at| at < cutoff))
    }

    fn wants_phash(&self, kind: MediaKind) -> bool {
        self.options.phash && kind == MediaKind::Video && self.calculator.can_phash()
    }

    fn missing_fingerprints(&self, kind: MediaKind, file: &File) -> bool {
        let fps = &file.base.fingerprints;
        fps.oshash().is_none()
            || (self.options.checksum && fps.checksum().is_none())
            || (self.wants_phash(kind) && fps.phash().is_none())
    }

    fn fingerprint(
        &self,
        entry: &Entry,
        file: &mut File,
        use_existing: bool,
        force_phash: bool,
    ) -> Result<(), ScanError> {
        let request = FingerprintRequest {
            use_existing,
            checksum: self.options.checksum,
            phash: self.wants_phash(entry.kind),
            force_phash,
        };
        let opener = FsOpener::new(entry.fs.as_ref(), &entry.path);
        let lookup = RepositoryLookup(self.repo);
        file.base.fingerprints = self
            .calculator
            .calculate(&file.base, &opener, request, Some(&lookup))
            .map_err(|e| ScanError::fingerprint(&entry.path, e))?;
        Ok(())
    }

    fn decorate(&self, entry: &Entry, file: &mut File) -> Result<(), ScanError> {
        for decorator in self.decorators.iter().filter(|d| d.accepts(entry.kind)) {
            trace!(path = %entry.path, decorator = decorator.name(), "Decorating");
            decorator.decorate(entry.fs.as_ref(), file)?;
        }
        Ok(())
    }
}

fn initial_details(kind: MediaKind) -> FileDetails {
    match kind {
        MediaKind::Video => FileDetails::Video(VideoDetails::default()),
        MediaKind::Image => FileDetails::Image(ImageDetails::default()),
        MediaKind::Gallery => FileDetails::Base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decorator::ImageDecorator;
    use crate::fs::OsFs;
    use crate::fs::tests::utf8;
    use crate::repository::MemoryRepository;
    use camino::Utf8Path;
    use si_core::NoopProgress;
    use tempfile::TempDir;

    fn entry(fs: &Arc<dyn FileSystem>, path: &Utf8PathBuf, kind: MediaKind) -> Entry {
        let info = fs.stat(path).unwrap();
        Entry {
            path: path.clone(),
            info,
            kind,
            fs: Arc::clone(fs),
            zip: None,
        }
    }

    static LOCKS: std::sync::LazyLock<ReadLockManager> =
        std::sync::LazyLock::new(ReadLockManager::new);

    fn analyzer<'a>(
        calculator: &'a FingerprintCalculator,
        repo: &'a MemoryRepository,
        options: AnalyzeOptions,
    ) -> FileAnalyzer<'a> {
        FileAnalyzer {
            calculator,
            decorators: &[],
            repo,
            locks: &LOCKS,
            options,
        }
    }

    #[test]
    fn test_new_then_unchanged() {
        let dir = TempDir::new().unwrap();
        let path = utf8(&dir).join("a.mp4");
        std::fs::write(&path, vec![7u8; 4096]).unwrap();
        let fs: Arc<dyn FileSystem> = Arc::new(OsFs);
        let repo = MemoryRepository::new();
        let calc = FingerprintCalculator::new();
        let analyzer = analyzer(&calc, &repo, AnalyzeOptions::default());

        let e = entry(&fs, &path, MediaKind::Video);
        let Analysis::New(file) = analyzer.analyze(&e).unwrap() else {
            panic!("expected a new file");
        };
        assert!(file.base.fingerprints.oshash().is_some());
        assert!(file.is_video());
        repo.create_file(file).unwrap();

        assert!(matches!(analyzer.analyze(&e).unwrap(), Analysis::Unchanged(_)));
    }

    #[test]
    fn test_changed_size_recomputes() {
        let dir = TempDir::new().unwrap();
        let path = utf8(&dir).join("a.mp4");
        std::fs::write(&path, vec![7u8; 4096]).unwrap();
        let fs: Arc<dyn FileSystem> = Arc::new(OsFs);
        let repo = MemoryRepository::new();
        let calc = FingerprintCalculator::new();
        let analyzer = analyzer(&calc, &repo, AnalyzeOptions::default());

        let Analysis::New(file) = analyzer.analyze(&entry(&fs, &path, MediaKind::Video)).unwrap()
        else {
            panic!("expected a new file");
        };
        let old_hash = file.base.fingerprints.oshash().map(str::to_owned);
        let id = repo.create_file(file).unwrap().id();

        std::fs::write(&path, vec![9u8; 8192]).unwrap();
        let Analysis::Changed(file) = analyzer.analyze(&entry(&fs, &path, MediaKind::Video)).unwrap()
        else {
            panic!("expected a changed file");
        };
        assert_eq!(file.id(), id);
        assert_eq!(file.base.size, 8192);
        assert_ne!(file.base.fingerprints.oshash().map(str::to_owned), old_hash);
    }

    #[test]
    fn test_missing_checksum_refreshes() {
        let dir = TempDir::new().unwrap();
        let path = utf8(&dir).join("a.mp4");
        std::fs::write(&path, vec![7u8; 4096]).unwrap();
        let fs: Arc<dyn FileSystem> = Arc::new(OsFs);
        let repo = MemoryRepository::new();
        let calc = FingerprintCalculator::new();

        let plain = analyzer(&calc, &repo, AnalyzeOptions::default());
        let Analysis::New(file) = plain.analyze(&entry(&fs, &path, MediaKind::Video)).unwrap() else {
            panic!("expected a new file");
        };
        repo.create_file(file).unwrap();

        let with_checksum = analyzer(
            &calc,
            &repo,
            AnalyzeOptions {
                checksum: true,
                ..AnalyzeOptions::default()
            },
        );
        let Analysis::Refreshed(file) = with_checksum
            .analyze(&entry(&fs, &path, MediaKind::Video))
            .unwrap()
        else {
            panic!("expected refreshed fingerprints");
        };
        assert!(file.base.fingerprints.checksum().is_some());
    }

    #[test]
    fn test_cutoff_refreshes_old_fingerprints() {
        let dir = TempDir::new().unwrap();
        let path = utf8(&dir).join("a.mp4");
        std::fs::write(&path, vec![7u8; 4096]).unwrap();
        let fs: Arc<dyn FileSystem> = Arc::new(OsFs);
        let repo = MemoryRepository::new();
        let calc = FingerprintCalculator::new();

        let plain = analyzer(&calc, &repo, AnalyzeOptions::default());
        let Analysis::New(mut file) = plain.analyze(&entry(&fs, &path, MediaKind::Video)).unwrap()
        else {
            panic!("expected a new file");
        };
        file.base.fingerprinted_at = Some(100);
        repo.create_file(file).unwrap();

        let cutoff = |at| {
            analyzer(
                &calc,
                &repo,
                AnalyzeOptions {
                    fingerprint_cutoff: Some(at),
                    ..AnalyzeOptions::default()
                },
            )
        };
        let e = entry(&fs, &path, MediaKind::Video);
        assert!(matches!(cutoff(200).analyze(&e).unwrap(), Analysis::Refreshed(_)));
        assert!(matches!(cutoff(50).analyze(&e).unwrap(), Analysis::Unchanged(_)));
    }

    #[test]
    fn test_fingerprint_error_is_recoverable() {
        let dir = TempDir::new().unwrap();
        let path = utf8(&dir).join("tiny.mp4");
        std::fs::write(&path, b"abc").unwrap();
        let fs: Arc<dyn FileSystem> = Arc::new(OsFs);
        let repo = MemoryRepository::new();
        let calc = FingerprintCalculator::new();

        let err = analyzer(&calc, &repo, AnalyzeOptions::default())
            .analyze(&entry(&fs, &path, MediaKind::Video))
            .unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_parallel_results_keep_input_order() {
        let dir = TempDir::new().unwrap();
        let root = utf8(&dir);
        let fs: Arc<dyn FileSystem> = Arc::new(OsFs);
        let mut entries = Vec::new();
        for i in 0..16 {
            let path = root.join(format!("pic{i:02}.png"));
            image::RgbImage::new(i + 1, 2).save(&path).unwrap();
            entries.push(entry(&fs, &path, MediaKind::Image));
        }

        let repo = MemoryRepository::new();
        let calc = FingerprintCalculator::new();
        let decorators: Vec<Arc<dyn Decorator>> = vec![Arc::new(ImageDecorator)];
        let locks = ReadLockManager::new();
        let analyzer = FileAnalyzer {
            calculator: &calc,
            decorators: &decorators,
            repo: &repo,
            locks: &locks,
            options: AnalyzeOptions::default(),
        };
        let pool = rayon::ThreadPoolBuilder::new().num_threads(4).build().unwrap();
        let results = analyzer.analyze_files(&entries, &pool, &CancellationToken::new(), &NoopProgress);

        let widths: Vec<u32> = results
            .into_iter()
            .map(|r| match r.unwrap() {
                Analysis::New(File {
                    details: FileDetails::Image(d),
                    ..
                }) => d.width,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(widths, (1..=16).collect::<Vec<_>>());
    }

    /// Cancels readers of every path it is asked about, as a writer would.
    struct EvictingFs {
        locks: ReadLockManager,
    }

    impl FileSystem for EvictingFs {
        fn stat(&self, path: &Utf8Path) -> io::Result<FileInfo> {
            OsFs.stat(path)
        }
        fn lstat(&self, path: &Utf8Path) -> io::Result<FileInfo> {
            OsFs.lstat(path)
        }
        fn read_dir(&self, path: &Utf8Path) -> io::Result<Vec<FileInfo>> {
            OsFs.read_dir(path)
        }
        fn open(&self, path: &Utf8Path) -> io::Result<Box<dyn crate::fs::ReadSeek>> {
            self.locks.cancel_all(path);
            OsFs.open(path)
        }
        fn canonicalize(&self, path: &Utf8Path) -> io::Result<Utf8PathBuf> {
            OsFs.canonicalize(path)
        }
    }

    #[test]
    fn test_reader_cancelled_mid_read_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = utf8(&dir).join("a.mp4");
        std::fs::write(&path, vec![7u8; 4096]).unwrap();
        let locks = ReadLockManager::new();
        let fs: Arc<dyn FileSystem> = Arc::new(EvictingFs {
            locks: locks.clone(),
        });
        let repo = MemoryRepository::new();
        let calc = FingerprintCalculator::new();
        let analyzer = FileAnalyzer {
            calculator: &calc,
            decorators: &[],
            repo: &repo,
            locks: &locks,
            options: AnalyzeOptions::default(),
        };

        let pool = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();
        let results = analyzer.analyze_files(
            &[entry(&fs, &path, MediaKind::Video)],
            &pool,
            &CancellationToken::new(),
            &NoopProgress,
        );
        assert!(matches!(
            results.as_slice(),
            [Err(ScanError::Read { source, .. })] if source.kind() == io::ErrorKind::Interrupted
        ));
        assert_eq!(locks.readers(&path), 0);
    }

    #[test]
    fn test_cancelled_token_skips_work() {
        let dir = TempDir::new().unwrap();
        let path = utf8(&dir).join("a.mp4");
        std::fs::write(&path, vec![7u8; 4096]).unwrap();
        let fs: Arc<dyn FileSystem> = Arc::new(OsFs);
        let repo = MemoryRepository::new();
        let calc = FingerprintCalculator::new();
        let token = CancellationToken::new();
        token.cancel();

        let pool = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();
        let results = analyzer(&calc, &repo, AnalyzeOptions::default()).analyze_files(
            &[entry(&fs, &path, MediaKind::Video)],
            &pool,
            &token,
            &NoopProgress,
        );
        assert!(matches!(results.as_slice(), [Err(ScanError::Cancelled)]));
    }
}
