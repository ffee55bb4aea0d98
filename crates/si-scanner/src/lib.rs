//! Library scanner: filters, fingerprints, and new/changed/moved detection.
//!
//! This crate walks library roots, decides which entries take part in a scan,
//! and reconciles what it finds with a [`Repository`] of known files and
//! folders.
//!
//! # Overview
//!
//! The main entry point is [`Scanner`], which combines:
//!
//! - [`Walker`](walker::Walker): sorted depth-first traversal over a
//!   [`FileSystem`](fs::FileSystem), following links with a revisit guard
//! - [`FilterChain`](filter::FilterChain): per-library extension and exclude
//!   rules plus `.stashignore` files
//! - [`FolderRenameDetector`](rename::FolderRenameDetector): recognises a
//!   folder that reappeared under a new path
//! - [`FingerprintCalculator`](fingerprint::FingerprintCalculator): oshash,
//!   BLAKE3 checksum, and perceptual hash, computed in parallel with rayon
//! - [`Decorator`](decorator::Decorator)s: per-kind properties such as image
//!   dimensions
//! - [`FileHandler`](handler::FileHandler)s: hooks run once a new or changed
//!   file is stored
//! - [`ReadLockManager`](lock::ReadLockManager): read locks held while a file
//!   is fingerprinted, cancelled before its record is moved or rewritten
//! - [`ScanStats`]: atomic counters for what the pass did
//!
//! A pass that runs to completion marks files under its roots that it didn't
//! find as missing; a later pass that finds them again clears the mark.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use si_core::{LibraryConfig, NoopProgress, ScanConfig};
//! use si_scanner::fs::OsFs;
//! use si_scanner::repository::MemoryRepository;
//! use si_scanner::{ScanOptions, Scanner};
//! use tokio_util::sync::CancellationToken;
//!
//! let scanner = Scanner::new(Arc::new(OsFs), Arc::new(MemoryRepository::new()), ScanConfig::default())
//!     .with_libraries(vec![LibraryConfig::new("/media/library")]);
//!
//! let result = scanner.scan(&ScanOptions::default(), &CancellationToken::new(), &NoopProgress)?;
//! println!("{} new, {} moved", result.stats.new, result.stats.moved);
//! # Ok::<(), si_scanner::ScanError>(())
//! ```
//!
//! # Architecture
//!
//! ```text
//! Scanner::scan (per library root)
//!     │
//!     ├── Walker (sequential, sorted)
//!     │       ├── FilterChain (library rules + .stashignore + caller filters)
//!     │       ├── folders: update / rename-detect + relocate / create
//!     │       └── files: collected as entries
//!     │
//!     ├── FileAnalyzer (rayon pool)
//!     │       ├── Repository lookup by path
//!     │       ├── FingerprintCalculator
//!     │       └── Decorators
//!     │
//!     ├── persist (sequential, walk order)
//!     │       ├── create / update / move by oshash
//!     │       ├── file handlers
//!     │       └── zip galleries: walk members, repeat
//!     │
//!     └── mark missing (completed passes only)
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

mod analyzer;
pub mod decorator;
mod error;
pub mod filter;
pub mod fingerprint;
pub mod fs;
pub mod handler;
pub mod lock;
pub mod rename;
pub mod repository;
pub mod stashignore;
mod stats;
pub mod walker;

pub use error::{FingerprintError, ScanError};
pub use stats::{ScanStats, StatsSnapshot};

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use camino::{Utf8Path, Utf8PathBuf};
use si_core::{
    File, FileDetails, FileId, Folder, FolderId, FxHashSet, LibraryConfig, ProgressReporter,
    ScanConfig, fx_hash_set,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::analyzer::{AnalyzeOptions, Analysis, Entry, FileAnalyzer};
use crate::decorator::{Decorator, ImageDecorator};
use crate::filter::{FilterChain, LibraryFilter, MediaClassifier, MediaKind, PathFilter};
use crate::fingerprint::FingerprintCalculator;
use crate::fs::{FileInfo, FileSystem, ZipFs};
use crate::handler::FileHandler;
use crate::lock::{RELEASE_TIMEOUT, ReadLockManager};
use crate::rename::{FolderRenameDetector, repath_zip_entries};
use crate::repository::Repository;
use crate::stashignore::StashIgnoreFilter;
use crate::walker::{WalkControl, Walker};

/// Per-scan options.
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Paths to scan. Empty means every configured library.
    ///
    /// A path inside a library is scanned with that library's rules; a path
    /// outside every library is scanned as its own root.
    pub paths: Vec<Utf8PathBuf>,

    /// Extra filters applied after the library rules.
    pub filters: FilterChain,

    /// Recompute fingerprints and rerun decorators for known files even when
    /// size and modification time are unchanged.
    pub force_rescan: bool,

    /// Recompute fingerprints last computed before this Unix time.
    pub fingerprint_cutoff: Option<i64>,
}

/// Result of a scan pass.
///
/// Contains statistics and any non-fatal errors encountered.
#[derive(Debug)]
pub struct ScanResult {
    /// Statistics snapshot from the scan.
    pub stats: StatsSnapshot,
    /// Per-entry errors; each entry was skipped.
    pub errors: Vec<ScanError>,
}

/// Reconciles library contents with a [`Repository`].
///
/// # Cloning
///
/// `Scanner` is cheaply cloneable via internal `Arc` references. Clones
/// share the filesystem, repository, ignore cache, read locks, and
/// statistics.
#[derive(Clone)]
pub struct Scanner {
    fs: Arc<dyn FileSystem>,
    repo: Arc<dyn Repository>,
    config: ScanConfig,
    libraries: Vec<LibraryConfig>,
    classifier: MediaClassifier,
    calculator: FingerprintCalculator,
    decorators: Vec<Arc<dyn Decorator>>,
    handlers: Vec<Arc<dyn FileHandler>>,
    ignore: Arc<StashIgnoreFilter>,
    locks: ReadLockManager,
    stats: Arc<ScanStats>,
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("config", &self.config)
            .field("libraries", &self.libraries)
            .field("calculator", &self.calculator)
            .field("decorators", &self.decorators.len())
            .field("handlers", &self.handlers.iter().map(|h| h.name()).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Scanner {
    /// Creates a scanner with no libraries and the image decorator.
    #[must_use]
    pub fn new(fs: Arc<dyn FileSystem>, repo: Arc<dyn Repository>, config: ScanConfig) -> Self {
        let ignore = Arc::new(StashIgnoreFilter::new(Arc::clone(&fs)));
        Self {
            fs,
            repo,
            classifier: MediaClassifier::new(&config),
            config,
            libraries: Vec::new(),
            calculator: FingerprintCalculator::new(),
            decorators: vec![Arc::new(ImageDecorator)],
            handlers: Vec::new(),
            ignore,
            locks: ReadLockManager::new(),
            stats: Arc::new(ScanStats::new()),
        }
    }

    /// Sets the library roots scanned by default.
    #[must_use]
    pub fn with_libraries(mut self, libraries: Vec<LibraryConfig>) -> Self {
        self.libraries = libraries;
        self
    }

    /// Replaces the fingerprint calculator, e.g. to attach a frame sampler.
    #[must_use]
    pub fn with_calculator(mut self, calculator: FingerprintCalculator) -> Self {
        self.calculator = calculator;
        self
    }

    /// Adds a decorator run on new and changed files.
    #[must_use]
    pub fn with_decorator(mut self, decorator: Arc<dyn Decorator>) -> Self {
        self.decorators.push(decorator);
        self
    }

    /// Adds a handler run after a file is created or its content changes.
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn FileHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Shares `locks` with other readers of library files, such as the hash
    /// job, so that moves and content changes cancel them.
    #[must_use]
    pub fn with_read_locks(mut self, locks: ReadLockManager) -> Self {
        self.locks = locks;
        self
    }

    /// Returns the read locks held while files are fingerprinted.
    #[must_use]
    pub fn read_locks(&self) -> &ReadLockManager {
        &self.locks
    }

    /// Returns the repository the scanner writes to.
    #[must_use]
    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    /// Returns the scan configuration.
    #[must_use]
    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Returns a snapshot of the current pass's statistics.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Runs one scan pass.
    ///
    /// Each library root is walked in sorted order. Folders are reconciled
    /// during the walk, so rename detection for a root completes before any
    /// file under it is created. Files are then fingerprinted in parallel and
    /// persisted in walk order.
    ///
    /// Once every target has been processed, known files under the scanned
    /// targets that the pass didn't find are marked missing. A cancelled
    /// pass marks nothing.
    ///
    /// # Errors
    ///
    /// Returns [`ScanError::RootNotFound`] if a library root is missing,
    /// [`ScanError::Repository`] if the repository fails,
    /// [`ScanError::Cancelled`] if `token` fires, or [`ScanError::Config`]
    /// if the worker pool can't be built. Per-entry failures are collected
    /// in [`ScanResult::errors`] instead.
    pub fn scan(
        &self,
        options: &ScanOptions,
        token: &CancellationToken,
        progress: &dyn ProgressReporter,
    ) -> Result<ScanResult, ScanError> {
        self.stats.reset();
        self.ignore.clear_cache();
        let started = unix_micros();

        let parallelism = self.config.effective_parallelism();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(parallelism)
            .thread_name(|i| format!("si-scan-{i}"))
            .build()
            .map_err(|e| ScanError::config(e.to_string()))?;

        let targets = self.targets(options);
        if targets.is_empty() {
            warn!("No libraries configured, nothing to scan");
        }
        info!(targets = targets.len(), parallelism, "Starting scan");

        let mut pass = Pass {
            scanner: self,
            options,
            token,
            progress,
            pool: &pool,
            errors: Vec::new(),
            relocated: fx_hash_set(),
            started,
            scanned: Vec::new(),
            total: 0,
        };
        for (library, path) in &targets {
            pass.scan_path(library, path)?;
        }

        if token.is_cancelled() {
            return Err(ScanError::Cancelled);
        }
        let missing = self.repo.mark_missing(&pass.scanned, started)?;
        for id in &missing {
            trace!(id = %id, "File not found, marked missing");
        }
        self.stats.add_missing(missing.len() as u64);

        let stats = self.stats.snapshot();
        info!(
            new = stats.new,
            updated = stats.updated,
            moved = stats.moved,
            unchanged = stats.unchanged,
            folders_created = stats.folders_created,
            folders_moved = stats.folders_moved,
            missing = stats.missing,
            errors = stats.errors,
            "Scan completed"
        );
        Ok(ScanResult {
            stats,
            errors: pass.errors,
        })
    }

    /// Pairs each requested path with the library whose rules apply.
    fn targets(&self, options: &ScanOptions) -> Vec<(LibraryConfig, Utf8PathBuf)> {
        if options.paths.is_empty() {
            return self
                .libraries
                .iter()
                .map(|lib| (lib.clone(), lib.path.clone()))
                .collect();
        }
        options
            .paths
            .iter()
            .map(|path| {
                let library = self
                    .libraries
                    .iter()
                    .filter(|lib| path.starts_with(&lib.path))
                    .max_by_key(|lib| lib.path.as_str().len())
                    .cloned()
                    .unwrap_or_else(|| LibraryConfig::new(path.clone()));
                (library, path.clone())
            })
            .collect()
    }

    fn chain_for(&self, library: &LibraryConfig, options: &ScanOptions) -> FilterChain {
        let mut chain = FilterChain::new()
            .and(LibraryFilter::new(&self.config, library))
            .and(self.ignore.for_root(library.path.clone()));
        chain.extend(&options.filters);
        chain
    }

    fn analyzer_options(&self, options: &ScanOptions) -> AnalyzeOptions {
        AnalyzeOptions {
            checksum: self.config.calculate_checksum,
            phash: self.config.calculate_phash,
            force_rescan: options.force_rescan,
            fingerprint_cutoff: options.fingerprint_cutoff,
        }
    }
}

/// State of one scan pass.
struct Pass<'s> {
    scanner: &'s Scanner,
    options: &'s ScanOptions,
    token: &'s CancellationToken,
    progress: &'s dyn ProgressReporter,
    pool: &'s rayon::ThreadPool,
    errors: Vec<ScanError>,
    /// Files re-pathed this pass by a folder or archive move.
    relocated: FxHashSet<FileId>,
    /// Start of the pass, in microseconds since the Unix epoch.
    started: i64,
    /// Targets whose known files the pass accounts for.
    scanned: Vec<Utf8PathBuf>,
    total: u64,
}

impl Pass<'_> {
    fn scan_path(&mut self, library: &LibraryConfig, path: &Utf8Path) -> Result<(), ScanError> {
        let scanner = self.scanner;
        let root = library.path.as_path();
        let chain = scanner.chain_for(library, self.options);

        if path != root {
            let info = match scanner.fs.stat(path) {
                Ok(info) => info,
                Err(e) => {
                    warn!(path = %path, error = %e, "Scan path not found, skipping");
                    self.scanned.push(path.to_owned());
                    return Ok(());
                }
            };
            if !ancestors_accepted(root, path, &chain) || !chain.accept(path, &info) {
                debug!(path = %path, "Scan path excluded by filters");
                return Ok(());
            }
            if !info.is_dir {
                self.scanned.push(path.to_owned());
                let Some(kind) = scanner.classifier.classify(path) else {
                    return Ok(());
                };
                let entry = Entry {
                    path: path.to_owned(),
                    info,
                    kind,
                    fs: Arc::clone(&scanner.fs),
                    zip: None,
                };
                return self.process(root, vec![entry]);
            }
        }

        info!(root = %root, path = %path, "Scanning");
        let entries = self.walk(root, path, &chain)?;
        debug!(root = %root, files = entries.len(), "Walk complete");
        self.scanned.push(path.to_owned());
        self.process(root, entries)
    }

    /// Walks `start`, reconciling folders as they are reached and collecting
    /// accepted files.
    fn walk(
        &mut self,
        root: &Utf8Path,
        start: &Utf8Path,
        chain: &FilterChain,
    ) -> Result<Vec<Entry>, ScanError> {
        let scanner = self.scanner;
        let walker = Walker::new(scanner.fs.as_ref()).with_follow_links(scanner.config.follow_links);
        let mut entries = Vec::new();

        let skipped = walker.walk(start, &mut |path, info| {
            if self.token.is_cancelled() {
                return Err(ScanError::Cancelled);
            }
            if info.is_dir {
                if path != start && !chain.accept(path, info) {
                    trace!(path = %path, "Skipping excluded directory");
                    return Ok(WalkControl::SkipDir);
                }
                match self.handle_folder(root, path, info, chain) {
                    Ok(()) => {}
                    Err(e) if e.is_recoverable() => self.record_error(e),
                    Err(e) => return Err(e),
                }
                return Ok(WalkControl::Continue);
            }
            if !chain.accept(path, info) {
                trace!(path = %path, "Skipping excluded file");
                return Ok(WalkControl::Continue);
            }
            if let Some(kind) = scanner.classifier.classify(path) {
                entries.push(Entry {
                    path: path.to_owned(),
                    info: info.clone(),
                    kind,
                    fs: Arc::clone(&scanner.fs),
                    zip: None,
                });
            }
            Ok(WalkControl::Continue)
        })?;

        for e in skipped {
            self.record_error(e);
        }
        Ok(entries)
    }

    fn handle_folder(
        &mut self,
        root: &Utf8Path,
        path: &Utf8Path,
        info: &FileInfo,
        chain: &FilterChain,
    ) -> Result<(), ScanError> {
        let scanner = self.scanner;
        let repo = scanner.repo.as_ref();

        if let Some(mut folder) = repo.find_folder_by_path(path)? {
            if folder.mod_time != info.mod_time {
                folder.mod_time = info.mod_time;
                repo.update_folder(&folder)?;
                debug!(path = %path, "Updated folder modification time");
            }
            return Ok(());
        }

        if path != root {
            let detector = FolderRenameDetector::new(
                scanner.fs.as_ref(),
                repo,
                scanner.config.rename_match_ratio,
            )
            .with_read_locks(&scanner.locks);
            if let Some(candidate) = detector.detect(path, chain)? {
                let parent = self.ensure_parent(root, path)?;
                let relocation = detector.relocate(&candidate.folder, path, parent)?;
                if let Some(mut folder) = repo.find_folder(candidate.folder.id)? {
                    if folder.mod_time != info.mod_time {
                        folder.mod_time = info.mod_time;
                        repo.update_folder(&folder)?;
                    }
                }
                scanner.stats.add_folders_moved(relocation.folders);
                self.relocated.extend(relocation.files);
                return Ok(());
            }
        }

        self.create_folder(root, path, info.mod_time)?;
        Ok(())
    }

    fn ensure_folder(&self, root: &Utf8Path, dir: &Utf8Path) -> Result<FolderId, ScanError> {
        if let Some(folder) = self.scanner.repo.find_folder_by_path(dir)? {
            return Ok(folder.id);
        }
        let mod_time = self.scanner.fs.stat(dir).map_or(0, |info| info.mod_time);
        self.create_folder(root, dir, mod_time)
    }

    fn ensure_parent(&self, root: &Utf8Path, dir: &Utf8Path) -> Result<Option<FolderId>, ScanError> {
        if dir == root || !dir.starts_with(root) {
            return Ok(None);
        }
        match dir.parent() {
            Some(parent) => self.ensure_folder(root, parent).map(Some),
            None => Ok(None),
        }
    }

    fn create_folder(
        &self,
        root: &Utf8Path,
        dir: &Utf8Path,
        mod_time: i64,
    ) -> Result<FolderId, ScanError> {
        let mut folder = Folder::new(dir, mod_time);
        folder.parent_folder_id = self.ensure_parent(root, dir)?;
        let folder = self.scanner.repo.create_folder(folder)?;
        self.scanner.stats.increment_folders_created();
        debug!(path = %dir, id = %folder.id, "Created folder");
        Ok(folder.id)
    }

    /// Fingerprints `entries` in parallel, then persists them in order.
    fn process(&mut self, root: &Utf8Path, entries: Vec<Entry>) -> Result<(), ScanError> {
        if entries.is_empty() {
            return Ok(());
        }
        self.total += entries.len() as u64;
        self.progress.set_total(self.total);

        let analyzer = FileAnalyzer {
            calculator: &self.scanner.calculator,
            decorators: &self.scanner.decorators,
            repo: self.scanner.repo.as_ref(),
            locks: &self.scanner.locks,
            options: self.scanner.analyzer_options(self.options),
        };
        let results = analyzer.analyze_files(&entries, self.pool, self.token, self.progress);

        for (entry, result) in entries.iter().zip(results) {
            if self.token.is_cancelled() {
                return Err(ScanError::Cancelled);
            }
            let outcome = result.and_then(|analysis| self.persist(root, entry, analysis));
            self.progress.increment();
            match outcome {
                Ok(Some(gallery)) => self.scan_zip(root, &gallery)?,
                Ok(None) => {}
                Err(e) if e.is_recoverable() => {
                    self.touch_known(&entry.path)?;
                    self.record_error(e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Writes one analysed entry. Returns the stored record for galleries,
    /// whose members are scanned next.
    fn persist(
        &mut self,
        root: &Utf8Path,
        entry: &Entry,
        analysis: Analysis,
    ) -> Result<Option<File>, ScanError> {
        let scanner = self.scanner;
        let (stored, handle) = match analysis {
            Analysis::Unchanged(file) => {
                if self.relocated.contains(&file.id()) {
                    scanner.stats.increment_moved();
                } else {
                    scanner.stats.increment_unchanged();
                }
                (file, false)
            }
            Analysis::Refreshed(mut file) => {
                file.base.fingerprinted_at = Some(unix_now());
                scanner.repo.update_file(&file)?;
                scanner.stats.increment_updated();
                (file, false)
            }
            Analysis::Changed(mut file) => {
                file.base.fingerprinted_at = Some(unix_now());
                scanner.locks.evict(&entry.path, RELEASE_TIMEOUT);
                scanner.repo.update_file(&file)?;
                scanner.stats.increment_updated();
                (file, true)
            }
            Analysis::New(mut file) => {
                file.base.fingerprinted_at = Some(unix_now());
                self.create_or_move(root, entry, file)?
            }
        };
        scanner.repo.touch_file(stored.id(), self.started)?;
        if handle {
            self.run_handlers(entry, &stored)?;
        }
        let is_gallery = entry.kind == MediaKind::Gallery && entry.zip.is_none();
        Ok(is_gallery.then_some(stored))
    }

    /// Runs the scanner's handlers on a stored file, stopping at the first
    /// failure.
    fn run_handlers(&self, entry: &Entry, file: &File) -> Result<(), ScanError> {
        for handler in &self.scanner.handlers {
            trace!(path = %entry.path, handler = handler.name(), "Running file handler");
            handler
                .handle(entry.fs.as_ref(), file)
                .map_err(|e| ScanError::handler(entry.path.clone(), handler.name(), e))?;
        }
        Ok(())
    }

    /// Keeps a known file that failed this pass from being marked missing.
    fn touch_known(&self, path: &Utf8Path) -> Result<(), ScanError> {
        if let Some(known) = self.scanner.repo.find_file_by_path(path)? {
            self.scanner.repo.touch_file(known.id(), self.started)?;
        }
        Ok(())
    }

    /// Stores a new file, or moves the known record it was moved from.
    /// Returns the stored record and whether it was created.
    fn create_or_move(
        &mut self,
        root: &Utf8Path,
        entry: &Entry,
        mut file: File,
    ) -> Result<(File, bool), ScanError> {
        let scanner = self.scanner;
        if entry.zip.is_some() {
            let file = scanner.repo.create_file(file)?;
            scanner.stats.increment_new();
            return Ok((file, true));
        }

        let parent = match entry.path.parent() {
            Some(dir) => Some(self.ensure_folder(root, dir)?),
            None => None,
        };

        if let Some(found) = self.find_moved(&file)? {
            let old = found.base.path.clone();
            info!(old = %old, new = %entry.path, id = %found.id(), "File moved");
            scanner.locks.evict(&old, RELEASE_TIMEOUT);
            // Readers that just finished may have written to the record.
            let mut moved = scanner.repo.find_file(found.id())?.unwrap_or(found);
            moved.base.set_path(&entry.path);
            moved.base.parent_folder_id = parent;
            moved.base.size = file.base.size;
            moved.base.mod_time = file.base.mod_time;
            moved.base.fingerprinted_at = file.base.fingerprinted_at;
            for fp in file.base.fingerprints.iter() {
                if !moved.base.fingerprints.contains(fp.kind()) {
                    moved.base.fingerprints.set(fp.clone());
                }
            }
            if moved.details == FileDetails::Base {
                moved.details = file.details;
            }
            scanner.repo.update_file(&moved)?;
            let members = repath_zip_entries(scanner.repo.as_ref(), moved.id(), &old, &entry.path)?;
            self.relocated.extend(members);
            scanner.stats.increment_moved();
            return Ok((moved, false));
        }

        file.base.parent_folder_id = parent;
        let file = scanner.repo.create_file(file)?;
        scanner.stats.increment_new();
        Ok((file, true))
    }

    /// Finds the single known file with the same oshash whose recorded path
    /// no longer exists.
    fn find_moved(&self, file: &File) -> Result<Option<File>, ScanError> {
        let Some(oshash) = file.base.fingerprints.oshash() else {
            return Ok(None);
        };
        let fs = self.scanner.fs.as_ref();
        let mut missing = self
            .scanner
            .repo
            .find_files_by_oshash(oshash)?
            .into_iter()
            .filter(|known| {
                known.base.zip_file_id.is_none()
                    && known.base.path != file.base.path
                    && fs.lstat(&known.base.path).is_err()
            });

        match (missing.next(), missing.next()) {
            (Some(found), None) => Ok(Some(found)),
            (Some(_), Some(_)) => {
                debug!(path = %file.base.path, "Several missing files share this oshash, treating as new");
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// Scans the image members of a zip gallery.
    fn scan_zip(&mut self, root: &Utf8Path, gallery: &File) -> Result<(), ScanError> {
        let scanner = self.scanner;
        let archive = gallery.path();
        let zip = match ZipFs::open(Arc::clone(&scanner.fs), archive) {
            Ok(zip) => Arc::new(zip),
            Err(e) => {
                self.record_error(ScanError::read(archive, e));
                return Ok(());
            }
        };
        let zip_fs: Arc<dyn FileSystem> = Arc::clone(&zip) as Arc<dyn FileSystem>;

        let mut entries = Vec::new();
        let skipped = Walker::new(zip.as_ref()).walk(archive, &mut |path, info| {
            if !info.is_dir && scanner.classifier.classify(path) == Some(MediaKind::Image) {
                entries.push(Entry {
                    path: path.to_owned(),
                    info: info.clone(),
                    kind: MediaKind::Image,
                    fs: Arc::clone(&zip_fs),
                    zip: Some(gallery.id()),
                });
            }
            Ok(WalkControl::Continue)
        });
        match skipped {
            Ok(skipped) => {
                for e in skipped {
                    self.record_error(e);
                }
            }
            Err(e) if e.is_recoverable() => self.record_error(e),
            Err(e) => return Err(e),
        }

        debug!(archive = %archive, members = entries.len(), "Scanning zip members");
        self.process(root, entries)
    }

    fn record_error(&mut self, error: ScanError) {
        warn!(path = ?error.path(), error = %error, "Skipping entry");
        self.scanner.stats.increment_errors();
        self.errors.push(error);
    }
}

/// Returns `true` if every directory strictly between `root` and `path` is
/// accepted by `chain`.
fn ancestors_accepted(root: &Utf8Path, path: &Utf8Path, chain: &FilterChain) -> bool {
    path.ancestors()
        .skip(1)
        .take_while(|dir| *dir != root && dir.starts_with(root))
        .all(|dir| chain.accept(dir, &FileInfo::dir(dir.file_name().unwrap_or_default(), 0)))
}

fn unix_now() -> i64 {
    unix_micros().div_euclid(1_000_000)
}

fn unix_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
}
