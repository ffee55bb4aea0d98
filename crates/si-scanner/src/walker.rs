//! Deterministic directory traversal over a [`FileSystem`].
//!
//! This module provides [`Walker`], a depth-first walk that visits entries
//! sorted by name and lets the visitor prune directories.
//!
//! Host filesystems are walked with the `ignore` crate's [`WalkBuilder`],
//! with its gitignore handling switched off (`.stashignore` rules are applied
//! by the scanner's filters). Other filesystems, such as a
//! [`ZipFs`](crate::fs::ZipFs), are walked through [`FileSystem::read_dir`].
//!
//! # Features
//!
//! - Sorted, deterministic order (parents before children)
//! - Symbolic links followed to their targets when enabled, reported under
//!   the link path
//! - Revisit guard on canonical directory paths, so link cycles terminate
//! - Per-directory listing failures are collected, not fatal
//!
//! # Examples
//!
//! ```no_run
//! use si_scanner::fs::OsFs;
//! use si_scanner::walker::{WalkControl, Walker};
//! use camino::Utf8Path;
//!
//! let fs = OsFs;
//! let walker = Walker::new(&fs).with_follow_links(true);
//! let skipped = walker.walk(Utf8Path::new("/media/videos"), &mut |path, info| {
//!     println!("{path} dir={}", info.is_dir);
//!     Ok(WalkControl::Continue)
//! })?;
//! println!("{} unreadable entries", skipped.len());
//! # Ok::<(), si_scanner::ScanError>(())
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use ignore::WalkBuilder;
use parking_lot::Mutex;
use si_core::{FxHashSet, fx_hash_set};
use tracing::{trace, warn};

use crate::error::ScanError;
use crate::fs::{FileInfo, FileSystem, info_from_metadata};

/// Visitor callback: receives each entry and decides whether to descend.
pub type Visit<'v> = dyn FnMut(&Utf8Path, &FileInfo) -> Result<WalkControl, ScanError> + 'v;

/// What the walker does after visiting an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkControl {
    /// Keep going; descend if the entry is a directory.
    Continue,
    /// Don't descend into this directory. Ignored for files.
    SkipDir,
}

/// A depth-first, sorted directory walker.
pub struct Walker<'a> {
    fs: &'a dyn FileSystem,
    follow_links: bool,
}

impl std::fmt::Debug for Walker<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Walker")
            .field("follow_links", &self.follow_links)
            .field("host", &self.fs.is_host())
            .finish_non_exhaustive()
    }
}

impl<'a> Walker<'a> {
    /// Creates a walker over `fs` that does not follow links.
    #[must_use]
    pub fn new(fs: &'a dyn FileSystem) -> Self {
        Self {
            fs,
            follow_links: false,
        }
    }

    /// Configures whether symbolic links are followed.
    #[must_use]
    pub const fn with_follow_links(mut self, follow: bool) -> Self {
        self.follow_links = follow;
        self
    }

    /// Walks `root`, calling `visit` for the root and every entry below it.
    ///
    /// Returns the recoverable errors hit along the way (unreadable
    /// directories, dangling links).
    ///
    /// # Errors
    ///
    /// Returns [`ScanError::RootNotFound`] if `root` isn't a directory, or
    /// the first error returned by `visit`.
    pub fn walk(&self, root: &Utf8Path, visit: &mut Visit<'_>) -> Result<Vec<ScanError>, ScanError> {
        let info = match self.fs.stat(root) {
            Ok(info) if info.is_dir => info,
            _ => return Err(ScanError::RootNotFound(root.to_owned())),
        };

        let mut visited = fx_hash_set();
        if let Ok(canonical) = self.fs.canonicalize(root) {
            visited.insert(canonical);
        }

        let mut errors = Vec::new();
        if visit(root, &info)? == WalkControl::Continue {
            if self.fs.is_host() {
                self.walk_host(root, &mut visited, visit, &mut errors)?;
            } else {
                self.walk_dir(root, &mut visited, visit, &mut errors)?;
            }
        }
        Ok(errors)
    }

    /// Walks a host directory tree with [`WalkBuilder`].
    ///
    /// Directories the visitor skips are recorded in a shared set that the
    /// entry filter consults, so their children are never visited.
    fn walk_host(
        &self,
        root: &Utf8Path,
        visited: &mut FxHashSet<Utf8PathBuf>,
        visit: &mut Visit<'_>,
        errors: &mut Vec<ScanError>,
    ) -> Result<(), ScanError> {
        let pruned: Arc<Mutex<FxHashSet<PathBuf>>> = Arc::new(Mutex::new(fx_hash_set()));
        let filter = Arc::clone(&pruned);
        let walk = WalkBuilder::new(root)
            .standard_filters(false)
            .follow_links(self.follow_links)
            .sort_by_file_name(|a, b| a.cmp(b))
            .filter_entry(move |entry| {
                entry
                    .path()
                    .parent()
                    .is_none_or(|dir| !filter.lock().contains(dir))
            })
            .build();

        for result in walk {
            let entry = match result {
                Ok(entry) => entry,
                Err(e) if is_loop(&e) => {
                    trace!(error = %e, "Skipping symbolic link cycle");
                    continue;
                }
                Err(e) => {
                    let error = walk_error(e, root);
                    warn!(path = ?error.path(), error = %error, "Failed to walk entry");
                    errors.push(error);
                    continue;
                }
            };
            if entry.depth() == 0 {
                continue;
            }
            let Some(path) = Utf8Path::from_path(entry.path()) else {
                warn!(path = %entry.path().display(), "Skipping path that is not valid UTF-8");
                continue;
            };
            if entry.path_is_symlink() && !self.follow_links {
                trace!(path = %path, "Skipping symbolic link");
                continue;
            }
            let info = match entry.metadata() {
                Ok(meta) => {
                    let name = path.file_name().unwrap_or(path.as_str()).to_owned();
                    info_from_metadata(name, &meta)
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "Skipping entry without metadata");
                    errors.push(ScanError::read(path, into_io(e)));
                    continue;
                }
            };

            if info.is_dir && self.follow_links && !self.first_visit(path, visited) {
                trace!(path = %path, "Skipping already visited directory");
                pruned.lock().insert(entry.path().to_path_buf());
                continue;
            }

            if visit(path, &info)? == WalkControl::SkipDir && info.is_dir {
                pruned.lock().insert(entry.path().to_path_buf());
            }
        }
        Ok(())
    }

    fn walk_dir(
        &self,
        dir: &Utf8Path,
        visited: &mut FxHashSet<Utf8PathBuf>,
        visit: &mut Visit<'_>,
        errors: &mut Vec<ScanError>,
    ) -> Result<(), ScanError> {
        let entries = match self.fs.read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %dir, error = %e, "Failed to list directory");
                errors.push(ScanError::walk(dir, e));
                return Ok(());
            }
        };

        for entry in entries {
            let path = dir.join(&entry.name);
            let Some(info) = self.resolve(&path, entry, errors) else {
                continue;
            };

            if info.is_dir && !self.first_visit(&path, visited) {
                trace!(path = %path, "Skipping already visited directory");
                continue;
            }

            let control = visit(&path, &info)?;
            if info.is_dir && control == WalkControl::Continue {
                self.walk_dir(&path, visited, visit, errors)?;
            }
        }
        Ok(())
    }

    /// Replaces link metadata with the target's, or drops the link.
    fn resolve(
        &self,
        path: &Utf8Path,
        entry: FileInfo,
        errors: &mut Vec<ScanError>,
    ) -> Option<FileInfo> {
        if !entry.is_symlink {
            return Some(entry);
        }
        if !self.follow_links {
            trace!(path = %path, "Skipping symbolic link");
            return None;
        }
        match self.fs.stat(path) {
            Ok(target) => Some(FileInfo {
                name: entry.name,
                ..target
            }),
            Err(e) => {
                warn!(path = %path, error = %e, "Skipping dangling symbolic link");
                errors.push(ScanError::read(path, e));
                None
            }
        }
    }

    fn first_visit(&self, path: &Utf8Path, visited: &mut FxHashSet<Utf8PathBuf>) -> bool {
        match self.fs.canonicalize(path) {
            Ok(canonical) => visited.insert(canonical),
            Err(_) => true,
        }
    }
}

fn is_loop(err: &ignore::Error) -> bool {
    match err {
        ignore::Error::Loop { .. } => true,
        ignore::Error::WithPath { err, .. }
        | ignore::Error::WithDepth { err, .. }
        | ignore::Error::WithLineNumber { err, .. } => is_loop(err),
        _ => false,
    }
}

fn error_path(err: &ignore::Error) -> Option<&Path> {
    match err {
        ignore::Error::WithPath { path, .. } => Some(path),
        ignore::Error::WithDepth { err, .. } | ignore::Error::WithLineNumber { err, .. } => {
            error_path(err)
        }
        _ => None,
    }
}

fn into_io(err: ignore::Error) -> io::Error {
    let message = err.to_string();
    err.into_io_error().unwrap_or_else(|| io::Error::other(message))
}

fn walk_error(err: ignore::Error, root: &Utf8Path) -> ScanError {
    let path = error_path(&err)
        .and_then(Utf8Path::from_path)
        .unwrap_or(root)
        .to_owned();
    ScanError::walk(path, into_io(err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::OsFs;
    use crate::fs::tests::{utf8, write_zip};
    use crate::fs::ZipFs;
    use tempfile::TempDir;

    fn collect(walker: &Walker<'_>, root: &Utf8Path, skip: &str) -> Vec<String> {
        let mut seen = Vec::new();
        walker
            .walk(root, &mut |path, info| {
                let rel = path.strip_prefix(root).unwrap_or(path).to_string();
                seen.push(rel);
                if info.is_dir && info.name == skip {
                    Ok(WalkControl::SkipDir)
                } else {
                    Ok(WalkControl::Continue)
                }
            })
            .unwrap();
        seen
    }

    #[test]
    fn test_walk_is_sorted_depth_first() {
        let dir = TempDir::new().unwrap();
        let root = utf8(&dir);
        std::fs::create_dir_all(root.join("b/inner")).unwrap();
        std::fs::write(root.join("c.mp4"), b"x").unwrap();
        std::fs::write(root.join("a.mp4"), b"x").unwrap();
        std::fs::write(root.join("b/inner/d.mp4"), b"x").unwrap();

        let fs = OsFs;
        let seen = collect(&Walker::new(&fs), &root, "");
        assert_eq!(seen, vec!["", "a.mp4", "b", "b/inner", "b/inner/d.mp4", "c.mp4"]);
    }

    #[test]
    fn test_skip_dir_prunes_subtree() {
        let dir = TempDir::new().unwrap();
        let root = utf8(&dir);
        std::fs::create_dir_all(root.join("skip/deep")).unwrap();
        std::fs::write(root.join("skip/deep/a.mp4"), b"x").unwrap();
        std::fs::write(root.join("keep.mp4"), b"x").unwrap();

        let fs = OsFs;
        let seen = collect(&Walker::new(&fs), &root, "skip");
        assert_eq!(seen, vec!["", "keep.mp4", "skip"]);
    }

    #[test]
    fn test_missing_root_is_fatal() {
        let dir = TempDir::new().unwrap();
        let fs = OsFs;
        let err = Walker::new(&fs)
            .walk(&utf8(&dir).join("missing"), &mut |_, _| Ok(WalkControl::Continue))
            .unwrap_err();
        assert!(matches!(err, ScanError::RootNotFound(_)));
    }

    #[test]
    fn test_visitor_error_stops_walk() {
        let dir = TempDir::new().unwrap();
        let root = utf8(&dir);
        std::fs::write(root.join("a.mp4"), b"x").unwrap();
        std::fs::write(root.join("b.mp4"), b"x").unwrap();

        let fs = OsFs;
        let mut visits = 0;
        let err = Walker::new(&fs)
            .walk(&root, &mut |path, _| {
                visits += 1;
                if path.as_str().ends_with("a.mp4") {
                    Err(ScanError::Cancelled)
                } else {
                    Ok(WalkControl::Continue)
                }
            })
            .unwrap_err();
        assert!(matches!(err, ScanError::Cancelled));
        assert_eq!(visits, 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_follows_links_and_guards_cycles() {
        let dir = TempDir::new().unwrap();
        let root = utf8(&dir);
        std::fs::create_dir_all(root.join("real")).unwrap();
        std::fs::write(root.join("real/a.mp4"), b"x").unwrap();
        std::os::unix::fs::symlink(root.join("real"), root.join("z_link")).unwrap();
        std::os::unix::fs::symlink(&root, root.join("real/loop")).unwrap();

        let fs = OsFs;
        let followed = collect(&Walker::new(&fs).with_follow_links(true), &root, "");
        // "z_link" resolves to the already visited "real", "loop" to the root
        assert_eq!(followed, vec!["", "real", "real/a.mp4"]);

        let unfollowed = collect(&Walker::new(&fs), &root, "");
        assert_eq!(unfollowed, vec!["", "real", "real/a.mp4"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_linked_file_reported_under_link_path() {
        let dir = TempDir::new().unwrap();
        let root = utf8(&dir);
        let outside = TempDir::new().unwrap();
        let target = utf8(&outside).join("target.mp4");
        std::fs::write(&target, b"hello").unwrap();
        std::os::unix::fs::symlink(&target, root.join("alias.mp4")).unwrap();

        let fs = OsFs;
        let mut sizes = Vec::new();
        Walker::new(&fs)
            .with_follow_links(true)
            .walk(&root, &mut |path, info| {
                if !info.is_dir {
                    sizes.push((path.file_name().unwrap_or_default().to_owned(), info.size));
                }
                Ok(WalkControl::Continue)
            })
            .unwrap();
        assert_eq!(sizes, vec![("alias.mp4".to_owned(), 5)]);
    }

    /// Delegates to the OS but hides that it is the host filesystem.
    struct Indirect;

    impl FileSystem for Indirect {
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
            OsFs.open(path)
        }
        fn canonicalize(&self, path: &Utf8Path) -> io::Result<Utf8PathBuf> {
            OsFs.canonicalize(path)
        }
    }

    #[test]
    fn test_host_and_trait_walks_agree() {
        let dir = TempDir::new().unwrap();
        let root = utf8(&dir);
        std::fs::create_dir_all(root.join("b/skip/deeper")).unwrap();
        std::fs::create_dir_all(root.join("B")).unwrap();
        std::fs::write(root.join("b/skip/deeper/x.mp4"), b"x").unwrap();
        std::fs::write(root.join("b/c.mp4"), b"x").unwrap();
        std::fs::write(root.join("a b.mp4"), b"x").unwrap();
        std::fs::write(root.join(".hidden.mp4"), b"x").unwrap();
        std::fs::write(root.join(".gitignore"), b"*.mp4\n").unwrap();

        let host = collect(&Walker::new(&OsFs), &root, "skip");
        let indirect = collect(&Walker::new(&Indirect), &root, "skip");
        assert_eq!(host, indirect);
        assert_eq!(
            host,
            vec!["", ".gitignore", ".hidden.mp4", "B", "a b.mp4", "b", "b/c.mp4", "b/skip"]
        );
    }

    #[test]
    fn test_walks_zip_archive() {
        let dir = TempDir::new().unwrap();
        let root = utf8(&dir);
        let archive = root.join("gallery.zip");
        write_zip(&archive, &[("b.png", b"bb"), ("sub/a.jpg", b"aa")]);

        let zip = ZipFs::open(Arc::new(OsFs), &archive).unwrap();
        let seen = collect(&Walker::new(&zip), &archive, "");
        assert_eq!(seen, vec!["", "b.png", "sub", "sub/a.jpg"]);
    }
}
