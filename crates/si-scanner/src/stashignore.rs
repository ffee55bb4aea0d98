//! Directory-scoped `.stashignore` exclusion.
//!
//! A `.stashignore` file uses gitignore syntax and applies to the directory
//! it lives in and everything below. For a candidate path the filter consults
//! every ignore file from the library root down to the path's parent
//! directory. Each file's patterns are matched against the path relative to
//! that file's directory, and the last matching rule wins: a deeper `!pattern`
//! re-includes what a shallower file ignored.
//!
//! ```text
//! library/
//! ├── .stashignore        *.tmp
//! ├── a.tmp               ignored (root rule)
//! └── sub/
//!     ├── .stashignore    *.log
//!     ├── b.log           ignored (sub rule)
//!     └── c.tmp           ignored (root rule still applies)
//! ```
//!
//! Ignore files are read through the scanner's [`FileSystem`]. Compiled ones
//! are cached per directory, including a negative entry for directories
//! without one. `.stashignore` files themselves are always accepted so that
//! they are visible to the scan.

use std::io::Read;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use ignore::Match;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use parking_lot::RwLock;
use si_core::FxHashMap;
use tracing::{debug, trace, warn};

use crate::filter::PathFilter;
use crate::fs::{FileInfo, FileSystem};

/// File name of a directory's ignore file.
pub const STASHIGNORE_FILE: &str = ".stashignore";

/// Evaluates `.stashignore` files with a shared per-directory cache.
///
/// # Examples
///
/// ```no_run
/// use std::io::Read;
/// use std::sync::Arc;
/// use si_scanner::fs::OsFs;
/// use si_scanner::stashignore::StashIgnoreFilter;
/// use camino::Utf8Path;
///
/// let filter = Arc::new(StashIgnoreFilter::new(Arc::new(OsFs)));
/// let root = Utf8Path::new("/media/videos");
/// let keep = filter.is_accepted(root, Utf8Path::new("/media/videos/a.mp4"), false);
/// ```
pub struct StashIgnoreFilter {
    fs: Arc<dyn FileSystem>,
    cache: RwLock<FxHashMap<Utf8PathBuf, Option<Arc<Gitignore>>>>,
}

impl std::fmt::Debug for StashIgnoreFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StashIgnoreFilter")
            .field("cached", &self.cache.read().len())
            .finish_non_exhaustive()
    }
}

impl StashIgnoreFilter {
    /// Creates a filter reading ignore files from `fs`, with an empty cache.
    #[must_use]
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self {
            fs,
            cache: RwLock::default(),
        }
    }

    /// Returns a [`PathFilter`] bound to one library root.
    #[must_use]
    pub fn for_root(self: &Arc<Self>, root: impl Into<Utf8PathBuf>) -> RootedStashIgnore {
        RootedStashIgnore {
            filter: Arc::clone(self),
            root: root.into(),
        }
    }

    /// Drops every cached ignore file so edits are picked up.
    pub fn clear_cache(&self) {
        self.cache.write().clear();
    }

    /// Returns `true` if `path` under `root` is not excluded.
    ///
    /// Paths outside `root` are accepted.
    pub fn is_accepted(&self, root: &Utf8Path, path: &Utf8Path, is_dir: bool) -> bool {
        if !is_dir && path.file_name() == Some(STASHIGNORE_FILE) {
            return true;
        }
        if path == root || !path.starts_with(root) {
            return true;
        }
        let Some(parent) = path.parent() else {
            return true;
        };

        let mut ignored = false;
        for dir in layer_dirs(root, parent) {
            let Some(gitignore) = self.load(&dir) else {
                continue;
            };
            let Ok(rel) = path.strip_prefix(&dir) else {
                continue;
            };
            match gitignore.matched_path_or_any_parents(rel.as_std_path(), is_dir) {
                Match::Ignore(_) => ignored = true,
                Match::Whitelist(_) => ignored = false,
                Match::None => {}
            }
        }

        if ignored {
            trace!(path = %path, "Excluded by .stashignore");
        }
        !ignored
    }

    fn load(&self, dir: &Utf8Path) -> Option<Arc<Gitignore>> {
        if let Some(entry) = self.cache.read().get(dir) {
            return entry.clone();
        }

        let compiled = compile(self.fs.as_ref(), dir).map(Arc::new);
        self.cache
            .write()
            .entry(dir.to_owned())
            .or_insert(compiled)
            .clone()
    }
}

/// Directories from `root` to `dir` inclusive, shallowest first.
fn layer_dirs(root: &Utf8Path, dir: &Utf8Path) -> Vec<Utf8PathBuf> {
    let mut dirs: Vec<Utf8PathBuf> = dir
        .ancestors()
        .take_while(|d| d.starts_with(root))
        .map(Utf8Path::to_path_buf)
        .collect();
    dirs.reverse();
    dirs
}

/// Strips a line down to its pattern, or `None` for blanks and comments.
fn pattern_line(line: &str) -> Option<&str> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let line = if line.ends_with("\\ ") {
        line
    } else {
        line.trim_end()
    };
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    Some(line)
}

fn read_ignore_file(fs: &dyn FileSystem, path: &Utf8Path) -> std::io::Result<String> {
    let mut contents = String::new();
    fs.open(path)?.read_to_string(&mut contents)?;
    Ok(contents)
}

fn compile(fs: &dyn FileSystem, dir: &Utf8Path) -> Option<Gitignore> {
    let path = dir.join(STASHIGNORE_FILE);
    let contents = match read_ignore_file(fs, &path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path, error = %e, "Failed to read .stashignore");
            return None;
        }
    };

    let mut builder = GitignoreBuilder::new(dir);
    let mut patterns = 0_usize;
    for line in contents.lines().filter_map(pattern_line) {
        match builder.add_line(Some(path.clone().into_std_path_buf()), line) {
            Ok(_) => patterns += 1,
            Err(e) => warn!(path = %path, pattern = line, error = %e, "Skipping invalid ignore pattern"),
        }
    }

    match builder.build() {
        Ok(gitignore) => {
            debug!(path = %path, patterns, "Loaded .stashignore");
            Some(gitignore)
        }
        Err(e) => {
            warn!(path = %path, error = %e, "Failed to compile .stashignore");
            None
        }
    }
}

/// A [`StashIgnoreFilter`] bound to a library root.
#[derive(Debug, Clone)]
pub struct RootedStashIgnore {
    filter: Arc<StashIgnoreFilter>,
    root: Utf8PathBuf,
}

impl PathFilter for RootedStashIgnore {
    fn accept(&self, path: &Utf8Path, info: &FileInfo) -> bool {
        self.filter.is_accepted(&self.root, path, info.is_dir)
    }
}
