//! Storage seam for file and folder records.
//!
//! The scanner reads and writes records only through [`Repository`]. The
//! crate ships [`MemoryRepository`], an arena-backed implementation with a
//! JSON snapshot, used by the CLI and by tests.
//!
//! # Clone-on-read
//!
//! `MemoryRepository` never hands out references into its storage:
//!
//! - **Reads clone** the record out of the arena
//! - **Writes take** the record by value or reference and copy it in
//! - **Locks are scoped** to a single method call
//!
//! # Examples
//!
//! ```
//! use si_core::{BaseFile, File};
//! use si_scanner::repository::{MemoryRepository, Repository};
//! use camino::Utf8Path;
//!
//! let repo = MemoryRepository::new();
//! let created = repo.create_file(File::new(BaseFile::new("/lib/a.mp4", 10, 1)))?;
//! assert!(!created.id().is_unset());
//!
//! let found = repo.find_file_by_path(Utf8Path::new("/lib/a.mp4"))?;
//! assert_eq!(found.map(|f| f.id()), Some(created.id()));
//! # Ok::<(), si_scanner::repository::RepositoryError>(())
//! ```

use std::io::{BufReader, BufWriter};
use std::sync::atomic::{AtomicU64, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use si_core::{File, FileId, Folder, FolderId, FxHashMap};
use tracing::debug;

use crate::fingerprint::PhashLookup;

/// Errors returned by a [`Repository`].
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// No file with the given id exists.
    #[error("file {0} not found")]
    FileNotFound(FileId),

    /// No folder with the given id exists.
    #[error("folder {0} not found")]
    FolderNotFound(FolderId),

    /// Another record already uses the path.
    #[error("path already in use: {0}")]
    DuplicatePath(Utf8PathBuf),

    /// Reading or writing a snapshot failed.
    #[error("snapshot I/O failed for {path}: {source}")]
    Io {
        /// The snapshot path.
        path: Utf8PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A snapshot couldn't be encoded or decoded.
    #[error("invalid snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),
}

/// Persistent storage for files and folders.
///
/// Identity is the absolute path: at most one file and one folder exist per
/// path. Ids are assigned on create and never reused.
pub trait Repository: Send + Sync {
    /// Returns the file with the given id.
    ///
    /// # Errors
    ///
    /// Returns a [`RepositoryError`] if storage is unavailable.
    fn find_file(&self, id: FileId) -> Result<Option<File>, RepositoryError>;

    /// Returns the file stored at `path`.
    ///
    /// # Errors
    ///
    /// Returns a [`RepositoryError`] if storage is unavailable.
    fn find_file_by_path(&self, path: &Utf8Path) -> Result<Option<File>, RepositoryError>;

    /// Returns files with the given basename, size, and modification time.
    ///
    /// # Errors
    ///
    /// Returns a [`RepositoryError`] if storage is unavailable.
    fn find_files_by_info(
        &self,
        basename: &str,
        size: u64,
        mod_time: i64,
    ) -> Result<Vec<File>, RepositoryError>;

    /// Returns files whose oshash equals `oshash`.
    ///
    /// # Errors
    ///
    /// Returns a [`RepositoryError`] if storage is unavailable.
    fn find_files_by_oshash(&self, oshash: &str) -> Result<Vec<File>, RepositoryError>;

    /// Returns the files directly inside `folder`.
    ///
    /// # Errors
    ///
    /// Returns a [`RepositoryError`] if storage is unavailable.
    fn find_files_in_folder(&self, folder: FolderId) -> Result<Vec<File>, RepositoryError>;

    /// Returns the entries of the zip archive `zip`.
    ///
    /// # Errors
    ///
    /// Returns a [`RepositoryError`] if storage is unavailable.
    fn find_files_in_zip(&self, zip: FileId) -> Result<Vec<File>, RepositoryError>;

    /// Counts the files directly inside `folder`.
    ///
    /// # Errors
    ///
    /// Returns a [`RepositoryError`] if storage is unavailable.
    fn count_files_in_folder(&self, folder: FolderId) -> Result<usize, RepositoryError>;

    /// Returns every file, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns a [`RepositoryError`] if storage is unavailable.
    fn all_files(&self) -> Result<Vec<File>, RepositoryError>;

    /// Stores a new file and returns it with its assigned id.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::DuplicatePath`] if the path is taken.
    fn create_file(&self, file: File) -> Result<File, RepositoryError>;

    /// Replaces the stored file with the same id.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::FileNotFound`] for an unknown id, or
    /// [`RepositoryError::DuplicatePath`] if a new path is taken.
    fn update_file(&self, file: &File) -> Result<(), RepositoryError>;

    /// Records that a scan found the file at `seen_at`, in microseconds since
    /// the Unix epoch, and clears its missing mark.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::FileNotFound`] for an unknown id.
    fn touch_file(&self, id: FileId, seen_at: i64) -> Result<(), RepositoryError>;

    /// Marks files under any of `roots` that no scan has found since `since`
    /// (microseconds since the Unix epoch) as missing.
    ///
    /// Files already marked keep their original mark. Returns the ids newly
    /// marked.
    ///
    /// # Errors
    ///
    /// Returns a [`RepositoryError`] if storage is unavailable.
    fn mark_missing(&self, roots: &[Utf8PathBuf], since: i64) -> Result<Vec<FileId>, RepositoryError>;

    /// Returns the folder stored at `path`.
    ///
    /// # Errors
    ///
    /// Returns a [`RepositoryError`] if storage is unavailable.
    fn find_folder_by_path(&self, path: &Utf8Path) -> Result<Option<Folder>, RepositoryError>;

    /// Returns the folder with the given id.
    ///
    /// # Errors
    ///
    /// Returns a [`RepositoryError`] if storage is unavailable.
    fn find_folder(&self, id: FolderId) -> Result<Option<Folder>, RepositoryError>;

    /// Returns the direct subfolders of `parent`.
    ///
    /// # Errors
    ///
    /// Returns a [`RepositoryError`] if storage is unavailable.
    fn find_subfolders(&self, parent: FolderId) -> Result<Vec<Folder>, RepositoryError>;

    /// Stores a new folder and returns it with its assigned id.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::DuplicatePath`] if the path is taken.
    fn create_folder(&self, folder: Folder) -> Result<Folder, RepositoryError>;

    /// Replaces the stored folder with the same id.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::FolderNotFound`] for an unknown id, or
    /// [`RepositoryError::DuplicatePath`] if a new path is taken.
    fn update_folder(&self, folder: &Folder) -> Result<(), RepositoryError>;
}

/// Adapts a [`Repository`] into a [`PhashLookup`].
#[derive(Clone, Copy)]
pub struct RepositoryLookup<'a>(pub &'a dyn Repository);

impl PhashLookup for RepositoryLookup<'_> {
    fn phash_for_oshash(&self, oshash: &str) -> Option<u64> {
        self.0
            .find_files_by_oshash(oshash)
            .ok()?
            .iter()
            .find_map(|f| f.base.fingerprints.phash())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    files: Vec<File>,
    folders: Vec<Folder>,
}

#[derive(Debug, Default)]
struct Store {
    /// Arena indexed by `id - 1`.
    files: Vec<File>,
    folders: Vec<Folder>,
    file_paths: FxHashMap<Utf8PathBuf, FileId>,
    folder_paths: FxHashMap<Utf8PathBuf, FolderId>,
    /// Last time a scan found each file. Not persisted.
    seen: FxHashMap<FileId, i64>,
}

fn slot(id: u64) -> Option<usize> {
    usize::try_from(id).ok()?.checked_sub(1)
}

fn next_id(len: usize) -> u64 {
    u64::try_from(len).unwrap_or(u64::MAX).saturating_add(1)
}

impl Store {
    fn file(&self, id: FileId) -> Option<&File> {
        slot(id.as_u64()).and_then(|idx| self.files.get(idx))
    }

    fn file_mut(&mut self, id: FileId) -> Option<&mut File> {
        slot(id.as_u64()).and_then(|idx| self.files.get_mut(idx))
    }

    fn folder(&self, id: FolderId) -> Option<&Folder> {
        slot(id.as_u64()).and_then(|idx| self.folders.get(idx))
    }

    fn from_snapshot(snapshot: Snapshot) -> Result<Self, RepositoryError> {
        let mut store = Self::default();
        let mut files = snapshot.files;
        let mut folders = snapshot.folders;
        files.sort_by_key(File::id);
        folders.sort_by_key(|f| f.id);

        for file in files {
            if file.id().as_u64() != next_id(store.files.len()) {
                return Err(sparse_ids("file", file.id().as_u64()));
            }
            store.file_paths.insert(file.base.path.clone(), file.id());
            store.files.push(file);
        }
        for folder in folders {
            if folder.id.as_u64() != next_id(store.folders.len()) {
                return Err(sparse_ids("folder", folder.id.as_u64()));
            }
            store.folder_paths.insert(folder.path.clone(), folder.id);
            store.folders.push(folder);
        }
        Ok(store)
    }
}

fn sparse_ids(kind: &str, id: u64) -> RepositoryError {
    RepositoryError::Snapshot(<serde_json::Error as serde::de::Error>::custom(format!(
        "unexpected {kind} id {id}, ids must be dense from 1"
    )))
}

/// An in-memory [`Repository`].
///
/// Every successful create or update increments a write counter, which makes
/// it easy to assert that a pass changed nothing.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    store: RwLock<Store>,
    writes: AtomicU64,
}

impl MemoryRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of creates and updates performed so far.
    #[must_use]
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Number of stored files.
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.store.read().files.len()
    }

    /// Number of stored folders.
    #[must_use]
    pub fn folder_count(&self) -> usize {
        self.store.read().folders.len()
    }

    /// Returns every folder, ordered by id.
    #[must_use]
    pub fn all_folders(&self) -> Vec<Folder> {
        self.store.read().folders.clone()
    }

    /// Loads a snapshot written by [`save`](Self::save).
    ///
    /// A missing file yields an empty repository.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Io`] or [`RepositoryError::Snapshot`] if
    /// the file can't be read or parsed.
    pub fn load(path: &Utf8Path) -> Result<Self, RepositoryError> {
        let file = match std::fs::File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path, "No repository snapshot, starting empty");
                return Ok(Self::new());
            }
            Err(source) => {
                return Err(RepositoryError::Io {
                    path: path.to_owned(),
                    source,
                });
            }
        };
        let snapshot: Snapshot = serde_json::from_reader(BufReader::new(file))?;
        let store = Store::from_snapshot(snapshot)?;
        debug!(
            path = %path,
            files = store.files.len(),
            folders = store.folders.len(),
            "Loaded repository snapshot"
        );
        Ok(Self {
            store: RwLock::new(store),
            writes: AtomicU64::new(0),
        })
    }

    /// Writes every record to `path` as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Io`] or [`RepositoryError::Snapshot`] if
    /// the file can't be written.
    pub fn save(&self, path: &Utf8Path) -> Result<(), RepositoryError> {
        let snapshot = {
            let store = self.store.read();
            Snapshot {
                files: store.files.clone(),
                folders: store.folders.clone(),
            }
        };
        let io_err = |source| RepositoryError::Io {
            path: path.to_owned(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = std::fs::File::create(path).map_err(io_err)?;
        serde_json::to_writer_pretty(BufWriter::new(file), &snapshot)?;
        Ok(())
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }
}

impl Repository for MemoryRepository {
    fn find_file(&self, id: FileId) -> Result<Option<File>, RepositoryError> {
        Ok(self.store.read().file(id).cloned())
    }

    fn find_file_by_path(&self, path: &Utf8Path) -> Result<Option<File>, RepositoryError> {
        let store = self.store.read();
        Ok(store
            .file_paths
            .get(path)
            .and_then(|id| store.file(*id))
            .cloned())
    }

    fn find_files_by_info(
        &self,
        basename: &str,
        size: u64,
        mod_time: i64,
    ) -> Result<Vec<File>, RepositoryError> {
        Ok(self
            .store
            .read()
            .files
            .iter()
            .filter(|f| {
                f.base.basename == basename && f.base.size == size && f.base.mod_time == mod_time
            })
            .cloned()
            .collect())
    }

    fn find_files_by_oshash(&self, oshash: &str) -> Result<Vec<File>, RepositoryError> {
        Ok(self
            .store
            .read()
            .files
            .iter()
            .filter(|f| f.base.fingerprints.oshash() == Some(oshash))
            .cloned()
            .collect())
    }

    fn find_files_in_folder(&self, folder: FolderId) -> Result<Vec<File>, RepositoryError> {
        Ok(self
            .store
            .read()
            .files
            .iter()
            .filter(|f| f.base.parent_folder_id == Some(folder))
            .cloned()
            .collect())
    }

    fn find_files_in_zip(&self, zip: FileId) -> Result<Vec<File>, RepositoryError> {
        Ok(self
            .store
            .read()
            .files
            .iter()
            .filter(|f| f.base.zip_file_id == Some(zip))
            .cloned()
            .collect())
    }

    fn count_files_in_folder(&self, folder: FolderId) -> Result<usize, RepositoryError> {
        Ok(self
            .store
            .read()
            .files
            .iter()
            .filter(|f| f.base.parent_folder_id == Some(folder))
            .count())
    }

    fn all_files(&self) -> Result<Vec<File>, RepositoryError> {
        Ok(self.store.read().files.clone())
    }

    fn create_file(&self, mut file: File) -> Result<File, RepositoryError> {
        let mut store = self.store.write();
        if store.file_paths.contains_key(&file.base.path) {
            return Err(RepositoryError::DuplicatePath(file.base.path));
        }
        file.base.id = FileId::new(next_id(store.files.len()));
        store.file_paths.insert(file.base.path.clone(), file.id());
        store.files.push(file.clone());
        drop(store);

        self.record_write();
        Ok(file)
    }

    fn update_file(&self, file: &File) -> Result<(), RepositoryError> {
        let id = file.id();
        let mut store = self.store.write();
        let idx = slot(id.as_u64())
            .filter(|idx| *idx < store.files.len())
            .ok_or(RepositoryError::FileNotFound(id))?;

        let old_path = store.files[idx].base.path.clone();
        if old_path != file.base.path {
            if store.file_paths.contains_key(&file.base.path) {
                return Err(RepositoryError::DuplicatePath(file.base.path.clone()));
            }
            store.file_paths.remove(&old_path);
            store.file_paths.insert(file.base.path.clone(), id);
        }
        store.files[idx] = file.clone();
        drop(store);

        self.record_write();
        Ok(())
    }

    fn touch_file(&self, id: FileId, seen_at: i64) -> Result<(), RepositoryError> {
        let mut store = self.store.write();
        let file = store.file_mut(id).ok_or(RepositoryError::FileNotFound(id))?;
        let was_missing = file.base.missing_since.take().is_some();
        store.seen.insert(id, seen_at);
        drop(store);

        if was_missing {
            debug!(id = %id, "File found again");
            self.record_write();
        }
        Ok(())
    }

    fn mark_missing(&self, roots: &[Utf8PathBuf], since: i64) -> Result<Vec<FileId>, RepositoryError> {
        let mut store = self.store.write();
        let Store { files, seen, .. } = &mut *store;
        let mut marked = Vec::new();
        for file in files.iter_mut() {
            if file.base.missing_since.is_some()
                || !roots.iter().any(|root| file.base.path.starts_with(root))
                || seen.get(&file.id()).is_some_and(|at| *at >= since)
            {
                continue;
            }
            file.base.missing_since = Some(since.div_euclid(1_000_000));
            marked.push(file.id());
        }
        drop(store);

        if !marked.is_empty() {
            debug!(files = marked.len(), "Marked files missing");
            self.writes.fetch_add(marked.len() as u64, Ordering::Relaxed);
        }
        Ok(marked)
    }

    fn find_folder_by_path(&self, path: &Utf8Path) -> Result<Option<Folder>, RepositoryError> {
        let store = self.store.read();
        Ok(store
            .folder_paths
            .get(path)
            .and_then(|id| store.folder(*id))
            .cloned())
    }

    fn find_folder(&self, id: FolderId) -> Result<Option<Folder>, RepositoryError> {
        Ok(self.store.read().folder(id).cloned())
    }

    fn find_subfolders(&self, parent: FolderId) -> Result<Vec<Folder>, RepositoryError> {
        Ok(self
            .store
            .read()
            .folders
            .iter()
            .filter(|f| f.parent_folder_id == Some(parent))
            .cloned()
            .collect())
    }

    fn create_folder(&self, mut folder: Folder) -> Result<Folder, RepositoryError> {
        let mut store = self.store.write();
        if store.folder_paths.contains_key(&folder.path) {
            return Err(RepositoryError::DuplicatePath(folder.path));
        }
        folder.id = FolderId::new(next_id(store.folders.len()));
        store.folder_paths.insert(folder.path.clone(), folder.id);
        store.folders.push(folder.clone());
        drop(store);

        self.record_write();
        Ok(folder)
    }

    fn update_folder(&self, folder: &Folder) -> Result<(), RepositoryError> {
        let id = folder.id;
        let mut store = self.store.write();
        let idx = slot(id.as_u64())
            .filter(|idx| *idx < store.folders.len())
            .ok_or(RepositoryError::FolderNotFound(id))?;

        let old_path = store.folders[idx].path.clone();
        if old_path != folder.path {
            if store.folder_paths.contains_key(&folder.path) {
                return Err(RepositoryError::DuplicatePath(folder.path.clone()));
            }
            store.folder_paths.remove(&old_path);
            store.folder_paths.insert(folder.path.clone(), id);
        }
        store.folders[idx] = folder.clone();
        drop(store);

        self.record_write();
        Ok(())
    }
}
