//! Folder rename detection.
//!
//! When the walk reaches a directory with no folder record, its direct files
//! are matched against known files by `(basename, size, mtime)`. Each match
//! votes for the folder that file was recorded in. A voted folder whose old
//! path still exists on disk is rejected for the pass, since it was copied
//! rather than moved.
//!
//! A folder qualifies when its votes reach `ratio` of the files recorded in
//! it. The qualifying folder with the most votes wins; a tie means no
//! decision. The winner is then re-pathed, together with its files and
//! subfolders, instead of creating fresh records.

use camino::{Utf8Path, Utf8PathBuf};
use si_core::{File, FileId, Folder, FolderId, FxHashMap, FxHashSet, fx_hash_map, fx_hash_set};
use tracing::{debug, info};

use crate::error::ScanError;
use crate::filter::PathFilter;
use crate::fs::{FileInfo, FileSystem};
use crate::lock::{RELEASE_TIMEOUT, ReadLockManager};
use crate::repository::{Repository, RepositoryError};

/// A known folder that may have moved to a new path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameCandidate {
    /// The folder record at its old path.
    pub folder: Folder,
    /// Files recorded directly in the folder.
    pub files_in_old_folder: usize,
    /// Of those, files found in the new directory.
    pub files_found: usize,
}

/// Records re-pathed by a relocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Relocation {
    /// Folders re-pathed, including the relocated folder itself.
    pub folders: u64,
    /// Files re-pathed, including zip entries.
    pub files: Vec<FileId>,
}

/// Detects and applies folder renames.
pub struct FolderRenameDetector<'a> {
    fs: &'a dyn FileSystem,
    repo: &'a dyn Repository,
    ratio: f64,
    locks: Option<&'a ReadLockManager>,
}

impl std::fmt::Debug for FolderRenameDetector<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FolderRenameDetector")
            .field("ratio", &self.ratio)
            .finish_non_exhaustive()
    }
}

impl<'a> FolderRenameDetector<'a> {
    /// Creates a detector requiring `ratio` of a folder's files to match.
    #[must_use]
    pub fn new(fs: &'a dyn FileSystem, repo: &'a dyn Repository, ratio: f64) -> Self {
        Self {
            fs,
            repo,
            ratio,
            locks: None,
        }
    }

    /// Cancels and waits for readers of each file before re-pathing it.
    #[must_use]
    pub const fn with_read_locks(mut self, locks: &'a ReadLockManager) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Finds the folder that `new_dir` was most likely renamed from.
    ///
    /// Only files accepted by `filter` vote.
    ///
    /// # Errors
    ///
    /// Returns [`ScanError::Walk`] if `new_dir` can't be listed, or
    /// [`ScanError::Repository`] if a lookup fails.
    pub fn detect(
        &self,
        new_dir: &Utf8Path,
        filter: &dyn PathFilter,
    ) -> Result<Option<RenameCandidate>, ScanError> {
        let entries = self
            .fs
            .read_dir(new_dir)
            .map_err(|e| ScanError::walk(new_dir, e))?;

        let mut votes: FxHashMap<FolderId, usize> = fx_hash_map();
        let mut rejected: FxHashSet<FolderId> = fx_hash_set();

        for entry in entries {
            let path = new_dir.join(&entry.name);
            let Some(info) = self.follow(&path, entry) else {
                continue;
            };
            if info.is_dir || !filter.accept(&path, &info) {
                continue;
            }

            for known in self
                .repo
                .find_files_by_info(&info.name, info.size, info.mod_time)?
            {
                if known.base.zip_file_id.is_some() {
                    continue;
                }
                let Some(folder_id) = known.base.parent_folder_id else {
                    continue;
                };
                if rejected.contains(&folder_id) {
                    continue;
                }
                if let Some(n) = votes.get_mut(&folder_id) {
                    *n += 1;
                    continue;
                }
                let Some(folder) = self.repo.find_folder(folder_id)? else {
                    continue;
                };
                if folder.zip_file_id.is_some() || self.fs.lstat(&folder.path).is_ok() {
                    debug!(old = %folder.path, new = %new_dir, "Old folder still exists, not a rename");
                    rejected.insert(folder_id);
                    continue;
                }
                votes.insert(folder_id, 1);
            }
        }

        self.pick(new_dir, votes)
    }

    fn follow(&self, path: &Utf8Path, entry: FileInfo) -> Option<FileInfo> {
        if !entry.is_symlink {
            return Some(entry);
        }
        self.fs.stat(path).ok().map(|target| FileInfo {
            name: entry.name,
            ..target
        })
    }

    fn pick(
        &self,
        new_dir: &Utf8Path,
        votes: FxHashMap<FolderId, usize>,
    ) -> Result<Option<RenameCandidate>, ScanError> {
        let mut votes: Vec<(FolderId, usize)> = votes.into_iter().collect();
        votes.sort_unstable();

        let mut best: Option<(FolderId, usize, usize)> = None;
        let mut tied = false;
        for (folder_id, found) in votes {
            let count = self.repo.count_files_in_folder(folder_id)?;
            #[allow(clippy::cast_precision_loss)] // file counts stay far below 2^52
            let qualifies = count > 0 && found as f64 >= count as f64 * self.ratio;
            if !qualifies {
                debug!(folder = %folder_id, found, count, "Rename candidate below threshold");
                continue;
            }
            match best {
                Some((_, top, _)) if found < top => {}
                Some((_, top, _)) if found == top => tied = true,
                _ => {
                    best = Some((folder_id, found, count));
                    tied = false;
                }
            }
        }

        let Some((folder_id, files_found, files_in_old_folder)) = best else {
            return Ok(None);
        };
        if tied {
            debug!(new = %new_dir, files_found, "Ambiguous rename candidates, ignoring");
            return Ok(None);
        }
        let Some(folder) = self.repo.find_folder(folder_id)? else {
            return Ok(None);
        };
        Ok(Some(RenameCandidate {
            folder,
            files_in_old_folder,
            files_found,
        }))
    }

    /// Re-paths `folder` to `new_path`, along with its files and subfolders.
    ///
    /// Ids are preserved. `new_parent` becomes the folder's parent.
    ///
    /// # Errors
    ///
    /// Returns [`ScanError::Repository`] if an update fails.
    pub fn relocate(
        &self,
        folder: &Folder,
        new_path: &Utf8Path,
        new_parent: Option<FolderId>,
    ) -> Result<Relocation, ScanError> {
        info!(old = %folder.path, new = %new_path, "Folder moved, updating paths");
        let mut summary = Relocation::default();
        self.relocate_tree(folder, new_path.to_owned(), new_parent, &mut summary)?;
        Ok(summary)
    }

    fn relocate_tree(
        &self,
        folder: &Folder,
        new_path: Utf8PathBuf,
        new_parent: Option<FolderId>,
        summary: &mut Relocation,
    ) -> Result<(), ScanError> {
        let mut moved = folder.clone();
        moved.path = new_path;
        moved.parent_folder_id = new_parent;
        self.repo.update_folder(&moved)?;
        summary.folders += 1;

        for file in self.repo.find_files_in_folder(folder.id)? {
            let target = moved.path.join(&file.base.basename);
            self.repath_file(file, target, summary)?;
        }

        for sub in self.repo.find_subfolders(folder.id)? {
            let Some(name) = sub.path.file_name() else {
                continue;
            };
            let target = moved.path.join(name);
            self.relocate_tree(&sub, target, Some(moved.id), summary)?;
        }
        Ok(())
    }

    fn repath_file(
        &self,
        mut file: File,
        target: Utf8PathBuf,
        summary: &mut Relocation,
    ) -> Result<(), ScanError> {
        let old = file.base.path.clone();
        let id: FileId = file.id();
        if let Some(locks) = self.locks {
            locks.evict(&old, RELEASE_TIMEOUT);
        }
        file.base.set_path(target);
        self.repo.update_file(&file)?;
        summary.files.push(id);
        summary
            .files
            .extend(repath_zip_entries(self.repo, id, &old, &file.base.path)?);
        Ok(())
    }
}

/// Re-paths the members of archive `zip` from under `old` to under `new`.
///
/// Returns the ids of the updated members.
pub(crate) fn repath_zip_entries(
    repo: &dyn Repository,
    zip: FileId,
    old: &Utf8Path,
    new: &Utf8Path,
) -> Result<Vec<FileId>, RepositoryError> {
    let mut moved = Vec::new();
    for mut entry in repo.find_files_in_zip(zip)? {
        let Ok(inner) = entry.base.path.strip_prefix(old) else {
            continue;
        };
        let target = new.join(inner);
        entry.base.set_path(target);
        repo.update_file(&entry)?;
        moved.push(entry.id());
    }
    Ok(moved)
}
