//! Folder records.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use super::file::FileId;

/// An opaque identifier for a stored folder.
///
/// The zero value means "not yet persisted".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FolderId(pub u64);

impl FolderId {
    /// Creates a new folder ID from a u64 value.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the inner u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns `true` if this ID has not been assigned by a repository.
    #[inline]
    #[must_use]
    pub const fn is_unset(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for FolderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A directory in a library tree.
///
/// Every folder except a library root has exactly one parent. Folders inside
/// zip archives are not materialised; zip entries point at the archive file.
///
/// # Examples
///
/// ```
/// use si_core::Folder;
///
/// let folder = Folder::new("/media/videos/2024", 1_700_000_000);
/// assert!(folder.parent_folder_id.is_none());
/// assert!(folder.id.is_unset());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    /// Repository identifier.
    pub id: FolderId,

    /// Absolute path.
    pub path: Utf8PathBuf,

    /// Parent folder, `None` for library roots.
    pub parent_folder_id: Option<FolderId>,

    /// Containing zip archive, if any.
    pub zip_file_id: Option<FileId>,

    /// Modification time in whole seconds since the Unix epoch.
    pub mod_time: i64,
}

impl Folder {
    /// Creates an unpersisted folder record.
    #[must_use]
    pub fn new(path: impl Into<Utf8PathBuf>, mod_time: i64) -> Self {
        Self {
            id: FolderId::default(),
            path: path.into(),
            parent_folder_id: None,
            zip_file_id: None,
            mod_time,
        }
    }

    /// Returns the folder path.
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}
