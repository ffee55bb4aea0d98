//! File records discovered by the scanner.
//!
//! A [`File`] is a tagged variant: every file carries the same [`BaseFile`]
//! attributes, plus optional per-kind [`FileDetails`] filled in by decorators.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use super::fingerprint::Fingerprints;
use super::folder::FolderId;

/// An opaque identifier for a stored file.
///
/// Identifiers are assigned by the repository on creation and never reused.
/// The zero value means "not yet persisted".
///
/// # Examples
///
/// ```
/// use si_core::FileId;
///
/// let id = FileId::new(42);
/// assert_eq!(id.as_u64(), 42);
/// assert!(!id.is_unset());
/// assert!(FileId::default().is_unset());
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileId(pub u64);

impl FileId {
    /// Creates a new file ID from a u64 value.
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

impl From<u64> for FileId {
    #[inline]
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Attributes shared by every file kind.
///
/// `path` is the file's identity. For entries inside a zip archive it is the
/// archive path joined with the inner entry name, and `zip_file_id` points at
/// the archive's own record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseFile {
    /// Repository identifier.
    pub id: FileId,

    /// Absolute path.
    pub path: Utf8PathBuf,

    /// Final path component.
    pub basename: String,

    /// Containing folder, `None` for zip entries.
    pub parent_folder_id: Option<FolderId>,

    /// Containing zip archive, if any.
    pub zip_file_id: Option<FileId>,

    /// Size in bytes, following symlinks.
    pub size: u64,

    /// Modification time in whole seconds since the Unix epoch.
    pub mod_time: i64,

    /// Content fingerprints, one per kind.
    #[serde(default)]
    pub fingerprints: Fingerprints,

    /// When the fingerprints were last computed, in seconds since the Unix epoch.
    #[serde(default)]
    pub fingerprinted_at: Option<i64>,

    /// When a completed scan of the file's library first failed to find it,
    /// in seconds since the Unix epoch. Cleared once it is seen again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_since: Option<i64>,
}

impl BaseFile {
    /// Creates an unpersisted file record for `path`.
    #[must_use]
    pub fn new(path: impl Into<Utf8PathBuf>, size: u64, mod_time: i64) -> Self {
        let path = path.into();
        let basename = path.file_name().unwrap_or(path.as_str()).to_owned();
        Self {
            id: FileId::default(),
            path,
            basename,
            parent_folder_id: None,
            zip_file_id: None,
            size,
            mod_time,
            fingerprints: Fingerprints::new(),
            fingerprinted_at: None,
            missing_since: None,
        }
    }

    /// Moves the record to `path`, keeping the basename in sync.
    pub fn set_path(&mut self, path: impl Into<Utf8PathBuf>) {
        self.path = path.into();
        self.basename = self
            .path
            .file_name()
            .unwrap_or(self.path.as_str())
            .to_owned();
    }
}

/// Video stream properties.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoDetails {
    /// Duration in seconds.
    pub duration: f64,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Video codec name, when known.
    pub codec: Option<String>,
}

/// Image properties.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDetails {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Container format name, e.g. `png`.
    pub format: Option<String>,
}

/// Per-kind file details.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FileDetails {
    /// No kind-specific data.
    #[default]
    Base,
    /// A video file.
    Video(VideoDetails),
    /// An image file.
    Image(ImageDetails),
}

/// A stored file.
///
/// # Examples
///
/// ```
/// use si_core::{BaseFile, File, FileDetails, ImageDetails};
///
/// let mut file = File::new(BaseFile::new("/media/a.png", 10, 1_700_000_000));
/// assert_eq!(file.base.basename, "a.png");
/// file.details = FileDetails::Image(ImageDetails { width: 4, height: 3, format: None });
/// assert!(file.is_image());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct File {
    /// Shared attributes.
    #[serde(flatten)]
    pub base: BaseFile,

    /// Kind-specific attributes.
    #[serde(default)]
    pub details: FileDetails,
}

impl File {
    /// Wraps a base record with no kind-specific details.
    #[inline]
    #[must_use]
    pub fn new(base: BaseFile) -> Self {
        Self {
            base,
            details: FileDetails::Base,
        }
    }

    /// Returns the file ID.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> FileId {
        self.base.id
    }

    /// Returns the file path.
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.base.path
    }

    /// Returns `true` for video files.
    #[inline]
    #[must_use]
    pub const fn is_video(&self) -> bool {
        matches!(self.details, FileDetails::Video(_))
    }

    /// Returns `true` for image files.
    #[inline]
    #[must_use]
    pub const fn is_image(&self) -> bool {
        matches!(self.details, FileDetails::Image(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Fingerprint;

    #[test]
    fn test_base_file_basename() {
        let file = BaseFile::new("/library/sub/clip.mp4", 100, 5);
        assert_eq!(file.basename, "clip.mp4");
        assert!(file.id.is_unset());
    }

    #[test]
    fn test_set_path_updates_basename() {
        let mut file = BaseFile::new("/library/a.mp4", 1, 1);
        file.set_path("/library/moved/b.mp4");
        assert_eq!(file.basename, "b.mp4");
        assert_eq!(file.path, "/library/moved/b.mp4");
    }

    #[test]
    fn test_file_json_round_trip_keeps_details() {
        let mut base = BaseFile::new("/library/a.mp4", 1024, 1_700_000_000);
        base.id = FileId::new(3);
        base.fingerprints.set(Fingerprint::Oshash("0011223344556677".to_owned()));
        let file = File {
            base,
            details: FileDetails::Video(VideoDetails {
                duration: 12.5,
                width: 1920,
                height: 1080,
                codec: Some("h264".to_owned()),
            }),
        };

        let json = serde_json::to_string(&file).unwrap();
        let parsed: File = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, file);
        assert!(parsed.is_video());
    }
}
