//! Filesystem abstraction used by the walker, filters, and fingerprinting.
//!
//! The scanner never touches `std::fs` directly. It goes through
//! [`FileSystem`], which has two implementations:
//!
//! - [`OsFs`]: the host filesystem
//! - [`ZipFs`]: the entries of a single zip archive, addressed as
//!   `<archive path>/<inner name>`
//!
//! Directory listings are always returned sorted by name so walks are
//! deterministic.
//!
//! # Examples
//!
//! ```no_run
//! use si_scanner::fs::{FileSystem, OsFs};
//! use camino::Utf8Path;
//!
//! let fs = OsFs;
//! for entry in fs.read_dir(Utf8Path::new("/media/videos"))? {
//!     println!("{} {}", entry.name, entry.size);
//! }
//! # Ok::<(), std::io::Error>(())
//! ```

use std::io::{self, Cursor, Read, Seek};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::NaiveDateTime;
use parking_lot::Mutex;
use tracing::warn;
use zip::ZipArchive;

/// A readable, seekable byte source.
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// Metadata for a single filesystem entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Final path component.
    pub name: String,
    /// Whether the entry is a directory.
    pub is_dir: bool,
    /// Whether the entry itself is a symbolic link (only set by `lstat`).
    pub is_symlink: bool,
    /// Size in bytes.
    pub size: u64,
    /// Modification time, truncated to whole seconds since the Unix epoch.
    pub mod_time: i64,
}

impl FileInfo {
    /// Creates metadata for a regular file.
    #[must_use]
    pub fn file(name: impl Into<String>, size: u64, mod_time: i64) -> Self {
        Self {
            name: name.into(),
            is_dir: false,
            is_symlink: false,
            size,
            mod_time,
        }
    }

    /// Creates metadata for a directory.
    #[must_use]
    pub fn dir(name: impl Into<String>, mod_time: i64) -> Self {
        Self {
            name: name.into(),
            is_dir: true,
            is_symlink: false,
            size: 0,
            mod_time,
        }
    }
}

/// The minimal filesystem surface the scanner depends on.
pub trait FileSystem: Send + Sync {
    /// Returns metadata for `path`, following symbolic links.
    fn stat(&self, path: &Utf8Path) -> io::Result<FileInfo>;

    /// Returns metadata for `path` without following a final symbolic link.
    fn lstat(&self, path: &Utf8Path) -> io::Result<FileInfo>;

    /// Lists the direct children of `path`, sorted by name.
    ///
    /// Entries carry `lstat` metadata.
    fn read_dir(&self, path: &Utf8Path) -> io::Result<Vec<FileInfo>>;

    /// Opens `path` for reading.
    fn open(&self, path: &Utf8Path) -> io::Result<Box<dyn ReadSeek>>;

    /// Resolves symbolic links and relative components.
    fn canonicalize(&self, path: &Utf8Path) -> io::Result<Utf8PathBuf>;

    /// Whether paths map directly onto the host filesystem, so a walk may
    /// bypass this trait and read directories itself.
    fn is_host(&self) -> bool {
        false
    }
}

impl<F: FileSystem + ?Sized> FileSystem for Arc<F> {
    fn stat(&self, path: &Utf8Path) -> io::Result<FileInfo> {
        (**self).stat(path)
    }

    fn lstat(&self, path: &Utf8Path) -> io::Result<FileInfo> {
        (**self).lstat(path)
    }

    fn read_dir(&self, path: &Utf8Path) -> io::Result<Vec<FileInfo>> {
        (**self).read_dir(path)
    }

    fn open(&self, path: &Utf8Path) -> io::Result<Box<dyn ReadSeek>> {
        (**self).open(path)
    }

    fn canonicalize(&self, path: &Utf8Path) -> io::Result<Utf8PathBuf> {
        (**self).canonicalize(path)
    }

    fn is_host(&self) -> bool {
        (**self).is_host()
    }
}

/// Deferred access to a file's content.
///
/// Fingerprinting and decorators receive an opener instead of a reader so
/// that nothing is opened when every value can be reused.
pub trait Opener: Send + Sync {
    /// Opens the underlying file.
    fn open(&self) -> io::Result<Box<dyn ReadSeek>>;
}

/// Opens a path through a [`FileSystem`].
pub struct FsOpener<'a> {
    fs: &'a dyn FileSystem,
    path: &'a Utf8Path,
}

impl<'a> FsOpener<'a> {
    /// Creates an opener for `path` on `fs`.
    #[must_use]
    pub fn new(fs: &'a dyn FileSystem, path: &'a Utf8Path) -> Self {
        Self { fs, path }
    }
}

impl Opener for FsOpener<'_> {
    fn open(&self) -> io::Result<Box<dyn ReadSeek>> {
        self.fs.open(self.path)
    }
}

/// The host filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsFs;

fn unix_seconds(time: io::Result<SystemTime>) -> i64 {
    let Ok(time) = time else {
        return 0;
    };
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
        Err(e) => -i64::try_from(e.duration().as_secs()).unwrap_or(i64::MAX),
    }
}

pub(crate) fn info_from_metadata(name: String, meta: &std::fs::Metadata) -> FileInfo {
    FileInfo {
        name,
        is_dir: meta.is_dir(),
        is_symlink: meta.file_type().is_symlink(),
        size: if meta.is_dir() { 0 } else { meta.len() },
        mod_time: unix_seconds(meta.modified()),
    }
}

fn entry_name(path: &Utf8Path) -> String {
    path.file_name().unwrap_or(path.as_str()).to_owned()
}

impl FileSystem for OsFs {
    fn stat(&self, path: &Utf8Path) -> io::Result<FileInfo> {
        let meta = std::fs::metadata(path)?;
        Ok(info_from_metadata(entry_name(path), &meta))
    }

    fn lstat(&self, path: &Utf8Path) -> io::Result<FileInfo> {
        let meta = std::fs::symlink_metadata(path)?;
        Ok(info_from_metadata(entry_name(path), &meta))
    }

    fn read_dir(&self, path: &Utf8Path) -> io::Result<Vec<FileInfo>> {
        let mut entries = Vec::new();
        for entry in path.read_dir_utf8()? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(dir = %path, error = %e, "Skipping unreadable directory entry");
                    continue;
                }
            };
            let meta = match entry.path().symlink_metadata() {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(path = %entry.path(), error = %e, "Skipping entry without metadata");
                    continue;
                }
            };
            entries.push(info_from_metadata(entry.file_name().to_owned(), &meta));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn open(&self, path: &Utf8Path) -> io::Result<Box<dyn ReadSeek>> {
        Ok(Box::new(std::fs::File::open(path)?))
    }

    fn canonicalize(&self, path: &Utf8Path) -> io::Result<Utf8PathBuf> {
        path.canonicalize_utf8()
    }

    fn is_host(&self) -> bool {
        true
    }
}

/// Largest archive member [`ZipFs`] will decompress.
pub const MAX_MEMBER_BYTES: u64 = 1 << 30;

/// Largest uncompressed to compressed size ratio accepted for a member.
///
/// Deflate tops out a little above 1000:1.
pub const MAX_COMPRESSION_RATIO: u64 = 1100;

/// One entry of a zip archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZipEntry {
    /// Inner name with forward slashes and no trailing separator.
    pub name: String,
    /// Uncompressed size in bytes, as declared by the archive.
    pub size: u64,
    /// Modification time recorded in the archive.
    pub mod_time: i64,
    /// Whether the entry is a directory.
    pub is_dir: bool,
    /// Position in the central directory.
    index: usize,
}

/// Read-only view of a zip archive's entries.
///
/// Paths handed to this filesystem are `<archive path>/<inner name>`. The
/// central directory is parsed once by [`ZipFs::open`] and the archive handle
/// is kept for member reads, which are serialized on it.
pub struct ZipFs {
    archive: Utf8PathBuf,
    entries: Vec<ZipEntry>,
    reader: Mutex<ZipArchive<Box<dyn ReadSeek>>>,
}

impl std::fmt::Debug for ZipFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZipFs")
            .field("archive", &self.archive)
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

fn zip_error(e: zip::result::ZipError) -> io::Error {
    match e {
        zip::result::ZipError::Io(e) => e,
        zip::result::ZipError::FileNotFound => io::Error::new(io::ErrorKind::NotFound, e),
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

/// Converts an MS-DOS timestamp to seconds since the Unix epoch, read as UTC.
fn zip_mod_time(dt: Option<zip::DateTime>) -> i64 {
    dt.and_then(|dt| NaiveDateTime::try_from(dt).ok())
        .map_or(0, |t| t.and_utc().timestamp())
}

/// Returns how many bytes a member may decompress to.
///
/// Members declaring more than [`MAX_MEMBER_BYTES`], or more than
/// [`MAX_COMPRESSION_RATIO`] times their compressed size, are rejected.
fn member_limit(name: &str, size: u64, compressed: u64) -> io::Result<u64> {
    let limit = MAX_MEMBER_BYTES.min(compressed.saturating_mul(MAX_COMPRESSION_RATIO));
    if size > limit {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("archive member {name} declares {size} bytes, limit is {limit}"),
        ));
    }
    Ok(size)
}

impl ZipFs {
    /// Reads the central directory of the archive at `archive`.
    pub fn open(outer: Arc<dyn FileSystem>, archive: &Utf8Path) -> io::Result<Self> {
        let reader = outer.open(archive)?;
        let mut zip = ZipArchive::new(reader).map_err(zip_error)?;

        let mut entries = Vec::with_capacity(zip.len());
        for index in 0..zip.len() {
            let entry = zip.by_index_raw(index).map_err(zip_error)?;
            let name = entry.name().trim_end_matches('/').to_owned();
            if name.is_empty() {
                continue;
            }
            entries.push(ZipEntry {
                name,
                size: entry.size(),
                mod_time: zip_mod_time(entry.last_modified()),
                is_dir: entry.is_dir(),
                index,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(Self {
            archive: archive.to_owned(),
            entries,
            reader: Mutex::new(zip),
        })
    }

    /// Returns the archive path.
    #[must_use]
    pub fn archive(&self) -> &Utf8Path {
        &self.archive
    }

    /// Returns all non-directory entries, sorted by name.
    pub fn files(&self) -> impl Iterator<Item = &ZipEntry> {
        self.entries.iter().filter(|e| !e.is_dir)
    }

    /// Returns the full path of an inner entry.
    #[must_use]
    pub fn entry_path(&self, entry: &ZipEntry) -> Utf8PathBuf {
        self.archive.join(&entry.name)
    }

    fn inner_name<'p>(&self, path: &'p Utf8Path) -> io::Result<&'p str> {
        path.strip_prefix(&self.archive)
            .map(Utf8Path::as_str)
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{path} is outside archive {}", self.archive),
                )
            })
    }

    fn find(&self, inner: &str) -> Option<&ZipEntry> {
        self.entries
            .binary_search_by(|e| e.name.as_str().cmp(inner))
            .ok()
            .map(|idx| &self.entries[idx])
    }

    fn is_implicit_dir(&self, inner: &str) -> bool {
        inner.is_empty()
            || self
                .entries
                .iter()
                .any(|e| e.name.starts_with(inner) && e.name[inner.len()..].starts_with('/'))
    }
}

impl FileSystem for ZipFs {
    fn stat(&self, path: &Utf8Path) -> io::Result<FileInfo> {
        let inner = self.inner_name(path)?;
        if let Some(entry) = self.find(inner) {
            let name = entry_name(path);
            return Ok(if entry.is_dir {
                FileInfo::dir(name, entry.mod_time)
            } else {
                FileInfo::file(name, entry.size, entry.mod_time)
            });
        }
        if self.is_implicit_dir(inner) {
            return Ok(FileInfo::dir(entry_name(path), 0));
        }
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{path} not found in archive"),
        ))
    }

    fn lstat(&self, path: &Utf8Path) -> io::Result<FileInfo> {
        self.stat(path)
    }

    fn read_dir(&self, path: &Utf8Path) -> io::Result<Vec<FileInfo>> {
        let inner = self.inner_name(path)?;
        let prefix = if inner.is_empty() {
            String::new()
        } else {
            format!("{inner}/")
        };

        let mut children: Vec<FileInfo> = Vec::new();
        for entry in &self.entries {
            let Some(rest) = entry.name.strip_prefix(&prefix) else {
                continue;
            };
            match rest.split_once('/') {
                None if !rest.is_empty() => {
                    if children.iter().any(|c| c.name == rest) {
                        continue;
                    }
                    children.push(if entry.is_dir {
                        FileInfo::dir(rest, entry.mod_time)
                    } else {
                        FileInfo::file(rest, entry.size, entry.mod_time)
                    });
                }
                Some((dir, _)) => {
                    if !children.iter().any(|c| c.name == dir) {
                        children.push(FileInfo::dir(dir, 0));
                    }
                }
                None => {}
            }
        }
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    fn open(&self, path: &Utf8Path) -> io::Result<Box<dyn ReadSeek>> {
        let inner = self.inner_name(path)?;
        let entry = self.find(inner).filter(|e| !e.is_dir).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("{path} not found in archive"))
        })?;

        let mut zip = self.reader.lock();
        let member = zip.by_index(entry.index).map_err(zip_error)?;
        let limit = member_limit(&entry.name, member.size(), member.compressed_size())?;

        let mut buf = Vec::new();
        member.take(limit.saturating_add(1)).read_to_end(&mut buf)?;
        if buf.len() as u64 > limit {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("archive member {} is larger than declared", entry.name),
            ));
        }
        Ok(Box::new(Cursor::new(buf)))
    }

    fn canonicalize(&self, path: &Utf8Path) -> io::Result<Utf8PathBuf> {
        self.stat(path)?;
        Ok(path.to_owned())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    pub(crate) fn utf8(dir: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().canonicalize().unwrap()).unwrap()
    }

    pub(crate) fn write_zip(path: &Utf8Path, entries: &[(&str, &[u8])]) {
        let file = std::fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        for (name, data) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_os_read_dir_is_sorted() {
        let dir = TempDir::new().unwrap();
        let root = utf8(&dir);
        for name in ["c.mp4", "a.mp4", "b.mp4"] {
            std::fs::write(root.join(name), b"x").unwrap();
        }
        std::fs::create_dir(root.join("d")).unwrap();

        let names: Vec<_> = OsFs
            .read_dir(&root)
            .unwrap()
            .into_iter()
            .map(|e| (e.name, e.is_dir))
            .collect();
        assert_eq!(
            names,
            vec![
                ("a.mp4".to_owned(), false),
                ("b.mp4".to_owned(), false),
                ("c.mp4".to_owned(), false),
                ("d".to_owned(), true),
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_stat_follows_symlinks_lstat_does_not() {
        let dir = TempDir::new().unwrap();
        let root = utf8(&dir);
        std::fs::write(root.join("target.mp4"), b"0123456789").unwrap();
        std::os::unix::fs::symlink(root.join("target.mp4"), root.join("link.mp4")).unwrap();

        let stat = OsFs.stat(&root.join("link.mp4")).unwrap();
        assert_eq!(stat.size, 10);
        assert!(!stat.is_symlink);

        let lstat = OsFs.lstat(&root.join("link.mp4")).unwrap();
        assert!(lstat.is_symlink);
    }

    #[test]
    fn test_zip_mod_time_is_utc_seconds() {
        let dir = TempDir::new().unwrap();
        let archive = utf8(&dir).join("dated.zip");
        let stamp = zip::DateTime::from_date_and_time(2024, 5, 17, 12, 30, 10).unwrap();
        let mut writer = zip::ZipWriter::new(std::fs::File::create(&archive).unwrap());
        let options = zip::write::SimpleFileOptions::default().last_modified_time(stamp);
        writer.start_file("a.png", options).unwrap();
        writer.write_all(b"aa").unwrap();
        writer.finish().unwrap();

        let zip = ZipFs::open(Arc::new(OsFs), &archive).unwrap();
        assert_eq!(zip.stat(&archive.join("a.png")).unwrap().mod_time, 1_715_949_010);
        assert_eq!(zip_mod_time(None), 0);
    }

    /// Rewrites the uncompressed size of every central directory record.
    fn patch_declared_size(path: &Utf8Path, size: u32) {
        let mut bytes = std::fs::read(path).unwrap();
        let signature = [0x50, 0x4b, 0x01, 0x02];
        let offsets: Vec<usize> = bytes
            .windows(4)
            .enumerate()
            .filter(|(_, w)| *w == signature)
            .map(|(i, _)| i)
            .collect();
        assert!(!offsets.is_empty());
        for at in offsets {
            bytes[at + 24..at + 28].copy_from_slice(&size.to_le_bytes());
        }
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_oversized_member_is_rejected_without_allocating() {
        let dir = TempDir::new().unwrap();
        let archive = utf8(&dir).join("bomb.zip");
        let mut writer = zip::ZipWriter::new(std::fs::File::create(&archive).unwrap());
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        writer.start_file("a.png", options).unwrap();
        writer.write_all(b"tiny").unwrap();
        writer.finish().unwrap();
        patch_declared_size(&archive, 0xF000_0000);

        let zip = ZipFs::open(Arc::new(OsFs), &archive).unwrap();
        let inner = archive.join("a.png");
        assert_eq!(zip.stat(&inner).unwrap().size, 0xF000_0000);

        let err = zip.open(&inner).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_member_limit() {
        assert_eq!(member_limit("a", 10, 10).unwrap(), 10);
        assert_eq!(member_limit("a", 0, 0).unwrap(), 0);
        assert!(member_limit("a", MAX_MEMBER_BYTES + 1, MAX_MEMBER_BYTES).is_err());
        assert!(member_limit("a", 2_000_000, 100).is_err());
        assert_eq!(member_limit("a", 100_000, 100).unwrap(), 100_000);
    }

    #[test]
    fn test_zip_fs_lists_and_reads_entries() {
        let dir = TempDir::new().unwrap();
        let root = utf8(&dir);
        let archive = root.join("gallery.zip");
        write_zip(
            &archive,
            &[
                ("b.png", b"bbbb"),
                ("a.png", b"aa"),
                ("nested/c.jpg", b"cccccc"),
            ],
        );

        let zip = ZipFs::open(Arc::new(OsFs), &archive).unwrap();
        let names: Vec<_> = zip.files().map(|e| e.name.clone()).collect();
        assert_eq!(names, vec!["a.png", "b.png", "nested/c.jpg"]);

        let top: Vec<_> = zip
            .read_dir(&archive)
            .unwrap()
            .into_iter()
            .map(|e| (e.name, e.is_dir))
            .collect();
        assert_eq!(
            top,
            vec![
                ("a.png".to_owned(), false),
                ("b.png".to_owned(), false),
                ("nested".to_owned(), true),
            ]
        );

        let inner = archive.join("nested/c.jpg");
        assert_eq!(zip.stat(&inner).unwrap().size, 6);
        let mut content = Vec::new();
        zip.open(&inner).unwrap().read_to_end(&mut content).unwrap();
        assert_eq!(content, b"cccccc");

        assert!(zip.stat(&archive.join("missing.png")).is_err());
    }

    /// Counts how often the archive itself is opened.
    struct OpenCounter(std::sync::atomic::AtomicUsize);

    impl FileSystem for OpenCounter {
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
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            OsFs.open(path)
        }
        fn canonicalize(&self, path: &Utf8Path) -> io::Result<Utf8PathBuf> {
            OsFs.canonicalize(path)
        }
    }

    #[test]
    fn test_members_are_read_from_the_parsed_archive() {
        let dir = TempDir::new().unwrap();
        let archive = utf8(&dir).join("gallery.zip");
        write_zip(&archive, &[("a.png", b"aa"), ("b.png", b"bbbb")]);

        let outer = Arc::new(OpenCounter(std::sync::atomic::AtomicUsize::new(0)));
        let zip = ZipFs::open(Arc::clone(&outer) as Arc<dyn FileSystem>, &archive).unwrap();
        for (name, expected) in [("a.png", &b"aa"[..]), ("b.png", b"bbbb"), ("a.png", b"aa")] {
            let mut content = Vec::new();
            zip.open(&archive.join(name)).unwrap().read_to_end(&mut content).unwrap();
            assert_eq!(content, expected);
        }
        assert_eq!(outer.0.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
