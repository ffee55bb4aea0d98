//! Path filters deciding which entries participate in a scan.
//!
//! A [`PathFilter`] is a predicate over a path and its metadata. Filters are
//! composed with [`FilterChain`], which accepts an entry only if **every**
//! filter accepts it. Rejecting a directory prunes its whole subtree.
//!
//! # Examples
//!
//! ```
//! use si_scanner::filter::{ExtensionFilter, FilterChain, PathFilter, RegexExcludeFilter};
//! use si_scanner::fs::FileInfo;
//! use camino::Utf8Path;
//!
//! let chain = FilterChain::new()
//!     .and(ExtensionFilter::new(["mp4", "mkv"]))
//!     .and(RegexExcludeFilter::new(["/samples/"]));
//!
//! let info = FileInfo::file("a.MP4", 10, 0);
//! assert!(chain.accept(Utf8Path::new("/media/a.MP4"), &info));
//! assert!(!chain.accept(Utf8Path::new("/media/samples/a.mp4"), &info));
//! ```

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use si_core::{LibraryConfig, ScanConfig};
use smallvec::SmallVec;
use tracing::{trace, warn};

use crate::fs::FileInfo;

/// Decides whether a filesystem entry participates in a scan.
///
/// Filters are shared across the parallel stages of a scan, so they must be
/// [`Send`] and [`Sync`].
pub trait PathFilter: Send + Sync {
    /// Returns `true` if the entry should be scanned.
    fn accept(&self, path: &Utf8Path, info: &FileInfo) -> bool;
}

impl<F: PathFilter + ?Sized> PathFilter for Box<F> {
    fn accept(&self, path: &Utf8Path, info: &FileInfo) -> bool {
        (**self).accept(path, info)
    }
}

impl<F: PathFilter + ?Sized> PathFilter for Arc<F> {
    fn accept(&self, path: &Utf8Path, info: &FileInfo) -> bool {
        (**self).accept(path, info)
    }
}

/// Combines filters with AND logic.
///
/// An empty chain accepts everything.
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn PathFilter>>,
}

impl std::fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterChain")
            .field("filters", &self.filters.len())
            .finish()
    }
}

impl FilterChain {
    /// Creates an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a filter.
    #[must_use]
    pub fn and<F: PathFilter + 'static>(mut self, filter: F) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    /// Appends an already shared filter.
    pub fn push(&mut self, filter: Arc<dyn PathFilter>) {
        self.filters.push(filter);
    }

    /// Appends every filter of `other`.
    pub fn extend(&mut self, other: &Self) {
        self.filters.extend(other.filters.iter().map(Arc::clone));
    }

    /// Number of filters in the chain.
    #[must_use]
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Returns `true` if the chain has no filters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl PathFilter for FilterChain {
    fn accept(&self, path: &Utf8Path, info: &FileInfo) -> bool {
        self.filters.iter().all(|f| f.accept(path, info))
    }
}

/// Accepts files whose extension is in a set, compared case-insensitively.
///
/// Directories are always accepted.
#[derive(Debug, Clone)]
pub struct ExtensionFilter {
    extensions: SmallVec<[String; 16]>,
}

impl ExtensionFilter {
    /// Creates a filter from extensions given without the leading dot.
    #[must_use]
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            extensions: extensions
                .into_iter()
                .map(|e| e.as_ref().trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    /// Returns `true` if `path` carries one of the extensions.
    #[must_use]
    pub fn matches(&self, path: &Utf8Path) -> bool {
        path.extension().is_some_and(|ext| {
            self.extensions
                .iter()
                .any(|e| e.eq_ignore_ascii_case(ext))
        })
    }
}

impl PathFilter for ExtensionFilter {
    fn accept(&self, path: &Utf8Path, info: &FileInfo) -> bool {
        info.is_dir || self.matches(path)
    }
}

/// Compiles exclude patterns, case-insensitive unless the pattern opts out.
///
/// Patterns beginning with `(?-i)` are left case-sensitive; all others get a
/// `(?i)` prefix. Invalid patterns are logged and skipped.
fn compile_excludes<I, S>(patterns: I) -> Vec<Regex>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    patterns
        .into_iter()
        .filter_map(|p| {
            let p = p.as_ref();
            let source = if p.starts_with("(?-i)") {
                p.to_owned()
            } else {
                format!("(?i){p}")
            };
            match Regex::new(&source) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern = p, error = %e, "Skipping invalid exclude pattern");
                    None
                }
            }
        })
        .collect()
}

/// Path tested against exclude patterns; directories get a trailing separator.
fn exclude_subject(path: &Utf8Path, is_dir: bool) -> String {
    if is_dir {
        format!("{path}/")
    } else {
        path.as_str().to_owned()
    }
}

/// Rejects entries whose path matches any exclude regex.
#[derive(Debug, Clone, Default)]
pub struct RegexExcludeFilter {
    patterns: Vec<Regex>,
}

impl RegexExcludeFilter {
    /// Compiles the given patterns, skipping invalid ones.
    #[must_use]
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: compile_excludes(patterns),
        }
    }

    /// Number of patterns that compiled.
    #[must_use]
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Returns `true` if no pattern compiled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Returns `true` if `subject` matches any pattern.
    #[must_use]
    pub fn matches(&self, subject: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(subject))
    }
}

impl PathFilter for RegexExcludeFilter {
    fn accept(&self, path: &Utf8Path, info: &FileInfo) -> bool {
        !self.matches(&exclude_subject(path, info.is_dir))
    }
}

/// The broad media category of a file, decided by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    /// A video file.
    Video,
    /// A standalone image file.
    Image,
    /// A zip archive of images.
    Gallery,
}

/// Maps file extensions to [`MediaKind`].
#[derive(Debug, Clone)]
pub struct MediaClassifier {
    video: ExtensionFilter,
    image: ExtensionFilter,
    gallery: ExtensionFilter,
}

impl MediaClassifier {
    /// Builds a classifier from the configured extension lists.
    #[must_use]
    pub fn new(config: &ScanConfig) -> Self {
        Self {
            video: ExtensionFilter::new(&config.video_extensions),
            image: ExtensionFilter::new(&config.image_extensions),
            gallery: ExtensionFilter::new(&config.gallery_extensions),
        }
    }

    /// Classifies `path`, or returns `None` for non-media files.
    #[must_use]
    pub fn classify(&self, path: &Utf8Path) -> Option<MediaKind> {
        if self.video.matches(path) {
            Some(MediaKind::Video)
        } else if self.image.matches(path) {
            Some(MediaKind::Image)
        } else if self.gallery.matches(path) {
            Some(MediaKind::Gallery)
        } else {
            None
        }
    }
}

/// The per-library filter applied to every walked entry.
///
/// - Anything under the generated-artifact directory is rejected.
/// - A directory is rejected only when it is excluded for both videos and
///   images, either by library flags or by the exclude patterns.
/// - A file must be a media file whose kind the library contributes and that
///   no exclude pattern for its kind matches.
#[derive(Debug, Clone)]
pub struct LibraryFilter {
    classifier: MediaClassifier,
    exclude_video: RegexExcludeFilter,
    exclude_image: RegexExcludeFilter,
    library_excludes_video: bool,
    library_excludes_image: bool,
    generated_path: Option<Utf8PathBuf>,
}

impl LibraryFilter {
    /// Builds the filter for one library root.
    #[must_use]
    pub fn new(config: &ScanConfig, library: &LibraryConfig) -> Self {
        Self {
            classifier: MediaClassifier::new(config),
            exclude_video: RegexExcludeFilter::new(&config.exclude_video_patterns),
            exclude_image: RegexExcludeFilter::new(&config.exclude_image_patterns),
            library_excludes_video: library.exclude_video,
            library_excludes_image: library.exclude_image,
            generated_path: config.generated_path.clone(),
        }
    }

    fn in_generated(&self, path: &Utf8Path) -> bool {
        self.generated_path
            .as_deref()
            .is_some_and(|generated| path.starts_with(generated))
    }
}

impl PathFilter for LibraryFilter {
    fn accept(&self, path: &Utf8Path, info: &FileInfo) -> bool {
        if self.in_generated(path) {
            trace!(path = %path, "Rejecting generated path");
            return false;
        }

        let subject = exclude_subject(path, info.is_dir);
        let video_excluded = self.library_excludes_video || self.exclude_video.matches(&subject);
        let image_excluded = self.library_excludes_image || self.exclude_image.matches(&subject);

        if info.is_dir {
            return !(video_excluded && image_excluded);
        }

        match self.classifier.classify(path) {
            Some(MediaKind::Video) => !video_excluded,
            Some(MediaKind::Image | MediaKind::Gallery) => !image_excluded,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str) -> FileInfo {
        FileInfo::file(name, 1, 0)
    }

    fn dir(name: &str) -> FileInfo {
        FileInfo::dir(name, 0)
    }

    #[test]
    fn test_chain_requires_all_filters() {
        struct RejectNamed(&'static str);
        impl PathFilter for RejectNamed {
            fn accept(&self, path: &Utf8Path, _info: &FileInfo) -> bool {
                path.file_name() != Some(self.0)
            }
        }

        let chain = FilterChain::new()
            .and(ExtensionFilter::new(["mp4"]))
            .and(RejectNamed("skip.mp4"));

        assert!(chain.accept(Utf8Path::new("/l/keep.mp4"), &file("keep.mp4")));
        assert!(!chain.accept(Utf8Path::new("/l/skip.mp4"), &file("skip.mp4")));
        assert!(!chain.accept(Utf8Path::new("/l/keep.txt"), &file("keep.txt")));
        assert!(FilterChain::new().accept(Utf8Path::new("/x"), &file("x")));
    }

    #[test]
    fn test_extension_filter_case_insensitive_and_accepts_dirs() {
        let filter = ExtensionFilter::new([".MP4", "mkv"]);
        assert!(filter.accept(Utf8Path::new("/l/a.mp4"), &file("a.mp4")));
        assert!(filter.accept(Utf8Path::new("/l/a.Mkv"), &file("a.Mkv")));
        assert!(!filter.accept(Utf8Path::new("/l/a.avi"), &file("a.avi")));
        assert!(filter.accept(Utf8Path::new("/l/folder.avi"), &dir("folder.avi")));
    }

    #[test]
    fn test_regex_exclude_case_handling() {
        let filter = RegexExcludeFilter::new(["sample", "(?-i)Trailer"]);
        assert!(!filter.accept(Utf8Path::new("/l/SAMPLE.mp4"), &file("SAMPLE.mp4")));
        assert!(!filter.accept(Utf8Path::new("/l/Trailer.mp4"), &file("Trailer.mp4")));
        assert!(filter.accept(Utf8Path::new("/l/trailer.mp4"), &file("trailer.mp4")));
    }

    #[test]
    fn test_regex_exclude_skips_invalid_patterns() {
        let filter = RegexExcludeFilter::new(["(unclosed", "valid"]);
        assert_eq!(filter.len(), 1);
        assert!(!filter.accept(Utf8Path::new("/l/valid.mp4"), &file("valid.mp4")));
    }

    #[test]
    fn test_regex_exclude_matches_directories_with_trailing_slash() {
        let filter = RegexExcludeFilter::new(["/extras/$"]);
        assert!(!filter.accept(Utf8Path::new("/l/extras"), &dir("extras")));
        assert!(filter.accept(Utf8Path::new("/l/extras.mp4"), &file("extras.mp4")));
    }

    #[test]
    fn test_library_filter_by_kind() {
        let mut config = ScanConfig::default();
        config.exclude_video_patterns = vec![r"/videos_only_no/".to_owned()];
        let lib = LibraryConfig {
            path: "/l".into(),
            exclude_video: false,
            exclude_image: true,
        };
        let filter = LibraryFilter::new(&config, &lib);

        assert!(filter.accept(Utf8Path::new("/l/a.mp4"), &file("a.mp4")));
        assert!(!filter.accept(Utf8Path::new("/l/a.jpg"), &file("a.jpg")));
        assert!(!filter.accept(Utf8Path::new("/l/a.zip"), &file("a.zip")));
        assert!(!filter.accept(Utf8Path::new("/l/notes.txt"), &file("notes.txt")));

        // images are excluded by the library, videos by pattern: prune the folder
        assert!(!filter.accept(Utf8Path::new("/l/videos_only_no"), &dir("videos_only_no")));
        assert!(filter.accept(Utf8Path::new("/l/other"), &dir("other")));
    }

    #[test]
    fn test_library_filter_rejects_generated_path() {
        let mut config = ScanConfig::default();
        config.generated_path = Some("/l/.generated".into());
        let filter = LibraryFilter::new(&config, &LibraryConfig::new("/l"));
        assert!(!filter.accept(Utf8Path::new("/l/.generated"), &dir(".generated")));
        assert!(!filter.accept(Utf8Path::new("/l/.generated/x.mp4"), &file("x.mp4")));
    }

    #[test]
    fn test_media_classifier() {
        let classifier = MediaClassifier::new(&ScanConfig::default());
        assert_eq!(classifier.classify(Utf8Path::new("a.MKV")), Some(MediaKind::Video));
        assert_eq!(classifier.classify(Utf8Path::new("a.webp")), Some(MediaKind::Image));
        assert_eq!(classifier.classify(Utf8Path::new("a.cbz")), Some(MediaKind::Gallery));
        assert_eq!(classifier.classify(Utf8Path::new("a.srt")), None);
    }
}
