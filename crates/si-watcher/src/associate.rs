//! Maps auxiliary files to the media file they belong to.
//!
//! Captions are named `<video>.<ext>` or `<video>.<lang>.<ext>` where
//! `<lang>` is a language code with an optional region (`en`, `pt-BR`).
//! Interactive scripts are named `<video>.<ext>`. A change to either
//! should rescan the video, since captions and scripts are recorded on it.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use si_core::ScanConfig;
use si_scanner::fs::FileSystem;

/// Kinds of auxiliary file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuxiliaryKind {
    /// Subtitle file such as `.vtt` or `.srt`.
    Caption,
    /// Interactive script such as `.funscript`.
    Script,
}

/// Finds the primary media file of caption and script files.
#[derive(Clone)]
pub struct AuxiliaryResolver {
    fs: Arc<dyn FileSystem>,
    video_extensions: Vec<String>,
    caption_extensions: Vec<String>,
    script_extensions: Vec<String>,
}

impl std::fmt::Debug for AuxiliaryResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuxiliaryResolver")
            .field("video_extensions", &self.video_extensions)
            .field("caption_extensions", &self.caption_extensions)
            .field("script_extensions", &self.script_extensions)
            .finish_non_exhaustive()
    }
}

fn lowercase_all(exts: &[String]) -> Vec<String> {
    exts.iter().map(|e| e.to_ascii_lowercase()).collect()
}

impl AuxiliaryResolver {
    /// Creates a resolver probing candidates through `fs`.
    #[must_use]
    pub fn new(fs: Arc<dyn FileSystem>, config: &ScanConfig) -> Self {
        Self {
            fs,
            video_extensions: lowercase_all(&config.video_extensions),
            caption_extensions: lowercase_all(&config.caption_extensions),
            script_extensions: lowercase_all(&config.script_extensions),
        }
    }

    /// Classifies `path` by extension.
    #[must_use]
    pub fn kind(&self, path: &Utf8Path) -> Option<AuxiliaryKind> {
        let ext = path.extension()?.to_ascii_lowercase();
        if self.caption_extensions.contains(&ext) {
            Some(AuxiliaryKind::Caption)
        } else if self.script_extensions.contains(&ext) {
            Some(AuxiliaryKind::Script)
        } else {
            None
        }
    }

    /// Returns the existing video that `path` belongs to.
    ///
    /// Returns `None` if `path` isn't an auxiliary file or no sibling video
    /// with a matching name exists.
    #[must_use]
    pub fn resolve(&self, path: &Utf8Path) -> Option<Utf8PathBuf> {
        let kind = self.kind(path)?;
        let parent = path.parent()?;
        let stem = path.file_stem()?;

        let mut bases = vec![stem];
        if kind == AuxiliaryKind::Caption {
            if let Some((base, lang)) = stem.rsplit_once('.') {
                if is_language_code(lang) && !base.is_empty() {
                    bases.insert(0, base);
                }
            }
        }

        bases.into_iter().find_map(|base| self.probe(parent, base))
    }

    fn probe(&self, parent: &Utf8Path, base: &str) -> Option<Utf8PathBuf> {
        self.video_extensions.iter().find_map(|ext| {
            let candidate = parent.join(format!("{base}.{ext}"));
            self.fs
                .stat(&candidate)
                .ok()
                .filter(|info| !info.is_dir)
                .map(|_| candidate)
        })
    }
}

/// Matches `xx`, `xxx`, or either followed by `-YY` / `_YY`.
fn is_language_code(segment: &str) -> bool {
    let (lang, region) = match segment.split_once(['-', '_']) {
        Some((lang, region)) => (lang, Some(region)),
        None => (segment, None),
    };
    let lang_ok = (2..=3).contains(&lang.len()) && lang.chars().all(|c| c.is_ascii_alphabetic());
    let region_ok = region.is_none_or(|r| r.len() == 2 && r.chars().all(|c| c.is_ascii_alphabetic()));
    lang_ok && region_ok
}

#[cfg(test)]
mod tests {
    use std::fs;

    use si_scanner::fs::OsFs;
    use tempfile::TempDir;

    use super::*;

    fn setup(files: &[&str]) -> (TempDir, Utf8PathBuf, AuxiliaryResolver) {
        let dir = TempDir::new().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        for name in files {
            fs::write(root.join(name), b"x").unwrap();
        }
        let resolver = AuxiliaryResolver::new(Arc::new(OsFs), &ScanConfig::default());
        (dir, root, resolver)
    }

    #[test]
    fn test_language_codes() {
        for code in ["en", "eng", "pt-BR", "zh_CN"] {
            assert!(is_language_code(code), "{code}");
        }
        for code in ["", "e", "english", "en-USA", "e1"] {
            assert!(!is_language_code(code), "{code}");
        }
    }

    #[test]
    fn test_caption_with_language_maps_to_video() {
        let (_dir, root, resolver) = setup(&["movie.mp4", "movie.en.vtt"]);
        assert_eq!(
            resolver.resolve(&root.join("movie.en.vtt")),
            Some(root.join("movie.mp4"))
        );
    }

    #[test]
    fn test_caption_without_language() {
        let (_dir, root, resolver) = setup(&["clip.mkv"]);
        assert_eq!(
            resolver.resolve(&root.join("clip.srt")),
            Some(root.join("clip.mkv"))
        );
    }

    #[test]
    fn test_dotted_video_name_is_not_a_language() {
        let (_dir, root, resolver) = setup(&["part.one.mp4"]);
        assert_eq!(
            resolver.resolve(&root.join("part.one.vtt")),
            Some(root.join("part.one.mp4"))
        );
    }

    #[test]
    fn test_script_maps_to_video() {
        let (_dir, root, resolver) = setup(&["scene.mp4"]);
        assert_eq!(resolver.kind(&root.join("scene.funscript")), Some(AuxiliaryKind::Script));
        assert_eq!(
            resolver.resolve(&root.join("scene.funscript")),
            Some(root.join("scene.mp4"))
        );
    }

    #[test]
    fn test_no_sibling_video() {
        let (_dir, root, resolver) = setup(&["other.mp4"]);
        assert_eq!(resolver.resolve(&root.join("movie.en.vtt")), None);
        assert_eq!(resolver.resolve(&root.join("movie.mp4")), None);
    }
}
