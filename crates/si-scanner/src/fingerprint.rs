//! Content fingerprints: oshash, BLAKE3 checksum, and perceptual hash.
//!
//! [`FingerprintCalculator`] decides per kind whether an existing value can
//! be reused or the content must be read again. Content is only opened when
//! at least one kind has to be computed.
//!
//! # Algorithms
//!
//! - **oshash**: the first and last `min(64 KiB, size)` bytes are each read
//!   as little-endian `u64` words and summed together with the file size,
//!   all with wrapping arithmetic. Rendered as 16 lowercase hex digits.
//! - **checksum**: BLAKE3 over the whole content, 64 lowercase hex digits.
//! - **phash**: 25 frames sampled from a video are tiled into a 5x5 sprite,
//!   reduced to a 64x64 grayscale image, and hashed from the top-left 8x8 DCT
//!   coefficients against their median.

use std::f64::consts::PI;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use camino::Utf8Path;
use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbaImage};
use si_core::{BaseFile, Fingerprint, FingerprintKind, Fingerprints};
use tracing::{debug, trace};

use crate::error::FingerprintError;
use crate::fs::Opener;

/// Bytes hashed from each end of the file by oshash.
pub const OSHASH_CHUNK_SIZE: u64 = 64 * 1024;

/// Number of frames sampled for the perceptual hash.
pub const PHASH_FRAME_COUNT: usize = 25;

const SPRITE_COLUMNS: u32 = 5;
const HASH_IMAGE_SIZE: usize = 64;
const DCT_SIZE: usize = 8;

/// Extracts evenly spaced still frames from a video.
///
/// Decoding video is outside this crate; callers plug in an implementation
/// backed by whatever decoder they ship.
pub trait FrameSampler: Send + Sync {
    /// Returns `count` frames from the video at `path`.
    ///
    /// # Errors
    ///
    /// Returns a [`FingerprintError`] if the video can't be decoded.
    fn sample(&self, path: &Utf8Path, count: usize) -> Result<Vec<DynamicImage>, FingerprintError>;
}

/// Finds a perceptual hash already computed for identical content.
pub trait PhashLookup: Send + Sync {
    /// Returns the phash of any known file with the given oshash.
    fn phash_for_oshash(&self, oshash: &str) -> Option<u64>;
}

/// Which fingerprints to produce for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FingerprintRequest {
    /// Keep values already present on the file instead of recomputing them.
    pub use_existing: bool,
    /// Compute the whole-file checksum.
    pub checksum: bool,
    /// Compute the perceptual hash. Only meaningful for videos.
    pub phash: bool,
    /// Recompute the perceptual hash even if one is known.
    pub force_phash: bool,
}

/// Computes fingerprints for files.
///
/// # Examples
///
/// ```no_run
/// use si_core::BaseFile;
/// use si_scanner::fingerprint::{FingerprintCalculator, FingerprintRequest};
/// use si_scanner::fs::{FsOpener, OsFs};
/// use camino::Utf8Path;
///
/// let fs = OsFs;
/// let path = Utf8Path::new("/media/videos/a.mp4");
/// let file = BaseFile::new(path, 1_048_576, 1_700_000_000);
/// let calc = FingerprintCalculator::new();
/// let fps = calc.calculate(&file, &FsOpener::new(&fs, path), FingerprintRequest::default(), None)?;
/// println!("{:?}", fps.oshash());
/// # Ok::<(), si_scanner::FingerprintError>(())
/// ```
#[derive(Clone, Default)]
pub struct FingerprintCalculator {
    sampler: Option<Arc<dyn FrameSampler>>,
}

impl std::fmt::Debug for FingerprintCalculator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FingerprintCalculator")
            .field("sampler", &self.sampler.is_some())
            .finish()
    }
}

impl FingerprintCalculator {
    /// Creates a calculator without a frame sampler; phash requests are
    /// ignored.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a frame sampler, enabling perceptual hashing.
    #[must_use]
    pub fn with_sampler(mut self, sampler: Arc<dyn FrameSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    /// Returns `true` if perceptual hashes can be computed.
    #[must_use]
    pub fn can_phash(&self) -> bool {
        self.sampler.is_some()
    }

    /// Computes the fingerprints requested for `file`.
    ///
    /// The returned set replaces the file's fingerprints. When
    /// `request.use_existing` is false every value is recomputed and stale
    /// kinds are dropped.
    ///
    /// # Errors
    ///
    /// Returns a [`FingerprintError`] if content can't be read or is too
    /// small for oshash.
    pub fn calculate(
        &self,
        file: &BaseFile,
        opener: &dyn Opener,
        request: FingerprintRequest,
        lookup: Option<&dyn PhashLookup>,
    ) -> Result<Fingerprints, FingerprintError> {
        let mut out = if request.use_existing {
            file.fingerprints.clone()
        } else {
            Fingerprints::new()
        };

        if out.oshash().is_none() {
            let mut reader = opener.open()?;
            let value = oshash(&mut reader, file.size)?;
            trace!(path = %file.path, oshash = %value, "Computed oshash");
            out.set(Fingerprint::Oshash(value));
        }

        if request.checksum && out.checksum().is_none() {
            let mut reader = opener.open()?;
            let value = checksum(&mut reader)?;
            trace!(path = %file.path, "Computed checksum");
            out.set(Fingerprint::Checksum(value));
        }

        if request.phash {
            self.calculate_phash(file, request, lookup, &mut out)?;
        }

        Ok(out)
    }

    fn calculate_phash(
        &self,
        file: &BaseFile,
        request: FingerprintRequest,
        lookup: Option<&dyn PhashLookup>,
        out: &mut Fingerprints,
    ) -> Result<(), FingerprintError> {
        let Some(sampler) = &self.sampler else {
            return Ok(());
        };
        if request.force_phash {
            out.remove(FingerprintKind::Phash);
        } else if out.phash().is_some() {
            return Ok(());
        }

        if !request.force_phash {
            let shared = out
                .oshash()
                .and_then(|oshash| lookup.and_then(|l| l.phash_for_oshash(oshash)));
            if let Some(value) = shared {
                debug!(path = %file.path, "Reusing phash from identical content");
                out.set(Fingerprint::Phash(value));
                return Ok(());
            }
        }

        let frames = sampler.sample(&file.path, PHASH_FRAME_COUNT)?;
        let value = phash(&frames)?;
        trace!(path = %file.path, phash = value, "Computed phash");
        out.set(Fingerprint::Phash(value));
        Ok(())
    }
}

fn sum_words(buf: &[u8]) -> u64 {
    buf.chunks_exact(8).fold(0_u64, |acc, word| {
        let mut bytes = [0_u8; 8];
        bytes.copy_from_slice(word);
        acc.wrapping_add(u64::from_le_bytes(bytes))
    })
}

/// Computes the oshash of a reader holding `size` bytes.
///
/// # Errors
///
/// Returns [`FingerprintError::TooSmall`] if `size` is 8 bytes or less, or
/// an I/O error if the content is shorter than `size`.
pub fn oshash<R: Read + Seek + ?Sized>(reader: &mut R, size: u64) -> Result<String, FingerprintError> {
    if size <= 8 {
        return Err(FingerprintError::TooSmall { size });
    }

    let chunk = OSHASH_CHUNK_SIZE.min(size);
    let mut buf = vec![0_u8; usize::try_from(chunk).unwrap_or(usize::MAX)];

    reader.seek(SeekFrom::Start(0))?;
    reader.read_exact(&mut buf)?;
    let head = sum_words(&buf);

    reader.seek(SeekFrom::Start(size - chunk))?;
    reader.read_exact(&mut buf)?;
    let tail = sum_words(&buf);

    Ok(format!("{:016x}", head.wrapping_add(tail).wrapping_add(size)))
}

/// Computes the BLAKE3 checksum of everything `reader` yields.
///
/// # Errors
///
/// Returns an I/O error if reading fails.
pub fn checksum<R: Read + ?Sized>(reader: &mut R) -> io::Result<String> {
    let mut hasher = blake3::Hasher::new();
    io::copy(reader, &mut hasher)?;
    Ok(hasher.finalize().to_hex().to_string())
}

/// Tiles frames into a sprite, `SPRITE_COLUMNS` per row.
///
/// Every cell takes the first frame's dimensions.
fn sprite(frames: &[DynamicImage]) -> Result<RgbaImage, FingerprintError> {
    let first = frames
        .first()
        .ok_or_else(|| FingerprintError::Sampling("no frames".to_owned()))?;
    let (cell_w, cell_h) = (first.width(), first.height());
    if cell_w == 0 || cell_h == 0 {
        return Err(FingerprintError::Sampling("empty frame".to_owned()));
    }

    let count = u32::try_from(frames.len())
        .map_err(|_| FingerprintError::Sampling("too many frames".to_owned()))?;
    let rows = count.div_ceil(SPRITE_COLUMNS);
    let cols = count.min(SPRITE_COLUMNS);
    let mut canvas = RgbaImage::new(cell_w * cols, cell_h * rows);

    for (idx, frame) in (0_u32..).zip(frames) {
        let cell = if frame.width() == cell_w && frame.height() == cell_h {
            frame.to_rgba8()
        } else {
            imageops::resize(&frame.to_rgba8(), cell_w, cell_h, FilterType::Triangle)
        };
        let x = i64::from((idx % SPRITE_COLUMNS) * cell_w);
        let y = i64::from((idx / SPRITE_COLUMNS) * cell_h);
        imageops::replace(&mut canvas, &cell, x, y);
    }
    Ok(canvas)
}

/// Cosine basis for the low-frequency rows of a 64-point DCT-II.
fn dct_basis() -> [[f64; HASH_IMAGE_SIZE]; DCT_SIZE] {
    let mut basis = [[0.0; HASH_IMAGE_SIZE]; DCT_SIZE];
    #[allow(clippy::cast_precision_loss)] // indices are < 64
    for (k, row) in basis.iter_mut().enumerate() {
        for (n, value) in row.iter_mut().enumerate() {
            *value = (PI / HASH_IMAGE_SIZE as f64 * (n as f64 + 0.5) * k as f64).cos();
        }
    }
    basis
}

/// Hashes a grayscale 64x64 image from its top-left 8x8 DCT coefficients.
fn hash_pixels(pixels: &[f64]) -> u64 {
    let basis = dct_basis();

    // rows first: tmp[y][v] = sum_x p[y][x] * basis[v][x]
    let mut rows = [[0.0_f64; DCT_SIZE]; HASH_IMAGE_SIZE];
    for (y, out) in rows.iter_mut().enumerate() {
        let line = &pixels[y * HASH_IMAGE_SIZE..(y + 1) * HASH_IMAGE_SIZE];
        for (v, cell) in out.iter_mut().enumerate() {
            *cell = line.iter().zip(&basis[v]).map(|(p, c)| p * c).sum();
        }
    }

    let mut coefficients = [0.0_f64; DCT_SIZE * DCT_SIZE];
    for u in 0..DCT_SIZE {
        for v in 0..DCT_SIZE {
            coefficients[u * DCT_SIZE + v] = rows
                .iter()
                .zip(&basis[u])
                .map(|(row, c)| row[v] * c)
                .sum();
        }
    }

    let mut sorted = coefficients;
    sorted.sort_by(f64::total_cmp);
    let median = sorted[sorted.len() / 2];

    coefficients
        .iter()
        .enumerate()
        .filter(|(_, value)| **value > median)
        .fold(0_u64, |hash, (idx, _)| hash | (1 << (63 - idx)))
}

/// Computes the perceptual hash of a set of sampled frames.
///
/// # Errors
///
/// Returns [`FingerprintError::Sampling`] if `frames` is empty or the frames
/// have no area.
pub fn phash(frames: &[DynamicImage]) -> Result<u64, FingerprintError> {
    let canvas = sprite(frames)?;
    #[allow(clippy::cast_possible_truncation)] // HASH_IMAGE_SIZE is 64
    let side = HASH_IMAGE_SIZE as u32;
    let small = DynamicImage::ImageRgba8(canvas)
        .resize_exact(side, side, FilterType::Triangle)
        .to_luma8();
    let pixels: Vec<f64> = small.pixels().map(|p| f64::from(p.0[0])).collect();
    Ok(hash_pixels(&pixels))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::ReadSeek;
    use image::{GrayImage, Luma};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct BytesOpener {
        bytes: Vec<u8>,
        opens: AtomicUsize,
    }

    impl BytesOpener {
        fn new(bytes: Vec<u8>) -> Self {
            Self {
                bytes,
                opens: AtomicUsize::new(0),
            }
        }
    }

    impl Opener for BytesOpener {
        fn open(&self) -> io::Result<Box<dyn ReadSeek>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Cursor::new(self.bytes.clone())))
        }
    }

    struct GradientSampler;

    impl FrameSampler for GradientSampler {
        fn sample(&self, _path: &Utf8Path, count: usize) -> Result<Vec<DynamicImage>, FingerprintError> {
            Ok((0..count)
                .map(|i| {
                    let img = GrayImage::from_fn(32, 18, |x, y| {
                        #[allow(clippy::cast_possible_truncation)]
                        Luma([((x * 8 + y * 3) as usize + i) as u8])
                    });
                    DynamicImage::ImageLuma8(img)
                })
                .collect())
        }
    }

    struct FixedLookup(u64);

    impl PhashLookup for FixedLookup {
        fn phash_for_oshash(&self, _oshash: &str) -> Option<u64> {
            Some(self.0)
        }
    }

    fn content(len: usize) -> Vec<u8> {
        #[allow(clippy::cast_possible_truncation)]
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_oshash_small_file_sums_whole_content_twice() {
        let bytes: Vec<u8> = (1..=16).collect();
        let mut cursor = Cursor::new(bytes.clone());
        let words = sum_words(&bytes);
        let expected = format!("{:016x}", words.wrapping_mul(2).wrapping_add(16));
        assert_eq!(oshash(&mut cursor, 16).unwrap(), expected);
    }

    #[test]
    fn test_oshash_rejects_tiny_files() {
        let mut cursor = Cursor::new(vec![0_u8; 8]);
        assert!(matches!(
            oshash(&mut cursor, 8),
            Err(FingerprintError::TooSmall { size: 8 })
        ));
    }

    #[test]
    fn test_oshash_is_stable_and_content_sensitive() {
        let bytes = content(200_000);
        let a = oshash(&mut Cursor::new(bytes.clone()), 200_000).unwrap();
        let b = oshash(&mut Cursor::new(bytes.clone()), 200_000).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);

        let mut changed = bytes;
        changed[10] ^= 0xff;
        let c = oshash(&mut Cursor::new(changed), 200_000).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_oshash_ignores_middle_of_large_files() {
        let bytes = content(300_000);
        let a = oshash(&mut Cursor::new(bytes.clone()), 300_000).unwrap();
        let mut changed = bytes;
        changed[150_000] ^= 0xff;
        let b = oshash(&mut Cursor::new(changed), 300_000).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_checksum_matches_blake3() {
        let bytes = content(10_000);
        let expected = blake3::hash(&bytes).to_hex().to_string();
        assert_eq!(checksum(&mut Cursor::new(bytes)).unwrap(), expected);
    }

    #[test]
    fn test_use_existing_skips_open() {
        let opener = BytesOpener::new(content(1024));
        let mut file = BaseFile::new("/lib/a.mp4", 1024, 1);
        file.fingerprints
            .set(Fingerprint::Oshash("00000000000000aa".to_owned()));

        let calc = FingerprintCalculator::new();
        let request = FingerprintRequest {
            use_existing: true,
            ..Default::default()
        };
        let fps = calc.calculate(&file, &opener, request, None).unwrap();
        assert_eq!(fps.oshash(), Some("00000000000000aa"));
        assert_eq!(opener.opens.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_recompute_drops_stale_values() {
        let opener = BytesOpener::new(content(1024));
        let mut file = BaseFile::new("/lib/a.mp4", 1024, 1);
        file.fingerprints
            .set(Fingerprint::Oshash("00000000000000aa".to_owned()));
        file.fingerprints
            .set(Fingerprint::Checksum("stale".to_owned()));

        let calc = FingerprintCalculator::new();
        let fps = calc
            .calculate(&file, &opener, FingerprintRequest::default(), None)
            .unwrap();
        assert_ne!(fps.oshash(), Some("00000000000000aa"));
        assert!(fps.checksum().is_none());
    }

    #[test]
    fn test_checksum_added_when_missing() {
        let bytes = content(4096);
        let opener = BytesOpener::new(bytes.clone());
        let file = BaseFile::new("/lib/a.mp4", 4096, 1);
        let request = FingerprintRequest {
            use_existing: true,
            checksum: true,
            ..Default::default()
        };
        let fps = FingerprintCalculator::new()
            .calculate(&file, &opener, request, None)
            .unwrap();
        assert_eq!(
            fps.checksum(),
            Some(blake3::hash(&bytes).to_hex().to_string().as_str())
        );
        assert_eq!(fps.len(), 2);
    }

    #[test]
    fn test_phash_without_sampler_is_skipped() {
        let opener = BytesOpener::new(content(1024));
        let file = BaseFile::new("/lib/a.mp4", 1024, 1);
        let request = FingerprintRequest {
            phash: true,
            ..Default::default()
        };
        let fps = FingerprintCalculator::new()
            .calculate(&file, &opener, request, None)
            .unwrap();
        assert!(fps.phash().is_none());
    }

    #[test]
    fn test_phash_reused_from_lookup_unless_forced() {
        let opener = BytesOpener::new(content(1024));
        let file = BaseFile::new("/lib/a.mp4", 1024, 1);
        let calc = FingerprintCalculator::new().with_sampler(Arc::new(GradientSampler));
        let lookup = FixedLookup(0xdead_beef);

        let request = FingerprintRequest {
            phash: true,
            ..Default::default()
        };
        let fps = calc.calculate(&file, &opener, request, Some(&lookup)).unwrap();
        assert_eq!(fps.phash(), Some(0xdead_beef));

        let forced = FingerprintRequest {
            force_phash: true,
            ..request
        };
        let fps = calc.calculate(&file, &opener, forced, Some(&lookup)).unwrap();
        assert_ne!(fps.phash(), Some(0xdead_beef));
        assert!(fps.phash().is_some());
    }

    #[test]
    fn test_phash_is_deterministic() {
        let frames = GradientSampler.sample(Utf8Path::new("x"), PHASH_FRAME_COUNT).unwrap();
        let a = phash(&frames).unwrap();
        let b = phash(&frames).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, 0);
    }

    #[test]
    fn test_phash_rejects_empty_frames() {
        assert!(matches!(phash(&[]), Err(FingerprintError::Sampling(_))));
    }
}
