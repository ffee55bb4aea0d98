//! Content identity hashes.
//!
//! A [`Fingerprint`] is a sum type: each algorithm carries its natural value
//! type, so a perceptual hash can never be compared against a checksum string.
//! [`Fingerprints`] holds at most one value per [`FingerprintKind`].

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// The algorithm that produced a fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintKind {
    /// Partial-content hash over the head and tail of the file.
    Oshash,
    /// Whole-file cryptographic checksum (BLAKE3).
    Checksum,
    /// 64-bit perceptual hash of sampled video frames.
    Phash,
}

impl FingerprintKind {
    /// Returns the short lowercase label for this kind.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Oshash => "oshash",
            Self::Checksum => "checksum",
            Self::Phash => "phash",
        }
    }
}

impl fmt::Display for FingerprintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A single content fingerprint.
///
/// # Examples
///
/// ```
/// use si_core::{Fingerprint, FingerprintKind};
///
/// let fp = Fingerprint::Oshash("8dd7d1e2a4f0c6b1".to_owned());
/// assert_eq!(fp.kind(), FingerprintKind::Oshash);
/// assert_eq!(fp.to_string(), "oshash:8dd7d1e2a4f0c6b1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Fingerprint {
    /// 16 lowercase hex digits.
    Oshash(String),
    /// 64 lowercase hex digits.
    Checksum(String),
    /// Raw 64-bit perceptual hash.
    Phash(u64),
}

impl Fingerprint {
    /// Returns the algorithm that produced this value.
    #[inline]
    #[must_use]
    pub const fn kind(&self) -> FingerprintKind {
        match self {
            Self::Oshash(_) => FingerprintKind::Oshash,
            Self::Checksum(_) => FingerprintKind::Checksum,
            Self::Phash(_) => FingerprintKind::Phash,
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Oshash(v) | Self::Checksum(v) => write!(f, "{}:{v}", self.kind()),
            Self::Phash(v) => write!(f, "{}:{v:016x}", self.kind()),
        }
    }
}

/// The fingerprints recorded for one file, unique by kind and ordered by kind.
///
/// # Examples
///
/// ```
/// use si_core::{Fingerprint, Fingerprints};
///
/// let mut fps = Fingerprints::new();
/// fps.set(Fingerprint::Oshash("aaaa".to_owned()));
/// fps.set(Fingerprint::Oshash("bbbb".to_owned()));
/// assert_eq!(fps.len(), 1);
/// assert_eq!(fps.oshash(), Some("bbbb"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Fingerprint>")]
pub struct Fingerprints(SmallVec<[Fingerprint; 3]>);

impl Fingerprints {
    /// Creates an empty set.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `fp`, replacing any existing value of the same kind.
    ///
    /// Returns `true` if the set changed.
    pub fn set(&mut self, fp: Fingerprint) -> bool {
        let kind = fp.kind();
        match self.0.binary_search_by_key(&kind, Fingerprint::kind) {
            Ok(idx) => {
                if self.0[idx] == fp {
                    return false;
                }
                self.0[idx] = fp;
            }
            Err(idx) => self.0.insert(idx, fp),
        }
        true
    }

    /// Removes the value of the given kind, returning it if present.
    pub fn remove(&mut self, kind: FingerprintKind) -> Option<Fingerprint> {
        self.0
            .binary_search_by_key(&kind, Fingerprint::kind)
            .ok()
            .map(|idx| self.0.remove(idx))
    }

    /// Returns the fingerprint of the given kind.
    #[must_use]
    pub fn get(&self, kind: FingerprintKind) -> Option<&Fingerprint> {
        self.0
            .binary_search_by_key(&kind, Fingerprint::kind)
            .ok()
            .map(|idx| &self.0[idx])
    }

    /// Returns `true` if a value of the given kind is present.
    #[inline]
    #[must_use]
    pub fn contains(&self, kind: FingerprintKind) -> bool {
        self.get(kind).is_some()
    }

    /// Returns the oshash value, if present.
    #[must_use]
    pub fn oshash(&self) -> Option<&str> {
        match self.get(FingerprintKind::Oshash) {
            Some(Fingerprint::Oshash(v)) => Some(v),
            _ => None,
        }
    }

    /// Returns the checksum value, if present.
    #[must_use]
    pub fn checksum(&self) -> Option<&str> {
        match self.get(FingerprintKind::Checksum) {
            Some(Fingerprint::Checksum(v)) => Some(v),
            _ => None,
        }
    }

    /// Returns the perceptual hash, if present.
    #[must_use]
    pub fn phash(&self) -> Option<u64> {
        match self.get(FingerprintKind::Phash) {
            Some(Fingerprint::Phash(v)) => Some(*v),
            _ => None,
        }
    }

    /// Copies every value from `other` into `self`, replacing same-kind entries.
    ///
    /// Returns `true` if the set changed.
    pub fn merge(&mut self, other: &Self) -> bool {
        let mut changed = false;
        for fp in other.iter() {
            changed |= self.set(fp.clone());
        }
        changed
    }

    /// Iterates fingerprints in kind order.
    pub fn iter(&self) -> impl Iterator<Item = &Fingerprint> {
        self.0.iter()
    }

    /// Number of fingerprints present.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if no fingerprint is present.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<Fingerprint>> for Fingerprints {
    fn from(values: Vec<Fingerprint>) -> Self {
        let mut fps = Self::new();
        for fp in values {
            fps.set(fp);
        }
        fps
    }
}

impl FromIterator<Fingerprint> for Fingerprints {
    fn from_iter<I: IntoIterator<Item = Fingerprint>>(iter: I) -> Self {
        let mut fps = Self::new();
        for fp in iter {
            fps.set(fp);
        }
        fps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_keeps_one_per_kind_in_order() {
        let mut fps = Fingerprints::new();
        assert!(fps.set(Fingerprint::Phash(7)));
        assert!(fps.set(Fingerprint::Oshash("a".to_owned())));
        assert!(fps.set(Fingerprint::Checksum("c".to_owned())));
        assert!(!fps.set(Fingerprint::Phash(7)));
        assert!(fps.set(Fingerprint::Phash(8)));

        let kinds: Vec<_> = fps.iter().map(Fingerprint::kind).collect();
        assert_eq!(
            kinds,
            vec![
                FingerprintKind::Oshash,
                FingerprintKind::Checksum,
                FingerprintKind::Phash
            ]
        );
        assert_eq!(fps.phash(), Some(8));
    }

    #[test]
    fn test_deserialize_deduplicates() {
        let json = r#"[
            {"type": "oshash", "value": "one"},
            {"type": "oshash", "value": "two"},
            {"type": "phash", "value": 42}
        ]"#;
        let fps: Fingerprints = serde_json::from_str(json).unwrap();
        assert_eq!(fps.len(), 2);
        assert_eq!(fps.oshash(), Some("two"));
        assert_eq!(fps.phash(), Some(42));
    }

    #[test]
    fn test_serialized_shape() {
        let fps: Fingerprints = vec![
            Fingerprint::Checksum("ab".to_owned()),
            Fingerprint::Oshash("cd".to_owned()),
        ]
        .into();
        insta::assert_json_snapshot!(fps, @r#"
        [
          {
            "type": "oshash",
            "value": "cd"
          },
          {
            "type": "checksum",
            "value": "ab"
          }
        ]
        "#);
    }

    #[test]
    fn test_merge_reports_change() {
        let mut a: Fingerprints = vec![Fingerprint::Oshash("x".to_owned())].into();
        let b: Fingerprints = vec![Fingerprint::Checksum("y".to_owned())].into();
        assert!(a.merge(&b));
        assert!(!a.merge(&b));
        assert_eq!(a.checksum(), Some("y"));
    }

    #[test]
    fn test_display() {
        assert_eq!(Fingerprint::Phash(255).to_string(), "phash:00000000000000ff");
        assert_eq!(FingerprintKind::Checksum.to_string(), "checksum");
    }
}
