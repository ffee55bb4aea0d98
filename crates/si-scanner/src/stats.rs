//! Scan statistics with atomic counters.
//!
//! This module provides [`ScanStats`] for tracking what a scan pass did and
//! [`StatsSnapshot`] for point-in-time views.
//!
//! # Thread Safety
//!
//! All counters use [`AtomicU64`] with [`Relaxed`](std::sync::atomic::Ordering::Relaxed)
//! ordering. Statistics are informational and don't require strict ordering
//! guarantees.
//!
//! # Examples
//!
//! ```
//! use si_scanner::ScanStats;
//!
//! let stats = ScanStats::new();
//! stats.increment_new();
//! stats.increment_unchanged();
//!
//! let snapshot = stats.snapshot();
//! assert_eq!(snapshot.files_seen(), 2);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Atomic counters for one scan pass.
#[derive(Debug, Default)]
pub struct ScanStats {
    new: AtomicU64,
    updated: AtomicU64,
    moved: AtomicU64,
    unchanged: AtomicU64,
    folders_created: AtomicU64,
    folders_moved: AtomicU64,
    missing: AtomicU64,
    errors: AtomicU64,
}

macro_rules! counter {
    ($(#[$doc:meta])* $name:ident => $field:ident) => {
        $(#[$doc])*
        #[inline]
        pub fn $name(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl ScanStats {
    /// Creates a new [`ScanStats`] with all counters at zero.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    counter!(
        /// Counts a file seen for the first time.
        increment_new => new
    );
    counter!(
        /// Counts a known file whose content or metadata changed.
        increment_updated => updated
    );
    counter!(
        /// Counts a known file found at a new path.
        increment_moved => moved
    );
    counter!(
        /// Counts a known file with nothing to update.
        increment_unchanged => unchanged
    );
    counter!(
        /// Counts a folder record created.
        increment_folders_created => folders_created
    );
    counter!(
        /// Counts a folder record relocated by rename detection.
        increment_folders_moved => folders_moved
    );
    counter!(
        /// Counts an entry skipped because of an error.
        increment_errors => errors
    );

    /// Counts `n` folders relocated in one rename.
    #[inline]
    pub fn add_folders_moved(&self, n: u64) {
        self.folders_moved.fetch_add(n, Ordering::Relaxed);
    }

    /// Counts `n` files newly marked missing.
    #[inline]
    pub fn add_missing(&self, n: u64) {
        self.missing.fetch_add(n, Ordering::Relaxed);
    }

    /// Returns a point-in-time snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            new: self.new.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            moved: self.moved.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
            folders_created: self.folders_created.load(Ordering::Relaxed),
            folders_moved: self.folders_moved.load(Ordering::Relaxed),
            missing: self.missing.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    /// Resets all counters to zero.
    pub fn reset(&self) {
        for counter in [
            &self.new,
            &self.updated,
            &self.moved,
            &self.unchanged,
            &self.folders_created,
            &self.folders_moved,
            &self.missing,
            &self.errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// A point-in-time snapshot of scan statistics.
///
/// # Examples
///
/// ```
/// use si_scanner::StatsSnapshot;
///
/// let snap = StatsSnapshot { new: 3, unchanged: 7, errors: 1, ..Default::default() };
/// assert_eq!(snap.files_seen(), 10);
/// assert!(snap.has_changes());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Files created.
    pub new: u64,
    /// Files updated in place.
    pub updated: u64,
    /// Files relocated, individually or with their folder.
    pub moved: u64,
    /// Files left as they were.
    pub unchanged: u64,
    /// Folders created.
    pub folders_created: u64,
    /// Folders relocated.
    pub folders_moved: u64,
    /// Known files under the scanned paths that were not found.
    #[serde(default)]
    pub missing: u64,
    /// Entries skipped because of errors.
    pub errors: u64,
}

impl StatsSnapshot {
    /// Number of files that were classified, excluding errors.
    #[inline]
    #[must_use]
    pub const fn files_seen(&self) -> u64 {
        self.new + self.updated + self.moved + self.unchanged
    }

    /// Returns `true` if the pass wrote anything.
    #[inline]
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.new + self.updated + self.moved + self.folders_created + self.folders_moved + self.missing
            > 0
    }

    /// Returns the success rate as a percentage.
    ///
    /// Calculated as `files_seen / (files_seen + errors) * 100`. Returns 100.0
    /// when nothing was seen.
    #[must_use]
    #[allow(clippy::cast_precision_loss)] // Acceptable for statistics display
    pub fn success_rate(&self) -> f64 {
        let seen = self.files_seen();
        let total = seen + self.errors;
        if total == 0 {
            return 100.0;
        }
        (seen as f64 / total as f64) * 100.0
    }
}
