//! Domain types for stash-ingest.
//!
//! Files and folders live in arena-style storage owned by a repository and
//! reference each other through copyable identifiers instead of pointers.
//!
//! # Module Organization
//!
//! - [`file`] - File identifiers, base attributes, and per-kind details
//! - [`folder`] - Folder identifiers and records
//! - [`fingerprint`] - Content identity hashes
//!
//! All public types are re-exported at this module level and at the crate root:
//!
//! ```
//! use si_core::{File, FileId, Fingerprint, Folder, FolderId};
//! ```

mod file;
mod fingerprint;
mod folder;

pub use file::{BaseFile, File, FileDetails, FileId, ImageDetails, VideoDetails};
pub use fingerprint::{Fingerprint, FingerprintKind, Fingerprints};
pub use folder::{Folder, FolderId};
