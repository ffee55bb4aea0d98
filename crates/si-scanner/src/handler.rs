//! Post-write hooks for scanned files.
//!
//! A [`FileHandler`] runs after the scanner has created a file record, or
//! updated one whose size or modification time changed. Handlers see the
//! stored record, id included, and the filesystem the file was read through,
//! so they can derive further data (thumbnails, previews, related records)
//! from it. Moves and unchanged files don't fire handlers.

use si_core::File;

use crate::fs::FileSystem;

/// Error returned by a [`FileHandler`].
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A hook run after a file record is created or its content changes.
///
/// Handlers run in registration order, on the scan thread, once the record
/// is stored. A failing handler skips the remaining handlers for that file
/// and is reported as a per-entry error.
///
/// # Examples
///
/// ```
/// use si_core::File;
/// use si_scanner::fs::FileSystem;
/// use si_scanner::handler::{FileHandler, HandlerError};
///
/// struct LogHandler;
///
/// impl FileHandler for LogHandler {
///     fn name(&self) -> &'static str {
///         "log"
///     }
///
///     fn handle(&self, _fs: &dyn FileSystem, file: &File) -> Result<(), HandlerError> {
///         println!("stored {}", file.path());
///         Ok(())
///     }
/// }
/// ```
pub trait FileHandler: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Handles a stored file.
    ///
    /// # Errors
    ///
    /// Returns a [`HandlerError`] if the file couldn't be handled.
    fn handle(&self, fs: &dyn FileSystem, file: &File) -> Result<(), HandlerError>;
}
