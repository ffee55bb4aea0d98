//! Filesystem change events with UTF-8 paths.

use camino::Utf8PathBuf;
use notify::EventKind;
use notify::event::{ModifyKind, RenameMode};
use smallvec::SmallVec;
use tracing::warn;

/// What happened to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// The path appeared, including the destination of a rename.
    Created,
    /// Content or metadata changed.
    Modified,
    /// The path went away, including the source of a rename.
    Removed,
}

/// A change to one path, as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    /// Absolute path that changed.
    pub path: Utf8PathBuf,
    /// What happened to it.
    pub kind: ChangeKind,
}

impl FileEvent {
    /// Creates a new event.
    #[inline]
    #[must_use]
    pub fn new(path: impl Into<Utf8PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }

    /// Returns `true` if the path may now hold content worth scanning.
    #[inline]
    #[must_use]
    pub fn is_present(&self) -> bool {
        self.kind != ChangeKind::Removed
    }
}

/// Converts a backend event into one event per path.
///
/// Access events are dropped; a two-path rename yields `Removed` for the
/// source and `Created` for the destination. Non-UTF-8 paths are logged and
/// skipped.
pub fn from_notify(event: notify::Event) -> SmallVec<[FileEvent; 2]> {
    let kinds: SmallVec<[ChangeKind; 2]> = match event.kind {
        EventKind::Create(_) => SmallVec::from_elem(ChangeKind::Created, 1),
        EventKind::Remove(_) => SmallVec::from_elem(ChangeKind::Removed, 1),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            SmallVec::from_elem(ChangeKind::Removed, 1)
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            SmallVec::from_elem(ChangeKind::Created, 1)
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            [ChangeKind::Removed, ChangeKind::Created].into_iter().collect()
        }
        EventKind::Modify(_) | EventKind::Any | EventKind::Other => {
            SmallVec::from_elem(ChangeKind::Modified, 1)
        }
        EventKind::Access(_) => return SmallVec::new(),
    };

    let mut out = SmallVec::new();
    for (index, path) in event.paths.into_iter().enumerate() {
        let kind = kinds
            .get(index)
            .or_else(|| kinds.last())
            .copied()
            .unwrap_or(ChangeKind::Modified);
        match Utf8PathBuf::try_from(path) {
            Ok(path) => out.push(FileEvent::new(path, kind)),
            Err(e) => {
                let invalid = e.into_path_buf();
                warn!(path = %invalid.display(), "Skipping non-UTF-8 path in file event");
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use notify::event::{AccessKind, CreateKind, DataChange, RemoveKind};

    use super::*;

    fn event(kind: EventKind, paths: &[&str]) -> notify::Event {
        paths
            .iter()
            .fold(notify::Event::new(kind), |e, p| e.add_path(PathBuf::from(p)))
    }

    #[test]
    fn test_create_and_remove() {
        let created = from_notify(event(EventKind::Create(CreateKind::File), &["/lib/a.mp4"]));
        assert_eq!(
            created.as_slice(),
            [FileEvent::new("/lib/a.mp4", ChangeKind::Created)]
        );

        let removed = from_notify(event(EventKind::Remove(RemoveKind::Any), &["/lib/a.mp4"]));
        assert!(!removed[0].is_present());
    }

    #[test]
    fn test_rename_both_splits_paths() {
        let events = from_notify(event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/lib/old.mp4", "/lib/new.mp4"],
        ));
        assert_eq!(
            events.as_slice(),
            [
                FileEvent::new("/lib/old.mp4", ChangeKind::Removed),
                FileEvent::new("/lib/new.mp4", ChangeKind::Created),
            ]
        );
    }

    #[test]
    fn test_modify_and_access() {
        let modified = from_notify(event(
            EventKind::Modify(ModifyKind::Data(DataChange::Content)),
            &["/lib/a.mp4"],
        ));
        assert_eq!(modified[0].kind, ChangeKind::Modified);

        let accessed = from_notify(event(EventKind::Access(AccessKind::Any), &["/lib/a.mp4"]));
        assert!(accessed.is_empty());
    }
}
