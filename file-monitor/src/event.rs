//! Change events emitted to callers and raw records delivered by backends.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::file_info::FileInfo;

/// A reconciled change to the watched subtree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// The kind of change.
    pub kind: ChangeKind,

    /// The affected entry. For removals this is the last known metadata.
    pub file: FileInfo,
}

impl ChangeEvent {
    /// An entry appeared.
    pub fn added(file: FileInfo) -> Self {
        Self {
            kind: ChangeKind::Added,
            file,
        }
    }

    /// An entry disappeared.
    pub fn removed(file: FileInfo) -> Self {
        Self {
            kind: ChangeKind::Removed,
            file,
        }
    }

    /// An entry's metadata changed.
    pub fn modified(file: FileInfo) -> Self {
        Self {
            kind: ChangeKind::Modified,
            file,
        }
    }

    /// Relative path of the affected entry.
    pub fn path(&self) -> &Path {
        &self.file.path
    }
}

/// Kind of change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Entry was added.
    Added,

    /// Entry was removed.
    Removed,

    /// Entry was modified.
    Modified,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Added => "added",
            Self::Removed => "removed",
            Self::Modified => "modified",
        };
        f.pad(label)
    }
}

/// What the OS claims happened to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawAction {
    /// Entry was created.
    Added,

    /// Entry was deleted.
    Removed,

    /// Entry contents or attributes changed.
    Modified,

    /// Entry was renamed (old path).
    RenamedFrom,

    /// Entry was renamed (new path).
    RenamedTo,
}

/// One notification as delivered by a backend.
///
/// Records are lower fidelity than [`ChangeEvent`]s: they may be stale,
/// duplicated or describe entries that no longer exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawNotificationRecord {
    /// The reported action.
    pub action: RawAction,

    /// Path as reported, relative to the watched root.
    pub path: PathBuf,
}

impl RawNotificationRecord {
    /// Create a new record.
    pub fn new(action: RawAction, path: impl Into<PathBuf>) -> Self {
        Self {
            action,
            path: path.into(),
        }
    }

    /// Map a notify event onto raw records relative to `root`.
    ///
    /// Access events produce nothing. Paths outside `root` are dropped.
    pub fn from_notify(root: &Path, event: &notify::Event) -> Vec<Self> {
        use notify::EventKind;
        use notify::event::{ModifyKind, RenameMode};

        let relative = |path: &PathBuf| path.strip_prefix(root).ok().map(Path::to_path_buf);

        let action = match event.kind {
            EventKind::Access(_) => return Vec::new(),
            EventKind::Create(_) => RawAction::Added,
            EventKind::Remove(_) => RawAction::Removed,
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => RawAction::RenamedFrom,
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => RawAction::RenamedTo,
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                let mut records = Vec::new();
                if let Some(from) = event.paths.first().and_then(relative) {
                    records.push(Self::new(RawAction::RenamedFrom, from));
                }
                if let Some(to) = event.paths.get(1).and_then(relative) {
                    records.push(Self::new(RawAction::RenamedTo, to));
                }
                return records;
            }
            EventKind::Modify(ModifyKind::Name(_)) => {
                // Some platforms cannot tell which side of a rename a path
                // is on; whether it still exists decides.
                return event
                    .paths
                    .iter()
                    .filter_map(|path| {
                        let action = if path.symlink_metadata().is_ok() {
                            RawAction::RenamedTo
                        } else {
                            RawAction::RenamedFrom
                        };
                        relative(path).map(|rel| Self::new(action, rel))
                    })
                    .collect();
            }
            EventKind::Modify(_) | EventKind::Any | EventKind::Other => RawAction::Modified,
        };

        event
            .paths
            .iter()
            .filter_map(relative)
            .map(|rel| Self::new(action, rel))
            .collect()
    }
}

/// Correlate removals and additions that look like renames.
///
/// A `Removed` and an `Added` event pair up when they describe the same kind
/// of entry with identical size and write time. Each event is used at most
/// once; the result lists `(from, to)` in the order the additions appear.
pub fn pair_renames(events: &[ChangeEvent]) -> Vec<(PathBuf, PathBuf)> {
    let mut removed: Vec<&FileInfo> = events
        .iter()
        .filter(|e| e.kind == ChangeKind::Removed)
        .map(|e| &e.file)
        .collect();

    let mut pairs = Vec::new();
    for added in events.iter().filter(|e| e.kind == ChangeKind::Added) {
        let candidate = removed.iter().position(|old| {
            old.is_directory == added.file.is_directory
                && old.size == added.file.size
                && old.last_write_time == added.file.last_write_time
        });

        if let Some(index) = candidate {
            let old = removed.remove(index);
            pairs.push((old.path.clone(), added.file.path.clone()));
        }
    }

    pairs
}
