//! Turn raw notification batches into change events.
//!
//! Each batch is applied to the [`SnapshotTree`] in delivery order. Raw
//! records are only hints: every addition and modification is confirmed
//! against the file system, and records that disagree with the tree (a
//! removal of something already gone, an addition of something already
//! present) fall through as no-ops. When the OS reports an overflow the
//! whole root is rescanned and diffed against the stored tree instead.

use std::path::{Component, Path, PathBuf};

use tracing::{debug, info, trace};

use crate::error::{MonitorError, Result};
use crate::event::{ChangeEvent, ChangeKind, RawAction, RawNotificationRecord};
use crate::file_info::FileInfo;
use crate::scanner::{self, ScanOptions};
use crate::tree::SnapshotTree;

/// Result of reconciling one batch.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Events in the order they were applied to the tree.
    pub events: Vec<ChangeEvent>,

    /// The watched root itself no longer exists.
    pub root_removed: bool,
}

/// Apply a batch of raw records to `tree`.
pub fn reconcile_batch(
    tree: &mut SnapshotTree,
    records: Vec<RawNotificationRecord>,
    recursive: bool,
    options: &ScanOptions,
) -> BatchOutcome {
    let mut reconciler = Reconciler {
        tree,
        recursive,
        options,
        events: Vec::new(),
    };

    let mut root_touched = false;
    for record in records {
        let Some(path) = normalize(&record.path) else {
            debug!("Ignoring record outside the root: {}", record.path.display());
            continue;
        };

        if path.as_os_str().is_empty() {
            root_touched = true;
            continue;
        }

        reconciler.apply(record.action, path);
    }

    let mut root_removed = false;
    if root_touched && !reconciler.tree.root().is_dir() {
        info!("Watched root removed: {}", reconciler.tree.root().display());
        for info in reconciler.tree.remove_subtree(Path::new("")) {
            reconciler.events.push(ChangeEvent::removed(info));
        }
        root_removed = true;
    }

    BatchOutcome {
        events: reconciler.events,
        root_removed,
    }
}

/// Recover from an overflow by rescanning the root and diffing.
///
/// The stored tree is replaced by the fresh scan. If the root itself is
/// gone every entry is reported removed and `root_removed` is set.
pub fn reconcile_overflow(
    tree: &mut SnapshotTree,
    recursive: bool,
    options: &ScanOptions,
) -> Result<BatchOutcome> {
    info!("Rescanning {} after overflow", tree.root().display());

    match scanner::scan(tree.root(), recursive, options) {
        Ok(fresh) => {
            let events = tree.diff(&fresh);
            *tree = fresh;
            Ok(BatchOutcome {
                events,
                root_removed: false,
            })
        }
        Err(MonitorError::DirectoryNotFound(_) | MonitorError::NotADirectory(_)) => {
            let events = tree
                .remove_subtree(Path::new(""))
                .into_iter()
                .map(ChangeEvent::removed)
                .collect();
            Ok(BatchOutcome {
                events,
                root_removed: true,
            })
        }
        Err(e) => Err(e),
    }
}

/// Strip `.` and trailing separators; reject paths escaping the root.
fn normalize(raw: &Path) -> Option<PathBuf> {
    let mut path = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(path)
}

struct Reconciler<'a> {
    tree: &'a mut SnapshotTree,
    recursive: bool,
    options: &'a ScanOptions,
    events: Vec<ChangeEvent>,
}

impl Reconciler<'_> {
    fn apply(&mut self, action: RawAction, path: PathBuf) {
        if !self.recursive && path.components().count() > 1 {
            trace!("Ignoring nested path in non-recursive watch: {}", path.display());
            return;
        }
        if path
            .ancestors()
            .filter(|a| !a.as_os_str().is_empty())
            .any(|a| self.options.excludes.is_excluded(a))
        {
            trace!("Ignoring excluded path: {}", path.display());
            return;
        }

        match action {
            RawAction::Added | RawAction::RenamedTo => self.add(&path),
            RawAction::Removed | RawAction::RenamedFrom => self.remove(&path),
            RawAction::Modified => self.modify(&path),
        }
    }

    fn stat(&self, path: &Path) -> Option<FileInfo> {
        match FileInfo::stat(self.tree.root(), path, self.options.follow_symlinks) {
            Ok(info) => Some(info),
            Err(e) => {
                debug!("Cannot stat {}: {e}", path.display());
                None
            }
        }
    }

    fn add(&mut self, path: &Path) {
        let Some(fresh) = self.stat(path) else {
            return;
        };

        match self.tree.get(path) {
            None => match self.outermost_missing_ancestor(path) {
                Some(ancestor) => {
                    // The new ancestor's subtree scan picks up `path` too.
                    if let Some(info) = self.stat(&ancestor) {
                        self.insert_new(info);
                    }
                }
                None => self.insert_new(fresh),
            },
            Some(existing) if existing.is_directory != fresh.is_directory => {
                self.replace(fresh);
            }
            Some(existing) if existing.metadata_differs(&fresh) => {
                self.tree.insert(fresh.clone());
                self.events.push(ChangeEvent::modified(fresh));
            }
            Some(_) => trace!("Already present: {}", path.display()),
        }
    }

    fn remove(&mut self, path: &Path) {
        if !self.tree.contains(path) {
            trace!("Already absent: {}", path.display());
            return;
        }

        // Removals are hints like everything else: a reordered or coalesced
        // batch can report a path removed after it was created again.
        let Some(fresh) = self.stat(path) else {
            for info in self.tree.remove_subtree(path) {
                self.events.push(ChangeEvent::removed(info));
            }
            return;
        };

        let Some(existing) = self.tree.get(path) else {
            return;
        };
        let kind_changed = existing.is_directory != fresh.is_directory;
        let changed = existing.metadata_differs(&fresh);

        if kind_changed {
            self.replace(fresh);
        } else if fresh.is_directory {
            self.tree.insert(fresh);
            if self.recursive {
                self.refresh_subtree(path);
            }
        } else if changed {
            self.tree.insert(fresh.clone());
            self.events.push(ChangeEvent::modified(fresh));
        } else {
            trace!("Stale removal of existing entry: {}", path.display());
        }
    }

    /// Bring the tracked contents of an existing directory in line with disk.
    fn refresh_subtree(&mut self, dir: &Path) {
        let mut tracked = SnapshotTree::new(self.tree.root());
        tracked.extend(self.tree.descendants(dir).cloned());

        let mut current = SnapshotTree::new(self.tree.root());
        if let Err(e) = scanner::scan_into(&mut current, dir, true, self.options) {
            debug!("Could not rescan {}: {e}", dir.display());
            return;
        }

        for event in tracked.diff(&current) {
            match event.kind {
                ChangeKind::Removed => {
                    self.tree.remove(event.path());
                }
                ChangeKind::Added | ChangeKind::Modified => {
                    self.tree.insert(event.file.clone());
                }
            }
            self.events.push(event);
        }
    }

    fn modify(&mut self, path: &Path) {
        let Some(existing) = self.tree.get(path) else {
            trace!("Modification of untracked entry: {}", path.display());
            return;
        };
        let existing_is_directory = existing.is_directory;

        let Some(fresh) = self.stat(path) else {
            return;
        };

        if existing_is_directory != fresh.is_directory {
            self.replace(fresh);
        } else if self.tree.get(path).is_some_and(|e| e.metadata_differs(&fresh)) {
            self.tree.insert(fresh.clone());
            self.events.push(ChangeEvent::modified(fresh));
        } else if fresh.is_directory {
            // Keep the directory's write time current without an event.
            self.tree.insert(fresh);
        } else {
            trace!("Coalesced duplicate modification: {}", path.display());
        }
    }

    /// Swap an entry of one kind for an entry of the other kind.
    fn replace(&mut self, fresh: FileInfo) {
        let path = fresh.path.clone();
        for info in self.tree.remove_subtree(&path) {
            self.events.push(ChangeEvent::removed(info));
        }
        self.insert_new(fresh);
    }

    /// Insert an entry that is not in the tree; pull in a new directory's
    /// contents, which the OS may never report individually.
    fn insert_new(&mut self, fresh: FileInfo) {
        let path = fresh.path.clone();
        let is_directory = fresh.is_directory;

        self.tree.insert(fresh.clone());
        self.events.push(ChangeEvent::added(fresh));

        if is_directory && self.recursive {
            match scanner::scan_into(self.tree, &path, true, self.options) {
                Ok(added) => {
                    for child in added {
                        if let Some(info) = self.tree.get(&child) {
                            self.events.push(ChangeEvent::added(info.clone()));
                        }
                    }
                }
                Err(e) => debug!("Could not scan new directory {}: {e}", path.display()),
            }
        }
    }

    /// The highest ancestor of `path` missing from the tree, if any.
    fn outermost_missing_ancestor(&self, path: &Path) -> Option<PathBuf> {
        path.ancestors()
            .skip(1)
            .filter(|a| !a.as_os_str().is_empty())
            .take_while(|a| !self.tree.contains(a))
            .last()
            .map(Path::to_path_buf)
    }
}
