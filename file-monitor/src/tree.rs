//! In-memory snapshot of a watched subtree.
//!
//! The tree is stored as a pre-order flattening keyed by root-relative path.
//! `Path` compares component by component, so iterating the map visits every
//! directory immediately before its descendants, with siblings sorted. Both
//! producers of a tree (a full scan and incremental reconciliation) share
//! this ordering, which is what lets [`SnapshotTree::diff`] be a single
//! linear merge.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::event::ChangeEvent;
use crate::file_info::FileInfo;

/// Ordered hierarchical collection of [`FileInfo`] rooted at a watched path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotTree {
    /// Absolute path of the watched root.
    root: PathBuf,

    /// Entries below the root, keyed by relative path.
    entries: BTreeMap<PathBuf, FileInfo>,
}

impl SnapshotTree {
    /// Create an empty tree for `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Absolute path of the watched root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of entries (the root itself is not counted).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the tree has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up an entry by relative path.
    pub fn get(&self, relative: &Path) -> Option<&FileInfo> {
        self.entries.get(relative)
    }

    /// Whether an entry exists at `relative`.
    pub fn contains(&self, relative: &Path) -> bool {
        self.entries.contains_key(relative)
    }

    /// Insert or replace an entry, returning the previous one.
    pub fn insert(&mut self, info: FileInfo) -> Option<FileInfo> {
        self.entries.insert(info.path.clone(), info)
    }

    /// Remove a single entry without touching its descendants.
    pub fn remove(&mut self, relative: &Path) -> Option<FileInfo> {
        self.entries.remove(relative)
    }

    /// Remove an entry and everything below it.
    ///
    /// The removed entries are returned deepest-first, so descendants always
    /// precede the directory that contained them.
    pub fn remove_subtree(&mut self, relative: &Path) -> Vec<FileInfo> {
        let doomed: Vec<PathBuf> = self
            .subtree_keys(relative)
            .cloned()
            .collect();

        doomed
            .iter()
            .rev()
            .filter_map(|path| self.entries.remove(path))
            .collect()
    }

    /// All entries in pre-order.
    pub fn iter(&self) -> impl Iterator<Item = &FileInfo> {
        self.entries.values()
    }

    /// Entries strictly below `dir`, in pre-order.
    pub fn descendants<'a>(&'a self, dir: &'a Path) -> impl Iterator<Item = &'a FileInfo> + 'a {
        self.entries
            .range::<Path, _>((Bound::Excluded(dir), Bound::Unbounded))
            .take_while(move |(path, _)| path.starts_with(dir))
            .map(|(_, info)| info)
    }

    /// Changes that turn `self` into `other`.
    ///
    /// Walks both trees in lockstep: entries only in `self` are removed,
    /// entries only in `other` are added, and entries in both whose metadata
    /// differs are modified. Events come out in path order.
    pub fn diff(&self, other: &SnapshotTree) -> Vec<ChangeEvent> {
        let mut events = Vec::new();
        let mut old = self.entries.values().peekable();
        let mut new = other.entries.values().peekable();

        loop {
            let order = match (old.peek(), new.peek()) {
                (None, None) => break,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(o), Some(n)) => o.cmp(n),
            };

            match order {
                Ordering::Less => {
                    if let Some(o) = old.next() {
                        events.push(ChangeEvent::removed(o.clone()));
                    }
                }
                Ordering::Greater => {
                    if let Some(n) = new.next() {
                        events.push(ChangeEvent::added(n.clone()));
                    }
                }
                Ordering::Equal => {
                    if let (Some(o), Some(n)) = (old.next(), new.next()) {
                        if o.is_directory != n.is_directory {
                            events.push(ChangeEvent::removed(o.clone()));
                            events.push(ChangeEvent::added(n.clone()));
                        } else if o.metadata_differs(n) {
                            events.push(ChangeEvent::modified(n.clone()));
                        }
                    }
                }
            }
        }

        events
    }

    /// Whether both trees describe the same entries with the same metadata.
    pub fn matches(&self, other: &SnapshotTree) -> bool {
        self.diff(other).is_empty()
    }

    fn subtree_keys<'a>(&'a self, relative: &'a Path) -> impl Iterator<Item = &'a PathBuf> + 'a {
        self.entries
            .range::<Path, _>((Bound::Included(relative), Bound::Unbounded))
            .take_while(move |(path, _)| path.starts_with(relative))
            .map(|(path, _)| path)
    }
}

impl Extend<FileInfo> for SnapshotTree {
    fn extend<T: IntoIterator<Item = FileInfo>>(&mut self, iter: T) {
        for info in iter {
            self.insert(info);
        }
    }
}
