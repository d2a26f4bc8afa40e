//! One-shot directory scans that produce a baseline [`SnapshotTree`].

use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::{Excludes, MonitorConfig};
use crate::error::{MonitorError, Result};
use crate::file_info::FileInfo;
use crate::tree::SnapshotTree;

/// Options that shape a scan.
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Entries to leave out of the tree.
    pub excludes: Excludes,

    /// Whether to follow symbolic links.
    pub follow_symlinks: bool,
}

impl From<&MonitorConfig> for ScanOptions {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            excludes: config.excludes(),
            follow_symlinks: config.follow_symlinks,
        }
    }
}

/// Scan `root` and return its snapshot.
///
/// Failing to read the root is fatal. A subdirectory that cannot be read is
/// kept as an empty directory and a warning is logged, so one inaccessible
/// folder never aborts monitoring of the rest of the tree.
pub fn scan(root: &Path, recursive: bool, options: &ScanOptions) -> Result<SnapshotTree> {
    let metadata = std::fs::metadata(root).map_err(|e| MonitorError::from_root_io(root, e))?;
    if !metadata.is_dir() {
        return Err(MonitorError::NotADirectory(root.display().to_string()));
    }

    let mut tree = SnapshotTree::new(root);
    scan_into(&mut tree, Path::new(""), recursive, options)?;
    Ok(tree)
}

/// Scan the subtree at `relative` (below `tree.root()`) into `tree`.
///
/// Entries are inserted with paths relative to the tree root; `relative`
/// itself is not inserted. Returns the relative paths that were not already
/// present, in pre-order.
pub fn scan_into(
    tree: &mut SnapshotTree,
    relative: &Path,
    recursive: bool,
    options: &ScanOptions,
) -> Result<Vec<PathBuf>> {
    let start = Instant::now();
    let root = tree.root().to_path_buf();
    let base = root.join(relative);

    // Read the base first so an unreadable root is reported as such rather
    // than as an empty tree.
    std::fs::read_dir(&base).map_err(|e| MonitorError::from_root_io(&base, e))?;

    let walker = WalkDir::new(&base)
        .min_depth(1)
        .max_depth(if recursive { usize::MAX } else { 1 })
        .follow_links(options.follow_symlinks)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry
                .path()
                .strip_prefix(&root)
                .map(|rel| !options.excludes.is_excluded(rel))
                .unwrap_or(false)
        });

    let mut added = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| base.clone());
                warn!("Skipping unreadable entry {}: {e}", path.display());
                continue;
            }
        };

        let Ok(rel) = entry.path().strip_prefix(&root) else {
            continue;
        };

        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                // Typically a race with a concurrent delete.
                debug!("Failed to stat {}: {e}", entry.path().display());
                continue;
            }
        };

        let info = FileInfo::new(rel, &metadata);
        let path = info.path.clone();
        if tree.insert(info).is_none() {
            added.push(path);
        }
    }

    debug!(
        "Scanned {} ({} new entries) in {:?}",
        base.display(),
        added.len(),
        start.elapsed()
    );

    Ok(added)
}
