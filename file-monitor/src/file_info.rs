//! Metadata for a single entry of a watched subtree.

use std::cmp::Ordering;
use std::fs::Metadata;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata recorded for one file or directory.
///
/// Equality, ordering and hashing only look at `path`, compared component
/// by component. Two snapshots of the same entry are therefore "equal" even
/// when their metadata differs; use [`FileInfo::metadata_differs`] to detect
/// modifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    /// Path relative to the watched root.
    pub path: PathBuf,

    /// Whether the entry is a directory.
    pub is_directory: bool,

    /// Last write time, if the platform reports one.
    pub last_write_time: Option<DateTime<Utc>>,

    /// Size in bytes (always 0 for directories).
    pub size: u64,
}

impl FileInfo {
    /// Create an entry from already collected metadata.
    pub fn new(path: impl Into<PathBuf>, metadata: &Metadata) -> Self {
        let is_directory = metadata.is_dir();

        Self {
            path: path.into(),
            is_directory,
            last_write_time: metadata.modified().ok().map(DateTime::<Utc>::from),
            size: if is_directory { 0 } else { metadata.len() },
        }
    }

    /// Stat `root.join(relative)` and record it under `relative`.
    ///
    /// Symbolic links are described as themselves unless `follow_symlinks`
    /// is set, matching what the scanner records for them.
    pub fn stat(
        root: &Path,
        relative: impl Into<PathBuf>,
        follow_symlinks: bool,
    ) -> std::io::Result<Self> {
        let relative = relative.into();
        let absolute = root.join(&relative);
        let metadata = if follow_symlinks {
            std::fs::metadata(absolute)?
        } else {
            std::fs::symlink_metadata(absolute)?
        };
        Ok(Self::new(relative, &metadata))
    }

    /// Whether `other` describes a modified version of this entry.
    ///
    /// Files differ when their write time or size changed. Directories only
    /// differ from non-directories; a directory's own write time moves with
    /// child churn and is not tracked as a modification.
    pub fn metadata_differs(&self, other: &FileInfo) -> bool {
        if self.is_directory != other.is_directory {
            return true;
        }
        if self.is_directory {
            return false;
        }
        self.last_write_time != other.last_write_time || self.size != other.size
    }
}

impl PartialEq for FileInfo {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for FileInfo {}

impl PartialOrd for FileInfo {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FileInfo {
    fn cmp(&self, other: &Self) -> Ordering {
        // `Path` ordering is component-wise, which yields a pre-order walk
        // with sorted siblings: "a" < "a/b" < "a.txt".
        self.path.cmp(&other.path)
    }
}

impl Hash for FileInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn info(path: &str, size: u64) -> FileInfo {
        FileInfo {
            path: PathBuf::from(path),
            is_directory: false,
            last_write_time: None,
            size,
        }
    }

    #[test]
    fn test_ordering_is_component_wise() {
        let mut entries = vec![info("a.txt", 0), info("a/b", 0), info("a", 0), info("B", 0)];
        entries.sort();

        let paths: Vec<_> = entries.iter().map(|e| e.path.to_string_lossy().to_string()).collect();
        assert_eq!(paths, vec!["B", "a", "a/b", "a.txt"]);
    }

    #[test]
    fn test_equality_ignores_metadata() {
        let a = info("x.txt", 1);
        let b = info("x.txt", 2);

        assert_eq!(a, b);
        assert!(a.metadata_differs(&b));
    }

    #[test]
    fn test_directories_ignore_write_time() {
        let mut a = info("dir", 0);
        a.is_directory = true;
        let mut b = a.clone();
        b.last_write_time = Some(Utc::now());

        assert!(!a.metadata_differs(&b));

        let file = info("dir", 0);
        assert!(a.metadata_differs(&file));
    }

    #[test]
    fn test_stat_reads_metadata() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("hello.txt"), "hello").unwrap();
        fs::create_dir(temp_dir.path().join("sub")).unwrap();

        let file = FileInfo::stat(temp_dir.path(), "hello.txt", false).unwrap();
        assert_eq!(file.size, 5);
        assert!(!file.is_directory);
        assert!(file.last_write_time.is_some());

        let dir = FileInfo::stat(temp_dir.path(), "sub", false).unwrap();
        assert!(dir.is_directory);
        assert_eq!(dir.size, 0);

        assert!(FileInfo::stat(temp_dir.path(), "missing", false).is_err());
    }
}
