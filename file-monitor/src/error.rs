//! Error types for the file monitor.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Result type alias for monitor operations.
pub type Result<T> = std::result::Result<T, MonitorError>;

/// Errors that can occur while registering or running a watch.
#[derive(Error, Debug)]
pub enum MonitorError {
    /// Directory not found.
    #[error("directory not found: {0}")]
    DirectoryNotFound(String),

    /// Path exists but is not a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Permission denied.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The scanner could not read the root of a subtree.
    #[error("failed to scan {}: {source}", path.display())]
    Scan {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The watched root disappeared while being monitored.
    #[error("watched directory was removed: {0}")]
    RootRemoved(String),

    /// The monitor has been stopped and accepts no new work.
    #[error("file monitor is stopped")]
    Stopped,

    /// `stop()` was called from inside a callback.
    #[error("stop() cannot be called from the monitor loop")]
    StopFromMonitorLoop,

    /// The subscription was cancelled before the operation completed.
    #[error("subscription cancelled")]
    Cancelled,

    /// Notify error.
    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl MonitorError {
    /// Map an IO failure on a watched root to the matching variant.
    pub fn from_root_io(path: &Path, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::DirectoryNotFound(path.display().to_string()),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(path.display().to_string()),
            _ => Self::Scan {
                path: path.to_path_buf(),
                source: err,
            },
        }
    }
}
