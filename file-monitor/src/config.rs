//! Configuration types for the file monitor.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use wildmatch::WildMatch;

use crate::error::{MonitorError, Result};

/// Default number of raw records a subscription queues before overflowing.
pub const DEFAULT_BUFFER_CAPACITY: usize = 4096;

/// Default interval `stop()` sleeps between checks of the request counter.
pub const DEFAULT_STOP_POLL_INTERVAL_MS: u64 = 100;

/// Configuration shared by every watch of a [`crate::FileMonitor`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Maximum raw notification records held per subscription while the
    /// monitor loop is busy. Exceeding it drops the queue and forces a
    /// full rescan of the watched root.
    pub buffer_capacity: usize,

    /// How long `stop()` sleeps between checks for drained requests.
    pub stop_poll_interval_ms: u64,

    /// Wildcard patterns matched against `/`-separated relative paths.
    pub exclude_patterns: Vec<String>,

    /// Whether the scanner follows symbolic links.
    pub follow_symlinks: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            stop_poll_interval_ms: DEFAULT_STOP_POLL_INTERVAL_MS,
            exclude_patterns: Vec::new(),
            follow_symlinks: false,
        }
    }
}

impl MonitorConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-subscription buffer capacity.
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    /// Set the `stop()` polling interval.
    pub fn with_stop_poll_interval(mut self, interval: Duration) -> Self {
        let millis = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        // Sub-millisecond intervals round up rather than becoming zero.
        self.stop_poll_interval_ms = if millis == 0 && !interval.is_zero() {
            1
        } else {
            millis
        };
        self
    }

    /// Add an exclude pattern.
    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.exclude_patterns.push(pattern.into());
        self
    }

    /// Enable following symbolic links.
    pub fn follow_symlinks(mut self) -> Self {
        self.follow_symlinks = true;
        self
    }

    /// The `stop()` polling interval as a [`Duration`].
    pub fn stop_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stop_poll_interval_ms)
    }

    /// Reject values the monitor loop cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_capacity == 0 {
            return Err(MonitorError::Config(
                "buffer_capacity must be at least 1".to_string(),
            ));
        }
        if self.stop_poll_interval_ms == 0 {
            return Err(MonitorError::Config(
                "stop_poll_interval_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Compile the exclude patterns into a matcher.
    pub fn excludes(&self) -> Excludes {
        Excludes {
            patterns: self
                .exclude_patterns
                .iter()
                .map(|p| WildMatch::new(p.as_str()))
                .collect(),
        }
    }
}

/// Compiled exclude patterns.
///
/// Both the scanner and the reconciliation engine consult the same matcher
/// so a full scan and an incremental patch never disagree about which
/// entries belong to the tree.
#[derive(Debug, Clone, Default)]
pub struct Excludes {
    patterns: Vec<WildMatch>,
}

impl Excludes {
    /// Check whether a root-relative path is excluded.
    pub fn is_excluded(&self, relative: &Path) -> bool {
        if self.patterns.is_empty() {
            return false;
        }

        let normalized = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        self.patterns.iter().any(|p| p.matches(&normalized))
    }
}
