//! Cross-platform backend built on the `notify` crate.

use std::path::{Path, PathBuf};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, error};

use crate::backend::{Backend, BackendWatch, NotificationSink};
use crate::error::{MonitorError, Result};
use crate::event::RawNotificationRecord;

/// Backend that uses the platform's recommended `notify` watcher
/// (inotify, FSEvents, ReadDirectoryChangesW, kqueue).
#[derive(Debug, Default)]
pub struct NotifyBackend;

impl NotifyBackend {
    /// Create a new backend.
    pub fn new() -> Self {
        Self
    }
}

impl Backend for NotifyBackend {
    fn name(&self) -> &'static str {
        "notify"
    }

    fn subscribe(
        &mut self,
        root: &Path,
        recursive: bool,
        sink: NotificationSink,
    ) -> Result<Box<dyn BackendWatch>> {
        let event_root = root.to_path_buf();

        let mut watcher = notify::recommended_watcher(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    if event.need_rescan() {
                        debug!("Rescan requested for {}", event_root.display());
                        sink.overflow();
                        return;
                    }

                    let records = RawNotificationRecord::from_notify(&event_root, &event);
                    if !records.is_empty() {
                        sink.deliver(records);
                    }
                }
                Err(e) => {
                    error!("Watch error for {}: {e}", event_root.display());
                    sink.fail(MonitorError::Notify(e));
                }
            },
        )?;

        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher.watch(root, mode)?;

        debug!("Started watching: {}", root.display());

        Ok(Box::new(NotifyWatch {
            watcher: Some(watcher),
            root: root.to_path_buf(),
        }))
    }
}

struct NotifyWatch {
    watcher: Option<RecommendedWatcher>,
    root: PathBuf,
}

impl BackendWatch for NotifyWatch {
    fn close(&mut self) -> Result<()> {
        if let Some(mut watcher) = self.watcher.take() {
            // The OS may already have dropped the watch (e.g. the root was
            // deleted); dropping the watcher still releases everything.
            watcher.unwatch(&self.root)?;
            debug!("Stopped watching: {}", self.root.display());
        }
        Ok(())
    }
}
