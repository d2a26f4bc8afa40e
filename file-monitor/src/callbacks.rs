//! Callbacks invoked by the monitor loop.

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::MonitorError;
use crate::event::ChangeEvent;
use crate::monitor::WatchHandle;
use crate::tree::SnapshotTree;

/// Receiver of everything that happens to one watch.
///
/// All methods run on the monitor loop. They must return quickly; blocking
/// inside a callback stalls every watch of the monitor.
pub trait MonitorCallbacks: Send + 'static {
    /// The watch is live; `tree` is its initial snapshot.
    fn on_registered(&mut self, handle: WatchHandle, tree: &SnapshotTree);

    /// The watch could not be established. No other callback follows.
    fn on_registration_error(&mut self, handle: WatchHandle, error: MonitorError);

    /// The watch failed after registration and has been unregistered.
    fn on_monitoring_error(&mut self, handle: WatchHandle, error: MonitorError);

    /// A batch was reconciled; `events` are in application order.
    fn on_files_changed(&mut self, handle: WatchHandle, events: &[ChangeEvent]);
}

/// Everything a watch reports, as a value.
#[derive(Debug)]
pub enum MonitorEvent {
    /// Registration succeeded.
    Registered {
        handle: WatchHandle,
        tree: SnapshotTree,
    },

    /// Registration failed.
    RegistrationFailed {
        handle: WatchHandle,
        error: MonitorError,
    },

    /// Monitoring failed and the watch was dropped.
    MonitoringFailed {
        handle: WatchHandle,
        error: MonitorError,
    },

    /// Files changed.
    FilesChanged {
        handle: WatchHandle,
        events: Vec<ChangeEvent>,
    },
}

impl MonitorEvent {
    /// The watch this event belongs to.
    pub fn handle(&self) -> WatchHandle {
        match self {
            Self::Registered { handle, .. }
            | Self::RegistrationFailed { handle, .. }
            | Self::MonitoringFailed { handle, .. }
            | Self::FilesChanged { handle, .. } => *handle,
        }
    }
}

/// Callbacks that forward into an unbounded channel.
///
/// Sending never blocks, so the monitor loop is never stalled by a slow
/// consumer. One instance can be cloned across several watches.
#[derive(Debug, Clone)]
pub struct ChannelCallbacks {
    tx: mpsc::UnboundedSender<MonitorEvent>,
}

impl ChannelCallbacks {
    /// Create callbacks together with the receiving end.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MonitorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: MonitorEvent) {
        if self.tx.send(event).is_err() {
            debug!("Monitor event receiver dropped");
        }
    }
}

impl MonitorCallbacks for ChannelCallbacks {
    fn on_registered(&mut self, handle: WatchHandle, tree: &SnapshotTree) {
        self.send(MonitorEvent::Registered {
            handle,
            tree: tree.clone(),
        });
    }

    fn on_registration_error(&mut self, handle: WatchHandle, error: MonitorError) {
        self.send(MonitorEvent::RegistrationFailed { handle, error });
    }

    fn on_monitoring_error(&mut self, handle: WatchHandle, error: MonitorError) {
        self.send(MonitorEvent::MonitoringFailed { handle, error });
    }

    fn on_files_changed(&mut self, handle: WatchHandle, events: &[ChangeEvent]) {
        self.send(MonitorEvent::FilesChanged {
            handle,
            events: events.to_vec(),
        });
    }
}
