//! Platform backends and the pending-read protocol shared by all of them.
//!
//! A backend only has to push raw records into a [`NotificationSink`]. The
//! sink models the OS side of a completion-based read:
//!
//! - The monitor loop lends the subscription a single [`ReadBuffer`] with
//!   [`Subscription::arm`]. While armed, the buffer belongs to the
//!   subscription and the loop holds no reference to it.
//! - Records that arrive while no read is armed wait in a bounded queue.
//!   When the queue fills up it is discarded and the next completion reports
//!   an overflow instead of records.
//! - As soon as an armed read has something to report, the buffer travels
//!   back to the loop inside a [`Completion`].
//! - [`Subscription::cancel`] closes the OS watch and emits exactly one
//!   terminal [`CompletionStatus::Aborted`]. Nothing is delivered for the
//!   subscription after that, and its resources may only be released once
//!   the loop has seen it.

mod notify_backend;

pub use notify_backend::NotifyBackend;

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::{MonitorError, Result};
use crate::event::RawNotificationRecord;
use crate::monitor::WatchHandle;

/// An OS facility that can report changes below a directory.
pub trait Backend: Send + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Start delivering notifications for `root` into `sink`.
    ///
    /// Fails if the path cannot be opened for watching. The returned watch
    /// keeps the OS subscription alive until it is closed or dropped.
    fn subscribe(
        &mut self,
        root: &Path,
        recursive: bool,
        sink: NotificationSink,
    ) -> Result<Box<dyn BackendWatch>>;
}

/// A live OS-level subscription.
pub trait BackendWatch: Send {
    /// Stop the OS from producing further notifications.
    fn close(&mut self) -> Result<()>;
}

/// The buffer a read is performed into.
///
/// There is exactly one per subscription and it cannot be cloned, so it is
/// always either armed inside the subscription or being parsed by the loop.
#[derive(Debug)]
pub struct ReadBuffer {
    records: Vec<RawNotificationRecord>,
}

impl ReadBuffer {
    /// Create an empty buffer sized for `capacity` records.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Vec::with_capacity(capacity),
        }
    }

    /// Number of records transferred into the buffer.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing was transferred.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Move the transferred records out, leaving the buffer ready to re-arm.
    pub fn take_records(&mut self) -> Vec<RawNotificationRecord> {
        self.records.drain(..).collect()
    }
}

/// A finished read, delivered to the monitor loop.
#[derive(Debug)]
pub struct Completion {
    /// The watch the read belonged to.
    pub handle: WatchHandle,

    /// How the read finished.
    pub status: CompletionStatus,
}

/// Outcome of a read.
#[derive(Debug)]
pub enum CompletionStatus {
    /// Records were transferred into the buffer.
    Notifications(ReadBuffer),

    /// Zero records transferred: notifications were dropped and the
    /// subtree must be rescanned.
    Overflow(ReadBuffer),

    /// The backend reported an error after registration.
    Failed(ReadBuffer, MonitorError),

    /// Terminal completion after cancellation. Carries the buffer back if
    /// it was armed at the time.
    Aborted(Option<ReadBuffer>),
}

/// Count of subscriptions whose terminal completion has not been processed.
///
/// `stop()` waits for this to reach zero so no asynchronous operation
/// outlives shutdown.
#[derive(Debug, Clone, Default)]
pub struct ActiveRequests(Arc<AtomicUsize>);

impl ActiveRequests {
    /// Create a counter starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current number of outstanding subscriptions.
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.0.store(0, Ordering::SeqCst);
    }

    pub(crate) fn increment(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn decrement(&self) {
        let previous = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if previous.is_err() {
            warn!("Active request counter underflow");
        }
    }
}

/// State shared between a backend's producer thread and the monitor loop.
#[derive(Debug)]
struct ReadSlot {
    /// Records waiting for the next armed read.
    queue: Vec<RawNotificationRecord>,

    /// Maximum length of `queue`.
    capacity: usize,

    /// Records were dropped since the last completion.
    overflowed: bool,

    /// Backend failure waiting to be reported.
    failure: Option<MonitorError>,

    /// The armed buffer, if a read is outstanding.
    armed: Option<ReadBuffer>,

    /// Set once by cancellation; nothing is delivered afterwards.
    cancelled: bool,
}

impl ReadSlot {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Vec::new(),
            capacity,
            overflowed: false,
            failure: None,
            armed: None,
            cancelled: false,
        }
    }

    /// Complete the armed read if there is anything to report.
    fn try_complete(&mut self) -> Option<CompletionStatus> {
        if self.cancelled {
            return None;
        }
        let mut buffer = self.armed.take()?;

        if self.overflowed {
            self.overflowed = false;
            self.queue.clear();
            return Some(CompletionStatus::Overflow(buffer));
        }

        if !self.queue.is_empty() {
            buffer.records.append(&mut self.queue);
            return Some(CompletionStatus::Notifications(buffer));
        }

        if let Some(error) = self.failure.take() {
            return Some(CompletionStatus::Failed(buffer, error));
        }

        self.armed = Some(buffer);
        None
    }
}

#[derive(Debug)]
struct Channel {
    handle: WatchHandle,
    slot: Mutex<ReadSlot>,
    completions: mpsc::UnboundedSender<Completion>,
}

impl Channel {
    fn lock(&self) -> MutexGuard<'_, ReadSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send a completion while still holding the slot lock, so completions
    /// of one subscription reach the loop in the order they were produced.
    fn complete(&self, slot: &mut ReadSlot) {
        if let Some(status) = slot.try_complete() {
            self.send(status);
        }
    }

    fn send(&self, status: CompletionStatus) {
        let completion = Completion {
            handle: self.handle,
            status,
        };
        if self.completions.send(completion).is_err() {
            debug!("Monitor loop gone; dropping completion for {}", self.handle);
        }
    }
}

/// Producer side of a subscription, handed to the [`Backend`].
#[derive(Debug, Clone)]
pub struct NotificationSink {
    channel: Arc<Channel>,
}

impl NotificationSink {
    /// Queue raw records, completing the armed read if there is one.
    pub fn deliver(&self, records: impl IntoIterator<Item = RawNotificationRecord>) {
        let mut slot = self.channel.lock();
        if slot.cancelled {
            return;
        }

        for record in records {
            if slot.overflowed {
                break;
            }
            if slot.queue.len() >= slot.capacity {
                debug!("Notification queue for {} overflowed", self.channel.handle);
                slot.overflowed = true;
                slot.queue.clear();
                break;
            }
            trace!("Queued {:?} {}", record.action, record.path.display());
            slot.queue.push(record);
        }

        self.channel.complete(&mut slot);
    }

    /// Report that the OS dropped notifications.
    pub fn overflow(&self) {
        let mut slot = self.channel.lock();
        if slot.cancelled {
            return;
        }
        slot.overflowed = true;
        slot.queue.clear();
        self.channel.complete(&mut slot);
    }

    /// Report a backend failure. It is delivered after any queued records.
    pub fn fail(&self, error: MonitorError) {
        let mut slot = self.channel.lock();
        if slot.cancelled {
            return;
        }
        if slot.failure.is_none() {
            slot.failure = Some(error);
        }
        self.channel.complete(&mut slot);
    }

    /// Whether the subscription has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.channel.lock().cancelled
    }
}

/// Consumer side of a subscription, owned by the monitor loop.
pub struct Subscription {
    channel: Arc<Channel>,
    watch: Option<Box<dyn BackendWatch>>,
}

impl Subscription {
    /// Subscribe `root` through `backend` and count the new request.
    pub fn open(
        handle: WatchHandle,
        backend: &mut dyn Backend,
        root: &Path,
        recursive: bool,
        capacity: usize,
        completions: mpsc::UnboundedSender<Completion>,
        requests: &ActiveRequests,
    ) -> Result<Self> {
        let channel = Arc::new(Channel {
            handle,
            slot: Mutex::new(ReadSlot::new(capacity)),
            completions,
        });

        let sink = NotificationSink {
            channel: Arc::clone(&channel),
        };
        let watch = backend.subscribe(root, recursive, sink)?;
        requests.increment();

        debug!(
            "Opened {} subscription for {} ({})",
            backend.name(),
            root.display(),
            handle
        );

        Ok(Self {
            channel,
            watch: Some(watch),
        })
    }

    /// Hand `buffer` to the subscription for the next read.
    ///
    /// Completes immediately if notifications are already waiting.
    pub fn arm(&self, buffer: ReadBuffer) -> Result<()> {
        let mut slot = self.channel.lock();
        if slot.cancelled {
            return Err(MonitorError::Cancelled);
        }
        debug_assert!(slot.armed.is_none(), "a read is already outstanding");

        slot.armed = Some(buffer);
        self.channel.complete(&mut slot);
        Ok(())
    }

    /// Cancel the subscription.
    ///
    /// Closes the OS watch and emits the terminal `Aborted` completion.
    /// Calling it again is a no-op.
    pub fn cancel(&mut self) {
        if let Some(mut watch) = self.watch.take() {
            if let Err(e) = watch.close() {
                debug!("Closing watch for {} failed: {e}", self.channel.handle);
            }
        }

        let mut slot = self.channel.lock();
        if slot.cancelled {
            return;
        }
        slot.cancelled = true;
        slot.queue.clear();
        slot.failure = None;

        let buffer = slot.armed.take();
        self.channel.send(CompletionStatus::Aborted(buffer));
    }

    /// Whether [`Subscription::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        self.channel.lock().cancelled
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.is_cancelled() {
            warn!(
                "Subscription for {} dropped without cancellation",
                self.channel.handle
            );
            self.cancel();
        }
    }
}
