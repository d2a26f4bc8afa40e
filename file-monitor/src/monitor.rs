//! The file monitor: a registry of watches driven by one monitor loop.
//!
//! Every backend call and every snapshot mutation happens on a dedicated
//! thread running a single-threaded scheduler. Callers only talk to it
//! through a command queue, and hear back through [`MonitorCallbacks`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread::{JoinHandle, ThreadId};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::backend::{
    ActiveRequests, Backend, Completion, CompletionStatus, NotifyBackend, ReadBuffer, Subscription,
};
use crate::callbacks::MonitorCallbacks;
use crate::config::MonitorConfig;
use crate::error::{MonitorError, Result};
use crate::event::{RawAction, RawNotificationRecord};
use crate::reconcile::{BatchOutcome, reconcile_batch, reconcile_overflow};
use crate::scanner::{self, ScanOptions};
use crate::tree::SnapshotTree;

/// Opaque identifier of one watch. Never reused within a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WatchHandle(u64);

impl WatchHandle {
    /// Wrap a raw id.
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// The raw id.
    pub fn id(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "watch#{}", self.0)
    }
}

/// Requests queued for the monitor loop.
enum Command {
    Register {
        handle: WatchHandle,
        path: PathBuf,
        recursive: bool,
        callbacks: Box<dyn MonitorCallbacks>,
    },
    Unregister(WatchHandle),
    Stop {
        ack: std::sync::mpsc::Sender<()>,
    },
    Shutdown,
}

/// Recursive directory monitor.
///
/// ```no_run
/// use codex_file_monitor::{ChannelCallbacks, FileMonitor, MonitorConfig};
///
/// # fn main() -> codex_file_monitor::Result<()> {
/// let monitor = FileMonitor::start(MonitorConfig::default())?;
/// let (callbacks, _events) = ChannelCallbacks::new();
/// let handle = monitor.register("/some/dir", true, callbacks)?;
/// // ... consume events ...
/// monitor.unregister(handle)?;
/// monitor.stop()?;
/// # Ok(())
/// # }
/// ```
pub struct FileMonitor {
    config: MonitorConfig,
    commands: mpsc::UnboundedSender<Command>,
    next_handle: AtomicU64,
    stopping: AtomicBool,
    requests: ActiveRequests,
    thread: Mutex<Option<JoinHandle<()>>>,
    loop_thread: ThreadId,
}

impl FileMonitor {
    /// Start a monitor using the platform's native notifications.
    pub fn start(config: MonitorConfig) -> Result<Self> {
        Self::with_backend(config, NotifyBackend::new())
    }

    /// Start a monitor on top of a specific backend.
    pub fn with_backend(config: MonitorConfig, backend: impl Backend) -> Result<Self> {
        config.validate()?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let requests = ActiveRequests::new();

        let monitor_loop = MonitorLoop {
            backend: Box::new(backend),
            scan_options: ScanOptions::from(&config),
            buffer_capacity: config.buffer_capacity,
            watches: HashMap::new(),
            commands: commands_rx,
            completions: completions_rx,
            completions_tx,
            requests: requests.clone(),
            accepting: true,
        };

        let thread = std::thread::Builder::new()
            .name("file-monitor".to_string())
            .spawn(move || runtime.block_on(monitor_loop.run()))?;
        let loop_thread = thread.thread().id();

        info!("File monitor started");

        Ok(Self {
            config,
            commands: commands_tx,
            next_handle: AtomicU64::new(1),
            stopping: AtomicBool::new(false),
            requests,
            thread: Mutex::new(Some(thread)),
            loop_thread,
        })
    }

    /// Start watching `path`.
    ///
    /// Returns the new handle immediately. The outcome is reported through
    /// exactly one of `on_registered` or `on_registration_error`.
    pub fn register(
        &self,
        path: impl Into<PathBuf>,
        recursive: bool,
        callbacks: impl MonitorCallbacks,
    ) -> Result<WatchHandle> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(MonitorError::Stopped);
        }

        let handle = WatchHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.commands
            .send(Command::Register {
                handle,
                path: path.into(),
                recursive,
                callbacks: Box::new(callbacks),
            })
            .map_err(|_| MonitorError::Stopped)?;

        Ok(handle)
    }

    /// Stop watching. Returns immediately; the watch is released once the
    /// backend confirms cancellation.
    pub fn unregister(&self, handle: WatchHandle) -> Result<()> {
        self.commands
            .send(Command::Unregister(handle))
            .map_err(|_| MonitorError::Stopped)
    }

    /// Stop accepting registrations, cancel every watch and block until
    /// all of them are confirmed released.
    ///
    /// Calling it again is a no-op. Calling it from a callback is an error,
    /// since the loop could never drain.
    pub fn stop(&self) -> Result<()> {
        if std::thread::current().id() == self.loop_thread {
            return Err(MonitorError::StopFromMonitorLoop);
        }

        let mut thread = self.thread.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(join_handle) = thread.take() else {
            return Ok(());
        };

        self.stopping.store(true, Ordering::SeqCst);
        info!("Stopping file monitor");

        let (ack_tx, ack_rx) = std::sync::mpsc::channel();
        if self.commands.send(Command::Stop { ack: ack_tx }).is_ok() && ack_rx.recv().is_ok() {
            let interval = self.config.stop_poll_interval();
            while self.requests.get() > 0 {
                debug!("Waiting for {} outstanding requests", self.requests.get());
                std::thread::sleep(interval);
            }
        }

        let _ = self.commands.send(Command::Shutdown);
        if join_handle.join().is_err() {
            error!("File monitor loop panicked");
        }

        info!("File monitor stopped");
        Ok(())
    }

    /// Subscriptions not yet confirmed released.
    pub fn active_requests(&self) -> usize {
        self.requests.get()
    }
}

impl Drop for FileMonitor {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Failed to stop file monitor on drop: {e}");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchState {
    Active,
    Cancelling,
}

/// Everything the loop owns for one watch.
struct WatchContext {
    handle: WatchHandle,
    recursive: bool,
    tree: SnapshotTree,
    subscription: Subscription,
    callbacks: Box<dyn MonitorCallbacks>,
    state: WatchState,
}

impl WatchContext {
    fn deliver(&mut self, outcome: BatchOutcome) {
        if self.state != WatchState::Active {
            return;
        }

        if !outcome.events.is_empty() {
            debug!("{}: {} change events", self.handle, outcome.events.len());
            self.callbacks.on_files_changed(self.handle, &outcome.events);
        }

        if outcome.root_removed {
            let root = self.tree.root().display().to_string();
            self.fail(MonitorError::RootRemoved(root));
        }
    }

    /// Report a fatal error for this watch and unregister it.
    fn fail(&mut self, error: MonitorError) {
        if self.state != WatchState::Active {
            return;
        }

        error!("Monitoring {} failed: {error}", self.tree.root().display());
        self.callbacks.on_monitoring_error(self.handle, error);
        self.cancel();
    }

    fn cancel(&mut self) {
        if self.state == WatchState::Active {
            self.subscription.cancel();
            self.state = WatchState::Cancelling;
        }
    }
}

struct MonitorLoop {
    backend: Box<dyn Backend>,
    scan_options: ScanOptions,
    buffer_capacity: usize,
    watches: HashMap<WatchHandle, WatchContext>,
    commands: mpsc::UnboundedReceiver<Command>,
    completions: mpsc::UnboundedReceiver<Completion>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    requests: ActiveRequests,
    accepting: bool,
}

impl MonitorLoop {
    async fn run(mut self) {
        self.requests.reset();
        debug!("Monitor loop running ({} backend)", self.backend.name());

        loop {
            tokio::select! {
                biased;

                Some(completion) = self.completions.recv() => self.on_completion(completion),
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },
            }
        }

        self.drain();
        debug!("Monitor loop exited");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Register {
                handle,
                path,
                recursive,
                callbacks,
            } => self.register(handle, &path, recursive, callbacks),
            Command::Unregister(handle) => self.unregister(handle),
            Command::Stop { ack } => {
                self.accepting = false;
                let handles: Vec<WatchHandle> = self.watches.keys().copied().collect();
                for handle in handles {
                    self.unregister(handle);
                }
                let _ = ack.send(());
            }
            Command::Shutdown => {}
        }
    }

    fn register(
        &mut self,
        handle: WatchHandle,
        path: &Path,
        recursive: bool,
        mut callbacks: Box<dyn MonitorCallbacks>,
    ) {
        if !self.accepting {
            callbacks.on_registration_error(handle, MonitorError::Stopped);
            return;
        }

        let root = match resolve_root(path) {
            Ok(root) => root,
            Err(e) => {
                warn!("Cannot watch {}: {e}", path.display());
                callbacks.on_registration_error(handle, e);
                return;
            }
        };

        let subscription = match Subscription::open(
            handle,
            self.backend.as_mut(),
            &root,
            recursive,
            self.buffer_capacity,
            self.completions_tx.clone(),
            &self.requests,
        ) {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!("Failed to subscribe to {}: {e}", root.display());
                callbacks.on_registration_error(handle, e);
                return;
            }
        };

        let mut context = WatchContext {
            handle,
            recursive,
            tree: SnapshotTree::new(&root),
            subscription,
            callbacks,
            state: WatchState::Active,
        };

        // Arm the first read before scanning so changes made while the scan
        // runs are queued rather than missed.
        let scanned = context
            .subscription
            .arm(ReadBuffer::with_capacity(self.buffer_capacity))
            .and_then(|()| scanner::scan(&root, recursive, &self.scan_options));

        match scanned {
            Ok(tree) => {
                info!(
                    "Registered {handle} for {} ({} entries)",
                    root.display(),
                    tree.len()
                );
                context.tree = tree;
                context.callbacks.on_registered(handle, &context.tree);
            }
            Err(e) => {
                warn!("Initial scan of {} failed: {e}", root.display());
                // The subscription stays in the registry until its
                // cancellation is confirmed.
                context.cancel();
                context.callbacks.on_registration_error(handle, e);
            }
        }

        self.watches.insert(handle, context);
    }

    fn unregister(&mut self, handle: WatchHandle) {
        match self.watches.get_mut(&handle) {
            Some(context) if context.state == WatchState::Active => {
                info!("Unregistering {handle} ({})", context.tree.root().display());
                context.cancel();
            }
            Some(_) => debug!("{handle} is already being cancelled"),
            None => debug!("Ignoring unregister for unknown {handle}"),
        }
    }

    fn on_completion(&mut self, completion: Completion) {
        let Completion { handle, status } = completion;

        if let CompletionStatus::Aborted(_) = status {
            if self.watches.remove(&handle).is_some() {
                self.requests.decrement();
                debug!("Released {handle}");
            } else {
                warn!("Aborted completion for unknown {handle}");
            }
            return;
        }

        let Some(context) = self.watches.get_mut(&handle) else {
            debug!("Dropping completion for unknown {handle}");
            return;
        };

        if context.state != WatchState::Active {
            // Raced with cancellation; the terminal completion follows.
            debug!("Discarding in-flight completion for cancelled {handle}");
            return;
        }

        match status {
            CompletionStatus::Notifications(mut buffer) => {
                trace!("{handle}: {} raw records", buffer.len());
                let records = buffer.take_records();
                // Re-arm before processing so nothing arriving meanwhile
                // is missed.
                let rearmed = context.subscription.arm(buffer);

                let outcome = reconcile_batch(
                    &mut context.tree,
                    records,
                    context.recursive,
                    &self.scan_options,
                );
                context.deliver(outcome);

                if let Err(e) = rearmed {
                    context.fail(e);
                }
            }
            CompletionStatus::Overflow(buffer) => {
                warn!(
                    "Change notifications for {} overflowed; rescanning",
                    context.tree.root().display()
                );
                let rearmed = context.subscription.arm(buffer);

                match reconcile_overflow(&mut context.tree, context.recursive, &self.scan_options)
                {
                    Ok(outcome) => context.deliver(outcome),
                    Err(e) => context.fail(e),
                }

                if let Err(e) = rearmed {
                    context.fail(e);
                }
            }
            CompletionStatus::Failed(_buffer, error) => {
                if !context.tree.root().is_dir() {
                    // Backends often fail because the root itself vanished;
                    // report that instead of the raw error.
                    let outcome = reconcile_batch(
                        &mut context.tree,
                        vec![RawNotificationRecord::new(RawAction::Removed, "")],
                        context.recursive,
                        &self.scan_options,
                    );
                    context.deliver(outcome);
                }
                context.fail(error);
            }
            CompletionStatus::Aborted(_) => {}
        }
    }

    /// Release whatever is left when the loop exits.
    fn drain(&mut self) {
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Register {
                handle,
                mut callbacks,
                ..
            } = command
            {
                callbacks.on_registration_error(handle, MonitorError::Stopped);
            }
        }

        for context in self.watches.values_mut() {
            context.cancel();
        }

        while let Ok(completion) = self.completions.try_recv() {
            if matches!(completion.status, CompletionStatus::Aborted(_))
                && self.watches.remove(&completion.handle).is_some()
            {
                self.requests.decrement();
            }
        }

        if !self.watches.is_empty() {
            warn!("{} watches still pending at shutdown", self.watches.len());
        }
    }
}

/// Canonicalize a root and make sure it is a directory.
fn resolve_root(path: &Path) -> Result<PathBuf> {
    let root = dunce::canonicalize(path).map_err(|e| MonitorError::from_root_io(path, e))?;
    if !root.is_dir() {
        return Err(MonitorError::NotADirectory(root.display().to_string()));
    }
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendWatch, NotificationSink};
    use crate::callbacks::{ChannelCallbacks, MonitorEvent};
    use crate::event::{ChangeEvent, ChangeKind};
    use pretty_assertions::assert_eq;
    use std::fs;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Backend whose notifications are injected by the test.
    #[derive(Clone, Default)]
    struct ScriptedBackend {
        sinks: Arc<Mutex<Vec<NotificationSink>>>,
        reject: bool,
    }

    impl ScriptedBackend {
        fn rejecting() -> Self {
            Self {
                reject: true,
                ..Self::default()
            }
        }

        fn sink(&self, index: usize) -> NotificationSink {
            self.sinks.lock().unwrap()[index].clone()
        }
    }

    struct ScriptedWatch;

    impl BackendWatch for ScriptedWatch {
        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    impl Backend for ScriptedBackend {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn subscribe(
            &mut self,
            root: &Path,
            _recursive: bool,
            sink: NotificationSink,
        ) -> Result<Box<dyn BackendWatch>> {
            if self.reject {
                return Err(MonitorError::PermissionDenied(root.display().to_string()));
            }
            self.sinks.lock().unwrap().push(sink);
            Ok(Box::new(ScriptedWatch))
        }
    }

    fn start(backend: &ScriptedBackend) -> FileMonitor {
        let config = MonitorConfig::new().with_stop_poll_interval(Duration::from_millis(5));
        FileMonitor::with_backend(config, backend.clone()).unwrap()
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<MonitorEvent>) -> MonitorEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for monitor event")
            .expect("monitor event channel closed")
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<MonitorEvent>) -> Vec<MonitorEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn summarize(events: &[ChangeEvent]) -> Vec<(ChangeKind, String)> {
        events
            .iter()
            .map(|e| (e.kind, e.path().to_string_lossy().replace('\\', "/")))
            .collect()
    }

    fn added(path: &str) -> RawNotificationRecord {
        RawNotificationRecord::new(RawAction::Added, path)
    }

    /// Holds the monitor loop inside `on_registered` until the test opens
    /// the gate, so several completions can be queued behind it.
    struct GatedCallbacks {
        inner: ChannelCallbacks,
        gate: std::sync::mpsc::Receiver<()>,
    }

    impl MonitorCallbacks for GatedCallbacks {
        fn on_registered(&mut self, handle: WatchHandle, tree: &SnapshotTree) {
            self.inner.on_registered(handle, tree);
            let _ = self.gate.recv();
        }

        fn on_registration_error(&mut self, handle: WatchHandle, error: MonitorError) {
            self.inner.on_registration_error(handle, error);
        }

        fn on_monitoring_error(&mut self, handle: WatchHandle, error: MonitorError) {
            self.inner.on_monitoring_error(handle, error);
        }

        fn on_files_changed(&mut self, handle: WatchHandle, events: &[ChangeEvent]) {
            self.inner.on_files_changed(handle, events);
        }
    }

    #[tokio::test]
    async fn test_register_delivers_initial_tree() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("existing.txt"), "x").unwrap();

        let backend = ScriptedBackend::default();
        let monitor = start(&backend);
        let (callbacks, mut rx) = ChannelCallbacks::new();

        let handle = monitor.register(temp_dir.path(), true, callbacks).unwrap();

        match next_event(&mut rx).await {
            MonitorEvent::Registered { handle: h, tree } => {
                assert_eq!(h, handle);
                assert_eq!(tree.len(), 1);
                assert!(tree.contains(Path::new("existing.txt")));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(monitor.active_requests(), 1);

        monitor.stop().unwrap();
        assert_eq!(monitor.active_requests(), 0);
    }

    #[tokio::test]
    async fn test_created_file_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let backend = ScriptedBackend::default();
        let monitor = start(&backend);
        let (callbacks, mut rx) = ChannelCallbacks::new();

        let handle = monitor.register(temp_dir.path(), true, callbacks).unwrap();
        assert!(matches!(next_event(&mut rx).await, MonitorEvent::Registered { .. }));

        fs::write(temp_dir.path().join("a.txt"), "hello").unwrap();
        backend.sink(0).deliver([added("a.txt")]);

        match next_event(&mut rx).await {
            MonitorEvent::FilesChanged { handle: h, events } => {
                assert_eq!(h, handle);
                assert_eq!(
                    summarize(&events),
                    vec![(ChangeKind::Added, "a.txt".to_string())]
                );
            }
            other => panic!("unexpected event: {other:?}"),
        }

        monitor.stop().unwrap();
    }

    #[tokio::test]
    async fn test_overflow_rescans_to_disk_state() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("old.txt"), "old").unwrap();

        let backend = ScriptedBackend::default();
        let monitor = start(&backend);
        let (callbacks, mut rx) = ChannelCallbacks::new();

        monitor.register(temp_dir.path(), true, callbacks).unwrap();
        assert!(matches!(next_event(&mut rx).await, MonitorEvent::Registered { .. }));

        fs::remove_file(temp_dir.path().join("old.txt")).unwrap();
        fs::create_dir(temp_dir.path().join("dir")).unwrap();
        fs::write(temp_dir.path().join("dir/new.txt"), "new").unwrap();
        backend.sink(0).overflow();

        match next_event(&mut rx).await {
            MonitorEvent::FilesChanged { events, .. } => {
                let mut summary = summarize(&events);
                summary.sort();
                assert_eq!(
                    summary,
                    vec![
                        (ChangeKind::Added, "dir".to_string()),
                        (ChangeKind::Added, "dir/new.txt".to_string()),
                        (ChangeKind::Removed, "old.txt".to_string()),
                    ]
                );
            }
            other => panic!("unexpected event: {other:?}"),
        }

        monitor.stop().unwrap();
    }

    #[tokio::test]
    async fn test_no_callbacks_after_unregister() {
        let temp_dir = TempDir::new().unwrap();
        let backend = ScriptedBackend::default();
        let monitor = start(&backend);
        let (callbacks, mut rx) = ChannelCallbacks::new();

        let handle = monitor.register(temp_dir.path(), true, callbacks).unwrap();
        assert!(matches!(next_event(&mut rx).await, MonitorEvent::Registered { .. }));

        let sink = backend.sink(0);
        monitor.unregister(handle).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !sink.is_cancelled() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("unregister was never processed");

        fs::write(temp_dir.path().join("late.txt"), "late").unwrap();
        sink.deliver([added("late.txt")]);
        sink.fail(MonitorError::Notify(notify::Error::generic("boom")));

        monitor.stop().unwrap();

        assert!(drain(&mut rx).is_empty());
        assert_eq!(monitor.active_requests(), 0);
    }

    #[tokio::test]
    async fn test_unregister_right_after_register() {
        let temp_dir = TempDir::new().unwrap();
        let backend = ScriptedBackend::default();
        let monitor = start(&backend);
        let (callbacks, mut rx) = ChannelCallbacks::new();

        let handle = monitor.register(temp_dir.path(), true, callbacks).unwrap();
        monitor.unregister(handle).unwrap();
        monitor.stop().unwrap();

        let outcomes: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| {
                matches!(
                    e,
                    MonitorEvent::Registered { .. } | MonitorEvent::RegistrationFailed { .. }
                )
            })
            .collect();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(monitor.active_requests(), 0);
    }

    #[tokio::test]
    async fn test_missing_directory_fails_registration() {
        let temp_dir = TempDir::new().unwrap();
        let backend = ScriptedBackend::default();
        let monitor = start(&backend);
        let (callbacks, mut rx) = ChannelCallbacks::new();

        let handle = monitor
            .register(temp_dir.path().join("missing"), true, callbacks)
            .unwrap();

        match next_event(&mut rx).await {
            MonitorEvent::RegistrationFailed { handle: h, error } => {
                assert_eq!(h, handle);
                assert!(matches!(error, MonitorError::DirectoryNotFound(_)));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(monitor.active_requests(), 0);

        monitor.stop().unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_failure_fails_registration() {
        let temp_dir = TempDir::new().unwrap();
        let backend = ScriptedBackend::rejecting();
        let monitor = start(&backend);
        let (callbacks, mut rx) = ChannelCallbacks::new();

        monitor.register(temp_dir.path(), true, callbacks).unwrap();

        assert!(matches!(
            next_event(&mut rx).await,
            MonitorEvent::RegistrationFailed {
                error: MonitorError::PermissionDenied(_),
                ..
            }
        ));
        monitor.stop().unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_watches_are_isolated() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let backend = ScriptedBackend::default();
        let monitor = start(&backend);
        let (callbacks_a, mut rx_a) = ChannelCallbacks::new();
        let (callbacks_b, mut rx_b) = ChannelCallbacks::new();

        monitor.register(dir_a.path(), true, callbacks_a).unwrap();
        assert!(matches!(next_event(&mut rx_a).await, MonitorEvent::Registered { .. }));
        monitor.register(dir_b.path(), true, callbacks_b).unwrap();
        assert!(matches!(next_event(&mut rx_b).await, MonitorEvent::Registered { .. }));

        fs::write(dir_a.path().join("only-a.txt"), "a").unwrap();
        backend.sink(0).deliver([added("only-a.txt")]);
        assert!(matches!(next_event(&mut rx_a).await, MonitorEvent::FilesChanged { .. }));

        monitor.stop().unwrap();
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn test_backend_failure_unregisters_watch() {
        let temp_dir = TempDir::new().unwrap();
        let backend = ScriptedBackend::default();
        let monitor = start(&backend);
        let (callbacks, mut rx) = ChannelCallbacks::new();

        let handle = monitor.register(temp_dir.path(), true, callbacks).unwrap();
        assert!(matches!(next_event(&mut rx).await, MonitorEvent::Registered { .. }));

        let sink = backend.sink(0);
        sink.fail(MonitorError::Notify(notify::Error::generic("boom")));

        match next_event(&mut rx).await {
            MonitorEvent::MonitoringFailed { handle: h, .. } => assert_eq!(h, handle),
            other => panic!("unexpected event: {other:?}"),
        }

        fs::write(temp_dir.path().join("after.txt"), "x").unwrap();
        sink.deliver([added("after.txt")]);
        assert!(sink.is_cancelled());

        monitor.stop().unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_completion_queued_behind_root_removal_is_discarded() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("file.txt"), "x").unwrap();

        let backend = ScriptedBackend::default();
        let monitor = start(&backend);
        let (inner, mut rx) = ChannelCallbacks::new();
        let (open_gate, gate) = std::sync::mpsc::channel();

        let handle = monitor
            .register(temp_dir.path(), true, GatedCallbacks { inner, gate })
            .unwrap();
        assert!(matches!(next_event(&mut rx).await, MonitorEvent::Registered { .. }));

        // The loop is parked in on_registered; both batches queue up.
        fs::remove_dir_all(temp_dir.path()).unwrap();
        let sink = backend.sink(0);
        sink.deliver([RawNotificationRecord::new(RawAction::Removed, "")]);
        sink.deliver([added("x")]);
        open_gate.send(()).unwrap();

        match next_event(&mut rx).await {
            MonitorEvent::FilesChanged { handle: h, events } => {
                assert_eq!(h, handle);
                assert_eq!(
                    summarize(&events),
                    vec![(ChangeKind::Removed, "file.txt".to_string())]
                );
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(
            next_event(&mut rx).await,
            MonitorEvent::MonitoringFailed {
                error: MonitorError::RootRemoved(_),
                ..
            }
        ));

        monitor.stop().unwrap();
        assert!(drain(&mut rx).is_empty());
        assert_eq!(monitor.active_requests(), 0);
    }

    #[tokio::test]
    async fn test_backend_failure_after_root_removal_reports_root_removed() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir(temp_dir.path().join("dir")).unwrap();
        fs::write(temp_dir.path().join("dir/file.txt"), "x").unwrap();

        let backend = ScriptedBackend::default();
        let monitor = start(&backend);
        let (callbacks, mut rx) = ChannelCallbacks::new();

        let handle = monitor.register(temp_dir.path(), true, callbacks).unwrap();
        assert!(matches!(next_event(&mut rx).await, MonitorEvent::Registered { .. }));

        fs::remove_dir_all(temp_dir.path()).unwrap();
        backend
            .sink(0)
            .fail(MonitorError::Notify(notify::Error::generic("boom")));

        match next_event(&mut rx).await {
            MonitorEvent::FilesChanged { handle: h, events } => {
                assert_eq!(h, handle);
                let mut summary = summarize(&events);
                summary.sort();
                assert_eq!(
                    summary,
                    vec![
                        (ChangeKind::Removed, "dir".to_string()),
                        (ChangeKind::Removed, "dir/file.txt".to_string()),
                    ]
                );
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match next_event(&mut rx).await {
            MonitorEvent::MonitoringFailed { handle: h, error } => {
                assert_eq!(h, handle);
                assert!(matches!(error, MonitorError::RootRemoved(_)));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        monitor.stop().unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_register_after_stop_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let backend = ScriptedBackend::default();
        let monitor = start(&backend);

        monitor.stop().unwrap();
        monitor.stop().unwrap();

        let (callbacks, _rx) = ChannelCallbacks::new();
        assert!(matches!(
            monitor.register(temp_dir.path(), true, callbacks),
            Err(MonitorError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_handles_are_never_reused() {
        let temp_dir = TempDir::new().unwrap();
        let backend = ScriptedBackend::default();
        let monitor = start(&backend);

        let (callbacks, mut rx) = ChannelCallbacks::new();
        let first = monitor.register(temp_dir.path(), true, callbacks.clone()).unwrap();
        monitor.unregister(first).unwrap();
        let second = monitor.register(temp_dir.path(), true, callbacks).unwrap();

        assert_ne!(first, second);
        assert!(second > first);

        // Unregistering the old handle again must not touch the new watch.
        monitor.unregister(first).unwrap();
        let mut registered = 0;
        while registered < 2 {
            if let MonitorEvent::Registered { .. } = next_event(&mut rx).await {
                registered += 1;
            }
        }
        assert_eq!(monitor.active_requests(), 1);

        monitor.stop().unwrap();
    }
}
