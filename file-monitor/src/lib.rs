//! # File Monitor
//!
//! Recursive directory monitoring for Codex. Each watched root keeps an
//! in-memory snapshot of its tree, and every batch of native change
//! notifications is reconciled against that snapshot into precise
//! `Added`/`Removed`/`Modified` events.
//!
//! ## Features
//!
//! - **Snapshot Trees**: Sorted, path-keyed view of every watched entry
//! - **Reconciliation**: Raw notifications are checked against disk
//! - **Overflow Recovery**: Lost notifications trigger a rescan and diff
//! - **Safe Shutdown**: `stop()` waits for every subscription to be released
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         File Monitor                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  register ──► Command queue ──► MonitorLoop ──► MonitorCallbacks│
//! │                                   │    ▲                        │
//! │                                   ▼    │ Completion             │
//! │  Scanner ──► SnapshotTree      Subscription ◄── Backend (notify)│
//! │                  ▲                                              │
//! │                  └── Reconciler ◄── RawNotificationRecord       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod backend;
pub mod callbacks;
pub mod config;
pub mod error;
pub mod event;
pub mod file_info;
pub mod monitor;
pub mod reconcile;
pub mod scanner;
pub mod tree;

pub use backend::{Backend, BackendWatch, NotificationSink, NotifyBackend};
pub use callbacks::{ChannelCallbacks, MonitorCallbacks, MonitorEvent};
pub use config::MonitorConfig;
pub use error::{MonitorError, Result};
pub use event::{ChangeEvent, ChangeKind, RawAction, RawNotificationRecord, pair_renames};
pub use file_info::FileInfo;
pub use monitor::{FileMonitor, WatchHandle};
pub use scanner::{ScanOptions, scan};
pub use tree::SnapshotTree;
