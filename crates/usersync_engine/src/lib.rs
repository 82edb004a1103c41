//! # usersync Engine
//!
//! Per-resource user-data synchronization engine.
//!
//! Each [`Synchronizer`] reconciles one kind of user state (settings,
//! keybindings, snippets, …) between the local machine and a remote store
//! shared across a user's machines, via a three-way merge against the last
//! successfully synchronized state.
//!
//! This crate provides:
//! - The `Idle`/`Syncing`/`HasConflicts` status machine with event feeds
//! - The single cancellable in-flight preview
//! - The reconciliation driver with optimistic-concurrency retry
//! - The [`SyncStrategy`] surface a concrete resource implements
//! - Seams for the remote store, local backup store, file service and
//!   enablement flags, each with an in-memory implementation
//! - A debounced local-change coalescer for file-backed resources
//!
//! ## Key Invariants
//!
//! - At most one preview exists; it is cleared on apply, error, and stop
//! - The conflict list is non-empty exactly while status is `HasConflicts`
//! - Status transitions emit exactly one event each
//! - A disabled synchronizer makes no remote requests

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backup;
mod cancel;
mod config;
mod disk;
mod engine;
mod error;
mod files;
mod lastsync;
mod remote;
mod status;
mod strategy;
mod watch;

pub use backup::{BackupStore, InMemoryBackupStore};
pub use cancel::CancellationToken;
pub use config::{AlwaysEnabled, ResourceEnablement, SyncConfig, ToggleEnablement};
pub use disk::DiskFileService;
pub use engine::Synchronizer;
pub use error::{SyncError, SyncResult};
pub use files::{
    FileChangeEvent, FileContent, FileError, FileResult, FileService, FileVersion,
    InMemoryFileService,
};
pub use lastsync::LastSyncStore;
pub use remote::{
    InMemoryRemoteStore, RefRecord, RemoteRequest, RemoteStore, SyncHeaders, UserContent,
};
pub use status::{EventFeed, StatusTracker, SyncStatus};
pub use strategy::{SyncPreview, SyncServices, SyncStrategy};
pub use watch::ResourceWatcher;
