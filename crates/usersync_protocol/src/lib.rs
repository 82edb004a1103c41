//! # usersync Protocol
//!
//! Wire and persistence types for the usersync engine.
//!
//! This crate provides:
//! - `SyncData` envelope with strict-shape JSON codec
//! - `SyncResource` kinds and the server manifest
//! - Backup handle naming (`user-data-sync://` URIs)
//! - The persisted last-sync record with a forward-compat extras bag
//! - Conflict pairs exposed to conflict-resolution UIs
//!
//! This is a pure data crate with no I/O operations.
//!
//! ## Key Invariants
//!
//! - An envelope is recognized only if it carries exactly the keys
//!   `{version, content}` or `{version, machineId, content}`
//! - Unknown keys in a last-sync record survive a parse/serialize round trip
//! - A backup handle's ref is always the final path segment of its URI

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod envelope;
mod error;
mod handle;
mod lastsync;
mod manifest;
mod resource;

pub use conflict::{same_conflicts, Conflict};
pub use envelope::{RemoteUserData, SyncData};
pub use error::{ProtocolError, ProtocolResult};
pub use handle::{
    backup_handle_uri, parse_backup_handle, BackupKind, SyncResourceHandle, HANDLE_SCHEME,
    LOCAL_BACKUP_AUTHORITY, REMOTE_BACKUP_AUTHORITY,
};
pub use lastsync::LastSyncUserData;
pub use manifest::SyncManifest;
pub use resource::SyncResource;
