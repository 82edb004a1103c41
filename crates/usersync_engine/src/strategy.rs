//! The strategy surface: what a concrete resource synchronizer provides,
//! and the engine utilities it builds on.

use crate::backup::BackupStore;
use crate::cancel::CancellationToken;
use crate::error::{SyncError, SyncResult};
use crate::files::{FileContent, FileError, FileService};
use crate::lastsync::LastSyncStore;
use crate::remote::{RemoteStore, SyncHeaders};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use url::Url;
use usersync_protocol::{Conflict, LastSyncUserData, RemoteUserData, SyncData, SyncResource};

/// A strategy-produced three-way-merge result, pending application.
///
/// The engine treats a preview by its flags; everything else is owned by the
/// strategy that produced it.
#[derive(Debug, Clone)]
pub struct SyncPreview {
    /// The remote view the preview was generated against.
    pub remote_user_data: RemoteUserData,
    /// The common ancestor the preview was generated against.
    pub last_sync_user_data: Option<LastSyncUserData>,
    /// Snapshot of the local file at generation time (file-backed
    /// strategies).
    pub local_file: Option<FileContent>,
    /// The merged candidate content, if the merge produced one.
    pub merged_content: Option<String>,
    /// True if applying would change local state.
    pub has_local_changed: bool,
    /// True if applying would change remote state.
    pub has_remote_changed: bool,
    /// True if the merge needs user resolution before it can apply.
    pub has_conflicts: bool,
    /// True if the last-sync envelope was produced by this machine.
    pub is_last_sync_from_current_machine: bool,
    /// The unresolved pairs, non-empty exactly when `has_conflicts`.
    pub conflicts: Vec<Conflict>,
}

impl SyncPreview {
    /// Creates a preview with no changes and no conflicts.
    pub fn new(
        remote_user_data: RemoteUserData,
        last_sync_user_data: Option<LastSyncUserData>,
    ) -> Self {
        Self {
            remote_user_data,
            last_sync_user_data,
            local_file: None,
            merged_content: None,
            has_local_changed: false,
            has_remote_changed: false,
            has_conflicts: false,
            is_last_sync_from_current_machine: false,
            conflicts: Vec::new(),
        }
    }
}

/// Engine utilities handed to every strategy callback.
///
/// Strategies do not touch the stores directly; commits flow through these
/// primitives so the engine's precondition handling stays in one place.
pub struct SyncServices {
    resource: SyncResource,
    strategy_version: u32,
    machine_id: String,
    remote: Arc<dyn RemoteStore>,
    backup: Arc<dyn BackupStore>,
    files: Arc<dyn FileService>,
    last_sync: LastSyncStore,
    headers: Mutex<SyncHeaders>,
}

impl SyncServices {
    pub(crate) fn new(
        resource: SyncResource,
        strategy_version: u32,
        machine_id: String,
        remote: Arc<dyn RemoteStore>,
        backup: Arc<dyn BackupStore>,
        files: Arc<dyn FileService>,
        last_sync: LastSyncStore,
    ) -> Self {
        Self {
            resource,
            strategy_version,
            machine_id,
            remote,
            backup,
            files,
            last_sync,
            headers: Mutex::new(SyncHeaders::new()),
        }
    }

    /// The resource this engine instance synchronizes.
    pub fn resource(&self) -> SyncResource {
        self.resource
    }

    /// This machine's identifier.
    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    /// The file service.
    pub fn files(&self) -> &Arc<dyn FileService> {
        &self.files
    }

    /// The last-sync store for this resource.
    pub fn last_sync(&self) -> &LastSyncStore {
        &self.last_sync
    }

    /// Headers of the current sync invocation.
    pub fn headers(&self) -> SyncHeaders {
        self.headers.lock().clone()
    }

    pub(crate) fn set_headers(&self, headers: SyncHeaders) {
        *self.headers.lock() = headers;
    }

    pub(crate) fn clear_headers(&self) {
        self.headers.lock().clear();
    }

    /// Wraps strategy content in an envelope stamped with this machine.
    pub fn make_envelope(&self, content: &str) -> SyncData {
        SyncData::new(self.strategy_version, content).with_machine_id(self.machine_id.clone())
    }

    /// Returns true if the envelope was produced by this machine.
    pub fn is_from_current_machine(&self, data: &SyncData) -> bool {
        data.machine_id.as_deref() == Some(self.machine_id.as_str())
    }

    /// Writes new content to the remote store, guarded by `if_match`, and
    /// returns the remote view after the write.
    pub async fn update_remote_user_data(
        &self,
        content: &str,
        if_match: Option<&str>,
    ) -> SyncResult<RemoteUserData> {
        let data = self.make_envelope(content);
        let json = data.to_json()?;
        let headers = self.headers();
        let ref_ = self
            .remote
            .write(self.resource, &json, if_match, &headers)
            .await?;
        tracing::debug!(resource = %self.resource, ref_ = %ref_, "remote updated");
        Ok(RemoteUserData::new(ref_, Some(data)))
    }

    /// Persists the remote view as the new last-sync record, carrying the
    /// strategy extras through verbatim.
    pub async fn update_last_sync_user_data(
        &self,
        remote: &RemoteUserData,
        extras: Map<String, Value>,
    ) -> SyncResult<()> {
        let mut record = LastSyncUserData::new(remote.ref_.clone(), remote.sync_data.clone());
        record.extras = extras;
        self.last_sync.save(&record).await
    }

    /// Backs up local content to the local backup store.
    pub async fn backup_local(&self, envelope_json: &str) -> SyncResult<()> {
        self.backup.backup(self.resource, envelope_json).await
    }

    /// Reads the local file, returning `None` when it does not exist.
    pub async fn get_local_file_content(&self, path: &Path) -> SyncResult<Option<FileContent>> {
        match self.files.read_file(path).await {
            Ok(content) => Ok(Some(content)),
            Err(FileError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes the local file conditionally.
    ///
    /// With a snapshot, the snapshot's version token guards against
    /// intervening writes; without one the file is created no-overwrite.
    /// Both failure modes surface as [`SyncError::LocalPreconditionFailed`]
    /// to drive the engine's retry loop.
    pub async fn update_local_file_content(
        &self,
        path: &Path,
        content: &str,
        old: Option<&FileContent>,
    ) -> SyncResult<FileContent> {
        let result = match old {
            Some(snapshot) => {
                self.files
                    .write_file(path, content, Some(&snapshot.version))
                    .await
            }
            None => self.files.create_file(path, content, false).await,
        };
        match result {
            Ok(written) => Ok(written),
            Err(FileError::NotFound(_)) | Err(FileError::ModifiedSince(_)) => {
                Err(SyncError::LocalPreconditionFailed)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// The hooks a concrete resource synchronizer provides.
///
/// The engine drives the lifecycle; the strategy owns merge semantics and is
/// the only party that commits state, inside [`SyncStrategy::apply_preview`],
/// through the [`SyncServices`] primitives.
#[async_trait]
pub trait SyncStrategy: Send + Sync {
    /// The resource this strategy synchronizes.
    fn resource(&self) -> SyncResource;

    /// Schema version of the strategy's content. Envelopes with greater
    /// versions are incompatible.
    fn version(&self) -> u32;

    /// The three-way merge between local, remote, and last-synced state.
    async fn generate_preview(
        &self,
        services: &SyncServices,
        remote: &RemoteUserData,
        last_sync: Option<&LastSyncUserData>,
        token: &CancellationToken,
    ) -> SyncResult<SyncPreview>;

    /// Preview that force-overwrites local state from remote.
    async fn generate_pull_preview(
        &self,
        services: &SyncServices,
        remote: &RemoteUserData,
        last_sync: Option<&LastSyncUserData>,
        token: &CancellationToken,
    ) -> SyncResult<SyncPreview>;

    /// Preview that force-overwrites remote state from local.
    async fn generate_push_preview(
        &self,
        services: &SyncServices,
        remote: &RemoteUserData,
        last_sync: Option<&LastSyncUserData>,
        token: &CancellationToken,
    ) -> SyncResult<SyncPreview>;

    /// Preview that installs externally supplied content on both sides.
    async fn generate_replace_preview(
        &self,
        services: &SyncServices,
        data: &SyncData,
        remote: &RemoteUserData,
        last_sync: Option<&LastSyncUserData>,
    ) -> SyncResult<SyncPreview>;

    /// Incorporates a user-provided resolution for one conflict into the
    /// preview.
    async fn update_preview_with_conflict(
        &self,
        services: &SyncServices,
        preview: SyncPreview,
        conflict: &Url,
        content: &str,
        token: &CancellationToken,
    ) -> SyncResult<SyncPreview>;

    /// Commits the preview to local and remote state.
    async fn apply_preview(
        &self,
        services: &SyncServices,
        preview: &SyncPreview,
        force_push: bool,
    ) -> SyncResult<()>;

    /// URI of the local side shown by a conflict viewer (file-backed
    /// strategies).
    fn local_preview_resource(&self) -> Option<Url> {
        None
    }

    /// URI of the remote side shown by a conflict viewer (file-backed
    /// strategies).
    fn remote_preview_resource(&self) -> Option<Url> {
        None
    }

    /// On-disk scratch file deleted on `stop` (file-backed strategies).
    fn preview_scratch_path(&self) -> Option<PathBuf> {
        None
    }
}
