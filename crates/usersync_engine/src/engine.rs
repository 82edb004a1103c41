//! The reconciliation driver: pull/push/sync/replace/accept-conflict
//! orchestration with precondition-failure retry.

use crate::backup::BackupStore;
use crate::cancel::CancellationToken;
use crate::config::{ResourceEnablement, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::files::{FileError, FileService};
use crate::lastsync::LastSyncStore;
use crate::remote::{RemoteStore, SyncHeaders, UserContent};
use crate::status::{EventFeed, StatusTracker, SyncStatus};
use crate::strategy::{SyncPreview, SyncServices, SyncStrategy};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use url::Url;
use usersync_protocol::{
    backup_handle_uri, parse_backup_handle, BackupKind, Conflict, LastSyncUserData,
    RemoteUserData, SyncData, SyncManifest, SyncResource, SyncResourceHandle,
};

/// The single in-flight preview: its cancellation token, and the produced
/// value once generation finished.
struct PreviewTask {
    token: CancellationToken,
    preview: Option<SyncPreview>,
}

/// Which way a forced synchronization overwrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ForceDirection {
    Pull,
    Push,
}

/// A per-resource synchronizer.
///
/// Reconciles one kind of user state between the local machine and the
/// remote store via a three-way merge against the last successfully
/// synchronized state. Merge semantics are supplied by a [`SyncStrategy`];
/// the engine owns the status machine, the single cancellable preview, the
/// optimistic-concurrency retry loop, and the local-change coalescer.
pub struct Synchronizer {
    strategy: Arc<dyn SyncStrategy>,
    services: Arc<SyncServices>,
    remote: Arc<dyn RemoteStore>,
    backup: Arc<dyn BackupStore>,
    enablement: Arc<dyn ResourceEnablement>,
    tracker: StatusTracker,
    preview: Mutex<Option<PreviewTask>>,
    local_change_feed: EventFeed<()>,
    debounce_task: Mutex<Option<JoinHandle<()>>>,
    debounce: Duration,
    max_precondition_retries: u32,
}

impl Synchronizer {
    /// Creates a synchronizer for the strategy's resource.
    pub fn new(
        strategy: Arc<dyn SyncStrategy>,
        remote: Arc<dyn RemoteStore>,
        backup: Arc<dyn BackupStore>,
        files: Arc<dyn FileService>,
        enablement: Arc<dyn ResourceEnablement>,
        config: SyncConfig,
    ) -> Arc<Self> {
        let resource = strategy.resource();
        let last_sync = LastSyncStore::new(
            resource,
            strategy.version(),
            &config.sync_home,
            Arc::clone(&files),
        );
        let services = Arc::new(SyncServices::new(
            resource,
            strategy.version(),
            config.machine_id.clone(),
            Arc::clone(&remote),
            Arc::clone(&backup),
            files,
            last_sync,
        ));
        Arc::new(Self {
            strategy,
            services,
            remote,
            backup,
            enablement,
            tracker: StatusTracker::new(resource),
            preview: Mutex::new(None),
            local_change_feed: EventFeed::new(),
            debounce_task: Mutex::new(None),
            debounce: config.debounce,
            max_precondition_retries: config.max_precondition_retries,
        })
    }

    /// The resource this instance synchronizes.
    pub fn resource(&self) -> SyncResource {
        self.services.resource()
    }

    /// The engine utilities shared with the strategy.
    pub fn services(&self) -> &Arc<SyncServices> {
        &self.services
    }

    /// Current status.
    pub fn status(&self) -> SyncStatus {
        self.tracker.status()
    }

    /// Current conflict list; non-empty exactly while `HasConflicts`.
    pub fn conflicts(&self) -> Vec<Conflict> {
        self.tracker.conflicts()
    }

    /// Subscribes to status changes.
    pub fn subscribe_status(&self) -> UnboundedReceiver<SyncStatus> {
        self.tracker.subscribe_status()
    }

    /// Subscribes to conflict-list replacements.
    pub fn subscribe_conflicts(&self) -> UnboundedReceiver<Vec<Conflict>> {
        self.tracker.subscribe_conflicts()
    }

    /// Subscribes to local-change notifications for the outer orchestrator.
    pub fn subscribe_local_change(&self) -> UnboundedReceiver<()> {
        self.local_change_feed.subscribe()
    }

    fn is_enabled(&self) -> bool {
        self.enablement.is_enabled(self.resource())
    }

    /// The periodic entry point.
    ///
    /// Skips silently when disabled (stopping any in-flight work) or when a
    /// cycle is already running or awaiting conflict resolution. `headers`
    /// apply to every remote call of this invocation and are cleared
    /// afterwards.
    pub async fn sync(
        &self,
        manifest: Option<&SyncManifest>,
        headers: SyncHeaders,
    ) -> SyncResult<()> {
        if !self.is_enabled() {
            tracing::debug!(resource = %self.resource(), "skipping sync: disabled");
            if self.status() != SyncStatus::Idle {
                self.stop().await?;
            }
            return Ok(());
        }
        if !self.tracker.try_start() {
            tracing::debug!(
                resource = %self.resource(),
                status = ?self.status(),
                "skipping sync: already in progress"
            );
            return Ok(());
        }

        self.services.set_headers(headers);
        let result = self.run_sync_cycle(manifest).await;
        self.services.clear_headers();

        match result {
            Ok(status) => {
                self.tracker.set_status(status);
                Ok(())
            }
            // `stop` already returned the machine to Idle.
            Err(SyncError::Cancelled) => Ok(()),
            Err(e) => {
                self.tracker.set_status(SyncStatus::Idle);
                Err(e)
            }
        }
    }

    async fn run_sync_cycle(&self, manifest: Option<&SyncManifest>) -> SyncResult<SyncStatus> {
        let last_sync = self.services.last_sync().load().await?;
        let remote = self.latest_remote_user_data(manifest, last_sync.as_ref()).await?;
        self.perform_sync(remote, last_sync).await
    }

    /// Force-overwrites local state from remote.
    pub async fn pull(&self) -> SyncResult<()> {
        self.force_sync(ForceDirection::Pull).await
    }

    /// Force-overwrites remote state from local.
    pub async fn push(&self) -> SyncResult<()> {
        self.force_sync(ForceDirection::Push).await
    }

    async fn force_sync(&self, direction: ForceDirection) -> SyncResult<()> {
        if !self.is_enabled() {
            return Err(SyncError::Disabled(self.resource()));
        }
        self.stop().await?;
        self.tracker.set_status(SyncStatus::Syncing);
        tracing::info!(resource = %self.resource(), direction = ?direction, "forced sync started");

        let result = self.run_force_sync(direction).await;

        self.clear_preview();
        self.tracker.set_status(SyncStatus::Idle);
        match result {
            Err(SyncError::Cancelled) => Ok(()),
            other => other,
        }
    }

    async fn run_force_sync(&self, direction: ForceDirection) -> SyncResult<()> {
        let last_sync = self.services.last_sync().load().await?;
        let remote = self.get_remote_user_data(last_sync.as_ref()).await?;
        self.check_compatibility(&remote)?;

        let token = self.install_preview_token();
        let generate = async {
            match direction {
                ForceDirection::Pull => {
                    self.strategy
                        .generate_pull_preview(&self.services, &remote, last_sync.as_ref(), &token)
                        .await
                }
                ForceDirection::Push => {
                    self.strategy
                        .generate_push_preview(&self.services, &remote, last_sync.as_ref(), &token)
                        .await
                }
            }
        };
        let preview = tokio::select! {
            result = generate => result?,
            _ = token.cancelled() => return Err(SyncError::Cancelled),
        };
        if token.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        self.strategy
            .apply_preview(&self.services, &preview, direction == ForceDirection::Push)
            .await
    }

    /// Replaces both sides with content resolved from a backup handle.
    ///
    /// Returns false without touching any state when the handle does not
    /// resolve or its content is not a recognizable envelope.
    pub async fn replace(&self, handle: &Url) -> SyncResult<bool> {
        if !self.is_enabled() {
            return Err(SyncError::Disabled(self.resource()));
        }
        let Some(content) = self.resolve_content(handle).await? else {
            return Ok(false);
        };
        let data = match SyncData::parse(&content) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(
                    resource = %self.resource(),
                    error = %e,
                    "replace content is not a recognizable envelope"
                );
                return Ok(false);
            }
        };

        self.stop().await?;
        self.tracker.set_status(SyncStatus::Syncing);
        tracing::info!(resource = %self.resource(), handle = %handle, "replacing from handle");

        let result = async {
            let last_sync = self.services.last_sync().load().await?;
            let remote = self.get_remote_user_data(last_sync.as_ref()).await?;
            let preview = self
                .strategy
                .generate_replace_preview(&self.services, &data, &remote, last_sync.as_ref())
                .await?;
            self.strategy.apply_preview(&self.services, &preview, false).await
        }
        .await;

        self.clear_preview();
        self.tracker.set_status(SyncStatus::Idle);
        result.map(|_| true)
    }

    /// Merges a user-provided resolution into the pending preview; applies
    /// the preview once no conflicts remain.
    ///
    /// Acts only while the current preview still has conflicts.
    pub async fn accept_conflict(&self, conflict: &Url, content: &str) -> SyncResult<()> {
        if !self.is_enabled() {
            return Err(SyncError::Disabled(self.resource()));
        }
        let (preview, token) = {
            let slot = self.preview.lock();
            match slot.as_ref() {
                Some(task) => match &task.preview {
                    Some(p) if p.has_conflicts => (p.clone(), task.token.clone()),
                    _ => return Ok(()),
                },
                None => return Ok(()),
            }
        };

        let updated = self
            .strategy
            .update_preview_with_conflict(&self.services, preview, conflict, content, &token)
            .await?;

        if updated.has_conflicts {
            let conflicts = updated.conflicts.clone();
            if let Some(task) = self.preview.lock().as_mut() {
                task.preview = Some(updated);
            }
            self.tracker.set_conflicts(conflicts);
            return Ok(());
        }

        self.tracker.set_status(SyncStatus::Syncing);
        let result = self.strategy.apply_preview(&self.services, &updated, false).await;
        self.clear_preview();
        self.tracker.set_status(SyncStatus::Idle);
        result
    }

    /// Cancels any in-flight preview and returns to `Idle`.
    pub async fn stop(&self) -> SyncResult<()> {
        if let Some(pending) = self.debounce_task.lock().take() {
            pending.abort();
        }
        if let Some(task) = self.preview.lock().take() {
            tracing::debug!(resource = %self.resource(), "stopping sync");
            task.token.cancel();
        }
        if let Some(scratch) = self.strategy.preview_scratch_path() {
            match self.services.files().delete(&scratch).await {
                Ok(()) | Err(FileError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.tracker.set_status(SyncStatus::Idle);
        Ok(())
    }

    /// Produces a fresh preview without applying it; `None` when disabled.
    pub async fn generate_sync_preview(&self) -> SyncResult<Option<SyncPreview>> {
        if !self.is_enabled() {
            return Ok(None);
        }
        let last_sync = self.services.last_sync().load().await?;
        let remote = self.get_remote_user_data(last_sync.as_ref()).await?;
        let token = CancellationToken::new();
        let preview = self
            .strategy
            .generate_preview(&self.services, &remote, last_sync.as_ref(), &token)
            .await?;
        Ok(Some(preview))
    }

    /// True iff a last-sync record exists.
    pub async fn has_previously_synced(&self) -> bool {
        self.services.last_sync().exists().await
    }

    /// Lists all remote versions of this resource as backup handles.
    pub async fn remote_backup_handles(&self) -> SyncResult<Vec<SyncResourceHandle>> {
        let refs = self.remote.get_all_refs(self.resource()).await?;
        refs.into_iter()
            .map(|r| {
                Ok(SyncResourceHandle {
                    created: r.created,
                    uri: backup_handle_uri(BackupKind::Remote, self.resource(), &r.ref_)?,
                })
            })
            .collect()
    }

    /// Lists all local backups of this resource as backup handles.
    pub async fn local_backup_handles(&self) -> SyncResult<Vec<SyncResourceHandle>> {
        let refs = self.backup.get_all_refs(self.resource()).await?;
        refs.into_iter()
            .map(|r| {
                Ok(SyncResourceHandle {
                    created: r.created,
                    uri: backup_handle_uri(BackupKind::Local, self.resource(), &r.ref_)?,
                })
            })
            .collect()
    }

    /// The machine that produced the version behind a remote-backup handle.
    pub async fn machine_id(&self, handle: &Url) -> SyncResult<Option<String>> {
        let Ok((kind, resource, ref_)) = parse_backup_handle(handle) else {
            return Ok(None);
        };
        if kind != BackupKind::Remote || resource != self.resource() {
            return Ok(None);
        }
        let Some(content) = self.remote.resolve_content(resource, &ref_).await? else {
            return Ok(None);
        };
        Ok(SyncData::parse(&content).ok().and_then(|d| d.machine_id))
    }

    /// The stored envelope text behind a backup handle, from the matching
    /// store; `None` for URIs that are not backup handles of this
    /// instance's resource.
    pub async fn resolve_content(&self, handle: &Url) -> SyncResult<Option<String>> {
        match parse_backup_handle(handle) {
            Ok((_, resource, _)) if resource != self.resource() => Ok(None),
            Ok((BackupKind::Remote, resource, ref_)) => {
                self.remote.resolve_content(resource, &ref_).await
            }
            Ok((BackupKind::Local, resource, ref_)) => {
                self.backup.resolve_content(resource, &ref_).await
            }
            Err(_) => Ok(None),
        }
    }

    /// Deletes the last-sync record, ignoring a missing one.
    pub async fn reset_local(&self) -> SyncResult<()> {
        self.services.last_sync().reset().await?;
        tracing::debug!(resource = %self.resource(), "reset last-sync state");
        Ok(())
    }

    /// Schedules the coalesced local-change task; bursts within the
    /// debounce window collapse to one run.
    pub fn trigger_local_change(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let delay = self.debounce;
        let mut slot = self.debounce_task.lock();
        if let Some(pending) = slot.take() {
            pending.abort();
        }
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = engine.do_trigger_local_change().await {
                tracing::warn!(
                    resource = %engine.resource(),
                    error = %e,
                    "local-change handling failed"
                );
            }
        }));
    }

    async fn do_trigger_local_change(&self) -> SyncResult<()> {
        if self.status() == SyncStatus::HasConflicts {
            // The user's local change may be the conflict resolution.
            let task = self.preview.lock().take();
            let Some(task) = task else { return Ok(()) };
            task.token.cancel();
            let Some(preview) = task.preview else { return Ok(()) };
            match self
                .perform_sync(preview.remote_user_data, preview.last_sync_user_data)
                .await
            {
                Ok(status) => self.tracker.set_status(status),
                Err(SyncError::Cancelled) => {}
                Err(e) => {
                    self.tracker.set_status(SyncStatus::Idle);
                    return Err(e);
                }
            }
            return Ok(());
        }

        tracing::trace!(resource = %self.resource(), "checking whether local changes affect remote");
        let last_sync = self.services.last_sync().load().await?;
        let has_remote_changed = match &last_sync {
            None => true,
            Some(last) => {
                // Speculate against last-sync as the remote view; no remote
                // request is made.
                let remote_view = RemoteUserData::new(last.ref_.clone(), last.sync_data.clone());
                let token = CancellationToken::new();
                let preview = self
                    .strategy
                    .generate_preview(&self.services, &remote_view, last_sync.as_ref(), &token)
                    .await?;
                preview.has_remote_changed
            }
        };
        if has_remote_changed {
            self.local_change_feed.emit(());
        }
        Ok(())
    }

    /// The optimistic-concurrency loop around `do_sync`.
    ///
    /// A local precondition failure retries with the same remote view; a
    /// remote precondition failure refetches remote and last-sync first. The
    /// retry count is capped.
    async fn perform_sync(
        &self,
        remote: RemoteUserData,
        last_sync: Option<LastSyncUserData>,
    ) -> SyncResult<SyncStatus> {
        self.check_compatibility(&remote)?;
        let mut remote = remote;
        let mut last_sync = last_sync;
        let mut retries = 0u32;
        loop {
            match self.do_sync(&remote, last_sync.as_ref()).await {
                Ok(status) => return Ok(status),
                Err(e) if e.is_precondition() => {
                    retries += 1;
                    if retries > self.max_precondition_retries {
                        return Err(SyncError::TooManyRetries { attempts: retries });
                    }
                    match e {
                        SyncError::PreconditionFailed => {
                            tracing::debug!(
                                resource = %self.resource(),
                                retries,
                                "remote advanced during write, refetching"
                            );
                            remote = self.get_remote_user_data(None).await?;
                            last_sync = self.services.last_sync().load().await?;
                            self.check_compatibility(&remote)?;
                        }
                        _ => {
                            tracing::debug!(
                                resource = %self.resource(),
                                retries,
                                "local state changed during apply, retrying"
                            );
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn check_compatibility(&self, remote: &RemoteUserData) -> SyncResult<()> {
        if let Some(data) = &remote.sync_data {
            if data.version > self.strategy.version() {
                tracing::warn!(
                    resource = %self.resource(),
                    found = data.version,
                    supported = self.strategy.version(),
                    "remote data requires a newer client"
                );
                return Err(SyncError::incompatible_version(
                    self.resource(),
                    data.version,
                    self.strategy.version(),
                ));
            }
        }
        Ok(())
    }

    /// One reconciliation step: ensure a preview, then either surface its
    /// conflicts or apply it.
    async fn do_sync(
        &self,
        remote: &RemoteUserData,
        last_sync: Option<&LastSyncUserData>,
    ) -> SyncResult<SyncStatus> {
        match self.do_sync_step(remote, last_sync).await {
            Ok(status) => Ok(status),
            Err(e) => {
                self.clear_preview();
                Err(e)
            }
        }
    }

    async fn do_sync_step(
        &self,
        remote: &RemoteUserData,
        last_sync: Option<&LastSyncUserData>,
    ) -> SyncResult<SyncStatus> {
        let (preview, token) = self.ensure_preview(remote, last_sync).await?;
        if preview.has_conflicts {
            // The preview stays for acceptance; observers see conflicts set
            // before the status flips.
            self.tracker.set_conflicts(preview.conflicts.clone());
            return Ok(SyncStatus::HasConflicts);
        }
        if token.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        self.strategy.apply_preview(&self.services, &preview, false).await?;
        self.clear_preview();
        Ok(SyncStatus::Idle)
    }

    /// Returns the pending preview, generating one if none exists.
    async fn ensure_preview(
        &self,
        remote: &RemoteUserData,
        last_sync: Option<&LastSyncUserData>,
    ) -> SyncResult<(SyncPreview, CancellationToken)> {
        let token = {
            let mut slot = self.preview.lock();
            if let Some(task) = slot.as_ref() {
                if let Some(ready) = task.preview.clone() {
                    return Ok((ready, task.token.clone()));
                }
            }
            if let Some(stale) = slot.take() {
                stale.token.cancel();
            }
            let token = CancellationToken::new();
            *slot = Some(PreviewTask {
                token: token.clone(),
                preview: None,
            });
            token
        };

        let generated = tokio::select! {
            result = self.strategy.generate_preview(&self.services, remote, last_sync, &token) => result,
            _ = token.cancelled() => Err(SyncError::Cancelled),
        };
        let preview = generated?;

        let mut slot = self.preview.lock();
        match slot.as_mut() {
            Some(task) if !task.token.is_cancelled() => {
                task.preview = Some(preview.clone());
                Ok((preview, token))
            }
            // `stop` ran mid-generation; the preview must not be used.
            _ => Err(SyncError::Cancelled),
        }
    }

    fn install_preview_token(&self) -> CancellationToken {
        let mut slot = self.preview.lock();
        if let Some(stale) = slot.take() {
            stale.token.cancel();
        }
        let token = CancellationToken::new();
        *slot = Some(PreviewTask {
            token: token.clone(),
            preview: None,
        });
        token
    }

    fn clear_preview(&self) {
        *self.preview.lock() = None;
    }

    /// The remote view for a sync round, reusing last-sync when the
    /// manifest shows the resource unchanged.
    async fn latest_remote_user_data(
        &self,
        manifest: Option<&SyncManifest>,
        last_sync: Option<&LastSyncUserData>,
    ) -> SyncResult<RemoteUserData> {
        if let (Some(manifest), Some(last)) = (manifest, last_sync) {
            let advertised = manifest.latest_ref(self.resource());
            let unchanged = advertised == Some(last.ref_.as_str())
                || (advertised.is_none() && last.sync_data.is_none());
            if unchanged {
                tracing::trace!(
                    resource = %self.resource(),
                    ref_ = %last.ref_,
                    "remote unchanged since last sync, skipping fetch"
                );
                return Ok(RemoteUserData::new(last.ref_.clone(), last.sync_data.clone()));
            }
        }
        self.get_remote_user_data(last_sync).await
    }

    async fn get_remote_user_data(
        &self,
        last_sync: Option<&LastSyncUserData>,
    ) -> SyncResult<RemoteUserData> {
        let previous = match last_sync {
            Some(last) => Some(UserContent {
                ref_: last.ref_.clone(),
                content: match &last.sync_data {
                    Some(data) => Some(data.to_json()?),
                    None => None,
                },
            }),
            None => None,
        };
        let headers = self.services.headers();
        let user = self
            .remote
            .read(self.resource(), previous.as_ref(), &headers)
            .await?;
        let sync_data = match &user.content {
            Some(text) => match SyncData::parse(text) {
                Ok(data) => Some(data),
                Err(e) => {
                    tracing::warn!(
                        resource = %self.resource(),
                        error = %e,
                        "remote payload is not a recognizable envelope"
                    );
                    return Err(SyncError::incompatible_payload(
                        self.resource(),
                        e.to_string(),
                    ));
                }
            },
            None => None,
        };
        Ok(RemoteUserData::new(user.ref_, sync_data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::InMemoryBackupStore;
    use crate::config::{AlwaysEnabled, ToggleEnablement};
    use crate::files::InMemoryFileService;
    use crate::remote::InMemoryRemoteStore;
    use async_trait::async_trait;

    /// A strategy that copies remote content verbatim and never conflicts.
    struct MirrorStrategy;

    #[async_trait]
    impl SyncStrategy for MirrorStrategy {
        fn resource(&self) -> SyncResource {
            SyncResource::Settings
        }

        fn version(&self) -> u32 {
            1
        }

        async fn generate_preview(
            &self,
            _services: &SyncServices,
            remote: &RemoteUserData,
            last_sync: Option<&LastSyncUserData>,
            _token: &CancellationToken,
        ) -> SyncResult<SyncPreview> {
            Ok(SyncPreview::new(
                remote.clone(),
                last_sync.cloned(),
            ))
        }

        async fn generate_pull_preview(
            &self,
            services: &SyncServices,
            remote: &RemoteUserData,
            last_sync: Option<&LastSyncUserData>,
            token: &CancellationToken,
        ) -> SyncResult<SyncPreview> {
            self.generate_preview(services, remote, last_sync, token).await
        }

        async fn generate_push_preview(
            &self,
            services: &SyncServices,
            remote: &RemoteUserData,
            last_sync: Option<&LastSyncUserData>,
            token: &CancellationToken,
        ) -> SyncResult<SyncPreview> {
            self.generate_preview(services, remote, last_sync, token).await
        }

        async fn generate_replace_preview(
            &self,
            _services: &SyncServices,
            data: &SyncData,
            remote: &RemoteUserData,
            last_sync: Option<&LastSyncUserData>,
        ) -> SyncResult<SyncPreview> {
            let mut preview = SyncPreview::new(remote.clone(), last_sync.cloned());
            preview.merged_content = Some(data.content.clone());
            preview.has_local_changed = true;
            preview.has_remote_changed = true;
            Ok(preview)
        }

        async fn update_preview_with_conflict(
            &self,
            _services: &SyncServices,
            preview: SyncPreview,
            _conflict: &Url,
            _content: &str,
            _token: &CancellationToken,
        ) -> SyncResult<SyncPreview> {
            Ok(preview)
        }

        async fn apply_preview(
            &self,
            services: &SyncServices,
            preview: &SyncPreview,
            force_push: bool,
        ) -> SyncResult<()> {
            let remote = if force_push || preview.has_remote_changed {
                let content = preview.merged_content.clone().unwrap_or_default();
                let if_match = if force_push {
                    None
                } else {
                    Some(preview.remote_user_data.ref_.as_str())
                };
                services.update_remote_user_data(&content, if_match).await?
            } else {
                preview.remote_user_data.clone()
            };
            services
                .update_last_sync_user_data(&remote, serde_json::Map::new())
                .await
        }
    }

    struct Fixture {
        engine: Arc<Synchronizer>,
        remote: Arc<InMemoryRemoteStore>,
        backup: Arc<InMemoryBackupStore>,
    }

    fn fixture() -> Fixture {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let backup = Arc::new(InMemoryBackupStore::new());
        let files = Arc::new(InMemoryFileService::new());
        let engine = Synchronizer::new(
            Arc::new(MirrorStrategy),
            Arc::clone(&remote) as Arc<dyn RemoteStore>,
            Arc::clone(&backup) as Arc<dyn BackupStore>,
            files,
            Arc::new(AlwaysEnabled),
            SyncConfig::new("/sync-home", "machine-a"),
        );
        Fixture {
            engine,
            remote,
            backup,
        }
    }

    #[tokio::test]
    async fn handle_listing_wraps_store_refs() {
        let f = fixture();
        f.remote.advance(
            SyncResource::Settings,
            &SyncData::new(1, "a").to_json().unwrap(),
        );
        f.remote.advance(
            SyncResource::Settings,
            &SyncData::new(1, "b").to_json().unwrap(),
        );
        f.backup
            .backup(SyncResource::Settings, "backup content")
            .await
            .unwrap();

        let remote_handles = f.engine.remote_backup_handles().await.unwrap();
        assert_eq!(remote_handles.len(), 2);
        assert_eq!(
            remote_handles[0].uri.as_str(),
            "user-data-sync://remote-backup/settings/2"
        );

        let local_handles = f.engine.local_backup_handles().await.unwrap();
        assert_eq!(local_handles.len(), 1);
        assert_eq!(
            local_handles[0].uri.as_str(),
            "user-data-sync://local-backup/settings/1"
        );
    }

    #[tokio::test]
    async fn machine_id_only_for_remote_handles() {
        let f = fixture();
        let envelope = SyncData::new(1, "a")
            .with_machine_id("machine-b")
            .to_json()
            .unwrap();
        f.remote.advance(SyncResource::Settings, &envelope);
        f.backup
            .backup(SyncResource::Settings, &envelope)
            .await
            .unwrap();

        let remote_handle =
            backup_handle_uri(BackupKind::Remote, SyncResource::Settings, "1").unwrap();
        assert_eq!(
            f.engine.machine_id(&remote_handle).await.unwrap(),
            Some("machine-b".to_string())
        );

        let local_handle =
            backup_handle_uri(BackupKind::Local, SyncResource::Settings, "1").unwrap();
        assert_eq!(f.engine.machine_id(&local_handle).await.unwrap(), None);

        let foreign = Url::parse("https://example.com/settings/1").unwrap();
        assert_eq!(f.engine.machine_id(&foreign).await.unwrap(), None);
    }

    #[tokio::test]
    async fn resolve_content_routes_by_authority() {
        let f = fixture();
        f.remote.advance(SyncResource::Settings, "remote version");
        f.backup
            .backup(SyncResource::Settings, "local version")
            .await
            .unwrap();

        let remote_handle =
            backup_handle_uri(BackupKind::Remote, SyncResource::Settings, "1").unwrap();
        assert_eq!(
            f.engine.resolve_content(&remote_handle).await.unwrap(),
            Some("remote version".to_string())
        );

        let local_handle =
            backup_handle_uri(BackupKind::Local, SyncResource::Settings, "1").unwrap();
        assert_eq!(
            f.engine.resolve_content(&local_handle).await.unwrap(),
            Some("local version".to_string())
        );

        let foreign = Url::parse("https://example.com/x").unwrap();
        assert_eq!(f.engine.resolve_content(&foreign).await.unwrap(), None);

        // A handle for a different resource is outside this instance's scope.
        let other_resource =
            backup_handle_uri(BackupKind::Remote, SyncResource::Keybindings, "1").unwrap();
        assert_eq!(f.engine.resolve_content(&other_resource).await.unwrap(), None);
    }

    #[tokio::test]
    async fn sync_then_reset_local_forgets_history() {
        let f = fixture();
        f.remote.advance(
            SyncResource::Settings,
            &SyncData::new(1, "content").to_json().unwrap(),
        );

        assert!(!f.engine.has_previously_synced().await);
        f.engine.sync(None, SyncHeaders::new()).await.unwrap();
        assert!(f.engine.has_previously_synced().await);

        f.engine.reset_local().await.unwrap();
        assert!(!f.engine.has_previously_synced().await);
        // Resetting twice is fine.
        f.engine.reset_local().await.unwrap();
    }

    #[tokio::test]
    async fn disabled_engine_makes_no_remote_requests() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let enablement = Arc::new(ToggleEnablement::new(false));
        let engine = Synchronizer::new(
            Arc::new(MirrorStrategy),
            Arc::clone(&remote) as Arc<dyn RemoteStore>,
            Arc::new(InMemoryBackupStore::new()),
            Arc::new(InMemoryFileService::new()),
            enablement,
            SyncConfig::new("/sync-home", "machine-a"),
        );

        engine.sync(None, SyncHeaders::new()).await.unwrap();
        assert!(remote.requests().is_empty());
        assert_eq!(engine.status(), SyncStatus::Idle);

        assert!(matches!(
            engine.pull().await,
            Err(SyncError::Disabled(SyncResource::Settings))
        ));
        assert!(engine.generate_sync_preview().await.unwrap().is_none());
        assert!(remote.requests().is_empty());
    }

    #[tokio::test]
    async fn manifest_short_circuit_skips_remote_read() {
        let f = fixture();
        let ref_ = f.remote.advance(
            SyncResource::Settings,
            &SyncData::new(1, "content").to_json().unwrap(),
        );

        f.engine.sync(None, SyncHeaders::new()).await.unwrap();
        f.remote.clear_requests();

        // Manifest advertises the ref we already synced: no read happens.
        let manifest = SyncManifest::new().with_latest(SyncResource::Settings, ref_);
        f.engine.sync(Some(&manifest), SyncHeaders::new()).await.unwrap();
        assert!(f.remote.requests().is_empty());

        // A newer advertised ref forces the fetch.
        let newer = f.remote.advance(
            SyncResource::Settings,
            &SyncData::new(1, "newer").to_json().unwrap(),
        );
        f.remote.clear_requests();
        let manifest = SyncManifest::new().with_latest(SyncResource::Settings, newer);
        f.engine.sync(Some(&manifest), SyncHeaders::new()).await.unwrap();
        assert!(!f.remote.requests().is_empty());
    }

    #[tokio::test]
    async fn incompatible_remote_version_fails_sync() {
        let f = fixture();
        f.remote.advance(
            SyncResource::Settings,
            &SyncData::new(9, "from the future").to_json().unwrap(),
        );

        let err = f.engine.sync(None, SyncHeaders::new()).await.unwrap_err();
        assert!(matches!(err, SyncError::Incompatible { .. }));
        assert_eq!(f.engine.status(), SyncStatus::Idle);
    }

    #[tokio::test]
    async fn unparseable_remote_payload_is_incompatible() {
        let f = fixture();
        f.remote
            .advance(SyncResource::Settings, r#"{"version":1,"junk":true}"#);

        let err = f.engine.sync(None, SyncHeaders::new()).await.unwrap_err();
        assert!(matches!(err, SyncError::Incompatible { .. }));
        assert_eq!(f.engine.status(), SyncStatus::Idle);
    }
}
