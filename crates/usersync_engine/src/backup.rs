//! The local backup store seam.

use crate::error::SyncResult;
use crate::remote::{now_millis, RefRecord};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use usersync_protocol::SyncResource;

/// Store keeping local backups of resource content before each sync applies.
#[async_trait]
pub trait BackupStore: Send + Sync {
    /// Records a backup of the given envelope JSON.
    async fn backup(&self, resource: SyncResource, content: &str) -> SyncResult<()>;

    /// Fetches a backup by ref.
    async fn resolve_content(
        &self,
        resource: SyncResource,
        ref_: &str,
    ) -> SyncResult<Option<String>>;

    /// Lists all backup refs, newest first.
    async fn get_all_refs(&self, resource: SyncResource) -> SyncResult<Vec<RefRecord>>;
}

#[derive(Debug, Clone)]
struct BackupVersion {
    created: u64,
    ref_: String,
    content: String,
}

/// An in-memory backup store.
#[derive(Debug, Default)]
pub struct InMemoryBackupStore {
    state: Mutex<HashMap<SyncResource, Vec<BackupVersion>>>,
}

impl InMemoryBackupStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of backups recorded for a resource.
    pub fn backup_count(&self, resource: SyncResource) -> usize {
        self.state.lock().get(&resource).map_or(0, Vec::len)
    }
}

#[async_trait]
impl BackupStore for InMemoryBackupStore {
    async fn backup(&self, resource: SyncResource, content: &str) -> SyncResult<()> {
        let mut state = self.state.lock();
        let versions = state.entry(resource).or_default();
        let ref_ = (versions.len() as u64 + 1).to_string();
        versions.push(BackupVersion {
            created: now_millis(),
            ref_,
            content: content.to_string(),
        });
        Ok(())
    }

    async fn resolve_content(
        &self,
        resource: SyncResource,
        ref_: &str,
    ) -> SyncResult<Option<String>> {
        let state = self.state.lock();
        Ok(state.get(&resource).and_then(|versions| {
            versions
                .iter()
                .find(|v| v.ref_ == ref_)
                .map(|v| v.content.clone())
        }))
    }

    async fn get_all_refs(&self, resource: SyncResource) -> SyncResult<Vec<RefRecord>> {
        let state = self.state.lock();
        let mut refs: Vec<RefRecord> = state
            .get(&resource)
            .map(|versions| {
                versions
                    .iter()
                    .map(|v| RefRecord {
                        created: v.created,
                        ref_: v.ref_.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        refs.reverse();
        Ok(refs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn backup_and_resolve() {
        let store = InMemoryBackupStore::new();
        store.backup(SyncResource::Settings, "v1").await.unwrap();
        store.backup(SyncResource::Settings, "v2").await.unwrap();

        assert_eq!(store.backup_count(SyncResource::Settings), 2);
        let refs = store.get_all_refs(SyncResource::Settings).await.unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].ref_, "2");

        let content = store
            .resolve_content(SyncResource::Settings, "1")
            .await
            .unwrap();
        assert_eq!(content.as_deref(), Some("v1"));
        let missing = store
            .resolve_content(SyncResource::Settings, "9")
            .await
            .unwrap();
        assert_eq!(missing, None);
    }
}
