//! Persistence of the last successfully synchronized state.

use crate::error::{SyncError, SyncResult};
use crate::files::{FileError, FileService};
use std::path::PathBuf;
use std::sync::Arc;
use usersync_protocol::{LastSyncUserData, SyncResource};

/// Persists and retrieves the most recent successfully synchronized remote
/// reference plus its envelope.
///
/// One store per engine instance; the backing file is
/// `<sync_home>/<resource>/lastSync<Resource>.json` and is owned exclusively
/// by this store.
pub struct LastSyncStore {
    resource: SyncResource,
    strategy_version: u32,
    path: PathBuf,
    files: Arc<dyn FileService>,
}

impl LastSyncStore {
    /// Creates a store rooted under the given sync home.
    pub fn new(
        resource: SyncResource,
        strategy_version: u32,
        sync_home: &std::path::Path,
        files: Arc<dyn FileService>,
    ) -> Self {
        let path = sync_home
            .join(resource.wire_name())
            .join(format!("lastSync{}.json", resource.capitalized()));
        Self {
            resource,
            strategy_version,
            path,
            files,
        }
    }

    /// The backing file's path.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Loads the persisted record.
    ///
    /// A missing file means no prior sync. An unparseable record is logged
    /// and likewise treated as no prior sync. A record whose envelope
    /// version exceeds the strategy's declared version is incompatible; the
    /// engine does not downgrade.
    pub async fn load(&self) -> SyncResult<Option<LastSyncUserData>> {
        let content = match self.files.read_file(&self.path).await {
            Ok(file) => file.content,
            Err(FileError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let record = match LastSyncUserData::parse(&content) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(
                    resource = %self.resource,
                    error = %e,
                    "discarding unreadable last-sync record"
                );
                return Ok(None);
            }
        };

        if let Some(data) = &record.sync_data {
            if data.version > self.strategy_version {
                return Err(SyncError::incompatible_version(
                    self.resource,
                    data.version,
                    self.strategy_version,
                ));
            }
        }

        Ok(Some(record))
    }

    /// Persists a record, replacing any prior one.
    pub async fn save(&self, record: &LastSyncUserData) -> SyncResult<()> {
        let json = record.to_json()?;
        self.files.write_file(&self.path, &json, None).await?;
        tracing::trace!(resource = %self.resource, ref_ = %record.ref_, "last-sync updated");
        Ok(())
    }

    /// Returns true if a last-sync record exists.
    pub async fn exists(&self) -> bool {
        self.files.exists(&self.path).await
    }

    /// Deletes the record, ignoring a missing file.
    pub async fn reset(&self) -> SyncResult<()> {
        match self.files.delete(&self.path).await {
            Ok(()) | Err(FileError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::InMemoryFileService;
    use serde_json::json;
    use std::path::Path;
    use usersync_protocol::SyncData;

    fn store(files: &Arc<InMemoryFileService>) -> LastSyncStore {
        LastSyncStore::new(
            SyncResource::Settings,
            2,
            Path::new("/sync-home"),
            Arc::clone(files) as Arc<dyn FileService>,
        )
    }

    #[tokio::test]
    async fn missing_record_means_no_prior_sync() {
        let files = Arc::new(InMemoryFileService::new());
        let store = store(&files);
        assert!(store.load().await.unwrap().is_none());
        assert!(!store.exists().await);
    }

    #[tokio::test]
    async fn save_and_load_roundtrip() {
        let files = Arc::new(InMemoryFileService::new());
        let store = store(&files);

        let record = LastSyncUserData::new("4", Some(SyncData::new(2, "content")))
            .with_extra("skipped", json!(["a"]));
        store.save(&record).await.unwrap();

        assert!(store.exists().await);
        assert_eq!(store.load().await.unwrap(), Some(record));
        assert_eq!(
            store.path(),
            Path::new("/sync-home/settings/lastSyncSettings.json")
        );
    }

    #[tokio::test]
    async fn unreadable_record_degrades_to_none() {
        let files = Arc::new(InMemoryFileService::new());
        let store = store(&files);
        files.write_external(store.path(), "{ not json");
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn newer_persisted_version_is_incompatible() {
        let files = Arc::new(InMemoryFileService::new());
        let store = store(&files);
        let record = LastSyncUserData::new("4", Some(SyncData::new(3, "content")));
        files.write_external(store.path(), &record.to_json().unwrap());

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, SyncError::Incompatible { .. }));
    }

    #[tokio::test]
    async fn reset_ignores_missing_record() {
        let files = Arc::new(InMemoryFileService::new());
        let store = store(&files);
        store.reset().await.unwrap();

        store
            .save(&LastSyncUserData::new("1", None))
            .await
            .unwrap();
        store.reset().await.unwrap();
        assert!(!store.exists().await);
    }
}
