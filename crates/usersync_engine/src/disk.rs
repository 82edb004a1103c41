//! Disk-backed file service using `tokio::fs` and a `notify` watcher.

use crate::files::{FileChangeEvent, FileContent, FileError, FileResult, FileService, FileVersion};
use crate::status::EventFeed;
use async_trait::async_trait;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

/// File service over the real filesystem.
///
/// Version tokens are derived from modification time and length, which is
/// enough to detect the intervening writes the engine cares about.
pub struct DiskFileService {
    feed: Arc<EventFeed<FileChangeEvent>>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl DiskFileService {
    /// Creates a service with no active watches.
    pub fn new() -> Self {
        Self {
            feed: Arc::new(EventFeed::new()),
            watcher: Mutex::new(None),
        }
    }

    async fn current_version(&self, path: &Path) -> FileResult<Option<FileVersion>> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(Some(version_token(&meta))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(FileError::Io(e.to_string())),
        }
    }

    async fn write_unchecked(&self, path: &Path, content: &str) -> FileResult<FileContent> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FileError::Io(e.to_string()))?;
        }
        tokio::fs::write(path, content)
            .await
            .map_err(|e| map_io(path, e))?;
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| map_io(path, e))?;
        Ok(FileContent {
            path: path.to_path_buf(),
            content: content.to_string(),
            version: version_token(&meta),
        })
    }
}

impl Default for DiskFileService {
    fn default() -> Self {
        Self::new()
    }
}

fn map_io(path: &Path, e: std::io::Error) -> FileError {
    if e.kind() == std::io::ErrorKind::NotFound {
        FileError::NotFound(path.to_path_buf())
    } else {
        FileError::Io(e.to_string())
    }
}

fn version_token(meta: &std::fs::Metadata) -> FileVersion {
    let mut hasher = DefaultHasher::new();
    if let Ok(modified) = meta.modified() {
        if let Ok(since_epoch) = modified.duration_since(std::time::SystemTime::UNIX_EPOCH) {
            since_epoch.as_nanos().hash(&mut hasher);
        }
    }
    meta.len().hash(&mut hasher);
    FileVersion(hasher.finish())
}

#[async_trait]
impl FileService for DiskFileService {
    async fn read_file(&self, path: &Path) -> FileResult<FileContent> {
        let bytes = tokio::fs::read(path).await.map_err(|e| map_io(path, e))?;
        let content = String::from_utf8(bytes)
            .map_err(|e| FileError::Io(format!("{}: {e}", path.display())))?;
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| map_io(path, e))?;
        Ok(FileContent {
            path: path.to_path_buf(),
            content,
            version: version_token(&meta),
        })
    }

    async fn write_file(
        &self,
        path: &Path,
        content: &str,
        expected: Option<&FileVersion>,
    ) -> FileResult<FileContent> {
        if let Some(expected) = expected {
            match self.current_version(path).await? {
                None => return Err(FileError::NotFound(path.to_path_buf())),
                Some(current) if current != *expected => {
                    return Err(FileError::ModifiedSince(path.to_path_buf()))
                }
                Some(_) => {}
            }
        }
        self.write_unchecked(path, content).await
    }

    async fn create_file(
        &self,
        path: &Path,
        content: &str,
        overwrite: bool,
    ) -> FileResult<FileContent> {
        if !overwrite && self.current_version(path).await?.is_some() {
            return Err(FileError::ModifiedSince(path.to_path_buf()));
        }
        self.write_unchecked(path, content).await
    }

    async fn delete(&self, path: &Path) -> FileResult<()> {
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| map_io(path, e))
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::metadata(path).await.is_ok()
    }

    fn watch(&self, dir: &Path) -> FileResult<()> {
        let mut guard = self.watcher.lock();
        if guard.is_none() {
            let feed = Arc::clone(&self.feed);
            let watcher = RecommendedWatcher::new(
                move |res: Result<notify::Event, notify::Error>| {
                    if let Ok(event) = res {
                        if matches!(
                            event.kind,
                            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                        ) {
                            feed.emit(FileChangeEvent {
                                paths: event.paths.clone(),
                            });
                        }
                    }
                },
                notify::Config::default(),
            )
            .map_err(|e| FileError::Io(e.to_string()))?;
            *guard = Some(watcher);
        }
        if let Some(watcher) = guard.as_mut() {
            watcher
                .watch(dir, RecursiveMode::NonRecursive)
                .map_err(|e| FileError::Io(e.to_string()))?;
        }
        Ok(())
    }

    fn subscribe(&self) -> UnboundedReceiver<FileChangeEvent> {
        self.feed.subscribe()
    }
}
