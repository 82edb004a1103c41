//! The file service seam: versioned reads and conditional writes, plus
//! change watching.

use crate::status::EventFeed;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;

/// Result type for file operations.
pub type FileResult<T> = Result<T, FileError>;

/// Errors surfaced by the file service.
///
/// `NotFound` and `ModifiedSince` are distinct by contract; the engine maps
/// both to a local precondition failure when committing a preview.
#[derive(Error, Debug, Clone)]
pub enum FileError {
    /// The file does not exist.
    #[error("file not found: {0}")]
    NotFound(PathBuf),

    /// The file changed since the supplied snapshot was taken.
    #[error("file modified since snapshot: {0}")]
    ModifiedSince(PathBuf),

    /// Any other I/O failure.
    #[error("file I/O error: {0}")]
    Io(String),
}

/// Opaque token identifying one observed version of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileVersion(pub(crate) u64);

/// A file snapshot: its content and the version token observed at read time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContent {
    /// The file's path.
    pub path: PathBuf,
    /// UTF-8 content.
    pub content: String,
    /// Version token for conditional writes.
    pub version: FileVersion,
}

/// A batch of changed paths reported by a watcher.
#[derive(Debug, Clone)]
pub struct FileChangeEvent {
    /// The paths covered by this event.
    pub paths: Vec<PathBuf>,
}

impl FileChangeEvent {
    /// Returns true if the event covers the given path.
    pub fn contains(&self, path: &Path) -> bool {
        self.paths.iter().any(|p| p == path)
    }
}

/// Read/write/watch access to the local filesystem.
#[async_trait]
pub trait FileService: Send + Sync {
    /// Reads a file, returning its content and version token.
    async fn read_file(&self, path: &Path) -> FileResult<FileContent>;

    /// Writes a file. When `expected` is present the write fails with
    /// [`FileError::ModifiedSince`] if the file's current version differs,
    /// and with [`FileError::NotFound`] if the file vanished.
    async fn write_file(
        &self,
        path: &Path,
        content: &str,
        expected: Option<&FileVersion>,
    ) -> FileResult<FileContent>;

    /// Creates a file. With `overwrite` false an existing file fails the
    /// create with [`FileError::ModifiedSince`].
    async fn create_file(&self, path: &Path, content: &str, overwrite: bool)
        -> FileResult<FileContent>;

    /// Deletes a file.
    async fn delete(&self, path: &Path) -> FileResult<()>;

    /// Returns true if the path exists.
    async fn exists(&self, path: &Path) -> bool;

    /// Starts watching a directory (non-recursive).
    fn watch(&self, dir: &Path) -> FileResult<()>;

    /// Subscribes to change events for watched directories.
    fn subscribe(&self) -> UnboundedReceiver<FileChangeEvent>;
}

#[derive(Debug, Default)]
struct MemoryFsState {
    entries: HashMap<PathBuf, (String, u64)>,
    next_version: u64,
    watched: Vec<PathBuf>,
}

/// An in-memory file service with version counters.
#[derive(Debug, Default)]
pub struct InMemoryFileService {
    state: Mutex<MemoryFsState>,
    feed: EventFeed<FileChangeEvent>,
}

impl InMemoryFileService {
    /// Creates an empty file system.
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a file as an external actor would: unconditionally, still
    /// emitting a change event.
    pub fn write_external(&self, path: &Path, content: &str) {
        {
            let mut state = self.state.lock();
            state.next_version += 1;
            let version = state.next_version;
            state
                .entries
                .insert(path.to_path_buf(), (content.to_string(), version));
        }
        self.emit_change(path);
    }

    fn emit_change(&self, path: &Path) {
        let watched = {
            let state = self.state.lock();
            state
                .watched
                .iter()
                .any(|dir| path.parent().is_some_and(|parent| parent.starts_with(dir)))
        };
        if watched {
            self.feed.emit(FileChangeEvent {
                paths: vec![path.to_path_buf()],
            });
        }
    }

    fn insert(&self, path: &Path, content: &str) -> FileContent {
        let version = {
            let mut state = self.state.lock();
            state.next_version += 1;
            let version = state.next_version;
            state
                .entries
                .insert(path.to_path_buf(), (content.to_string(), version));
            version
        };
        self.emit_change(path);
        FileContent {
            path: path.to_path_buf(),
            content: content.to_string(),
            version: FileVersion(version),
        }
    }
}

#[async_trait]
impl FileService for InMemoryFileService {
    async fn read_file(&self, path: &Path) -> FileResult<FileContent> {
        let state = self.state.lock();
        match state.entries.get(path) {
            Some((content, version)) => Ok(FileContent {
                path: path.to_path_buf(),
                content: content.clone(),
                version: FileVersion(*version),
            }),
            None => Err(FileError::NotFound(path.to_path_buf())),
        }
    }

    async fn write_file(
        &self,
        path: &Path,
        content: &str,
        expected: Option<&FileVersion>,
    ) -> FileResult<FileContent> {
        if let Some(expected) = expected {
            let state = self.state.lock();
            match state.entries.get(path) {
                None => return Err(FileError::NotFound(path.to_path_buf())),
                Some((_, version)) if *version != expected.0 => {
                    return Err(FileError::ModifiedSince(path.to_path_buf()))
                }
                Some(_) => {}
            }
        }
        Ok(self.insert(path, content))
    }

    async fn create_file(
        &self,
        path: &Path,
        content: &str,
        overwrite: bool,
    ) -> FileResult<FileContent> {
        if !overwrite && self.state.lock().entries.contains_key(path) {
            return Err(FileError::ModifiedSince(path.to_path_buf()));
        }
        Ok(self.insert(path, content))
    }

    async fn delete(&self, path: &Path) -> FileResult<()> {
        let removed = self.state.lock().entries.remove(path);
        if removed.is_none() {
            return Err(FileError::NotFound(path.to_path_buf()));
        }
        self.emit_change(path);
        Ok(())
    }

    async fn exists(&self, path: &Path) -> bool {
        self.state.lock().entries.contains_key(path)
    }

    fn watch(&self, dir: &Path) -> FileResult<()> {
        self.state.lock().watched.push(dir.to_path_buf());
        Ok(())
    }

    fn subscribe(&self) -> UnboundedReceiver<FileChangeEvent> {
        self.feed.subscribe()
    }
}
