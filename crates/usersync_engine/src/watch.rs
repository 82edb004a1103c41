//! Bridges file-change events into the engine's local-change coalescer.

use crate::engine::Synchronizer;
use crate::files::{FileResult, FileService};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Watches the directory containing a resource file and feeds change events
/// covering that file into the synchronizer's debounced local-change task.
pub struct ResourceWatcher {
    task: JoinHandle<()>,
}

impl ResourceWatcher {
    /// Starts watching; events for other files in the directory are ignored.
    pub fn start(
        engine: Arc<Synchronizer>,
        files: Arc<dyn FileService>,
        file_path: PathBuf,
    ) -> FileResult<Self> {
        let dir = file_path
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/"));
        files.watch(&dir)?;

        let mut events = files.subscribe();
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if event.contains(&file_path) {
                    engine.trigger_local_change();
                }
            }
        });
        Ok(Self { task })
    }

    /// Stops forwarding events.
    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for ResourceWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}
