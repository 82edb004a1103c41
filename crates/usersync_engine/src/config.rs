//! Configuration and the resource-enablement seam.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use usersync_protocol::SyncResource;

/// Configuration for a synchronizer instance.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Root of the per-user sync home. Each resource keeps its last-sync
    /// record under `<sync_home>/<resource>/`.
    pub sync_home: PathBuf,
    /// Identifier of this machine, stamped into envelopes it produces.
    pub machine_id: String,
    /// Delay used to coalesce bursts of local file events.
    pub debounce: Duration,
    /// Safety cap on the precondition-retry loop.
    pub max_precondition_retries: u32,
}

impl SyncConfig {
    /// Creates a configuration with default timings.
    pub fn new(sync_home: impl Into<PathBuf>, machine_id: impl Into<String>) -> Self {
        Self {
            sync_home: sync_home.into(),
            machine_id: machine_id.into(),
            debounce: Duration::from_millis(50),
            max_precondition_retries: 8,
        }
    }

    /// Sets the local-change debounce delay.
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Sets the precondition-retry safety cap.
    pub fn with_max_precondition_retries(mut self, retries: u32) -> Self {
        self.max_precondition_retries = retries;
        self
    }
}

/// The resource-enablement flag service consumed by the engine.
///
/// Enablement lives outside the engine; the engine only consults it at the
/// start of each guarded operation.
pub trait ResourceEnablement: Send + Sync {
    /// Returns true if the resource may be synchronized.
    fn is_enabled(&self, resource: SyncResource) -> bool;
}

/// Enablement that never turns a resource off.
#[derive(Debug, Default)]
pub struct AlwaysEnabled;

impl ResourceEnablement for AlwaysEnabled {
    fn is_enabled(&self, _resource: SyncResource) -> bool {
        true
    }
}

/// Switchable enablement, for embedders and tests.
#[derive(Debug)]
pub struct ToggleEnablement {
    enabled: AtomicBool,
}

impl ToggleEnablement {
    /// Creates the toggle in the given state.
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
        }
    }

    /// Flips the flag.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

impl ResourceEnablement for ToggleEnablement {
    fn is_enabled(&self, _resource: SyncResource) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}
