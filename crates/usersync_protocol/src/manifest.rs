//! The server manifest: one ref per resource, fetched once per sync round.

use crate::resource::SyncResource;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A map from resource to its current server ref.
///
/// Fetched once per sync round; the engine uses it to skip the remote read
/// when the advertised ref matches the last successfully synced one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncManifest {
    /// Latest server ref per resource. A missing entry means the resource
    /// has never been written remotely.
    #[serde(default)]
    pub latest: HashMap<SyncResource, String>,
    /// Opaque server session identifier, carried through verbatim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

impl SyncManifest {
    /// Creates an empty manifest.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the latest ref for a resource.
    pub fn with_latest(mut self, resource: SyncResource, ref_: impl Into<String>) -> Self {
        self.latest.insert(resource, ref_.into());
        self
    }

    /// The advertised ref for a resource, if any.
    pub fn latest_ref(&self, resource: SyncResource) -> Option<&str> {
        self.latest.get(&resource).map(String::as_str)
    }
}
