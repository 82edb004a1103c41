//! The versioned envelope wrapping opaque resource content.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};

/// A versioned wrapper around opaque resource content, optionally tagged
/// with the machine that produced it.
///
/// An envelope is recognized on parse only if it carries exactly the keys
/// `{version, content}` or `{version, machineId, content}`. Any other shape
/// is a parse failure, which callers treat as an incompatible payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncData {
    /// Schema version of the content, declared by the producing strategy.
    pub version: u32,
    /// Identifier of the machine that wrote this envelope, if known.
    #[serde(rename = "machineId", skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    /// Opaque UTF-8 content owned by the strategy.
    pub content: String,
}

impl SyncData {
    /// Creates an envelope without a machine tag.
    pub fn new(version: u32, content: impl Into<String>) -> Self {
        Self {
            version,
            machine_id: None,
            content: content.into(),
        }
    }

    /// Tags the envelope with the producing machine.
    pub fn with_machine_id(mut self, machine_id: impl Into<String>) -> Self {
        self.machine_id = Some(machine_id.into());
        self
    }

    /// Parses an envelope, enforcing the recognized shapes.
    pub fn parse(text: &str) -> ProtocolResult<Self> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| ProtocolError::malformed_envelope(e.to_string()))?;
        let map = value
            .as_object()
            .ok_or_else(|| ProtocolError::malformed_envelope("expected a JSON object"))?;

        for key in map.keys() {
            if key != "version" && key != "machineId" && key != "content" {
                return Err(ProtocolError::malformed_envelope(format!(
                    "unrecognized key {key:?}"
                )));
            }
        }

        let version = map
            .get("version")
            .and_then(|v| v.as_u64())
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| ProtocolError::malformed_envelope("missing or invalid version"))?;

        let content = map
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProtocolError::malformed_envelope("missing or invalid content"))?
            .to_string();

        let machine_id = match map.get("machineId") {
            None => None,
            Some(v) => Some(
                v.as_str()
                    .ok_or_else(|| ProtocolError::malformed_envelope("machineId must be a string"))?
                    .to_string(),
            ),
        };

        Ok(Self {
            version,
            machine_id,
            content,
        })
    }

    /// Serializes the envelope to compact JSON.
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// The remote store's view of a resource: its version token plus the
/// envelope, absent when the resource does not exist remotely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteUserData {
    /// Server-side opaque version token, monotonic per resource.
    pub ref_: String,
    /// The parsed envelope, or `None` for a resource with no remote copy.
    pub sync_data: Option<SyncData>,
}

impl RemoteUserData {
    /// Creates a remote view from a ref and an optional envelope.
    pub fn new(ref_: impl Into<String>, sync_data: Option<SyncData>) -> Self {
        Self {
            ref_: ref_.into(),
            sync_data,
        }
    }
}
