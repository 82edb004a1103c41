//! The persisted record of the most recent successful sync.

use crate::envelope::SyncData;
use crate::error::{ProtocolError, ProtocolResult};
use serde_json::{Map, Value};

/// The locally persisted snapshot of the last successfully applied sync,
/// used as the common ancestor for the three-way merge.
///
/// On disk this is `{ "ref": …, "content": <envelope-json-string | null>,
/// …extras }`. The extras bag carries strategy-specific auxiliary fields
/// that the engine passes through verbatim, including keys it does not
/// recognize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastSyncUserData {
    /// The server ref the last sync committed against.
    pub ref_: String,
    /// The envelope at last sync, or `None` when the resource was absent
    /// remotely.
    pub sync_data: Option<SyncData>,
    /// Strategy-specific fields, retained verbatim.
    pub extras: Map<String, Value>,
}

impl LastSyncUserData {
    /// Creates a record with no extras.
    pub fn new(ref_: impl Into<String>, sync_data: Option<SyncData>) -> Self {
        Self {
            ref_: ref_.into(),
            sync_data,
            extras: Map::new(),
        }
    }

    /// Attaches a strategy extra.
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extras.insert(key.into(), value);
        self
    }

    /// Serializes the record for persistence.
    pub fn to_json(&self) -> ProtocolResult<String> {
        let mut map = Map::new();
        map.insert("ref".to_string(), Value::String(self.ref_.clone()));
        let content = match &self.sync_data {
            Some(data) => Value::String(data.to_json()?),
            None => Value::Null,
        };
        map.insert("content".to_string(), content);
        for (key, value) in &self.extras {
            if key != "ref" && key != "content" {
                map.insert(key.clone(), value.clone());
            }
        }
        Ok(serde_json::to_string(&Value::Object(map))?)
    }

    /// Parses a persisted record.
    pub fn parse(text: &str) -> ProtocolResult<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ProtocolError::malformed_record(e.to_string()))?;
        let Value::Object(mut map) = value else {
            return Err(ProtocolError::malformed_record("expected a JSON object"));
        };

        let ref_ = match map.remove("ref") {
            Some(Value::String(s)) => s,
            _ => return Err(ProtocolError::malformed_record("missing or invalid ref")),
        };

        let sync_data = match map.remove("content") {
            Some(Value::String(envelope)) => Some(SyncData::parse(&envelope)?),
            Some(Value::Null) | None => None,
            Some(_) => return Err(ProtocolError::malformed_record("content must be a string or null")),
        };

        Ok(Self {
            ref_,
            sync_data,
            extras: map,
        })
    }
}
