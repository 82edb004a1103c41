//! Resource kinds subject to synchronization.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One category of user state that can be synchronized.
///
/// The kind is immutable for the lifetime of an engine instance; every
/// engine synchronizes exactly one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncResource {
    /// User settings.
    Settings,
    /// Keyboard shortcut customizations.
    Keybindings,
    /// Code snippets.
    Snippets,
    /// Task definitions.
    Tasks,
    /// Installed extensions.
    Extensions,
    /// Application-global UI state.
    GlobalState,
    /// Profile definitions.
    Profiles,
}

impl SyncResource {
    /// All resource kinds, in manifest order.
    pub const ALL: [SyncResource; 7] = [
        SyncResource::Settings,
        SyncResource::Keybindings,
        SyncResource::Snippets,
        SyncResource::Tasks,
        SyncResource::Extensions,
        SyncResource::GlobalState,
        SyncResource::Profiles,
    ];

    /// The stable name used in URIs, manifest keys and directory layout.
    pub fn wire_name(&self) -> &'static str {
        match self {
            SyncResource::Settings => "settings",
            SyncResource::Keybindings => "keybindings",
            SyncResource::Snippets => "snippets",
            SyncResource::Tasks => "tasks",
            SyncResource::Extensions => "extensions",
            SyncResource::GlobalState => "globalState",
            SyncResource::Profiles => "profiles",
        }
    }

    /// The capitalized form used in the last-sync file name.
    pub fn capitalized(&self) -> &'static str {
        match self {
            SyncResource::Settings => "Settings",
            SyncResource::Keybindings => "Keybindings",
            SyncResource::Snippets => "Snippets",
            SyncResource::Tasks => "Tasks",
            SyncResource::Extensions => "Extensions",
            SyncResource::GlobalState => "GlobalState",
            SyncResource::Profiles => "Profiles",
        }
    }
}

impl fmt::Display for SyncResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

impl FromStr for SyncResource {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SyncResource::ALL
            .iter()
            .copied()
            .find(|r| r.wire_name() == s)
            .ok_or_else(|| ProtocolError::UnknownResource(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_name_roundtrip() {
        for resource in SyncResource::ALL {
            assert_eq!(resource.wire_name().parse::<SyncResource>().unwrap(), resource);
        }
    }

    #[test]
    fn unknown_resource_rejected() {
        assert!("themes".parse::<SyncResource>().is_err());
        assert!("Settings".parse::<SyncResource>().is_err());
    }

    #[test]
    fn serde_uses_wire_names() {
        let json = serde_json::to_string(&SyncResource::GlobalState).unwrap();
        assert_eq!(json, "\"globalState\"");
        let parsed: SyncResource = serde_json::from_str("\"keybindings\"").unwrap();
        assert_eq!(parsed, SyncResource::Keybindings);
    }
}
