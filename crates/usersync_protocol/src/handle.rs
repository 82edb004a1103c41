//! Naming of historical resource versions in backup storage.
//!
//! A handle is a URI of the form `user-data-sync://<authority>/<resource>/<ref>`
//! where the authority selects the remote or local backup store. The ref is
//! always recoverable as the final path segment.

use crate::error::{ProtocolError, ProtocolResult};
use crate::resource::SyncResource;
use url::Url;

/// URI scheme for backup handles.
pub const HANDLE_SCHEME: &str = "user-data-sync";

/// Authority naming the remote backup store.
pub const REMOTE_BACKUP_AUTHORITY: &str = "remote-backup";

/// Authority naming the local backup store.
pub const LOCAL_BACKUP_AUTHORITY: &str = "local-backup";

/// Which backup store a handle points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupKind {
    /// The remote store's version history.
    Remote,
    /// The local backup store.
    Local,
}

impl BackupKind {
    fn authority(&self) -> &'static str {
        match self {
            BackupKind::Remote => REMOTE_BACKUP_AUTHORITY,
            BackupKind::Local => LOCAL_BACKUP_AUTHORITY,
        }
    }
}

/// A named historical version of a resource in backup storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResourceHandle {
    /// Creation time of the backed-up version, in epoch milliseconds.
    pub created: u64,
    /// The handle URI.
    pub uri: Url,
}

/// Synthesizes the handle URI for a backed-up version of a resource.
pub fn backup_handle_uri(
    kind: BackupKind,
    resource: SyncResource,
    ref_: &str,
) -> ProtocolResult<Url> {
    let text = format!(
        "{HANDLE_SCHEME}://{}/{}/{}",
        kind.authority(),
        resource.wire_name(),
        ref_
    );
    Url::parse(&text).map_err(|e| ProtocolError::malformed_handle(e.to_string()))
}

/// Decomposes a handle URI into its store kind, resource, and ref.
pub fn parse_backup_handle(uri: &Url) -> ProtocolResult<(BackupKind, SyncResource, String)> {
    if uri.scheme() != HANDLE_SCHEME {
        return Err(ProtocolError::malformed_handle(format!(
            "unexpected scheme {:?}",
            uri.scheme()
        )));
    }

    let kind = match uri.host_str() {
        Some(REMOTE_BACKUP_AUTHORITY) => BackupKind::Remote,
        Some(LOCAL_BACKUP_AUTHORITY) => BackupKind::Local,
        other => {
            return Err(ProtocolError::malformed_handle(format!(
                "unexpected authority {other:?}"
            )))
        }
    };

    let mut segments = uri
        .path_segments()
        .ok_or_else(|| ProtocolError::malformed_handle("handle has no path"))?;

    let resource = segments
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ProtocolError::malformed_handle("missing resource segment"))?
        .parse::<SyncResource>()?;

    let ref_ = segments
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ProtocolError::malformed_handle("missing ref segment"))?
        .to_string();

    if segments.next().is_some() {
        return Err(ProtocolError::malformed_handle("trailing path segments"));
    }

    Ok((kind, resource, ref_))
}
