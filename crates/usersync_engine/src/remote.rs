//! The remote store seam and an in-memory implementation for tests and
//! hermetic embedding.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use usersync_protocol::SyncResource;

/// Request headers injected into a single sync invocation.
pub type SyncHeaders = HashMap<String, String>;

/// The raw value the remote store holds for a resource: its current ref and
/// the envelope JSON, absent when the resource was never written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserContent {
    /// Server-side opaque version token.
    pub ref_: String,
    /// Raw envelope JSON, or `None` when the resource does not exist.
    pub content: Option<String>,
}

/// A historical ref together with its creation time (epoch milliseconds).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefRecord {
    /// Creation time of the version.
    pub created: u64,
    /// The version's ref.
    pub ref_: String,
}

/// Client for the remote store shared across the user's machines.
///
/// Writes are conditional: the server must reject a write whose `if_match`
/// ref no longer equals the current server ref with
/// [`SyncError::PreconditionFailed`].
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Reads the current value of a resource. `previous` is the caller's
    /// last known value and may be used to avoid transferring an unchanged
    /// payload.
    async fn read(
        &self,
        resource: SyncResource,
        previous: Option<&UserContent>,
        headers: &SyncHeaders,
    ) -> SyncResult<UserContent>;

    /// Writes a new value, guarded by `if_match` when present. Returns the
    /// new ref.
    async fn write(
        &self,
        resource: SyncResource,
        content: &str,
        if_match: Option<&str>,
        headers: &SyncHeaders,
    ) -> SyncResult<String>;

    /// Fetches the content stored under a historical ref.
    async fn resolve_content(
        &self,
        resource: SyncResource,
        ref_: &str,
    ) -> SyncResult<Option<String>>;

    /// Lists all historical refs, newest first.
    async fn get_all_refs(&self, resource: SyncResource) -> SyncResult<Vec<RefRecord>>;
}

/// Epoch milliseconds, saturating to zero before the epoch.
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// One request observed by the in-memory remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteRequest {
    /// A read of the latest value.
    Read {
        /// Requested resource.
        resource: SyncResource,
    },
    /// A conditional write.
    Write {
        /// Written resource.
        resource: SyncResource,
        /// The `If-Match` ref the client supplied.
        if_match: Option<String>,
    },
    /// A historical-content lookup.
    Resolve {
        /// Requested resource.
        resource: SyncResource,
        /// Requested ref.
        ref_: String,
    },
    /// A ref listing.
    Refs {
        /// Requested resource.
        resource: SyncResource,
    },
}

#[derive(Debug, Clone)]
struct StoredVersion {
    created: u64,
    ref_: String,
    content: String,
}

#[derive(Debug, Default)]
struct ResourceHistory {
    versions: Vec<StoredVersion>,
    next_ref: u64,
}

impl ResourceHistory {
    fn current_ref(&self) -> String {
        self.versions
            .last()
            .map(|v| v.ref_.clone())
            .unwrap_or_else(|| "0".to_string())
    }
}

/// An in-memory remote store with controllable refs, conditional writes,
/// and a request log for assertions.
#[derive(Debug, Default)]
pub struct InMemoryRemoteStore {
    state: Mutex<HashMap<SyncResource, ResourceHistory>>,
    requests: Mutex<Vec<RemoteRequest>>,
    offline: AtomicBool,
}

impl InMemoryRemoteStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent request fail with a retryable transport error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// The current ref of a resource (`"0"` when never written).
    pub fn current_ref(&self, resource: SyncResource) -> String {
        self.state
            .lock()
            .get(&resource)
            .map(|h| h.current_ref())
            .unwrap_or_else(|| "0".to_string())
    }

    /// Writes a version as another machine would, bypassing preconditions
    /// and the request log. Returns the new ref.
    pub fn advance(&self, resource: SyncResource, content: impl Into<String>) -> String {
        let mut state = self.state.lock();
        let history = state.entry(resource).or_default();
        history.next_ref += 1;
        let ref_ = history.next_ref.to_string();
        history.versions.push(StoredVersion {
            created: now_millis(),
            ref_: ref_.clone(),
            content: content.into(),
        });
        ref_
    }

    /// All requests observed so far, in order.
    pub fn requests(&self) -> Vec<RemoteRequest> {
        self.requests.lock().clone()
    }

    /// Empties the request log.
    pub fn clear_requests(&self) {
        self.requests.lock().clear();
    }

    fn check_online(&self) -> SyncResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(SyncError::transport_retryable("remote store unreachable"))
        } else {
            Ok(())
        }
    }

    fn log(&self, request: RemoteRequest) {
        self.requests.lock().push(request);
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn read(
        &self,
        resource: SyncResource,
        _previous: Option<&UserContent>,
        _headers: &SyncHeaders,
    ) -> SyncResult<UserContent> {
        self.check_online()?;
        self.log(RemoteRequest::Read { resource });
        let state = self.state.lock();
        let history = state.get(&resource);
        Ok(UserContent {
            ref_: history.map(|h| h.current_ref()).unwrap_or_else(|| "0".to_string()),
            content: history.and_then(|h| h.versions.last().map(|v| v.content.clone())),
        })
    }

    async fn write(
        &self,
        resource: SyncResource,
        content: &str,
        if_match: Option<&str>,
        _headers: &SyncHeaders,
    ) -> SyncResult<String> {
        self.check_online()?;
        self.log(RemoteRequest::Write {
            resource,
            if_match: if_match.map(str::to_string),
        });
        let mut state = self.state.lock();
        let history = state.entry(resource).or_default();
        if let Some(expected) = if_match {
            if expected != history.current_ref() {
                return Err(SyncError::PreconditionFailed);
            }
        }
        history.next_ref += 1;
        let ref_ = history.next_ref.to_string();
        history.versions.push(StoredVersion {
            created: now_millis(),
            ref_: ref_.clone(),
            content: content.to_string(),
        });
        Ok(ref_)
    }

    async fn resolve_content(
        &self,
        resource: SyncResource,
        ref_: &str,
    ) -> SyncResult<Option<String>> {
        self.check_online()?;
        self.log(RemoteRequest::Resolve {
            resource,
            ref_: ref_.to_string(),
        });
        let state = self.state.lock();
        Ok(state.get(&resource).and_then(|h| {
            h.versions
                .iter()
                .find(|v| v.ref_ == ref_)
                .map(|v| v.content.clone())
        }))
    }

    async fn get_all_refs(&self, resource: SyncResource) -> SyncResult<Vec<RefRecord>> {
        self.check_online()?;
        self.log(RemoteRequest::Refs { resource });
        let state = self.state.lock();
        let mut refs: Vec<RefRecord> = state
            .get(&resource)
            .map(|h| {
                h.versions
                    .iter()
                    .map(|v| RefRecord {
                        created: v.created,
                        ref_: v.ref_.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        refs.reverse();
        Ok(refs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers() -> SyncHeaders {
        SyncHeaders::new()
    }

    #[tokio::test]
    async fn conditional_write_rejects_stale_ref() {
        let store = InMemoryRemoteStore::new();
        let first = store
            .write(SyncResource::Settings, "a", Some("0"), &headers())
            .await
            .unwrap();
        assert_eq!(first, "1");

        let stale = store
            .write(SyncResource::Settings, "b", Some("0"), &headers())
            .await;
        assert!(matches!(stale, Err(SyncError::PreconditionFailed)));

        let fresh = store
            .write(SyncResource::Settings, "b", Some("1"), &headers())
            .await
            .unwrap();
        assert_eq!(fresh, "2");
    }

    #[tokio::test]
    async fn read_of_missing_resource_has_no_content() {
        let store = InMemoryRemoteStore::new();
        let user = store
            .read(SyncResource::Snippets, None, &headers())
            .await
            .unwrap();
        assert_eq!(user.ref_, "0");
        assert_eq!(user.content, None);
    }

    #[tokio::test]
    async fn request_log_preserves_order() {
        let store = InMemoryRemoteStore::new();
        let _ = store.read(SyncResource::Settings, None, &headers()).await;
        let _ = store
            .write(SyncResource::Settings, "a", None, &headers())
            .await;
        assert_eq!(
            store.requests(),
            vec![
                RemoteRequest::Read {
                    resource: SyncResource::Settings
                },
                RemoteRequest::Write {
                    resource: SyncResource::Settings,
                    if_match: None
                },
            ]
        );

        store.clear_requests();
        assert!(store.requests().is_empty());
    }

    #[tokio::test]
    async fn advance_bypasses_log_and_preconditions() {
        let store = InMemoryRemoteStore::new();
        let ref_ = store.advance(SyncResource::Settings, "from another machine");
        assert_eq!(ref_, "1");
        assert!(store.requests().is_empty());
        assert_eq!(store.current_ref(SyncResource::Settings), "1");
    }

    #[tokio::test]
    async fn refs_listed_newest_first() {
        let store = InMemoryRemoteStore::new();
        store.advance(SyncResource::Settings, "a");
        store.advance(SyncResource::Settings, "b");
        let refs = store.get_all_refs(SyncResource::Settings).await.unwrap();
        assert_eq!(refs[0].ref_, "2");
        assert_eq!(refs[1].ref_, "1");
    }

    #[tokio::test]
    async fn offline_store_errors_are_retryable() {
        let store = InMemoryRemoteStore::new();
        store.set_offline(true);
        let err = store
            .read(SyncResource::Settings, None, &headers())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
