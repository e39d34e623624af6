// Resolver plumbing. The coordinator never decides which backend
// replica serves a shard; it asks a BackendInfoResolver and reacts to
// whatever comes back, same division of labor as estuary-flow's shard
// resolver sits in front of gazette's router.

use std::time::Duration;

use async_trait::async_trait;

use crate::envelope::SessionToken;
use crate::error::ResolverError;
use crate::ids::{BackendId, Cookie};

/// Everything a Connecting connection needs to stand up a Connected one:
/// which node is currently serving the shard, the session token the
/// backend minted for this client, and the transmit window it granted.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BackendInfo {
    pub backend: BackendId,
    pub session_token: SessionToken,
    pub max_outstanding: u32,
}

/// External collaborator that answers "who serves this shard right now,
/// and what session do I get." Resolution is async and may be slow (a
/// consensus round, a directory lookup) or may fail outright; the
/// coordinator treats both uniformly via [`ResolverError`] and retries
/// on its own schedule (`ClientConfig::resolver_retry_delay`).
#[async_trait]
pub trait BackendInfoResolver: Send + Sync {
    async fn resolve(&self, cookie: Cookie) -> Result<BackendInfo, ResolverError>;
}

/// Wraps a resolver with a hard deadline, turning a resolver that simply
/// never completes into a `ResolverError::Timeout` the coordinator can
/// act on: resolution that never completes must not wedge the shard
/// forever.
pub struct TimeoutResolver<R> {
    inner: R,
    timeout: Duration,
}

impl<R> TimeoutResolver<R> {
    pub fn new(inner: R, timeout: Duration) -> Self {
        TimeoutResolver { inner, timeout }
    }
}

#[async_trait]
impl<R: BackendInfoResolver> BackendInfoResolver for TimeoutResolver<R> {
    async fn resolve(&self, cookie: Cookie) -> Result<BackendInfo, ResolverError> {
        match tokio::time::timeout(self.timeout, self.inner.resolve(cookie)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(ResolverError::Timeout),
        }
    }
}
