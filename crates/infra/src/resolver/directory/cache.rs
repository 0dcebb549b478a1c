//! Cache replication: lookup on miss, TTL eviction.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use keyward_core::{TrustError, TrustResult};
use keyward_events::subjects;

use super::{DirectoryStore, SyncStrategy};
use crate::cluster::ClusterLink;
use crate::config::DirectoryMode;
use crate::workers::WorkerHandle;

const MIN_SWEEP: Duration = Duration::from_millis(10);
const MAX_SWEEP: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct CacheSync {
    link: Option<ClusterLink>,
    request_timeout: Duration,
    ttl: Duration,
}

impl CacheSync {
    pub fn new(link: Option<ClusterLink>, request_timeout: Duration, ttl: Duration) -> Self {
        Self {
            link,
            request_timeout,
            ttl,
        }
    }

    fn sweep_period(&self) -> Duration {
        (self.ttl / 4).clamp(MIN_SWEEP, MAX_SWEEP)
    }
}

#[async_trait]
impl SyncStrategy for CacheSync {
    fn mode(&self) -> DirectoryMode {
        DirectoryMode::Cache
    }

    /// One lookup per call. An empty reply means a peer holding every claim
    /// confirmed the account is unknown; that answer is not remembered.
    async fn on_miss(&self, account: &str) -> TrustResult<String> {
        let Some(link) = &self.link else {
            return Err(TrustError::not_found(account));
        };
        let reply = link
            .request(&subjects::account_lookup(account), "", self.request_timeout)
            .await?;
        if reply.payload().is_empty() {
            tracing::debug!(account, node = reply.origin(), "account unknown to cluster");
            return Err(TrustError::not_found(account));
        }
        Ok(reply.into_payload())
    }

    fn on_stored(&self, _account: &str, _jwt: &str) {}

    fn spawn(self: Arc<Self>, store: Arc<DirectoryStore>) -> Vec<WorkerHandle> {
        let sweeper = WorkerHandle::every("directory-cache-sweep", self.sweep_period(), move || {
            let store = store.clone();
            async move {
                store.sweep_expired().await;
            }
        });
        vec![sweeper]
    }
}
