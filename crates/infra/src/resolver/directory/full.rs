//! Full replication: broadcast on write, periodic digest exchange.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use keyward_core::{TrustError, TrustResult};
use keyward_events::subjects;

use super::{DirectoryStore, SyncStrategy};
use crate::cluster::ClusterLink;
use crate::config::DirectoryMode;
use crate::workers::WorkerHandle;

#[derive(Debug, Clone)]
pub struct FullSync {
    link: Option<ClusterLink>,
    interval: Duration,
}

impl FullSync {
    pub fn new(link: Option<ClusterLink>, interval: Duration) -> Self {
        Self { link, interval }
    }
}

#[async_trait]
impl SyncStrategy for FullSync {
    fn mode(&self) -> DirectoryMode {
        DirectoryMode::Full
    }

    async fn on_miss(&self, account: &str) -> TrustResult<String> {
        Err(TrustError::not_found(account))
    }

    fn on_stored(&self, account: &str, jwt: &str) {
        let Some(link) = &self.link else {
            return;
        };
        if let Err(err) = link.publish(&subjects::account_update(account), jwt) {
            tracing::warn!(account, error = %err, "claim broadcast failed");
        }
    }

    fn spawn(self: Arc<Self>, store: Arc<DirectoryStore>) -> Vec<WorkerHandle> {
        let Some(link) = self.link.clone() else {
            return Vec::new();
        };
        let digest = WorkerHandle::every("directory-digest", self.interval, move || {
            let link = link.clone();
            let store = store.clone();
            async move {
                let digest = store.digest();
                let payload = match serde_json::to_string(&digest) {
                    Ok(p) => p,
                    Err(err) => {
                        tracing::error!(error = %err, "digest encoding failed");
                        return;
                    }
                };
                if let Err(err) = link.publish(subjects::CLAIMS_DIGEST, payload) {
                    tracing::warn!(error = %err, "digest publish failed");
                }
            }
        });
        vec![digest]
    }
}
