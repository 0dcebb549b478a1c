//! Cluster-replicated directory resolver.
//!
//! Claims live in a [`DirectoryStore`]; how the directory stays in step with
//! the rest of the cluster is up to its [`SyncStrategy`]:
//!
//! - [`FullSync`]: every node keeps every claim. Local writes are broadcast
//!   and nodes periodically exchange digests to repair missed updates.
//! - [`CacheSync`]: only recently used claims are kept, each for a TTL. A
//!   miss asks the cluster with a single lookup request.

pub mod cache;
pub mod full;
pub mod store;

use std::sync::Arc;

use async_trait::async_trait;

use keyward_core::TrustResult;
use keyward_events::ClaimsDigest;

use crate::cluster::ClusterLink;
use crate::config::{DirectoryConfig, DirectoryMode};
use crate::resolver::AccountResolver;
use crate::workers::WorkerHandle;

pub use cache::CacheSync;
pub use full::FullSync;
pub use store::{DirectoryStore, LimitPolicy, PutOutcome};

#[async_trait]
pub trait SyncStrategy: Send + Sync {
    fn mode(&self) -> DirectoryMode;

    /// Produce a claim the local store does not hold.
    async fn on_miss(&self, account: &str) -> TrustResult<String>;

    /// A claim submitted to this node was stored.
    fn on_stored(&self, account: &str, jwt: &str);

    /// Background work for this strategy.
    fn spawn(self: Arc<Self>, store: Arc<DirectoryStore>) -> Vec<WorkerHandle>;
}

pub struct DirectoryResolver {
    store: Arc<DirectoryStore>,
    strategy: Arc<dyn SyncStrategy>,
}

impl DirectoryResolver {
    pub async fn open(config: &DirectoryConfig, link: Option<ClusterLink>) -> TrustResult<Self> {
        let (policy, ttl) = match config.mode {
            DirectoryMode::Full => (LimitPolicy::Reject, None),
            DirectoryMode::Cache => (LimitPolicy::EvictLru, Some(config.ttl())),
        };
        let store = Arc::new(DirectoryStore::open(&config.dir, config.limit, policy, ttl).await?);
        let strategy: Arc<dyn SyncStrategy> = match config.mode {
            DirectoryMode::Full => Arc::new(FullSync::new(link, config.interval())),
            DirectoryMode::Cache => Arc::new(CacheSync::new(link, config.request_timeout(), config.ttl())),
        };
        Ok(Self::with_strategy(store, strategy))
    }

    pub fn with_strategy(store: Arc<DirectoryStore>, strategy: Arc<dyn SyncStrategy>) -> Self {
        Self { store, strategy }
    }

    pub fn files(&self) -> &Arc<DirectoryStore> {
        &self.store
    }

    pub fn mode(&self) -> DirectoryMode {
        self.strategy.mode()
    }
}

#[async_trait]
impl AccountResolver for DirectoryResolver {
    async fn fetch(&self, account: &str) -> TrustResult<String> {
        if let Some(raw) = self.store.get(account).await? {
            return Ok(raw);
        }
        let raw = self.strategy.on_miss(account).await?;
        if let Err(err) = self.store.put(account, &raw).await {
            tracing::warn!(account, error = %err, "fetched claim not cached");
        }
        Ok(raw)
    }

    async fn store(&self, account: &str, jwt: &str) -> TrustResult<()> {
        if self.store.put(account, jwt).await? == PutOutcome::Stored {
            self.strategy.on_stored(account, jwt);
        }
        Ok(())
    }

    async fn store_replicated(&self, account: &str, jwt: &str) -> TrustResult<()> {
        // A cache only refreshes what it already holds.
        if self.mode() == DirectoryMode::Cache && !self.store.contains(account) {
            return Ok(());
        }
        self.store.put(account, jwt).await.map(|_| ())
    }

    async fn local(&self, account: &str) -> TrustResult<Option<String>> {
        self.store.get(account).await
    }

    fn is_read_only(&self) -> bool {
        false
    }

    fn is_authoritative(&self) -> bool {
        self.mode() == DirectoryMode::Full
    }

    fn digest(&self) -> Option<ClaimsDigest> {
        (self.mode() == DirectoryMode::Full).then(|| self.store.digest())
    }

    fn start(self: Arc<Self>) -> Vec<WorkerHandle> {
        self.strategy.clone().spawn(self.store.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyward_auth::{AccountClaims, AccountData};
    use keyward_core::{KeyKind, KeyPair, TrustError};

    #[tokio::test]
    async fn standalone_full_directory_reports_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = DirectoryResolver::open(&DirectoryConfig::new(dir.path(), DirectoryMode::Full), None)
            .await
            .unwrap();
        let operator = KeyPair::generate(KeyKind::Operator);
        let account = KeyPair::generate(KeyKind::Account);
        let id = account.public_key().to_string();

        assert!(matches!(resolver.fetch(&id).await, Err(TrustError::NotFound(_))));
        let raw = AccountClaims::new(account.public_key(), AccountData::default())
            .encode(&operator)
            .unwrap();
        resolver.store(&id, &raw).await.unwrap();
        assert_eq!(resolver.fetch(&id).await.unwrap(), raw);
        assert!(resolver.is_authoritative());
        assert_eq!(resolver.digest().map(|d| d.entries.len()), Some(1));
    }

    #[tokio::test]
    async fn cache_ignores_replicated_claims_it_never_asked_for() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = DirectoryResolver::open(&DirectoryConfig::new(dir.path(), DirectoryMode::Cache), None)
            .await
            .unwrap();
        let operator = KeyPair::generate(KeyKind::Operator);
        let account = KeyPair::generate(KeyKind::Account);
        let id = account.public_key().to_string();
        let raw = AccountClaims::new(account.public_key(), AccountData::default())
            .encode(&operator)
            .unwrap();
        resolver.store_replicated(&id, &raw).await.unwrap();
        assert!(resolver.files().is_empty());
        assert!(resolver.digest().is_none());
    }
}
