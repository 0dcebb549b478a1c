//! Account claim resolution.
//!
//! A resolver maps an account identity to the latest raw claim it has seen.
//! It does not decide whether a claim is trusted; callers validate what
//! they fetch.
//!
//! Backends:
//! - [`MemoryResolver`]: an in-process table.
//! - [`UrlResolver`]: HTTP GET against a base URL, read-only.
//! - [`DirectoryResolver`]: one file per identity, replicated across the
//!   cluster by a [`directory::SyncStrategy`] (full copy or cache).

pub mod directory;
pub mod memory;
pub mod url;

use std::sync::Arc;

use async_trait::async_trait;

use keyward_auth::{AccountClaims, jwt};
use keyward_core::{TrustError, TrustResult};
use keyward_events::ClaimsDigest;

use crate::cluster::ClusterLink;
use crate::config::{Options, ResolverConfig};
use crate::workers::WorkerHandle;

pub use directory::DirectoryResolver;
pub use memory::MemoryResolver;
pub use url::UrlResolver;

#[async_trait]
pub trait AccountResolver: Send + Sync {
    /// Latest raw claim for `account`.
    async fn fetch(&self, account: &str) -> TrustResult<String>;

    /// Store a claim submitted to this node. Backends that replicate may
    /// announce it to the cluster.
    async fn store(&self, account: &str, jwt: &str) -> TrustResult<()> {
        let _ = (account, jwt);
        Err(TrustError::ReadOnly)
    }

    /// Store a claim learned from another node. Never re-announced.
    async fn store_replicated(&self, account: &str, jwt: &str) -> TrustResult<()> {
        self.store(account, jwt).await
    }

    /// Claim held locally, without any remote lookup.
    async fn local(&self, account: &str) -> TrustResult<Option<String>> {
        let _ = account;
        Ok(None)
    }

    fn is_read_only(&self) -> bool {
        true
    }

    /// Holds every claim of the cluster, so a local miss is authoritative.
    fn is_authoritative(&self) -> bool {
        false
    }

    /// Identity and issued-at of every held claim, for nodes that exchange
    /// digests.
    fn digest(&self) -> Option<ClaimsDigest> {
        None
    }

    /// Start background work (sync, expiry sweeps).
    fn start(self: Arc<Self>) -> Vec<WorkerHandle> {
        Vec::new()
    }
}

/// Decode just enough of a raw account claim to order versions.
pub(crate) fn peek_account(account: &str, raw: &str) -> TrustResult<AccountClaims> {
    let claims: AccountClaims = jwt::decode(raw)?;
    if claims.sub.as_str() != account {
        return Err(TrustError::malformed(format!(
            "claim subject {} does not match {account}",
            claims.sub
        )));
    }
    Ok(claims)
}

/// Build the resolver described by `options`.
pub async fn build(options: &Options, link: Option<ClusterLink>) -> TrustResult<Arc<dyn AccountResolver>> {
    let resolver: Arc<dyn AccountResolver> = match &options.resolver {
        ResolverConfig::Memory { .. } => Arc::new(MemoryResolver::new()),
        ResolverConfig::Url { url, timeout_ms } => {
            Arc::new(UrlResolver::new(url, std::time::Duration::from_millis(*timeout_ms))?)
        }
        ResolverConfig::Directory(config) => Arc::new(DirectoryResolver::open(config, link).await?),
    };
    Ok(resolver)
}
