//! In-process resolver.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use keyward_auth::{Offer, VersionState};
use keyward_core::{TrustError, TrustResult};

use super::{AccountResolver, peek_account};

#[derive(Debug, Default)]
pub struct MemoryResolver {
    entries: RwLock<HashMap<String, (VersionState, String)>>,
}

impl MemoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn put(&self, account: &str, jwt: &str) -> TrustResult<Offer> {
        let claims = peek_account(account, jwt)?;
        let mut entries = self.entries.write();
        let offer = match entries.get_mut(account) {
            Some((version, raw)) => {
                let offer = version.offer(claims.iat, &claims.jti);
                if offer == Offer::Newer {
                    *raw = jwt.to_string();
                }
                offer
            }
            None => {
                entries.insert(
                    account.to_string(),
                    (VersionState::new(claims.iat, claims.jti), jwt.to_string()),
                );
                Offer::Newer
            }
        };
        Ok(offer)
    }
}

#[async_trait]
impl AccountResolver for MemoryResolver {
    async fn fetch(&self, account: &str) -> TrustResult<String> {
        self.entries
            .read()
            .get(account)
            .map(|(_, raw)| raw.clone())
            .ok_or_else(|| TrustError::not_found(account))
    }

    async fn store(&self, account: &str, jwt: &str) -> TrustResult<()> {
        if self.put(account, jwt)? == Offer::Stale {
            tracing::debug!(account, "ignoring stale claim");
        }
        Ok(())
    }

    async fn local(&self, account: &str) -> TrustResult<Option<String>> {
        Ok(self.entries.read().get(account).map(|(_, raw)| raw.clone()))
    }

    fn is_read_only(&self) -> bool {
        false
    }
}
