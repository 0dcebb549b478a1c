//! HTTP resolver.
//!
//! `GET <base>/<account>` returns the raw claim. Failures are not cached;
//! the next fetch tries again.

use std::time::Duration;

use async_trait::async_trait;

use keyward_core::{TrustError, TrustResult};

use super::AccountResolver;

#[derive(Debug, Clone)]
pub struct UrlResolver {
    base: String,
    http: reqwest::Client,
}

impl UrlResolver {
    pub fn new(base: &str, timeout: Duration) -> TrustResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TrustError::fetch_failed(e.to_string()))?;
        let base = if base.ends_with('/') {
            base.to_string()
        } else {
            format!("{base}/")
        };
        Ok(Self { base, http })
    }

    pub fn url_for(&self, account: &str) -> String {
        format!("{}{account}", self.base)
    }
}

#[async_trait]
impl AccountResolver for UrlResolver {
    async fn fetch(&self, account: &str) -> TrustResult<String> {
        let url = self.url_for(account);
        let response = self.http.get(&url).send().await.map_err(|e| {
            tracing::warn!(account, error = %e, "account claim fetch failed");
            TrustError::fetch_failed(format!("{url}: {e}"))
        })?;
        let status = response.status();
        if !status.is_success() {
            tracing::debug!(account, %status, "account claim fetch rejected");
            return Err(TrustError::fetch_failed(format!("{url}: status {status}")));
        }
        let body = response
            .text()
            .await
            .map_err(|e| TrustError::fetch_failed(format!("{url}: {e}")))?;
        Ok(body.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_base_and_identity() {
        let r = UrlResolver::new("http://localhost:9090/jwt/v1/accounts", Duration::from_secs(1)).unwrap();
        assert_eq!(r.url_for("AXYZ"), "http://localhost:9090/jwt/v1/accounts/AXYZ");
        let r = UrlResolver::new("http://localhost:9090/accounts/", Duration::from_secs(1)).unwrap();
        assert_eq!(r.url_for("AXYZ"), "http://localhost:9090/accounts/AXYZ");
        assert!(r.is_read_only());
    }
}
