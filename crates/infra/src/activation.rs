//! Activation token retrieval.
//!
//! An import's token is either the activation JWT itself or an HTTP(S) URL
//! serving it.

use std::time::Duration;

use keyward_core::{TrustError, TrustResult};

#[derive(Debug, Clone)]
pub struct ActivationFetcher {
    http: reqwest::Client,
}

impl ActivationFetcher {
    pub fn new(timeout: Duration) -> TrustResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TrustError::fetch_failed(e.to_string()))?;
        Ok(Self { http })
    }

    pub fn is_url(token: &str) -> bool {
        token.starts_with("http://") || token.starts_with("https://")
    }

    /// The raw activation JWT for `token`.
    pub async fn resolve(&self, token: &str) -> TrustResult<String> {
        if !Self::is_url(token) {
            return Ok(token.to_string());
        }
        let response = self
            .http
            .get(token)
            .send()
            .await
            .map_err(|e| TrustError::fetch_failed(format!("activation {token}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TrustError::fetch_failed(format!("activation {token}: status {status}")));
        }
        let body = response
            .text()
            .await
            .map_err(|e| TrustError::fetch_failed(format!("activation {token}: {e}")))?;
        Ok(body.trim().to_string())
    }
}
