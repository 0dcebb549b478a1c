//! Answers the system-bus traffic addressed to this node.
//!
//! The read loop never blocks: inbox replies are dispatched inline and every
//! request is handled on its own task, so a handler waiting on a reply of
//! its own cannot stall the loop that would deliver it.

use std::collections::HashMap;
use std::time::Duration;

use keyward_core::TrustError;
use keyward_events::{ClaimsDigest, SystemMessage, SystemSubject, UpdateResponse, subjects};

use super::ClusterLink;
use crate::registry::{AccountRegistry, ClaimOrigin};
use crate::workers::WorkerHandle;

pub struct PropagationWorker;

impl PropagationWorker {
    pub fn spawn(link: ClusterLink, registry: AccountRegistry, request_timeout: Duration) -> WorkerHandle {
        let mut sub = link.subscribe();
        WorkerHandle::spawn("claims-propagation", move |mut shutdown| async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown => break,
                    message = sub.recv() => match message {
                        Some(message) => route(&link, &registry, request_timeout, message),
                        None => break,
                    },
                }
            }
        })
    }
}

fn route(link: &ClusterLink, registry: &AccountRegistry, request_timeout: Duration, message: SystemMessage) {
    let Some(subject) = SystemSubject::parse(message.subject()) else {
        return;
    };
    if let SystemSubject::Inbox(_) = subject {
        link.dispatch_reply(message);
        return;
    }
    if message.origin() == link.node() {
        return;
    }
    let link = link.clone();
    let registry = registry.clone();
    tokio::spawn(async move {
        match SystemSubject::parse(message.subject()) {
            Some(SystemSubject::Update(account)) => on_update(&link, &registry, account, &message).await,
            Some(SystemSubject::Lookup(account)) => on_lookup(&link, &registry, account, &message).await,
            Some(SystemSubject::Digest) => on_digest(&link, &registry, request_timeout, &message).await,
            _ => {}
        }
    });
}

/// Status code of an update response reporting `err`.
pub(crate) fn error_code(err: &TrustError) -> u16 {
    match err {
        TrustError::Io(_) | TrustError::LimitExceeded(_) | TrustError::ReadOnly | TrustError::FetchFailed(_) => 500,
        _ => 400,
    }
}

async fn on_update(link: &ClusterLink, registry: &AccountRegistry, account: &str, message: &SystemMessage) {
    let response = match registry
        .apply_claim(account, message.payload(), ClaimOrigin::Cluster)
        .await
    {
        Ok(_) => UpdateResponse::ok(account, "jwt updated"),
        Err(err) => {
            tracing::warn!(account, origin = message.origin(), error = %err, "replicated claim refused");
            UpdateResponse::error(account, error_code(&err), err.to_string())
        }
    };
    if let Some(reply) = message.reply() {
        if let Err(err) = link.reply(reply, response.to_json()) {
            tracing::debug!(account, error = %err, "update response not sent");
        }
    }
}

async fn on_lookup(link: &ClusterLink, registry: &AccountRegistry, account: &str, message: &SystemMessage) {
    let target = message.payload();
    if !target.is_empty() && target != link.node() {
        return;
    }
    let Some(reply) = message.reply() else {
        return;
    };
    let resolver = registry.resolver();
    let answer = match resolver.local(account).await {
        Ok(Some(raw)) => raw,
        // Only a node holding every claim may say "unknown".
        Ok(None) if resolver.is_authoritative() => String::new(),
        Ok(None) => return,
        Err(err) => {
            tracing::warn!(account, error = %err, "lookup failed");
            return;
        }
    };
    if let Err(err) = link.reply(reply, answer) {
        tracing::debug!(account, error = %err, "lookup reply not sent");
    }
}

/// Pull every claim a peer holds in a newer version than this node.
async fn on_digest(link: &ClusterLink, registry: &AccountRegistry, request_timeout: Duration, message: &SystemMessage) {
    let Some(local) = registry.resolver().digest() else {
        return;
    };
    let peer: ClaimsDigest = match serde_json::from_str(message.payload()) {
        Ok(digest) => digest,
        Err(err) => {
            tracing::warn!(origin = message.origin(), error = %err, "malformed digest");
            return;
        }
    };
    let held: HashMap<&str, i64> = local.entries.iter().map(|e| (e.account.as_str(), e.iat)).collect();
    for entry in &peer.entries {
        if held.get(entry.account.as_str()).is_some_and(|iat| *iat >= entry.iat) {
            continue;
        }
        let reply = match link
            .request(&subjects::account_lookup(&entry.account), message.origin(), request_timeout)
            .await
        {
            Ok(reply) if !reply.payload().is_empty() => reply,
            Ok(_) => continue,
            Err(err) => {
                tracing::debug!(account = %entry.account, error = %err, "digest lookup failed");
                continue;
            }
        };
        match registry
            .apply_claim(&entry.account, reply.payload(), ClaimOrigin::Cluster)
            .await
        {
            Ok(_) => tracing::info!(account = %entry.account, origin = message.origin(), "claim repaired from digest"),
            Err(err) => tracing::warn!(account = %entry.account, error = %err, "digest claim refused"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_failures_map_to_server_errors() {
        assert_eq!(error_code(&TrustError::io("disk full")), 500);
        assert_eq!(error_code(&TrustError::LimitExceeded(keyward_core::LimitKind::StoredClaims)), 500);
        assert_eq!(error_code(&TrustError::BadSignature), 400);
        assert_eq!(error_code(&TrustError::untrusted("OABC")), 400);
    }
}
