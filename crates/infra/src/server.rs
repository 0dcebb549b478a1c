//! Node facade: connection handshake, claim administration and the message
//! delivery shim that end-to-end checks drive.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use parking_lot::Mutex;
use rand_core::{OsRng, RngCore};
use tokio::sync::mpsc;
use tokio::time::Instant;

use keyward_accounts::{ClientEvent, ClientId, ClientSession, DisconnectReason};
use keyward_auth::{AccountClaims, TrustConfig, UserClaims, jwt, verify_user};
use keyward_core::{PublicKey, TrustError, TrustResult};
use keyward_events::{UpdateResponse, subjects};

use crate::account_task::AccountHandle;
use crate::cluster::worker::error_code;
use crate::cluster::{ClusterLink, PropagationWorker, SystemBus};
use crate::config::{Options, ResolverConfig};
use crate::registry::{AccountRegistry, ClaimOrigin};
use crate::resolver::{self, AccountResolver};
use crate::workers::WorkerHandle;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// What a client presents when connecting.
#[derive(Debug, Clone, Default)]
pub struct ConnectRequest {
    /// Signed user claim.
    pub jwt: String,
    /// Nonce previously issued by [`Server::nonce`].
    pub nonce: Option<String>,
    /// base64url signature of the nonce by the user key.
    pub sig: Option<String>,
    pub client_ip: Option<IpAddr>,
}

impl ConnectRequest {
    pub fn bearer(jwt: impl Into<String>) -> Self {
        Self {
            jwt: jwt.into(),
            ..Self::default()
        }
    }

    pub fn signed(jwt: impl Into<String>, nonce: impl Into<String>, sig: impl Into<String>) -> Self {
        Self {
            jwt: jwt.into(),
            nonce: Some(nonce.into()),
            sig: Some(sig.into()),
            client_ip: None,
        }
    }

    pub fn from_ip(mut self, ip: IpAddr) -> Self {
        self.client_ip = Some(ip);
        self
    }
}

/// An admitted client. Dropping it closes the session.
#[derive(Debug)]
pub struct ClientConnection {
    pub id: ClientId,
    pub account: PublicKey,
    pub user: PublicKey,
    events: mpsc::UnboundedReceiver<ClientEvent>,
    handle: AccountHandle,
}

impl ClientConnection {
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        self.events.recv().await
    }

    /// Next event, or `None` if nothing arrives within `timeout`.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<ClientEvent> {
        tokio::time::timeout(timeout, self.events.recv()).await.ok().flatten()
    }

    pub fn try_recv(&mut self) -> Option<ClientEvent> {
        self.events.try_recv().ok()
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        self.events.close();
        self.handle.release(self.id);
    }
}

pub struct Server {
    options: Options,
    registry: AccountRegistry,
    link: Option<ClusterLink>,
    workers: Mutex<Vec<WorkerHandle>>,
    /// Outstanding challenges and when they were issued.
    nonces: Mutex<HashMap<String, Instant>>,
    next_client: AtomicU64,
}

impl Server {
    /// Build the configured resolver and start the node. With a bus the node
    /// joins the cluster reachable through it.
    pub async fn start(options: Options, bus: Option<SystemBus>) -> TrustResult<Self> {
        let link = bus.map(|bus| ClusterLink::new(options.server_name.clone(), bus));
        let resolver = resolver::build(&options, link.clone()).await?;
        Self::start_with_resolver(options, resolver, link).await
    }

    pub async fn start_with_resolver(
        options: Options,
        resolver: Arc<dyn AccountResolver>,
        link: Option<ClusterLink>,
    ) -> TrustResult<Self> {
        let validator = Arc::new(keyward_auth::Validator::new(options.trust_config(Utc::now())?));
        let registry = AccountRegistry::new(resolver.clone(), validator, &options)?;

        for (account, raw) in options.preload() {
            if let Err(err) = registry.apply_claim(account, raw, ClaimOrigin::Local).await {
                tracing::warn!(account = %account, error = %err, "preloaded claim rejected");
            }
        }

        let mut workers = resolver.start();
        if let Some(link) = &link {
            let timeout = match &options.resolver {
                ResolverConfig::Directory(dir) => dir.request_timeout(),
                _ => DEFAULT_REQUEST_TIMEOUT,
            };
            workers.push(PropagationWorker::spawn(link.clone(), registry.clone(), timeout));
        }
        tracing::info!(server = %options.server_name, workers = workers.len(), "server started");

        Ok(Self {
            options,
            registry,
            link,
            workers: Mutex::new(workers),
            nonces: Mutex::new(HashMap::new()),
            next_client: AtomicU64::new(1),
        })
    }

    pub fn name(&self) -> &str {
        &self.options.server_name
    }

    pub fn registry(&self) -> &AccountRegistry {
        &self.registry
    }

    pub fn resolver(&self) -> &Arc<dyn AccountResolver> {
        self.registry.resolver()
    }

    /// Replace the trusted operators. Loaded accounts keep their claims.
    pub fn reload_trust(&self, trust: TrustConfig) {
        self.registry.validator().reload(trust);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Handshake
    // ─────────────────────────────────────────────────────────────────────────

    /// Issue a single-use challenge, redeemable for the configured nonce TTL.
    pub fn nonce(&self) -> String {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        let nonce = URL_SAFE_NO_PAD.encode(bytes);
        let ttl = self.options.nonce_ttl();
        let now = Instant::now();
        let mut nonces = self.nonces.lock();
        nonces.retain(|_, issued| now.duration_since(*issued) < ttl);
        nonces.insert(nonce.clone(), now);
        nonce
    }

    /// Challenges issued and not yet redeemed or expired.
    pub fn pending_nonces(&self) -> usize {
        let ttl = self.options.nonce_ttl();
        self.nonces.lock().values().filter(|issued| issued.elapsed() < ttl).count()
    }

    /// Admit a client or report why not. The error's
    /// [`TrustError::client_text`] is what the client is told.
    pub async fn connect(&self, request: ConnectRequest) -> TrustResult<ClientConnection> {
        let result = self.admit(request).await;
        if let Err(err) = &result {
            tracing::warn!(error = %err, reason = err.client_text(), "connection refused");
        }
        result
    }

    async fn admit(&self, request: ConnectRequest) -> TrustResult<ClientConnection> {
        let user: UserClaims = jwt::decode(&request.jwt)?;
        if !user.data.bearer_token {
            self.check_challenge(&user, &request)?;
        }

        let account = self.registry.lookup(user.account()).await?;
        let id = ClientId::new(self.next_client.fetch_add(1, Ordering::Relaxed));
        let (outbox, events) = mpsc::unbounded_channel();
        let now = Utc::now();
        let user_key = user.sub.clone();
        let session = account.with(|a| {
            let signer = verify_user(&user, a.issuer_context(), now, request.client_ip)?;
            ClientSession::new(id, user, signer, a.limits(), now, outbox)
        })?;
        account.connect(session).await?;

        Ok(ClientConnection {
            id,
            account: account.id().clone(),
            user: user_key,
            events,
            handle: account,
        })
    }

    fn check_challenge(&self, user: &UserClaims, request: &ConnectRequest) -> TrustResult<()> {
        let nonce = request
            .nonce
            .as_deref()
            .ok_or_else(|| TrustError::unauthorized("nonce signature required"))?;
        let issued = self.nonces.lock().remove(nonce);
        if !issued.is_some_and(|at| at.elapsed() < self.options.nonce_ttl()) {
            return Err(TrustError::unauthorized("unknown or reused nonce"));
        }
        let sig = request
            .sig
            .as_deref()
            .ok_or_else(|| TrustError::unauthorized("nonce signature required"))?;
        let sig = URL_SAFE_NO_PAD.decode(sig).map_err(|_| TrustError::BadSignature)?;
        user.sub.verify(nonce.as_bytes(), &sig)
    }

    pub async fn disconnect(&self, client: &ClientConnection) -> bool {
        match self.registry.get(&client.account) {
            Some(account) => account.disconnect(client.id, DisconnectReason::ClientClosed).await,
            None => false,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Delivery
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn subscribe(&self, client: &ClientConnection, sid: u64, subject: &str) -> TrustResult<()> {
        let account = self
            .registry
            .get(&client.account)
            .ok_or_else(|| TrustError::not_found(client.account.to_string()))?;
        account.subscribe(client.id, sid, subject).await
    }

    pub async fn unsubscribe(&self, client: &ClientConnection, sid: u64) -> bool {
        match self.registry.get(&client.account) {
            Some(account) => account.unsubscribe(client.id, sid).await,
            None => false,
        }
    }

    /// Publish as `client`. Returns the number of deliveries made.
    pub fn publish(
        &self,
        client: &ClientConnection,
        subject: &str,
        reply: Option<&str>,
        payload: &[u8],
    ) -> TrustResult<usize> {
        let now = Utc::now();
        let account = self
            .registry
            .get(&client.account)
            .ok_or_else(|| TrustError::not_found(client.account.to_string()))?;
        account.with(|a| a.authorize_publish(client.id, subject, payload.len(), now))?;

        let mut delivered = account.with(|a| a.deliver_local(subject, reply, payload, now));

        for importer in self.registry.importers_of(&client.account) {
            delivered += importer.with(|a| a.deliver_import(&client.account, subject, reply, payload, now));
        }

        let service = account.with(|a| {
            a.service_import_for(subject, now)
                .map(|(imp, mapped)| (imp.exporter().clone(), mapped, imp.response_type))
        });
        if let Some((exporter, mapped, response_type)) = service {
            if let Some(exporter) = self.registry.get(&exporter) {
                if let Some(reply) = reply {
                    exporter.with(|a| a.add_response_route(reply, client.account.clone(), response_type, now));
                }
                delivered += exporter.with(|a| a.deliver_local(&mapped, reply, payload, now));
            }
        }

        if let Some(importer) = account.with(|a| a.take_response_route(subject, now)) {
            if let Some(importer) = self.registry.get(&importer) {
                delivered += importer.with(|a| a.deliver_local(subject, None, payload, now));
            }
        }
        Ok(delivered)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Claim administration
    // ─────────────────────────────────────────────────────────────────────────

    /// Apply a claim submitted to this node.
    pub async fn update_account_claims(&self, raw: &str) -> UpdateResponse {
        let account = match jwt::decode::<keyward_auth::AccountData>(raw) {
            Ok(claims) => claims.sub.to_string(),
            Err(err) => return UpdateResponse::error("", 400, err.to_string()),
        };
        match self.registry.apply_claim(&account, raw, ClaimOrigin::Local).await {
            Ok(_) => UpdateResponse::ok(account, "jwt updated"),
            Err(err) => {
                tracing::warn!(account = %account, error = %err, "claim update refused");
                UpdateResponse::error(account, error_code(&err), err.to_string())
            }
        }
    }

    /// Apply a claim here and send it to every node, collecting the answers
    /// that arrive within `window`. This node's answer comes first.
    pub async fn propagate_claim(&self, raw: &str, window: Duration) -> TrustResult<Vec<UpdateResponse>> {
        let local = self.update_account_claims(raw).await;
        let mut responses = vec![local];
        let Some(link) = &self.link else {
            return Ok(responses);
        };
        let claims: AccountClaims = jwt::decode(raw)?;
        let replies = link
            .request_many(&subjects::account_update(claims.sub.as_str()), raw, window)
            .await?;
        responses.extend(replies.iter().filter_map(|r| UpdateResponse::from_json(r.payload())));
        Ok(responses)
    }

    /// Stop background workers and every account task.
    pub async fn shutdown(&self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            worker.shutdown().await;
        }
        self.registry.shutdown().await;
        tracing::info!(server = %self.options.server_name, "server stopped");
    }
}

impl core::fmt::Debug for Server {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.options.server_name)
            .field("registry", &self.registry)
            .field("link", &self.link)
            .finish_non_exhaustive()
    }
}
