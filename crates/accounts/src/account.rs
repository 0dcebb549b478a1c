//! Account entity.
//!
//! Runtime state built from an account claim: effective limits, signing keys,
//! exports, authorized imports, revocations, the connected-client roster and
//! the shadow subscriptions derived for those clients.
//!
//! ## Versioning
//!
//! A claim version is its `iat` (seconds). Updates with an older `iat` are
//! stale. A different claim with the same `iat` replaces the applied one and
//! the replaced `jti` is remembered, so a late redelivery of it is stale too.
//! Re-applying the applied claim is a no-op.
//!
//! ## Mutation
//!
//! Methods taking `&mut self` are meant to be called by the single task that
//! owns the account. Delivery and publish checks take `&self` and are safe
//! under a shared lock.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;

use keyward_auth::validation::check_time_bounds;
use keyward_auth::{
    AccountClaims, Export, ExportKind, Import, IssuerContext, Offer, ResponseType, Revocations, VersionState,
};
use keyward_core::{LimitKind, PublicKey, TrustError, TrustResult, subject};

use crate::client::{ClientId, ClientSession, ClientSub, DisconnectReason};
use crate::imports::{ExportSnapshot, ResolvedImport};
use crate::limits::{EffectiveLimits, ServerLimits};
use crate::shadow::{ImportKey, Shadow, ShadowId, ShadowTable};

/// How long an exporter may answer a cross-account request.
pub const RESPONSE_ROUTE_TTL_SECS: i64 = 120;

/// Result of offering a claim to [`Account::update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The claim is the one already applied.
    Unchanged,
    /// Older than, or superseded by, the applied claim.
    Stale,
    /// Applied; these sessions were closed as a consequence.
    Applied { evicted: Vec<(ClientId, DisconnectReason)> },
}

impl UpdateOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, UpdateOutcome::Applied { .. })
    }
}

#[derive(Debug, Clone)]
struct ResponseRoute {
    importer: PublicKey,
    remaining: Option<u32>,
    deadline: DateTime<Utc>,
}

#[derive(Debug)]
pub struct Account {
    id: PublicKey,
    claims: Arc<AccountClaims>,
    raw: String,
    version: VersionState,
    server_limits: ServerLimits,
    limits: EffectiveLimits,
    expired: bool,
    updated: DateTime<Utc>,
    imports: BTreeMap<ImportKey, ResolvedImport>,
    clients: BTreeMap<ClientId, ClientSession>,
    shadows: ShadowTable,
    response_routes: Mutex<BTreeMap<String, ResponseRoute>>,
}

impl Account {
    /// Build from an already validated claim. Imports start unresolved.
    pub fn new(claims: AccountClaims, raw: String, server_limits: ServerLimits, now: DateTime<Utc>) -> Self {
        let limits = EffectiveLimits::for_account(&server_limits, &claims.data.limits);
        Self {
            id: claims.sub.clone(),
            expired: check_time_bounds(&claims, now).is_err(),
            version: VersionState::new(claims.iat, claims.jti.clone()),
            claims: Arc::new(claims),
            raw,
            server_limits,
            limits,
            updated: now,
            imports: BTreeMap::new(),
            clients: BTreeMap::new(),
            shadows: ShadowTable::default(),
            response_routes: Mutex::new(BTreeMap::new()),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn id(&self) -> &PublicKey {
        &self.id
    }

    pub fn claims(&self) -> &Arc<AccountClaims> {
        &self.claims
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn iat(&self) -> i64 {
        self.claims.iat
    }

    pub fn jti(&self) -> &str {
        &self.claims.jti
    }

    pub fn limits(&self) -> &EffectiveLimits {
        &self.limits
    }

    pub fn signing_keys(&self) -> &BTreeSet<PublicKey> {
        &self.claims.data.signing_keys
    }

    pub fn revocations(&self) -> &Revocations {
        &self.claims.data.revocations
    }

    pub fn exports(&self) -> &[Export] {
        &self.claims.data.exports
    }

    /// Import declarations from the claim, authorized or not.
    pub fn declared_imports(&self) -> &[Import] {
        &self.claims.data.imports
    }

    pub fn imports(&self) -> impl Iterator<Item = &ResolvedImport> {
        self.imports.values()
    }

    pub fn import(&self, key: &ImportKey) -> Option<&ResolvedImport> {
        self.imports.get(key)
    }

    pub fn shadows(&self) -> &ShadowTable {
        &self.shadows
    }

    pub fn num_clients(&self) -> usize {
        self.clients.len()
    }

    pub fn client(&self, id: ClientId) -> Option<&ClientSession> {
        self.clients.get(&id)
    }

    pub fn clients(&self) -> impl Iterator<Item = &ClientSession> {
        self.clients.values()
    }

    /// When the applied claim was last installed or confirmed.
    pub fn updated(&self) -> DateTime<Utc> {
        self.updated
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.claims
            .exp
            .filter(|e| *e > 0)
            .and_then(|e| Utc.timestamp_opt(e, 0).single())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expired || self.expires_at().is_some_and(|exp| now > exp)
    }

    pub fn issuer_context(&self) -> IssuerContext<'_> {
        IssuerContext {
            account: &self.id,
            signing_keys: self.signing_keys(),
            revocations: self.revocations(),
        }
    }

    pub fn export_snapshot(&self, now: DateTime<Utc>) -> ExportSnapshot {
        ExportSnapshot {
            account: self.id.clone(),
            signing_keys: self.signing_keys().clone(),
            exports: self.exports().to_vec(),
            expired: self.is_expired(now),
        }
    }

    fn is_authorized_signer(&self, key: &PublicKey) -> bool {
        *key == self.id || self.signing_keys().contains(key)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Claim updates
    // ─────────────────────────────────────────────────────────────────────────

    /// Offer a newer claim. See the module docs for version rules.
    pub fn update(&mut self, claims: AccountClaims, raw: String, now: DateTime<Utc>) -> TrustResult<UpdateOutcome> {
        if claims.sub != self.id {
            return Err(TrustError::unauthorized(format!(
                "claim for {} offered to account {}",
                claims.sub, self.id
            )));
        }
        match self.version.offer(claims.iat, &claims.jti) {
            Offer::Stale => return Ok(UpdateOutcome::Stale),
            Offer::Same => {
                self.updated = now;
                return Ok(UpdateOutcome::Unchanged);
            }
            Offer::Newer => {}
        }

        self.limits = EffectiveLimits::for_account(&self.server_limits, &claims.data.limits);
        for client in self.clients.values_mut() {
            client.apply_limits(&self.limits);
        }
        self.expired = check_time_bounds(&claims, now).is_err();
        self.claims = Arc::new(claims);
        self.raw = raw;
        self.updated = now;
        tracing::debug!(account = %self.id, iat = self.claims.iat, "account claims applied");

        Ok(UpdateOutcome::Applied {
            evicted: self.enforce(),
        })
    }

    /// Close sessions the current claim no longer admits.
    fn enforce(&mut self) -> Vec<(ClientId, DisconnectReason)> {
        let mut doomed: Vec<(ClientId, DisconnectReason)> = self
            .clients
            .values()
            .filter_map(|c| {
                if !self.is_authorized_signer(c.signer()) {
                    Some((c.id(), DisconnectReason::SignerRemoved))
                } else if self.revocations().is_revoked(c.user().as_str(), c.issued_at()) {
                    Some((c.id(), DisconnectReason::Revoked))
                } else {
                    None
                }
            })
            .collect();

        if let Some(max) = self.limits.connections {
            let mut remaining: Vec<&ClientSession> = self
                .clients
                .values()
                .filter(|c| !doomed.iter().any(|(id, _)| *id == c.id()))
                .collect();
            let excess = remaining.len().saturating_sub(usize::try_from(max).unwrap_or(usize::MAX));
            if excess > 0 {
                // Newest connections go first.
                remaining.sort_by_key(|c| (c.connected_at(), c.id()));
                doomed.extend(
                    remaining
                        .iter()
                        .rev()
                        .take(excess)
                        .map(|c| (c.id(), DisconnectReason::MaxConnectionsExceeded)),
                );
            }
        }

        for (id, reason) in &doomed {
            tracing::info!(account = %self.id, client = %id, reason = %reason, "disconnecting client");
            self.remove_client(*id, *reason);
        }
        doomed
    }

    /// The account claim expired: close every session.
    pub fn mark_expired(&mut self) -> Vec<(ClientId, DisconnectReason)> {
        self.expired = true;
        let ids: Vec<ClientId> = self.clients.keys().copied().collect();
        ids.into_iter()
            .filter_map(|id| {
                self.remove_client(id, DisconnectReason::AccountExpired)
                    .map(|_| (id, DisconnectReason::AccountExpired))
            })
            .collect()
    }

    /// Replace the authorized import set.
    ///
    /// `results` holds the authorization outcome for each declared import.
    /// Entries that disappeared or changed lose their shadows; new or
    /// changed entries get shadows for matching subscriptions.
    pub fn set_imports(&mut self, results: Vec<(Import, TrustResult<ResolvedImport>)>) {
        let mut next = BTreeMap::new();
        for (import, result) in results {
            match result {
                Ok(resolved) => {
                    next.insert(resolved.key.clone(), resolved);
                }
                Err(err) => self.log_import_error(&import, &err),
            }
        }

        let dropped: Vec<ImportKey> = self
            .imports
            .iter()
            .filter(|(k, v)| next.get(*k) != Some(*v))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &dropped {
            let removed = self.shadows.remove_import(key);
            self.detach(removed);
        }

        let added: Vec<ImportKey> = next
            .iter()
            .filter(|(k, v)| self.imports.get(*k) != Some(*v))
            .map(|(k, _)| k.clone())
            .collect();
        self.imports = next;
        for key in &added {
            self.attach_import(key);
        }
    }

    fn log_import_error(&self, import: &Import, err: &TrustError) {
        if let TrustError::InvalidIssuerAccount(_) = err {
            tracing::error!(account = %self.id, exporter = %import.account, "{err}");
        }
        match import.kind {
            ExportKind::Stream => tracing::warn!(
                account = %self.id,
                exporter = %import.account,
                subject = %import.subject,
                error = %err,
                "error adding stream import"
            ),
            ExportKind::Service => tracing::warn!(
                account = %self.id,
                exporter = %import.account,
                subject = %import.subject,
                error = %err,
                "error adding service import"
            ),
        }
    }

    /// Drop imports whose activation has expired. Returns the dropped keys.
    pub fn expire_activations(&mut self, now: DateTime<Utc>) -> Vec<ImportKey> {
        let expired: Vec<ImportKey> = self
            .imports
            .values()
            .filter(|imp| activation_lapsed(imp.activation_expires, now))
            .map(|imp| imp.key.clone())
            .collect();
        for key in &expired {
            tracing::info!(account = %self.id, exporter = %key.account, subject = %key.subject, "activation expired");
            self.imports.remove(key);
            let removed = self.shadows.remove_import(key);
            self.detach(removed);
        }
        expired
    }

    /// Earliest activation expiry among authorized imports.
    pub fn next_activation_expiry(&self) -> Option<(ImportKey, DateTime<Utc>)> {
        self.imports
            .values()
            .filter_map(|imp| {
                let at = Utc.timestamp_opt(imp.activation_expires?, 0).single()?;
                Some((imp.key.clone(), at))
            })
            .min_by_key(|(_, at)| *at)
    }

    fn detach(&mut self, removed: Vec<(ShadowId, Shadow)>) {
        for (id, shadow) in removed {
            if let Some(sub) = self
                .clients
                .get_mut(&shadow.client)
                .and_then(|c| c.subs.get_mut(&shadow.sid))
            {
                sub.shadows.retain(|s| *s != id);
            }
        }
    }

    fn attach_import(&mut self, key: &ImportKey) {
        let Some(import) = self.imports.get(key) else {
            return;
        };
        if import.kind() != ExportKind::Stream {
            return;
        }
        let local = import.local_pattern();
        let matching: Vec<(ClientId, u64, String)> = self
            .clients
            .values()
            .flat_map(|c| {
                c.subs
                    .iter()
                    .filter(|(_, s)| subject::intersects(&s.subject, &local))
                    .map(move |(sid, s)| (c.id(), *sid, s.subject.clone()))
            })
            .collect();
        for (client, sid, subject) in matching {
            self.add_shadow(key.clone(), client, sid, subject);
        }
    }

    fn add_shadow(&mut self, import: ImportKey, client: ClientId, sid: u64, subject: String) {
        let id = self.shadows.insert(Shadow {
            client,
            sid,
            import,
            subject,
        });
        if let Some(sub) = self.clients.get_mut(&client).and_then(|c| c.subs.get_mut(&sid)) {
            sub.shadows.push(id);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Clients
    // ─────────────────────────────────────────────────────────────────────────

    /// Admit a session whose user claim has already been verified.
    pub fn add_client(&mut self, session: ClientSession, now: DateTime<Utc>) -> TrustResult<()> {
        if self.is_expired(now) {
            return Err(TrustError::Expired);
        }
        if !self.is_authorized_signer(session.signer()) {
            return Err(TrustError::UnknownSigner(session.signer().to_string()));
        }
        if self.revocations().is_revoked(session.user().as_str(), session.issued_at()) {
            return Err(TrustError::Revoked);
        }
        self.prune_closed();
        if let Some(max) = self.limits.connections {
            if self.clients.len() as u64 >= max {
                return Err(TrustError::LimitExceeded(LimitKind::Connections));
            }
        }
        self.clients.insert(session.id(), session);
        Ok(())
    }

    /// Remove a session and everything derived from it, telling it why.
    pub fn remove_client(&mut self, id: ClientId, reason: DisconnectReason) -> Option<ClientSession> {
        let session = self.clients.remove(&id)?;
        self.shadows.remove_client(id);
        session.close(reason);
        Some(session)
    }

    /// Drop sessions whose connection went away without disconnecting.
    pub fn prune_closed(&mut self) -> Vec<ClientId> {
        let gone: Vec<ClientId> = self
            .clients
            .values()
            .filter(|c| !c.is_connected())
            .map(ClientSession::id)
            .collect();
        for id in &gone {
            tracing::debug!(account = %self.id, client = %id, "releasing closed connection");
            self.remove_client(*id, DisconnectReason::ClientClosed);
        }
        gone
    }

    /// Close sessions whose own validity ended (expiry or time window).
    pub fn expire_clients(&mut self, now: DateTime<Utc>) -> Vec<(ClientId, DisconnectReason)> {
        let due: Vec<(ClientId, DisconnectReason)> = self
            .clients
            .values()
            .filter_map(|c| c.check_validity(now).map(|r| (c.id(), r)))
            .collect();
        for (id, reason) in &due {
            tracing::info!(account = %self.id, client = %id, "user authentication expired");
            self.remove_client(*id, *reason);
        }
        due
    }

    pub fn subscribe(&mut self, client: ClientId, sid: u64, subject: &str) -> TrustResult<()> {
        if !subject::is_valid_subject(subject) {
            return Err(TrustError::unauthorized(format!("invalid subject {subject:?}")));
        }
        let session = self
            .clients
            .get(&client)
            .ok_or_else(|| TrustError::not_found(client.to_string()))?;
        if !session.permissions().subscribe.allows_pattern(subject) {
            return Err(TrustError::unauthorized(format!(
                "subscriptions to {subject:?} not permitted"
            )));
        }
        let replacing = session.subs.contains_key(&sid);
        let count = session.subs.len() + usize::from(!replacing);
        if !session.limits().allows_subscriptions(count) {
            return Err(TrustError::LimitExceeded(LimitKind::Subscriptions));
        }
        if replacing {
            self.unsubscribe(client, sid);
        }

        if let Some(session) = self.clients.get_mut(&client) {
            session.subs.insert(
                sid,
                ClientSub {
                    subject: subject.to_string(),
                    shadows: Vec::new(),
                },
            );
        }
        let matching: Vec<ImportKey> = self
            .imports
            .values()
            .filter(|imp| imp.kind() == ExportKind::Stream && subject::intersects(subject, &imp.local_pattern()))
            .map(|imp| imp.key.clone())
            .collect();
        for key in matching {
            self.add_shadow(key, client, sid, subject.to_string());
        }
        Ok(())
    }

    pub fn unsubscribe(&mut self, client: ClientId, sid: u64) -> bool {
        let Some(sub) = self.clients.get_mut(&client).and_then(|c| c.subs.remove(&sid)) else {
            return false;
        };
        for id in sub.shadows {
            self.shadows.remove(id);
        }
        true
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Delivery
    // ─────────────────────────────────────────────────────────────────────────

    /// Check payload size and publish permission for `client`.
    pub fn authorize_publish(
        &self,
        client: ClientId,
        subject: &str,
        payload_len: usize,
        now: DateTime<Utc>,
    ) -> TrustResult<()> {
        let session = self
            .clients
            .get(&client)
            .ok_or_else(|| TrustError::not_found(client.to_string()))?;
        if !session.limits().allows_payload(payload_len) {
            return Err(TrustError::LimitExceeded(LimitKind::Payload));
        }
        if !session.may_publish(subject, now) {
            return Err(TrustError::unauthorized(format!(
                "publish to {subject:?} not permitted"
            )));
        }
        Ok(())
    }

    /// Deliver to this account's own subscribers.
    pub fn deliver_local(&self, subject: &str, reply: Option<&str>, payload: &[u8], now: DateTime<Utc>) -> usize {
        let mut delivered = 0;
        for client in self.clients.values() {
            if !client.permissions().subscribe.allows(subject) {
                continue;
            }
            for (_, sub) in client.subscriptions() {
                if subject::matches(&sub.subject, subject) && client.deliver(subject, reply, payload, now) {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Deliver a message published on `exporter` through stream-import shadows.
    pub fn deliver_import(
        &self,
        exporter: &PublicKey,
        subject: &str,
        reply: Option<&str>,
        payload: &[u8],
        now: DateTime<Utc>,
    ) -> usize {
        let mut delivered = 0;
        for (key, import) in &self.imports {
            if key.kind != ExportKind::Stream || key.account != *exporter {
                continue;
            }
            if activation_lapsed(import.activation_expires, now) {
                continue;
            }
            let Some(local) = import.to_local(subject) else {
                continue;
            };
            for shadow in self.shadows.for_import(key) {
                if !subject::matches(&shadow.subject, &local) {
                    continue;
                }
                let Some(client) = self.clients.get(&shadow.client) else {
                    continue;
                };
                if client.permissions().subscribe.allows(&local) && client.deliver(&local, reply, payload, now) {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Service import serving a literal local subject, with the subject mapped
    /// into the exporter's space.
    pub fn service_import_for(&self, local: &str, now: DateTime<Utc>) -> Option<(&ResolvedImport, String)> {
        self.imports.values().find_map(|imp| {
            if imp.kind() != ExportKind::Service
                || activation_lapsed(imp.activation_expires, now)
            {
                return None;
            }
            imp.to_exporter(local).map(|mapped| (imp, mapped))
        })
    }

    /// Let responses to `reply` flow back to `importer`.
    pub fn add_response_route(&self, reply: &str, importer: PublicKey, response_type: ResponseType, now: DateTime<Utc>) {
        let remaining = match response_type {
            ResponseType::Singleton => Some(1),
            ResponseType::Stream | ResponseType::Chunked => None,
        };
        self.response_routes.lock().insert(
            reply.to_string(),
            ResponseRoute {
                importer,
                remaining,
                deadline: now + Duration::seconds(RESPONSE_ROUTE_TTL_SECS),
            },
        );
    }

    /// Importer a response on `subject` should be forwarded to, if any.
    pub fn take_response_route(&self, subject: &str, now: DateTime<Utc>) -> Option<PublicKey> {
        let mut routes = self.response_routes.lock();
        routes.retain(|_, r| now <= r.deadline);
        let route = routes.get_mut(subject)?;
        let importer = route.importer.clone();
        if let Some(n) = route.remaining.as_mut() {
            *n = n.saturating_sub(1);
            if *n == 0 {
                routes.remove(subject);
            }
        }
        Some(importer)
    }
}

/// An activation is usable through its `exp` second, like any other claim.
fn activation_lapsed(expires: Option<i64>, now: DateTime<Utc>) -> bool {
    expires
        .and_then(|exp| Utc.timestamp_opt(exp, 0).single())
        .is_some_and(|exp| now > exp)
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::client::ClientEvent;
    use crate::imports::authorize_import;
    use keyward_auth::{AccountData, UserClaims, UserData, jwt};
    use keyward_core::{KeyKind, KeyPair};
    use tokio::sync::mpsc;

    struct Fixture {
        operator: KeyPair,
        key: KeyPair,
        next_client: Cell<u64>,
    }

    fn setup() -> Fixture {
        Fixture {
            operator: KeyPair::generate(KeyKind::Operator),
            key: KeyPair::generate(KeyKind::Account),
            next_client: Cell::new(0),
        }
    }

    impl Fixture {
        fn claims(&self, iat: i64, f: impl FnOnce(&mut AccountData)) -> (AccountClaims, String) {
            let mut data = AccountData::default();
            f(&mut data);
            let raw = AccountClaims::new(self.key.public_key(), data)
                .issued_at(iat)
                .encode(&self.operator)
                .unwrap();
            (jwt::decode(&raw).unwrap(), raw)
        }

        fn account(&self, f: impl FnOnce(&mut AccountData)) -> Account {
            let (claims, raw) = self.claims(100, f);
            Account::new(claims, raw, ServerLimits::default(), Utc::now())
        }

        /// User issued at 100, signed by `signer`.
        fn session(
            &self,
            account: &Account,
            signer: &KeyPair,
            data: UserData,
        ) -> (ClientSession, mpsc::UnboundedReceiver<ClientEvent>) {
            let n = self.next_client.get() + 1;
            self.next_client.set(n);
            let user = KeyPair::generate(KeyKind::User);
            let raw = UserClaims::new(user.public_key(), data).issued_at(100).encode(signer).unwrap();
            let claims: UserClaims = jwt::decode(&raw).unwrap();
            let (tx, rx) = mpsc::unbounded_channel();
            let connected = Utc::now() + Duration::milliseconds(n as i64);
            let session = ClientSession::new(
                ClientId::new(n),
                claims,
                signer.public_key(),
                account.limits(),
                connected,
                tx,
            )
            .unwrap();
            (session, rx)
        }

        fn connect(&self, account: &mut Account) -> (ClientId, mpsc::UnboundedReceiver<ClientEvent>) {
            let (s, rx) = self.session(account, &self.key, UserData::default());
            let id = s.id();
            account.add_client(s, Utc::now()).unwrap();
            (id, rx)
        }
    }

    fn last_disconnect(rx: &mut mpsc::UnboundedReceiver<ClientEvent>) -> Option<DisconnectReason> {
        let mut reason = None;
        while let Ok(ev) = rx.try_recv() {
            if let ClientEvent::Disconnected(r) = ev {
                reason = Some(r);
            }
        }
        reason
    }

    #[test]
    fn version_rules() {
        let f = setup();
        let (c100, r100) = f.claims(100, |_| {});
        let mut account = Account::new(c100.clone(), r100.clone(), ServerLimits::default(), Utc::now());

        let (old, raw_old) = f.claims(99, |_| {});
        assert_eq!(account.update(old, raw_old, Utc::now()).unwrap(), UpdateOutcome::Stale);
        assert_eq!(account.update(c100.clone(), r100.clone(), Utc::now()).unwrap(), UpdateOutcome::Unchanged);

        let (same_second, raw_same) = f.claims(100, |d| d.tags.push("later".into()));
        assert!(account.update(same_second, raw_same, Utc::now()).unwrap().is_applied());
        assert_eq!(account.claims().data.tags, vec!["later".to_string()]);
        // The earlier claim of that second is never reapplied.
        assert_eq!(account.update(c100, r100, Utc::now()).unwrap(), UpdateOutcome::Stale);

        let (newer, raw_newer) = f.claims(101, |_| {});
        assert!(account.update(newer, raw_newer, Utc::now()).unwrap().is_applied());
        assert_eq!(account.iat(), 101);
    }

    #[test]
    fn update_for_another_account_is_refused() {
        let f = setup();
        let g = setup();
        let mut account = f.account(|_| {});
        let (other, raw) = g.claims(200, |_| {});
        assert!(account.update(other, raw, Utc::now()).is_err());
    }

    #[test]
    fn connection_limit_rejects_and_evicts_newest() {
        let f = setup();
        let mut account = f.account(|d| d.limits.conn = 4);
        let mut clients: Vec<_> = (0..4).map(|_| f.connect(&mut account)).collect();
        let (s, _rx) = f.session(&account, &f.key, UserData::default());
        assert_eq!(
            account.add_client(s, Utc::now()),
            Err(TrustError::LimitExceeded(LimitKind::Connections))
        );

        let (lowered, raw) = f.claims(101, |d| d.limits.conn = 2);
        let UpdateOutcome::Applied { evicted } = account.update(lowered, raw, Utc::now()).unwrap() else {
            panic!("expected applied update");
        };
        assert_eq!(evicted.len(), 2);
        assert_eq!(account.num_clients(), 2);
        assert!(account.client(clients[0].0).is_some());
        assert!(account.client(clients[1].0).is_some());
        assert_eq!(last_disconnect(&mut clients[3].1), Some(DisconnectReason::MaxConnectionsExceeded));
        assert_eq!(last_disconnect(&mut clients[0].1), None);
    }

    #[test]
    fn server_override_caps_connections() {
        let f = setup();
        let (claims, raw) = f.claims(100, |d| d.limits.conn = 10);
        let server = ServerLimits {
            max_connections: Some(1),
            ..ServerLimits::default()
        };
        let mut account = Account::new(claims, raw, server, Utc::now());
        let _first = f.connect(&mut account);
        let (s, _rx) = f.session(&account, &f.key, UserData::default());
        assert!(account.add_client(s, Utc::now()).is_err());
    }

    #[test]
    fn removing_a_signing_key_disconnects_its_users() {
        let f = setup();
        let signer = KeyPair::generate(KeyKind::Account);
        let signer_pk = signer.public_key();
        let mut account = f.account(|d| {
            d.signing_keys.insert(signer_pk.clone());
        });
        let (via_signer, mut rx) = f.session(&account, &signer, UserData::default());
        let via_signer_id = via_signer.id();
        account.add_client(via_signer, Utc::now()).unwrap();
        let (direct, mut direct_rx) = f.connect(&mut account);

        let (without, raw) = f.claims(101, |_| {});
        account.update(without, raw, Utc::now()).unwrap();
        assert!(account.client(via_signer_id).is_none());
        assert!(account.client(direct).is_some());
        assert_eq!(last_disconnect(&mut rx), Some(DisconnectReason::SignerRemoved));
        assert_eq!(last_disconnect(&mut direct_rx), None);
    }

    #[test]
    fn revocation_disconnects_matching_users_only() {
        let f = setup();
        let mut account = f.account(|_| {});
        let (a, mut a_rx) = f.connect(&mut account);
        let (b, mut b_rx) = f.connect(&mut account);
        let a_user = account.client(a).unwrap().user().clone();
        let b_user = account.client(b).unwrap().user().clone();

        // Users were issued at 100.
        let (revoked, raw) = f.claims(101, |d| {
            d.revocations.revoke(&a_user, 100);
            d.revocations.revoke(&b_user, 99);
        });
        account.update(revoked, raw, Utc::now()).unwrap();
        assert_eq!(last_disconnect(&mut a_rx), Some(DisconnectReason::Revoked));
        assert_eq!(last_disconnect(&mut b_rx), None);
        assert_eq!(account.num_clients(), 1);
    }

    #[test]
    fn stream_import_shadows_follow_authorization() {
        let f = setup();
        let exporter = setup();
        let (exp_claims, exp_raw) = exporter.claims(100, |d| d.exports.push(Export::stream("foo")));
        let exporter_account = Account::new(exp_claims, exp_raw, ServerLimits::default(), Utc::now());
        let import = Import::stream(exporter.key.public_key(), "foo").to("import.foo");

        let mut importer = f.account(|d| d.imports.push(import.clone()));
        let (client, mut rx) = f.connect(&mut importer);
        importer.subscribe(client, 1, "import.>").unwrap();
        assert!(importer.shadows().is_empty());

        let snapshot = exporter_account.export_snapshot(Utc::now());
        let result = authorize_import(importer.id(), &import, Some(&snapshot), None, Utc::now());
        importer.set_imports(vec![(import.clone(), result)]);
        assert_eq!(importer.shadows().len(), 1);

        let n = importer.deliver_import(&exporter.key.public_key(), "foo", None, b"hello", Utc::now());
        assert_eq!(n, 1);
        let Ok(ClientEvent::Message(msg)) = rx.try_recv() else {
            panic!("expected message");
        };
        assert_eq!(msg.subject, "import.foo");
        assert_eq!(msg.payload, b"hello");

        // Export withdrawn: shadows go away and nothing is delivered.
        importer.set_imports(vec![(import, Err(TrustError::unauthorized("gone")))]);
        assert!(importer.shadows().is_empty());
        assert_eq!(importer.imports().count(), 0);
        assert_eq!(
            importer.deliver_import(&exporter.key.public_key(), "foo", None, b"x", Utc::now()),
            0
        );
    }

    #[test]
    fn subscription_limits_and_permissions() {
        let f = setup();
        let mut account = f.account(|d| d.limits.subs = 1);
        let mut data = UserData::default();
        data.permissions.subscribe = keyward_auth::SubjectPermission::allow(["ok.>"]);
        let (s, _rx) = f.session(&account, &f.key, data);
        let id = s.id();
        account.add_client(s, Utc::now()).unwrap();

        assert!(matches!(account.subscribe(id, 1, "nope"), Err(TrustError::Unauthorized(_))));
        account.subscribe(id, 1, "ok.a").unwrap();
        // Replacing an existing sid does not count twice.
        account.subscribe(id, 1, "ok.b").unwrap();
        assert_eq!(
            account.subscribe(id, 2, "ok.c"),
            Err(TrustError::LimitExceeded(LimitKind::Subscriptions))
        );
        assert!(account.unsubscribe(id, 1));
        account.subscribe(id, 2, "ok.c").unwrap();
    }

    #[test]
    fn payload_limit_is_enforced_on_publish() {
        let f = setup();
        let mut account = f.account(|d| d.limits.payload = 4);
        let (id, _rx) = f.connect(&mut account);
        assert!(account.authorize_publish(id, "a", 4, Utc::now()).is_ok());
        assert_eq!(
            account.authorize_publish(id, "a", 5, Utc::now()),
            Err(TrustError::LimitExceeded(LimitKind::Payload))
        );
    }

    #[test]
    fn lowered_limits_reach_connected_clients() {
        let f = setup();
        let mut account = f.account(|d| d.limits.payload = 100);
        let (id, _rx) = f.connect(&mut account);
        assert!(account.authorize_publish(id, "a", 10, Utc::now()).is_ok());

        let (lowered, raw) = f.claims(101, |d| d.limits.payload = 4);
        assert!(account.update(lowered, raw, Utc::now()).unwrap().is_applied());
        assert_eq!(account.client(id).unwrap().limits().payload, Some(4));
        assert_eq!(
            account.authorize_publish(id, "a", 10, Utc::now()),
            Err(TrustError::LimitExceeded(LimitKind::Payload))
        );
    }

    #[test]
    fn dropped_connection_frees_its_slot() {
        let f = setup();
        let mut account = f.account(|d| d.limits.conn = 1);
        let (gone, rx) = f.connect(&mut account);
        drop(rx);

        let (s, _rx) = f.session(&account, &f.key, UserData::default());
        let id = s.id();
        account.add_client(s, Utc::now()).unwrap();
        assert!(account.client(gone).is_none());
        assert!(account.client(id).is_some());
        assert!(account.prune_closed().is_empty());
    }

    #[test]
    fn activation_is_usable_through_its_expiry_second() {
        let f = setup();
        let exporter = setup();
        let (exp_claims, exp_raw) = exporter.claims(100, |d| d.exports.push(Export::stream("foo")));
        let exporter_account = Account::new(exp_claims, exp_raw, ServerLimits::default(), Utc::now());
        let import = Import::stream(exporter.key.public_key(), "foo");
        let mut importer = f.account(|d| d.imports.push(import.clone()));

        let snapshot = exporter_account.export_snapshot(Utc::now());
        let mut resolved = authorize_import(importer.id(), &import, Some(&snapshot), None, Utc::now()).unwrap();
        let exp = Utc::now().timestamp() + 60;
        resolved.activation_expires = Some(exp);
        importer.set_imports(vec![(import, Ok(resolved))]);

        let at = Utc.timestamp_opt(exp, 0).single().unwrap();
        assert!(importer.expire_activations(at).is_empty());
        assert_eq!(importer.imports().count(), 1);
        assert_eq!(importer.expire_activations(at + Duration::milliseconds(1)).len(), 1);
        assert_eq!(importer.imports().count(), 0);
    }

    #[test]
    fn expiry_closes_every_session() {
        let f = setup();
        let mut account = f.account(|_| {});
        let (_, mut rx) = f.connect(&mut account);
        let closed = account.mark_expired();
        assert_eq!(closed.len(), 1);
        assert_eq!(last_disconnect(&mut rx), Some(DisconnectReason::AccountExpired));
        assert!(account.is_expired(Utc::now()));
        let (s, _rx) = f.session(&account, &f.key, UserData::default());
        assert_eq!(account.add_client(s, Utc::now()), Err(TrustError::Expired));
    }

    #[test]
    fn singleton_response_route_is_single_use() {
        let f = setup();
        let account = f.account(|_| {});
        let importer = KeyPair::generate(KeyKind::Account).public_key();
        let now = Utc::now();
        account.add_response_route("_INBOX.1", importer.clone(), ResponseType::Singleton, now);
        assert_eq!(account.take_response_route("_INBOX.1", now), Some(importer.clone()));
        assert_eq!(account.take_response_route("_INBOX.1", now), None);

        account.add_response_route("_INBOX.2", importer.clone(), ResponseType::Stream, now);
        assert!(account.take_response_route("_INBOX.2", now).is_some());
        assert!(account.take_response_route("_INBOX.2", now).is_some());
        assert!(account.take_response_route("_INBOX.2", now + Duration::seconds(RESPONSE_ROUTE_TTL_SECS + 1)).is_none());
    }
}
