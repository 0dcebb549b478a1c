//! The task that owns one account.
//!
//! Every mutation of an [`Account`] happens here, in command order. Readers
//! (publish checks, delivery, export snapshots) take the shared lock through
//! [`AccountHandle::with`]. Claim fetches and activation downloads run with
//! no lock held; results are applied afterwards in one short write section.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};

use keyward_accounts::{
    Account, ClientId, ClientSession, DisconnectReason, ExportSnapshot, UpdateOutcome, authorize_import,
};
use keyward_auth::{AccountClaims, Import};
use keyward_core::{PublicKey, TrustError, TrustResult};

use crate::registry::{AccountRegistry, RegistryInner};
use crate::scheduler::{Schedule, TimerKey, instant_for};

type Reply<T> = oneshot::Sender<T>;

pub(crate) enum Command {
    Update {
        claims: AccountClaims,
        raw: String,
        done: Option<Reply<TrustResult<UpdateOutcome>>>,
    },
    Reevaluate {
        done: Option<Reply<()>>,
    },
    Connect {
        session: ClientSession,
        done: Reply<TrustResult<()>>,
    },
    Disconnect {
        client: ClientId,
        reason: DisconnectReason,
        done: Option<Reply<bool>>,
    },
    Subscribe {
        client: ClientId,
        sid: u64,
        subject: String,
        done: Reply<TrustResult<()>>,
    },
    Unsubscribe {
        client: ClientId,
        sid: u64,
        done: Reply<bool>,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Handle
// ─────────────────────────────────────────────────────────────────────────────

/// Cheap, cloneable access to a registered account.
#[derive(Clone)]
pub struct AccountHandle {
    id: PublicKey,
    state: Arc<RwLock<Account>>,
    commands: mpsc::UnboundedSender<Command>,
    last_refresh: Arc<Mutex<tokio::time::Instant>>,
}

impl AccountHandle {
    pub fn id(&self) -> &PublicKey {
        &self.id
    }

    /// Run `f` under the account's shared lock.
    pub fn with<R>(&self, f: impl FnOnce(&Account) -> R) -> R {
        f(&self.state.read())
    }

    pub fn export_snapshot(&self, now: DateTime<Utc>) -> ExportSnapshot {
        self.with(|a| a.export_snapshot(now))
    }

    pub(crate) fn send(&self, command: Command) -> TrustResult<()> {
        self.commands
            .send(command)
            .map_err(|_| TrustError::fetch_failed(format!("account {} is shutting down", self.id)))
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> TrustResult<T> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx))?;
        rx.await
            .map_err(|_| TrustError::fetch_failed(format!("account {} is shutting down", self.id)))
    }

    /// Offer a validated claim.
    pub async fn update(&self, claims: AccountClaims, raw: String) -> TrustResult<UpdateOutcome> {
        self.call(|done| Command::Update {
            claims,
            raw,
            done: Some(done),
        })
        .await?
    }

    /// Re-run import authorization and wait for it to finish.
    pub async fn reevaluate(&self) -> TrustResult<()> {
        self.call(|done| Command::Reevaluate { done: Some(done) }).await
    }

    pub async fn connect(&self, session: ClientSession) -> TrustResult<()> {
        self.call(|done| Command::Connect { session, done }).await?
    }

    pub async fn disconnect(&self, client: ClientId, reason: DisconnectReason) -> bool {
        self.call(|done| Command::Disconnect {
            client,
            reason,
            done: Some(done),
        })
        .await
        .unwrap_or(false)
    }

    /// Queue a client-closed disconnect without waiting for it.
    pub(crate) fn release(&self, client: ClientId) {
        let _ = self.send(Command::Disconnect {
            client,
            reason: DisconnectReason::ClientClosed,
            done: None,
        });
    }

    pub async fn subscribe(&self, client: ClientId, sid: u64, subject: &str) -> TrustResult<()> {
        self.call(|done| Command::Subscribe {
            client,
            sid,
            subject: subject.to_string(),
            done,
        })
        .await?
    }

    pub async fn unsubscribe(&self, client: ClientId, sid: u64) -> bool {
        self.call(|done| Command::Unsubscribe { client, sid, done })
            .await
            .unwrap_or(false)
    }

    /// Claim a refetch slot unless one was taken within `debounce`.
    pub(crate) fn try_begin_refresh(&self, debounce: std::time::Duration) -> bool {
        let mut last = self.last_refresh.lock();
        let now = tokio::time::Instant::now();
        if now.duration_since(*last) < debounce {
            return false;
        }
        *last = now;
        true
    }
}

impl core::fmt::Debug for AccountHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AccountHandle").field("id", &self.id).finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Task
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) struct AccountTask {
    id: PublicKey,
    state: Arc<RwLock<Account>>,
    commands: mpsc::UnboundedReceiver<Command>,
    registry: Weak<RegistryInner>,
    schedule: Schedule,
}

impl AccountTask {
    pub(crate) fn new(account: Account, registry: Weak<RegistryInner>) -> (AccountHandle, Self) {
        let id = account.id().clone();
        let state = Arc::new(RwLock::new(account));
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = AccountHandle {
            id: id.clone(),
            state: state.clone(),
            commands: tx,
            last_refresh: Arc::new(Mutex::new(tokio::time::Instant::now())),
        };
        let task = Self {
            id,
            state,
            commands: rx,
            registry,
            schedule: Schedule::default(),
        };
        (handle, task)
    }

    fn registry(&self) -> Option<AccountRegistry> {
        self.registry.upgrade().map(AccountRegistry::from_inner)
    }

    fn with<R>(&self, f: impl FnOnce(&Account) -> R) -> R {
        f(&self.state.read())
    }

    fn with_mut<R>(&self, f: impl FnOnce(&mut Account) -> R) -> R {
        f(&mut self.state.write())
    }

    pub(crate) async fn run(mut self) {
        self.claims_changed();
        loop {
            let deadline = self.schedule.next();
            let wake = deadline
                .map(instant_for)
                .unwrap_or_else(|| tokio::time::Instant::now() + std::time::Duration::from_secs(3600));
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = tokio::time::sleep_until(wake), if deadline.is_some() => self.fire(Utc::now()).await,
            }
        }
        tracing::debug!(account = %self.id, "account task stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Update { claims, raw, done } => {
                let result = self.apply_update(claims, raw).await;
                if let Err(err) = &result {
                    tracing::warn!(account = %self.id, error = %err, "account update refused");
                }
                if let Some(done) = done {
                    let _ = done.send(result);
                }
            }
            Command::Reevaluate { done } => {
                self.reevaluate().await;
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
            Command::Connect { session, done } => {
                let _ = done.send(self.connect(session));
            }
            Command::Disconnect { client, reason, done } => {
                self.schedule.disarm(&TimerKey::Client(client));
                let removed = self.with_mut(|a| a.remove_client(client, reason)).is_some();
                if removed {
                    tracing::debug!(account = %self.id, client = %client, reason = %reason, "client disconnected");
                }
                if let Some(done) = done {
                    let _ = done.send(removed);
                }
            }
            Command::Subscribe {
                client,
                sid,
                subject,
                done,
            } => {
                let _ = done.send(self.with_mut(|a| a.subscribe(client, sid, &subject)));
            }
            Command::Unsubscribe { client, sid, done } => {
                let _ = done.send(self.with_mut(|a| a.unsubscribe(client, sid)));
            }
        }
    }

    fn connect(&mut self, session: ClientSession) -> TrustResult<()> {
        let now = Utc::now();
        let client = session.id();
        let deadline = self.with_mut(|a| {
            a.add_client(session, now)?;
            Ok::<_, TrustError>(a.client(client).and_then(|c| c.next_deadline(now)))
        })?;
        self.schedule.set(TimerKey::Client(client), deadline);
        tracing::debug!(account = %self.id, client = %client, "client connected");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Claims
    // ─────────────────────────────────────────────────────────────────────────

    async fn apply_update(&mut self, claims: AccountClaims, raw: String) -> TrustResult<UpdateOutcome> {
        let now = Utc::now();
        let outcome = self.with_mut(|a| a.update(claims, raw, now))?;
        let UpdateOutcome::Applied { evicted } = &outcome else {
            return Ok(outcome);
        };
        for (client, _) in evicted {
            self.schedule.disarm(&TimerKey::Client(*client));
        }
        if self.with(|a| a.is_expired(now)) {
            self.close_all_clients();
        }
        self.claims_changed();
        self.reevaluate().await;
        if let Some(registry) = self.registry() {
            registry.notify_importers(&self.id);
        }
        Ok(outcome)
    }

    /// Re-arm the expiry timer and apply JetStream limits for the current claim.
    fn claims_changed(&mut self) {
        let (expires, jetstream) = self.with(|a| (a.expires_at(), a.claims().data.limits.jetstream));
        self.schedule.set(TimerKey::Account, expires);
        let Some(registry) = self.registry() else {
            return;
        };
        if let Some(manager) = registry.jetstream() {
            if let Err(err) = manager.apply(&self.id, &jetstream) {
                tracing::warn!(account = %self.id, error = %err, "jetstream limits not applied");
            }
        }
    }

    fn close_all_clients(&mut self) {
        let closed = self.with_mut(|a| a.mark_expired());
        for (client, _) in &closed {
            self.schedule.disarm(&TimerKey::Client(*client));
        }
        if !closed.is_empty() {
            tracing::info!(account = %self.id, clients = closed.len(), "account expired, clients disconnected");
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Imports
    // ─────────────────────────────────────────────────────────────────────────

    /// Authorize every declared import against the exporters' current claims.
    async fn reevaluate(&mut self) {
        let Some(registry) = self.registry() else {
            return;
        };
        let now = Utc::now();
        let declared: Vec<Import> = self.with(|a| a.declared_imports().to_vec());
        let exporters: BTreeSet<PublicKey> = declared.iter().map(|i| i.account.clone()).collect();
        registry.set_exporters(&self.id, exporters);

        let mut results = Vec::with_capacity(declared.len());
        for import in declared {
            let exporter = if import.account == self.id {
                Some(self.with(|a| a.export_snapshot(now)))
            } else {
                match registry.load(&import.account, false).await {
                    Ok(handle) => Some(handle.export_snapshot(now)),
                    Err(err) => {
                        tracing::debug!(account = %self.id, exporter = %import.account, error = %err, "exporter unavailable");
                        None
                    }
                }
            };
            let activation = match &import.token {
                Some(token) => match registry.activations().resolve(token).await {
                    Ok(raw) => Some(raw),
                    Err(err) => {
                        results.push((import, Err(err)));
                        continue;
                    }
                },
                None => None,
            };
            let result = authorize_import(&self.id, &import, exporter.as_ref(), activation.as_deref(), now);
            results.push((import, result));
        }

        self.with_mut(|a| a.set_imports(results));
        self.arm_activations();
    }

    fn arm_activations(&mut self) {
        self.schedule.disarm_activations();
        let expiries: Vec<_> = self.with(|a| {
            a.imports()
                .filter_map(|imp| {
                    let at = DateTime::from_timestamp(imp.activation_expires?, 0)?;
                    Some((imp.key.clone(), at))
                })
                .collect()
        });
        for (key, at) in expiries {
            self.schedule.arm(TimerKey::Activation(key), at);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Timers
    // ─────────────────────────────────────────────────────────────────────────

    async fn fire(&mut self, now: DateTime<Utc>) {
        for (key, at) in self.schedule.take_due(now) {
            // Evaluate just past the boundary that armed the timer.
            let at = now.max(at) + Duration::milliseconds(1);
            match key {
                TimerKey::Account => self.account_expired().await,
                TimerKey::Client(client) => self.check_client(client, at),
                TimerKey::Activation(_) => {
                    self.with_mut(|a| a.expire_activations(at));
                }
            }
        }
    }

    fn check_client(&mut self, client: ClientId, at: DateTime<Utc>) {
        let verdict = self.with(|a| a.client(client).map(|c| (c.check_validity(at), c.next_deadline(at))));
        match verdict {
            None => {}
            Some((Some(reason), _)) => {
                tracing::info!(account = %self.id, client = %client, reason = %reason, "disconnecting client");
                self.with_mut(|a| a.remove_client(client, reason));
            }
            // A later window still admits the session.
            Some((None, next)) => self.schedule.set(TimerKey::Client(client), next),
        }
    }

    /// Close every session, then look for a renewed claim.
    async fn account_expired(&mut self) {
        self.close_all_clients();
        let Some(registry) = self.registry() else {
            return;
        };
        match registry.fetch_claims(&self.id).await {
            Ok((claims, raw)) => match self.apply_update(claims, raw).await {
                Ok(outcome) if outcome.is_applied() => {
                    tracing::info!(account = %self.id, "renewed account claim applied");
                }
                Ok(_) => {}
                Err(err) => tracing::warn!(account = %self.id, error = %err, "renewed claim refused"),
            },
            Err(err) => tracing::debug!(account = %self.id, error = %err, "no renewed claim"),
        }
    }
}
