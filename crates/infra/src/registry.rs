//! Registry of loaded accounts.
//!
//! Accounts are loaded on first use: the claim is fetched from the resolver,
//! validated, and handed to a fresh [`AccountTask`]. The registry also keeps
//! the reverse import graph so a change to an exporter re-runs authorization
//! on every importer.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use keyward_accounts::{Account, ServerLimits, UpdateOutcome};
use keyward_auth::validation::check_time_bounds;
use keyward_auth::{AccountClaims, Validator};
use keyward_core::{KeyKind, PublicKey, TrustError, TrustResult};

use crate::account_task::{AccountHandle, AccountTask, Command};
use crate::activation::ActivationFetcher;
use crate::config::Options;
use crate::jetstream::{InMemoryJetStream, JetStreamManager};
use crate::resolver::AccountResolver;

const ACTIVATION_TIMEOUT: Duration = Duration::from_secs(2);
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Where a claim offered to [`AccountRegistry::apply_claim`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOrigin {
    /// Submitted to this node.
    Local,
    /// Replicated from another node.
    Cluster,
}

#[derive(Clone)]
struct Entry {
    handle: AccountHandle,
    ready: watch::Receiver<bool>,
}

impl Entry {
    async fn wait_ready(&mut self) {
        // A closed channel means the task is gone; the caller sees that on use.
        let _ = self.ready.wait_for(|ready| *ready).await;
    }
}

pub(crate) struct RegistryInner {
    resolver: Arc<dyn AccountResolver>,
    validator: Arc<Validator>,
    activations: ActivationFetcher,
    jetstream: Option<JetStreamManager>,
    server_limits: ServerLimits,
    refresh_debounce: Duration,
    accounts: RwLock<HashMap<PublicKey, Entry>>,
    /// exporter → accounts importing from it
    importers: RwLock<HashMap<PublicKey, BTreeSet<PublicKey>>>,
    /// One task per registered account.
    tasks: Mutex<HashMap<PublicKey, JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct AccountRegistry {
    inner: Arc<RegistryInner>,
}

impl AccountRegistry {
    pub fn new(resolver: Arc<dyn AccountResolver>, validator: Arc<Validator>, options: &Options) -> TrustResult<Self> {
        let jetstream = options
            .jetstream
            .map(|config| JetStreamManager::new(Arc::new(InMemoryJetStream::new(config))));
        Ok(Self {
            inner: Arc::new(RegistryInner {
                resolver,
                validator,
                activations: ActivationFetcher::new(ACTIVATION_TIMEOUT)?,
                jetstream,
                server_limits: options.limits,
                refresh_debounce: options.refresh_debounce(),
                accounts: RwLock::new(HashMap::new()),
                importers: RwLock::new(HashMap::new()),
                tasks: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub(crate) fn from_inner(inner: Arc<RegistryInner>) -> Self {
        Self { inner }
    }

    pub fn resolver(&self) -> &Arc<dyn AccountResolver> {
        &self.inner.resolver
    }

    pub fn validator(&self) -> &Arc<Validator> {
        &self.inner.validator
    }

    pub fn activations(&self) -> &ActivationFetcher {
        &self.inner.activations
    }

    pub fn jetstream(&self) -> Option<&JetStreamManager> {
        self.inner.jetstream.as_ref()
    }

    /// A registered account, without loading it.
    pub fn get(&self, account: &PublicKey) -> Option<AccountHandle> {
        self.inner.accounts.read().get(account).map(|e| e.handle.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.accounts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Account tasks still owned by the registry.
    pub fn task_count(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Loading
    // ─────────────────────────────────────────────────────────────────────────

    /// Account for a connecting client.
    ///
    /// Waits for the first import evaluation. An expired account triggers a
    /// refetch, at most once per debounce period.
    pub async fn lookup(&self, account: &PublicKey) -> TrustResult<AccountHandle> {
        let handle = self.load(account, true).await?;
        let expired = handle.with(|a| a.is_expired(Utc::now()));
        if expired && handle.try_begin_refresh(self.inner.refresh_debounce) {
            if let Err(err) = self.refresh(&handle).await {
                tracing::debug!(account = %account, error = %err, "expired account not renewed");
            }
        }
        Ok(handle)
    }

    /// Registered account, loading it from the resolver when absent.
    pub async fn load(&self, account: &PublicKey, wait_ready: bool) -> TrustResult<AccountHandle> {
        let existing = self.inner.accounts.read().get(account).cloned();
        let mut entry = match existing {
            Some(entry) => entry,
            None => {
                let (claims, raw) = self.fetch_claims(account).await?;
                self.register(claims, raw)?
            }
        };
        if wait_ready {
            entry.wait_ready().await;
        }
        Ok(entry.handle)
    }

    /// Fetch and validate the current claim for `account`.
    pub async fn fetch_claims(&self, account: &PublicKey) -> TrustResult<(AccountClaims, String)> {
        let raw = self.inner.resolver.fetch(account.as_str()).await?;
        let claims = self.validate(account, &raw, Utc::now())?;
        Ok((claims, raw))
    }

    /// Issuer, subject and start-time checks. An expired claim is accepted;
    /// the account is then loaded in the expired state.
    pub fn validate(&self, account: &PublicKey, raw: &str, now: DateTime<Utc>) -> TrustResult<AccountClaims> {
        let claims = self.inner.validator.decode_account(raw)?;
        if claims.sub != *account {
            return Err(TrustError::malformed(format!(
                "claim subject {} does not match {account}",
                claims.sub
            )));
        }
        match check_time_bounds(&claims, now) {
            Ok(()) | Err(TrustError::Expired) => Ok(claims),
            Err(err) => Err(err),
        }
    }

    fn register(&self, claims: AccountClaims, raw: String) -> TrustResult<Entry> {
        let id = claims.sub.clone();
        let entry = {
            let mut accounts = self.inner.accounts.write();
            if let Some(existing) = accounts.get(&id) {
                // Lost a concurrent load; offer the claim to the winner.
                existing.handle.send(Command::Update {
                    claims,
                    raw,
                    done: None,
                })?;
                return Ok(existing.clone());
            }

            let account = Account::new(claims, raw, self.inner.server_limits, Utc::now());
            let (handle, task) = AccountTask::new(account, Arc::downgrade(&self.inner));
            let (ready_tx, ready) = watch::channel(false);
            let (done_tx, done_rx) = oneshot::channel();
            handle.send(Command::Reevaluate { done: Some(done_tx) })?;

            let ready_when_evaluated = async move {
                let _ = done_rx.await;
                let _ = ready_tx.send(true);
            };
            let joined = tokio::spawn(async move {
                tokio::join!(task.run(), ready_when_evaluated);
            });
            if let Some(stale) = self.inner.tasks.lock().insert(id.clone(), joined) {
                stale.abort();
            }

            let entry = Entry { handle, ready };
            accounts.insert(id.clone(), entry.clone());
            entry
        };
        tracing::info!(account = %id, "account registered");
        self.notify_importers(&id);
        Ok(entry)
    }

    /// Refetch the claim of a loaded account and offer it.
    pub async fn refresh(&self, handle: &AccountHandle) -> TrustResult<UpdateOutcome> {
        let (claims, raw) = self.fetch_claims(handle.id()).await?;
        handle.update(claims, raw).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Updates
    // ─────────────────────────────────────────────────────────────────────────

    /// Validate, store and apply a claim.
    ///
    /// The claim is stored unless the resolver is read-only. Returns the
    /// outcome when the account is loaded here, `None` otherwise.
    pub async fn apply_claim(&self, account: &str, raw: &str, origin: ClaimOrigin) -> TrustResult<Option<UpdateOutcome>> {
        let id = PublicKey::parse_kind(account, KeyKind::Account)?;
        let claims = self.validate(&id, raw, Utc::now())?;
        let resolver = &self.inner.resolver;
        if !resolver.is_read_only() {
            match origin {
                ClaimOrigin::Local => resolver.store(account, raw).await?,
                ClaimOrigin::Cluster => resolver.store_replicated(account, raw).await?,
            }
        }
        self.update_loaded(claims, raw.to_string()).await
    }

    /// Offer a validated claim to its account if it is loaded.
    pub async fn update_loaded(&self, claims: AccountClaims, raw: String) -> TrustResult<Option<UpdateOutcome>> {
        let Some(handle) = self.get(&claims.sub) else {
            return Ok(None);
        };
        handle.update(claims, raw).await.map(Some)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Import graph
    // ─────────────────────────────────────────────────────────────────────────

    /// Loaded accounts importing from `exporter`.
    pub fn importers_of(&self, exporter: &PublicKey) -> Vec<AccountHandle> {
        let ids: Vec<PublicKey> = self
            .inner
            .importers
            .read()
            .get(exporter)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        let accounts = self.inner.accounts.read();
        ids.iter()
            .filter_map(|id| accounts.get(id).map(|e| e.handle.clone()))
            .collect()
    }

    /// Record the accounts `importer` currently imports from.
    pub(crate) fn set_exporters(&self, importer: &PublicKey, exporters: BTreeSet<PublicKey>) {
        let mut importers = self.inner.importers.write();
        for (exporter, set) in importers.iter_mut() {
            if !exporters.contains(exporter) {
                set.remove(importer);
            }
        }
        importers.retain(|_, set| !set.is_empty());
        for exporter in exporters {
            importers.entry(exporter).or_default().insert(importer.clone());
        }
    }

    /// Ask every importer of `exporter` to re-run authorization.
    pub(crate) fn notify_importers(&self, exporter: &PublicKey) {
        for handle in self.importers_of(exporter) {
            if handle.id() == exporter {
                continue;
            }
            if let Err(err) = handle.send(Command::Reevaluate { done: None }) {
                tracing::debug!(account = %handle.id(), error = %err, "importer not notified");
            }
        }
    }

    /// Stop every account task.
    pub async fn shutdown(&self) {
        self.inner.accounts.write().clear();
        self.inner.importers.write().clear();
        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for (_, mut task) in tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
    }
}

impl core::fmt::Debug for AccountRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AccountRegistry")
            .field("accounts", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::MemoryResolver;
    use keyward_auth::{AccountData, TrustConfig};
    use keyward_core::KeyPair;

    struct Fixture {
        operator: KeyPair,
        resolver: Arc<MemoryResolver>,
        registry: AccountRegistry,
    }

    fn setup() -> Fixture {
        let operator = KeyPair::generate(KeyKind::Operator);
        let resolver = Arc::new(MemoryResolver::new());
        let validator = Arc::new(Validator::new(TrustConfig::new([operator.public_key()])));
        let registry = AccountRegistry::new(resolver.clone(), validator, &Options::new("test")).unwrap();
        Fixture {
            operator,
            resolver,
            registry,
        }
    }

    fn claim(f: &Fixture, account: &KeyPair, data: AccountData) -> String {
        AccountClaims::new(account.public_key(), data).encode(&f.operator).unwrap()
    }

    #[tokio::test]
    async fn load_registers_once() {
        let f = setup();
        let account = KeyPair::generate(KeyKind::Account);
        let raw = claim(&f, &account, AccountData::default());
        f.resolver.store(account.public_key().as_str(), &raw).await.unwrap();

        let a = f.registry.lookup(&account.public_key()).await.unwrap();
        let b = f.registry.lookup(&account.public_key()).await.unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(f.registry.len(), 1);
        assert_eq!(a.with(|acc| acc.raw().to_string()), raw);
    }

    #[tokio::test]
    async fn one_task_per_account_across_reloads() {
        let f = setup();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let account = KeyPair::generate(KeyKind::Account);
            let raw = claim(&f, &account, AccountData::default());
            f.resolver.store(account.public_key().as_str(), &raw).await.unwrap();
            f.registry.lookup(&account.public_key()).await.unwrap();
            f.registry.lookup(&account.public_key()).await.unwrap();
            ids.push(account.public_key());
        }
        assert_eq!(f.registry.task_count(), 3);

        // Registering an account again replaces its task.
        f.registry.inner.accounts.write().remove(&ids[0]);
        f.registry.lookup(&ids[0]).await.unwrap();
        assert_eq!(f.registry.len(), 3);
        assert_eq!(f.registry.task_count(), 3);

        f.registry.shutdown().await;
        assert_eq!(f.registry.task_count(), 0);
    }

    #[tokio::test]
    async fn unknown_account_is_not_found() {
        let f = setup();
        let account = KeyPair::generate(KeyKind::Account);
        let err = f.registry.lookup(&account.public_key()).await.unwrap_err();
        assert!(matches!(err, TrustError::NotFound(_)));
        assert!(f.registry.is_empty());
    }

    #[tokio::test]
    async fn untrusted_issuer_is_rejected() {
        let f = setup();
        let rogue = KeyPair::generate(KeyKind::Operator);
        let account = KeyPair::generate(KeyKind::Account);
        let raw = AccountClaims::new(account.public_key(), AccountData::default())
            .encode(&rogue)
            .unwrap();
        f.resolver.store(account.public_key().as_str(), &raw).await.unwrap();
        let err = f.registry.lookup(&account.public_key()).await.unwrap_err();
        assert!(matches!(err, TrustError::UntrustedIssuer(_)));
    }

    #[tokio::test]
    async fn apply_claim_stores_then_updates_loaded_account() {
        let f = setup();
        let account = KeyPair::generate(KeyKind::Account);
        let id = account.public_key();

        let first = claim(&f, &account, AccountData::default());
        let outcome = f.registry.apply_claim(id.as_str(), &first, ClaimOrigin::Local).await.unwrap();
        assert_eq!(outcome, None);
        assert_eq!(f.resolver.len(), 1);

        f.registry.lookup(&id).await.unwrap();
        let newer = AccountClaims::new(id.clone(), AccountData::default())
            .issued_at(Utc::now().timestamp() + 10)
            .encode(&f.operator)
            .unwrap();
        let outcome = f.registry.apply_claim(id.as_str(), &newer, ClaimOrigin::Local).await.unwrap();
        assert!(outcome.is_some_and(|o| o.is_applied()));
    }

    #[tokio::test]
    async fn importer_edges_follow_declared_exporters() {
        let f = setup();
        let importer = KeyPair::generate(KeyKind::Account).public_key();
        let a = KeyPair::generate(KeyKind::Account).public_key();
        let b = KeyPair::generate(KeyKind::Account).public_key();

        f.registry.set_exporters(&importer, [a.clone(), b.clone()].into());
        assert!(f.registry.inner.importers.read()[&a].contains(&importer));
        f.registry.set_exporters(&importer, [b.clone()].into());
        assert!(!f.registry.inner.importers.read().contains_key(&a));
        assert!(f.registry.inner.importers.read()[&b].contains(&importer));
    }
}
