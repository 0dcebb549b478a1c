#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use keyward_auth::{AccountClaims, AccountData, ActivationClaims, ActivationData, ExportKind, UserClaims, UserData};
use keyward_core::{KeyKind, KeyPair, PublicKey};
use keyward_infra::{MemoryResolver, Options, Server};
use keyward_observability::LoggingConfig;

pub fn init_logging() {
    keyward_observability::init_with(&LoggingConfig::default().with_level("debug").with_json(false));
}

pub fn now() -> i64 {
    Utc::now().timestamp()
}

pub struct Operator {
    pub key: KeyPair,
}

impl Operator {
    pub fn new() -> Self {
        Self {
            key: KeyPair::generate(KeyKind::Operator),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.key.public_key()
    }

    pub fn options(&self, name: &str) -> Options {
        Options::new(name).with_operator(&self.public_key())
    }

    /// Account claim issued `age` seconds ago.
    pub fn account(&self, account: &KeyPair, data: AccountData, age: i64) -> String {
        self.account_claims(AccountClaims::new(account.public_key(), data).issued_at(now() - age))
    }

    pub fn account_claims(&self, claims: AccountClaims) -> String {
        claims.encode(&self.key).expect("account claim")
    }
}

pub fn account_key() -> KeyPair {
    KeyPair::generate(KeyKind::Account)
}

pub fn user_key() -> KeyPair {
    KeyPair::generate(KeyKind::User)
}

/// User claim signed by `signer`, scoped to `account` when the signer is a
/// signing key.
pub fn user(signer: &KeyPair, account: Option<&KeyPair>, user: &KeyPair, mut data: UserData) -> String {
    data.issuer_account = account.map(KeyPair::public_key);
    UserClaims::new(user.public_key(), data).encode(signer).expect("user claim")
}

pub fn bearer(data: UserData) -> UserData {
    UserData {
        bearer_token: true,
        ..data
    }
}

/// Activation from `exporter` for `importer` on `subject`.
pub fn activation(exporter: &KeyPair, importer: &PublicKey, subject: &str, kind: ExportKind, exp: Option<i64>) -> String {
    let mut claims = ActivationClaims::new(
        importer.clone(),
        ActivationData {
            import_subject: subject.to_string(),
            import_type: kind,
            issuer_account: None,
        },
    );
    claims.exp = exp;
    claims.encode(exporter).expect("activation")
}

/// A standalone node over a memory resolver.
pub async fn memory_server(operator: &Operator, name: &str) -> (Server, Arc<MemoryResolver>) {
    memory_server_with(operator.options(name)).await
}

pub async fn memory_server_with(options: Options) -> (Server, Arc<MemoryResolver>) {
    init_logging();
    let resolver = Arc::new(MemoryResolver::new());
    let server = Server::start_with_resolver(options, resolver.clone(), None)
        .await
        .expect("server start");
    (server, resolver)
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
