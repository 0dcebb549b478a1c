//! Directory-backed nodes sharing one system bus.

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::{Operator, account_key, bearer, eventually, init_logging, user, user_key};
use keyward_auth::{AccountData, UserData};
use keyward_core::TrustError;
use keyward_events::{InMemoryEventBus, UpdateResponse};
use keyward_infra::{ConnectRequest, DirectoryConfig, DirectoryMode, ResolverConfig, Server, SystemBus};

const WINDOW: Duration = Duration::from_millis(200);
const WAIT: Duration = Duration::from_secs(3);

fn bus() -> SystemBus {
    Arc::new(InMemoryEventBus::new())
}

async fn node(op: &Operator, name: &str, dir: &Path, config: impl FnOnce(DirectoryConfig) -> DirectoryConfig, bus: &SystemBus) -> Server {
    init_logging();
    let directory = config(DirectoryConfig::new(dir, DirectoryMode::Full));
    let options = op.options(name).with_resolver(ResolverConfig::Directory(directory));
    Server::start(options, Some(bus.clone())).await.unwrap()
}

fn file(dir: &Path, account: &str) -> Option<String> {
    std::fs::read_to_string(dir.join(format!("{account}.jwt"))).ok()
}

#[tokio::test]
async fn update_is_answered_by_every_full_node() {
    let op = Operator::new();
    let bus = bus();
    let (d1, d2) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
    let n1 = node(&op, "n1", d1.path(), |c| c, &bus).await;
    let _n2 = node(&op, "n2", d2.path(), |c| c, &bus).await;

    let account = account_key();
    let id = account.public_key().to_string();
    let raw = op.account(&account, AccountData::default(), 0);

    let responses = n1.propagate_claim(&raw, WINDOW).await.unwrap();
    assert_eq!(responses.len(), 2);
    assert!(responses.iter().all(UpdateResponse::is_ok));
    assert_eq!(file(d1.path(), &id).as_deref(), Some(raw.as_str()));
    assert!(eventually(WAIT, || file(d2.path(), &id).as_deref() == Some(raw.as_str())).await);
}

#[tokio::test]
async fn rejected_update_reports_a_client_error() {
    let op = Operator::new();
    let rogue = Operator::new();
    let bus = bus();
    let (d1, d2) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
    let n1 = node(&op, "n1", d1.path(), |c| c, &bus).await;
    let _n2 = node(&rogue, "n2", d2.path(), |c| c, &bus).await;

    let raw = op.account(&account_key(), AccountData::default(), 0);
    let responses = n1.propagate_claim(&raw, WINDOW).await.unwrap();
    assert!(responses[0].is_ok());
    let UpdateResponse::Error(err) = &responses[1] else {
        panic!("expected n2 to refuse: {responses:?}");
    };
    assert_eq!(err.code, 400);
}

#[tokio::test]
async fn digest_exchange_repairs_a_node_that_missed_an_update() {
    let op = Operator::new();
    let bus = bus();
    let (d1, d2) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
    let fast = |c: DirectoryConfig| c.with_interval(Duration::from_millis(50));
    let n1 = node(&op, "n1", d1.path(), fast, &bus).await;

    let account = account_key();
    let id = account.public_key().to_string();
    let raw = op.account(&account, AccountData::default(), 0);
    assert!(n1.update_account_claims(&raw).await.is_ok());

    // n2 joins after the broadcast went out.
    let _n2 = node(&op, "n2", d2.path(), fast, &bus).await;
    assert!(eventually(WAIT, || file(d2.path(), &id).as_deref() == Some(raw.as_str())).await);
}

#[tokio::test]
async fn cache_node_fetches_on_miss_and_forgets_after_ttl() {
    let op = Operator::new();
    let bus = bus();
    let (d1, d2) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
    let n1 = node(&op, "full", d1.path(), |c| c, &bus).await;
    let cache = |c: DirectoryConfig| DirectoryConfig {
        mode: DirectoryMode::Cache,
        ..c.with_ttl(Duration::from_millis(200))
    };
    let n2 = node(&op, "cache", d2.path(), cache, &bus).await;

    let account = account_key();
    let id = account.public_key().to_string();
    let first = op.account(&account, AccountData::default(), 10);
    n1.propagate_claim(&first, WINDOW).await.unwrap();
    // A cache does not take claims it never asked for.
    assert_eq!(file(d2.path(), &id), None);

    let jwt = user(&account, None, &user_key(), bearer(UserData::default()));
    n2.connect(ConnectRequest::bearer(jwt)).await.unwrap();
    assert_eq!(file(d2.path(), &id).as_deref(), Some(first.as_str()));

    assert!(eventually(WAIT, || file(d2.path(), &id).is_none()).await);

    let second = op.account(&account, AccountData::default(), 0);
    n1.propagate_claim(&second, WINDOW).await.unwrap();
    assert_eq!(n2.resolver().fetch(&id).await.unwrap(), second);
    assert_eq!(file(d2.path(), &id).as_deref(), Some(second.as_str()));

    let unknown = account_key().public_key().to_string();
    let err = n2.resolver().fetch(&unknown).await.unwrap_err();
    assert!(matches!(err, TrustError::NotFound(_)));
}

#[tokio::test]
async fn full_directory_refuses_claims_beyond_its_limit() {
    let op = Operator::new();
    let bus = bus();
    let dir = tempfile::tempdir().unwrap();
    let n1 = node(&op, "n1", dir.path(), |c| c.with_limit(1), &bus).await;

    let first = n1
        .update_account_claims(&op.account(&account_key(), AccountData::default(), 0))
        .await;
    assert!(first.is_ok());
    let second = n1
        .update_account_claims(&op.account(&account_key(), AccountData::default(), 0))
        .await;
    let UpdateResponse::Error(err) = second else {
        panic!("expected the second claim to be refused");
    };
    assert_eq!(err.code, 500);
}
