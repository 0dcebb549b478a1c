//! Account JetStream limits tracked across claim updates.

mod common;

use common::{Operator, account_key, memory_server_with};
use keyward_auth::{AccountData, AccountLimits, JetStreamLimits};
use keyward_infra::JetStreamConfig;

fn with_storage(mem: i64) -> AccountData {
    AccountData {
        limits: AccountLimits {
            jetstream: JetStreamLimits {
                mem_storage: mem,
                disk_storage: 10,
                streams: 1,
                consumer: 1,
            },
            ..AccountLimits::default()
        },
        ..AccountData::default()
    }
}

#[tokio::test]
async fn limits_follow_the_claims_until_capacity_runs_out() {
    let op = Operator::new();
    let options = op.options("n1").with_jetstream(JetStreamConfig {
        max_memory: 1000,
        max_store: 1000,
    });
    let (server, _) = memory_server_with(options).await;
    let account = account_key();
    let id = account.public_key();

    server.update_account_claims(&op.account(&account, with_storage(500), 30)).await;
    server.registry().lookup(&id).await.unwrap();
    let jetstream = server.registry().jetstream().unwrap();
    assert_eq!(jetstream.applied(&id).map(|l| l.mem_storage), Some(500));

    // The claim still applies; its JetStream limits do not.
    let update = server.update_account_claims(&op.account(&account, with_storage(5000), 20)).await;
    assert!(update.is_ok());
    assert_eq!(jetstream.applied(&id).map(|l| l.mem_storage), Some(500));

    server.update_account_claims(&op.account(&account, AccountData::default(), 10)).await;
    assert_eq!(jetstream.applied(&id), None);
}

#[tokio::test]
async fn nodes_without_jetstream_ignore_the_limits() {
    let op = Operator::new();
    let (server, _) = memory_server_with(op.options("n1")).await;
    let account = account_key();

    server.update_account_claims(&op.account(&account, with_storage(500), 0)).await;
    server.registry().lookup(&account.public_key()).await.unwrap();
    assert!(server.registry().jetstream().is_none());
}
