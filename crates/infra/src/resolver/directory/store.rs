//! One-file-per-account claim store.
//!
//! Files are named `<account>.jwt` and replaced whole: the new content is
//! written to a temporary file, synced, then renamed over the old one, so a
//! reader sees either the previous claim or the new one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;

use keyward_auth::{Offer, VersionState};
use keyward_core::{KeyKind, LimitKind, PublicKey, TrustError, TrustResult};
use keyward_events::{ClaimsDigest, DigestEntry};

use crate::resolver::peek_account;

const EXTENSION: &str = "jwt";

/// What to do when a new account would exceed the entry limit.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LimitPolicy {
    /// Refuse the new entry.
    Reject,
    /// Drop the least recently used entry.
    EvictLru,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    Unchanged,
    Stale,
}

#[derive(Debug)]
struct Entry {
    version: VersionState,
    stored: Instant,
    accessed: Instant,
}

#[derive(Debug)]
pub struct DirectoryStore {
    dir: PathBuf,
    limit: usize,
    policy: LimitPolicy,
    ttl: Option<Duration>,
    index: Mutex<HashMap<String, Entry>>,
    writes: tokio::sync::Mutex<()>,
}

impl DirectoryStore {
    /// Open (creating if needed) and index the claims already on disk.
    pub async fn open(
        dir: impl Into<PathBuf>,
        limit: usize,
        policy: LimitPolicy,
        ttl: Option<Duration>,
    ) -> TrustResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await.map_err(TrustError::io)?;

        let mut index = HashMap::new();
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(TrustError::io)?;
        let now = Instant::now();
        while let Some(entry) = entries.next_entry().await.map_err(TrustError::io)? {
            let path = entry.path();
            let Some(account) = account_of(&path) else {
                continue;
            };
            let raw = match tokio::fs::read_to_string(&path).await {
                Ok(raw) => raw,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "unreadable claim file");
                    continue;
                }
            };
            match peek_account(&account, raw.trim()) {
                Ok(claims) => {
                    index.insert(
                        account,
                        Entry {
                            version: VersionState::new(claims.iat, claims.jti),
                            stored: now,
                            accessed: now,
                        },
                    );
                }
                Err(err) => tracing::warn!(path = %path.display(), error = %err, "skipping invalid claim file"),
            }
        }
        tracing::info!(dir = %dir.display(), claims = index.len(), "directory store opened");

        Ok(Self {
            dir,
            limit,
            policy,
            ttl,
            index: Mutex::new(index),
            writes: tokio::sync::Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file holding `account`'s claim.
    pub fn path_for(&self, account: &str) -> TrustResult<PathBuf> {
        PublicKey::parse_kind(account, KeyKind::Account)?;
        Ok(self.dir.join(format!("{account}.{EXTENSION}")))
    }

    pub fn len(&self) -> usize {
        self.index.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.lock().is_empty()
    }

    fn is_expired(&self, entry: &Entry, now: Instant) -> bool {
        self.ttl.is_some_and(|ttl| now.duration_since(entry.stored) >= ttl)
    }

    /// Holds a live (unexpired) entry for `account`.
    pub fn contains(&self, account: &str) -> bool {
        let now = Instant::now();
        self.index
            .lock()
            .get(account)
            .is_some_and(|e| !self.is_expired(e, now))
    }

    /// Claim for `account`; an expired entry is deleted and reported absent.
    pub async fn get(&self, account: &str) -> TrustResult<Option<String>> {
        let path = self.path_for(account)?;
        let now = Instant::now();
        let expired = match self.index.lock().get(account) {
            None => return Ok(None),
            Some(entry) => self.is_expired(entry, now),
        };
        if expired {
            self.remove(account).await?;
            return Ok(None);
        }
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => {
                if let Some(entry) = self.index.lock().get_mut(account) {
                    entry.accessed = now;
                }
                Ok(Some(raw.trim().to_string()))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.index.lock().remove(account);
                Ok(None)
            }
            Err(err) => Err(TrustError::io(err)),
        }
    }

    /// Store `raw` unless an equal or newer claim is already held.
    pub async fn put(&self, account: &str, raw: &str) -> TrustResult<PutOutcome> {
        let path = self.path_for(account)?;
        let claims = peek_account(account, raw)?;
        let _writing = self.writes.lock().await;

        let now = Instant::now();
        let victim = {
            let index = self.index.lock();
            match index.get(account).filter(|e| !self.is_expired(e, now)) {
                Some(entry) => match entry.version.check(claims.iat, &claims.jti) {
                    Offer::Same => return Ok(PutOutcome::Unchanged),
                    Offer::Stale => return Ok(PutOutcome::Stale),
                    Offer::Newer => None,
                },
                None if !index.contains_key(account) && index.len() >= self.limit => match self.policy {
                    LimitPolicy::Reject => {
                        tracing::warn!(account, limit = self.limit, "claim store full, rejecting account");
                        return Err(TrustError::LimitExceeded(LimitKind::StoredClaims));
                    }
                    LimitPolicy::EvictLru => index
                        .iter()
                        .min_by_key(|(_, e)| e.accessed)
                        .map(|(id, _)| id.clone()),
                },
                None => None,
            }
        };
        if let Some(victim) = victim {
            tracing::debug!(account = %victim, "evicting least recently used claim");
            self.remove(&victim).await?;
        }

        write_atomic(&path, raw).await?;

        let mut index = self.index.lock();
        match index.get_mut(account).filter(|e| !self.is_expired(e, now)) {
            Some(entry) => {
                entry.version.offer(claims.iat, &claims.jti);
                entry.stored = now;
                entry.accessed = now;
            }
            None => {
                index.insert(
                    account.to_string(),
                    Entry {
                        version: VersionState::new(claims.iat, claims.jti),
                        stored: now,
                        accessed: now,
                    },
                );
            }
        }
        Ok(PutOutcome::Stored)
    }

    pub async fn remove(&self, account: &str) -> TrustResult<bool> {
        let path = self.path_for(account)?;
        let known = self.index.lock().remove(account).is_some();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(known),
            Err(err) => Err(TrustError::io(err)),
        }
    }

    /// Delete every entry whose TTL has elapsed. Returns the removed accounts.
    pub async fn sweep_expired(&self) -> Vec<String> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .index
            .lock()
            .iter()
            .filter(|(_, e)| self.is_expired(e, now))
            .map(|(id, _)| id.clone())
            .collect();
        let mut removed = Vec::with_capacity(expired.len());
        for account in expired {
            match self.remove(&account).await {
                Ok(_) => removed.push(account),
                Err(err) => tracing::warn!(account = %account, error = %err, "failed to evict expired claim"),
            }
        }
        if !removed.is_empty() {
            tracing::debug!(count = removed.len(), "expired claims evicted");
        }
        removed
    }

    pub fn digest(&self) -> ClaimsDigest {
        let mut entries: Vec<DigestEntry> = self
            .index
            .lock()
            .iter()
            .map(|(account, e)| DigestEntry {
                account: account.clone(),
                iat: e.version.iat(),
            })
            .collect();
        entries.sort_by(|a, b| a.account.cmp(&b.account));
        ClaimsDigest { entries }
    }
}

fn account_of(path: &Path) -> Option<String> {
    if path.extension()? != EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    PublicKey::parse_kind(stem, KeyKind::Account).ok()?;
    Some(stem.to_string())
}

async fn write_atomic(path: &Path, raw: &str) -> TrustResult<()> {
    let tmp = path.with_extension(format!("{EXTENSION}.tmp"));
    let mut file = tokio::fs::File::create(&tmp).await.map_err(TrustError::io)?;
    file.write_all(raw.as_bytes()).await.map_err(TrustError::io)?;
    file.sync_all().await.map_err(TrustError::io)?;
    drop(file);
    tokio::fs::rename(&tmp, path).await.map_err(TrustError::io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyward_auth::{AccountClaims, AccountData};
    use keyward_core::KeyPair;

    struct Fixture {
        operator: KeyPair,
        dir: tempfile::TempDir,
    }

    fn setup() -> Fixture {
        Fixture {
            operator: KeyPair::generate(KeyKind::Operator),
            dir: tempfile::tempdir().unwrap(),
        }
    }

    impl Fixture {
        fn claim(&self, account: &KeyPair, iat: i64) -> String {
            AccountClaims::new(account.public_key(), AccountData::default())
                .issued_at(iat)
                .encode(&self.operator)
                .unwrap()
        }

        async fn store(&self, limit: usize, policy: LimitPolicy, ttl: Option<Duration>) -> DirectoryStore {
            DirectoryStore::open(self.dir.path(), limit, policy, ttl).await.unwrap()
        }
    }

    #[tokio::test]
    async fn writes_one_file_per_account_and_keeps_newest() {
        let f = setup();
        let store = f.store(10, LimitPolicy::Reject, None).await;
        let account = KeyPair::generate(KeyKind::Account);
        let id = account.public_key().to_string();

        let v2 = f.claim(&account, 200);
        assert_eq!(store.put(&id, &v2).await.unwrap(), PutOutcome::Stored);
        assert_eq!(store.put(&id, &v2).await.unwrap(), PutOutcome::Unchanged);
        assert_eq!(store.put(&id, &f.claim(&account, 100)).await.unwrap(), PutOutcome::Stale);

        let on_disk = std::fs::read_to_string(f.dir.path().join(format!("{id}.jwt"))).unwrap();
        assert_eq!(on_disk, v2);
        assert_eq!(store.get(&id).await.unwrap(), Some(v2));
        assert_eq!(store.digest().entries, vec![DigestEntry { account: id, iat: 200 }]);
    }

    #[tokio::test]
    async fn reopening_indexes_existing_files() {
        let f = setup();
        let account = KeyPair::generate(KeyKind::Account);
        let id = account.public_key().to_string();
        {
            let store = f.store(10, LimitPolicy::Reject, None).await;
            store.put(&id, &f.claim(&account, 5)).await.unwrap();
        }
        std::fs::write(f.dir.path().join("garbage.jwt"), "nope").unwrap();
        let store = f.store(10, LimitPolicy::Reject, None).await;
        assert_eq!(store.len(), 1);
        assert_eq!(store.put(&id, &f.claim(&account, 4)).await.unwrap(), PutOutcome::Stale);
    }

    #[tokio::test]
    async fn limit_rejects_or_evicts() {
        let f = setup();
        let store = f.store(1, LimitPolicy::Reject, None).await;
        let a = KeyPair::generate(KeyKind::Account);
        let b = KeyPair::generate(KeyKind::Account);
        store.put(a.public_key().as_str(), &f.claim(&a, 1)).await.unwrap();
        assert_eq!(
            store.put(b.public_key().as_str(), &f.claim(&b, 1)).await,
            Err(TrustError::LimitExceeded(LimitKind::StoredClaims))
        );
        // Updating an existing entry is always allowed.
        store.put(a.public_key().as_str(), &f.claim(&a, 2)).await.unwrap();

        let g = setup();
        let cache = g.store(1, LimitPolicy::EvictLru, None).await;
        cache.put(a.public_key().as_str(), &g.claim(&a, 1)).await.unwrap();
        cache.put(b.public_key().as_str(), &g.claim(&b, 1)).await.unwrap();
        assert!(!cache.contains(a.public_key().as_str()));
        assert!(cache.contains(b.public_key().as_str()));
        assert!(!g.dir.path().join(format!("{}.jwt", a.public_key())).exists());
    }

    #[tokio::test]
    async fn expired_entries_are_deleted_from_disk() {
        let f = setup();
        let store = f.store(10, LimitPolicy::EvictLru, Some(Duration::from_millis(30))).await;
        let account = KeyPair::generate(KeyKind::Account);
        let id = account.public_key().to_string();
        store.put(&id, &f.claim(&account, 1)).await.unwrap();
        let path = store.path_for(&id).unwrap();
        assert!(path.exists());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.sweep_expired().await, vec![id.clone()]);
        assert!(!path.exists());
        assert_eq!(store.get(&id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn refuses_paths_that_are_not_account_keys() {
        let f = setup();
        let store = f.store(10, LimitPolicy::Reject, None).await;
        assert!(store.path_for("../etc/passwd").is_err());
        assert!(store.get("../etc/passwd").await.is_err());
    }
}
