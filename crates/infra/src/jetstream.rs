//! JetStream limit bookkeeping.
//!
//! The store behind JetStream reserves capacity on every `enable` call, so
//! applying the same limits twice would double-count. [`JetStreamManager`]
//! remembers what it applied per account and only talks to the store when
//! the limits actually change.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use keyward_auth::JetStreamLimits;
use keyward_core::{LimitKind, PublicKey, TrustError, TrustResult};

use crate::config::JetStreamConfig;

/// External storage engine interface.
pub trait JetStreamLimitsStore: Send + Sync {
    /// Reserve capacity for `account`. Not idempotent.
    fn enable(&self, account: &PublicKey, limits: &JetStreamLimits) -> TrustResult<()>;

    /// Release whatever `account` holds.
    fn disable(&self, account: &PublicKey);
}

/// Capacity-checked reservations kept in memory.
#[derive(Debug)]
pub struct InMemoryJetStream {
    capacity: JetStreamConfig,
    reservations: Mutex<HashMap<PublicKey, Vec<JetStreamLimits>>>,
}

impl InMemoryJetStream {
    pub fn new(capacity: JetStreamConfig) -> Self {
        Self {
            capacity,
            reservations: Mutex::new(HashMap::new()),
        }
    }

    /// `(memory, store)` currently reserved by all accounts.
    pub fn reserved(&self) -> (i64, i64) {
        self.reservations
            .lock()
            .values()
            .flatten()
            .fold((0, 0), |(m, d), l| (m + l.mem_storage.max(0), d + l.disk_storage.max(0)))
    }

    /// Number of live reservations held by `account`.
    pub fn reservation_count(&self, account: &PublicKey) -> usize {
        self.reservations.lock().get(account).map_or(0, Vec::len)
    }
}

impl JetStreamLimitsStore for InMemoryJetStream {
    fn enable(&self, account: &PublicKey, limits: &JetStreamLimits) -> TrustResult<()> {
        let (mem, disk) = self.reserved();
        if mem + limits.mem_storage.max(0) > self.capacity.max_memory
            || disk + limits.disk_storage.max(0) > self.capacity.max_store
        {
            return Err(TrustError::LimitExceeded(LimitKind::JetStream));
        }
        self.reservations.lock().entry(account.clone()).or_default().push(*limits);
        Ok(())
    }

    fn disable(&self, account: &PublicKey) {
        self.reservations.lock().remove(account);
    }
}

/// Applies account JetStream limits at most once per distinct value.
pub struct JetStreamManager {
    store: Arc<dyn JetStreamLimitsStore>,
    applied: Mutex<HashMap<PublicKey, JetStreamLimits>>,
}

impl JetStreamManager {
    pub fn new(store: Arc<dyn JetStreamLimitsStore>) -> Self {
        Self {
            store,
            applied: Mutex::new(HashMap::new()),
        }
    }

    /// Limits currently in force for `account`, if enabled.
    pub fn applied(&self, account: &PublicKey) -> Option<JetStreamLimits> {
        self.applied.lock().get(account).copied()
    }

    /// Bring `account` to `limits`. Returns whether anything changed.
    ///
    /// Zero limits disable JetStream. Limits the store rejects leave the
    /// previous ones in force.
    pub fn apply(&self, account: &PublicKey, limits: &JetStreamLimits) -> TrustResult<bool> {
        let mut applied = self.applied.lock();
        let previous = applied.get(account).copied();
        if !limits.is_enabled() {
            if previous.is_none() {
                return Ok(false);
            }
            self.store.disable(account);
            applied.remove(account);
            tracing::info!(account = %account, "jetstream disabled");
            return Ok(true);
        }
        if previous.as_ref() == Some(limits) {
            return Ok(false);
        }

        if previous.is_some() {
            self.store.disable(account);
        }
        match self.store.enable(account, limits) {
            Ok(()) => {
                applied.insert(account.clone(), *limits);
                tracing::info!(account = %account, "jetstream limits applied");
                Ok(true)
            }
            Err(err) => {
                if let Some(prev) = previous {
                    if let Err(restore) = self.store.enable(account, &prev) {
                        tracing::error!(account = %account, error = %restore, "failed to restore jetstream limits");
                        applied.remove(account);
                    }
                }
                tracing::warn!(account = %account, error = %err, "jetstream limits rejected");
                Err(err)
            }
        }
    }
}

impl core::fmt::Debug for JetStreamManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JetStreamManager")
            .field("accounts", &self.applied.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyward_core::{KeyKind, KeyPair};

    fn setup() -> (Arc<InMemoryJetStream>, JetStreamManager, PublicKey) {
        let store = Arc::new(InMemoryJetStream::new(JetStreamConfig {
            max_memory: 1000,
            max_store: 1000,
        }));
        let manager = JetStreamManager::new(store.clone());
        (store, manager, KeyPair::generate(KeyKind::Account).public_key())
    }

    fn limits(mem: i64, disk: i64) -> JetStreamLimits {
        JetStreamLimits {
            mem_storage: mem,
            disk_storage: disk,
            streams: 1,
            consumer: 1,
        }
    }

    #[test]
    fn identical_limits_are_applied_once() {
        let (store, manager, account) = setup();
        assert!(manager.apply(&account, &limits(100, 100)).unwrap());
        assert!(!manager.apply(&account, &limits(100, 100)).unwrap());
        assert_eq!(store.reservation_count(&account), 1);
        assert_eq!(store.reserved(), (100, 100));
    }

    #[test]
    fn changed_limits_replace_the_reservation() {
        let (store, manager, account) = setup();
        manager.apply(&account, &limits(100, 100)).unwrap();
        manager.apply(&account, &limits(300, 50)).unwrap();
        assert_eq!(store.reserved(), (300, 50));
        assert_eq!(manager.applied(&account), Some(limits(300, 50)));
    }

    #[test]
    fn over_capacity_keeps_previous_limits() {
        let (store, manager, account) = setup();
        manager.apply(&account, &limits(100, 100)).unwrap();
        assert_eq!(
            manager.apply(&account, &limits(5000, 100)),
            Err(TrustError::LimitExceeded(LimitKind::JetStream))
        );
        assert_eq!(manager.applied(&account), Some(limits(100, 100)));
        assert_eq!(store.reserved(), (100, 100));
    }

    #[test]
    fn over_capacity_on_first_apply_leaves_disabled() {
        let (store, manager, account) = setup();
        assert!(manager.apply(&account, &limits(5000, 1)).is_err());
        assert_eq!(manager.applied(&account), None);
        assert_eq!(store.reservation_count(&account), 0);
    }

    #[test]
    fn zero_limits_disable() {
        let (store, manager, account) = setup();
        assert!(!manager.apply(&account, &JetStreamLimits::default()).unwrap());
        manager.apply(&account, &limits(10, 10)).unwrap();
        assert!(manager.apply(&account, &JetStreamLimits::default()).unwrap());
        assert_eq!(store.reserved(), (0, 0));
        assert_eq!(manager.applied(&account), None);
    }
}
