//! Per-account deadline bookkeeping.
//!
//! Each account task owns one [`Schedule`]. A key has at most one deadline;
//! arming it again replaces the old one, so re-arming after every update can
//! never leave a duplicate timer behind.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use keyward_accounts::{ClientId, ImportKey};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum TimerKey {
    /// Account claim expiry.
    Account,
    /// User claim expiry or time-window end.
    Client(ClientId),
    /// Activation expiry of an import.
    Activation(ImportKey),
}

#[derive(Debug, Default)]
pub struct Schedule {
    timers: BTreeMap<TimerKey, DateTime<Utc>>,
}

impl Schedule {
    pub fn arm(&mut self, key: TimerKey, at: DateTime<Utc>) {
        self.timers.insert(key, at);
    }

    /// Arm `key` at `at`, or disarm it when `at` is `None`.
    pub fn set(&mut self, key: TimerKey, at: Option<DateTime<Utc>>) {
        match at {
            Some(at) => self.arm(key, at),
            None => {
                self.disarm(&key);
            }
        }
    }

    pub fn disarm(&mut self, key: &TimerKey) -> bool {
        self.timers.remove(key).is_some()
    }

    /// Drop every activation timer.
    pub fn disarm_activations(&mut self) {
        self.timers.retain(|k, _| !matches!(k, TimerKey::Activation(_)));
    }

    pub fn deadline(&self, key: &TimerKey) -> Option<DateTime<Utc>> {
        self.timers.get(key).copied()
    }

    /// Earliest armed deadline.
    pub fn next(&self) -> Option<DateTime<Utc>> {
        self.timers.values().min().copied()
    }

    /// Remove and return every timer due at `now`.
    pub fn take_due(&mut self, now: DateTime<Utc>) -> Vec<(TimerKey, DateTime<Utc>)> {
        let due: Vec<TimerKey> = self
            .timers
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        due.into_iter()
            .filter_map(|k| self.timers.remove(&k).map(|at| (k, at)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

/// Tokio instant corresponding to a wall-clock deadline.
pub fn instant_for(at: DateTime<Utc>) -> tokio::time::Instant {
    let wait = (at - Utc::now()).to_std().unwrap_or_default();
    tokio::time::Instant::now() + wait
}
