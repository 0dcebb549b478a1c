//! Effective resource limits.
//!
//! A claim states what an account or user may use; the process may impose a
//! lower ceiling. The effective value is the smaller of the two, with
//! negative values meaning "no limit" on either side.

use serde::{Deserialize, Serialize};

use keyward_auth::{AccountLimits, UserLimits};

/// Process-wide overrides. `None` leaves the claim value in charge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerLimits {
    #[serde(default)]
    pub max_connections: Option<i64>,
    #[serde(default)]
    pub max_subscriptions: Option<i64>,
    #[serde(default)]
    pub max_payload: Option<i64>,
}

/// Resolved limits. `None` is unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EffectiveLimits {
    pub connections: Option<u64>,
    pub subscriptions: Option<u64>,
    pub payload: Option<u64>,
}

fn bounded(v: i64) -> Option<u64> {
    u64::try_from(v).ok()
}

fn min_limit(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

impl EffectiveLimits {
    pub fn for_account(server: &ServerLimits, claim: &AccountLimits) -> Self {
        Self {
            connections: min_limit(server.max_connections.and_then(bounded), bounded(claim.conn)),
            subscriptions: min_limit(server.max_subscriptions.and_then(bounded), bounded(claim.subs)),
            payload: min_limit(server.max_payload.and_then(bounded), bounded(claim.payload)),
        }
    }

    /// Narrow account limits by a user's own limits.
    pub fn for_user(&self, user: &UserLimits) -> Self {
        Self {
            connections: self.connections,
            subscriptions: min_limit(self.subscriptions, bounded(user.subs)),
            payload: min_limit(self.payload, bounded(user.payload)),
        }
    }

    pub fn allows_payload(&self, len: usize) -> bool {
        self.payload.is_none_or(|max| len as u64 <= max)
    }

    pub fn allows_subscriptions(&self, count: usize) -> bool {
        self.subscriptions.is_none_or(|max| count as u64 <= max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim(conn: i64, subs: i64, payload: i64) -> AccountLimits {
        AccountLimits {
            conn,
            subs,
            payload,
            ..AccountLimits::default()
        }
    }

    #[test]
    fn unlimited_on_both_sides() {
        let l = EffectiveLimits::for_account(&ServerLimits::default(), &AccountLimits::default());
        assert_eq!(l, EffectiveLimits::default());
        assert!(l.allows_payload(usize::MAX));
    }

    #[test]
    fn lower_server_override_wins() {
        let server = ServerLimits {
            max_connections: Some(2),
            max_payload: Some(1024),
            ..ServerLimits::default()
        };
        let l = EffectiveLimits::for_account(&server, &claim(10, -1, 4096));
        assert_eq!(l.connections, Some(2));
        assert_eq!(l.payload, Some(1024));
        assert_eq!(l.subscriptions, None);
    }

    #[test]
    fn lower_claim_wins_over_server() {
        let server = ServerLimits {
            max_connections: Some(100),
            ..ServerLimits::default()
        };
        let l = EffectiveLimits::for_account(&server, &claim(5, -1, -1));
        assert_eq!(l.connections, Some(5));
    }

    #[test]
    fn user_limits_narrow_account_limits() {
        let account = EffectiveLimits::for_account(&ServerLimits::default(), &claim(-1, 10, 100));
        let user = UserLimits {
            subs: 3,
            payload: 500,
            ..UserLimits::default()
        };
        let l = account.for_user(&user);
        assert_eq!(l.subscriptions, Some(3));
        assert_eq!(l.payload, Some(100));
        assert!(l.allows_payload(100));
        assert!(!l.allows_payload(101));
        assert!(l.allows_subscriptions(3));
        assert!(!l.allows_subscriptions(4));
    }
}
