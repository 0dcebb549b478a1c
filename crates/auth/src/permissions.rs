//! Publish/subscribe permissions carried by user claims.

use serde::{Deserialize, Serialize};

use keyward_core::subject;

/// Default response allowance when a response permission is present but zero.
pub const DEFAULT_RESPONSE_MAX_MSGS: i64 = 1;
pub const DEFAULT_RESPONSE_EXPIRES_MS: i64 = 2 * 60 * 1000;

/// Allow/deny subject patterns. Deny wins; an empty allow list allows everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectPermission {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deny: Vec<String>,
}

impl SubjectPermission {
    pub fn allow(subjects: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            allow: subjects.into_iter().map(Into::into).collect(),
            deny: Vec::new(),
        }
    }

    pub fn deny(mut self, subjects: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.deny.extend(subjects.into_iter().map(Into::into));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty()
    }

    /// Check a literal subject.
    pub fn allows(&self, literal: &str) -> bool {
        if self.deny.iter().any(|d| subject::matches(d, literal)) {
            return false;
        }
        self.allow.is_empty() || self.allow.iter().any(|a| subject::matches(a, literal))
    }

    /// Check a subscription pattern.
    ///
    /// The pattern must sit inside some allow entry and must not be wholly
    /// denied. Partially denied wildcards are admitted; delivery filters them
    /// with [`Self::allows`].
    pub fn allows_pattern(&self, pattern: &str) -> bool {
        if self.deny.iter().any(|d| subject::is_subset(pattern, d)) {
            return false;
        }
        self.allow.is_empty() || self.allow.iter().any(|a| subject::is_subset(pattern, a))
    }
}

/// Allowance to publish replies to requests the user received.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponsePermission {
    #[serde(default)]
    pub max_msgs: i64,
    #[serde(default)]
    pub expires_ms: i64,
}

impl ResponsePermission {
    /// Zero fields take their defaults; negative values mean unlimited and are kept.
    pub fn normalized(self) -> Self {
        Self {
            max_msgs: if self.max_msgs == 0 {
                DEFAULT_RESPONSE_MAX_MSGS
            } else {
                self.max_msgs
            },
            expires_ms: if self.expires_ms == 0 {
                DEFAULT_RESPONSE_EXPIRES_MS
            } else {
                self.expires_ms
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(default, rename = "pub", skip_serializing_if = "SubjectPermission::is_empty")]
    pub publish: SubjectPermission,
    #[serde(default, rename = "sub", skip_serializing_if = "SubjectPermission::is_empty")]
    pub subscribe: SubjectPermission,
    #[serde(default, rename = "resp", skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponsePermission>,
}

impl Permissions {
    pub fn normalized(mut self) -> Self {
        self.response = self.response.map(ResponsePermission::normalized);
        self
    }
}
