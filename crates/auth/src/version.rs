//! Claim version ordering.
//!
//! Versions are ordered by `iat`. Within one second, a claim with a different
//! `jti` replaces the current one and the replaced `jti` can never come back.

use std::collections::BTreeSet;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Offer {
    /// Should replace the current version.
    Newer,
    /// Identical to the current version.
    Same,
    /// Older than, or superseded by, the current version.
    Stale,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionState {
    iat: i64,
    jti: String,
    superseded: BTreeSet<String>,
}

impl VersionState {
    pub fn new(iat: i64, jti: impl Into<String>) -> Self {
        Self {
            iat,
            jti: jti.into(),
            superseded: BTreeSet::new(),
        }
    }

    pub fn iat(&self) -> i64 {
        self.iat
    }

    pub fn jti(&self) -> &str {
        &self.jti
    }

    /// Classify a candidate without changing state.
    pub fn check(&self, iat: i64, jti: &str) -> Offer {
        if iat < self.iat {
            Offer::Stale
        } else if iat > self.iat {
            Offer::Newer
        } else if jti == self.jti {
            Offer::Same
        } else if self.superseded.contains(jti) {
            Offer::Stale
        } else {
            Offer::Newer
        }
    }

    /// Classify a candidate and adopt it when newer.
    pub fn offer(&mut self, iat: i64, jti: &str) -> Offer {
        let offer = self.check(iat, jti);
        if offer == Offer::Newer {
            if iat == self.iat {
                let replaced = std::mem::replace(&mut self.jti, jti.to_string());
                self.superseded.insert(replaced);
            } else {
                self.iat = iat;
                self.jti = jti.to_string();
                self.superseded.clear();
            }
        }
        offer
    }
}
