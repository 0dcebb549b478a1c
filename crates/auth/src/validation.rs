//! Chain validation.
//!
//! Decoding ([`crate::jwt`]) proves a token was signed by its `iss`. This
//! module decides whether that issuer is entitled to sign it and whether the
//! claim is usable *now*.
//!
//! ## Trust roots
//!
//! The trusted operator set is an explicit [`TrustConfig`] value held by a
//! [`Validator`]. Reloading swaps the whole value at once; readers holding an
//! older snapshot finish against it.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;

use keyward_core::{PublicKey, TrustError, TrustResult};

use crate::claims::{AccountClaims, ActivationClaims, Claims, OperatorData, Revocations, UserClaims};
use crate::jwt;
use crate::time_window::TimeWindows;

// ─────────────────────────────────────────────────────────────────────────────
// Trust configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustConfig {
    operators: BTreeSet<PublicKey>,
    signing_keys: BTreeSet<PublicKey>,
    system_account: Option<PublicKey>,
}

impl TrustConfig {
    pub fn new(operators: impl IntoIterator<Item = PublicKey>) -> Self {
        Self {
            operators: operators.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Build from self-signed operator JWTs. Their signing keys are trusted too.
    pub fn from_operator_jwts<S: AsRef<str>>(jwts: &[S], now: DateTime<Utc>) -> TrustResult<Self> {
        let mut config = Self::default();
        for raw in jwts {
            let claims: Claims<OperatorData> = jwt::decode(raw.as_ref())?;
            if claims.iss != claims.sub {
                return Err(TrustError::untrusted(claims.iss.to_string()));
            }
            check_time_bounds(&claims, now)?;
            config.signing_keys.extend(claims.data.signing_keys);
            if config.system_account.is_none() {
                config.system_account = claims.data.system_account;
            }
            config.operators.insert(claims.sub);
        }
        Ok(config)
    }

    pub fn with_operator(mut self, operator: PublicKey) -> Self {
        self.operators.insert(operator);
        self
    }

    pub fn with_signing_key(mut self, key: PublicKey) -> Self {
        self.signing_keys.insert(key);
        self
    }

    pub fn with_system_account(mut self, account: PublicKey) -> Self {
        self.system_account = Some(account);
        self
    }

    pub fn system_account(&self) -> Option<&PublicKey> {
        self.system_account.as_ref()
    }

    pub fn is_trusted(&self, issuer: &PublicKey) -> bool {
        self.operators.contains(issuer) || self.signing_keys.contains(issuer)
    }

    /// Operator identities and their signing keys.
    pub fn issuers(&self) -> impl Iterator<Item = &PublicKey> {
        self.operators.iter().chain(self.signing_keys.iter())
    }
}

/// Validates account claims against the current trust roots.
#[derive(Debug)]
pub struct Validator {
    config: RwLock<Arc<TrustConfig>>,
}

impl Validator {
    pub fn new(config: TrustConfig) -> Self {
        Self {
            config: RwLock::new(Arc::new(config)),
        }
    }

    pub fn snapshot(&self) -> Arc<TrustConfig> {
        self.config.read().clone()
    }

    /// Replace the trust roots.
    pub fn reload(&self, config: TrustConfig) {
        *self.config.write() = Arc::new(config);
        tracing::info!("trusted operators reloaded");
    }

    pub fn decode_account(&self, raw: &str) -> TrustResult<AccountClaims> {
        let claims: AccountClaims = jwt::decode(raw)?;
        let config = self.snapshot();
        verify(&claims, config.issuers(), None)?;
        Ok(claims)
    }

    /// Decode and check issuer and time bounds.
    pub fn verify_account(&self, raw: &str, now: DateTime<Utc>) -> TrustResult<AccountClaims> {
        let claims = self.decode_account(raw)?;
        check_time_bounds(&claims, now)?;
        Ok(claims)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Checks
// ─────────────────────────────────────────────────────────────────────────────

fn instant(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

/// Expired if `now` is past `exp`; not yet valid before `nbf`.
pub fn check_time_bounds<P>(claims: &Claims<P>, now: DateTime<Utc>) -> TrustResult<()> {
    if let Some(exp) = claims.exp.filter(|e| *e > 0).and_then(instant) {
        if now > exp {
            return Err(TrustError::Expired);
        }
    }
    if let Some(nbf) = claims.nbf.filter(|n| *n > 0).and_then(instant) {
        if now < nbf {
            return Err(TrustError::NotYetValid);
        }
    }
    Ok(())
}

/// Issuer must be one of `expected`; time bounds are checked when `now` is given.
pub fn verify<'a, P>(
    claims: &Claims<P>,
    mut expected: impl Iterator<Item = &'a PublicKey>,
    now: Option<DateTime<Utc>>,
) -> TrustResult<()> {
    if !expected.any(|k| *k == claims.iss) {
        return Err(TrustError::untrusted(claims.iss.to_string()));
    }
    match now {
        Some(now) => check_time_bounds(claims, now),
        None => Ok(()),
    }
}

/// What the issuing account contributes to a user check.
#[derive(Debug, Clone, Copy)]
pub struct IssuerContext<'a> {
    pub account: &'a PublicKey,
    pub signing_keys: &'a BTreeSet<PublicKey>,
    pub revocations: &'a Revocations,
}

/// Full user check at connect time. Returns the key that signed the user.
pub fn verify_user(
    user: &UserClaims,
    ctx: IssuerContext<'_>,
    now: DateTime<Utc>,
    client_ip: Option<IpAddr>,
) -> TrustResult<PublicKey> {
    if user.account() != ctx.account {
        return Err(TrustError::unauthorized(format!(
            "user belongs to account {}",
            user.account()
        )));
    }
    if user.iss != *ctx.account && !ctx.signing_keys.contains(&user.iss) {
        return Err(TrustError::UnknownSigner(user.iss.to_string()));
    }

    check_time_bounds(user, now)?;

    let windows = TimeWindows::parse(&user.data.limits.times, user.data.limits.locale.as_deref())?;
    if !windows.contains(now) {
        return Err(TrustError::NotYetValid);
    }

    if !user.data.limits.src.is_empty() {
        let allowed = client_ip.is_some_and(|ip| {
            user.data
                .limits
                .src
                .iter()
                .any(|cidr| cidr_contains(cidr, ip))
        });
        if !allowed {
            return Err(TrustError::unauthorized("source address not allowed"));
        }
    }

    if ctx.revocations.is_revoked(user.sub.as_str(), user.iat) {
        return Err(TrustError::Revoked);
    }
    Ok(user.iss.clone())
}

/// Check an activation against the exporter's current keys.
pub fn verify_activation(
    activation: &ActivationClaims,
    exporter: &PublicKey,
    exporter_signing_keys: &BTreeSet<PublicKey>,
    now: DateTime<Utc>,
) -> TrustResult<()> {
    if let Some(issuer_account) = &activation.data.issuer_account {
        if issuer_account != exporter {
            return Err(TrustError::InvalidIssuerAccount(issuer_account.to_string()));
        }
    }
    if activation.iss != *exporter {
        let declared = activation.data.issuer_account.is_some();
        if !declared || !exporter_signing_keys.contains(&activation.iss) {
            return Err(TrustError::UnknownSigner(activation.iss.to_string()));
        }
    }
    check_time_bounds(activation, now)
}

/// `addr/bits`, or a bare address for a single host.
pub fn cidr_contains(cidr: &str, ip: IpAddr) -> bool {
    let (addr, bits) = match cidr.split_once('/') {
        Some((a, b)) => match b.trim().parse::<u32>() {
            Ok(bits) => (a.trim(), Some(bits)),
            Err(_) => return false,
        },
        None => (cidr.trim(), None),
    };
    let Ok(net) = addr.parse::<IpAddr>() else {
        return false;
    };
    match (net, ip) {
        (IpAddr::V4(n), IpAddr::V4(i)) => {
            let bits = bits.unwrap_or(32);
            if bits > 32 {
                return false;
            }
            let mask = u32::MAX.checked_shl(32 - bits).unwrap_or(0);
            u32::from(n) & mask == u32::from(i) & mask
        }
        (IpAddr::V6(n), IpAddr::V6(i)) => {
            let bits = bits.unwrap_or(128);
            if bits > 128 {
                return false;
            }
            let mask = u128::MAX.checked_shl(128 - bits).unwrap_or(0);
            u128::from(n) & mask == u128::from(i) & mask
        }
        _ => false,
    }
}
