//! Claim model.
//!
//! Every signed credential shares one envelope ([`Claims`]) and carries a
//! kind-specific payload in `data`. The envelope is what gets signed; see
//! [`crate::jwt`] for the encoding.

use std::collections::{BTreeMap, BTreeSet};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use keyward_core::{KeyKind, PublicKey};

use crate::permissions::Permissions;
use crate::time_window::TimeRange;

/// Sentinel for "no limit" in numeric claim limits.
pub const NO_LIMIT: i64 = -1;

/// Revocation key that applies to every user of an account.
pub const ALL_USERS: &str = "*";

fn no_limit() -> i64 {
    NO_LIMIT
}

fn is_false(b: &bool) -> bool {
    !*b
}

// ─────────────────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimKind {
    Operator,
    Account,
    User,
    Activation,
}

impl core::fmt::Display for ClaimKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            ClaimKind::Operator => "operator",
            ClaimKind::Account => "account",
            ClaimKind::User => "user",
            ClaimKind::Activation => "activation",
        };
        f.write_str(s)
    }
}

/// Kind-specific payload of a claim.
pub trait ClaimPayload: Serialize + DeserializeOwned + Clone + core::fmt::Debug {
    const KIND: ClaimKind;
    /// Role the `sub` key must have.
    const SUBJECT: KeyKind;
    /// Role the `iss` key must have.
    const ISSUER: KeyKind;
}

/// Signed claim envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims<P> {
    /// Content hash, assigned on encode.
    #[serde(default)]
    pub jti: String,
    /// Issued-at, seconds since the epoch. Identifies the claim version.
    #[serde(default)]
    pub iat: i64,
    pub iss: PublicKey,
    pub sub: PublicKey,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    #[serde(rename = "type")]
    pub kind: ClaimKind,
    pub data: P,
}

impl<P: ClaimPayload> Claims<P> {
    /// New unsigned claim about `sub`. `iss` is replaced by the signer on encode.
    pub fn new(sub: PublicKey, data: P) -> Self {
        Self {
            jti: String::new(),
            iat: 0,
            iss: sub.clone(),
            sub,
            name: String::new(),
            exp: None,
            nbf: None,
            kind: P::KIND,
            data,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn issued_at(mut self, iat: i64) -> Self {
        self.iat = iat;
        self
    }

    pub fn expires_at(mut self, exp: i64) -> Self {
        self.exp = Some(exp);
        self
    }

    pub fn not_before(mut self, nbf: i64) -> Self {
        self.nbf = Some(nbf);
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Operator
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorData {
    /// Keys allowed to sign account claims on the operator's behalf.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub signing_keys: BTreeSet<PublicKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_account: Option<PublicKey>,
}

impl ClaimPayload for OperatorData {
    const KIND: ClaimKind = ClaimKind::Operator;
    const SUBJECT: KeyKind = KeyKind::Operator;
    const ISSUER: KeyKind = KeyKind::Operator;
}

pub type OperatorClaims = Claims<OperatorData>;

// ─────────────────────────────────────────────────────────────────────────────
// Account
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountData {
    #[serde(default)]
    pub limits: AccountLimits,
    /// Alternate keys allowed to sign users and activations for this account.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub signing_keys: BTreeSet<PublicKey>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exports: Vec<Export>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub imports: Vec<Import>,
    #[serde(default, skip_serializing_if = "Revocations::is_empty")]
    pub revocations: Revocations,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl ClaimPayload for AccountData {
    const KIND: ClaimKind = ClaimKind::Account;
    const SUBJECT: KeyKind = KeyKind::Account;
    const ISSUER: KeyKind = KeyKind::Operator;
}

pub type AccountClaims = Claims<AccountData>;

/// Account resource limits. Negative means unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountLimits {
    #[serde(default = "no_limit")]
    pub conn: i64,
    #[serde(default = "no_limit")]
    pub subs: i64,
    #[serde(default = "no_limit")]
    pub payload: i64,
    #[serde(default)]
    pub jetstream: JetStreamLimits,
}

impl Default for AccountLimits {
    fn default() -> Self {
        Self {
            conn: NO_LIMIT,
            subs: NO_LIMIT,
            payload: NO_LIMIT,
            jetstream: JetStreamLimits::default(),
        }
    }
}

/// JetStream resource limits. All zero means JetStream is disabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JetStreamLimits {
    #[serde(default)]
    pub mem_storage: i64,
    #[serde(default)]
    pub disk_storage: i64,
    #[serde(default)]
    pub streams: i64,
    #[serde(default)]
    pub consumer: i64,
}

impl JetStreamLimits {
    pub fn is_enabled(&self) -> bool {
        *self != Self::default()
    }
}

/// Subject → revoke-if-issued-at-or-before timestamp.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revocations(BTreeMap<String, i64>);

impl Revocations {
    pub fn revoke(&mut self, subject: &PublicKey, at: i64) {
        self.0.insert(subject.to_string(), at);
    }

    /// Revoke every subject issued at or before `at`.
    pub fn revoke_all(&mut self, at: i64) {
        self.0.insert(ALL_USERS.to_string(), at);
    }

    pub fn clear(&mut self, subject: &str) {
        self.0.remove(subject);
    }

    /// Is a credential about `subject` issued at `iat` revoked?
    pub fn is_revoked(&self, subject: &str, iat: i64) -> bool {
        [subject, ALL_USERS]
            .iter()
            .filter_map(|k| self.0.get(*k))
            .any(|ts| iat <= *ts)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportKind {
    Stream,
    Service,
}

impl core::fmt::Display for ExportKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ExportKind::Stream => f.write_str("stream"),
            ExportKind::Service => f.write_str("service"),
        }
    }
}

/// How many responses a service export may send per request.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    #[default]
    Singleton,
    Stream,
    Chunked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Export {
    pub subject: String,
    #[serde(rename = "type")]
    pub kind: ExportKind,
    #[serde(default, skip_serializing_if = "is_false")]
    pub token_req: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_type: Option<ResponseType>,
    /// Activation subject (importer) → revoke-if-issued-at-or-before.
    #[serde(default, skip_serializing_if = "Revocations::is_empty")]
    pub revocations: Revocations,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

impl Export {
    pub fn stream(subject: impl Into<String>) -> Self {
        Self::new(subject, ExportKind::Stream)
    }

    pub fn service(subject: impl Into<String>) -> Self {
        Self::new(subject, ExportKind::Service)
    }

    fn new(subject: impl Into<String>, kind: ExportKind) -> Self {
        Self {
            subject: subject.into(),
            kind,
            token_req: false,
            response_type: None,
            revocations: Revocations::default(),
            name: String::new(),
        }
    }

    pub fn with_token_required(mut self, required: bool) -> Self {
        self.token_req = required;
        self
    }

    pub fn with_response_type(mut self, rt: ResponseType) -> Self {
        self.response_type = Some(rt);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Import {
    pub subject: String,
    #[serde(rename = "type")]
    pub kind: ExportKind,
    /// Exporting account.
    pub account: PublicKey,
    /// Local subject. A prefix when `subject` has wildcards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Activation JWT, or an `http(s)://` URL serving one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

impl Import {
    pub fn stream(account: PublicKey, subject: impl Into<String>) -> Self {
        Self::new(account, subject, ExportKind::Stream)
    }

    pub fn service(account: PublicKey, subject: impl Into<String>) -> Self {
        Self::new(account, subject, ExportKind::Service)
    }

    fn new(account: PublicKey, subject: impl Into<String>, kind: ExportKind) -> Self {
        Self {
            subject: subject.into(),
            kind,
            account,
            to: None,
            token: None,
            name: String::new(),
        }
    }

    pub fn to(mut self, local: impl Into<String>) -> Self {
        self.to = Some(local.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// User
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserData {
    #[serde(default)]
    pub permissions: Permissions,
    #[serde(default)]
    pub limits: UserLimits,
    /// Account the user belongs to when signed by one of its signing keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer_account: Option<PublicKey>,
    /// Admit without the nonce challenge.
    #[serde(default, skip_serializing_if = "is_false")]
    pub bearer_token: bool,
}

impl ClaimPayload for UserData {
    const KIND: ClaimKind = ClaimKind::User;
    const SUBJECT: KeyKind = KeyKind::User;
    const ISSUER: KeyKind = KeyKind::Account;
}

pub type UserClaims = Claims<UserData>;

impl UserClaims {
    /// Account this user is scoped to.
    pub fn account(&self) -> &PublicKey {
        self.data.issuer_account.as_ref().unwrap_or(&self.iss)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserLimits {
    #[serde(default = "no_limit")]
    pub subs: i64,
    #[serde(default = "no_limit")]
    pub payload: i64,
    /// Allowed source networks in CIDR notation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub src: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub times: Vec<TimeRange>,
    /// IANA zone the `times` are expressed in. UTC when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
}

impl Default for UserLimits {
    fn default() -> Self {
        Self {
            subs: NO_LIMIT,
            payload: NO_LIMIT,
            src: Vec::new(),
            times: Vec::new(),
            locale: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Activation
// ─────────────────────────────────────────────────────────────────────────────

/// Grant from an exporter to one importing account (`sub`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationData {
    pub import_subject: String,
    pub import_type: ExportKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer_account: Option<PublicKey>,
}

impl ClaimPayload for ActivationData {
    const KIND: ClaimKind = ClaimKind::Activation;
    const SUBJECT: KeyKind = KeyKind::Account;
    const ISSUER: KeyKind = KeyKind::Account;
}

pub type ActivationClaims = Claims<ActivationData>;

/// A decoded claim of any kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    Operator(OperatorClaims),
    Account(AccountClaims),
    User(UserClaims),
    Activation(ActivationClaims),
}

impl Claim {
    pub fn kind(&self) -> ClaimKind {
        match self {
            Claim::Operator(_) => ClaimKind::Operator,
            Claim::Account(_) => ClaimKind::Account,
            Claim::User(_) => ClaimKind::User,
            Claim::Activation(_) => ClaimKind::Activation,
        }
    }

    pub fn subject(&self) -> &PublicKey {
        match self {
            Claim::Operator(c) => &c.sub,
            Claim::Account(c) => &c.sub,
            Claim::User(c) => &c.sub,
            Claim::Activation(c) => &c.sub,
        }
    }
}
