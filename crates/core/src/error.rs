//! Trust error model.

use thiserror::Error;

/// Result type used across the trust layers.
pub type TrustResult<T> = Result<T, TrustError>;

/// Resource whose limit was exceeded.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum LimitKind {
    Connections,
    Subscriptions,
    Payload,
    /// Directory resolver entry count.
    StoredClaims,
    JetStream,
}

impl core::fmt::Display for LimitKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            LimitKind::Connections => "connections",
            LimitKind::Subscriptions => "subscriptions",
            LimitKind::Payload => "payload",
            LimitKind::StoredClaims => "stored claims",
            LimitKind::JetStream => "jetstream",
        };
        f.write_str(s)
    }
}

/// Trust-level error.
///
/// Every decision made about a credential (decode, chain validation, limits,
/// resolution) reports through this type. Callers that only need to know
/// whether a retry might help should use [`TrustError::is_transient`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TrustError {
    /// The token could not be parsed (structure, encoding, claim kind).
    #[error("malformed token: {0}")]
    MalformedToken(String),

    /// The embedded signature does not verify against the embedded issuer.
    #[error("bad signature")]
    BadSignature,

    /// The issuer is not one of the expected trust roots.
    #[error("untrusted issuer: {0}")]
    UntrustedIssuer(String),

    /// The signer is not a registered signing key of the named account.
    #[error("unknown signer: {0}")]
    UnknownSigner(String),

    /// An activation's issuer-account back-reference does not match the exporter.
    #[error("invalid issuer account {0:?} in activation claim")]
    InvalidIssuerAccount(String),

    #[error("expired")]
    Expired,

    #[error("not yet valid")]
    NotYetValid,

    #[error("revoked")]
    Revoked,

    /// Rejected for a reason other than the chain (source IP, kind mismatch, permissions).
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Resolver could not reach its backing store. Retryable.
    #[error("fetch failed: {0}")]
    FetchFailed(String),

    /// Resolver has no knowledge of the identity.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("maximum {0} exceeded")]
    LimitExceeded(LimitKind),

    /// `store` called on a resolver that only reads.
    #[error("resolver is read only")]
    ReadOnly,

    #[error("io: {0}")]
    Io(String),
}

impl TrustError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedToken(msg.into())
    }

    pub fn untrusted(issuer: impl Into<String>) -> Self {
        Self::UntrustedIssuer(issuer.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn fetch_failed(msg: impl Into<String>) -> Self {
        Self::FetchFailed(msg.into())
    }

    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }

    pub fn io(err: impl core::fmt::Display) -> Self {
        Self::Io(err.to_string())
    }

    /// True when a later attempt may succeed without any claim changing.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::FetchFailed(_) | Self::NotFound(_) | Self::Io(_))
    }

    /// Text reported to a client whose connection or operation was refused.
    pub fn client_text(&self) -> &'static str {
        match self {
            Self::Expired => "User Authentication Expired",
            Self::Revoked => "User Authentication Revoked",
            Self::LimitExceeded(LimitKind::Connections) => "Maximum Connections Exceeded",
            Self::LimitExceeded(LimitKind::Subscriptions) => "Maximum Subscriptions Exceeded",
            Self::LimitExceeded(LimitKind::Payload) => "Maximum Payload Violation",
            _ => "Authorization Violation",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(TrustError::fetch_failed("timeout").is_transient());
        assert!(TrustError::not_found("A1").is_transient());
        assert!(!TrustError::BadSignature.is_transient());
        assert!(!TrustError::Revoked.is_transient());
    }

    #[test]
    fn client_text_is_reason_tagged() {
        assert_eq!(TrustError::Expired.client_text(), "User Authentication Expired");
        assert_eq!(TrustError::Revoked.client_text(), "User Authentication Revoked");
        assert_eq!(
            TrustError::LimitExceeded(LimitKind::Connections).client_text(),
            "Maximum Connections Exceeded"
        );
        assert_eq!(
            TrustError::UnknownSigner("A".into()).client_text(),
            "Authorization Violation"
        );
    }

    #[test]
    fn invalid_issuer_account_message_quotes_id() {
        let err = TrustError::InvalidIssuerAccount("AXYZ".into());
        assert_eq!(err.to_string(), "invalid issuer account \"AXYZ\" in activation claim");
    }
}
