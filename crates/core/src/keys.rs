//! Key identities.
//!
//! A principal is addressed by its public key, rendered as a one-letter role
//! prefix followed by the URL-safe base64 encoding of the Ed25519 key:
//!
//! - `O…` operator
//! - `A…` account
//! - `U…` user
//!
//! The prefix is part of the identity: an account key can never be mistaken
//! for a user key even though both are Ed25519 keys underneath.

use core::str::FromStr;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::{TrustError, TrustResult};

/// Role of a key in the trust chain.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    Operator,
    Account,
    User,
}

impl KeyKind {
    pub fn prefix(self) -> char {
        match self {
            KeyKind::Operator => 'O',
            KeyKind::Account => 'A',
            KeyKind::User => 'U',
        }
    }

    pub fn from_prefix(c: char) -> Option<Self> {
        match c {
            'O' => Some(KeyKind::Operator),
            'A' => Some(KeyKind::Account),
            'U' => Some(KeyKind::User),
            _ => None,
        }
    }
}

impl core::fmt::Display for KeyKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            KeyKind::Operator => "operator",
            KeyKind::Account => "account",
            KeyKind::User => "user",
        };
        f.write_str(s)
    }
}

/// Public identity of an operator, account or user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PublicKey(String);

impl PublicKey {
    pub fn kind(&self) -> KeyKind {
        // Validated on construction.
        self.0
            .chars()
            .next()
            .and_then(KeyKind::from_prefix)
            .unwrap_or(KeyKind::User)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn key_bytes(&self) -> TrustResult<[u8; 32]> {
        let bytes = URL_SAFE_NO_PAD
            .decode(&self.0[1..])
            .map_err(|e| TrustError::malformed(format!("public key: {e}")))?;
        bytes
            .try_into()
            .map_err(|_| TrustError::malformed("public key: expected 32 bytes"))
    }

    pub fn verifying_key(&self) -> TrustResult<VerifyingKey> {
        VerifyingKey::from_bytes(&self.key_bytes()?)
            .map_err(|e| TrustError::malformed(format!("public key: {e}")))
    }

    /// Verify an Ed25519 signature made by this key over `message`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> TrustResult<()> {
        let sig: [u8; 64] = signature.try_into().map_err(|_| TrustError::BadSignature)?;
        self.verifying_key()?
            .verify(message, &Signature::from_bytes(&sig))
            .map_err(|_| TrustError::BadSignature)
    }

    /// Parse and require a specific role.
    pub fn parse_kind(s: &str, kind: KeyKind) -> TrustResult<Self> {
        let key = Self::from_str(s)?;
        if key.kind() != kind {
            return Err(TrustError::malformed(format!(
                "expected {kind} key, got {}",
                key.kind()
            )));
        }
        Ok(key)
    }

    fn encode(kind: KeyKind, key: &VerifyingKey) -> Self {
        let mut s = String::with_capacity(44);
        s.push(kind.prefix());
        s.push_str(&URL_SAFE_NO_PAD.encode(key.as_bytes()));
        Self(s)
    }
}

impl core::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PublicKey {
    type Err = TrustError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let first = s
            .chars()
            .next()
            .ok_or_else(|| TrustError::malformed("public key: empty"))?;
        if KeyKind::from_prefix(first).is_none() {
            return Err(TrustError::malformed(format!(
                "public key: unknown prefix {first:?}"
            )));
        }
        let key = Self(s.to_string());
        key.verifying_key()?;
        Ok(key)
    }
}

impl TryFrom<String> for PublicKey {
    type Error = TrustError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_str(&value)
    }
}

impl From<PublicKey> for String {
    fn from(value: PublicKey) -> Self {
        value.0
    }
}

impl AsRef<str> for PublicKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for PublicKey {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for PublicKey {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Private signing key for one role.
pub struct KeyPair {
    kind: KeyKind,
    signing: SigningKey,
}

impl KeyPair {
    pub fn generate(kind: KeyKind) -> Self {
        Self {
            kind,
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_seed(kind: KeyKind, seed: [u8; 32]) -> Self {
        Self {
            kind,
            signing: SigningKey::from_bytes(&seed),
        }
    }

    pub fn kind(&self) -> KeyKind {
        self.kind
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::encode(self.kind, &self.signing.verifying_key())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }
}

impl core::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_key_carries_role_prefix() {
        let account = KeyPair::generate(KeyKind::Account);
        let pk = account.public_key();
        assert!(pk.as_str().starts_with('A'));
        assert_eq!(pk.kind(), KeyKind::Account);
        assert_eq!(pk.as_str().len(), 44);
    }

    #[test]
    fn parse_round_trips_and_checks_role() {
        let user = KeyPair::generate(KeyKind::User).public_key();
        let parsed: PublicKey = user.as_str().parse().unwrap();
        assert_eq!(parsed, user);
        assert!(PublicKey::parse_kind(user.as_str(), KeyKind::User).is_ok());
        let Err(TrustError::MalformedToken(_)) = PublicKey::parse_kind(user.as_str(), KeyKind::Account) else {
            panic!("expected role mismatch to be malformed");
        };
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("".parse::<PublicKey>().is_err());
        assert!("Xabc".parse::<PublicKey>().is_err());
        assert!("Aabc".parse::<PublicKey>().is_err());
    }

    #[test]
    fn signature_verifies_only_for_signer() {
        let a = KeyPair::generate(KeyKind::Account);
        let b = KeyPair::generate(KeyKind::Account);
        let sig = a.sign(b"payload");
        assert!(a.public_key().verify(b"payload", &sig).is_ok());
        assert_eq!(a.public_key().verify(b"payloaD", &sig), Err(TrustError::BadSignature));
        assert_eq!(b.public_key().verify(b"payload", &sig), Err(TrustError::BadSignature));
    }

    #[test]
    fn seeded_pairs_are_deterministic() {
        let a = KeyPair::from_seed(KeyKind::Operator, [7u8; 32]);
        let b = KeyPair::from_seed(KeyKind::Operator, [7u8; 32]);
        assert_eq!(a.public_key(), b.public_key());
        assert!(!format!("{a:?}").contains("signing"));
    }

    #[test]
    fn serde_uses_string_form() {
        let pk = KeyPair::generate(KeyKind::User).public_key();
        let json = serde_json::to_string(&pk).unwrap();
        assert_eq!(json, format!("\"{pk}\""));
        let back: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pk);
        assert!(serde_json::from_str::<PublicKey>("\"Unope\"").is_err());
    }
}
