//! Signed claim encoding.
//!
//! # Token Format
//!
//! - Header: `{"typ":"JWT","alg":"ed25519"}`
//! - Payload: the JSON [`Claims`] envelope
//! - Signature: Ed25519 over `base64url(header).base64url(payload)` made by
//!   the key named in `iss`
//!
//! The `jti` is the base64url SHA-256 of the payload serialized with an empty
//! `jti`, so two encodings of the same content share an identifier.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use keyward_core::{KeyPair, TrustError, TrustResult};

use crate::claims::{Claim, ClaimKind, ClaimPayload, Claims};

const JWT_HEADER: &str = r#"{"typ":"JWT","alg":"ed25519"}"#;

#[derive(Deserialize)]
struct Header {
    typ: String,
    alg: String,
}

#[derive(Deserialize)]
struct KindOnly {
    #[serde(rename = "type")]
    kind: ClaimKind,
}

struct Parts<'a> {
    signing_input: &'a str,
    payload: Vec<u8>,
    signature: Vec<u8>,
}

fn split(token: &str) -> TrustResult<Parts<'_>> {
    let token = token.trim();
    let mut it = token.rsplitn(2, '.');
    let (Some(sig_b64), Some(signing_input)) = (it.next(), it.next()) else {
        return Err(TrustError::malformed("expected three segments"));
    };
    let Some((header_b64, payload_b64)) = signing_input.split_once('.') else {
        return Err(TrustError::malformed("expected three segments"));
    };
    if payload_b64.contains('.') {
        return Err(TrustError::malformed("expected three segments"));
    }

    let header_bytes = URL_SAFE_NO_PAD
        .decode(header_b64)
        .map_err(|_| TrustError::malformed("header is not base64url"))?;
    let header: Header = serde_json::from_slice(&header_bytes)
        .map_err(|e| TrustError::malformed(format!("header: {e}")))?;
    if header.typ != "JWT" || header.alg != "ed25519" {
        return Err(TrustError::malformed(format!(
            "unsupported header {}/{}",
            header.typ, header.alg
        )));
    }

    let payload = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| TrustError::malformed("payload is not base64url"))?;
    let signature = URL_SAFE_NO_PAD
        .decode(sig_b64)
        .map_err(|_| TrustError::malformed("signature is not base64url"))?;

    Ok(Parts {
        signing_input,
        payload,
        signature,
    })
}

impl<P: ClaimPayload> Claims<P> {
    /// Sign the claim with `signer`, filling in `iss`, `jti` and (if unset) `iat`.
    pub fn encode(&self, signer: &KeyPair) -> TrustResult<String> {
        let mut claims = self.clone();
        claims.iss = signer.public_key();
        claims.kind = P::KIND;
        if claims.iat == 0 {
            claims.iat = Utc::now().timestamp();
        }
        claims.jti = String::new();
        let unhashed = serde_json::to_vec(&claims)
            .map_err(|e| TrustError::malformed(format!("encode: {e}")))?;
        claims.jti = URL_SAFE_NO_PAD.encode(Sha256::digest(&unhashed));
        let payload = serde_json::to_vec(&claims)
            .map_err(|e| TrustError::malformed(format!("encode: {e}")))?;

        let header_b64 = URL_SAFE_NO_PAD.encode(JWT_HEADER);
        let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
        let signing_input = format!("{header_b64}.{payload_b64}");
        let signature = signer.sign(signing_input.as_bytes());
        Ok(format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(signature)))
    }
}

/// Decode a token of a known kind and verify its signature.
///
/// Time bounds are not checked here; see [`crate::validation`].
pub fn decode<P: ClaimPayload>(token: &str) -> TrustResult<Claims<P>> {
    let parts = split(token)?;
    let claims: Claims<P> = serde_json::from_slice(&parts.payload)
        .map_err(|e| TrustError::malformed(format!("payload: {e}")))?;

    if claims.kind != P::KIND {
        return Err(TrustError::malformed(format!(
            "expected {} claim, got {}",
            P::KIND,
            claims.kind
        )));
    }
    if claims.sub.kind() != P::SUBJECT {
        return Err(TrustError::malformed(format!(
            "{} claim subject must be an {} key",
            P::KIND,
            P::SUBJECT
        )));
    }
    if claims.iss.kind() != P::ISSUER {
        return Err(TrustError::malformed(format!(
            "{} claim issuer must be an {} key",
            P::KIND,
            P::ISSUER
        )));
    }

    claims
        .iss
        .verify(parts.signing_input.as_bytes(), &parts.signature)?;
    Ok(claims)
}

/// Kind of a token, read without verifying it.
pub fn peek_kind(token: &str) -> TrustResult<ClaimKind> {
    let parts = split(token)?;
    let kind_only: KindOnly = serde_json::from_slice(&parts.payload)
        .map_err(|e| TrustError::malformed(format!("payload: {e}")))?;
    Ok(kind_only.kind)
}

/// Decode and verify a token of any kind.
pub fn decode_any(token: &str) -> TrustResult<Claim> {
    Ok(match peek_kind(token)? {
        ClaimKind::Operator => Claim::Operator(decode(token)?),
        ClaimKind::Account => Claim::Account(decode(token)?),
        ClaimKind::User => Claim::User(decode(token)?),
        ClaimKind::Activation => Claim::Activation(decode(token)?),
    })
}
