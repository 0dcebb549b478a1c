//! Import/export authorization.
//!
//! An import is authorized when the exporting account currently offers a
//! matching export and, for token-gated exports, a valid activation names
//! the importer. The decision is a pure function of both sides' current
//! claims, so re-running it after any change converges to the same result as
//! a cold build.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use keyward_auth::{ActivationClaims, Export, ExportKind, Import, ResponseType, jwt, verify_activation};
use keyward_core::{PublicKey, TrustError, TrustResult, subject};

use crate::shadow::ImportKey;

/// The part of an exporting account that import checks need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSnapshot {
    pub account: PublicKey,
    pub signing_keys: BTreeSet<PublicKey>,
    pub exports: Vec<Export>,
    pub expired: bool,
}

impl ExportSnapshot {
    /// Export covering `subject` of `kind`, if any.
    pub fn find(&self, kind: ExportKind, subject: &str) -> Option<&Export> {
        self.exports
            .iter()
            .find(|e| e.kind == kind && subject::is_subset(subject, &e.subject))
    }
}

/// An import that passed authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImport {
    pub key: ImportKey,
    /// Subject (pattern) on the exporter's side.
    pub subject: String,
    /// `to` from the import claim.
    pub to: Option<String>,
    pub response_type: ResponseType,
    /// Activation expiry, seconds since the epoch.
    pub activation_expires: Option<i64>,
}

impl ResolvedImport {
    pub fn kind(&self) -> ExportKind {
        self.key.kind
    }

    pub fn exporter(&self) -> &PublicKey {
        &self.key.account
    }

    /// Pattern of the import in the importer's subject space.
    ///
    /// `to` replaces a literal subject and prefixes a wildcard one.
    pub fn local_pattern(&self) -> String {
        match &self.to {
            None => self.subject.clone(),
            Some(to) if subject::is_literal(&self.subject) => to.clone(),
            Some(to) => format!("{to}.{}", self.subject),
        }
    }

    /// Map a literal exporter subject into the importer's space.
    pub fn to_local(&self, exported: &str) -> Option<String> {
        if !subject::matches(&self.subject, exported) {
            return None;
        }
        Some(match &self.to {
            None => exported.to_string(),
            Some(to) if subject::is_literal(&self.subject) => to.clone(),
            Some(to) => format!("{to}.{exported}"),
        })
    }

    /// Map a literal importer subject to the exporter's space.
    pub fn to_exporter(&self, local: &str) -> Option<String> {
        let mapped = match &self.to {
            None => local.to_string(),
            Some(to) if subject::is_literal(&self.subject) => {
                return (local == to).then(|| self.subject.clone());
            }
            Some(to) => local.strip_prefix(to.as_str())?.strip_prefix('.')?.to_string(),
        };
        subject::matches(&self.subject, &mapped).then_some(mapped)
    }
}

/// Decide whether `import` of account `importer` is authorized.
///
/// `exporter` is `None` when the exporting account could not be resolved.
/// `activation` is the raw activation JWT, already fetched if the import
/// referenced one by URL.
pub fn authorize_import(
    importer: &PublicKey,
    import: &Import,
    exporter: Option<&ExportSnapshot>,
    activation: Option<&str>,
    now: DateTime<Utc>,
) -> TrustResult<ResolvedImport> {
    let exporter = exporter.ok_or_else(|| TrustError::not_found(import.account.to_string()))?;
    if exporter.account != import.account {
        return Err(TrustError::unauthorized("exporter mismatch"));
    }
    if exporter.expired {
        return Err(TrustError::Expired);
    }
    let export = exporter.find(import.kind, &import.subject).ok_or_else(|| {
        TrustError::unauthorized(format!(
            "account {} has no {} export for {:?}",
            exporter.account, import.kind, import.subject
        ))
    })?;

    let mut activation_expires = None;
    if export.token_req {
        let raw = activation.ok_or_else(|| TrustError::unauthorized("activation token required"))?;
        let act = check_activation(importer, import, exporter, export, raw, now)?;
        activation_expires = act.exp.filter(|e| *e > 0);
    }

    Ok(ResolvedImport {
        key: ImportKey {
            account: import.account.clone(),
            subject: import.subject.clone(),
            kind: import.kind,
        },
        subject: import.subject.clone(),
        to: import.to.clone(),
        response_type: export.response_type.unwrap_or_default(),
        activation_expires,
    })
}

fn check_activation(
    importer: &PublicKey,
    import: &Import,
    exporter: &ExportSnapshot,
    export: &Export,
    raw: &str,
    now: DateTime<Utc>,
) -> TrustResult<ActivationClaims> {
    let act: ActivationClaims = jwt::decode(raw)?;
    verify_activation(&act, &exporter.account, &exporter.signing_keys, now)?;
    if act.sub != *importer {
        return Err(TrustError::unauthorized("activation names another account"));
    }
    if act.data.import_type != import.kind || !subject::is_subset(&import.subject, &act.data.import_subject) {
        return Err(TrustError::unauthorized("activation does not cover import"));
    }
    if export.revocations.is_revoked(act.sub.as_str(), act.iat) {
        return Err(TrustError::Revoked);
    }
    Ok(act)
}
