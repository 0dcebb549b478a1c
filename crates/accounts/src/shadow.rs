//! Shadow subscription arena.
//!
//! A shadow links one client subscription to one authorized stream import.
//! Entries are addressed by opaque [`ShadowId`]s and indexed both by import
//! and by client, so either side can tear down everything derived from it in
//! one pass without walking a pointer graph.

use std::collections::{BTreeMap, BTreeSet};

use keyward_auth::ExportKind;
use keyward_core::PublicKey;

use crate::client::ClientId;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShadowId(u64);

impl core::fmt::Display for ShadowId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "shadow:{}", self.0)
    }
}

/// Identity of an import within its account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImportKey {
    pub account: PublicKey,
    pub subject: String,
    pub kind: ExportKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shadow {
    pub client: ClientId,
    pub sid: u64,
    pub import: ImportKey,
    /// Client subscription subject (local side).
    pub subject: String,
}

#[derive(Debug, Default)]
pub struct ShadowTable {
    next: u64,
    entries: BTreeMap<ShadowId, Shadow>,
    by_import: BTreeMap<ImportKey, BTreeSet<ShadowId>>,
    by_client: BTreeMap<ClientId, BTreeSet<ShadowId>>,
}

impl ShadowTable {
    pub fn insert(&mut self, shadow: Shadow) -> ShadowId {
        self.next += 1;
        let id = ShadowId(self.next);
        self.by_import.entry(shadow.import.clone()).or_default().insert(id);
        self.by_client.entry(shadow.client).or_default().insert(id);
        self.entries.insert(id, shadow);
        id
    }

    pub fn get(&self, id: ShadowId) -> Option<&Shadow> {
        self.entries.get(&id)
    }

    pub fn remove(&mut self, id: ShadowId) -> Option<Shadow> {
        let shadow = self.entries.remove(&id)?;
        if let Some(set) = self.by_import.get_mut(&shadow.import) {
            set.remove(&id);
            if set.is_empty() {
                self.by_import.remove(&shadow.import);
            }
        }
        if let Some(set) = self.by_client.get_mut(&shadow.client) {
            set.remove(&id);
            if set.is_empty() {
                self.by_client.remove(&shadow.client);
            }
        }
        Some(shadow)
    }

    fn remove_all(&mut self, ids: BTreeSet<ShadowId>) -> Vec<(ShadowId, Shadow)> {
        ids.into_iter()
            .filter_map(|id| self.remove(id).map(|s| (id, s)))
            .collect()
    }

    /// Drop every shadow derived from `import`.
    pub fn remove_import(&mut self, import: &ImportKey) -> Vec<(ShadowId, Shadow)> {
        let ids = self.by_import.get(import).cloned().unwrap_or_default();
        self.remove_all(ids)
    }

    /// Drop every shadow belonging to `client`.
    pub fn remove_client(&mut self, client: ClientId) -> Vec<(ShadowId, Shadow)> {
        let ids = self.by_client.get(&client).cloned().unwrap_or_default();
        self.remove_all(ids)
    }

    pub fn for_import<'a>(&'a self, import: &ImportKey) -> impl Iterator<Item = &'a Shadow> + 'a {
        self.by_import
            .get(import)
            .into_iter()
            .flatten()
            .filter_map(|id| self.entries.get(id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
