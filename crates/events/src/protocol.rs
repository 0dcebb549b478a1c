//! JSON bodies exchanged between nodes.

use serde::{Deserialize, Serialize};

/// Per-node answer to a claim update request.
///
/// Serialized as `{"data":{...}}` on success and `{"error":{...}}` otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateResponse {
    Data(UpdateData),
    Error(UpdateError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateData {
    pub account: String,
    pub code: u16,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateError {
    pub account: String,
    pub code: u16,
    pub description: String,
}

impl UpdateResponse {
    pub fn ok(account: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Data(UpdateData {
            account: account.into(),
            code: 200,
            message: message.into(),
        })
    }

    pub fn error(account: impl Into<String>, code: u16, description: impl Into<String>) -> Self {
        Self::Error(UpdateError {
            account: account.into(),
            code,
            description: description.into(),
        })
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Data(_))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(s: &str) -> Option<Self> {
        serde_json::from_str(s).ok()
    }
}

/// Identity and issued-at of every claim a full node holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimsDigest {
    pub entries: Vec<DigestEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestEntry {
    pub account: String,
    pub iat: i64,
}
