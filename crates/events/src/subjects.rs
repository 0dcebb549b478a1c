//! Propagation subject space.
//!
//! | subject | payload | reply |
//! |---|---|---|
//! | `$SYS.REQ.ACCOUNT.<id>.CLAIMS.UPDATE` | raw account claim | [`crate::UpdateResponse`] per node |
//! | `$SYS.REQ.ACCOUNT.<id>.CLAIMS.LOOKUP` | target node, or empty for any | raw claim, or empty when confirmed unknown |
//! | `$SYS.REQ.CLAIMS.DIGEST` | [`crate::ClaimsDigest`] | none |
//! | `_INBOX.<node>.<token>` | reply | none |

use uuid::Uuid;

pub const ACCOUNT_PREFIX: &str = "$SYS.REQ.ACCOUNT.";
pub const UPDATE_SUFFIX: &str = ".CLAIMS.UPDATE";
pub const LOOKUP_SUFFIX: &str = ".CLAIMS.LOOKUP";
pub const CLAIMS_DIGEST: &str = "$SYS.REQ.CLAIMS.DIGEST";
pub const INBOX_PREFIX: &str = "_INBOX.";

pub fn account_update(account: &str) -> String {
    format!("{ACCOUNT_PREFIX}{account}{UPDATE_SUFFIX}")
}

pub fn account_lookup(account: &str) -> String {
    format!("{ACCOUNT_PREFIX}{account}{LOOKUP_SUFFIX}")
}

/// Fresh inbox owned by `node`.
pub fn new_inbox(node: &str) -> String {
    format!("{INBOX_PREFIX}{node}.{}", Uuid::now_v7().simple())
}

/// Parsed form of a system subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemSubject<'a> {
    Update(&'a str),
    Lookup(&'a str),
    Digest,
    Inbox(&'a str),
}

impl<'a> SystemSubject<'a> {
    pub fn parse(subject: &'a str) -> Option<Self> {
        if subject == CLAIMS_DIGEST {
            return Some(SystemSubject::Digest);
        }
        if subject.starts_with(INBOX_PREFIX) {
            return Some(SystemSubject::Inbox(subject));
        }
        let rest = subject.strip_prefix(ACCOUNT_PREFIX)?;
        if let Some(id) = rest.strip_suffix(UPDATE_SUFFIX) {
            return (!id.is_empty() && !id.contains('.')).then_some(SystemSubject::Update(id));
        }
        if let Some(id) = rest.strip_suffix(LOOKUP_SUFFIX) {
            return (!id.is_empty() && !id.contains('.')).then_some(SystemSubject::Lookup(id));
        }
        None
    }
}
