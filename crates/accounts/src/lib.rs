//! `keyward-accounts`: the Account entity and cross-account authorization.
//!
//! Everything here is synchronous and owned by whoever holds the account;
//! fetching claims and scheduling live in `keyward-infra`.

pub mod account;
pub mod client;
pub mod imports;
pub mod limits;
pub mod shadow;

pub use account::{Account, UpdateOutcome};
pub use client::{ClientEvent, ClientId, ClientSession, DisconnectReason, Message};
pub use imports::{ExportSnapshot, ResolvedImport, authorize_import};
pub use limits::{EffectiveLimits, ServerLimits};
pub use shadow::{ImportKey, ShadowId, ShadowTable};
