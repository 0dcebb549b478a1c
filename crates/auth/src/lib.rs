//! `keyward-auth`: signed credentials and the checks applied to them.
//!
//! This crate is pure: no IO, no async. It knows how to encode, decode and
//! validate claims, but not where they come from.

pub mod claims;
pub mod jwt;
pub mod permissions;
pub mod time_window;
pub mod validation;
pub mod version;

pub use claims::{
    AccountClaims, AccountData, AccountLimits, ActivationClaims, ActivationData, Claim, ClaimKind,
    ClaimPayload, Claims, Export, ExportKind, Import, JetStreamLimits, NO_LIMIT, OperatorClaims,
    OperatorData, ResponseType, Revocations, UserClaims, UserData, UserLimits,
};
pub use jwt::{decode, decode_any};
pub use permissions::{Permissions, ResponsePermission, SubjectPermission};
pub use time_window::{TimeRange, TimeWindows};
pub use validation::{IssuerContext, TrustConfig, Validator, verify_activation, verify_user};
pub use version::{Offer, VersionState};
