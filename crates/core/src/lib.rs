//! `keyward-core`: trust primitives shared by every layer.
//!
//! This crate contains **pure** building blocks (no IO, no async): key
//! identities, the error taxonomy and subject matching.

pub mod error;
pub mod keys;
pub mod subject;

pub use error::{LimitKind, TrustError, TrustResult};
pub use keys::{KeyKind, KeyPair, PublicKey};
