//! `keyward-events`: system-account messaging between nodes.
//!
//! Claim updates, lookups and digests travel as [`SystemMessage`]s over an
//! [`EventBus`]. The bus is transport-agnostic; the in-memory implementation
//! connects the nodes of a single process.

pub mod bus;
pub mod envelope;
pub mod in_memory_bus;
pub mod protocol;
pub mod subjects;

pub use bus::{BusError, EventBus, Subscription};
pub use envelope::SystemMessage;
pub use in_memory_bus::InMemoryEventBus;
pub use protocol::{ClaimsDigest, DigestEntry, UpdateResponse};
pub use subjects::SystemSubject;
