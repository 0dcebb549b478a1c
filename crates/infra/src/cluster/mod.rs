//! Node-to-node claim propagation over the system bus.

pub mod link;
pub mod worker;

pub use link::{ClusterLink, SystemBus};
pub use worker::PropagationWorker;
