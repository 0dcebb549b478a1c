//! Runtime layer: resolvers, cluster propagation, account tasks and timers,
//! configuration, and the node facade tying them together.

pub mod account_task;
pub mod activation;
pub mod cluster;
pub mod config;
pub mod jetstream;
pub mod registry;
pub mod resolver;
pub mod scheduler;
pub mod server;
pub mod workers;

pub use account_task::AccountHandle;
pub use cluster::{ClusterLink, PropagationWorker, SystemBus};
pub use config::{ConfigError, DirectoryConfig, DirectoryMode, JetStreamConfig, Options, ResolverConfig};
pub use jetstream::{InMemoryJetStream, JetStreamLimitsStore, JetStreamManager};
pub use registry::{AccountRegistry, ClaimOrigin};
pub use resolver::{AccountResolver, DirectoryResolver, MemoryResolver, UrlResolver};
pub use server::{ClientConnection, ConnectRequest, Server};
pub use workers::WorkerHandle;
