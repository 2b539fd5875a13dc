//! In-process services for exercising OxLustre clients.
//!
//! [`TestCluster`] assembles a metadata server over a [`MemoryStore`], a set
//! of [`StorageTarget`]s and the metadata and data lock namespaces, all
//! reachable through one [`SimNetwork`]. Faults are injected per endpoint
//! and opcode with [`FaultRule`].

pub mod backing;
pub mod cluster;
pub mod error;
pub mod mds;
pub mod network;
pub mod ost;

pub use backing::{BackingStore, MemoryStore, Transaction, TxnOp};
pub use cluster::{METADATA_ENDPOINT, ROOT_FID, SimConfig, TestCluster};
pub use error::{SimError, SimResult};
pub use mds::MetadataServer;
pub use network::{Fault, FaultRule, RuleId, SimNetwork, SimService};
pub use ost::{PunchRecord, StorageTarget};
