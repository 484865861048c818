//! Cluster bootstrap and primary coordination for Rucket gateways.
//!
//! This crate provides:
//! - Versioned metadata owners with lock-free reads and exclusive writes
//! - Initial role determination from persisted state and overrides
//! - Cluster-wide metadata discovery with split-brain detection
//! - The forming primary's state machine and the secondary join path
//! - Resumption of an interrupted rebalance once membership settles
//!
//! # Architecture
//!
//! Every gateway is a [`ClusterNode`]. On startup:
//! 1. A proxy decides whether it is the primary ([`determine_role`])
//! 2. Secondaries (and all targets) join the primary and wait for it
//! 3. The primary accepts registrations until membership is quiescent
//! 4. It reconciles registrations and peer metadata into one cluster map
//! 5. It persists and distributes the agreed metadata, then the cluster is started
//!
//! Peers are reached through the [`Broadcaster`], [`Joiner`] and
//! [`Distributor`] traits; [`LocalNetwork`] implements them in-process.
//!
//! # Example
//!
//! ```ignore
//! use rucket_cluster::{bootstrap, BootstrapSettings, ClusterNode, LocalNetwork, MemoryMetaStore};
//! use std::sync::Arc;
//!
//! let network = LocalNetwork::new();
//! let settings = BootstrapSettings { is_primary: true, ..Default::default() };
//! let node = ClusterNode::new(si, settings, Arc::new(MemoryMetaStore::new()), network.transport("p1"));
//! network.register(&node);
//!
//! let handle = bootstrap::start(node.clone()).await?;
//! handle.wait().await?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod bootstrap;
pub mod context;
pub mod discovery;
pub mod error;
pub mod node;
pub mod owner;
pub mod regpool;
pub mod role;
pub mod store;
pub mod transport;

pub use bootstrap::{BootstrapHandle, BootstrapOutcome, BootstrapSettings, StartRole};
pub use context::{Lifecycle, NodeContext};
pub use discovery::{ClusterDiscoverer, MetaReducer};
pub use error::{BootstrapError, Result};
pub use node::ClusterNode;
pub use owner::{MetaOwners, MetadataOwner, OwnerGuard};
pub use regpool::RegistrationPool;
pub use role::{determine_role, RoleDecision};
pub use store::{FileMetaStore, MemoryMetaStore, MetaStore, MetaStoreExt};
pub use transport::{
    ActionMsg, Broadcaster, ClusterInfo, Distributor, Joiner, LocalNetwork, Query, QueryResponse,
    RegistrationRequest, Revision, SyncHandle, Transport, TransportError,
};
