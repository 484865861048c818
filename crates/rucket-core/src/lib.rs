//! Core types and utilities for Rucket gateways.
//!
//! This crate provides the fundamental building blocks used by the cluster
//! bootstrap:
//! - Configuration management
//! - Error types
//! - Node descriptors
//! - The four versioned cluster metadata documents

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod meta;
pub mod types;

pub use config::{
    BootstrapConfig, Config, LogFormat, LoggingConfig, MembershipConfig, NodeConfig,
    RebalanceConfig, TimeoutConfig,
};
pub use error::{Error, Result};
pub use meta::{
    BucketMetadata, ClusterMap, ClusterMetaSnapshot, GlobalConfig, MetaKind, RebalanceMetadata,
    Versioned,
};
pub use types::{NodeDescriptor, NodeRole};
