// Copyright 2024 The Rucket Authors
// SPDX-License-Identifier: Apache-2.0

//! Versioned cluster metadata documents.
//!
//! Every gateway holds one copy of each document kind:
//! - [`ClusterMap`]: membership (proxies, targets, primary)
//! - [`BucketMetadata`]: bucket properties
//! - [`RebalanceMetadata`]: rebalance epoch
//! - [`GlobalConfig`]: cluster-wide configuration
//!
//! Versions start at 0 (unset) and only grow. Documents that carry a cluster
//! UUID must agree on it once the cluster identity is fixed.

mod bucket;
mod cluster_map;
mod global_config;
mod rebalance;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use bucket::{BucketMetadata, BucketProps};
pub use cluster_map::{ClusterMap, ClusterMapError, DuplicatePolicy, MapComparison};
pub use global_config::{BackendConf, GlobalConfig, GlobalTimeouts};
pub use rebalance::{RebalanceMetadata, REBALANCE_EPOCH_STRIDE};

/// The four kinds of versioned metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetaKind {
    /// Cluster membership map.
    ClusterMap,
    /// Bucket metadata.
    BucketMetadata,
    /// Rebalance metadata.
    RebalanceMetadata,
    /// Cluster-wide configuration.
    GlobalConfig,
}

impl MetaKind {
    /// Returns a short human-readable name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ClusterMap => "cluster map",
            Self::BucketMetadata => "bucket metadata",
            Self::RebalanceMetadata => "rebalance metadata",
            Self::GlobalConfig => "global config",
        }
    }
}

impl std::fmt::Display for MetaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A monotonically versioned metadata document.
pub trait Versioned:
    Clone + Default + std::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// The document kind.
    const KIND: MetaKind;

    /// Current version (0 = unset).
    fn version(&self) -> i64;

    /// Overwrites the version.
    fn set_version(&mut self, version: i64);

    /// The cluster UUID this document belongs to, if it carries one.
    fn uuid(&self) -> Option<Uuid> {
        None
    }

    /// Whether this document has never been initialized.
    fn is_unset(&self) -> bool {
        self.version() == 0
    }
}

/// Mints a fresh cluster identity.
#[must_use]
pub fn new_cluster_uuid() -> (Uuid, DateTime<Utc>) {
    (Uuid::new_v4(), Utc::now())
}

/// Aggregate of the four documents as held by one node.
///
/// This is what a peer returns to a discovery query. It is never persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterMetaSnapshot {
    /// Cluster map, if initialized.
    pub cluster_map: Option<ClusterMap>,
    /// Bucket metadata, if initialized.
    pub bucket_md: Option<BucketMetadata>,
    /// Rebalance metadata, if initialized.
    pub rebalance_md: Option<RebalanceMetadata>,
    /// Global config, if initialized.
    pub config: Option<GlobalConfig>,
    /// Whether the responder is currently taking part in a primary election.
    pub vote_in_progress: bool,
}

impl ClusterMetaSnapshot {
    /// Builds a snapshot from locally held documents, dropping unset ones.
    #[must_use]
    pub fn from_docs(
        cluster_map: ClusterMap,
        bucket_md: BucketMetadata,
        rebalance_md: RebalanceMetadata,
        config: GlobalConfig,
        vote_in_progress: bool,
    ) -> Self {
        Self {
            cluster_map: non_empty(cluster_map),
            bucket_md: non_empty(bucket_md),
            rebalance_md: non_empty(rebalance_md),
            config: non_empty(config),
            vote_in_progress,
        }
    }

    /// Drops every document (used when a round is discarded).
    pub fn clear(&mut self) {
        self.cluster_map = None;
        self.bucket_md = None;
        self.rebalance_md = None;
        self.config = None;
    }

    /// Whether no document is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cluster_map.is_none()
            && self.bucket_md.is_none()
            && self.rebalance_md.is_none()
            && self.config.is_none()
    }
}

/// Keeps only initialized documents.
pub(crate) fn non_empty<T: Versioned>(doc: T) -> Option<T> {
    if doc.is_unset() {
        None
    } else {
        Some(doc)
    }
}
