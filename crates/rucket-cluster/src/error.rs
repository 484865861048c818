// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Error types for cluster bootstrap.

use rucket_core::meta::{ClusterMapError, MetaKind};
use thiserror::Error;
use uuid::Uuid;

use crate::transport::TransportError;

/// Result type for bootstrap operations.
pub type Result<T> = std::result::Result<T, BootstrapError>;

/// Errors that can occur during cluster bootstrap.
///
/// Most variants are cluster-integrity violations after which the node must
/// not keep running; see [`BootstrapError::is_fatal`].
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Two authoritative copies of a document disagree on the cluster UUID.
    #[error("split-brain in {kind}: {detail}")]
    SplitBrain {
        /// The document kind.
        kind: MetaKind,
        /// Which nodes disagree and how.
        detail: String,
    },

    /// Local and discovered cluster maps belong to different clusters.
    #[error("cluster UUID mismatch: local {local} vs discovered {discovered}")]
    UuidMismatch {
        /// UUID held locally.
        local: Uuid,
        /// UUID found on the network.
        discovered: Uuid,
    },

    /// A new cluster cannot be created without targets.
    #[error("cannot create a new cluster with no targets: {0}")]
    NoTargets(String),

    /// Not enough active targets to proceed.
    #[error("not enough active targets: required {required}, have {active}")]
    NotEnoughTargets {
        /// Minimum required.
        required: usize,
        /// Currently active.
        active: usize,
    },

    /// The global config carries no valid cluster UUID.
    #[error("invalid global config UUID: {0}")]
    InvalidConfigUuid(String),

    /// `is_primary` and `primary_id` overrides name different nodes.
    #[error("conflicting overrides: is_primary=true but primary_id={primary_id} (self {self_id})")]
    ConflictingOverrides {
        /// The override primary ID.
        primary_id: String,
        /// This node's ID.
        self_id: String,
    },

    /// The node could not join the cluster.
    #[error("failed to join cluster: {0}")]
    JoinFailed(String),

    /// A metadata document could not be persisted.
    #[error("failed to persist {kind}: {source}")]
    Persist {
        /// The document kind.
        kind: MetaKind,
        /// The underlying storage error.
        #[source]
        source: rucket_core::Error,
    },

    /// This node's endpoint is registered under another ID.
    #[error("duplicate node: {0}")]
    DuplicateNode(String),

    /// Cluster maps could not be merged.
    #[error("cluster map merge failed: {0}")]
    MergeConflict(#[from] ClusterMapError),

    /// Distribution of agreed metadata was not acknowledged.
    #[error("distribution failed: {0}")]
    Distribution(String),

    /// Configuration or override input is unusable.
    #[error("configuration error: {0}")]
    Config(String),

    /// The bootstrap task panicked or was aborted.
    #[error("bootstrap task failed: {0}")]
    Task(String),

    /// A peer call failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The node is shutting down.
    #[error("shutting down")]
    Shutdown,
}

impl BootstrapError {
    /// Whether the node must terminate rather than continue.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Shutdown | Self::Transport(_))
    }

    pub(crate) fn persist(kind: MetaKind, source: rucket_core::Error) -> Self {
        Self::Persist { kind, source }
    }
}
