// Copyright 2024 The Rucket Authors
// SPDX-License-Identifier: Apache-2.0

//! Cluster membership map.
//!
//! The cluster map lists every proxy and target, names the primary, and
//! carries the cluster identity (UUID and creation time). Only the primary
//! mutates and distributes it.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::{MetaKind, Versioned};
use crate::types::{NodeDescriptor, NodeRole};

/// Errors that can occur when validating or merging cluster maps.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClusterMapError {
    /// The map has no primary.
    #[error("cluster map v{0} has no primary")]
    NoPrimary(i64),

    /// The primary is not listed among the proxies.
    #[error("primary {0} is not listed among the proxies")]
    PrimaryNotListed(String),

    /// Two distinct node IDs share the same control endpoint.
    #[error("duplicate endpoint {url}: {existing} vs {incoming}")]
    DuplicateEndpoint {
        /// ID already present in the map.
        existing: String,
        /// ID that collides with it.
        incoming: String,
        /// The shared control URL.
        url: String,
    },
}

/// How `merge_from` treats an incoming node whose endpoint is already taken
/// by a different ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Keep the entry already present and skip the incoming one.
    KeepExisting,
    /// Fail the merge.
    Reject,
}

/// Result of comparing two cluster maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapComparison {
    /// The UUID both maps agree on (if any carries one).
    pub uuid: Option<Uuid>,
    /// False only when both maps carry a UUID and they differ.
    pub same_uuid: bool,
    /// Both maps have the same version.
    pub same_version: bool,
    /// Both maps list exactly the same proxies and targets.
    pub same_members: bool,
}

/// The cluster membership map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterMap {
    /// Monotonic version; 0 means unset.
    pub version: i64,
    /// Cluster identity, immutable once assigned.
    pub uuid: Option<Uuid>,
    /// When the cluster identity was created.
    pub created_at: Option<DateTime<Utc>>,
    /// The current primary proxy.
    pub primary: Option<NodeDescriptor>,
    /// Proxies, keyed by node ID.
    pub proxies: BTreeMap<String, NodeDescriptor>,
    /// Targets, keyed by node ID.
    pub targets: BTreeMap<String, NodeDescriptor>,
    /// Members of the information channel (management subset of proxies).
    #[serde(default)]
    pub ic: BTreeSet<String>,
    /// Nodes currently in maintenance.
    #[serde(default)]
    pub maintenance: BTreeSet<String>,
}

impl ClusterMap {
    /// Creates an empty, unversioned map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a map whose only member is `primary`.
    #[must_use]
    pub fn with_primary(primary: NodeDescriptor) -> Self {
        let mut map = Self::new();
        map.proxies.insert(primary.id().to_string(), primary.clone());
        map.primary = Some(primary);
        map
    }

    /// Returns the primary's ID.
    #[must_use]
    pub fn primary_id(&self) -> Option<&str> {
        self.primary.as_ref().map(NodeDescriptor::id)
    }

    /// Whether `id` is the primary.
    #[must_use]
    pub fn is_primary(&self, id: &str) -> bool {
        self.primary_id() == Some(id)
    }

    /// Looks up a proxy.
    #[must_use]
    pub fn get_proxy(&self, id: &str) -> Option<&NodeDescriptor> {
        self.proxies.get(id)
    }

    /// Looks up a target.
    #[must_use]
    pub fn get_target(&self, id: &str) -> Option<&NodeDescriptor> {
        self.targets.get(id)
    }

    /// Looks up any member.
    #[must_use]
    pub fn get_node(&self, id: &str) -> Option<&NodeDescriptor> {
        self.get_proxy(id).or_else(|| self.get_target(id))
    }

    /// Whether `id` is a member.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.get_node(id).is_some()
    }

    /// Inserts or replaces a member.
    pub fn add_node(&mut self, node: NodeDescriptor) {
        let id = node.id().to_string();
        match node.role() {
            NodeRole::Proxy => {
                if self.is_primary(&id) {
                    self.primary = Some(node.clone());
                }
                self.proxies.insert(id, node);
            }
            NodeRole::Target => {
                self.targets.insert(id, node);
            }
        }
    }

    /// Removes a member. Returns whether it was present.
    pub fn remove_node(&mut self, id: &str) -> bool {
        let removed = self.proxies.remove(id).is_some() || self.targets.remove(id).is_some();
        self.ic.remove(id);
        self.maintenance.remove(id);
        removed
    }

    /// Number of proxies.
    #[must_use]
    pub fn count_proxies(&self) -> usize {
        self.proxies.len()
    }

    /// Number of targets.
    #[must_use]
    pub fn count_targets(&self) -> usize {
        self.targets.len()
    }

    /// Number of targets not in maintenance.
    #[must_use]
    pub fn count_active_targets(&self) -> usize {
        self.targets.keys().filter(|id| !self.maintenance.contains(*id)).count()
    }

    /// Total number of members.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count_proxies() + self.count_targets()
    }

    /// Iterates over all members, proxies first.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.proxies.values().chain(self.targets.values())
    }

    /// All members except `self_id`.
    #[must_use]
    pub fn peers_of(&self, self_id: &str) -> Vec<NodeDescriptor> {
        self.nodes().filter(|n| n.id() != self_id).cloned().collect()
    }

    /// Finds a member with a different ID listening on the same endpoint as `node`.
    #[must_use]
    pub fn find_duplicate(&self, node: &NodeDescriptor) -> Option<&NodeDescriptor> {
        self.nodes().find(|n| n.id() != node.id() && n.same_endpoint(node))
    }

    /// Adds every member of `other` that is not already present.
    ///
    /// Returns the number of members added. Identity (UUID, version, primary)
    /// is left to the caller.
    pub fn merge_from(
        &mut self,
        other: &ClusterMap,
        policy: DuplicatePolicy,
    ) -> Result<usize, ClusterMapError> {
        let mut added = 0;
        for node in other.nodes() {
            if self.contains(node.id()) {
                continue;
            }
            if let Some(dup) = self.find_duplicate(node) {
                match policy {
                    DuplicatePolicy::KeepExisting => continue,
                    DuplicatePolicy::Reject => {
                        return Err(ClusterMapError::DuplicateEndpoint {
                            existing: dup.id().to_string(),
                            incoming: node.id().to_string(),
                            url: node.control_url().to_string(),
                        });
                    }
                }
            }
            self.add_node(node.clone());
            if other.maintenance.contains(node.id()) {
                self.maintenance.insert(node.id().to_string());
            }
            added += 1;
        }
        Ok(added)
    }

    /// Compares identity, version and membership with `other`.
    #[must_use]
    pub fn compare(&self, other: &ClusterMap) -> MapComparison {
        let (same_uuid, uuid) = match (self.uuid, other.uuid) {
            (Some(a), Some(b)) => (a == b, Some(a)),
            (a, b) => (true, a.or(b)),
        };
        let same_members = self.proxies.len() == other.proxies.len()
            && self.targets.len() == other.targets.len()
            && self.proxies.keys().all(|id| other.proxies.contains_key(id))
            && self.targets.keys().all(|id| other.targets.contains_key(id));
        MapComparison { uuid, same_uuid, same_version: self.version == other.version, same_members }
    }

    /// Assigns the cluster identity.
    pub fn set_identity(&mut self, uuid: Uuid, created_at: DateTime<Utc>) {
        self.uuid = Some(uuid);
        self.created_at = Some(created_at);
    }

    /// Number of information-channel members.
    #[must_use]
    pub fn ic_count(&self) -> usize {
        self.ic.len()
    }

    /// Adds proxies to the information channel until it has `min_size`
    /// members or no eligible proxy is left. The primary goes first.
    ///
    /// Returns the resulting size.
    pub fn staff_ic(&mut self, min_size: usize) -> usize {
        if let Some(primary) = self.primary_id().map(str::to_string) {
            if self.ic.len() < min_size && !self.maintenance.contains(&primary) {
                self.ic.insert(primary);
            }
        }
        let candidates: Vec<String> = self
            .proxies
            .keys()
            .filter(|id| !self.ic.contains(*id) && !self.maintenance.contains(*id))
            .cloned()
            .collect();
        for id in candidates {
            if self.ic.len() >= min_size {
                break;
            }
            self.ic.insert(id);
        }
        self.ic.len()
    }

    /// Checks that the map names a primary that is listed among the proxies.
    pub fn validate(&self) -> Result<(), ClusterMapError> {
        let primary = self.primary.as_ref().ok_or(ClusterMapError::NoPrimary(self.version))?;
        match self.proxies.get(primary.id()) {
            Some(listed) if listed == primary => Ok(()),
            _ => Err(ClusterMapError::PrimaryNotListed(primary.id().to_string())),
        }
    }
}

impl Versioned for ClusterMap {
    const KIND: MetaKind = MetaKind::ClusterMap;

    fn version(&self) -> i64 {
        self.version
    }

    fn set_version(&mut self, version: i64) {
        self.version = version;
    }

    fn uuid(&self) -> Option<Uuid> {
        self.uuid
    }
}

impl std::fmt::Display for ClusterMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let uuid = self.uuid.map(|u| u.to_string()).unwrap_or_else(|| "-".to_string());
        write!(
            f,
            "cluster-map v{}[{}, primary={}, p={}, t={}]",
            self.version,
            uuid,
            self.primary_id().unwrap_or("none"),
            self.count_proxies(),
            self.count_targets()
        )
    }
}
