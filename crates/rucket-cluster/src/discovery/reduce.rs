// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Reduction of one discovery round into the best copy of each document.
//!
//! The fast path keeps, per kind, the highest version whose UUID agrees with
//! the first UUID seen. A UUID disagreement marks the kind slow; the slow
//! path then re-derives it from the retained per-peer copies, trusting only
//! targets to settle the UUID.

use rucket_core::meta::{ClusterMap, ClusterMetaSnapshot, GlobalConfig};
use rucket_core::{NodeDescriptor, Versioned};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{BootstrapError, Result};
use crate::transport::TransportError;

/// Fast-path state of one document kind.
#[derive(Debug, Clone)]
struct KindState<T> {
    best: Option<T>,
    origin: Option<Uuid>,
    slow: bool,
}

impl<T> Default for KindState<T> {
    fn default() -> Self {
        Self { best: None, origin: None, slow: false }
    }
}

impl<T: Versioned> KindState<T> {
    fn fold(&mut self, doc: Option<&T>) {
        let Some(doc) = doc.filter(|d| d.version() > 0) else {
            return;
        };
        if let (Some(origin), Some(uuid)) = (self.origin, doc.uuid()) {
            if origin != uuid {
                self.slow = true;
            }
        }
        if self.origin.is_none() {
            self.origin = doc.uuid();
        }
        if self.slow {
            return;
        }
        if self.best.as_ref().map_or(true, |best| best.version() < doc.version()) {
            self.best = Some(doc.clone());
        }
    }
}

/// One peer's answer, kept for the slow path.
#[derive(Debug, Clone)]
pub struct PeerReply {
    /// The responder.
    pub node: NodeDescriptor,
    /// What it holds.
    pub snapshot: ClusterMetaSnapshot,
}

/// Which kinds need slow-path resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlowKinds {
    /// Cluster map UUIDs disagree.
    pub cluster_map: bool,
    /// Bucket metadata UUIDs disagree.
    pub bucket_md: bool,
    /// Global config UUIDs disagree.
    pub config: bool,
}

impl SlowKinds {
    /// Whether any kind is slow.
    #[must_use]
    pub fn any(&self) -> bool {
        self.cluster_map || self.bucket_md || self.config
    }
}

/// Result of reducing one round.
#[derive(Debug, Clone, Default)]
pub struct RoundOutcome {
    /// Best copy of each document.
    pub snapshot: ClusterMetaSnapshot,
    /// True when every peer answered and no election was in progress.
    pub done: bool,
    /// Kinds that need slow-path resolution.
    pub slow: SlowKinds,
    /// Per-peer copies, retained when a kind went slow.
    pub retained: Vec<PeerReply>,
}

/// Folds peer answers of one round.
#[derive(Debug)]
pub struct MetaReducer {
    cluster_map: KindState<ClusterMap>,
    bucket_md: KindState<rucket_core::BucketMetadata>,
    rebalance_md: Option<rucket_core::RebalanceMetadata>,
    config: KindState<GlobalConfig>,
    retained: Vec<PeerReply>,
    done: bool,
    vote_in_progress: bool,
}

impl Default for MetaReducer {
    fn default() -> Self {
        Self::new()
    }
}

impl MetaReducer {
    /// Creates a reducer for a new round.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cluster_map: KindState::default(),
            bucket_md: KindState::default(),
            rebalance_md: None,
            config: KindState::default(),
            retained: Vec::new(),
            done: true,
            vote_in_progress: false,
        }
    }

    /// Folds one peer's answer.
    pub fn fold(
        &mut self,
        node: &NodeDescriptor,
        result: std::result::Result<ClusterMetaSnapshot, TransportError>,
    ) {
        if self.vote_in_progress {
            return;
        }
        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(e) => {
                debug!(node = %node, error = %e, "No metadata from peer");
                self.done = false;
                return;
            }
        };
        if snapshot.vote_in_progress {
            warn!(node = %node, "Peer reports a primary election in progress, discarding round");
            self.cluster_map = KindState::default();
            self.bucket_md = KindState::default();
            self.rebalance_md = None;
            self.config = KindState::default();
            self.retained.clear();
            self.done = false;
            self.vote_in_progress = true;
            return;
        }

        self.bucket_md.fold(snapshot.bucket_md.as_ref());
        if let Some(rmd) = snapshot.rebalance_md.as_ref().filter(|r| r.version > 0) {
            if self.rebalance_md.as_ref().map_or(true, |best| best.version < rmd.version) {
                self.rebalance_md = Some(rmd.clone());
            }
        }
        self.config.fold(snapshot.config.as_ref());
        self.cluster_map.fold(snapshot.cluster_map.as_ref());

        if snapshot.cluster_map.is_some() || snapshot.bucket_md.is_some() || snapshot.config.is_some()
        {
            self.retained.push(PeerReply { node: node.clone(), snapshot });
        }
    }

    /// Finishes the round.
    #[must_use]
    pub fn finish(self) -> RoundOutcome {
        let slow = SlowKinds {
            cluster_map: self.cluster_map.slow,
            bucket_md: self.bucket_md.slow,
            config: self.config.slow,
        };
        RoundOutcome {
            snapshot: ClusterMetaSnapshot {
                cluster_map: self.cluster_map.best,
                bucket_md: self.bucket_md.best,
                rebalance_md: self.rebalance_md,
                config: self.config.best,
                vote_in_progress: self.vote_in_progress,
            },
            done: self.done,
            slow,
            retained: if slow.any() { self.retained } else { Vec::new() },
        }
    }
}

impl RoundOutcome {
    /// Re-derives every slow kind from the retained copies.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::SplitBrain`] when two targets disagree on
    /// the UUID of a cluster map or bucket metadata.
    pub fn resolve_slow(&mut self) -> Result<()> {
        if self.slow.bucket_md {
            self.snapshot.bucket_md = resolve_kind(&self.retained, |s| s.bucket_md.as_ref())?;
        }
        if self.slow.cluster_map {
            self.snapshot.cluster_map = resolve_kind(&self.retained, |s| s.cluster_map.as_ref())?;
        }
        if self.slow.config {
            self.snapshot.config = self.resolve_config();
        }
        Ok(())
    }

    fn resolve_config(&self) -> Option<GlobalConfig> {
        let Some(uuid) = self.snapshot.cluster_map.as_ref().and_then(|m| m.uuid) else {
            warn!("Global config UUIDs disagree and no cluster UUID is known, keeping fast-path copy");
            return self.snapshot.config.clone();
        };
        let best = self
            .retained
            .iter()
            .filter_map(|r| r.snapshot.config.as_ref())
            .filter(|c| c.uuid == Some(uuid))
            .max_by_key(|c| c.version)
            .cloned();
        if best.is_none() {
            warn!(%uuid, "No global config matches the cluster UUID");
        }
        best
    }
}

/// Settles the UUID of one kind among the targets, then picks the highest
/// version carrying it. Without any target UUID every copy is a candidate.
fn resolve_kind<T, F>(retained: &[PeerReply], pick: F) -> Result<Option<T>>
where
    T: Versioned,
    F: Fn(&ClusterMetaSnapshot) -> Option<&T>,
{
    let mut agreed: Option<(Uuid, &NodeDescriptor)> = None;
    for reply in retained.iter().filter(|r| r.node.is_target()) {
        let Some(uuid) = pick(&reply.snapshot).and_then(Versioned::uuid) else {
            continue;
        };
        match agreed {
            None => agreed = Some((uuid, &reply.node)),
            Some((first, first_node)) if first != uuid => {
                return Err(BootstrapError::SplitBrain {
                    kind: T::KIND,
                    detail: format!(
                        "{first_node} has UUID {first} while {} has UUID {uuid}",
                        reply.node
                    ),
                });
            }
            Some(_) => {}
        }
    }

    let uuid = agreed.map(|(uuid, _)| uuid);
    if uuid.is_none() {
        warn!(kind = %T::KIND, "No target carries a UUID, resolving among all copies");
    }
    Ok(retained
        .iter()
        .filter_map(|r| pick(&r.snapshot))
        .filter(|doc| uuid.is_none() || doc.uuid() == uuid)
        .max_by_key(|doc| doc.version())
        .cloned())
}
