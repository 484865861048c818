// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Cluster-wide metadata discovery.
//!
//! A forming primary queries every known peer for its metadata and keeps the
//! best copy of each document kind. Rounds repeat until every peer answered
//! and no election is in progress, or until the startup deadline.

mod reduce;

use std::sync::Arc;

use metrics::counter;
use rucket_core::meta::{ClusterMap, ClusterMetaSnapshot};
use rucket_core::NodeDescriptor;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use reduce::{MetaReducer, PeerReply, RoundOutcome, SlowKinds};

use crate::bootstrap::BootstrapSettings;
use crate::context::NodeContext;
use crate::error::Result;
use crate::transport::{Broadcaster, ClusterInfo, Query};

/// Queries peers for their metadata.
pub struct ClusterDiscoverer {
    self_id: String,
    broadcaster: Arc<dyn Broadcaster>,
    ctx: Arc<NodeContext>,
    settings: BootstrapSettings,
}

impl std::fmt::Debug for ClusterDiscoverer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterDiscoverer").field("self_id", &self.self_id).finish_non_exhaustive()
    }
}

impl ClusterDiscoverer {
    /// Creates a discoverer for node `self_id`.
    pub fn new(
        self_id: impl Into<String>,
        broadcaster: Arc<dyn Broadcaster>,
        ctx: Arc<NodeContext>,
        settings: BootstrapSettings,
    ) -> Self {
        Self { self_id: self_id.into(), broadcaster, ctx, settings }
    }

    /// Runs one round against every member of `map` except self.
    pub async fn round(&self, map: &ClusterMap) -> RoundOutcome {
        let peers = map.peers_of(&self.self_id);
        counter!("rucket_discovery_rounds_total").increment(1);
        let results =
            self.broadcaster.broadcast(Query::ClusterMeta, &peers, self.settings.call_timeout).await;

        let mut reducer = MetaReducer::new();
        for call in results {
            let result = call.result.and_then(|r| r.into_cluster_meta());
            if result.is_err() {
                counter!("rucket_discovery_peer_errors_total").increment(1);
            }
            reducer.fold(&call.node, result);
        }
        reducer.finish()
    }

    /// Discovers the best copy of each document.
    ///
    /// Retries every `cplane_operation` until a round completes or the
    /// startup deadline passes; the last round's result is used either way.
    ///
    /// # Errors
    ///
    /// Returns a split-brain error from the slow path, or
    /// [`crate::BootstrapError::Shutdown`].
    pub async fn discover(&self, map: &ClusterMap) -> Result<ClusterMetaSnapshot> {
        let deadline = Instant::now() + self.settings.startup;
        let mut outcome = loop {
            self.ctx.check_stopping()?;
            let outcome = self.round(map).await;
            if outcome.done {
                break outcome;
            }
            if Instant::now() >= deadline {
                warn!(%map, "Metadata discovery deadline reached, using partial results");
                break outcome;
            }
            debug!(vote = outcome.snapshot.vote_in_progress, "Metadata discovery incomplete, retrying");
            self.ctx.sleep(self.settings.cplane_operation).await?;
        };

        if outcome.slow.any() {
            counter!("rucket_discovery_slow_path_total").increment(1);
            info!(slow = ?outcome.slow, peers = outcome.retained.len(), "Resolving metadata UUIDs");
            outcome.resolve_slow()?;
        }
        Ok(outcome.snapshot)
    }

    /// One best-effort round: returns a strictly newer, valid map with the
    /// same UUID as `loaded` that names a different primary.
    pub async fn max_ver_best_effort(&self, loaded: &ClusterMap) -> Option<ClusterMap> {
        let outcome = self.round(loaded).await;
        if outcome.slow.cluster_map {
            debug!("Cluster map UUIDs disagree, skipping best-effort check");
            return None;
        }
        let found = outcome.snapshot.cluster_map?;
        if found.version <= loaded.version || found.uuid != loaded.uuid {
            return None;
        }
        if let Err(e) = found.validate() {
            warn!(%found, error = %e, "Ignoring invalid newer cluster map");
            return None;
        }
        if found.is_primary(&self.self_id) {
            return None;
        }
        info!(%loaded, %found, "Found a newer cluster map with a different primary");
        Some(found)
    }

    /// Asks `peers` for their view of the cluster; failures are skipped.
    pub async fn cluster_info(&self, peers: &[NodeDescriptor]) -> Vec<ClusterInfo> {
        self.broadcaster
            .broadcast(Query::ClusterInfo, peers, self.settings.call_timeout)
            .await
            .into_iter()
            .filter_map(|call| match call.result.and_then(|r| r.into_cluster_info()) {
                Ok(info) => Some(info),
                Err(e) => {
                    debug!(node = %call.node, error = %e, "No cluster info from peer");
                    None
                }
            })
            .collect()
    }
}
