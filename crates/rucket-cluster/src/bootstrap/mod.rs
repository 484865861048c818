// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Gateway bootstrap: role determination, cluster formation by the primary,
//! and joining by secondaries.
//!
//! # Flow
//!
//! 1. A target, or a proxy that is not the primary, joins the cluster and
//!    waits in the background until the primary reports the cluster started.
//! 2. The primary publishes a seeded cluster map, accepts registrations,
//!    reconciles them with its persisted state and with whatever its peers
//!    hold, then persists and distributes the agreed metadata.
//! 3. At any point the primary may discover a newer map naming another
//!    primary; it then demotes itself and continues as a secondary.

mod config;
mod primary;
mod resume;
mod secondary;

use std::sync::Arc;

use metrics::counter;
use rucket_core::meta::ClusterMap;
use rucket_core::NodeDescriptor;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub use config::{probe_interval, BootstrapSettings};
pub use resume::{resume_rebalance, ResumeOutcome, MIN_REBALANCE_TARGETS};

use crate::error::{BootstrapError, Result};
use crate::node::ClusterNode;
use crate::role::determine_role;

/// Peers that must agree on a newer primary before a node gives up the role.
pub const MIN_PRIMARY_CONFIRMATIONS: usize = 3;

/// How a completed bootstrap ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// This node formed the cluster as its primary.
    Primary,
    /// This node joined the cluster led by `primary`.
    Secondary {
        /// The primary's ID, if known.
        primary: Option<String>,
    },
    /// Shutdown was requested before the cluster started.
    Cancelled,
}

/// Role a node starts the bootstrap with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartRole {
    /// Forming primary.
    Primary,
    /// Joining secondary.
    Secondary,
}

/// Background part of a running bootstrap.
#[derive(Debug)]
pub struct BootstrapHandle {
    role: StartRole,
    task: JoinHandle<Result<BootstrapOutcome>>,
}

impl BootstrapHandle {
    /// The role the node started with.
    #[must_use]
    pub fn role(&self) -> StartRole {
        self.role
    }

    /// Waits for the bootstrap to finish.
    ///
    /// # Errors
    ///
    /// Returns the bootstrap error; see [`BootstrapError::is_fatal`].
    pub async fn wait(self) -> Result<BootstrapOutcome> {
        self.task.await.map_err(|e| BootstrapError::Task(e.to_string()))?
    }
}

/// Starts the bootstrap of `node`.
///
/// Role determination and, for secondaries, the join run before this
/// returns; everything else continues on a background task.
///
/// # Errors
///
/// Returns any error of the synchronous part. All of them except
/// [`BootstrapError::Shutdown`] are fatal.
pub async fn start(node: Arc<ClusterNode>) -> Result<BootstrapHandle> {
    counter!("rucket_bootstrap_started_total", "role" => node.si().role().as_str()).increment(1);
    node.load_local().await;
    let loaded = load_cluster_map(&node).await;

    if node.si().is_target() {
        return start_secondary(node, loaded, Vec::new()).await;
    }

    let settings = node.settings();
    let decision = determine_role(
        node.si(),
        loaded,
        settings.primary_id.as_deref(),
        settings.is_primary,
    )?;
    info!(
        node = %node.si(),
        primary = decision.primary_id.as_deref().unwrap_or("-"),
        is_primary = decision.is_primary,
        "Determined initial role"
    );

    if !decision.is_primary {
        let urls = secondary_urls(&node, decision.loaded.as_ref(), decision.primary_id.as_deref());
        return start_secondary(node, decision.loaded, urls).await;
    }

    if !decision.forced {
        if let Some(loaded) = decision.loaded.as_ref() {
            if let Some(urls) = confirm_primary(&node, loaded).await {
                return start_secondary(node, decision.loaded, urls).await;
            }
        }
    }

    primary::init(&node, decision.loaded.as_ref()).await?;
    let loaded = decision.loaded;
    let task = tokio::spawn({
        let node = node.clone();
        async move { finish(&node, primary::run(&node, loaded).await) }
    });
    Ok(BootstrapHandle { role: StartRole::Primary, task })
}

async fn start_secondary(
    node: Arc<ClusterNode>,
    loaded: Option<ClusterMap>,
    urls: Vec<String>,
) -> Result<BootstrapHandle> {
    let joined = secondary::join(&node, loaded, urls).await?;
    let task = tokio::spawn({
        let node = node.clone();
        async move { finish(&node, secondary::wait_cluster_started(&node, joined).await) }
    });
    Ok(BootstrapHandle { role: StartRole::Secondary, task })
}

fn finish(node: &ClusterNode, result: Result<BootstrapOutcome>) -> Result<BootstrapOutcome> {
    match &result {
        Ok(outcome) => info!(node = %node.si(), ?outcome, "Bootstrap finished"),
        Err(BootstrapError::Shutdown) => {
            info!(node = %node.si(), "Bootstrap cancelled by shutdown");
            return Ok(BootstrapOutcome::Cancelled);
        }
        Err(e) => {
            counter!("rucket_bootstrap_failures_total").increment(1);
            error!(node = %node.si(), error = %e, fatal = e.is_fatal(), "Bootstrap failed");
        }
    }
    result
}

/// Reads the persisted cluster map; only a valid, versioned copy is trusted.
async fn load_cluster_map(node: &ClusterNode) -> Option<ClusterMap> {
    match node.owners().cluster_map.load().await {
        Ok(Some(map)) if map.version > 0 => match map.validate() {
            Ok(()) => {
                info!(%map, "Loaded local cluster map");
                Some(map)
            }
            Err(e) => {
                warn!(%map, error = %e, "Ignoring invalid local cluster map");
                None
            }
        },
        Ok(_) => None,
        Err(e) => {
            warn!(error = %e, "Failed to load local cluster map");
            None
        }
    }
}

/// URLs a secondary tries, in order: the override primary as known to the
/// loaded map, then the configured primary URL.
fn secondary_urls(
    node: &ClusterNode,
    loaded: Option<&ClusterMap>,
    primary_id: Option<&str>,
) -> Vec<String> {
    let mut urls = Vec::new();
    if let (Some(map), Some(pid)) = (loaded, primary_id) {
        if let Some(primary) = map.get_proxy(pid) {
            urls.extend(primary.urls());
        }
    }
    if let Some(url) = node.settings().primary_url.as_ref() {
        if !urls.contains(url) {
            urls.push(url.clone());
        }
    }
    urls
}

/// Checks that peers do not already follow a newer primary.
///
/// A newer map naming another primary hands the role over. A newer map
/// naming this node is trusted only with [`MIN_PRIMARY_CONFIRMATIONS`]
/// agreeing peers. Returns the URLs to join when the role is given up.
async fn confirm_primary(node: &ClusterNode, loaded: &ClusterMap) -> Option<Vec<String>> {
    let peers = loaded.peers_of(node.id());
    if peers.is_empty() {
        return None;
    }
    let infos = node.discoverer().cluster_info(&peers).await;
    let newest = infos.iter().filter(|i| i.primary.is_some()).max_by_key(|i| i.map_version)?;
    if newest.map_version <= loaded.version {
        return None;
    }
    let primary = newest.primary.clone()?;
    let confirmations = infos
        .iter()
        .filter(|i| {
            i.map_version == newest.map_version
                && i.primary.as_ref().map(NodeDescriptor::id) == Some(primary.id())
        })
        .count();

    if primary.id() != node.id() {
        warn!(
            %loaded,
            primary = %primary,
            version = newest.map_version,
            confirmations,
            "Peers follow a newer primary, starting as secondary"
        );
        return Some(primary.urls());
    }
    if confirmations >= MIN_PRIMARY_CONFIRMATIONS {
        warn!(
            %loaded,
            version = newest.map_version,
            confirmations,
            "Proceeding as primary behind a newer cluster map"
        );
        return None;
    }
    warn!(
        %loaded,
        version = newest.map_version,
        confirmations,
        required = MIN_PRIMARY_CONFIRMATIONS,
        "Cannot assume the primary role, starting as secondary"
    );
    Some(Vec::new())
}
