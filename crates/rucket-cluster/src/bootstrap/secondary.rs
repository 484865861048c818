//! Joining a cluster as a secondary.

use metrics::counter;
use rucket_core::meta::ClusterMap;
use rucket_core::{NodeDescriptor, Versioned};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::BootstrapOutcome;
use crate::error::{BootstrapError, Result};
use crate::node::ClusterNode;
use crate::transport::{JoinAccepted, JoinError, RegistrationRequest};

/// Result of a successful join.
#[derive(Debug, Clone)]
pub(super) struct Joined {
    primary: NodeDescriptor,
    map_version: i64,
}

/// Publishes and persists `loaded` (without self as primary) and joins the
/// cluster.
///
/// Tries `urls`, then the loaded map's primary, then the configured primary
/// URL; this node's own URLs are never tried. If all fail and a loaded map
/// exists, discovers the current primary once and retries against it.
///
/// # Errors
///
/// Returns [`BootstrapError::Persist`] if the loaded map cannot be written
/// and [`BootstrapError::JoinFailed`] when no attempt succeeds.
pub(super) async fn join(
    node: &ClusterNode,
    loaded: Option<ClusterMap>,
    mut urls: Vec<String>,
) -> Result<Joined> {
    let si = node.si();
    if let Some(mut map) = loaded.clone() {
        if map.is_primary(si.id()) {
            map.primary = None;
        }
        if let Some(primary) = map.primary.as_ref() {
            push_urls(&mut urls, primary.urls());
        }
        let guard = node.owners().cluster_map.lock().await;
        if guard.get().version <= map.version {
            guard.put_persist(map).await?;
        }
    }
    if let Some(url) = node.settings().primary_url.clone() {
        push_urls(&mut urls, vec![url]);
    }
    let own = si.urls();
    urls.retain(|url| !own.contains(url));
    node.context().mark_node_started();

    let first = join_with_retry(node, &urls).await;
    let accepted = match first {
        Ok(accepted) => accepted,
        Err(e) => {
            let Some(loaded) = loaded else {
                return Err(BootstrapError::JoinFailed(format!("{si} via {urls:?}: {e}")));
            };
            warn!(node = %si, error = %e, "Join failed, discovering the current primary");
            let found = node.discoverer().discover(&loaded).await?;
            let primary = found
                .cluster_map
                .and_then(|m| m.primary)
                .filter(|p| p.id() != si.id())
                .ok_or_else(|| {
                    BootstrapError::JoinFailed(format!("{si} via {urls:?}: {e}; no primary discovered"))
                })?;
            join_with_retry(node, &primary.urls())
                .await
                .map_err(|e| BootstrapError::JoinFailed(format!("{si} via {primary}: {e}")))?
        }
    };

    let map_version = node.owners().cluster_map.get().version;
    counter!("rucket_bootstrap_joins_total").increment(1);
    info!(node = %si, primary = %accepted.primary, version = map_version, "Joined cluster as secondary");
    Ok(Joined { primary: accepted.primary, map_version })
}

/// Polls the primary until it reports the cluster started.
///
/// There is no deadline: a slow primary only earns a warning once the
/// startup window has long passed.
///
/// # Errors
///
/// Returns [`BootstrapError::Shutdown`] when stopped, and
/// [`BootstrapError::JoinFailed`] if a re-join with a new primary fails.
pub(super) async fn wait_cluster_started(
    node: &ClusterNode,
    joined: Joined,
) -> Result<BootstrapOutcome> {
    let settings = node.settings();
    let overdue = Instant::now() + settings.startup * 2 + settings.call_timeout;
    let mut warned = false;
    let discoverer = node.discoverer();

    loop {
        node.context().sleep(settings.cplane_operation).await?;

        let map = node.owners().cluster_map.get();
        let primary = map
            .primary
            .clone()
            .filter(|p| map.version > joined.map_version && p.id() != node.id())
            .unwrap_or_else(|| joined.primary.clone());

        let info = discoverer.cluster_info(std::slice::from_ref(&primary)).await.into_iter().next();
        if let Some(info) = info.filter(|i| i.cluster_started) {
            let authoritative = info.primary.unwrap_or(primary);
            if authoritative.id() != joined.primary.id() {
                info!(joined = %joined.primary, primary = %authoritative, "Primary changed during startup, re-joining");
                join_once(node, &authoritative.urls()).await.map_err(|e| {
                    BootstrapError::JoinFailed(format!("re-join {authoritative}: {e}"))
                })?;
            }
            node.context().mark_cluster_started();
            counter!("rucket_bootstrap_completed_total", "role" => "secondary").increment(1);
            return Ok(BootstrapOutcome::Secondary { primary: Some(authoritative.id().to_string()) });
        }

        if !warned && Instant::now() >= overdue {
            warned = true;
            warn!(node = %node.si(), primary = %primary, "Cluster is taking a long time to start, still waiting");
        }
        debug!(primary = %primary, "Waiting for the cluster to start");
    }
}

/// Joins, retrying while the primary is not ready yet, for at most one
/// quiescence interval.
async fn join_with_retry(
    node: &ClusterNode,
    urls: &[String],
) -> std::result::Result<JoinAccepted, JoinError> {
    let deadline = Instant::now() + node.settings().quiescence_interval();
    loop {
        match join_once(node, urls).await {
            Err(e) if e.is_retryable() && Instant::now() < deadline => {
                debug!(error = %e, "Primary not ready, retrying join");
                if node.context().sleep(node.settings().cplane_operation).await.is_err() {
                    return Err(e);
                }
            }
            result => return result,
        }
    }
}

async fn join_once(
    node: &ClusterNode,
    urls: &[String],
) -> std::result::Result<JoinAccepted, JoinError> {
    if urls.is_empty() {
        return Err(JoinError::new(JoinError::UNREACHABLE, "no primary URL known"));
    }
    let owners = node.owners();
    let map = owners.cluster_map.get();
    let bmd = owners.bucket_md.get();
    let request = RegistrationRequest {
        node: node.si().clone(),
        cluster_map: (map.version > 0).then(|| (*map).clone()),
        bucket_md: (bmd.version() > 0).then(|| (*bmd).clone()),
    };
    node.transport().joiner.join_cluster(request, urls).await
}

fn push_urls(urls: &mut Vec<String>, candidates: Vec<String>) {
    for url in candidates {
        if !urls.contains(&url) {
            urls.push(url);
        }
    }
}
