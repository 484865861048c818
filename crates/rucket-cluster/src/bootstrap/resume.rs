//! Resuming a rebalance that was interrupted before the restart.
//!
//! The primary waits until the cluster map has not changed for
//! `max_host_busy`, then bumps the rebalance epoch and distributes it. A map
//! change between the end of the wait and the lock restarts the wait.

use std::time::Duration;

use metrics::counter;
use tracing::{debug, info};

use crate::error::{BootstrapError, Result};
use crate::node::ClusterNode;
use crate::transport::{ActionMsg, Revision};

/// Minimum number of active targets for a rebalance.
pub const MIN_REBALANCE_TARGETS: usize = 2;

/// What [`resume_rebalance`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// Nothing was pending.
    NothingPending,
    /// Resumed under the given rebalance metadata version.
    Resumed(i64),
    /// This node stopped being the primary while waiting.
    LostPrimary,
}

#[derive(Debug)]
enum State {
    /// Waiting for the map to stay at `version` for `window`.
    Waiting { version: i64, window: Duration },
    /// The wait ended at `version`; re-check under the map lock.
    Locked { version: i64 },
}

/// Resumes a pending rebalance once membership settles.
///
/// # Errors
///
/// Returns [`BootstrapError::NotEnoughTargets`] if fewer than two targets are
/// active, a persist error, or [`BootstrapError::Shutdown`].
pub async fn resume_rebalance(node: &ClusterNode) -> Result<ResumeOutcome> {
    let ctx = node.context();
    if !ctx.rebalance_pending() {
        return Ok(ResumeOutcome::NothingPending);
    }
    let settings = node.settings();
    let probe = settings.probe_interval();
    let owners = node.owners();
    let mut state =
        State::Waiting { version: owners.cluster_map.get().version, window: settings.max_host_busy };

    loop {
        state = match state {
            State::Waiting { mut version, mut window } => {
                let mut still = Duration::ZERO;
                while still < window {
                    ctx.sleep(probe).await?;
                    still += probe;
                    let map = owners.cluster_map.get();
                    if !map.is_primary(node.id()) {
                        return Ok(ResumeOutcome::LostPrimary);
                    }
                    if map.version != version {
                        debug!(from = version, to = map.version, "Cluster map changed, extending wait");
                        still = Duration::ZERO;
                        window = (window + probe).min(settings.startup);
                        version = map.version;
                    }
                }
                State::Locked { version }
            }
            State::Locked { version } => {
                let guard = owners.cluster_map.lock().await;
                if !ctx.rebalance_pending() {
                    return Ok(ResumeOutcome::NothingPending);
                }
                let map = guard.get();
                if map.version != version {
                    debug!(from = version, to = map.version, "Cluster map changed before resume, waiting again");
                    State::Waiting { version: map.version, window: settings.max_host_busy }
                } else {
                    let active = map.count_active_targets();
                    if active < MIN_REBALANCE_TARGETS {
                        return Err(BootstrapError::NotEnoughTargets {
                            required: MIN_REBALANCE_TARGETS,
                            active,
                        });
                    }

                    let rmd_guard = owners.rebalance_md.lock().await;
                    let mut rmd = (*rmd_guard.get()).clone();
                    rmd.next_epoch();
                    let rmd = rmd_guard.put_persist(rmd).await?;
                    drop(rmd_guard);

                    let handle = node.transport().distributor.sync(vec![(
                        Revision::RebalanceMetadata(rmd.clone()),
                        ActionMsg::new(ActionMsg::RESUME_REBALANCE),
                    )]);
                    ctx.set_rebalance_pending(false);
                    ctx.end_rebalance_startup();
                    drop(guard);

                    handle.wait().await.map_err(|e| BootstrapError::Distribution(e.to_string()))?;
                    counter!("rucket_bootstrap_rebalance_resumed_total").increment(1);
                    info!(rmd = %rmd, map = %map, "Resuming global rebalance");
                    return Ok(ResumeOutcome::Resumed(rmd.version));
                }
            }
        };
    }
}
