//! The forming primary's state machine.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use rucket_core::meta::{
    new_cluster_uuid, BackendConf, BucketMetadata, ClusterMap, DuplicatePolicy, GlobalConfig,
};
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{resume, secondary, BootstrapOutcome};
use crate::error::{BootstrapError, Result};
use crate::node::ClusterNode;
use crate::transport::{ActionMsg, Revision};

/// States of the primary path.
#[derive(Debug)]
enum Step {
    AcceptRegistrations,
    MergeLocal,
    DiscoverMeta,
    FinalizePrimary,
    Persist,
    Distribute,
    ResumeRebalance,
    Started,
    DemoteToSecondary(ClusterMap),
}

impl Step {
    fn name(&self) -> &'static str {
        match self {
            Self::AcceptRegistrations => "accept_registrations",
            Self::MergeLocal => "merge_local",
            Self::DiscoverMeta => "discover_meta",
            Self::FinalizePrimary => "finalize_primary",
            Self::Persist => "persist",
            Self::Distribute => "distribute",
            Self::ResumeRebalance => "resume_rebalance",
            Self::Started => "started",
            Self::DemoteToSecondary(_) => "demote_to_secondary",
        }
    }
}

/// State carried across steps.
struct PrimaryRun<'a> {
    node: &'a ClusterNode,
    loaded: Option<ClusterMap>,
    identity: Option<(Uuid, DateTime<Utc>)>,
    agreed: Option<Agreed>,
}

/// Documents agreed upon before distribution.
struct Agreed {
    cluster_map: Arc<ClusterMap>,
    bucket_md: Arc<BucketMetadata>,
    config: Arc<GlobalConfig>,
}

/// Publishes the seeded map and starts accepting control-plane requests.
///
/// The seeded map has self as primary and only member, and carries the
/// loaded identity if there is one.
pub(super) async fn init(node: &ClusterNode, loaded: Option<&ClusterMap>) -> Result<()> {
    let mut seeded = ClusterMap::with_primary(node.si().clone());
    if let Some(loaded) = loaded {
        seeded.uuid = loaded.uuid;
        seeded.created_at = loaded.created_at;
    }
    let guard = node.owners().cluster_map.lock().await;
    let seeded = guard.put(seeded);
    drop(guard);

    node.context().mark_node_started();
    info!(node = %node.si(), map = %seeded, "Primary initialized, accepting registrations");
    Ok(())
}

/// Runs the primary path from the registration window onward.
pub(super) async fn run(node: &ClusterNode, loaded: Option<ClusterMap>) -> Result<BootstrapOutcome> {
    let mut run = PrimaryRun { node, loaded, identity: None, agreed: None };
    let mut step = if node.settings().skip_startup {
        Step::MergeLocal
    } else {
        Step::AcceptRegistrations
    };

    loop {
        debug!(node = %node.si(), step = step.name(), "Primary bootstrap step");
        step = match step {
            Step::AcceptRegistrations => match run.accept_registrations().await? {
                Some(newer) => run.adopt_newer(newer).await?,
                None => Step::MergeLocal,
            },
            Step::MergeLocal => {
                run.merge_local().await?;
                Step::DiscoverMeta
            }
            Step::DiscoverMeta => match run.discover_meta().await? {
                Some(newer) => Step::DemoteToSecondary(newer),
                None => Step::FinalizePrimary,
            },
            Step::FinalizePrimary => match run.finalize().await? {
                Some(current) => Step::DemoteToSecondary(current),
                None => Step::Persist,
            },
            Step::Persist => {
                run.persist().await?;
                Step::Distribute
            }
            Step::Distribute => {
                run.distribute().await?;
                Step::ResumeRebalance
            }
            Step::ResumeRebalance => {
                if node.settings().rebalance_enabled {
                    let outcome = resume::resume_rebalance(node).await?;
                    debug!(?outcome, "Rebalance resume finished");
                }
                node.context().end_rebalance_startup();
                Step::Started
            }
            Step::Started => {
                counter!("rucket_bootstrap_completed_total", "role" => "primary").increment(1);
                return Ok(BootstrapOutcome::Primary);
            }
            Step::DemoteToSecondary(map) => {
                counter!("rucket_bootstrap_demotions_total").increment(1);
                let primary = map.primary.clone();
                warn!(node = %node.si(), map = %map, "Demoting to secondary");
                let urls = primary.map(|p| p.urls()).unwrap_or_default();
                let joined = secondary::join(node, Some(map), urls).await?;
                return secondary::wait_cluster_started(node, joined).await;
            }
        };
    }
}

impl PrimaryRun<'_> {
    /// Keeps the registration window open until membership settles.
    ///
    /// Returns a newer map naming another primary if one shows up.
    async fn accept_registrations(&mut self) -> Result<Option<ClusterMap>> {
        let node = self.node;
        let settings = node.settings();
        let interval = settings.quiescence_interval();
        let sleep = (interval / 5).max(Duration::from_millis(1));
        let quiescent = settings.quiescence_divisor;
        let expected = settings.expected_targets;

        let mut check_cluster = self.loaded.as_ref().is_some_and(|m| m.count_targets() > 0);
        let mut map = node.owners().cluster_map.get();
        let mut waited = Duration::ZERO;
        let mut still = 0;

        while waited < settings.startup && still < quiescent {
            node.context().sleep(sleep).await?;
            waited += sleep;

            // Quiescence is only counted once the cluster check is done.
            if check_cluster {
                if waited < interval {
                    continue;
                }
                check_cluster = false;
                if let Some(loaded) = self.loaded.as_ref() {
                    if let Some(newer) = node.discoverer().max_ver_best_effort(loaded).await {
                        return Ok(Some(newer));
                    }
                }
            }

            let before = map.count_targets();
            map = node.owners().cluster_map.get();
            if !map.is_primary(node.id()) {
                break;
            }
            let targets = map.count_targets();
            gauge!("rucket_bootstrap_registered_targets").set(targets as f64);
            if targets > before || (expected > 0 && targets < expected) {
                still = 0;
            } else {
                still += 1;
            }
        }

        info!(
            map = %map,
            targets = map.count_targets(),
            proxies = map.count_proxies(),
            pooled = node.regpool().len(),
            waited = ?waited,
            "Registration window closed"
        );
        Ok(None)
    }

    /// First change of mind: join the primary named by a newer map.
    async fn adopt_newer(&self, mut newer: ClusterMap) -> Result<Step> {
        let si = self.node.si();
        if let Some(dup) = newer.find_duplicate(si) {
            return Err(BootstrapError::DuplicateNode(format!(
                "{si} duplicates {dup} in {newer}"
            )));
        }
        newer.add_node(si.clone());
        let guard = self.node.owners().cluster_map.lock().await;
        guard.put(newer.clone());
        Ok(Step::DemoteToSecondary(newer))
    }

    /// Folds registrations into the loaded map and settles the cluster
    /// identity.
    async fn merge_local(&mut self) -> Result<()> {
        let node = self.node;
        let owners = node.owners();
        let current = owners.cluster_map.get();
        let have_joins = current.count_targets() > 0 || current.count_proxies() > 1;

        if !have_joins {
            if let Some(loaded) = self.loaded.clone() {
                let guard = owners.cluster_map.lock().await;
                let map = guard.put(self.as_primary(loaded));
                info!(map = %map, "No registrations, keeping loaded cluster map");
            }
            return Ok(());
        }

        let guard = owners.cluster_map.lock().await;
        let registered = (*guard.get()).clone();
        let mut merged = match self.loaded.clone() {
            Some(loaded) => {
                let version = loaded.version.max(registered.version) + 1;
                let mut merged = self.as_primary(loaded);
                let added = merged.merge_from(&registered, DuplicatePolicy::KeepExisting)?;
                merged.version = version;
                debug!(added, "Merged registrations into loaded cluster map");
                merged
            }
            None => registered,
        };

        let bmd = owners.bucket_md.get();
        let resolution = node.regpool().resolve(&merged, &bmd)?;
        let (uuid, created_at) = match resolution.identity {
            Some(identity) => identity,
            None => {
                info!("No cluster identity found, creating a new cluster");
                new_cluster_uuid()
            }
        };
        merged.set_identity(uuid, created_at);
        merged.version = merged.version.max(resolution.max_version + 1);
        self.identity = Some((uuid, created_at));
        let merged = guard.put(merged);
        drop(guard);

        let bmd = match resolution.bucket_md {
            Some(newer) => owners.bucket_md.lock().await.put_persist(newer).await?,
            None => bmd,
        };

        info!(map = %merged, pooled = node.regpool().len(), "Merged registrations");
        let msg = ActionMsg::new(ActionMsg::EARLY_START_HAVE_REGISTRATIONS);
        let mut revisions = vec![(Revision::ClusterMap(merged), msg.clone())];
        if bmd.version > 0 {
            revisions.push((Revision::BucketMetadata(bmd), msg));
        }
        node.transport()
            .distributor
            .sync(revisions)
            .wait()
            .await
            .map_err(|e| BootstrapError::Distribution(e.to_string()))
    }

    /// Reconciles local metadata with the best copies held by peers.
    ///
    /// Returns a newer map naming another primary if one is found.
    async fn discover_meta(&mut self) -> Result<Option<ClusterMap>> {
        let node = self.node;
        let owners = node.owners();
        let local = owners.cluster_map.get();
        let found = node.discoverer().discover(&local).await?;

        if let Some(bmd) = found.bucket_md {
            let guard = owners.bucket_md.lock().await;
            let ours = guard.get();
            if ours.version < bmd.version {
                info!(local = %ours, discovered = %bmd, "Adopting discovered bucket metadata");
                guard.put_persist(bmd).await?;
            }
        }
        if let Some(rmd) = found.rebalance_md {
            let guard = owners.rebalance_md.lock().await;
            if guard.get().version < rmd.version {
                info!(discovered = %rmd, "Adopting discovered rebalance metadata");
                guard.put(rmd);
            }
        }
        if let Some(config) = found.config {
            let guard = owners.config.lock().await;
            let ours = guard.get();
            if ours.version < config.version {
                let Some(uuid) = config.uuid else {
                    return Err(BootstrapError::InvalidConfigUuid(config.to_string()));
                };
                if ours.uuid.is_some_and(|u| u != uuid) {
                    warn!(local = %ours, discovered = %config, "Global config UUID differs, adopting newer copy");
                } else {
                    info!(local = %ours, discovered = %config, "Adopting discovered global config");
                }
                guard.put_persist(config).await?;
            }
        }

        let Some(mut found) = found.cluster_map.filter(|m| m.version > 0) else {
            info!(map = %local, "No cluster maps discovered");
            return Ok(None);
        };
        let cmp = local.compare(&found);
        if let (false, Some(ours), Some(theirs)) = (cmp.same_uuid, local.uuid, found.uuid) {
            return Err(BootstrapError::UuidMismatch { local: ours, discovered: theirs });
        }
        if cmp.same_members && cmp.same_version {
            debug!(map = %local, "Discovered cluster map matches local");
            return Ok(None);
        }

        let si = node.si();
        if let Some(other) = found.primary.clone().filter(|p| p.id() != si.id()) {
            if found.version > local.version {
                match found.find_duplicate(si).cloned() {
                    Some(dup) if found.is_primary(dup.id()) => {
                        warn!(stale = %dup, map = %found, "Discovered map names this node's endpoint as primary under another ID");
                        found.remove_node(dup.id());
                        found.add_node(si.clone());
                        found.primary = Some(si.clone());
                    }
                    Some(dup) => {
                        return Err(BootstrapError::DuplicateNode(format!(
                            "{si} duplicates {dup} in {found}"
                        )));
                    }
                    None => {
                        info!(local = %local, found = %found, primary = %other, "Discovered a newer cluster map with another primary");
                        found.add_node(si.clone());
                        let guard = owners.cluster_map.lock().await;
                        guard.put(found.clone());
                        return Ok(Some(found));
                    }
                }
            } else {
                warn!(local = %local, found = %found, primary = %other, "Merging older cluster map that names another primary");
            }
        }

        let guard = owners.cluster_map.lock().await;
        let mut merged = (*guard.get()).clone();
        if !cmp.same_members {
            let added = merged.merge_from(&found, DuplicatePolicy::Reject)?;
            debug!(added, "Merged discovered cluster map");
        }
        if merged.uuid.is_none() {
            if let (Some(uuid), Some(created_at)) = (found.uuid, found.created_at) {
                merged.set_identity(uuid, created_at);
            }
        }
        merged.version = merged.version.max(found.version) + 1;
        let merged = guard.put(merged);
        info!(local = %local, found = %found, merged = %merged, "Reconciled cluster map with peers");
        Ok(None)
    }

    /// Settles identity and IC membership and persists the map.
    ///
    /// Returns the current map if this node is no longer its primary.
    async fn finalize(&mut self) -> Result<Option<ClusterMap>> {
        let node = self.node;
        let settings = node.settings();
        let guard = node.owners().cluster_map.lock().await;
        let current = guard.get();
        if !current.is_primary(node.id()) {
            info!(map = %current, "No longer the primary");
            return Ok(Some((*current).clone()));
        }

        let mut map = (*current).clone();
        let mut changed = false;
        if map.uuid.is_none() {
            if !settings.skip_startup && map.count_targets() == 0 {
                return Err(BootstrapError::NoTargets(map.to_string()));
            }
            let (uuid, created_at) = self.identity.unwrap_or_else(new_cluster_uuid);
            map.set_identity(uuid, created_at);
            changed = true;
        }
        let ic = map.ic_count();
        if ic < settings.ic_min_size && map.staff_ic(settings.ic_min_size) != ic {
            changed = true;
        }
        if changed {
            map.version += 1;
        }
        let map = guard.put_persist(map).await?;
        drop(guard);

        self.agreed = Some(Agreed {
            cluster_map: map,
            bucket_md: node.owners().bucket_md.get(),
            config: node.owners().config.get(),
        });
        Ok(None)
    }

    /// Persists the remaining documents of a new or restarted cluster.
    async fn persist(&mut self) -> Result<()> {
        let node = self.node;
        let owners = node.owners();
        let Some(agreed) = self.agreed.as_mut() else {
            return Err(BootstrapError::Task("persist before finalize".to_string()));
        };
        let uuid = agreed.cluster_map.uuid;

        let guard = owners.bucket_md.lock().await;
        if guard.get().version == 0 {
            let bmd = guard.put_persist(BucketMetadata::initial(uuid)).await?;
            info!(bmd = %bmd, "Initialized bucket metadata");
        }
        agreed.bucket_md = guard.get();
        drop(guard);

        node.context().begin_rebalance_startup();
        agreed.config = resolve_global_config(node, uuid).await?;
        Ok(())
    }

    /// Distributes the agreed documents and marks the cluster started.
    async fn distribute(&mut self) -> Result<()> {
        let node = self.node;
        let Some(agreed) = self.agreed.take() else {
            return Err(BootstrapError::Task("distribute before finalize".to_string()));
        };
        let msg = ActionMsg::new(ActionMsg::PRIMARY_STARTED_UP);
        let revisions = vec![
            (Revision::ClusterMap(agreed.cluster_map.clone()), msg.clone()),
            (Revision::BucketMetadata(agreed.bucket_md), msg.clone()),
            (Revision::GlobalConfig(agreed.config), msg),
        ];
        node.transport()
            .distributor
            .sync(revisions)
            .wait()
            .await
            .map_err(|e| BootstrapError::Distribution(e.to_string()))?;

        node.context().mark_cluster_started();
        node.regpool().clear();
        info!(node = %node.si(), map = %agreed.cluster_map, "Primary and cluster startup complete");
        Ok(())
    }

    /// `loaded` with self as primary.
    fn as_primary(&self, mut loaded: ClusterMap) -> ClusterMap {
        let si = self.node.si().clone();
        loaded.add_node(si.clone());
        loaded.primary = Some(si);
        loaded
    }
}

/// Contents of a backend override file.
#[derive(Debug, Deserialize)]
struct BackendOverride {
    backends: BTreeMap<String, BackendConf>,
}

/// Creates the global config of a new cluster, or applies the backend
/// override to an existing one.
async fn resolve_global_config(node: &ClusterNode, uuid: Option<Uuid>) -> Result<Arc<GlobalConfig>> {
    let owner = &node.owners().config;
    let existing = owner.get();

    if existing.version == 0 {
        let primary_url = node.si().public_url().to_string();
        let config = owner
            .modify(|config| {
                config.uuid = uuid;
                config.primary_url = primary_url;
                Ok(())
            })
            .await?;
        info!(config = %config, "Initialized global config");
        return Ok(config);
    }

    let Some(path) = node.settings().backend_override.as_ref() else {
        return Ok(existing);
    };
    let Some(config_uuid) = existing.uuid else {
        return Err(BootstrapError::InvalidConfigUuid(existing.to_string()));
    };
    if uuid.is_some_and(|u| u != config_uuid) {
        warn!(config = %existing, cluster = ?uuid, "Global config belongs to another cluster UUID");
    }

    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| BootstrapError::Config(format!("{}: {e}", path.display())))?;
    let backends = serde_json::from_str::<BackendOverride>(&contents)
        .map_err(|e| BootstrapError::Config(format!("{}: {e}", path.display())))?
        .backends;
    if existing.same_backends(&backends) {
        return Ok(existing);
    }

    let config = owner
        .modify(|config| {
            config.backends = backends;
            Ok(())
        })
        .await?;
    info!(config = %config, path = %path.display(), "Applied backend override");
    Ok(config)
}
