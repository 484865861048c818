// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Integration tests for cluster bootstrap over the in-process network.

use std::sync::Arc;
use std::time::Duration;

use rucket_cluster::bootstrap::{self, resume_rebalance, ResumeOutcome};
use rucket_cluster::{
    BootstrapError, BootstrapOutcome, BootstrapSettings, ClusterNode, LocalNetwork,
    MemoryMetaStore, MetaStoreExt, StartRole,
};
use rucket_core::meta::{
    BackendConf, BucketMetadata, ClusterMap, GlobalConfig, RebalanceMetadata,
};
use rucket_core::NodeDescriptor;
use tokio::time::Instant;
use uuid::Uuid;

fn proxy(id: &str) -> NodeDescriptor {
    NodeDescriptor::proxy(id, format!("http://{id}:9080"), format!("http://{id}:8080"))
}

fn target(id: &str) -> NodeDescriptor {
    NodeDescriptor::target(id, format!("http://{id}:9080"), format!("http://{id}:8080"))
}

fn settings() -> BootstrapSettings {
    BootstrapSettings {
        primary_url: Some("http://p1:9080".to_string()),
        startup: Duration::from_secs(2),
        cplane_operation: Duration::from_millis(50),
        max_host_busy: Duration::from_millis(500),
        call_timeout: Duration::from_millis(200),
        quiescence_divisor: 4,
        ic_min_size: 3,
        ..Default::default()
    }
}

fn primary_settings() -> BootstrapSettings {
    BootstrapSettings { is_primary: true, ..settings() }
}

/// A simulated cluster of gateways sharing one [`LocalNetwork`].
struct Sim {
    network: Arc<LocalNetwork>,
}

impl Sim {
    fn new() -> Self {
        Self { network: LocalNetwork::new() }
    }

    fn node(
        &self,
        si: NodeDescriptor,
        settings: BootstrapSettings,
    ) -> (Arc<MemoryMetaStore>, Arc<ClusterNode>) {
        let store = Arc::new(MemoryMetaStore::new());
        let node = self.node_with(si, settings, store.clone());
        (store, node)
    }

    fn node_with(
        &self,
        si: NodeDescriptor,
        settings: BootstrapSettings,
        store: Arc<MemoryMetaStore>,
    ) -> Arc<ClusterNode> {
        let transport = self.network.transport(si.id());
        let node = ClusterNode::new(si, settings, store, transport);
        self.network.register(&node);
        node
    }
}

/// Publishes `map` on a node that is already running.
async fn run_with(node: &ClusterNode, map: &ClusterMap) {
    node.owners().cluster_map.lock().await.put(map.clone());
    node.context().mark_node_started();
    node.context().mark_cluster_started();
}

fn cluster_map(version: i64, uuid: Uuid, primary: &str, nodes: &[NodeDescriptor]) -> ClusterMap {
    let mut map = ClusterMap::with_primary(proxy(primary));
    for node in nodes {
        map.add_node(node.clone());
    }
    map.version = version;
    map.uuid = Some(uuid);
    map.created_at = Some(chrono::Utc::now());
    map
}

#[tokio::test(start_paused = true)]
async fn test_fresh_primary_without_targets_is_fatal() {
    let sim = Sim::new();
    let (store, p1) = sim.node(proxy("p1"), primary_settings());

    let handle = bootstrap::start(p1.clone()).await.unwrap();
    assert_eq!(handle.role(), StartRole::Primary);

    let err = handle.wait().await.unwrap_err();
    assert!(matches!(err, BootstrapError::NoTargets(_)));
    assert!(err.is_fatal());
    assert!(!p1.context().is_cluster_started());
    assert!(store.load::<ClusterMap>().unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_skip_startup_allows_empty_cluster() {
    let sim = Sim::new();
    let settings = BootstrapSettings { skip_startup: true, ..primary_settings() };
    let (store, p1) = sim.node(proxy("p1"), settings);

    let outcome = bootstrap::start(p1.clone()).await.unwrap().wait().await.unwrap();
    assert_eq!(outcome, BootstrapOutcome::Primary);

    let map: ClusterMap = store.load().unwrap().unwrap();
    assert!(map.uuid.is_some());
    assert!(map.is_primary("p1"));
    assert!(map.ic.contains("p1"));
    let bmd: BucketMetadata = store.load().unwrap().unwrap();
    assert_eq!(bmd.version, 1);
    assert_eq!(bmd.uuid, map.uuid);
    let config: GlobalConfig = store.load().unwrap().unwrap();
    assert_eq!(config.version, 1);
    assert_eq!(config.uuid, map.uuid);
    assert_eq!(config.primary_url, "http://p1:8080");
    assert!(!p1.context().rebalance_starting_up());
}

#[tokio::test(start_paused = true)]
async fn test_fresh_cluster_forms_with_one_identity() {
    let sim = Sim::new();
    let (p1_store, p1) = sim.node(proxy("p1"), primary_settings());
    let others: Vec<_> = [proxy("p2"), proxy("p3"), target("t1"), target("t2"), target("t3")]
        .into_iter()
        .map(|si| sim.node(si, settings()))
        .collect();

    let primary = bootstrap::start(p1.clone()).await.unwrap();
    let mut secondaries = Vec::new();
    for (_, node) in &others {
        let node = node.clone();
        secondaries.push(tokio::spawn(async move {
            let handle = bootstrap::start(node).await?;
            assert_eq!(handle.role(), StartRole::Secondary);
            handle.wait().await
        }));
    }

    assert_eq!(primary.wait().await.unwrap(), BootstrapOutcome::Primary);
    for secondary in secondaries {
        let outcome = secondary.await.unwrap().unwrap();
        assert_eq!(outcome, BootstrapOutcome::Secondary { primary: Some("p1".to_string()) });
    }

    let map: ClusterMap = p1_store.load().unwrap().unwrap();
    let uuid = map.uuid.expect("cluster UUID assigned");
    assert_eq!(map.count_proxies(), 3);
    assert_eq!(map.count_targets(), 3);
    assert_eq!(map.ic_count(), 3);

    for (store, node) in &others {
        assert!(node.context().is_cluster_started());
        let theirs: ClusterMap = store.load().unwrap().unwrap();
        assert_eq!(theirs.uuid, Some(uuid));
        assert_eq!(theirs.version, map.version);
        let bmd: BucketMetadata = store.load().unwrap().unwrap();
        assert_eq!(bmd.uuid, Some(uuid));
    }
}

#[tokio::test(start_paused = true)]
async fn test_restarted_primary_adopts_newer_map() {
    let sim = Sim::new();
    let uuid = Uuid::new_v4();
    let members = [target("t1"), target("t2")];
    let v4 = cluster_map(4, uuid, "p1", &members);
    let v5 = cluster_map(5, uuid, "p1", &[target("t1"), target("t2"), target("t3")]);

    let p1_store = Arc::new(MemoryMetaStore::new());
    p1_store.save(&v4).unwrap();
    p1_store.save(&RebalanceMetadata { version: 3, interrupted: true, ..Default::default() }).unwrap();
    let p1 = sim.node_with(proxy("p1"), settings(), p1_store.clone());

    let mut live = Vec::new();
    for id in ["t1", "t2", "t3"] {
        let (store, node) = sim.node(target(id), settings());
        run_with(&node, &v5).await;
        live.push((store, node));
    }

    let found = p1.discoverer().discover(&v4).await.unwrap();
    assert_eq!(found.cluster_map.map(|m| m.version), Some(5));

    let outcome = bootstrap::start(p1.clone()).await.unwrap().wait().await.unwrap();
    assert_eq!(outcome, BootstrapOutcome::Primary);

    let map: ClusterMap = p1_store.load().unwrap().unwrap();
    assert_eq!(map.uuid, Some(uuid));
    assert!(map.version > 5);
    assert!(map.get_target("t3").is_some());

    let rmd = p1.owners().rebalance_md.get();
    assert_eq!(rmd.version, 103);
    assert!(!rmd.interrupted);
    assert!(!p1.context().rebalance_pending());
    for (store, _) in &live {
        assert_eq!(store.load::<ClusterMap>().unwrap().unwrap().version, map.version);
        assert_eq!(store.load::<RebalanceMetadata>().unwrap().unwrap().version, 103);
    }
}

#[tokio::test(start_paused = true)]
async fn test_targets_with_conflicting_uuids_are_split_brain() {
    let sim = Sim::new();
    let members = [target("t1"), target("t2")];
    let loaded = cluster_map(3, Uuid::new_v4(), "p1", &members);

    let p1_store = Arc::new(MemoryMetaStore::new());
    p1_store.save(&loaded).unwrap();
    let p1 = sim.node_with(proxy("p1"), settings(), p1_store);

    let (_, t1) = sim.node(target("t1"), settings());
    run_with(&t1, &cluster_map(5, loaded.uuid.unwrap(), "p1", &members)).await;
    let (_, t2) = sim.node(target("t2"), settings());
    run_with(&t2, &cluster_map(6, Uuid::new_v4(), "p1", &members)).await;

    let err = bootstrap::start(p1).await.unwrap().wait().await.unwrap_err();
    assert!(matches!(err, BootstrapError::SplitBrain { .. }), "{err}");
    assert!(err.is_fatal());
}

#[tokio::test(start_paused = true)]
async fn test_stray_proxy_resolved_by_targets() {
    let sim = Sim::new();
    let uuid = Uuid::new_v4();
    let members = [proxy("p2"), target("t1"), target("t2")];
    let loaded = cluster_map(3, uuid, "p1", &members);
    let (_, p1) = sim.node(proxy("p1"), settings());

    for id in ["t1", "t2"] {
        let (_, node) = sim.node(target(id), settings());
        run_with(&node, &cluster_map(5, uuid, "p1", &members)).await;
    }
    let (_, p2) = sim.node(proxy("p2"), settings());
    run_with(&p2, &cluster_map(40, Uuid::new_v4(), "p1", &members)).await;

    let found = p1.discoverer().discover(&loaded).await.unwrap();
    let map = found.cluster_map.unwrap();
    assert_eq!(map.uuid, Some(uuid));
    assert_eq!(map.version, 5);
}

#[tokio::test(start_paused = true)]
async fn test_newer_primary_found_while_accepting_registrations() {
    let sim = Sim::new();
    let uuid = Uuid::new_v4();
    let loaded = cluster_map(4, uuid, "p1", &[proxy("p2"), target("t1")]);
    let newer = cluster_map(6, uuid, "p2", &[proxy("p1"), target("t1")]);

    let p1_store = Arc::new(MemoryMetaStore::new());
    p1_store.save(&loaded).unwrap();
    let settings = BootstrapSettings { primary_id: Some("p1".to_string()), ..settings() };
    let p1 = sim.node_with(proxy("p1"), settings, p1_store);

    let (_, p2) = sim.node(proxy("p2"), primary_settings());
    run_with(&p2, &newer).await;
    let (_, t1) = sim.node(target("t1"), primary_settings());
    run_with(&t1, &newer).await;

    let handle = bootstrap::start(p1.clone()).await.unwrap();
    assert_eq!(handle.role(), StartRole::Primary);
    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome, BootstrapOutcome::Secondary { primary: Some("p2".to_string()) });
    assert!(p1.owners().cluster_map.get().is_primary("p2"));
    assert!(p1.context().is_cluster_started());
}

#[tokio::test(start_paused = true)]
async fn test_peers_following_newer_primary_demote_at_start() {
    let sim = Sim::new();
    let uuid = Uuid::new_v4();
    let loaded = cluster_map(4, uuid, "p1", &[proxy("p2"), target("t1")]);
    let newer = cluster_map(6, uuid, "p2", &[proxy("p1"), target("t1")]);

    let p1_store = Arc::new(MemoryMetaStore::new());
    p1_store.save(&loaded).unwrap();
    let p1 = sim.node_with(proxy("p1"), settings(), p1_store);
    for si in [proxy("p2"), target("t1")] {
        let (_, node) = sim.node(si, settings());
        run_with(&node, &newer).await;
    }

    let handle = bootstrap::start(p1).await.unwrap();
    assert_eq!(handle.role(), StartRole::Secondary);
    assert_eq!(
        handle.wait().await.unwrap(),
        BootstrapOutcome::Secondary { primary: Some("p2".to_string()) }
    );
}

#[tokio::test(start_paused = true)]
async fn test_secondary_without_primary_url_fails() {
    let sim = Sim::new();
    let settings = BootstrapSettings { primary_url: None, ..settings() };
    let (_, t1) = sim.node(target("t1"), settings);

    let err = bootstrap::start(t1).await.unwrap_err();
    assert!(matches!(err, BootstrapError::JoinFailed(_)));
    assert!(err.is_fatal());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_secondary_poll() {
    let sim = Sim::new();
    let (_, p1) = sim.node(proxy("p1"), primary_settings());
    let (_, t1) = sim.node(target("t1"), settings());
    p1.owners().cluster_map.lock().await.put(ClusterMap::with_primary(proxy("p1")));
    p1.context().mark_node_started();

    let handle = bootstrap::start(t1.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    t1.context().shutdown();

    assert_eq!(handle.wait().await.unwrap(), BootstrapOutcome::Cancelled);
    assert!(!t1.context().is_cluster_started());
}

#[tokio::test(start_paused = true)]
async fn test_conflicting_overrides_fatal() {
    let sim = Sim::new();
    let settings = BootstrapSettings { primary_id: Some("p2".to_string()), ..primary_settings() };
    let (_, p1) = sim.node(proxy("p1"), settings);

    let err = bootstrap::start(p1).await.unwrap_err();
    assert!(matches!(err, BootstrapError::ConflictingOverrides { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_backend_override_applied() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("backends.json");
    std::fs::write(&path, r#"{"backends": {"aws": {"settings": {"region": "eu-west-1"}}}}"#)
        .unwrap();

    let sim = Sim::new();
    let uuid = Uuid::new_v4();
    let store = Arc::new(MemoryMetaStore::new());
    store.save(&cluster_map(2, uuid, "p1", &[])).unwrap();
    store.save(&GlobalConfig { version: 4, uuid: Some(uuid), ..Default::default() }).unwrap();
    let settings =
        BootstrapSettings { skip_startup: true, backend_override: Some(path), ..settings() };
    let p1 = sim.node_with(proxy("p1"), settings, store.clone());

    bootstrap::start(p1).await.unwrap().wait().await.unwrap();

    let config: GlobalConfig = store.load().unwrap().unwrap();
    assert_eq!(config.version, 5);
    let aws: &BackendConf = config.backends.get("aws").unwrap();
    assert_eq!(aws.settings.get("region").map(String::as_str), Some("eu-west-1"));
}

#[tokio::test(start_paused = true)]
async fn test_backend_override_requires_config_uuid() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("backends.json");
    std::fs::write(&path, r#"{"backends": {}}"#).unwrap();

    let sim = Sim::new();
    let store = Arc::new(MemoryMetaStore::new());
    store.save(&cluster_map(2, Uuid::new_v4(), "p1", &[])).unwrap();
    store.save(&GlobalConfig { version: 4, uuid: None, ..Default::default() }).unwrap();
    let settings =
        BootstrapSettings { skip_startup: true, backend_override: Some(path), ..settings() };
    let p1 = sim.node_with(proxy("p1"), settings, store);

    let err = bootstrap::start(p1).await.unwrap().wait().await.unwrap_err();
    assert!(matches!(err, BootstrapError::InvalidConfigUuid(_)));
}

#[tokio::test(start_paused = true)]
async fn test_persist_failure_is_fatal() {
    let sim = Sim::new();
    let settings = BootstrapSettings { skip_startup: true, ..primary_settings() };
    let (store, p1) = sim.node(proxy("p1"), settings);
    store.fail_writes(true);

    let err = bootstrap::start(p1).await.unwrap().wait().await.unwrap_err();
    assert!(matches!(err, BootstrapError::Persist { .. }));
    assert!(err.is_fatal());
}

async fn rebalance_node(sim: &Sim, targets: &[&str]) -> Arc<ClusterNode> {
    let (_, p1) = sim.node(proxy("p1"), settings());
    let members: Vec<_> = targets.iter().map(|id| target(id)).collect();
    run_with(&p1, &cluster_map(10, Uuid::new_v4(), "p1", &members)).await;
    p1.owners().rebalance_md.lock().await.put(RebalanceMetadata {
        version: 1,
        interrupted: true,
        ..Default::default()
    });
    p1.context().set_rebalance_pending(true);
    p1.context().begin_rebalance_startup();
    p1
}

#[tokio::test(start_paused = true)]
async fn test_resume_restarts_wait_when_map_changes_under_lock() {
    let sim = Sim::new();
    let p1 = rebalance_node(&sim, &["t1", "t2"]).await;
    let max_host_busy = p1.settings().max_host_busy;

    let guard = p1.owners().cluster_map.lock().await;
    let task = {
        let p1 = p1.clone();
        tokio::spawn(async move { resume_rebalance(&p1).await })
    };

    // Let the quiet period expire while the map lock is held.
    tokio::time::sleep(max_host_busy * 2).await;
    assert!(!task.is_finished());
    let mut map = (*guard.get()).clone();
    map.version += 1;
    guard.put(map);
    drop(guard);
    let released = Instant::now();

    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome, ResumeOutcome::Resumed(101));
    assert!(released.elapsed() >= max_host_busy);
    assert!(!p1.context().rebalance_pending());
    assert!(!p1.context().rebalance_starting_up());
}

#[tokio::test(start_paused = true)]
async fn test_resume_needs_two_active_targets() {
    let sim = Sim::new();
    let p1 = rebalance_node(&sim, &["t1"]).await;

    let err = resume_rebalance(&p1).await.unwrap_err();
    assert!(matches!(err, BootstrapError::NotEnoughTargets { required: 2, active: 1 }));
    assert!(p1.context().rebalance_pending());
}

#[tokio::test(start_paused = true)]
async fn test_resume_nothing_pending() {
    let sim = Sim::new();
    let p1 = rebalance_node(&sim, &["t1", "t2"]).await;
    p1.context().set_rebalance_pending(false);

    assert_eq!(resume_rebalance(&p1).await.unwrap(), ResumeOutcome::NothingPending);
}

#[tokio::test(start_paused = true)]
async fn test_too_few_confirmations_gives_up_primary_role() {
    let sim = Sim::new();
    let uuid = Uuid::new_v4();
    let members = [proxy("p2"), target("t1"), target("t2")];
    let loaded = cluster_map(4, uuid, "p1", &members);

    let p1_store = Arc::new(MemoryMetaStore::new());
    p1_store.save(&loaded).unwrap();
    let p1_settings = BootstrapSettings { primary_url: Some("http://p2:9080".to_string()), ..settings() };
    let p1 = sim.node_with(proxy("p1"), p1_settings, p1_store.clone());

    // Two peers follow a newer map naming p1; the third already moved on.
    for id in ["t1", "t2"] {
        let (_, node) = sim.node(target(id), settings());
        run_with(&node, &cluster_map(6, uuid, "p1", &members)).await;
    }
    let (_, p2) = sim.node(proxy("p2"), settings());
    run_with(&p2, &cluster_map(5, uuid, "p2", &[proxy("p1"), target("t1"), target("t2")])).await;

    let handle = bootstrap::start(p1.clone()).await.unwrap();
    assert_eq!(handle.role(), StartRole::Secondary);
    assert_eq!(
        handle.wait().await.unwrap(),
        BootstrapOutcome::Secondary { primary: Some("p2".to_string()) }
    );

    let persisted: ClusterMap = p1_store.load().unwrap().unwrap();
    assert!(!persisted.is_primary("p1"));
}

#[tokio::test(start_paused = true)]
async fn test_secondary_persists_loaded_map_before_joining() {
    let sim = Sim::new();
    let uuid = Uuid::new_v4();

    let p2_store = Arc::new(MemoryMetaStore::new());
    p2_store.save(&cluster_map(4, uuid, "p2", &[proxy("p1"), target("t1")])).unwrap();
    let p2_settings = BootstrapSettings { primary_id: Some("p1".to_string()), ..settings() };
    let p2 = sim.node_with(proxy("p2"), p2_settings, p2_store.clone());

    let (_, p1) = sim.node(proxy("p1"), settings());
    run_with(&p1, &cluster_map(4, uuid, "p1", &[proxy("p2"), target("t1")])).await;

    let handle = bootstrap::start(p2).await.unwrap();
    assert_eq!(handle.role(), StartRole::Secondary);

    let persisted: ClusterMap = p2_store.load().unwrap().unwrap();
    assert_eq!(persisted.version, 4);
    assert!(!persisted.is_primary("p2"));
    assert!(persisted.contains("p1"));

    assert_eq!(
        handle.wait().await.unwrap(),
        BootstrapOutcome::Secondary { primary: Some("p1".to_string()) }
    );
}

#[tokio::test(start_paused = true)]
async fn test_discovered_map_with_another_uuid_is_fatal() {
    let sim = Sim::new();
    let ours = Uuid::new_v4();
    let theirs = Uuid::new_v4();

    let p1_store = Arc::new(MemoryMetaStore::new());
    p1_store.save(&cluster_map(4, ours, "p1", &[proxy("p2")])).unwrap();
    let p1 = sim.node_with(proxy("p1"), settings(), p1_store);

    let (_, p2) = sim.node(proxy("p2"), settings());
    run_with(&p2, &cluster_map(4, theirs, "p1", &[proxy("p2")])).await;

    let handle = bootstrap::start(p1.clone()).await.unwrap();
    assert_eq!(handle.role(), StartRole::Primary);

    let err = handle.wait().await.unwrap_err();
    assert!(
        matches!(err, BootstrapError::UuidMismatch { local, discovered } if local == ours && discovered == theirs),
        "{err}"
    );
    assert!(err.is_fatal());
    assert!(!p1.context().is_cluster_started());
}

#[tokio::test(start_paused = true)]
async fn test_primary_reclaims_endpoint_recorded_under_old_id() {
    let sim = Sim::new();
    let uuid = Uuid::new_v4();
    // Same endpoint as "p1", restarted under a new ID.
    let p1b = NodeDescriptor::proxy("p1b", "http://p1:9080", "http://p1:8080");

    let mut loaded = ClusterMap::with_primary(p1b.clone());
    loaded.add_node(target("t1"));
    loaded.version = 3;
    loaded.uuid = Some(uuid);
    loaded.created_at = Some(chrono::Utc::now());

    let store = Arc::new(MemoryMetaStore::new());
    store.save(&loaded).unwrap();
    let forced_settings = BootstrapSettings {
        primary_id: Some("p1b".to_string()),
        skip_startup: true,
        ..settings()
    };
    let node = sim.node_with(p1b, forced_settings, store.clone());

    let (t1_store, t1) = sim.node(target("t1"), settings());
    run_with(&t1, &cluster_map(5, uuid, "p1", &[target("t1")])).await;

    let outcome = bootstrap::start(node).await.unwrap().wait().await.unwrap();
    assert_eq!(outcome, BootstrapOutcome::Primary);

    let map: ClusterMap = store.load().unwrap().unwrap();
    assert!(map.version > 5);
    assert_eq!(map.uuid, Some(uuid));
    assert!(map.is_primary("p1b"));
    assert!(!map.contains("p1"));
    assert!(map.get_target("t1").is_some());
    assert_eq!(t1_store.load::<ClusterMap>().unwrap().unwrap().version, map.version);
}

#[tokio::test(start_paused = true)]
async fn test_merge_of_loaded_map_outversions_registrations() {
    let sim = Sim::new();
    let uuid = Uuid::new_v4();

    let p1_store = Arc::new(MemoryMetaStore::new());
    p1_store.save(&cluster_map(4, uuid, "p1", &[target("t1")])).unwrap();
    let p1 = sim.node_with(proxy("p1"), settings(), p1_store.clone());

    let (_, t1) = sim.node(target("t1"), settings());
    let t2_store = Arc::new(MemoryMetaStore::new());
    t2_store.save(&cluster_map(9, uuid, "p1", &[target("t2")])).unwrap();
    let t2 = sim.node_with(target("t2"), settings(), t2_store.clone());

    let primary = bootstrap::start(p1.clone()).await.unwrap();
    assert_eq!(primary.role(), StartRole::Primary);
    let secondaries: Vec<_> = [t1, t2]
        .into_iter()
        .map(|node| tokio::spawn(async move { bootstrap::start(node).await?.wait().await }))
        .collect();

    assert_eq!(primary.wait().await.unwrap(), BootstrapOutcome::Primary);
    for secondary in secondaries {
        let outcome = secondary.await.unwrap().unwrap();
        assert_eq!(outcome, BootstrapOutcome::Secondary { primary: Some("p1".to_string()) });
    }

    let map: ClusterMap = p1_store.load().unwrap().unwrap();
    assert!(map.version > 9, "{map}");
    assert_eq!(map.uuid, Some(uuid));
    assert!(map.get_target("t1").is_some());
    assert!(map.get_target("t2").is_some());
    assert_eq!(t2_store.load::<ClusterMap>().unwrap().unwrap().version, map.version);
}

#[tokio::test(start_paused = true)]
async fn test_forced_primary_demotes_on_discovered_newer_map() {
    let sim = Sim::new();
    let uuid = Uuid::new_v4();
    let newer = cluster_map(6, uuid, "p2", &[proxy("p1"), target("t1")]);

    let p1_store = Arc::new(MemoryMetaStore::new());
    p1_store.save(&cluster_map(3, uuid, "p1", &[target("t1")])).unwrap();
    let forced_settings = BootstrapSettings {
        primary_id: Some("p1".to_string()),
        skip_startup: true,
        ..settings()
    };
    let p1 = sim.node_with(proxy("p1"), forced_settings, p1_store.clone());
    for si in [proxy("p2"), target("t1")] {
        let (_, node) = sim.node(si, settings());
        run_with(&node, &newer).await;
    }

    let handle = bootstrap::start(p1.clone()).await.unwrap();
    assert_eq!(handle.role(), StartRole::Primary);
    assert_eq!(
        handle.wait().await.unwrap(),
        BootstrapOutcome::Secondary { primary: Some("p2".to_string()) }
    );

    let persisted: ClusterMap = p1_store.load().unwrap().unwrap();
    assert_eq!(persisted.version, 6);
    assert!(persisted.is_primary("p2"));
    assert!(p1.context().is_cluster_started());
}

#[tokio::test(start_paused = true)]
async fn test_secondary_keeps_waiting_for_slow_primary() {
    let sim = Sim::new();
    let (_, p1) = sim.node(proxy("p1"), primary_settings());
    let (_, t1) = sim.node(target("t1"), settings());
    p1.owners().cluster_map.lock().await.put(ClusterMap::with_primary(proxy("p1")));
    p1.context().mark_node_started();

    let handle = bootstrap::start(t1.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!t1.context().is_cluster_started());

    p1.context().mark_cluster_started();
    assert_eq!(
        handle.wait().await.unwrap(),
        BootstrapOutcome::Secondary { primary: Some("p1".to_string()) }
    );
    assert!(t1.context().is_cluster_started());
}
