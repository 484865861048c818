//! A gateway node: its metadata owners, lifecycle context and the
//! control-plane handlers that peers call during bootstrap.

use std::sync::Arc;

use metrics::counter;
use rucket_core::meta::{ClusterMetaSnapshot, RebalanceMetadata};
use rucket_core::{NodeDescriptor, Versioned};
use tracing::{debug, info, warn};

use crate::bootstrap::BootstrapSettings;
use crate::context::NodeContext;
use crate::discovery::ClusterDiscoverer;
use crate::owner::{MetaOwners, MetadataOwner};
use crate::regpool::RegistrationPool;
use crate::store::MetaStore;
use crate::transport::{
    ActionMsg, ClusterInfo, JoinAccepted, JoinError, Query, QueryResponse, RegistrationRequest,
    Revision, Transport, TransportError,
};

/// One gateway in the cluster.
#[derive(Debug)]
pub struct ClusterNode {
    si: NodeDescriptor,
    settings: BootstrapSettings,
    owners: MetaOwners,
    ctx: Arc<NodeContext>,
    regpool: RegistrationPool,
    transport: Transport,
}

impl ClusterNode {
    /// Creates a node. Nothing is loaded or published yet.
    pub fn new(
        si: NodeDescriptor,
        settings: BootstrapSettings,
        store: Arc<dyn MetaStore>,
        transport: Transport,
    ) -> Arc<Self> {
        Arc::new(Self {
            si,
            settings,
            owners: MetaOwners::new(store),
            ctx: Arc::new(NodeContext::new()),
            regpool: RegistrationPool::new(),
            transport,
        })
    }

    /// This node's descriptor.
    #[must_use]
    pub fn si(&self) -> &NodeDescriptor {
        &self.si
    }

    /// This node's ID.
    #[must_use]
    pub fn id(&self) -> &str {
        self.si.id()
    }

    /// Bootstrap settings.
    #[must_use]
    pub fn settings(&self) -> &BootstrapSettings {
        &self.settings
    }

    /// Metadata owners.
    #[must_use]
    pub fn owners(&self) -> &MetaOwners {
        &self.owners
    }

    /// Lifecycle context.
    #[must_use]
    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    /// Pooled registrations.
    #[must_use]
    pub fn regpool(&self) -> &RegistrationPool {
        &self.regpool
    }

    /// Transport seams.
    #[must_use]
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// A discoverer bound to this node.
    #[must_use]
    pub fn discoverer(&self) -> ClusterDiscoverer {
        ClusterDiscoverer::new(
            self.id(),
            self.transport.broadcaster.clone(),
            self.ctx.clone(),
            self.settings.clone(),
        )
    }

    /// Publishes the persisted bucket metadata, rebalance metadata and global
    /// config. An interrupted rebalance is flagged as pending.
    ///
    /// The cluster map is not published here: the bootstrap decides whether
    /// the persisted copy is trusted.
    pub async fn load_local(&self) {
        load_into(&self.owners.bucket_md).await;
        load_into(&self.owners.config).await;
        if load_into(&self.owners.rebalance_md).await {
            let rmd = self.owners.rebalance_md.get();
            if rmd.interrupted {
                info!(%rmd, "Found interrupted rebalance");
                self.ctx.set_rebalance_pending(true);
            }
        }
    }

    /// What this node holds, as answered to discovery.
    #[must_use]
    pub fn cluster_meta(&self) -> ClusterMetaSnapshot {
        self.owners.snapshot(self.ctx.vote_in_progress())
    }

    /// This node's view of the cluster.
    #[must_use]
    pub fn cluster_info(&self) -> ClusterInfo {
        let map = self.owners.cluster_map.get();
        ClusterInfo {
            node_id: self.id().to_string(),
            map_version: map.version,
            map_uuid: map.uuid,
            primary: map.primary.clone(),
            cluster_started: self.ctx.is_cluster_started(),
        }
    }

    /// Answers a control-plane query.
    #[must_use]
    pub fn handle_query(&self, query: Query) -> QueryResponse {
        match query {
            Query::ClusterMeta => QueryResponse::ClusterMeta(self.cluster_meta()),
            Query::ClusterInfo => QueryResponse::ClusterInfo(self.cluster_info()),
        }
    }

    /// Handles a join request on the primary.
    ///
    /// Before the cluster is started the request is also pooled so the
    /// forming primary can reconcile the joiner's metadata.
    ///
    /// # Errors
    ///
    /// Rejects when this node is not (yet) the primary, or when the joiner's
    /// endpoint is already registered under another ID.
    pub async fn handle_join(&self, request: RegistrationRequest) -> Result<JoinAccepted, JoinError> {
        if !self.ctx.is_node_started() {
            return Err(JoinError::new(JoinError::NOT_READY, format!("{} is starting up", self.si)));
        }
        let joiner = request.node.clone();
        let cluster_started = self.ctx.is_cluster_started();

        let guard = self.owners.cluster_map.lock().await;
        let current = guard.get();
        if !current.is_primary(self.id()) {
            let primary = current.primary_id().unwrap_or("-");
            return Err(JoinError::new(
                JoinError::NOT_PRIMARY,
                format!("{} is not the primary (primary: {primary})", self.si),
            ));
        }
        if let Some(dup) = current.find_duplicate(&joiner) {
            warn!(joiner = %joiner, existing = %dup, "Rejecting join from duplicate endpoint");
            return Err(JoinError::new(
                JoinError::BAD_REQUEST,
                format!("{joiner} duplicates {dup} at {}", joiner.control_url()),
            ));
        }

        if !cluster_started {
            self.regpool.push(request);
        }
        if current.get_node(joiner.id()) == Some(&joiner) {
            debug!(joiner = %joiner, "Node already registered");
            return Ok(JoinAccepted { primary: self.si.clone(), cluster_map: (*current).clone() });
        }

        let mut clone = (*current).clone();
        clone.add_node(joiner.clone());
        clone.version += 1;

        if !cluster_started {
            let map = guard.put(clone);
            info!(joiner = %joiner, map = %map, "Registered node during startup");
            return Ok(JoinAccepted { primary: self.si.clone(), cluster_map: (*map).clone() });
        }

        let map = guard
            .put_persist(clone)
            .await
            .map_err(|e| JoinError::new(JoinError::INTERNAL, e.to_string()))?;
        drop(guard);
        info!(joiner = %joiner, map = %map, "Node joined");

        let msg = ActionMsg::new(ActionMsg::NODE_JOINED).with_value(joiner.id());
        let mut revisions = vec![(Revision::ClusterMap(map.clone()), msg.clone())];
        if let Some(rmd) = self.trigger_rebalance(&joiner).await? {
            revisions.push((Revision::RebalanceMetadata(rmd), msg));
        }
        let handle = self.transport.distributor.sync(revisions);
        tokio::spawn(async move {
            if let Err(e) = handle.wait().await {
                warn!(error = %e, "Failed to distribute cluster map after join");
            }
        });
        Ok(JoinAccepted { primary: self.si.clone(), cluster_map: (*map).clone() })
    }

    /// Starts a new rebalance for a target that joined a running cluster.
    ///
    /// Suppressed while the primary is still starting up: the bootstrap
    /// resumes or starts rebalancing itself once membership settles.
    async fn trigger_rebalance(
        &self,
        joiner: &NodeDescriptor,
    ) -> Result<Option<Arc<RebalanceMetadata>>, JoinError> {
        if !joiner.is_target()
            || !self.settings.rebalance_enabled
            || !self.owners.rebalance_md.get().enabled
        {
            return Ok(None);
        }
        if self.ctx.rebalance_starting_up() {
            debug!(joiner = %joiner, "Rebalance suppressed while starting up");
            return Ok(None);
        }
        let rmd = self
            .owners
            .rebalance_md
            .modify(|_| Ok(()))
            .await
            .map_err(|e| JoinError::new(JoinError::INTERNAL, e.to_string()))?;
        counter!("rucket_bootstrap_rebalance_triggered_total").increment(1);
        info!(joiner = %joiner, rmd = %rmd, "Target joined, starting rebalance");
        Ok(Some(rmd))
    }

    /// Applies revisions pushed by the primary. Stale revisions are skipped.
    ///
    /// # Errors
    ///
    /// Rejects revisions of another cluster, and fails if a revision cannot be
    /// persisted.
    pub async fn apply_revisions(
        &self,
        revisions: Vec<(Revision, ActionMsg)>,
    ) -> Result<(), TransportError> {
        for (revision, msg) in revisions {
            debug!(node = %self.si, kind = %revision.kind(), version = revision.version(), action = %msg.action, "Received revision");
            match revision {
                Revision::ClusterMap(doc) => self.apply(&self.owners.cluster_map, doc).await?,
                Revision::BucketMetadata(doc) => self.apply(&self.owners.bucket_md, doc).await?,
                Revision::RebalanceMetadata(doc) => {
                    self.apply(&self.owners.rebalance_md, doc).await?;
                }
                Revision::GlobalConfig(doc) => self.apply(&self.owners.config, doc).await?,
            }
        }
        Ok(())
    }

    async fn apply<T: Versioned>(
        &self,
        owner: &MetadataOwner<T>,
        doc: Arc<T>,
    ) -> Result<(), TransportError> {
        let guard = owner.lock().await;
        let local = guard.get();
        if let (Some(ours), Some(theirs)) = (local.uuid().filter(|_| local.version() > 0), doc.uuid())
        {
            if ours != theirs {
                return Err(TransportError::Rejected {
                    node: self.id().to_string(),
                    reason: format!("{} UUID {theirs} does not match {ours}", T::KIND),
                });
            }
        }
        if doc.version() <= local.version() {
            return Ok(());
        }
        let doc = (*doc).clone();
        guard.persist(&doc).await.map_err(|e| TransportError::Rejected {
            node: self.id().to_string(),
            reason: e.to_string(),
        })?;
        guard.put(doc);
        Ok(())
    }
}

async fn load_into<T: Versioned>(owner: &MetadataOwner<T>) -> bool {
    match owner.load().await {
        Ok(Some(doc)) if doc.version() > 0 => {
            debug!(kind = %T::KIND, version = doc.version(), "Loaded local metadata");
            owner.lock().await.put(doc);
            true
        }
        Ok(_) => false,
        Err(e) => {
            warn!(kind = %T::KIND, error = %e, "Failed to load local metadata");
            false
        }
    }
}
