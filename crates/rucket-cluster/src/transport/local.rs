// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! In-process transport connecting [`ClusterNode`]s of one simulation.
//!
//! Responses still go through the JSON envelope so decoding is exercised the
//! same way as over the wire.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use rucket_core::NodeDescriptor;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::{
    ActionMsg, Broadcaster, CallResult, Distributor, JoinAccepted, JoinError, Joiner, Query,
    QueryResponse, RegistrationRequest, Revision, SyncHandle, Transport, TransportError,
};
use crate::node::ClusterNode;

/// Registry of in-process nodes.
#[derive(Debug, Default)]
pub struct LocalNetwork {
    nodes: DashMap<String, Weak<ClusterNode>>,
    down: DashSet<String>,
}

impl LocalNetwork {
    /// Creates an empty network.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport for the node `self_id`.
    #[must_use]
    pub fn transport(self: &Arc<Self>, self_id: &str) -> Transport {
        Transport {
            broadcaster: self.clone(),
            joiner: self.clone(),
            distributor: Arc::new(LocalDistributor {
                network: self.clone(),
                sender: self_id.to_string(),
            }),
        }
    }

    /// Makes `node` reachable.
    pub fn register(&self, node: &Arc<ClusterNode>) {
        self.nodes.insert(node.id().to_string(), Arc::downgrade(node));
    }

    /// Simulates a node crash (`down = true`) or recovery.
    pub fn set_down(&self, id: &str, down: bool) {
        if down {
            self.down.insert(id.to_string());
        } else {
            self.down.remove(id);
        }
    }

    fn resolve(&self, id: &str) -> Option<Arc<ClusterNode>> {
        if self.down.contains(id) {
            return None;
        }
        self.nodes.get(id).and_then(|n| n.upgrade())
    }

    fn resolve_url(&self, url: &str) -> Option<Arc<ClusterNode>> {
        let id = self.nodes.iter().find_map(|entry| {
            let node = entry.value().upgrade()?;
            let si = node.si();
            (si.control_url() == url || si.public_url() == url).then(|| entry.key().clone())
        })?;
        self.resolve(&id)
    }

    fn receivers(&self, sender: &str) -> Vec<Arc<ClusterNode>> {
        let ids: Vec<String> =
            self.nodes.iter().map(|e| e.key().clone()).filter(|id| id != sender).collect();
        ids.iter().filter_map(|id| self.resolve(id)).collect()
    }
}

fn answer(peer: &ClusterNode, query: Query) -> Result<QueryResponse, TransportError> {
    let bytes = peer.handle_query(query).encode()?;
    QueryResponse::decode(query, &bytes)
}

#[async_trait]
impl Broadcaster for LocalNetwork {
    async fn broadcast(
        &self,
        query: Query,
        to: &[NodeDescriptor],
        timeout: Duration,
    ) -> Vec<CallResult> {
        let mut calls = JoinSet::new();
        for node in to {
            let node = node.clone();
            let peer = self.resolve(node.id());
            calls.spawn(async move {
                let Some(peer) = peer else {
                    let result = Err(TransportError::Unreachable(node.id().to_string()));
                    return CallResult { node, result };
                };
                let result = tokio::time::timeout(timeout, async { answer(&peer, query) })
                    .await
                    .unwrap_or_else(|_| {
                        Err(TransportError::Timeout { node: node.id().to_string(), timeout })
                    });
                CallResult { node, result }
            });
        }

        let mut results = Vec::with_capacity(to.len());
        while let Some(joined) = calls.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!(error = %e, "Broadcast call panicked"),
            }
        }
        results
    }
}

#[async_trait]
impl Joiner for LocalNetwork {
    async fn join_cluster(
        &self,
        request: RegistrationRequest,
        urls: &[String],
    ) -> Result<JoinAccepted, JoinError> {
        let mut last = JoinError::new(JoinError::UNREACHABLE, format!("no node at {urls:?}"));
        for url in urls {
            let Some(primary) = self.resolve_url(url) else {
                debug!(url = %url, "Join candidate unreachable");
                continue;
            };
            match primary.handle_join(request.clone()).await {
                Ok(accepted) => return Ok(accepted),
                Err(e) => {
                    debug!(url = %url, error = %e, "Join rejected");
                    last = e;
                }
            }
        }
        Err(last)
    }
}

/// Pushes revisions to every other reachable node of a [`LocalNetwork`].
#[derive(Debug)]
pub struct LocalDistributor {
    network: Arc<LocalNetwork>,
    sender: String,
}

impl Distributor for LocalDistributor {
    fn sync(&self, revisions: Vec<(Revision, ActionMsg)>) -> SyncHandle {
        let (handle, tx) = SyncHandle::channel();
        let receivers = self.network.receivers(&self.sender);

        tokio::spawn(async move {
            let mut result = Ok(());
            for receiver in receivers {
                if let Err(e) = receiver.apply_revisions(revisions.clone()).await {
                    warn!(node = %receiver.si(), error = %e, "Revision rejected");
                    result = Err(e);
                }
            }
            let _ = tx.send(result);
        });
        handle
    }
}
