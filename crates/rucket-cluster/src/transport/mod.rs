// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Peer communication seams used by the bootstrap.
//!
//! The bootstrap only depends on three traits:
//! - [`Broadcaster`]: parallel fan-out of a [`Query`] with per-call timeouts
//! - [`Joiner`]: registration with a primary
//! - [`Distributor`]: push of agreed revisions to every member
//!
//! [`LocalNetwork`] implements all three in-process.

mod local;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rucket_core::meta::{
    BucketMetadata, ClusterMap, ClusterMetaSnapshot, GlobalConfig, MetaKind, RebalanceMetadata,
};
use rucket_core::{NodeDescriptor, Versioned};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

pub use local::{LocalDistributor, LocalNetwork};

/// Errors from a single peer call.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The peer could not be reached.
    #[error("node {0} unreachable")]
    Unreachable(String),

    /// The peer did not answer in time.
    #[error("call to {node} timed out after {timeout:?}")]
    Timeout {
        /// The peer.
        node: String,
        /// The per-call timeout.
        timeout: Duration,
    },

    /// The response did not decode as expected.
    #[error("decode error: {0}")]
    Decode(String),

    /// The peer refused the request.
    #[error("rejected by {node}: {reason}")]
    Rejected {
        /// The peer.
        node: String,
        /// Why.
        reason: String,
    },
}

/// Control-plane queries answered by every gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Query {
    /// All four metadata documents plus the election flag.
    ClusterMeta,
    /// A short summary of the responder's view of the cluster.
    ClusterInfo,
}

/// The responder's view of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    /// Responder ID.
    pub node_id: String,
    /// Version of the responder's cluster map.
    pub map_version: i64,
    /// Cluster UUID, if known.
    pub map_uuid: Option<Uuid>,
    /// The primary the responder follows.
    pub primary: Option<NodeDescriptor>,
    /// Whether the responder considers the cluster started.
    pub cluster_started: bool,
}

/// Response envelope. The variant always matches the query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "what", content = "body", rename_all = "snake_case")]
pub enum QueryResponse {
    /// Answer to [`Query::ClusterMeta`].
    ClusterMeta(ClusterMetaSnapshot),
    /// Answer to [`Query::ClusterInfo`].
    ClusterInfo(ClusterInfo),
}

impl QueryResponse {
    /// Decodes a wire response to `query`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Decode`] if the bytes are malformed or the
    /// envelope does not match the query.
    pub fn decode(query: Query, bytes: &[u8]) -> Result<Self, TransportError> {
        let response: Self =
            serde_json::from_slice(bytes).map_err(|e| TransportError::Decode(e.to_string()))?;
        if response.query() != query {
            return Err(TransportError::Decode(format!(
                "expected {query:?} response, got {:?}",
                response.query()
            )));
        }
        Ok(response)
    }

    /// Encodes this response for the wire.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Decode`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        serde_json::to_vec(self).map_err(|e| TransportError::Decode(e.to_string()))
    }

    /// The query this response answers.
    #[must_use]
    pub fn query(&self) -> Query {
        match self {
            Self::ClusterMeta(_) => Query::ClusterMeta,
            Self::ClusterInfo(_) => Query::ClusterInfo,
        }
    }

    /// Unwraps a cluster-meta response.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Decode`] for any other variant.
    pub fn into_cluster_meta(self) -> Result<ClusterMetaSnapshot, TransportError> {
        match self {
            Self::ClusterMeta(snapshot) => Ok(snapshot),
            other => Err(TransportError::Decode(format!("unexpected {:?}", other.query()))),
        }
    }

    /// Unwraps a cluster-info response.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Decode`] for any other variant.
    pub fn into_cluster_info(self) -> Result<ClusterInfo, TransportError> {
        match self {
            Self::ClusterInfo(info) => Ok(info),
            other => Err(TransportError::Decode(format!("unexpected {:?}", other.query()))),
        }
    }
}

/// Outcome of one call in a broadcast.
#[derive(Debug, Clone)]
pub struct CallResult {
    /// The peer called.
    pub node: NodeDescriptor,
    /// Its answer.
    pub result: Result<QueryResponse, TransportError>,
}

/// Fans a query out to a set of peers.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Calls every node in `to` in parallel. Returns one result per node;
    /// failures are reported, never raised.
    async fn broadcast(
        &self,
        query: Query,
        to: &[NodeDescriptor],
        timeout: Duration,
    ) -> Vec<CallResult>;
}

/// A join request, carrying the joiner's own metadata for reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationRequest {
    /// The joining node.
    pub node: NodeDescriptor,
    /// Its cluster map, if initialized.
    pub cluster_map: Option<ClusterMap>,
    /// Its bucket metadata, if initialized.
    pub bucket_md: Option<BucketMetadata>,
}

/// Successful join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinAccepted {
    /// The primary that accepted the join.
    pub primary: NodeDescriptor,
    /// Its cluster map after the join.
    pub cluster_map: ClusterMap,
}

/// A rejected or failed join, with an HTTP-style status code.
#[derive(Debug, Clone, Error)]
#[error("join failed ({status}): {message}")]
pub struct JoinError {
    /// Status code.
    pub status: u16,
    /// Explanation.
    pub message: String,
}

impl JoinError {
    /// The primary exists but cannot accept joins yet.
    pub const NOT_READY: u16 = 503;
    /// The contacted node is not the primary.
    pub const NOT_PRIMARY: u16 = 409;
    /// The request is invalid (duplicate endpoint).
    pub const BAD_REQUEST: u16 = 400;
    /// Internal failure on the primary.
    pub const INTERNAL: u16 = 500;
    /// No candidate URL could be reached.
    pub const UNREACHABLE: u16 = 502;

    /// Creates an error.
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }

    /// Whether retrying the same primary may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.status == Self::NOT_READY
    }
}

/// Registers a node with a primary.
#[async_trait]
pub trait Joiner: Send + Sync {
    /// Tries each of `urls` in order until one accepts.
    async fn join_cluster(
        &self,
        request: RegistrationRequest,
        urls: &[String],
    ) -> Result<JoinAccepted, JoinError>;
}

/// One document revision to distribute.
#[derive(Debug, Clone)]
pub enum Revision {
    /// Cluster map.
    ClusterMap(Arc<ClusterMap>),
    /// Bucket metadata.
    BucketMetadata(Arc<BucketMetadata>),
    /// Rebalance metadata.
    RebalanceMetadata(Arc<RebalanceMetadata>),
    /// Global config.
    GlobalConfig(Arc<GlobalConfig>),
}

impl Revision {
    /// The document kind.
    #[must_use]
    pub fn kind(&self) -> MetaKind {
        match self {
            Self::ClusterMap(_) => MetaKind::ClusterMap,
            Self::BucketMetadata(_) => MetaKind::BucketMetadata,
            Self::RebalanceMetadata(_) => MetaKind::RebalanceMetadata,
            Self::GlobalConfig(_) => MetaKind::GlobalConfig,
        }
    }

    /// The document version.
    #[must_use]
    pub fn version(&self) -> i64 {
        match self {
            Self::ClusterMap(doc) => doc.version(),
            Self::BucketMetadata(doc) => doc.version(),
            Self::RebalanceMetadata(doc) => doc.version(),
            Self::GlobalConfig(doc) => doc.version(),
        }
    }
}

/// Why a revision is being distributed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionMsg {
    /// Action name.
    pub action: String,
    /// Optional detail.
    pub value: Option<String>,
}

impl ActionMsg {
    /// Distributed by the forming primary once registrations are merged.
    pub const EARLY_START_HAVE_REGISTRATIONS: &'static str = "early-start-have-registrations";
    /// Distributed when the primary finishes its startup.
    pub const PRIMARY_STARTED_UP: &'static str = "primary-started-up";
    /// Distributed when an interrupted rebalance is resumed.
    pub const RESUME_REBALANCE: &'static str = "primary-startup-resume-rebalance";
    /// Distributed when a node joins a started cluster.
    pub const NODE_JOINED: &'static str = "node-joined";

    /// Creates a message without detail.
    #[must_use]
    pub fn new(action: &str) -> Self {
        Self { action: action.to_string(), value: None }
    }

    /// Adds a detail.
    #[must_use]
    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }
}

/// Completion handle of a distribution.
#[derive(Debug)]
pub struct SyncHandle {
    rx: oneshot::Receiver<Result<(), TransportError>>,
}

impl SyncHandle {
    /// Creates a handle and the sender that completes it.
    #[must_use]
    pub fn channel() -> (Self, oneshot::Sender<Result<(), TransportError>>) {
        let (tx, rx) = oneshot::channel();
        (Self { rx }, tx)
    }

    /// A handle that is already complete.
    #[must_use]
    pub fn ready() -> Self {
        let (handle, tx) = Self::channel();
        let _ = tx.send(Ok(()));
        handle
    }

    /// Waits until every member acknowledged.
    ///
    /// # Errors
    ///
    /// Returns the delivery error, or [`TransportError::Unreachable`] if the
    /// distributor went away.
    pub async fn wait(self) -> Result<(), TransportError> {
        self.rx.await.map_err(|_| TransportError::Unreachable("distributor".to_string()))?
    }
}

/// Pushes revisions to every cluster member.
pub trait Distributor: Send + Sync {
    /// Starts distributing `revisions`. Revisions of one call are applied in
    /// order by every receiver.
    fn sync(&self, revisions: Vec<(Revision, ActionMsg)>) -> SyncHandle;
}

/// Broadcaster that reaches no one.
#[derive(Debug, Default)]
pub struct NoOpBroadcaster;

#[async_trait]
impl Broadcaster for NoOpBroadcaster {
    async fn broadcast(
        &self,
        _query: Query,
        to: &[NodeDescriptor],
        _timeout: Duration,
    ) -> Vec<CallResult> {
        to.iter()
            .map(|node| CallResult {
                node: node.clone(),
                result: Err(TransportError::Unreachable(node.id().to_string())),
            })
            .collect()
    }
}

/// Joiner that always fails.
#[derive(Debug, Default)]
pub struct NoOpJoiner;

#[async_trait]
impl Joiner for NoOpJoiner {
    async fn join_cluster(
        &self,
        _request: RegistrationRequest,
        urls: &[String],
    ) -> Result<JoinAccepted, JoinError> {
        Err(JoinError::new(JoinError::UNREACHABLE, format!("no transport to {urls:?}")))
    }
}

/// Distributor that completes immediately.
#[derive(Debug, Default)]
pub struct NoOpDistributor;

impl Distributor for NoOpDistributor {
    fn sync(&self, _revisions: Vec<(Revision, ActionMsg)>) -> SyncHandle {
        SyncHandle::ready()
    }
}

/// The three transport seams bundled for a node.
#[derive(Clone)]
pub struct Transport {
    /// Query fan-out.
    pub broadcaster: Arc<dyn Broadcaster>,
    /// Join client.
    pub joiner: Arc<dyn Joiner>,
    /// Revision distribution.
    pub distributor: Arc<dyn Distributor>,
}

impl Transport {
    /// A transport that reaches no peer.
    #[must_use]
    pub fn isolated() -> Self {
        Self {
            broadcaster: Arc::new(NoOpBroadcaster),
            joiner: Arc::new(NoOpJoiner),
            distributor: Arc::new(NoOpDistributor),
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_checks_envelope() {
        let info = QueryResponse::ClusterInfo(ClusterInfo {
            node_id: "p1".into(),
            map_version: 3,
            map_uuid: None,
            primary: None,
            cluster_started: false,
        });
        let bytes = info.encode().unwrap();

        assert!(QueryResponse::decode(Query::ClusterInfo, &bytes).is_ok());
        let err = QueryResponse::decode(Query::ClusterMeta, &bytes).unwrap_err();
        assert!(matches!(err, TransportError::Decode(_)));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(QueryResponse::decode(Query::ClusterMeta, b"[1,2]").is_err());
    }

    #[tokio::test]
    async fn test_noop_transport() {
        let transport = Transport::isolated();
        let peers = vec![NodeDescriptor::target("t1", "http://t1:9080", "http://t1:8080")];
        let results = transport.broadcaster.broadcast(Query::ClusterMeta, &peers, Duration::ZERO).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].result.is_err());

        transport.distributor.sync(vec![]).wait().await.unwrap();
    }
}
