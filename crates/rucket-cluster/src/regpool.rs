//! Registrations received by a forming primary before the cluster starts.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rucket_core::meta::{BucketMetadata, ClusterMap, MetaKind};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{BootstrapError, Result};
use crate::transport::RegistrationRequest;

/// Outcome of reconciling registrations with local state.
#[derive(Debug, Clone, Default)]
pub struct RegpoolResolution {
    /// Cluster identity carried by the highest-version map, if any.
    pub identity: Option<(Uuid, DateTime<Utc>)>,
    /// Bucket metadata to adopt, if a registrant carried a newer one.
    pub bucket_md: Option<BucketMetadata>,
    /// Highest cluster map version seen among the local copy and registrants.
    pub max_version: i64,
}

/// Accumulates join requests while the primary is forming the cluster.
#[derive(Debug, Default)]
pub struct RegistrationPool {
    requests: Mutex<Vec<RegistrationRequest>>,
}

impl RegistrationPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a request. A repeated request from the same node replaces the older one.
    pub fn push(&self, request: RegistrationRequest) {
        let mut requests = self.requests.lock();
        requests.retain(|r| r.node.id() != request.node.id());
        debug!(node = %request.node, pooled = requests.len() + 1, "Pooled registration");
        requests.push(request);
    }

    /// Number of pooled requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    /// Whether the pool is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requests.lock().is_empty()
    }

    /// Drops all pooled requests.
    pub fn clear(&self) {
        self.requests.lock().clear();
    }

    /// Copies the pooled requests.
    #[must_use]
    pub fn snapshot(&self) -> Vec<RegistrationRequest> {
        self.requests.lock().clone()
    }

    /// Reconciles pooled metadata with the local `map` and `bmd`.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::UuidMismatch`] when two UUID-bearing maps
    /// disagree, and [`BootstrapError::SplitBrain`] for bucket metadata.
    pub fn resolve(&self, map: &ClusterMap, bmd: &BucketMetadata) -> Result<RegpoolResolution> {
        resolve_max_version(map, bmd, &self.requests.lock())
    }
}

/// Picks the highest-version map and bucket metadata among the local copies
/// and the registrations, failing on UUID disagreement.
///
/// # Errors
///
/// See [`RegistrationPool::resolve`].
pub fn resolve_max_version(
    map: &ClusterMap,
    bmd: &BucketMetadata,
    requests: &[RegistrationRequest],
) -> Result<RegpoolResolution> {
    let mut best_map = map;
    let mut best_bmd = bmd;

    for request in requests {
        if let Some(theirs) = request.cluster_map.as_ref().filter(|m| m.version > 0) {
            if let (Some(ours), Some(uuid)) = (uuid_of(best_map), theirs.uuid) {
                if ours != uuid {
                    return Err(BootstrapError::UuidMismatch { local: ours, discovered: uuid });
                }
            }
            if theirs.uuid.is_some() && best_map.version < theirs.version {
                best_map = theirs;
            }
        }
        if let Some(theirs) = request.bucket_md.as_ref().filter(|b| b.version > 0) {
            let ours = best_bmd.uuid.filter(|_| best_bmd.version > 0);
            if let (Some(ours), Some(uuid)) = (ours, theirs.uuid) {
                if ours != uuid {
                    return Err(BootstrapError::SplitBrain {
                        kind: MetaKind::BucketMetadata,
                        detail: format!("{} has UUID {uuid}, expected {ours}", request.node),
                    });
                }
            }
            if best_bmd.version < theirs.version {
                best_bmd = theirs;
            }
        }
    }

    let identity = uuid_of(best_map)
        .map(|uuid| (uuid, best_map.created_at.unwrap_or_else(Utc::now)));
    let bucket_md = (best_bmd.version != bmd.version || best_bmd.uuid != bmd.uuid)
        .then(|| best_bmd.clone());
    if let Some(new) = &bucket_md {
        info!(local = %bmd, registered = %new, "Adopting registered bucket metadata");
    }
    Ok(RegpoolResolution { identity, bucket_md, max_version: best_map.version })
}

fn uuid_of(map: &ClusterMap) -> Option<Uuid> {
    map.uuid.filter(|_| map.version > 0)
}
