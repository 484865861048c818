//! Ownership of versioned metadata documents.
//!
//! Each document kind has one [`MetadataOwner`]. Readers get a lock-free
//! `Arc` snapshot; writers take the exclusive owner lock, clone the current
//! document, mutate the clone and replace it. A published document is never
//! mutated in place.

use std::sync::Arc;

use parking_lot::RwLock;
use rucket_core::meta::{
    BucketMetadata, ClusterMap, ClusterMetaSnapshot, GlobalConfig, RebalanceMetadata,
};
use rucket_core::Versioned;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::error::{BootstrapError, Result};
use crate::store::{MetaStore, MetaStoreExt};

/// Single owner of one document kind.
#[derive(Debug)]
pub struct MetadataOwner<T: Versioned> {
    current: RwLock<Arc<T>>,
    lock: Mutex<()>,
    store: Arc<dyn MetaStore>,
}

impl<T: Versioned> MetadataOwner<T> {
    /// Creates an owner holding the unset document.
    #[must_use]
    pub fn new(store: Arc<dyn MetaStore>) -> Self {
        Self { current: RwLock::new(Arc::new(T::default())), lock: Mutex::new(()), store }
    }

    /// Current snapshot. Never blocks on the owner lock.
    #[must_use]
    pub fn get(&self) -> Arc<T> {
        self.current.read().clone()
    }

    /// Reads the persisted copy without publishing it.
    ///
    /// The store is read on the blocking pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored copy cannot be read or decoded.
    pub async fn load(&self) -> rucket_core::Result<Option<T>> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.load::<T>())
            .await
            .map_err(|e| rucket_core::Error::Io(std::io::Error::other(e)))?
    }

    /// Acquires the exclusive lock.
    pub async fn lock(&self) -> OwnerGuard<'_, T> {
        OwnerGuard { owner: self, _guard: self.lock.lock().await }
    }

    /// Clones the current document, applies `f`, bumps the version, then
    /// publishes and persists the result under the lock.
    ///
    /// # Errors
    ///
    /// Returns the error from `f`, or a persist error.
    pub async fn modify<F>(&self, f: F) -> Result<Arc<T>>
    where
        F: FnOnce(&mut T) -> Result<()>,
    {
        let guard = self.lock().await;
        let mut clone = (*guard.get()).clone();
        f(&mut clone)?;
        clone.set_version(clone.version() + 1);
        guard.put_persist(clone).await
    }

    fn publish(&self, doc: T) -> Arc<T> {
        let doc = Arc::new(doc);
        *self.current.write() = doc.clone();
        doc
    }
}

/// Exclusive access to a [`MetadataOwner`].
#[derive(Debug)]
pub struct OwnerGuard<'a, T: Versioned> {
    owner: &'a MetadataOwner<T>,
    _guard: MutexGuard<'a, ()>,
}

impl<T: Versioned> OwnerGuard<'_, T> {
    /// Current snapshot.
    #[must_use]
    pub fn get(&self) -> Arc<T> {
        self.owner.get()
    }

    /// Publishes `doc` in memory.
    pub fn put(&self, doc: T) -> Arc<T> {
        debug!(kind = %T::KIND, version = doc.version(), "Publishing metadata");
        self.owner.publish(doc)
    }

    /// Persists `doc` to the local store.
    ///
    /// The document is encoded here and written on the blocking pool while
    /// the owner lock stays held.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::Persist`] on storage failure.
    pub async fn persist(&self, doc: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(doc)
            .map_err(|e| BootstrapError::persist(T::KIND, e.into()))?;
        let store = Arc::clone(&self.owner.store);
        tokio::task::spawn_blocking(move || store.write(T::KIND, &bytes))
            .await
            .map_err(|e| BootstrapError::Task(e.to_string()))?
            .map_err(|e| BootstrapError::persist(T::KIND, e))
    }

    /// Persists `doc` and then publishes it.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::Persist`] on storage failure; nothing is
    /// published in that case.
    pub async fn put_persist(&self, doc: T) -> Result<Arc<T>> {
        self.persist(&doc).await?;
        Ok(self.put(doc))
    }
}

/// The four owners held by every gateway.
#[derive(Debug)]
pub struct MetaOwners {
    /// Cluster map owner.
    pub cluster_map: MetadataOwner<ClusterMap>,
    /// Bucket metadata owner.
    pub bucket_md: MetadataOwner<BucketMetadata>,
    /// Rebalance metadata owner.
    pub rebalance_md: MetadataOwner<RebalanceMetadata>,
    /// Global config owner.
    pub config: MetadataOwner<GlobalConfig>,
}

impl MetaOwners {
    /// Creates owners backed by `store`.
    #[must_use]
    pub fn new(store: Arc<dyn MetaStore>) -> Self {
        Self {
            cluster_map: MetadataOwner::new(store.clone()),
            bucket_md: MetadataOwner::new(store.clone()),
            rebalance_md: MetadataOwner::new(store.clone()),
            config: MetadataOwner::new(store),
        }
    }

    /// Snapshot of all four documents, as answered to discovery queries.
    #[must_use]
    pub fn snapshot(&self, vote_in_progress: bool) -> ClusterMetaSnapshot {
        ClusterMetaSnapshot::from_docs(
            (*self.cluster_map.get()).clone(),
            (*self.bucket_md.get()).clone(),
            (*self.rebalance_md.get()).clone(),
            (*self.config.get()).clone(),
            vote_in_progress,
        )
    }
}

#[cfg(test)]
mod tests {
    use rucket_core::MetaKind;

    use crate::store::{FileMetaStore, MemoryMetaStore};

    use super::*;

    fn owner<T: Versioned>() -> (Arc<MemoryMetaStore>, MetadataOwner<T>) {
        let store = Arc::new(MemoryMetaStore::new());
        let owner = MetadataOwner::new(store.clone() as Arc<dyn MetaStore>);
        (store, owner)
    }

    #[tokio::test]
    async fn test_modify_bumps_version_and_persists() {
        let (store, owner) = owner::<BucketMetadata>();
        let before = owner.get();

        let after = owner
            .modify(|bmd| {
                bmd.uuid = Some(uuid::Uuid::new_v4());
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(before.version, 0);
        assert!(before.uuid.is_none());
        assert_eq!(after.version, 1);
        assert_eq!(store.load::<BucketMetadata>().unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_failed_modify_leaves_document_untouched() {
        let (_store, owner) = owner::<RebalanceMetadata>();
        let result = owner.modify(|_| Err(BootstrapError::Config("nope".into()))).await;
        assert!(result.is_err());
        assert_eq!(owner.get().version, 0);
    }

    #[tokio::test]
    async fn test_persist_failure_does_not_publish() {
        let (store, owner) = owner::<GlobalConfig>();
        store.fail_writes(true);

        let guard = owner.lock().await;
        let mut cfg = (*guard.get()).clone();
        cfg.version = 4;
        let err = guard.put_persist(cfg).await.unwrap_err();

        assert!(matches!(err, BootstrapError::Persist { .. }));
        assert!(err.is_fatal());
        assert_eq!(owner.get().version, 0);
    }

    #[tokio::test]
    async fn test_file_backed_owner_writes_off_the_runtime() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(FileMetaStore::open(dir.path()).unwrap());
        let owner = MetadataOwner::<RebalanceMetadata>::new(store.clone() as Arc<dyn MetaStore>);

        let guard = owner.lock().await;
        let rmd = RebalanceMetadata { version: 3, enabled: true, interrupted: true };
        guard.put_persist(rmd).await.unwrap();
        drop(guard);

        assert!(store.path_of(MetaKind::RebalanceMetadata).exists());
        let loaded = owner.load().await.unwrap().unwrap();
        assert_eq!(loaded.version, 3);
        assert!(loaded.interrupted);
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let (_store, owner) = owner::<BucketMetadata>();
        let owner = Arc::new(owner);
        let guard = owner.lock().await;

        let contender = {
            let owner = owner.clone();
            tokio::spawn(async move {
                let guard = owner.lock().await;
                guard.get().version
            })
        };
        tokio::task::yield_now().await;
        let mut bmd = (*guard.get()).clone();
        bmd.version = 9;
        guard.put(bmd);
        drop(guard);

        assert_eq!(contender.await.unwrap(), 9);
    }
}
