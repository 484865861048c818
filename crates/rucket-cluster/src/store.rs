//! Local persistence of metadata documents.
//!
//! Each kind is stored as a single JSON document. [`FileMetaStore`] writes
//! atomically through a temp file and rename, so a crash leaves either the
//! previous or the new copy on disk.
//!
//! Stores are synchronous; [`MetadataOwner`](crate::owner::MetadataOwner)
//! calls them on the blocking pool.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rucket_core::{Error, MetaKind, Result, Versioned};

/// Raw storage of serialized metadata documents.
pub trait MetaStore: Send + Sync + std::fmt::Debug {
    /// Reads the stored bytes of `kind`, if any.
    fn read(&self, kind: MetaKind) -> Result<Option<Vec<u8>>>;

    /// Replaces the stored bytes of `kind`.
    fn write(&self, kind: MetaKind, bytes: &[u8]) -> Result<()>;
}

/// Typed access on top of [`MetaStore`].
pub trait MetaStoreExt: MetaStore {
    /// Loads a document. `Ok(None)` means nothing was stored yet.
    fn load<T: Versioned>(&self) -> Result<Option<T>> {
        match self.read(T::KIND)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Serializes and stores a document.
    fn save<T: Versioned>(&self, doc: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(doc)?;
        self.write(T::KIND, &bytes)
    }
}

impl<S: MetaStore + ?Sized> MetaStoreExt for S {}

/// In-memory store for tests and simulations.
#[derive(Debug, Default)]
pub struct MemoryMetaStore {
    docs: Mutex<HashMap<MetaKind, Vec<u8>>>,
    fail_writes: Mutex<bool>,
}

impl MemoryMetaStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail.
    pub fn fail_writes(&self, fail: bool) {
        *self.fail_writes.lock() = fail;
    }
}

impl MetaStore for MemoryMetaStore {
    fn read(&self, kind: MetaKind) -> Result<Option<Vec<u8>>> {
        Ok(self.docs.lock().get(&kind).cloned())
    }

    fn write(&self, kind: MetaKind, bytes: &[u8]) -> Result<()> {
        if *self.fail_writes.lock() {
            return Err(Error::Io(std::io::Error::other("writes disabled")));
        }
        self.docs.lock().insert(kind, bytes.to_vec());
        Ok(())
    }
}

/// Directory-backed store.
#[derive(Debug, Clone)]
pub struct FileMetaStore {
    dir: PathBuf,
}

impl FileMetaStore {
    /// Opens (and creates if needed) a store rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// The root directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file holding `kind`.
    #[must_use]
    pub fn path_of(&self, kind: MetaKind) -> PathBuf {
        self.dir.join(file_name(kind))
    }
}

fn file_name(kind: MetaKind) -> &'static str {
    match kind {
        MetaKind::ClusterMap => "cluster_map.json",
        MetaKind::BucketMetadata => "bucket_md.json",
        MetaKind::RebalanceMetadata => "rebalance_md.json",
        MetaKind::GlobalConfig => "global_config.json",
    }
}

impl MetaStore for FileMetaStore {
    fn read(&self, kind: MetaKind) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_of(kind)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, kind: MetaKind, bytes: &[u8]) -> Result<()> {
        let path = self.path_of(kind);
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}
