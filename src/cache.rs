//! Cache root
//!
//! A cache root holds two areas: `files/` for content-addressed blobs and
//! `metadata/` for one record per fingerprint. [`Cache`] owns both and hands
//! out [`CacheEntry`] handles.
use crate::{
    config::CacheConfig,
    entry::CacheEntry,
    error::{CacheError, Result},
    hash::HashAlgorithm,
    key::CacheKey,
    metadata::MetadataStore,
    store::{BlobStore, create_private_dir_all},
};
use std::path::{Path, PathBuf};

pub const FILES_DIR: &str = "files";
pub const METADATA_DIR: &str = "metadata";

#[derive(Debug, Clone)]
pub struct Cache {
    root: PathBuf,
    algorithm: HashAlgorithm,
    blobs: BlobStore,
    metadata: MetadataStore,
}

impl Cache {
    /// Opens the cache at `root`, creating both areas if needed.
    pub fn open<P: Into<PathBuf>>(root: P, algorithm: HashAlgorithm) -> Result<Self> {
        let root = root.into();
        let files = root.join(FILES_DIR);
        let metadata = root.join(METADATA_DIR);
        create_private_dir_all(&files)?;
        create_private_dir_all(&metadata)?;

        tracing::debug!(?root, %algorithm, "Opened cache");
        Ok(Self {
            blobs: BlobStore::new(files, algorithm),
            metadata: MetadataStore::new(metadata),
            root,
            algorithm,
        })
    }

    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        Self::open(&config.root, config.algorithm)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub const fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub const fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub const fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    /// Builds a key for `operation` over `sources` with this cache's algorithm.
    pub fn key<P: AsRef<Path>>(&self, operation: &str, sources: &[P]) -> Result<CacheKey> {
        CacheKey::build(operation, sources, self.algorithm)
    }

    /// Loads the entry recorded for `key`.
    ///
    /// # Errors
    ///
    /// [`CacheError::NotFound`] on a miss, [`CacheError::CorruptMetadata`] if
    /// the record cannot be decoded.
    pub fn lookup(&self, key: CacheKey) -> Result<CacheEntry> {
        match self.metadata.load(key.fingerprint()) {
            Ok(record) => {
                tracing::debug!(fingerprint = key.fingerprint(), "Cache hit");
                Ok(CacheEntry::from_record(
                    key,
                    self.blobs.clone(),
                    self.metadata.clone(),
                    record,
                ))
            }
            Err(e) => {
                if e.is_not_found() {
                    tracing::debug!(fingerprint = key.fingerprint(), "Cache miss");
                }
                Err(e)
            }
        }
    }

    /// Loads the entry for `key`, or a fresh one on a miss.
    ///
    /// A corrupt record counts as a miss and is replaced on the next save.
    pub fn entry(&self, key: CacheKey) -> Result<CacheEntry> {
        let fingerprint = key.fingerprint().to_owned();
        match self.lookup(key.clone()) {
            Ok(entry) => Ok(entry),
            Err(CacheError::NotFound { .. }) => Ok(self.fresh(key)),
            Err(CacheError::CorruptMetadata { path, reason }) => {
                tracing::warn!(%fingerprint, ?path, %reason, "Ignoring corrupt metadata record");
                Ok(self.fresh(key))
            }
            Err(e) => Err(e),
        }
    }

    fn fresh(&self, key: CacheKey) -> CacheEntry {
        CacheEntry::fresh(key, self.blobs.clone(), self.metadata.clone())
    }
}
