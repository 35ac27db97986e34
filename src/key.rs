//! Fingerprint keys
//!
//! A [`CacheKey`] captures an operation name plus a descriptor of every source
//! it reads. Descriptors carry both filesystem metadata (size, mode, mtime) and
//! a content hash; all of it goes into the fingerprint, so touching a source
//! invalidates the key even when its content is unchanged.
use crate::{
    error::{CacheError, Result},
    hash::{HashAlgorithm, Hasher},
};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    os::unix::fs::MetadataExt,
    path::Path,
    sync::OnceLock,
};

/// Leading tag of the fingerprint encoding. Bump when the layout changes.
const KEY_ENCODING_TAG: &[u8] = b"artcache-key-v1\0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    /// Source path as given by the caller
    pub path: String,
    pub size: u64,
    /// Full `st_mode`, including the file type bits
    pub mode: u32,
    pub modified: chrono::DateTime<chrono::Utc>,
    /// Hex content hash
    pub hash: String,
}

impl SourceDescriptor {
    /// Stats `path` and streams its content through `algorithm`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::SourceUnavailable`] if the file cannot be stat'd,
    /// opened or read.
    #[tracing::instrument(level = "trace", skip(algorithm))]
    pub fn from_path(path: &Path, algorithm: HashAlgorithm) -> Result<Self> {
        let unavailable = |action| {
            move |source| CacheError::SourceUnavailable {
                path: path.to_path_buf(),
                action,
                source,
            }
        };

        let metadata = std::fs::metadata(path).map_err(unavailable("stat"))?;
        let modified = metadata.modified().map_err(unavailable("stat"))?;
        let file = File::open(path).map_err(unavailable("open"))?;
        let hash = algorithm.hash_reader(file).map_err(unavailable("read"))?;

        tracing::trace!(
            ?path,
            size = metadata.len(),
            mode = format!("{:o}", metadata.mode()),
            %hash,
            "Described source"
        );

        Ok(Self {
            path: path.to_string_lossy().into_owned(),
            size: metadata.len(),
            mode: metadata.mode(),
            modified: modified.into(),
            hash,
        })
    }

    fn feed(&self, hasher: &mut Hasher) {
        update_str(hasher, &self.path);
        hasher.update(&self.size.to_le_bytes());
        hasher.update(&self.mode.to_le_bytes());
        hasher.update(&self.modified.timestamp().to_le_bytes());
        hasher.update(&self.modified.timestamp_subsec_nanos().to_le_bytes());
        update_str(hasher, &self.hash);
    }
}

/// Length-prefixed so adjacent strings cannot run into each other.
fn update_str(hasher: &mut Hasher, s: &str) {
    hasher.update(&(s.len() as u64).to_le_bytes());
    hasher.update(s.as_bytes());
}

/// Cache lookup key: an operation plus its ordered source descriptors.
///
/// Immutable after construction apart from the memoized fingerprint.
#[derive(Debug, Clone)]
pub struct CacheKey {
    operation: String,
    sources: Vec<SourceDescriptor>,
    algorithm: HashAlgorithm,
    fingerprint: OnceLock<String>,
}

impl CacheKey {
    /// Describes each source in order and builds the key.
    ///
    /// # Arguments
    /// * `operation` - Tag naming what is computed from the sources
    /// * `sources` - Source files, in the order the operation reads them
    /// * `algorithm` - Hash used for source content and for the fingerprint
    pub fn build<P: AsRef<Path>>(
        operation: &str,
        sources: &[P],
        algorithm: HashAlgorithm,
    ) -> Result<Self> {
        let descriptors = sources
            .iter()
            .map(|src| SourceDescriptor::from_path(src.as_ref(), algorithm))
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(operation, sources = descriptors.len(), "Built cache key");
        Ok(Self::from_descriptors(operation, descriptors, algorithm))
    }

    /// Builds a key from descriptors the caller already has.
    pub fn from_descriptors(
        operation: &str,
        sources: Vec<SourceDescriptor>,
        algorithm: HashAlgorithm,
    ) -> Self {
        Self {
            operation: operation.to_owned(),
            sources,
            algorithm,
            fingerprint: OnceLock::new(),
        }
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn sources(&self) -> &[SourceDescriptor] {
        &self.sources
    }

    pub const fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Hex fingerprint of the operation and every source descriptor.
    ///
    /// Computed on first use and memoized.
    pub fn fingerprint(&self) -> &str {
        self.fingerprint.get_or_init(|| {
            let mut hasher = self.algorithm.hasher();
            hasher.update(KEY_ENCODING_TAG);
            update_str(&mut hasher, self.algorithm.name());
            update_str(&mut hasher, &self.operation);
            hasher.update(&(self.sources.len() as u64).to_le_bytes());
            for source in &self.sources {
                source.feed(&mut hasher);
            }
            hasher.finalize_hex()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, os::unix::fs::PermissionsExt, time::Duration};
    use tempfile::TempDir;

    fn write_source(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    fn key_for(path: &Path) -> CacheKey {
        CacheKey::build("compile", &[path], HashAlgorithm::Sha256).unwrap()
    }

    #[test]
    fn test_descriptor_captures_stat_and_hash() {
        let dir = TempDir::new().unwrap();
        let src = write_source(&dir, "a.src", "ABC");

        let desc = SourceDescriptor::from_path(&src, HashAlgorithm::Sha256).unwrap();
        assert_eq!(desc.size, 3);
        assert_eq!(desc.hash, HashAlgorithm::Sha256.hash_bytes(b"ABC"));
        assert_eq!(desc.path, src.to_string_lossy());
        assert_eq!(desc.mode, fs::metadata(&src).unwrap().mode());
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let src = write_source(&dir, "a.src", "ABC");

        let first = key_for(&src);
        let second = key_for(&src);
        assert_eq!(first.fingerprint(), second.fingerprint());
        // memoized value is stable too
        assert_eq!(first.fingerprint(), first.fingerprint());
        assert!(HashAlgorithm::Sha256.is_digest(first.fingerprint()));
    }

    #[test]
    fn test_fingerprint_changes_with_content() {
        let dir = TempDir::new().unwrap();
        let src = write_source(&dir, "a.src", "ABC");
        let mtime = fs::metadata(&src).unwrap().modified().unwrap();
        let before = key_for(&src);

        // same size, same mtime, different bytes
        fs::write(&src, "XYZ").unwrap();
        File::options()
            .write(true)
            .open(&src)
            .unwrap()
            .set_modified(mtime)
            .unwrap();

        assert_ne!(before.fingerprint(), key_for(&src).fingerprint());
    }

    #[test]
    fn test_fingerprint_changes_with_size() {
        let dir = TempDir::new().unwrap();
        let src = write_source(&dir, "a.src", "ABC");
        let before = key_for(&src);
        let mut desc = before.sources()[0].clone();
        desc.size += 1;
        let after = CacheKey::from_descriptors("compile", vec![desc], HashAlgorithm::Sha256);
        assert_ne!(before.fingerprint(), after.fingerprint());
    }

    #[test]
    fn test_fingerprint_changes_with_mode() {
        let dir = TempDir::new().unwrap();
        let src = write_source(&dir, "a.src", "ABC");
        fs::set_permissions(&src, fs::Permissions::from_mode(0o644)).unwrap();
        let before = key_for(&src);

        fs::set_permissions(&src, fs::Permissions::from_mode(0o600)).unwrap();
        assert_ne!(before.fingerprint(), key_for(&src).fingerprint());
    }

    #[test]
    fn test_fingerprint_changes_with_mtime() {
        let dir = TempDir::new().unwrap();
        let src = write_source(&dir, "a.src", "ABC");
        let before = key_for(&src);

        let mtime = fs::metadata(&src).unwrap().modified().unwrap();
        File::options()
            .write(true)
            .open(&src)
            .unwrap()
            .set_modified(mtime + Duration::from_secs(10))
            .unwrap();

        let after = key_for(&src);
        assert_eq!(before.sources()[0].hash, after.sources()[0].hash);
        assert_ne!(before.fingerprint(), after.fingerprint());
    }

    #[test]
    fn test_fingerprint_changes_with_operation_and_order() {
        let dir = TempDir::new().unwrap();
        let a = write_source(&dir, "a.src", "A");
        let b = write_source(&dir, "b.src", "B");

        let ab = CacheKey::build("compile", &[&a, &b], HashAlgorithm::Sha256).unwrap();
        let ba = CacheKey::build("compile", &[&b, &a], HashAlgorithm::Sha256).unwrap();
        let link = CacheKey::build("link", &[&a, &b], HashAlgorithm::Sha256).unwrap();

        assert_ne!(ab.fingerprint(), ba.fingerprint());
        assert_ne!(ab.fingerprint(), link.fingerprint());
    }

    #[test]
    fn test_fingerprint_depends_on_algorithm() {
        let dir = TempDir::new().unwrap();
        let src = write_source(&dir, "a.src", "ABC");

        let sha256 = CacheKey::build("compile", &[&src], HashAlgorithm::Sha256).unwrap();
        let sha512 = CacheKey::build("compile", &[&src], HashAlgorithm::Sha512).unwrap();
        assert_eq!(sha512.fingerprint().len(), 128);
        assert_ne!(sha256.fingerprint(), &sha512.fingerprint()[..64]);
    }

    #[test]
    fn test_missing_source_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope.src");

        let err = CacheKey::build("compile", &[&missing], HashAlgorithm::Sha256).unwrap_err();
        match err {
            CacheError::SourceUnavailable { path, action, .. } => {
                assert_eq!(path, missing);
                assert_eq!(action, "stat");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_no_sources_is_valid() {
        let empty: [&Path; 0] = [];
        let key = CacheKey::build("noop", &empty, HashAlgorithm::Sha256).unwrap();
        assert!(key.sources().is_empty());
        assert_eq!(key.operation(), "noop");
        assert!(!key.fingerprint().is_empty());
    }
}
