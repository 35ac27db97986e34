//! Metadata records
//!
//! Each cache entry persists as one record at `metadata/<fingerprint>`. Records
//! are only ever replaced through a temp file and a rename, so readers see
//! either the previous record or the new one.
use crate::{
    error::{CacheError, Result},
    value::Value,
};
use bincode::{
    Decode, Encode,
    config::{Configuration, Limit, LittleEndian, Varint},
};
use std::{
    collections::BTreeMap,
    io::{self, Write},
    path::{Path, PathBuf},
};

/// Current record format version. Records with any other version are treated
/// as corrupt.
pub const METADATA_FORMAT_VERSION: u32 = 1;

/// Upper bound on bytes a record may claim while decoding. Length prefixes
/// past this are rejected before anything is allocated.
const RECORD_LIMIT: usize = 1 << 24;

const RECORD_CONFIG: Configuration<LittleEndian, Varint, Limit<RECORD_LIMIT>> =
    bincode::config::standard().with_limit::<RECORD_LIMIT>();

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct MetadataRecord {
    pub format_version: u32,
    /// Hash of the published blob, if the entry has content
    pub content_hash: Option<String>,
    pub values: BTreeMap<String, Value>,
}

impl MetadataRecord {
    pub const fn new(content_hash: Option<String>, values: BTreeMap<String, Value>) -> Self {
        Self {
            format_version: METADATA_FORMAT_VERSION,
            content_hash,
            values,
        }
    }
}

/// The metadata area of a cache root.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    dir: PathBuf,
}

impl MetadataStore {
    const TEMP_PREFIX: &'static str = ".tmp-meta-";

    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self, fingerprint: &str) -> PathBuf {
        self.dir.join(fingerprint)
    }

    /// Loads the record stored for `fingerprint`.
    ///
    /// # Errors
    ///
    /// [`CacheError::NotFound`] if there is no record, [`CacheError::CorruptMetadata`]
    /// if it cannot be decoded.
    pub fn load(&self, fingerprint: &str) -> Result<MetadataRecord> {
        let path = self.record_path(fingerprint);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CacheError::NotFound {
                    fingerprint: fingerprint.to_owned(),
                });
            }
            Err(e) => return Err(CacheError::io("read metadata record", path)(e)),
        };

        let corrupt = |reason: String| CacheError::CorruptMetadata {
            path: path.clone(),
            reason,
        };

        let (record, read): (MetadataRecord, usize) =
            bincode::decode_from_slice(&bytes, RECORD_CONFIG)
                .map_err(|e| corrupt(e.to_string()))?;

        if read != bytes.len() {
            return Err(corrupt(format!(
                "{} trailing bytes after record",
                bytes.len() - read
            )));
        }

        if record.format_version != METADATA_FORMAT_VERSION {
            return Err(corrupt(format!(
                "format version {} (expected {METADATA_FORMAT_VERSION})",
                record.format_version
            )));
        }

        Ok(record)
    }

    /// Atomically replaces the record for `fingerprint`.
    pub fn save(&self, fingerprint: &str, record: &MetadataRecord) -> Result<()> {
        let encoded = bincode::encode_to_vec(record, RECORD_CONFIG).map_err(|e| {
            CacheError::Serialization {
                reason: e.to_string(),
            }
        })?;

        let mut temp = tempfile::Builder::new()
            .prefix(Self::TEMP_PREFIX)
            .tempfile_in(&self.dir)
            .map_err(CacheError::io("create metadata temp file", &self.dir))?;

        temp.write_all(&encoded)
            .and_then(|()| temp.as_file().sync_all())
            .map_err(CacheError::io("write metadata temp file", temp.path()))?;

        let path = self.record_path(fingerprint);
        temp.persist(&path).map_err(|e| CacheError::Io {
            action: "rename metadata record",
            path: path.clone(),
            source: e.error,
        })?;

        tracing::debug!(fingerprint, bytes = encoded.len(), "Saved metadata record");
        Ok(())
    }
}
