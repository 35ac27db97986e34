//! Error types for cache operations.

use std::{io, path::PathBuf};

/// Errors surfaced by the cache.
///
/// [`CacheError::NotFound`] is the expected cache miss and drives fallback
/// computation in callers; everything else should abort the enclosing
/// operation.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// No metadata record exists for the fingerprint.
    #[error("no cache entry for fingerprint {fingerprint}")]
    NotFound { fingerprint: String },

    /// A declared source file could not be stat'd, opened or read.
    #[error("source {} unavailable ({action}): {source}", path.display())]
    SourceUnavailable {
        path: PathBuf,
        action: &'static str,
        source: io::Error,
    },

    /// A metadata record exists but cannot be decoded.
    #[error("corrupt metadata record {}: {reason}", path.display())]
    CorruptMetadata { path: PathBuf, reason: String },

    /// Moving a staged blob into place (or sealing it read-only) failed.
    #[error("failed to publish {} as {}: {source}", from.display(), to.display())]
    PublishFailed {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },

    /// Names starting with `_` are reserved for the cache itself.
    #[error("invalid value name {name:?}: names must be non-empty and not start with '_'")]
    InvalidKeyName { name: String },

    /// A `write_with` producer failed to create its output.
    #[error("producer failed writing {}: {source}", path.display())]
    Producer { path: PathBuf, source: io::Error },

    /// A write into the staging file failed partway; its content no longer
    /// matches the running hash and it will not be published.
    #[error("staged content at {} is incomplete after a failed write", path.display())]
    IncompleteWrite { path: PathBuf },

    #[error("{value:?} is not a {algorithm} digest")]
    InvalidDigest {
        value: String,
        algorithm: &'static str,
    },

    /// A stored blob no longer hashes to its own name.
    #[error("blob {} does not match its name (content hashes to {actual})", path.display())]
    BlobMismatch { path: PathBuf, actual: String },

    #[error("{action} failed for {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        source: io::Error,
    },

    #[error("failed to encode metadata: {reason}")]
    Serialization { reason: String },

    /// A named value exists but holds a different kind than requested.
    #[error("value {name:?} is {actual}, expected {expected}")]
    ValueKind {
        name: String,
        expected: &'static str,
        actual: String,
    },

    #[error("extension value {kind:?}: {reason}")]
    Extension { kind: String, reason: String },

    #[error("invalid configuration {}: {reason}", path.display())]
    Config { path: PathBuf, reason: String },
}

impl CacheError {
    /// Returns `true` for an ordinary cache miss.
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Builds a mapper that attaches the attempted action and path to an I/O error.
    pub(crate) fn io<P: Into<PathBuf>>(
        action: &'static str,
        path: P,
    ) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io {
            action,
            path,
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_distinguishable() {
        let miss = CacheError::NotFound {
            fingerprint: "abc".to_owned(),
        };
        assert!(miss.is_not_found());

        let corrupt = CacheError::CorruptMetadata {
            path: PathBuf::from("/cache/metadata/abc"),
            reason: "truncated".to_owned(),
        };
        assert!(!corrupt.is_not_found());
    }

    #[test]
    fn io_error_keeps_context() {
        let err = CacheError::io("create blob dir", "/cache/files")(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "denied",
        ));
        let msg = err.to_string();
        assert!(msg.contains("create blob dir"));
        assert!(msg.contains("/cache/files"));
        assert!(msg.contains("denied"));
    }

    #[test]
    fn source_unavailable_names_the_action() {
        let err = CacheError::SourceUnavailable {
            path: PathBuf::from("a.src"),
            action: "stat",
            source: io::Error::new(io::ErrorKind::NotFound, "missing"),
        };
        let msg = err.to_string();
        assert!(msg.contains("a.src"));
        assert!(msg.contains("stat"));
    }
}
