//! Content store
//!
//! Blobs live at `files/<hash>` where `<hash>` is the digest of the blob's own
//! bytes. New content is staged in a uniquely named temp file next to the
//! blobs and published with a single rename, after which the blob is sealed
//! read-only. Two writers racing on identical content converge on the same
//! name with the same bytes.
mod writer;

pub use writer::BlobWriter;

use crate::{
    error::{CacheError, Result},
    hash::HashAlgorithm,
};
use std::{
    fs::{self, DirBuilder, File},
    io,
    os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt},
    path::{Path, PathBuf},
};
use tempfile::{NamedTempFile, TempPath};

/// Mode of a published blob.
pub const BLOB_MODE: u32 = 0o400;

/// How a blob ended up at an install destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// The destination already was this blob
    AlreadyPresent,
    HardLink,
    /// Hard linking failed (e.g. across devices)
    Symlink,
}

#[derive(Debug, Clone)]
pub struct BlobStore {
    dir: PathBuf,
    algorithm: HashAlgorithm,
}

impl BlobStore {
    /// Staging files use a prefix that can never be a hex digest.
    const TEMP_PREFIX: &'static str = ".tmp-data-";
    /// Links are staged next to the destination before replacing it.
    const LINK_PREFIX: &'static str = ".tmp-link-";

    pub fn new<P: Into<PathBuf>>(dir: P, algorithm: HashAlgorithm) -> Self {
        Self {
            dir: dir.into(),
            algorithm,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub const fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn blob_path(&self, hash: &str) -> PathBuf {
        self.dir.join(hash)
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.blob_path(hash).is_file()
    }

    /// Creates a fresh staging file in the blob area.
    ///
    /// The file is removed when the returned handle is dropped unless it is
    /// published first.
    pub fn stage(&self) -> Result<NamedTempFile> {
        let temp = tempfile::Builder::new()
            .prefix(Self::TEMP_PREFIX)
            .tempfile_in(&self.dir)
            .map_err(CacheError::io("create staging file", &self.dir))?;
        tracing::trace!(path = ?temp.path(), "Staged blob file");
        Ok(temp)
    }

    /// Moves a staged file to `files/<hash>` and seals it read-only.
    ///
    /// The caller guarantees that `hash` is the digest of the staged bytes.
    #[tracing::instrument(level = "debug", skip(self, staged))]
    pub fn publish(&self, staged: TempPath, hash: &str) -> Result<PathBuf> {
        let target = self.blob_path(hash);
        let from = staged.to_path_buf();

        if target.exists() {
            tracing::debug!(%hash, "Blob already present, replacing with identical content");
        }

        staged.persist(&target).map_err(|e| CacheError::PublishFailed {
            from: from.clone(),
            to: target.clone(),
            source: e.error,
        })?;

        fs::set_permissions(&target, fs::Permissions::from_mode(BLOB_MODE)).map_err(|source| {
            CacheError::PublishFailed {
                from,
                to: target.clone(),
                source,
            }
        })?;

        tracing::debug!(%hash, path = ?target, "Published blob");
        Ok(target)
    }

    /// Re-hashes a stored blob and checks it against its name.
    pub fn verify(&self, hash: &str) -> Result<bool> {
        match self.check(hash) {
            Ok(()) => Ok(true),
            Err(CacheError::BlobMismatch { actual, .. }) => {
                tracing::warn!(expected = %hash, %actual, "Blob content does not match its name");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Like [`Self::verify`], but a mismatch is an error.
    pub fn check(&self, hash: &str) -> Result<()> {
        let path = self.blob_path(hash);
        let file = File::open(&path).map_err(CacheError::io("open blob", &path))?;
        let actual = self
            .algorithm
            .hash_reader(file)
            .map_err(CacheError::io("read blob", &path))?;

        if actual == hash {
            Ok(())
        } else {
            Err(CacheError::BlobMismatch { path, actual })
        }
    }

    /// Links the blob `hash` to `dest`.
    ///
    /// Tries a hard link first and falls back to an absolute symlink. A
    /// destination that already resolves to the blob is left alone; anything
    /// else at `dest` is replaced by renaming the new link over it, so a
    /// failed install leaves the old file in place.
    pub fn link_into(&self, hash: &str, dest: &Path) -> Result<LinkKind> {
        self.link_into_with(hash, dest, |blob, link| fs::hard_link(blob, link))
    }

    fn link_into_with<H>(&self, hash: &str, dest: &Path, hard_link: H) -> Result<LinkKind>
    where
        H: Fn(&Path, &Path) -> io::Result<()>,
    {
        let blob = self.blob_path(hash);

        let parent = match dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(parent) => {
                create_private_dir_all(parent)?;
                parent
            }
            None => Path::new("."),
        };

        if same_file(&blob, dest) {
            tracing::debug!(?dest, %hash, "Destination already holds blob");
            return Ok(LinkKind::AlreadyPresent);
        }

        let staged = Self::link_builder().make_in(parent, |link| hard_link(&blob, link));
        let (staged, kind) = match staged {
            Ok(staged) => (staged, LinkKind::HardLink),
            Err(e) => {
                let target =
                    fs::canonicalize(&blob).map_err(CacheError::io("resolve blob", &blob))?;
                tracing::warn!(
                    ?dest,
                    error = %e,
                    "Hard link failed, falling back to symlink"
                );
                let staged = Self::link_builder()
                    .make_in(parent, |link| std::os::unix::fs::symlink(&target, link))
                    .map_err(CacheError::io("symlink blob", parent))?;
                (staged, LinkKind::Symlink)
            }
        };

        staged.persist(dest).map_err(|e| CacheError::Io {
            action: "replace destination",
            path: dest.to_path_buf(),
            source: e.error,
        })?;

        tracing::debug!(?dest, %hash, ?kind, "Linked blob");
        Ok(kind)
    }

    fn link_builder() -> tempfile::Builder<'static, 'static> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(Self::LINK_PREFIX);
        builder
    }
}

/// `true` if both paths resolve to the same inode.
fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::metadata(a), fs::metadata(b)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
        _ => false,
    }
}

/// Creates `path` and any missing parents with mode `0700`.
pub fn create_private_dir_all(path: &Path) -> Result<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path)
        .map_err(CacheError::io("create directory", path))
}
