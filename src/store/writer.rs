use super::BlobStore;
use crate::{
    error::{CacheError, Result},
    hash::Hasher,
};
use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::Path,
};
use tempfile::TempPath;

/// Staged content for one entry plus the running hash of every byte in it.
///
/// The staging file is owned by a [`TempPath`], so it is removed on every
/// path out of the writer except [`BlobWriter::publish`].
#[derive(Debug)]
pub struct BlobWriter {
    path: TempPath,
    /// Open handle for streamed writes; `None` after a producer wrote the file
    file: Option<File>,
    hasher: Hasher,
    written: bool,
    /// Set when a write failed partway; the file and hash may disagree
    poisoned: bool,
}

impl BlobWriter {
    /// Opens a new staging file in `store`.
    pub fn create(store: &BlobStore) -> Result<Self> {
        let (file, path) = store.stage()?.into_parts();
        Ok(Self {
            path,
            file: Some(file),
            hasher: store.algorithm().hasher(),
            written: false,
            poisoned: false,
        })
    }

    /// Lets `producer` create the staged file itself, then hashes it.
    ///
    /// The producer gets a path that does not exist yet. If it returns without
    /// creating a file, the writer reports nothing written and publishing it
    /// is a no-op.
    pub fn produce<F>(store: &BlobStore, producer: F) -> Result<Self>
    where
        F: FnOnce(&Path) -> io::Result<()>,
    {
        let (file, path) = store.stage()?.into_parts();
        drop(file);
        std::fs::remove_file(&path).map_err(CacheError::io("clear staging file", &*path))?;

        producer(&path).map_err(|source| CacheError::Producer {
            path: path.to_path_buf(),
            source,
        })?;

        let mut writer = Self {
            path,
            file: None,
            hasher: store.algorithm().hasher(),
            written: false,
            poisoned: false,
        };

        let mut produced = match File::open(&writer.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("Producer created no output");
                return Ok(writer);
            }
            Err(e) => return Err(CacheError::io("open produced file", &*writer.path)(e)),
        };

        io::copy(&mut produced, &mut writer.hasher)
            .map_err(CacheError::io("hash produced file", &*writer.path))?;
        writer.written = true;
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub const fn has_written(&self) -> bool {
        self.written
    }

    /// Appends `buf` to the staged file and the hash.
    ///
    /// A failed write poisons the writer: later appends and [`Self::publish`]
    /// fail with [`CacheError::IncompleteWrite`].
    pub fn append(&mut self, buf: &[u8]) -> Result<()> {
        if self.poisoned {
            return Err(self.incomplete());
        }

        let file = match self.file.take() {
            Some(file) => file,
            None => OpenOptions::new()
                .append(true)
                .create(true)
                .open(&self.path)
                .map_err(CacheError::io("reopen staging file", &*self.path))?,
        };
        let file = self.file.insert(file);

        if let Err(e) = file.write_all(buf) {
            self.poisoned = true;
            return Err(CacheError::io("write staging file", &*self.path)(e));
        }
        self.hasher.update(buf);
        self.written = true;
        Ok(())
    }

    /// Publishes the staged content and returns its hash.
    ///
    /// Returns `Ok(None)` and removes the staging file if nothing was written.
    /// A poisoned writer is discarded instead of published.
    pub fn publish(self, store: &BlobStore) -> Result<Option<String>> {
        if self.poisoned {
            let err = self.incomplete();
            self.discard()
                .map_err(CacheError::io("remove staging file", store.dir()))?;
            return Err(err);
        }

        if !self.written {
            self.discard()
                .map_err(CacheError::io("remove staging file", store.dir()))?;
            return Ok(None);
        }

        let Self {
            path, file, hasher, ..
        } = self;

        if let Some(file) = file {
            file.sync_all()
                .map_err(CacheError::io("sync staging file", &*path))?;
        }

        let hash = hasher.finalize_hex();
        store.publish(path, &hash)?;
        Ok(Some(hash))
    }

    pub const fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    fn incomplete(&self) -> CacheError {
        CacheError::IncompleteWrite {
            path: self.path.to_path_buf(),
        }
    }

    /// Drops the staged content.
    pub fn discard(self) -> io::Result<()> {
        drop(self.file);
        match self.path.close() {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_failed_append_poisons_writer() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::new(dir.path(), crate::hash::HashAlgorithm::Sha256);

        let mut writer = BlobWriter::create(&store).unwrap();
        writer.append(b"head").unwrap();

        // a read-only handle makes the next write fail
        writer.file = Some(File::open(&writer.path).unwrap());
        assert!(matches!(
            writer.append(b"tail"),
            Err(CacheError::Io { .. })
        ));
        assert!(writer.is_poisoned());
        assert!(matches!(
            writer.append(b"more"),
            Err(CacheError::IncompleteWrite { .. })
        ));

        let staged = writer.path().to_path_buf();
        assert!(matches!(
            writer.publish(&store),
            Err(CacheError::IncompleteWrite { .. })
        ));
        assert!(!staged.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
