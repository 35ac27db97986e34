//! Cache entries
//!
//! A [`CacheEntry`] is the handle a caller holds for one fingerprint. On a hit
//! it already carries the published content hash and can be installed at once;
//! on a miss the caller writes content into it, which is published on
//! [`CacheEntry::finalize`] and recorded for later hits on [`CacheEntry::save`].
//!
//! Entries are not meant to be shared between threads while being written;
//! use one entry per call site.
use crate::{
    error::{CacheError, Result},
    key::CacheKey,
    metadata::{MetadataRecord, MetadataStore},
    store::{BlobStore, BlobWriter, LinkKind},
    value::{ExtensionValue, Value},
};
use std::{
    collections::BTreeMap,
    io::{self, Write},
    path::Path,
};

/// Where an entry is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// No content hash and nothing staged
    Fresh,
    /// Content is being staged
    Writing,
    /// Content published (or metadata changed) but not yet persisted
    Finalized,
    /// Persisted state matches the entry
    Saved,
}

#[derive(Debug)]
pub struct CacheEntry {
    key: CacheKey,
    blobs: BlobStore,
    metadata: MetadataStore,
    writer: Option<BlobWriter>,
    content_hash: Option<String>,
    values: BTreeMap<String, Value>,
    dirty: bool,
    cached: bool,
}

impl CacheEntry {
    /// An entry with no content and no values.
    pub fn fresh(key: CacheKey, blobs: BlobStore, metadata: MetadataStore) -> Self {
        Self {
            key,
            blobs,
            metadata,
            writer: None,
            content_hash: None,
            values: BTreeMap::new(),
            dirty: false,
            cached: false,
        }
    }

    /// An entry restored from a persisted record.
    pub fn from_record(
        key: CacheKey,
        blobs: BlobStore,
        metadata: MetadataStore,
        record: MetadataRecord,
    ) -> Self {
        Self {
            content_hash: record.content_hash,
            values: record.values,
            cached: true,
            ..Self::fresh(key, blobs, metadata)
        }
    }

    pub const fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn fingerprint(&self) -> &str {
        self.key.fingerprint()
    }

    /// Published content hash, if the entry has content.
    pub fn content_hash(&self) -> Option<&str> {
        self.content_hash.as_deref()
    }

    pub const fn has_content(&self) -> bool {
        self.content_hash.is_some()
    }

    /// `true` if the entry was loaded from an existing record.
    pub const fn is_cached(&self) -> bool {
        self.cached
    }

    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub const fn state(&self) -> EntryState {
        if self.writer.is_some() {
            EntryState::Writing
        } else if self.dirty {
            EntryState::Finalized
        } else if self.content_hash.is_some() || self.cached {
            EntryState::Saved
        } else {
            EntryState::Fresh
        }
    }

    /// Has anything been staged since the last finalize?
    pub fn has_written(&self) -> bool {
        self.writer.as_ref().is_some_and(BlobWriter::has_written)
    }

    /// Replaces the content with whatever `producer` writes to the path it is
    /// given.
    ///
    /// For tools that insist on writing their own output file. Anything
    /// written before is discarded. If the producer creates no file, the
    /// entry is left with nothing written and the call still succeeds.
    ///
    /// On an entry that already has content (a hit, or finalized) the
    /// producer is not run at all; streamed writes through [`Write`] on such
    /// an entry are likewise dropped by [`Self::finalize`].
    pub fn write_with<F>(&mut self, producer: F) -> Result<()>
    where
        F: FnOnce(&Path) -> io::Result<()>,
    {
        self.discard_staged()?;
        if self.content_hash.is_some() {
            tracing::debug!(
                fingerprint = self.fingerprint(),
                "Entry already has content, skipping producer"
            );
            return Ok(());
        }
        self.writer = Some(BlobWriter::produce(&self.blobs, producer)?);
        Ok(())
    }

    /// Publishes staged content into the blob area.
    ///
    /// Does nothing if the entry is already finalized (any newly staged bytes
    /// are dropped) or if nothing was written. Returns the content hash.
    pub fn finalize(&mut self) -> Result<Option<String>> {
        if self.content_hash.is_some() {
            if self.has_written() {
                tracing::debug!(
                    fingerprint = self.fingerprint(),
                    "Entry already finalized, dropping staged content"
                );
            }
            self.discard_staged()?;
            return Ok(self.content_hash.clone());
        }

        let Some(writer) = self.writer.take() else {
            return Ok(None);
        };

        let hash = writer.publish(&self.blobs)?;
        if let Some(hash) = &hash {
            tracing::debug!(fingerprint = self.fingerprint(), %hash, "Finalized entry");
            self.content_hash = Some(hash.clone());
            self.dirty = true;
        }
        Ok(hash)
    }

    /// Links the entry's content to `dest` and persists its metadata.
    ///
    /// Finalizes first. Entries without content only persist metadata.
    /// Installing the same entry twice leaves `dest` pointing at the same blob.
    #[tracing::instrument(
        level = "debug",
        skip(self),
        fields(fingerprint = self.key.fingerprint())
    )]
    pub fn install(&mut self, dest: &Path) -> Result<Option<LinkKind>> {
        self.finalize()?;

        let link = match &self.content_hash {
            Some(hash) => {
                let kind = self.blobs.link_into(hash, dest)?;
                tracing::info!(?dest, %hash, ?kind, cached = self.cached, "Installed entry");
                Some(kind)
            }
            None => None,
        };

        self.save()?;
        Ok(link)
    }

    /// Persists the entry's record. No-op unless something changed.
    pub fn save(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        let record = MetadataRecord::new(self.content_hash.clone(), self.values.clone());
        self.metadata.save(self.key.fingerprint(), &record)?;
        self.dirty = false;
        Ok(())
    }

    /// Releases the entry without installing it, removing any staged file.
    pub fn close(mut self) -> Result<()> {
        self.discard_staged()
    }

    fn discard_staged(&mut self) -> Result<()> {
        match self.writer.take() {
            Some(writer) => writer
                .discard()
                .map_err(CacheError::io("remove staging file", self.blobs.dir())),
            None => Ok(()),
        }
    }

    /// Sets a named value.
    ///
    /// # Errors
    ///
    /// [`CacheError::InvalidKeyName`] if `name` is empty or starts with `_`.
    pub fn store<V: Into<Value>>(&mut self, name: &str, value: V) -> Result<()> {
        if name.is_empty() || name.starts_with('_') {
            return Err(CacheError::InvalidKeyName {
                name: name.to_owned(),
            });
        }

        let value = value.into();
        if self.values.get(name) != Some(&value) {
            self.values.insert(name.to_owned(), value);
            self.dirty = true;
        }
        Ok(())
    }

    pub fn store_extension<T: ExtensionValue>(&mut self, name: &str, value: &T) -> Result<()> {
        self.store(name, Value::extension(value)?)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Like [`Self::get`], but a missing name is distinguished from a value
    /// of the wrong kind.
    pub fn get_extension<T: ExtensionValue>(&self, name: &str) -> Result<Option<T>> {
        let Some(value) = self.values.get(name) else {
            return Ok(None);
        };
        value
            .decode_extension::<T>()?
            .map(Some)
            .ok_or_else(|| CacheError::ValueKind {
                name: name.to_owned(),
                expected: T::KIND,
                actual: value.kind().to_owned(),
            })
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Value::as_bool)
    }

    /// Returns the value and whether it was present.
    pub fn lookup(&self, name: &str) -> (Option<&Value>, bool) {
        let value = self.values.get(name);
        (value, value.is_some())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// `true` iff every name is present.
    pub fn has(&self, names: &[&str]) -> bool {
        names.iter().all(|name| self.values.contains_key(*name))
    }

    pub fn values(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Streams content into the entry, staging a temp file on first use.
impl Write for CacheEntry {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.writer.is_none() {
            self.writer = Some(BlobWriter::create(&self.blobs).map_err(io::Error::other)?);
        }
        if let Some(writer) = self.writer.as_mut() {
            writer.append(buf).map_err(io::Error::other)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
