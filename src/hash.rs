//! Hash provider
//!
//! One algorithm is used both to fingerprint cache keys and to content-address
//! stored blobs. Digests are always rendered as lowercase hex.
use serde::{Deserialize, Serialize};
use sha2::{Sha256, Sha512, digest::DynDigest};
use std::{fmt, io};

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    /// Stable name, also mixed into fingerprints.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    /// Length of a hex-encoded digest.
    pub const fn hex_len(self) -> usize {
        match self {
            Self::Sha256 => 64,
            Self::Sha512 => 128,
        }
    }

    pub fn hasher(self) -> Hasher {
        let inner: Box<dyn DynDigest + Send> = match self {
            Self::Sha256 => Box::new(Sha256::default()),
            Self::Sha512 => Box::new(Sha512::default()),
        };
        Hasher {
            algorithm: self,
            inner,
        }
    }

    pub fn hash_bytes(self, data: &[u8]) -> String {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finalize_hex()
    }

    /// Streams `reader` to the end and returns its hex digest.
    pub fn hash_reader<R: io::Read>(self, mut reader: R) -> io::Result<String> {
        let mut hasher = self.hasher();
        io::copy(&mut reader, &mut hasher)?;
        Ok(hasher.finalize_hex())
    }

    /// Returns `true` if `s` looks like a digest produced by this algorithm.
    pub fn is_digest(self, s: &str) -> bool {
        s.len() == self.hex_len() && s.chars().all(|c| c.is_ascii_hexdigit())
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Running hash accumulator.
///
/// Implements [`io::Write`] so content can be teed into it with `io::copy`.
pub struct Hasher {
    algorithm: HashAlgorithm,
    inner: Box<dyn DynDigest + Send>,
}

impl Hasher {
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub const fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn finalize_hex(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hasher")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl io::Write for Hasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
