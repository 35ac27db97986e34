//! Content-addressed artifact cache.
//!
//! Expensive, deterministic operations (code generators, compilers) are keyed
//! by a fingerprint of the operation name and every source file they read.
//! On a miss the caller produces the artifact into a [`CacheEntry`]; the bytes
//! are stored once under their own hash and recorded against the fingerprint.
//! On a hit the stored artifact is linked into place without recomputing.
//!
//! ```no_run
//! use artcache::{Cache, HashAlgorithm};
//! use std::io::Write;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = Cache::open("/tmp/artcache", HashAlgorithm::Sha256)?;
//! let mut entry = cache.entry(cache.key("compile", &["a.src"])?)?;
//! if !entry.has_content() {
//!     entry.write_all(b"OUT1")?;
//! }
//! entry.install("out/a.bin".as_ref())?;
//! # Ok(())
//! # }
//! ```
pub mod cache;
pub mod config;
pub mod entry;
pub mod error;
pub mod hash;
pub mod key;
pub mod metadata;
pub mod store;
pub mod value;

pub use cache::Cache;
pub use config::CacheConfig;
pub use entry::{CacheEntry, EntryState};
pub use error::{CacheError, Result};
pub use hash::HashAlgorithm;
pub use key::{CacheKey, SourceDescriptor};
pub use store::LinkKind;
pub use value::{ExtensionValue, Value};
