//! Cache configuration, read from a TOML file.
//!
//! ```toml
//! root = "/var/cache/artcache"
//! algorithm = "sha512"
//! ```
use crate::{
    error::{CacheError, Result},
    hash::HashAlgorithm,
};
use serde::{Deserialize, Serialize};
use std::{
    env,
    path::{Path, PathBuf},
};

const APP_DIR: &str = "artcache";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Cache root holding `files/` and `metadata/`
    pub root: PathBuf,
    pub algorithm: HashAlgorithm,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            algorithm: HashAlgorithm::default(),
        }
    }
}

impl CacheConfig {
    /// Reads a config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| CacheError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::parse(&content).map_err(|reason| CacheError::Config {
            path: path.to_path_buf(),
            reason,
        })
    }

    fn parse(content: &str) -> std::result::Result<Self, String> {
        toml::from_str(content).map_err(|e| e.to_string())
    }
}

/// `$XDG_CACHE_HOME/artcache`, then `$HOME/.cache/artcache`, then a
/// directory relative to the working directory.
fn default_root() -> PathBuf {
    let non_empty = |var| env::var_os(var).filter(|v| !v.is_empty()).map(PathBuf::from);

    non_empty("XDG_CACHE_HOME")
        .or_else(|| non_empty("HOME").map(|home| home.join(".cache")))
        .map_or_else(|| PathBuf::from(".artcache"), |base| base.join(APP_DIR))
}
