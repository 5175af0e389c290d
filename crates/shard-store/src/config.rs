use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::file::DEFAULT_MAX_CHUNK_SIZE;
use crate::layout::{Layout, NameEncoding};

/// Configuration of a [`Storage`](crate::storage::Storage) instance.
///
/// Every field has a default, so a TOML file only needs the keys it
/// changes:
///
/// ```toml
/// root = "/var/lib/shards"
/// encoding = "base64url"
/// directory_bits = 12
///
/// [layers]
/// read_cache = 256
/// range_cache = 0
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Directory holding the shard directories.
    pub root: PathBuf,
    /// Text encoding of shard and file names.
    pub encoding: NameEncoding,
    /// Leading key bits that select the shard directory.
    pub directory_bits: u32,
    /// Upper bound on the encoded size of one chunk file, in bytes.
    pub max_chunk_size: usize,
    pub layers: LayerConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("shards"),
            encoding: NameEncoding::Hex,
            directory_bits: 8,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            layers: LayerConfig::default(),
        }
    }
}

/// Capacities of the caching layers. Zero disables a layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LayerConfig {
    /// Chunks held back before being flushed to disk.
    pub write_cache: usize,
    /// Whole chunks kept for reads.
    pub read_cache: usize,
    /// Existence and index entries.
    pub index_cache: usize,
    /// Cached range-query results.
    pub range_cache: usize,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            write_cache: 1024,
            read_cache: 0,
            index_cache: 8192,
            range_cache: 64,
        }
    }
}

impl StorageConfig {
    /// A default configuration rooted at `root`.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Parse a TOML document.
    pub fn from_toml_str(text: &str) -> StoreResult<Self> {
        toml::from_str(text).map_err(|e| StoreError::InvalidConfig(e.to_string()))
    }

    /// Read and parse a TOML file.
    pub fn load(path: &Path) -> StoreResult<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text).map_err(|e| match e {
            StoreError::InvalidConfig(reason) => {
                StoreError::InvalidConfig(format!("{}: {reason}", path.display()))
            }
            other => other,
        })
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> StoreResult<String> {
        toml::to_string_pretty(self).map_err(|e| StoreError::InvalidConfig(e.to_string()))
    }

    /// Check every value, returning the first problem found.
    pub fn validate(&self) -> StoreResult<()> {
        if self.root.as_os_str().is_empty() {
            return Err(StoreError::InvalidConfig("root must not be empty".into()));
        }
        if self.max_chunk_size == 0 {
            return Err(StoreError::InvalidConfig("max_chunk_size must be positive".into()));
        }
        self.layout().map(|_| ())
    }

    /// The on-disk layout these settings describe.
    pub fn layout(&self) -> StoreResult<Layout> {
        Layout::new(self.encoding, self.directory_bits)
    }
}
