//! Store and database configuration.
//!
//! Configuration comes from connection URI options or from JSON. Unknown
//! URI options are ignored so drivers can define their own.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tessera_core::{Error, Result, Uri};
use tessera_query::ParamStyle;

use crate::cache::{Cache, GenerationalCache, ObjectCache};
use crate::object::Handle;

/// Which cache implementation a store keeps recently used objects in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKind {
    /// Exact least-recently-used eviction.
    #[default]
    Lru,
    /// Two generations, cheaper than exact LRU for large sizes.
    Generational,
}

impl CacheKind {
    /// Build an empty cache of this kind.
    pub fn build(self, size: usize) -> Box<dyn ObjectCache<Handle>> {
        match self {
            CacheKind::Lru => Box::new(Cache::new(size)),
            CacheKind::Generational => Box::new(GenerationalCache::new(size)),
        }
    }
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CacheKind::Lru => "lru",
            CacheKind::Generational => "generational",
        })
    }
}

impl FromStr for CacheKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "lru" => Ok(CacheKind::Lru),
            "generational" => Ok(CacheKind::Generational),
            other => Err(Error::config(format!("unknown cache kind: {other:?}"))),
        }
    }
}

// ============================================================================
// Store configuration
// ============================================================================

/// Configuration for [`Store`](crate::Store) behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub cache: CacheKind,
    /// Objects kept alive by the cache. 0 disables caching.
    pub cache_size: usize,
    /// How often one object may be flushed again within a single flush
    /// because hooks dirtied it.
    pub max_flush_repeats: usize,
    /// Flush before queries and lazy loads.
    pub implicit_flush: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache: CacheKind::Lru,
            cache_size: 1000,
            max_flush_repeats: 16,
            implicit_flush: true,
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `cache`, `cache_size` and `max_flush_repeats` from URI options.
    pub fn from_uri(uri: &Uri) -> Result<Self> {
        let mut config = Self::default();
        if let Some(cache) = uri.option_as::<CacheKind>("cache")? {
            config.cache = cache;
        }
        if let Some(size) = uri.option_as::<usize>("cache_size")? {
            config.cache_size = size;
        }
        if let Some(repeats) = uri.option_as::<usize>("max_flush_repeats")? {
            config.max_flush_repeats = repeats;
        }
        if let Some(implicit) = uri.option_as::<bool>("implicit_flush")? {
            config.implicit_flush = implicit;
        }
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    #[must_use]
    pub fn cache(mut self, kind: CacheKind, size: usize) -> Self {
        self.cache = kind;
        self.cache_size = size;
        self
    }

    #[must_use]
    pub fn max_flush_repeats(mut self, repeats: usize) -> Self {
        self.max_flush_repeats = repeats;
        self
    }

    #[must_use]
    pub fn implicit_flush(mut self, enabled: bool) -> Self {
        self.implicit_flush = enabled;
        self
    }
}

// ============================================================================
// Database configuration
// ============================================================================

/// Configuration for a [`Database`](crate::Database).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Placeholder style of the driver. Overrides the dialect's style.
    pub param_style: Option<ParamStyle>,
    /// Log every statement through a debug tracer.
    pub debug: bool,
}

impl DatabaseConfig {
    pub fn from_uri(uri: &Uri) -> Result<Self> {
        Ok(Self {
            param_style: uri.option_as::<ParamStyle>("param_style")?,
            debug: uri.option_as::<bool>("debug")?.unwrap_or(false),
        })
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_config_reads_uri_options() {
        let uri = Uri::parse("mock://host/db?cache=generational&cache_size=50&max_flush_repeats=3")
            .unwrap();
        let config = StoreConfig::from_uri(&uri).unwrap();
        assert_eq!(config.cache, CacheKind::Generational);
        assert_eq!(config.cache_size, 50);
        assert_eq!(config.max_flush_repeats, 3);
        assert!(config.implicit_flush);
    }

    #[test]
    fn store_config_rejects_bad_options() {
        let uri = Uri::parse("mock:db?cache=fifo").unwrap();
        assert!(matches!(StoreConfig::from_uri(&uri), Err(Error::Config(_))));
        let uri = Uri::parse("mock:db?cache_size=many").unwrap();
        assert!(StoreConfig::from_uri(&uri).is_err());
    }

    #[test]
    fn configs_load_from_json() {
        let config = StoreConfig::from_json(r#"{"cache": "lru", "cache_size": 5}"#).unwrap();
        assert_eq!(config.cache_size, 5);
        assert_eq!(config.max_flush_repeats, StoreConfig::default().max_flush_repeats);

        let db = DatabaseConfig::from_json(r#"{"param_style": "numbered"}"#).unwrap();
        assert_eq!(db.param_style, Some(ParamStyle::Numbered));
        assert!(!db.debug);
    }

    #[test]
    fn database_config_from_uri() {
        let uri = Uri::parse("mock:db?param_style=format&debug=true").unwrap();
        let config = DatabaseConfig::from_uri(&uri).unwrap();
        assert_eq!(config.param_style, Some(ParamStyle::Format));
        assert!(config.debug);
    }
}
