//! Secondary Cache Tier
//!
//! A slower second-level store consulted on primary miss and fed with
//! entries the primary tier evicts. Implementations are reached through the
//! [`SecondaryCache`] trait; named constructors are kept in a
//! [`SecondaryCacheRegistry`].

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::error::{Error, Result};

/// Second-tier store for serialized cache values
pub trait SecondaryCache: Send + Sync {
    /// Name used in logs and by the registry
    fn name(&self) -> &'static str;

    /// Store a value; rejection is not an error for callers of the primary tier
    fn insert(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Fetch the original bytes for a key, or `None` on miss
    fn lookup(&self, key: &[u8]) -> Option<Bytes>;

    /// Drop a key if present
    fn erase(&self, key: &[u8]);

    /// Capacity in bytes
    fn capacity(&self) -> usize;

    /// Bytes currently held
    fn usage(&self) -> usize;
}

impl std::fmt::Debug for dyn SecondaryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecondaryCache").field("name", &self.name()).finish()
    }
}

/// Constructor taking the argument text after `name://`
pub type SecondaryCacheFactory = fn(&str) -> Result<Arc<dyn SecondaryCache>>;

/// Registry of named secondary cache constructors
#[derive(Default)]
pub struct SecondaryCacheRegistry {
    factories: HashMap<String, SecondaryCacheFactory>,
}

static GLOBAL_REGISTRY: Lazy<RwLock<SecondaryCacheRegistry>> =
    Lazy::new(|| RwLock::new(SecondaryCacheRegistry::with_builtins()));

impl SecondaryCacheRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in implementations
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(
            super::compressed::COMPRESSED_SECONDARY_CACHE_NAME,
            super::compressed::CompressedSecondaryCache::from_args,
        );
        registry
    }

    /// Process-wide registry used by string-based construction
    pub fn global() -> &'static RwLock<SecondaryCacheRegistry> {
        &GLOBAL_REGISTRY
    }

    /// Register a constructor, replacing any previous one with that name
    pub fn register(&mut self, name: impl Into<String>, factory: SecondaryCacheFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Build a secondary cache from `name` or `name://args`
    pub fn create(&self, value: &str) -> Result<Arc<dyn SecondaryCache>> {
        let (name, args) = match value.split_once("://") {
            Some((name, args)) => (name, args),
            None => (value, ""),
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::invalid("empty secondary cache name"));
        }

        match self.factories.get(name) {
            Some(factory) => factory(args),
            None => Err(Error::not_supported(format!(
                "no secondary cache registered as '{}'",
                name
            ))),
        }
    }
}

impl std::fmt::Debug for SecondaryCacheRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("SecondaryCacheRegistry")
            .field("factories", &names)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
