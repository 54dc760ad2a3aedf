use std::sync::{Arc, Mutex, PoisonError};

use indexmap::IndexMap;

use super::bucket::MemoBucket;
use super::cached::{CachedFunction, DataCache, ResourceCache};
use super::{CacheKind, Clock, FunctionIdentity, MemoOptions, SystemClock};
use crate::hashing::Fingerprint;
use crate::stats::{CacheStat, StatsProvider};

/// Process-wide table of cached functions, keyed by function key.
pub struct MemoRegistry {
    clock: Arc<dyn Clock>,
    defaults: MemoOptions,
    buckets: Mutex<IndexMap<Fingerprint, Arc<MemoBucket>>>,
}

impl Default for MemoRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoRegistry {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            defaults: MemoOptions::default(),
            buckets: Mutex::new(IndexMap::new()),
        }
    }

    /// Options applied to caches that leave `ttl` or `max_entries` unset.
    pub fn with_defaults(mut self, defaults: MemoOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    fn cached_function(&self, identity: FunctionIdentity, kind: CacheKind, options: MemoOptions) -> CachedFunction {
        let options = options.or(self.defaults);
        let key = identity.key(kind);
        let bucket = {
            let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
            buckets
                .entry(key)
                .or_insert_with(|| {
                    tracing::debug!(function = %identity.qualified_name, kind = kind.name(), "cache created");
                    Arc::new(MemoBucket::new(
                        identity.qualified_name.clone(),
                        kind,
                        options,
                        self.clock.clone(),
                    ))
                })
                .clone()
        };
        if bucket.options() != options {
            bucket.set_options(options);
        }
        CachedFunction::new(identity, key, bucket)
    }

    pub fn data_cache(&self, identity: FunctionIdentity, options: MemoOptions) -> DataCache {
        DataCache::new(self.cached_function(identity, CacheKind::Data, options))
    }

    pub fn resource_cache(&self, identity: FunctionIdentity, options: MemoOptions) -> ResourceCache {
        ResourceCache::new(self.cached_function(identity, CacheKind::Resource, options))
    }

    fn buckets(&self) -> Vec<Arc<MemoBucket>> {
        self.buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Empties every cache of `kind`, or of both kinds.
    pub fn clear_all(&self, kind: Option<CacheKind>) {
        for bucket in self.buckets() {
            if kind.map_or(true, |kind| bucket.kind() == kind) {
                bucket.clear();
            }
        }
        tracing::info!(kind = ?kind, "memo caches cleared");
    }

    pub fn function_count(&self) -> usize {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn entry_count(&self) -> usize {
        self.buckets().iter().map(|bucket| bucket.len()).sum()
    }
}

impl StatsProvider for MemoRegistry {
    fn get_stats(&self) -> Vec<CacheStat> {
        self.buckets()
            .iter()
            .flat_map(|bucket| bucket.stats())
            .collect()
    }
}
