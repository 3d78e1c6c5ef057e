//! Durable module tier.
//!
//! Holds raw fetched module source (pre-evaluation) keyed by the specifier's
//! cache key, with a fixed time-to-live. The per-execution memory tier of
//! evaluated exports lives inside each isolate and never reaches this store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;

/// A module's source text as stored in the durable tier
#[derive(Debug, Clone)]
pub struct CachedModule {
    pub cache_key: String,
    pub source_text: Arc<str>,
    pub stored_at: DateTime<Utc>,
}

impl CachedModule {
    pub fn new(cache_key: impl Into<String>, source_text: impl Into<Arc<str>>) -> Self {
        Self {
            cache_key: cache_key.into(),
            source_text: source_text.into(),
            stored_at: Utc::now(),
        }
    }
}

/// Shared key/value store for fetched module source.
///
/// Writes are idempotent (same key, same content), so concurrent executions
/// may race on a cold key without coordination.
#[async_trait]
pub trait ModuleStore: Send + Sync {
    /// Look up a module by cache key. `Ok(None)` is a miss.
    async fn get(&self, cache_key: &str) -> anyhow::Result<Option<CachedModule>>;

    /// Store a module. Callers treat failures as best-effort.
    async fn put(&self, module: CachedModule) -> anyhow::Result<()>;
}

/// In-process durable tier backed by a TTL cache.
///
/// Eviction is time-based only.
#[derive(Clone)]
pub struct MemoryModuleStore {
    modules: Cache<String, CachedModule>,
}

impl MemoryModuleStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            modules: Cache::builder().time_to_live(ttl).build(),
        }
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.modules.invalidate_all();
    }
}

#[async_trait]
impl ModuleStore for MemoryModuleStore {
    async fn get(&self, cache_key: &str) -> anyhow::Result<Option<CachedModule>> {
        Ok(self.modules.get(cache_key).await)
    }

    async fn put(&self, module: CachedModule) -> anyhow::Result<()> {
        self.modules.insert(module.cache_key.clone(), module).await;
        Ok(())
    }
}
