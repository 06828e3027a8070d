//! Function metadata store with read-through caching
//!
//! Resolution is two-layered: a [`MetaBackend`] fetches authoritative
//! records, and [`CachedFunctionStore`] memoizes them with a TTL so hot
//! functions do not hammer the metadata service on every invocation.
//! Callers can bypass the cache per lookup, which is how "invoke latest"
//! semantics are honored for unqualified references.

use crate::error::{MetaError, Result};
use async_trait::async_trait;
use cirrus_spec::{AliasInfo, FunctionConfig, RuntimeConfiguration};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default freshness window for cached records
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(600);

/// Aliases move more often than versions, so they expire sooner
pub const DEFAULT_ALIAS_CACHE_TTL: Duration = Duration::from_secs(300);

/// Authoritative metadata source
#[async_trait]
pub trait MetaBackend: Send + Sync {
    /// Fetch a function by name or BRN, optionally pinned to a qualifier
    /// (version number or alias name)
    async fn fetch_function(&self, key: &str, qualifier: Option<&str>) -> Result<FunctionConfig>;

    async fn fetch_alias(&self, function_name: &str, alias: &str) -> Result<AliasInfo>;

    async fn fetch_runtime_configuration(&self, name: &str) -> Result<RuntimeConfiguration>;
}

/// Read-through facade over a backend. Resolved records carry a flag
/// telling the caller whether they came from cache.
#[async_trait]
pub trait FunctionStore: Send + Sync {
    async fn get_function(
        &self,
        key: &str,
        qualifier: Option<&str>,
        cacheable: bool,
    ) -> Result<(FunctionConfig, bool)>;

    async fn get_alias(&self, function_name: &str, alias: &str) -> Result<AliasInfo>;

    async fn get_runtime_configuration(&self, name: &str) -> Result<RuntimeConfiguration>;

    /// Drop any cached records for this function
    fn invalidate_function(&self, key: &str);
}

struct CacheSlot {
    value: String,
    fetched_at: Instant,
}

/// TTL cache over a metadata backend.
///
/// Entries are stored serialized; the cache key carries the record kind so
/// a function and an alias under the same name never collide.
pub struct CachedFunctionStore<B> {
    backend: B,
    cache: DashMap<String, CacheSlot>,
    ttl: Duration,
    alias_ttl: Duration,
}

impl<B: MetaBackend> CachedFunctionStore<B> {
    pub fn new(backend: B) -> Self {
        Self::with_ttl(backend, DEFAULT_CACHE_TTL)
    }

    pub fn with_ttl(backend: B, ttl: Duration) -> Self {
        Self::with_ttls(backend, ttl, DEFAULT_ALIAS_CACHE_TTL.min(ttl))
    }

    pub fn with_ttls(backend: B, ttl: Duration, alias_ttl: Duration) -> Self {
        Self {
            backend,
            cache: DashMap::new(),
            ttl,
            alias_ttl,
        }
    }

    fn cache_get<T: DeserializeOwned>(&self, key: &str, ttl: Duration) -> Option<T> {
        let slot = self.cache.get(key)?;
        if slot.fetched_at.elapsed() > ttl {
            drop(slot);
            self.cache.remove(key);
            return None;
        }
        serde_json::from_str(&slot.value).ok()
    }

    fn cache_put<T: Serialize>(&self, key: String, value: &T) {
        if let Ok(serialized) = serde_json::to_string(value) {
            self.cache.insert(
                key,
                CacheSlot {
                    value: serialized,
                    fetched_at: Instant::now(),
                },
            );
        }
    }

    fn function_key(key: &str, qualifier: Option<&str>) -> String {
        match qualifier {
            Some(qualifier) => format!("function:{key}:{qualifier}"),
            None => format!("function:{key}"),
        }
    }
}

#[async_trait]
impl<B: MetaBackend> FunctionStore for CachedFunctionStore<B> {
    async fn get_function(
        &self,
        key: &str,
        qualifier: Option<&str>,
        cacheable: bool,
    ) -> Result<(FunctionConfig, bool)> {
        let cache_key = Self::function_key(key, qualifier);
        if cacheable {
            if let Some(config) = self.cache_get::<FunctionConfig>(&cache_key, self.ttl) {
                return Ok((config, true));
            }
        }
        let config = self.backend.fetch_function(key, qualifier).await?;
        debug!(key, qualifier = qualifier.unwrap_or("latest"), "function metadata fetched");
        self.cache_put(cache_key, &config);
        Ok((config, false))
    }

    async fn get_alias(&self, function_name: &str, alias: &str) -> Result<AliasInfo> {
        let cache_key = format!("alias:{function_name}:{alias}");
        if let Some(info) = self.cache_get::<AliasInfo>(&cache_key, self.alias_ttl) {
            return Ok(info);
        }
        let info = self.backend.fetch_alias(function_name, alias).await?;
        self.cache_put(cache_key, &info);
        Ok(info)
    }

    async fn get_runtime_configuration(&self, name: &str) -> Result<RuntimeConfiguration> {
        let cache_key = format!("runtime:{name}");
        if let Some(config) = self.cache_get::<RuntimeConfiguration>(&cache_key, self.ttl) {
            return Ok(config);
        }
        let config = self.backend.fetch_runtime_configuration(name).await?;
        self.cache_put(cache_key, &config);
        Ok(config)
    }

    fn invalidate_function(&self, key: &str) {
        let prefix = format!("function:{key}");
        self.cache
            .retain(|cache_key, _| !cache_key.starts_with(&prefix));
    }
}

/// In-memory backend seeded with fixed records; the test and demo backend
pub struct StaticBackend {
    functions: DashMap<String, FunctionConfig>,
    aliases: DashMap<String, AliasInfo>,
    runtimes: DashMap<String, RuntimeConfiguration>,
}

impl StaticBackend {
    pub fn new() -> Self {
        Self {
            functions: DashMap::new(),
            aliases: DashMap::new(),
            runtimes: DashMap::new(),
        }
    }

    pub fn put_function(&self, config: FunctionConfig) {
        self.functions
            .insert(config.function_name.clone(), config);
    }

    pub fn put_alias(&self, alias: AliasInfo) {
        let key = format!("{}:{}", alias.function_name, alias.alias_brn);
        self.aliases.insert(key, alias);
    }

    pub fn put_runtime(&self, config: RuntimeConfiguration) {
        self.runtimes.insert(config.name.clone(), config);
    }
}

impl Default for StaticBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetaBackend for StaticBackend {
    async fn fetch_function(&self, key: &str, qualifier: Option<&str>) -> Result<FunctionConfig> {
        let mut config = self
            .functions
            .get(key)
            .map(|c| c.clone())
            .ok_or_else(|| MetaError::NotFound {
                kind: "function",
                key: key.to_string(),
            })?;
        if let Some(qualifier) = qualifier {
            config.version = qualifier.to_string();
        }
        Ok(config)
    }

    async fn fetch_alias(&self, function_name: &str, alias: &str) -> Result<AliasInfo> {
        let key = format!("{function_name}:{alias}");
        self.aliases
            .get(&key)
            .map(|a| a.clone())
            .ok_or_else(|| MetaError::NotFound {
                kind: "alias",
                key,
            })
    }

    async fn fetch_runtime_configuration(&self, name: &str) -> Result<RuntimeConfiguration> {
        self.runtimes
            .get(name)
            .map(|r| r.clone())
            .ok_or_else(|| MetaError::NotFound {
                kind: "runtime",
                key: name.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_function(name: &str) -> FunctionConfig {
        FunctionConfig {
            function_brn: format!("brn:cirrus:function:{name}"),
            function_name: name.to_string(),
            version: "1".to_string(),
            commit_id: "commit-1".to_string(),
            user_id: "acct".to_string(),
            memory_size: 128,
            timeout: 3,
            runtime: "python3".to_string(),
            handler: "index.handler".to_string(),
            concurrent_mode: false,
            concurrent_quota: 1,
            stream_mode: false,
            log_tail: false,
        }
    }

    fn seeded_store(ttl: Duration) -> CachedFunctionStore<StaticBackend> {
        let backend = StaticBackend::new();
        backend.put_function(sample_function("echo"));
        CachedFunctionStore::with_ttl(backend, ttl)
    }

    #[tokio::test]
    async fn test_second_lookup_hits_cache() {
        let store = seeded_store(Duration::from_secs(60));
        let (_, from_cache) = store.get_function("echo", None, true).await.unwrap();
        assert!(!from_cache);
        let (config, from_cache) = store.get_function("echo", None, true).await.unwrap();
        assert!(from_cache);
        assert_eq!(config.function_name, "echo");
    }

    #[tokio::test]
    async fn test_uncacheable_lookup_bypasses_cache() {
        let store = seeded_store(Duration::from_secs(60));
        store.get_function("echo", None, true).await.unwrap();
        let (_, from_cache) = store.get_function("echo", None, false).await.unwrap();
        assert!(!from_cache);
    }

    #[tokio::test]
    async fn test_expired_entry_is_refetched() {
        let store = seeded_store(Duration::from_millis(1));
        store.get_function("echo", None, true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let (_, from_cache) = store.get_function("echo", None, true).await.unwrap();
        assert!(!from_cache);
    }

    #[tokio::test]
    async fn test_qualifier_keys_are_distinct() {
        let store = seeded_store(Duration::from_secs(60));
        store.get_function("echo", Some("2"), true).await.unwrap();
        // A different qualifier is a different record, not a cache hit
        let (config, from_cache) = store.get_function("echo", Some("3"), true).await.unwrap();
        assert!(!from_cache);
        assert_eq!(config.version, "3");
    }

    #[tokio::test]
    async fn test_invalidate_drops_all_qualifiers() {
        let store = seeded_store(Duration::from_secs(60));
        store.get_function("echo", None, true).await.unwrap();
        store.get_function("echo", Some("2"), true).await.unwrap();
        store.invalidate_function("echo");
        let (_, from_cache) = store.get_function("echo", None, true).await.unwrap();
        assert!(!from_cache);
    }

    #[tokio::test]
    async fn test_missing_function_is_not_found() {
        let store = seeded_store(Duration::from_secs(60));
        let err = store.get_function("nope", None, true).await.unwrap_err();
        assert!(matches!(err, MetaError::NotFound { kind: "function", .. }));
    }
}
