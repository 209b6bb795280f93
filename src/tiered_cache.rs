//! Two-tier cache with a fixed time-to-live
//!
//! - Volatile tier: in-memory Moka cache, process lifetime only
//! - Persisted tier: `{value, timestamp, version}` documents in a
//!   [`DocumentStore`] collection, keyed by `{namespace}_{id}`
//!
//! Every failure of the persisted tier is logged and absorbed: a read failure
//! is a miss, a write failure leaves the volatile write in place. The cache
//! never blocks the data path it sits in front of.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::CacheConfig;
use crate::clock::{Clock, SystemClock};
use crate::document_store::{DocumentStore, WriteMode};

/// Namespace used by [`TieredCache::get_or_fetch`]
pub const APP_NAMESPACE: &str = "app";

/// Shape of a persisted-tier document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub value: Value,
    /// Write time in epoch milliseconds
    pub timestamp: i64,
    pub version: String,
}

impl PersistedEntry {
    fn into_fields(self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("value".to_owned(), self.value);
        fields.insert("timestamp".to_owned(), Value::from(self.timestamp));
        fields.insert("version".to_owned(), Value::from(self.version));
        fields
    }
}

#[derive(Debug, Clone)]
struct VolatileEntry {
    value: Arc<Value>,
    stored_at: i64,
}

/// Build the cache key for a namespace and identifier.
///
/// Returns `None` when either part is empty or the namespace contains `_`,
/// which would make `{namespace}_` an ambiguous prefix for [`TieredCache::clear`].
pub fn cache_key(namespace: &str, id: &str) -> Option<String> {
    if !is_valid_namespace(namespace) || id.is_empty() {
        return None;
    }
    Some(format!("{}_{}", namespace, id))
}

fn is_valid_namespace(namespace: &str) -> bool {
    !namespace.is_empty() && !namespace.contains('_')
}

/// Volatile + persisted cache over a document store
pub struct TieredCache<S: DocumentStore> {
    inner: Arc<TieredCacheInner<S>>,
}

struct TieredCacheInner<S: DocumentStore> {
    volatile: Cache<String, VolatileEntry>,
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
}

impl<S: DocumentStore> Clone for TieredCache<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: DocumentStore> TieredCache<S> {
    pub fn new(store: Arc<S>, config: CacheConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    /// Create a cache that reads time from `clock`
    pub fn with_clock(store: Arc<S>, config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        // Moka's own TTL only sweeps memory; validity is decided by `clock`.
        let mut builder = Cache::builder().time_to_live(config.ttl);
        if let Some(capacity) = config.volatile_max_capacity {
            builder = builder.max_capacity(capacity);
        }

        Self {
            inner: Arc::new(TieredCacheInner {
                volatile: builder.build(),
                store,
                clock,
                config,
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    fn is_fresh(&self, stored_at: i64) -> bool {
        let ttl = i64::try_from(self.inner.config.ttl.as_millis()).unwrap_or(i64::MAX);
        self.inner.clock.now_millis().saturating_sub(stored_at) < ttl
    }

    /// Look up a value, volatile tier first, then the persisted tier.
    ///
    /// A persisted hit is promoted into the volatile tier with its original
    /// write time, so promotion never extends an entry's lifetime.
    pub async fn get(&self, namespace: &str, id: &str) -> Option<Arc<Value>> {
        let Some(key) = cache_key(namespace, id) else {
            warn!(
                "Ignoring cache read with invalid namespace or id ({:?}, {:?})",
                namespace, id
            );
            return None;
        };

        if let Some(entry) = self.inner.volatile.get(&key).await {
            if self.is_fresh(entry.stored_at) {
                debug!("Cache hit volatile for key: {}", key);
                return Some(entry.value);
            }
            self.inner.volatile.invalidate(&key).await;
        }

        debug!("Cache miss volatile for key: {}", key);

        let entry = self.read_persisted(&key).await?;
        if !self.is_fresh(entry.timestamp) {
            debug!("Persisted cache entry expired for key: {}", key);
            self.delete_persisted(&key).await;
            return None;
        }

        debug!("Cache hit persisted for key: {}", key);
        let value = Arc::new(entry.value);
        self.inner
            .volatile
            .insert(
                key,
                VolatileEntry {
                    value: Arc::clone(&value),
                    stored_at: entry.timestamp,
                },
            )
            .await;
        Some(value)
    }

    async fn read_persisted(&self, key: &str) -> Option<PersistedEntry> {
        let config = &self.inner.config;
        let lookup = self.inner.store.get(&config.persisted_collection, key);

        let doc = match timeout(config.store_timeout, lookup).await {
            Ok(Ok(Some(doc))) => doc,
            Ok(Ok(None)) => {
                debug!("Cache miss persisted for key: {}", key);
                return None;
            }
            Ok(Err(e)) => {
                warn!(
                    "Cache read error for key {} ({}). Treating as miss.",
                    key, e
                );
                return None;
            }
            Err(_) => {
                warn!(
                    "Cache read for key {} timed out after {:?}. Treating as miss.",
                    key, config.store_timeout
                );
                return None;
            }
        };

        match serde_json::from_value::<PersistedEntry>(Value::Object(doc.fields)) {
            Ok(entry) if entry.version == config.version => Some(entry),
            Ok(entry) => {
                debug!(
                    "Ignoring cache entry for key {} with version {} (current {})",
                    key, entry.version, config.version
                );
                None
            }
            Err(e) => {
                warn!(
                    "Failed to deserialize cache entry for key {}: {}. Deleting corrupt entry.",
                    key, e
                );
                self.delete_persisted(key).await;
                None
            }
        }
    }

    /// Delete one persisted entry, bounded by `store_timeout`.
    async fn delete_persisted(&self, key: &str) -> bool {
        let config = &self.inner.config;
        let delete = self.inner.store.delete(&config.persisted_collection, key);
        match timeout(config.store_timeout, delete).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("Failed to delete cache entry for key {}: {}", key, e);
                false
            }
            Err(_) => {
                warn!(
                    "Deleting cache entry for key {} timed out after {:?}",
                    key, config.store_timeout
                );
                false
            }
        }
    }

    /// Store a value in both tiers.
    ///
    /// The volatile write always happens; a failed persisted write is logged.
    pub async fn set(&self, namespace: &str, id: &str, value: Value) -> Arc<Value> {
        let value = Arc::new(value);
        let Some(key) = cache_key(namespace, id) else {
            warn!(
                "Ignoring cache write with invalid namespace or id ({:?}, {:?})",
                namespace, id
            );
            return value;
        };

        let now = self.inner.clock.now_millis();
        self.inner
            .volatile
            .insert(
                key.clone(),
                VolatileEntry {
                    value: Arc::clone(&value),
                    stored_at: now,
                },
            )
            .await;

        let config = &self.inner.config;
        let entry = PersistedEntry {
            value: Value::clone(&value),
            timestamp: now,
            version: config.version.clone(),
        };
        let write = self.inner.store.set(
            &config.persisted_collection,
            &key,
            entry.into_fields(),
            WriteMode::Merge,
        );
        match timeout(config.store_timeout, write).await {
            Ok(Ok(())) => debug!("Cache stored for key: {}", key),
            Ok(Err(e)) => warn!("Cache write error for key {}: {}. Continuing.", key, e),
            Err(_) => warn!(
                "Cache write for key {} timed out after {:?}. Continuing.",
                key, config.store_timeout
            ),
        }

        value
    }

    /// Look up many ids of one namespace concurrently.
    pub async fn preload<T: AsRef<str>>(
        &self,
        namespace: &str,
        ids: &[T],
    ) -> HashMap<String, Option<Arc<Value>>> {
        let lookups = ids.iter().map(|id| async move {
            let id = id.as_ref();
            (id.to_owned(), self.get(namespace, id).await)
        });
        join_all(lookups).await.into_iter().collect()
    }

    /// Clear the cache.
    ///
    /// Without a namespace only the volatile tier is wiped. With a namespace,
    /// every entry of that namespace is removed from both tiers.
    pub async fn clear(&self, namespace: Option<&str>) {
        match namespace {
            None => {
                self.inner.volatile.invalidate_all();
                debug!("Volatile cache cleared");
            }
            Some(ns) if !is_valid_namespace(ns) => {
                warn!("Ignoring cache clear with invalid namespace {:?}", ns)
            }
            Some(ns) => self.clear_namespace(ns).await,
        }
    }

    /// Number of entries in the volatile tier, after pending maintenance runs.
    pub async fn len_volatile(&self) -> u64 {
        self.inner.volatile.run_pending_tasks().await;
        self.inner.volatile.entry_count()
    }

    async fn clear_namespace(&self, namespace: &str) {
        let prefix = format!("{}_", namespace);

        let volatile_keys: Vec<String> = self
            .inner
            .volatile
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| String::clone(&key))
            .collect();
        for key in &volatile_keys {
            self.inner.volatile.invalidate(key).await;
        }

        let config = &self.inner.config;
        let listing = self
            .inner
            .store
            .list_ids(&config.persisted_collection, &prefix);
        let ids = match timeout(config.store_timeout, listing).await {
            Ok(Ok(ids)) => ids,
            Ok(Err(e)) => {
                warn!(
                    "Failed to list cache entries for namespace {}: {}",
                    namespace, e
                );
                return;
            }
            Err(_) => {
                warn!(
                    "Listing cache entries for namespace {} timed out after {:?}",
                    namespace, config.store_timeout
                );
                return;
            }
        };

        let mut removed = 0usize;
        for id in &ids {
            if self.delete_persisted(id).await {
                removed += 1;
            }
        }
        debug!(
            "Cleared namespace {}: {} volatile, {}/{} persisted entries",
            namespace,
            volatile_keys.len(),
            removed,
            ids.len()
        );
    }

    /// Return the cached value for `key` in the `app` namespace, or run
    /// `fetch`, cache its result and return it.
    pub async fn get_or_fetch<F, Fut, E>(
        &self,
        key: &str,
        fetch: F,
        skip_cache: bool,
    ) -> Result<Arc<Value>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>>,
    {
        if !skip_cache && let Some(cached) = self.get(APP_NAMESPACE, key).await {
            return Ok(cached);
        }
        let fresh = fetch().await?;
        Ok(self.set(APP_NAMESPACE, key, fresh).await)
    }
}
