//! Request gateway
//!
//! Single entry point for outbound reads and writes, against the HTTP API and
//! the document store:
//! - read-through caching via [`TieredCache`]
//! - coalescing of concurrent misses on the same cache key
//! - per-call timeout and bounded retry of transient failures
//! - uniform [`RequestError`] on failure

use std::fmt::Write as _;
use std::future::Future;
use std::sync::Arc;

use reqwest::Method;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::Value;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::auth::AuthProvider;
use crate::document_store::{Condition, Document, DocumentStore};
use crate::in_flight::{self, InFlight, Role};
use crate::tiered_cache::TieredCache;
use crate::{GatewayConfig, RequestError, UpstreamError};

/// Cache namespace for HTTP reads
pub const API_NAMESPACE: &str = "api";
/// Cache namespace for document and query reads
pub const FIRESTORE_NAMESPACE: &str = "firestore";

#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Attach the session's bearer token
    pub auth_required: bool,
    /// Cache the response under this key (reads are served from it)
    pub cache_key: Option<String>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            auth_required: true,
            cache_key: None,
        }
    }
}

impl RequestOptions {
    pub fn cached(key: impl Into<String>) -> Self {
        Self {
            cache_key: Some(key.into()),
            ..Self::default()
        }
    }

    /// Send without credentials
    pub fn public(mut self) -> Self {
        self.auth_required = false;
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DocumentOptions {
    pub cache: bool,
}

impl Default for DocumentOptions {
    fn default() -> Self {
        Self { cache: true }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueryOptions {
    pub cache: bool,
    pub limit: Option<usize>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            cache: true,
            limit: None,
        }
    }
}

/// Cache key of a single document read
pub fn document_cache_key(collection: &str, id: &str) -> String {
    format!("fs_{}_{}", collection, id)
}

/// Cache key of a collection query.
///
/// Conditions are ANDed, so they are sorted by their serialized form: the
/// same filter set yields the same key whatever order the caller used.
pub fn query_cache_key(collection: &str, conditions: &[Condition], limit: Option<usize>) -> String {
    let mut parts: Vec<String> = conditions
        .iter()
        .map(|c| serde_json::to_string(c).unwrap_or_default())
        .collect();
    parts.sort();

    let mut key = format!("fs_query_{}_[{}]", collection, parts.join(","));
    if let Some(limit) = limit {
        let _ = write!(key, "_limit{}", limit);
    }
    key
}

/// Error body returned by the HTTP API
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    code: Option<Value>,
    message: Option<Value>,
    details: Option<Value>,
}

fn value_as_string(v: Option<Value>) -> Option<String> {
    match v? {
        Value::String(s) => Some(s),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

pub struct Gateway<S: DocumentStore, A: AuthProvider> {
    http: reqwest::Client,
    cache: TieredCache<S>,
    auth: Arc<A>,
    config: GatewayConfig,
    in_flight: InFlight,
}

impl<S: DocumentStore, A: AuthProvider> Gateway<S, A> {
    /// Create a gateway. The cache's store is also the gateway's document store.
    pub fn new(
        cache: TieredCache<S>,
        auth: Arc<A>,
        config: GatewayConfig,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            cache,
            auth,
            config,
            in_flight: InFlight::default(),
        })
    }

    pub fn cache(&self) -> &TieredCache<S> {
        &self.cache
    }

    pub fn auth(&self) -> &Arc<A> {
        &self.auth
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    fn store(&self) -> &S {
        self.cache.store()
    }

    /// Run `call` under the request timeout, retrying transient failures.
    async fn with_retry<T, F, Fut>(&self, mut call: F) -> Result<T, UpstreamError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let mut attempt = 0u32;
        let mut delay = self.config.retry_base_delay;
        loop {
            let result = match timeout(self.config.request_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(UpstreamError::Timeout(self.config.request_timeout)),
            };
            match result {
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(
                        "Upstream attempt {} of {} failed: {}. Retrying in {:?}.",
                        attempt,
                        self.config.max_retries + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2).min(self.config.retry_max_delay);
                }
                other => return other,
            }
        }
    }

    /// Lead the fetch for `key`, or wait for the one already running.
    async fn coalesced<F, Fut>(&self, key: &str, fetch: F) -> Result<Arc<Value>, RequestError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<Value>, RequestError>>,
    {
        match self.in_flight.join(key) {
            Role::Follower(rx) => {
                debug!("Waiting for in-flight fetch for key: {}", key);
                in_flight::wait(rx).await
            }
            Role::Leader(guard) => {
                let result = fetch().await;
                guard.complete(&result);
                result
            }
        }
    }

    /// Send a JSON request to `{base_url}{endpoint}`.
    ///
    /// `GET` requests with a cache key are served from the cache when
    /// possible; any successful request with a cache key refreshes it.
    pub async fn request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
        options: RequestOptions,
    ) -> Result<Arc<Value>, RequestError> {
        let cache_key = options
            .cache_key
            .as_deref()
            .filter(|key| self.config.cache_enabled && !key.is_empty());
        let is_read = method == Method::GET;

        if is_read
            && let Some(key) = cache_key
            && let Some(cached) = self.cache.get(API_NAMESPACE, key).await
        {
            return Ok(cached);
        }

        let fetch = || async {
            let value = self
                .with_retry(|| self.send(&method, endpoint, body, options.auth_required))
                .await
                .map_err(|e| RequestError::from_upstream(e, &format!("Endpoint: {}", endpoint)))?;
            Ok::<_, RequestError>(match cache_key {
                Some(key) => self.cache.set(API_NAMESPACE, key, value).await,
                None => Arc::new(value),
            })
        };

        match cache_key {
            Some(key) if is_read => {
                self.coalesced(&format!("{}_{}", API_NAMESPACE, key), fetch)
                    .await
            }
            _ => fetch().await,
        }
    }

    async fn send(
        &self,
        method: &Method,
        endpoint: &str,
        body: Option<&Value>,
        auth_required: bool,
    ) -> Result<Value, UpstreamError> {
        let raw_url = format!("{}{}", self.config.base_url, endpoint);
        let url = reqwest::Url::parse(&raw_url)
            .map_err(|e| UpstreamError::InvalidUrl(format!("{}: {}", raw_url, e)))?;

        let mut request = self
            .http
            .request(method.clone(), url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json");
        if auth_required && let Some(token) = self.auth.access_token().await {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;

        if !status.is_success() {
            let parsed: ErrorBody = serde_json::from_slice(&bytes).unwrap_or_default();
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                code: value_as_string(parsed.code),
                message: value_as_string(parsed.message),
                details: parsed.details,
            });
        }

        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn fetch_document(&self, collection: &str, id: &str) -> Result<Document, UpstreamError> {
        self.store()
            .get(collection, id)
            .await?
            .ok_or_else(|| UpstreamError::MissingDocument {
                collection: collection.to_owned(),
                id: id.to_owned(),
            })
    }

    /// Read one document by id; a missing document is `not-found`.
    pub async fn get_document(
        &self,
        collection: &str,
        id: &str,
        options: DocumentOptions,
    ) -> Result<Document, RequestError> {
        const CONTEXT: &str = "Firestore getDocument";
        let cache = options.cache && self.config.cache_enabled;
        let key = document_cache_key(collection, id);

        if cache && let Some(cached) = self.cache.get(FIRESTORE_NAMESPACE, &key).await {
            match Document::deserialize(&*cached) {
                Ok(doc) => return Ok(doc),
                Err(e) => warn!(
                    "Cached document for key {} is unreadable ({}); refetching",
                    key, e
                ),
            }
        }

        let fetch = || async {
            let doc = self
                .with_retry(|| self.fetch_document(collection, id))
                .await
                .map_err(|e| RequestError::from_upstream(e, CONTEXT))?;
            let value = serde_json::to_value(&doc)
                .map_err(|e| RequestError::from_upstream(e.into(), CONTEXT))?;
            Ok::<_, RequestError>(if cache {
                self.cache.set(FIRESTORE_NAMESPACE, &key, value).await
            } else {
                Arc::new(value)
            })
        };

        let value = if cache {
            self.coalesced(&format!("{}_{}", FIRESTORE_NAMESPACE, key), fetch)
                .await?
        } else {
            fetch().await?
        };
        Document::deserialize(&*value)
            .map_err(|e| RequestError::from_upstream(e.into(), CONTEXT))
    }

    /// Read every document matching all `conditions`, up to `options.limit`.
    pub async fn query_collection(
        &self,
        collection: &str,
        conditions: &[Condition],
        options: QueryOptions,
    ) -> Result<Vec<Document>, RequestError> {
        const CONTEXT: &str = "Firestore queryCollection";
        let cache = options.cache && self.config.cache_enabled;
        let key = query_cache_key(collection, conditions, options.limit);

        if cache && let Some(cached) = self.cache.get(FIRESTORE_NAMESPACE, &key).await {
            match Vec::<Document>::deserialize(&*cached) {
                Ok(docs) => return Ok(docs),
                Err(e) => warn!("Cached query for key {} is unreadable ({}); refetching", key, e),
            }
        }

        let fetch = || async {
            let docs = self
                .with_retry(|| async {
                    Ok::<_, UpstreamError>(
                        self.store()
                            .query(collection, conditions, options.limit)
                            .await?,
                    )
                })
                .await
                .map_err(|e| RequestError::from_upstream(e, CONTEXT))?;
            let value = serde_json::to_value(&docs)
                .map_err(|e| RequestError::from_upstream(e.into(), CONTEXT))?;
            Ok::<_, RequestError>(if cache {
                self.cache.set(FIRESTORE_NAMESPACE, &key, value).await
            } else {
                Arc::new(value)
            })
        };

        let value = if cache {
            self.coalesced(&format!("{}_{}", FIRESTORE_NAMESPACE, key), fetch)
                .await?
        } else {
            fetch().await?
        };
        Vec::<Document>::deserialize(&*value)
            .map_err(|e| RequestError::from_upstream(e.into(), CONTEXT))
    }

    /// Cache an arbitrary producer's result under `key` in the `app` namespace.
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
        self.cache.get_or_fetch(key, fetch, skip_cache).await
    }
}
