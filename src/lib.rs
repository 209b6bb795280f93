//! labcache - Tiered caching and request gateway for the lab guide data layer
//!
//! This library provides:
//! - A two-tier cache: in-memory Moka entries (fastest) over a persisted
//!   document-store tier shared across sessions, both bounded by one TTL
//! - A request gateway in front of the HTTP API and the document store, with
//!   read-through caching, request coalescing, timeouts and bounded retries
//! - Provider error codes mapped to a closed set with user-facing messages
//! - Favorites and consent-gated analytics built on the same collaborators
//!
//! The cache fails open: a broken persisted tier degrades to cache misses and
//! never surfaces an error.

mod analytics;
mod auth;
mod clock;
mod config;
pub mod document_store;
mod ensaios;
mod error;
mod favorites;
pub mod gateway;
mod in_flight;
mod memory_store;
mod redis_store;
mod tiered_cache;

#[cfg(test)]
mod test_support;

pub use analytics::{
    AnalyticsService, ENSAIO_EVENTS_ENDPOINT, EventForwarder, EventSink, SinkError, UserProfile,
};
pub use auth::{Anonymous, AuthProvider, StaticSession};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AnalyticsConfig, CACHE_VERSION, CacheConfig, GatewayConfig};
pub use document_store::{Condition, Document, DocumentStore, Operator, WriteMode};
pub use ensaios::{CATEGORY_LIMIT, ENSAIOS_COLLECTION};
pub use error::{ErrorCode, RequestError, StoreError, UpstreamError};
pub use favorites::FavoritesService;
pub use gateway::{DocumentOptions, Gateway, QueryOptions, RequestOptions};
pub use memory_store::MemoryStore;
pub use redis_store::RedisStore;
pub use tiered_cache::{APP_NAMESPACE, PersistedEntry, TieredCache, cache_key};

// Re-export async_trait for implementors of the collaborator traits
pub use async_trait::async_trait;
