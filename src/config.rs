//! Cache, gateway and analytics configuration

use std::time::Duration;

/// Version tag written into every persisted cache entry.
pub const CACHE_VERSION: &str = "v1";

/// Configuration for the tiered cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum age of an entry in either tier
    pub ttl: Duration,
    /// Version tag stored alongside persisted entries; entries with another tag are misses
    pub version: String,
    /// Optional bound on the volatile tier (unbounded when `None`)
    pub volatile_max_capacity: Option<u64>,
    /// Document collection holding the persisted tier
    pub persisted_collection: String,
    /// Upper bound on a single persisted-tier read or write
    pub store_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(15 * 60),
            version: CACHE_VERSION.to_owned(),
            volatile_max_capacity: None,
            persisted_collection: "cache".to_owned(),
            store_timeout: Duration::from_secs(5),
        }
    }
}

/// Configuration for the request gateway
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Prefix for every HTTP endpoint
    pub base_url: String,
    /// Master switch for read-through caching
    pub cache_enabled: bool,
    /// Extra attempts after a transient failure
    pub max_retries: u32,
    /// Upper bound on a single underlying HTTP or store call
    pub request_timeout: Duration,
    /// First retry delay, doubled on each further attempt
    pub retry_base_delay: Duration,
    /// Ceiling for the retry delay
    pub retry_max_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.geotechlabguide.com/v1".to_owned(),
            cache_enabled: true,
            max_retries: 2,
            request_timeout: Duration::from_secs(10),
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_millis(2000),
        }
    }
}

/// Configuration for the analytics service
#[derive(Debug, Clone)]
pub struct AnalyticsConfig {
    /// Reported as `app_version` on every event
    pub app_version: String,
    /// Debug mode grants consent unconditionally and keeps error stacks
    pub debug: bool,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            app_version: "1.0.0".to_owned(),
            debug: false,
        }
    }
}
