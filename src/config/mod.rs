//! Gateway configuration.
//!
//! One aggregate [`GatewayConfig`] with per-subsystem sections. Defaults
//! match the timings the orchestrator is tuned around; everything is
//! overridable programmatically and, at the composition root, from the
//! environment.

mod types;

pub use types::{
    BrowserPoolConfig, CacheConfig, GatewayConfig, OriginConfig, ProxiedCount, ProxyConfig,
    QueueConfig, RotationStrategy,
};

/// Environment variable holding a comma-separated inline proxy allow-list.
pub const PROXY_LIST_ENV: &str = "STORESCRAPE_PROXIES";
