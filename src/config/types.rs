//! Configuration types for the gateway and its subsystems.

use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;

/// Aggregate configuration handed to [`crate::gateway::Gateway::initialize`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub browser: BrowserPoolConfig,
    pub proxy: ProxyConfig,
    pub caches: CacheConfig,
    pub queue: QueueConfig,
    pub origin: OriginConfig,
    /// Directory holding every persisted document (queue state, proxy pool,
    /// identity working set).
    pub data_dir: PathBuf,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            browser: BrowserPoolConfig::default(),
            proxy: ProxyConfig::default(),
            caches: CacheConfig::default(),
            queue: QueueConfig::default(),
            origin: OriginConfig::default(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("storescrape")
}

impl GatewayConfig {
    /// Build a config from defaults plus environment overrides. Only the
    /// knobs an operator actually flips live here; the rest stays
    /// programmatic.
    #[must_use]
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(dir) = std::env::var("STORESCRAPE_DATA_DIR") {
            cfg.data_dir = PathBuf::from(dir);
        }
        if let Ok(origin) = std::env::var("STORESCRAPE_ORIGIN") {
            cfg.origin.base_url = origin;
        }
        if let Ok(headless) = std::env::var("STORESCRAPE_HEADLESS") {
            cfg.browser.headless = !matches!(headless.as_str(), "0" | "false" | "no");
        }
        if let Ok(max) = std::env::var("STORESCRAPE_MAX_BROWSERS")
            && let Ok(n) = max.parse::<usize>()
        {
            cfg.browser.max_browsers = n.max(1);
        }
        cfg
    }

    #[must_use]
    pub fn with_data_dir(mut self, dir: PathBuf) -> Self {
        self.data_dir = dir;
        self
    }

    #[must_use]
    pub fn with_origin(mut self, base_url: impl Into<String>) -> Self {
        self.origin.base_url = base_url.into();
        self
    }
}

// =============================================================================
// Browser pool
// =============================================================================

/// How many browser slots get a proxy bound at launch.
///
/// Accepts a numeric literal, `true` (every slot), `false` (none), or a
/// negative integer meaning "all except |n|".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxiedCount {
    Count(usize),
    All,
    None,
    AllExcept(usize),
}

impl Serialize for ProxiedCount {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            ProxiedCount::Count(n) => serializer.serialize_u64(*n as u64),
            ProxiedCount::All => serializer.serialize_bool(true),
            ProxiedCount::None => serializer.serialize_bool(false),
            ProxiedCount::AllExcept(n) => serializer.serialize_i64(-(*n as i64)),
        }
    }
}

impl ProxiedCount {
    /// Resolve against the pool size into a concrete slot count.
    #[must_use]
    pub fn resolve(self, max_browsers: usize) -> usize {
        match self {
            ProxiedCount::Count(n) => n.min(max_browsers),
            ProxiedCount::All => max_browsers,
            ProxiedCount::None => 0,
            ProxiedCount::AllExcept(n) => max_browsers.saturating_sub(n),
        }
    }
}

impl<'de> Deserialize<'de> for ProxiedCount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        match value {
            serde_json::Value::Bool(true) => Ok(ProxiedCount::All),
            serde_json::Value::Bool(false) => Ok(ProxiedCount::None),
            serde_json::Value::Number(n) => {
                if let Some(neg) = n.as_i64().filter(|v| *v < 0) {
                    Ok(ProxiedCount::AllExcept(neg.unsigned_abs() as usize))
                } else if let Some(count) = n.as_u64() {
                    Ok(ProxiedCount::Count(count as usize))
                } else {
                    Err(serde::de::Error::custom("proxied_count must be an integer"))
                }
            }
            other => Err(serde::de::Error::custom(format!(
                "proxied_count must be a number or bool, got {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserPoolConfig {
    /// Browsers launched eagerly at startup.
    pub min_browsers: usize,
    /// Hard slot ceiling; scale-up never exceeds it.
    pub max_browsers: usize,
    /// Floor of tabs an instance must come up with before entering service.
    pub min_tabs: usize,
    pub tabs_per_browser: usize,
    pub proxied_count: ProxiedCount,
    pub headless: bool,
    /// Navigation timeout for warm-up and routine navigations, seconds.
    pub navigation_timeout_secs: u64,
    /// Budget for closing a browser during restart/shutdown, seconds.
    pub close_timeout_secs: u64,
    /// Fetches a tab serves before it takes a rest window.
    pub tab_fetch_limit: u32,
    /// Length of a tab's rest window, seconds.
    pub tab_rest_secs: u64,
}

impl Default for BrowserPoolConfig {
    fn default() -> Self {
        Self {
            min_browsers: 1,
            max_browsers: 4,
            min_tabs: 1,
            tabs_per_browser: 3,
            proxied_count: ProxiedCount::Count(2),
            headless: true,
            navigation_timeout_secs: 25,
            close_timeout_secs: 5,
            tab_fetch_limit: 25,
            tab_rest_secs: 30,
        }
    }
}

impl BrowserPoolConfig {
    /// Slots `proxied_slot_floor()..max_browsers` bind a proxy at launch.
    /// Lower-id slots dispatch first, so direct connections are tried
    /// before proxied ones.
    #[must_use]
    pub fn proxied_slot_floor(&self) -> usize {
        self.max_browsers - self.proxied_count.resolve(self.max_browsers)
    }

    #[must_use]
    pub fn slot_is_proxied(&self, slot: usize) -> bool {
        slot >= self.proxied_slot_floor()
    }
}

// =============================================================================
// Proxy inventory
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RotationStrategy {
    RoundRobin,
    #[default]
    LatencyBased,
    Weighted,
    StickySession,
    Random,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Pool ceiling after a validation cycle.
    pub max_size: usize,
    /// Below this the validation loop logs a shortage warning.
    pub min_size: usize,
    /// Seconds between validation cycles.
    pub validation_interval_secs: u64,
    /// Proxies validated longer ago than this are re-validated.
    pub revalidation_threshold_secs: u64,
    /// Concurrent validations per batch.
    pub batch_size: usize,
    pub rotation_strategy: RotationStrategy,
    /// Per-probe timeout, seconds.
    pub probe_timeout_secs: u64,
    /// Probes slower than this are rejected, milliseconds.
    pub max_latency_ms: u64,
    /// Transient penalty applied by `mark_bad`, seconds.
    pub penalty_secs: u64,
    /// Penalty applied on the strike that deactivates, seconds.
    pub strike_penalty_secs: u64,
    /// Failures before permanent deactivation.
    pub max_failures: u32,
    /// IP-info endpoint used for connectivity + classification probes.
    pub ipinfo_url: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_size: 500,
            min_size: 10,
            validation_interval_secs: 30 * 60,
            revalidation_threshold_secs: 60 * 60,
            batch_size: 200,
            rotation_strategy: RotationStrategy::LatencyBased,
            probe_timeout_secs: 5,
            max_latency_ms: 2500,
            penalty_secs: 5 * 60,
            strike_penalty_secs: 60 * 60,
            max_failures: 3,
            ipinfo_url: "https://ipinfo.io/json".to_string(),
        }
    }
}

// =============================================================================
// Caches
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Final result cache TTL, seconds.
    pub result_ttl_secs: u64,
    /// Store metadata (channel id) TTL, seconds.
    pub preload_store_ttl_secs: u64,
    /// Preloaded product partials TTL, seconds.
    pub preload_product_ttl_secs: u64,
    pub result_capacity: usize,
    pub preload_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            result_ttl_secs: 10 * 60,
            preload_store_ttl_secs: 24 * 60 * 60,
            preload_product_ttl_secs: 15 * 60,
            result_capacity: 4096,
            preload_capacity: 16384,
        }
    }
}

// =============================================================================
// Queue
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Retry budget per attempt.
    pub max_attempts: u32,
    /// Delay before arming the hedge attempt, milliseconds.
    pub hedge_delay_ms: u64,
    /// Terminal jobs older than this are swept, seconds.
    pub finished_retention_secs: u64,
    /// Sweep cadence, seconds.
    pub cleanup_interval_secs: u64,
    /// Full-state persistence flush cadence, seconds.
    pub flush_interval_secs: u64,
    /// Cap on follow-up product jobs scheduled from one store payload.
    pub max_store_fanout: usize,
    /// Back-off after a recoverable failure before the next retry, seconds.
    pub retry_backoff_secs: u64,
    /// Back-off when identity rotation found nothing to rotate to, seconds.
    pub identity_backoff_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            hedge_delay_ms: 2000,
            finished_retention_secs: 24 * 60 * 60,
            cleanup_interval_secs: 60 * 60,
            flush_interval_secs: 5 * 60,
            max_store_fanout: 50,
            retry_backoff_secs: 3,
            identity_backoff_secs: 5,
        }
    }
}

// =============================================================================
// Origin
// =============================================================================

/// The storefront origin the gateway fronts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OriginConfig {
    pub base_url: String,
    /// Product API path; `{channel}` and `{product}` are substituted.
    pub product_api_path: String,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            base_url: "https://shop.example.com".to_string(),
            product_api_path: "/i/v2/channels/{channel}/products/{product}".to_string(),
        }
    }
}

impl OriginConfig {
    #[must_use]
    pub fn product_api_url(&self, channel_id: &str, product_id: &str) -> String {
        let path = self
            .product_api_path
            .replace("{channel}", channel_id)
            .replace("{product}", product_id);
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}
