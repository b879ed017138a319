//! storescrape: a resilient scraping gateway for hostile storefront
//! origins.
//!
//! Callers submit a product, store or category URL; the gateway returns
//! the corresponding JSON payload while hiding the machinery required to
//! obtain it: a pool of stealth-configured headless browsers bound to
//! rotating network identities, a job queue with deduplication and hedged
//! execution, a multi-tier cache serving partial results during long
//! fetches, and a continuously self-validating proxy inventory.

pub mod browser;
pub mod cancel;
pub mod config;
pub mod fetch;
pub mod gateway;
pub mod identity;
pub mod orchestrator;
pub mod proxy;
pub mod results;
pub mod urlnorm;

pub use browser::{BrowserPool, PoolStats};
pub use cancel::CancelToken;
pub use config::{
    BrowserPoolConfig, CacheConfig, GatewayConfig, OriginConfig, ProxiedCount, ProxyConfig,
    QueueConfig, RotationStrategy,
};
pub use fetch::{FetchOutcome, FetchRoutine, ProgressSink, SiteRoutines, TabSession};
pub use gateway::{FetchResponse, Gateway, GatewayStats};
pub use identity::{Identity, IdentityProfiles};
pub use orchestrator::{
    ErrorClass, FallbackStateStore, FetchQueue, FileStateStore, Job, JobId, JobKind, JobStatus,
    PersistedState, QueueStats, SqliteStateStore, StateStore, TabRef, WorkerPool, classify,
};
pub use proxy::{
    IpType, ProviderConfig, ProxyInventory, ProxyProtocol, ProxyRecord, RotatingProvider,
    parse_proxy_literal,
};
pub use results::{ResultStore, TtlCache};
pub use urlnorm::normalize;
