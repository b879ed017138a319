//! Composition root.
//!
//! [`Gateway`] wires the proxy inventory, identity profiles, browser pool,
//! result store and fetch queue together, owns their lifecycles, and
//! exposes the read-only surface the API layer serves: cache-first fetch,
//! job snapshots, readiness.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

use crate::browser::BrowserPool;
use crate::config::GatewayConfig;
use crate::fetch::SiteRoutines;
use crate::fetch::product::ProductRoutine;
use crate::fetch::store::StoreRoutine;
use crate::identity::IdentityProfiles;
use crate::orchestrator::{FallbackStateStore, FetchQueue, Job, JobKind};
use crate::proxy::ProxyInventory;
use crate::results::ResultStore;
use crate::urlnorm::normalize;

/// What a fetch request resolves to: an immediate cached payload, or a
/// job to poll.
#[derive(Debug, Clone)]
pub enum FetchResponse {
    Cached(Value),
    Enqueued(Job),
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayStats {
    pub queue: crate::orchestrator::QueueStats,
    pub pool: crate::browser::PoolStats,
    pub proxies: crate::proxy::InventoryStats,
    pub cache_entries: (usize, usize, usize),
}

pub struct Gateway {
    queue: Arc<FetchQueue>,
    pool: Arc<BrowserPool>,
    proxies: Arc<ProxyInventory>,
    identities: Arc<IdentityProfiles>,
    results: Arc<ResultStore>,
    ready: AtomicBool,
}

impl Gateway {
    /// Bring every subsystem up, in dependency order. The readiness bit
    /// flips only after the queue has restored persisted state, so API
    /// callers never enqueue into a half-initialized orchestrator.
    pub async fn initialize(cfg: GatewayConfig) -> Result<Arc<Self>> {
        tokio::fs::create_dir_all(&cfg.data_dir)
            .await
            .context("creating gateway data directory")?;

        let identities = Arc::new(IdentityProfiles::load(&cfg.data_dir).await?);
        let results = Arc::new(ResultStore::new(&cfg.caches));

        let proxies = ProxyInventory::new(
            cfg.proxy.clone(),
            cfg.origin.base_url.clone(),
            cfg.data_dir.join("proxies"),
        )
        .await?;
        proxies.start().await;

        let routines = SiteRoutines {
            product: Arc::new(ProductRoutine::new(Arc::clone(&results), cfg.origin.clone())),
            store: Arc::new(StoreRoutine::new(Arc::clone(&results))),
        };

        let pool = BrowserPool::new(
            cfg.browser.clone(),
            Arc::clone(&identities),
            Arc::clone(&proxies),
            routines,
        );
        pool.start().await?;

        let store = Arc::new(FallbackStateStore::open(&cfg.data_dir).await);
        let queue = FetchQueue::restore(
            cfg.queue.clone(),
            pool.clone(),
            Arc::clone(&proxies),
            Arc::clone(&identities),
            Arc::clone(&results),
            store,
        )
        .await?;

        let gateway = Arc::new(Self {
            queue,
            pool,
            proxies,
            identities,
            results,
            ready: AtomicBool::new(true),
        });
        info!("gateway initialized");
        Ok(gateway)
    }

    /// Whether the orchestrator is accepting work. API callers answer
    /// with a transient unavailable response while this is false.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    /// Cache-first fetch: a fresh cached payload is returned without
    /// creating a job; otherwise the URL is enqueued (or its live job
    /// returned).
    pub async fn fetch(&self, url: &str, kind: JobKind) -> Result<FetchResponse> {
        anyhow::ensure!(self.is_ready(), "gateway is not ready");
        let normalized = normalize(url)?;
        if let Some(cached) = self.results.cached_result(&normalized) {
            return Ok(FetchResponse::Cached(cached));
        }
        let job = self.queue.enqueue(&normalized, kind, None).await?;
        Ok(FetchResponse::Enqueued(job))
    }

    /// Fetch through a caller-supplied proxy, bypassing the pool and the
    /// main queue.
    pub async fn fetch_with_proxy(
        &self,
        url: &str,
        kind: JobKind,
        proxy_literal: &str,
    ) -> Result<Job> {
        anyhow::ensure!(self.is_ready(), "gateway is not ready");
        self.queue
            .enqueue(url, kind, Some(proxy_literal.to_string()))
            .await
    }

    pub async fn job(&self, id: &str) -> Option<Job> {
        self.queue.job(id).await
    }

    pub async fn job_by_url(&self, url: &str) -> Option<Job> {
        self.queue.job_by_url(url).await
    }

    #[must_use]
    pub fn proxies(&self) -> &Arc<ProxyInventory> {
        &self.proxies
    }

    #[must_use]
    pub fn identities(&self) -> &Arc<IdentityProfiles> {
        &self.identities
    }

    #[must_use]
    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            queue: self.queue.stats(),
            pool: self.pool.stats(),
            proxies: self.proxies.stats(),
            cache_entries: self.results.counts(),
        }
    }

    /// Orderly shutdown: stop accepting work, flush queue state, close
    /// browsers, stop the proxy loop, persist the identity working set.
    pub async fn shutdown(&self) {
        self.ready.store(false, Ordering::Relaxed);
        self.queue.shutdown().await;
        self.pool.shutdown().await;
        self.proxies.shutdown().await;
        self.identities.persist();
        info!("gateway shut down");
    }
}
