//! The proxy inventory: best-available proxy per request, kept fresh by a
//! perpetual validation loop and honest by penalty/blacklist bookkeeping.

use anyhow::Result;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::providers::{ProviderConfig, ProviderStats, RotatingProvider, build_provider};
use super::sources::{SourceBook, fetch_source, parse_env_list, validate_location};
use super::types::{IpType, ProxyProtocol, ProxyRecord};
use super::validate::{Validator, trim_pool};
use crate::config::{ProxyConfig, RotationStrategy};

/// Runtime health for one proxy key. Counters live here rather than on
/// the record so a re-ingested proxy keeps its history.
#[derive(Debug, Clone, Default)]
pub struct ProxyHealth {
    pub success_count: u32,
    pub fail_count: u32,
    pub penalty_until: Option<Instant>,
    pub deactivated: bool,
}

impl ProxyHealth {
    fn success_ratio(&self) -> f64 {
        f64::from(self.success_count) / f64::from(self.fail_count + 1)
    }

    fn success_rate(&self) -> f64 {
        let attempts = self.success_count + self.fail_count;
        if attempts == 0 {
            0.5
        } else {
            f64::from(self.success_count) / f64::from(attempts)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InventoryStats {
    pub pool_size: usize,
    pub whitelisted: usize,
    pub bad: usize,
    pub providers: usize,
    pub sticky_sessions: usize,
}

pub struct ProxyInventory {
    cfg: ProxyConfig,
    /// Priority-sorted validated pool. Penalized/deactivated records are
    /// filtered out at read time, not removed.
    pool: Mutex<Vec<ProxyRecord>>,
    health: DashMap<String, ProxyHealth>,
    whitelist: Mutex<HashSet<String>>,
    bad: Mutex<HashSet<String>>,
    sticky: DashMap<String, ProxyRecord>,
    last_used: DashMap<String, Instant>,
    providers: Mutex<Vec<Arc<dyn RotatingProvider>>>,
    sources: Mutex<SourceBook>,
    validator: Validator,
    client: reqwest::Client,
    data_dir: PathBuf,
    shutdown: AtomicBool,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ProxyInventory {
    /// Create the inventory without starting background work. Call
    /// [`start`](Self::start) to load persisted state and begin the
    /// validation loop.
    pub async fn new(cfg: ProxyConfig, origin_url: String, data_dir: PathBuf) -> Result<Arc<Self>> {
        tokio::fs::create_dir_all(&data_dir).await?;
        let sources = SourceBook::load(&data_dir).await?;
        let validator = Validator::new(cfg.clone(), origin_url);
        Ok(Arc::new(Self {
            cfg,
            pool: Mutex::new(Vec::new()),
            health: DashMap::new(),
            whitelist: Mutex::new(HashSet::new()),
            bad: Mutex::new(HashSet::new()),
            sticky: DashMap::new(),
            last_used: DashMap::new(),
            providers: Mutex::new(Vec::new()),
            sources: Mutex::new(sources),
            validator,
            client: reqwest::Client::new(),
            data_dir,
            shutdown: AtomicBool::new(false),
            loop_handle: Mutex::new(None),
        }))
    }

    /// Load persisted pool/whitelist/bad set and start the validation loop.
    pub async fn start(self: &Arc<Self>) {
        self.load_persisted().await;

        let inventory = Arc::clone(self);
        let handle = tokio::spawn(async move {
            validation_loop(inventory).await;
        });
        *self.loop_handle.lock() = Some(handle);
    }

    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.loop_handle.lock().take() {
            handle.abort();
        }
        let providers: Vec<Arc<dyn RotatingProvider>> = self.providers.lock().clone();
        for provider in providers {
            provider.shutdown().await;
        }
        self.persist_all();
        info!("proxy inventory shut down");
    }

    // =========================================================================
    // Acquisition
    // =========================================================================

    /// Best-available proxy per the configured rotation strategy.
    ///
    /// A `session_id` pins the caller to one proxy for the session's
    /// lifetime. Rotating providers are consulted before the validated
    /// pool; a provider returning nothing falls through.
    pub async fn acquire(
        &self,
        protocol: Option<ProxyProtocol>,
        session_id: Option<&str>,
    ) -> Option<ProxyRecord> {
        if let Some(sid) = session_id
            && let Some(stuck) = self.sticky.get(sid)
        {
            let record = stuck.value().clone();
            if !self.is_bad(&record.key()) {
                return Some(record);
            }
            drop(stuck);
            self.sticky.remove(sid);
        }

        let selected = match self.acquire_from_providers().await {
            Some(record) => Some(record),
            None => self.acquire_from_pool(protocol),
        }?;

        self.last_used.insert(selected.key(), Instant::now());
        if let Some(sid) = session_id {
            self.sticky.insert(sid.to_string(), selected.clone());
        }
        Some(selected)
    }

    async fn acquire_from_providers(&self) -> Option<ProxyRecord> {
        let providers: Vec<Arc<dyn RotatingProvider>> = self.providers.lock().clone();
        for provider in providers {
            if let Some(record) = provider.acquire().await {
                if self.is_bad(&record.key()) {
                    continue;
                }
                return Some(record);
            }
            debug!(provider = %provider.name(), "provider returned nothing, falling back");
        }
        None
    }

    fn acquire_from_pool(&self, protocol: Option<ProxyProtocol>) -> Option<ProxyRecord> {
        let now = Instant::now();
        let candidates: Vec<ProxyRecord> = {
            let pool = self.pool.lock();
            pool.iter()
                .filter(|p| protocol.is_none_or(|wanted| p.protocol == wanted))
                .filter(|p| !self.is_bad(&p.key()))
                .filter(|p| !self.is_penalized_at(&p.key(), now))
                .cloned()
                .collect()
        };
        if candidates.is_empty() {
            return None;
        }
        self.select(candidates)
    }

    fn select(&self, candidates: Vec<ProxyRecord>) -> Option<ProxyRecord> {
        match self.cfg.rotation_strategy {
            RotationStrategy::RoundRobin => self.least_recently_used(&candidates),
            RotationStrategy::LatencyBased | RotationStrategy::StickySession => {
                // Candidates arrive priority-sorted; racing the top five
                // through LRU avoids pinning everything on the single
                // fastest proxy. Sticky selection reuses the same policy
                // for its first pick.
                let top: Vec<ProxyRecord> = candidates.into_iter().take(5).collect();
                self.least_recently_used(&top)
            }
            RotationStrategy::Weighted => self.weighted_draw(&candidates),
            RotationStrategy::Random => {
                let idx = rand::rng().random_range(0..candidates.len());
                Some(candidates[idx].clone())
            }
        }
    }

    fn least_recently_used(&self, candidates: &[ProxyRecord]) -> Option<ProxyRecord> {
        // `None` sorts before any timestamp, so never-used proxies go first.
        candidates
            .iter()
            .min_by_key(|p| self.last_used.get(&p.key()).map(|at| *at.value()))
            .cloned()
    }

    fn weighted_draw(&self, candidates: &[ProxyRecord]) -> Option<ProxyRecord> {
        let max_latency = self.cfg.max_latency_ms.max(1) as f64;
        let weights: Vec<f64> = candidates
            .iter()
            .map(|p| {
                let health = self
                    .health
                    .get(&p.key())
                    .map(|h| h.value().clone())
                    .unwrap_or_default();
                let latency = p.latency_ms.unwrap_or(self.cfg.max_latency_ms) as f64;
                let latency_score = 1.0 - (latency / max_latency).min(1.0);
                (0.7 * health.success_rate() + 0.3 * latency_score).max(0.001)
            })
            .collect();
        let total: f64 = weights.iter().sum();
        let mut roll = rand::rng().random_range(0.0..total);
        for (record, weight) in candidates.iter().zip(&weights) {
            if roll < *weight {
                return Some(record.clone());
            }
            roll -= weight;
        }
        candidates.last().cloned()
    }

    // =========================================================================
    // Outcome bookkeeping
    // =========================================================================

    /// Record a successful use: bump the counter and clear any transient
    /// penalty.
    pub fn mark_success(&self, record: &ProxyRecord) {
        let mut health = self.health.entry(record.key()).or_default();
        health.success_count += 1;
        health.penalty_until = None;
    }

    /// Alias kept for call sites that think in acquire/release pairs.
    pub fn release(&self, record: &ProxyRecord) {
        self.mark_success(record);
    }

    /// Record a failure. Every call applies a cool-off penalty; crossing
    /// the failure threshold deactivates the proxy permanently and adds
    /// it to the persisted bad set.
    pub async fn mark_bad(&self, record: &ProxyRecord) {
        let key = record.key();
        let deactivated = {
            let mut health = self.health.entry(key.clone()).or_default();
            health.fail_count += 1;
            let penalty = if health.fail_count >= self.cfg.max_failures {
                Duration::from_secs(self.cfg.strike_penalty_secs)
            } else {
                Duration::from_secs(self.cfg.penalty_secs)
            };
            let proposed = Instant::now() + penalty;
            // Penalties only ever extend; repeated failures must not
            // shorten an existing cool-off.
            health.penalty_until = Some(match health.penalty_until {
                Some(existing) if existing > proposed => existing,
                _ => proposed,
            });
            if health.fail_count >= self.cfg.max_failures && !health.deactivated {
                health.deactivated = true;
                true
            } else {
                false
            }
        };

        if deactivated {
            warn!(proxy = %key, "proxy deactivated after repeated failures");
            self.bad.lock().insert(key.clone());
            self.whitelist.lock().remove(&key);
            self.persist_all();
        }

        if record.is_rotating {
            let providers: Vec<Arc<dyn RotatingProvider>> = self.providers.lock().clone();
            for provider in providers {
                if provider.name() == record.source {
                    provider.mark_bad(record).await;
                }
            }
        }
    }

    /// Add to the persisted whitelist; whitelisted proxies rank above the
    /// rest of the pool during selection.
    pub fn mark_working(&self, record: &ProxyRecord) {
        let key = record.key();
        {
            let mut whitelist = self.whitelist.lock();
            if whitelist.insert(key.clone()) {
                info!(proxy = %key, "proxy whitelisted");
            }
        }
        self.mark_success(record);
        self.sort_pool();
        self.persist_all();
    }

    #[must_use]
    pub fn is_penalized(&self, key: &str) -> bool {
        self.is_penalized_at(key, Instant::now())
    }

    fn is_penalized_at(&self, key: &str, now: Instant) -> bool {
        self.health
            .get(key)
            .is_some_and(|h| h.penalty_until.is_some_and(|until| until > now))
    }

    #[must_use]
    pub fn is_bad(&self, key: &str) -> bool {
        self.bad.lock().contains(key)
    }

    #[must_use]
    pub fn health_of(&self, key: &str) -> Option<ProxyHealth> {
        self.health.get(key).map(|h| h.value().clone())
    }

    /// Look up a pool record by key, for re-marking after a restart.
    #[must_use]
    pub fn record_by_key(&self, key: &str) -> Option<ProxyRecord> {
        self.pool.lock().iter().find(|p| p.key() == key).cloned()
    }

    // =========================================================================
    // Sources and providers
    // =========================================================================

    pub fn add_source(&self, name: &str, location: &str) -> Result<()> {
        validate_location(location)?;
        self.sources.lock().add(name, location);
        info!(source = name, location, "proxy source added");
        Ok(())
    }

    pub fn delete_source(&self, name: &str) -> bool {
        let removed = self.sources.lock().delete(name);
        if removed {
            info!(source = name, "proxy source deleted");
        }
        removed
    }

    pub async fn add_rotating_provider(&self, name: &str, config: ProviderConfig) -> Result<()> {
        let provider = build_provider(name, config);
        if let Err(e) = provider.initialize().await {
            warn!(provider = name, "provider initialization failed: {e}");
        }
        self.providers.lock().push(provider);
        info!(provider = name, "rotating provider attached");
        Ok(())
    }

    pub async fn remove_rotating_provider(&self, name: &str) -> bool {
        let removed = {
            let mut providers = self.providers.lock();
            let before = providers.len();
            let mut kept = Vec::with_capacity(before);
            let mut dropped = Vec::new();
            for p in providers.drain(..) {
                if p.name() == name {
                    dropped.push(p);
                } else {
                    kept.push(p);
                }
            }
            *providers = kept;
            dropped
        };
        for provider in &removed {
            provider.shutdown().await;
        }
        !removed.is_empty()
    }

    #[must_use]
    pub fn provider_stats(&self) -> Vec<(String, ProviderStats)> {
        self.providers
            .lock()
            .iter()
            .map(|p| (p.name().to_string(), p.stats()))
            .collect()
    }

    // =========================================================================
    // Validation cycle
    // =========================================================================

    /// One full cycle: ingest every source, revalidate stale records,
    /// merge, trim, sort, persist. Public so tests and admin tooling can
    /// force a cycle.
    pub async fn run_validation_cycle(&self) {
        let sources = self.sources.lock().all();
        let mut incoming: Vec<ProxyRecord> = parse_env_list();
        for source in &sources {
            match fetch_source(&self.client, source).await {
                Ok(records) => incoming.extend(records),
                Err(e) => warn!(source = %source.name, "source ingestion failed: {e}"),
            }
        }

        let revalidation_cutoff =
            Utc::now() - chrono::Duration::seconds(self.cfg.revalidation_threshold_secs as i64);

        let (mut fresh, stale): (Vec<ProxyRecord>, Vec<ProxyRecord>) = {
            let pool = self.pool.lock();
            pool.iter().cloned().partition(|p| {
                p.is_rotating || p.last_validated.is_some_and(|at| at > revalidation_cutoff)
            })
        };

        let mut to_validate: Vec<ProxyRecord> = Vec::new();
        let mut seen: HashSet<String> = fresh.iter().map(ProxyRecord::key).collect();
        for record in stale.into_iter().chain(incoming) {
            if self.is_bad(&record.key()) || !seen.insert(record.key()) {
                continue;
            }
            if record.is_rotating {
                // Provider output is assumed live; give it a synthetic
                // valid record instead of burning a probe on it.
                let mut record = record;
                record.last_validated = Some(Utc::now());
                record.can_reach_origin = true;
                fresh.push(record);
            } else {
                to_validate.push(record);
            }
        }

        let validated = self.validator.validate_batch(to_validate).await;
        debug!(validated = validated.len(), kept = fresh.len(), "validation cycle merged");

        fresh.extend(validated);
        let trimmed = trim_pool(fresh, self.cfg.max_size, |p| {
            self.health
                .get(&p.key())
                .map(|h| h.success_ratio())
                .unwrap_or(0.0)
        });

        {
            let mut pool = self.pool.lock();
            *pool = trimmed;
        }
        self.sort_pool();

        let size = self.pool.lock().len();
        if size < self.cfg.min_size {
            warn!(size, min = self.cfg.min_size, "proxy pool below minimum size");
        }
        self.persist_all();
    }

    /// Re-sort the pool by the selection priority tuple:
    /// rotating-provider > env source > whitelisted > residential > lowest
    /// latency.
    fn sort_pool(&self) {
        let whitelist = self.whitelist.lock().clone();
        let mut pool = self.pool.lock();
        pool.sort_by_key(|p| {
            (
                u8::from(!p.is_rotating),
                u8::from(p.source != "env"),
                u8::from(!whitelist.contains(&p.key())),
                u8::from(p.ip_type != IpType::Residential),
                p.latency_ms.unwrap_or(u64::MAX),
            )
        });
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    async fn load_persisted(&self) {
        if let Some(pool) = read_json::<Vec<ProxyRecord>>(&self.data_dir.join("proxies.json")).await
        {
            info!(count = pool.len(), "loaded persisted proxy pool");
            *self.pool.lock() = pool;
        }
        if let Some(whitelist) =
            read_json::<Vec<String>>(&self.data_dir.join("whitelist.json")).await
        {
            *self.whitelist.lock() = whitelist.into_iter().collect();
        }
        if let Some(bad) = read_json::<Vec<String>>(&self.data_dir.join("bad_proxies.json")).await {
            *self.bad.lock() = bad.into_iter().collect();
        }
        self.sort_pool();
    }

    fn persist_all(&self) {
        let pool = self.pool.lock().clone();
        write_json(&self.data_dir.join("proxies.json"), &pool);
        let whitelist: Vec<String> = self.whitelist.lock().iter().cloned().collect();
        write_json(&self.data_dir.join("whitelist.json"), &whitelist);
        let bad: Vec<String> = self.bad.lock().iter().cloned().collect();
        write_json(&self.data_dir.join("bad_proxies.json"), &bad);
    }

    #[must_use]
    pub fn stats(&self) -> InventoryStats {
        InventoryStats {
            pool_size: self.pool.lock().len(),
            whitelisted: self.whitelist.lock().len(),
            bad: self.bad.lock().len(),
            providers: self.providers.lock().len(),
            sticky_sessions: self.sticky.len(),
        }
    }

    /// Test/bootstrap hook: seed the pool directly, bypassing validation.
    pub fn seed_pool(&self, records: Vec<ProxyRecord>) {
        {
            let mut pool = self.pool.lock();
            pool.extend(records);
        }
        self.sort_pool();
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &std::path::Path) -> Option<T> {
    let raw = tokio::fs::read_to_string(path).await.ok()?;
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("malformed persisted document {}: {e}", path.display());
            None
        }
    }
}

fn write_json<T: Serialize>(path: &std::path::Path, value: &T) {
    match serde_json::to_vec_pretty(value) {
        Ok(bytes) => {
            if let Err(e) = std::fs::write(path, bytes) {
                warn!("failed to persist {}: {e}", path.display());
            }
        }
        Err(e) => warn!("failed to serialize {}: {e}", path.display()),
    }
}

async fn validation_loop(inventory: Arc<ProxyInventory>) {
    let interval = Duration::from_secs(inventory.cfg.validation_interval_secs);
    loop {
        inventory.run_validation_cycle().await;
        if inventory.shutdown.load(Ordering::Relaxed) {
            break;
        }
        tokio::time::sleep(interval).await;
        if inventory.shutdown.load(Ordering::Relaxed) {
            break;
        }
    }
    debug!("proxy validation loop exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::types::ProxyProtocol;

    fn test_cfg() -> ProxyConfig {
        ProxyConfig {
            penalty_secs: 300,
            strike_penalty_secs: 3600,
            max_failures: 3,
            ..Default::default()
        }
    }

    async fn inventory_with(records: Vec<ProxyRecord>) -> Arc<ProxyInventory> {
        let dir = tempfile::tempdir().unwrap().keep();
        let inv = ProxyInventory::new(test_cfg(), "https://shop.example.com".to_string(), dir)
            .await
            .unwrap();
        inv.seed_pool(records);
        inv
    }

    fn proxy(host: &str) -> ProxyRecord {
        let mut p = ProxyRecord::new(host, 8080, ProxyProtocol::Http);
        p.latency_ms = Some(100);
        p.last_validated = Some(Utc::now());
        p
    }

    #[tokio::test]
    async fn three_strikes_deactivates() {
        let inv = inventory_with(vec![proxy("203.0.113.1")]).await;
        let p = proxy("203.0.113.1");

        inv.mark_bad(&p).await;
        assert!(inv.is_penalized(&p.key()));
        assert!(!inv.is_bad(&p.key()));

        inv.mark_bad(&p).await;
        inv.mark_bad(&p).await;
        assert!(inv.is_bad(&p.key()));
        assert!(inv.health_of(&p.key()).unwrap().deactivated);
        assert!(inv.acquire(None, None).await.is_none());
    }

    #[tokio::test]
    async fn penalty_is_monotonic() {
        let inv = inventory_with(vec![proxy("203.0.113.1")]).await;
        let p = proxy("203.0.113.1");

        inv.mark_bad(&p).await;
        let first = inv.health_of(&p.key()).unwrap().penalty_until.unwrap();
        inv.mark_bad(&p).await;
        let second = inv.health_of(&p.key()).unwrap().penalty_until.unwrap();
        assert!(second >= first, "penalty must never shrink");
    }

    #[tokio::test]
    async fn penalized_proxies_are_skipped() {
        let inv = inventory_with(vec![proxy("203.0.113.1"), proxy("203.0.113.2")]).await;
        let bad = proxy("203.0.113.1");
        inv.mark_bad(&bad).await;

        for _ in 0..5 {
            let picked = inv.acquire(None, None).await.unwrap();
            assert_eq!(picked.key(), "203.0.113.2:8080");
        }
    }

    #[tokio::test]
    async fn success_clears_penalty() {
        let inv = inventory_with(vec![proxy("203.0.113.1")]).await;
        let p = proxy("203.0.113.1");
        inv.mark_bad(&p).await;
        assert!(inv.is_penalized(&p.key()));
        inv.mark_success(&p);
        assert!(!inv.is_penalized(&p.key()));
    }

    #[tokio::test]
    async fn deactivation_removes_from_whitelist() {
        let inv = inventory_with(vec![proxy("203.0.113.1")]).await;
        let p = proxy("203.0.113.1");
        inv.mark_working(&p);
        assert_eq!(inv.stats().whitelisted, 1);
        for _ in 0..3 {
            inv.mark_bad(&p).await;
        }
        assert_eq!(inv.stats().whitelisted, 0);
        assert_eq!(inv.stats().bad, 1);
    }

    #[tokio::test]
    async fn sticky_session_reuses_choice() {
        let inv = inventory_with(vec![proxy("203.0.113.1"), proxy("203.0.113.2")]).await;
        let first = inv.acquire(None, Some("sess-1")).await.unwrap();
        for _ in 0..4 {
            let again = inv.acquire(None, Some("sess-1")).await.unwrap();
            assert_eq!(first.key(), again.key());
        }
    }

    #[tokio::test]
    async fn protocol_filter_is_applied() {
        let mut socks = proxy("203.0.113.9");
        socks.protocol = ProxyProtocol::Socks5;
        let inv = inventory_with(vec![proxy("203.0.113.1"), socks]).await;

        let picked = inv
            .acquire(Some(ProxyProtocol::Socks5), None)
            .await
            .unwrap();
        assert_eq!(picked.protocol, ProxyProtocol::Socks5);
    }

    #[tokio::test]
    async fn residential_ranks_above_datacenter() {
        let mut dc = proxy("203.0.113.1");
        dc.ip_type = IpType::Datacenter;
        dc.latency_ms = Some(10);
        let mut res = proxy("203.0.113.2");
        res.ip_type = IpType::Residential;
        res.latency_ms = Some(900);

        let inv = inventory_with(vec![dc, res]).await;
        let picked = inv.acquire(None, None).await.unwrap();
        assert_eq!(picked.key(), "203.0.113.2:8080");
    }

    #[tokio::test]
    async fn empty_pool_yields_none() {
        let inv = inventory_with(Vec::new()).await;
        assert!(inv.acquire(None, None).await.is_none());
    }
}
