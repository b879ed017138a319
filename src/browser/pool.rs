//! The browser pool: slot-indexed instances, each wearing one identity
//! and optionally bound to one proxy, each exposing a fixed set of tabs.
//!
//! Slot ids double as dispatch priority: low-id slots launch direct, the
//! last `proxied_count` slots launch behind a proxy, and the dispatcher
//! prefers low ids, so direct connections are tried first.

use anyhow::{Context, Result};
use chromiumoxide::browser::Browser;
use chromiumoxide::page::Page;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::launch::{launch_browser, remove_profile_dir, sweep_stale_profiles};
use super::stealth::{apply_identity, install_interceptor};
use crate::cancel::CancelToken;
use crate::config::BrowserPoolConfig;
use crate::fetch::{FetchOutcome, ProgressSink, SiteRoutines, TabSession};
use crate::identity::{Identity, IdentityProfiles};
use crate::orchestrator::{JobKind, TabRef, WorkerPool};
use crate::proxy::{ProxyInventory, ProxyRecord, ephemeral_record};

struct TabMeta {
    user_agent: String,
    fetch_count: u32,
    resting_until: Option<Instant>,
    current_job: Option<String>,
}

struct TabSlot {
    page: Page,
    interceptor: JoinHandle<()>,
    meta: Mutex<TabMeta>,
}

struct BrowserInstance {
    browser: tokio::sync::Mutex<Browser>,
    handler: JoinHandle<()>,
    identity: Mutex<Identity>,
    bound_proxy: Option<ProxyRecord>,
    tabs: Vec<TabSlot>,
    consecutive_failures: AtomicU32,
    user_data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub active: usize,
    pub pending: usize,
    pub restarting: usize,
    pub proxied: usize,
    pub tabs: usize,
}

pub struct BrowserPool {
    cfg: BrowserPoolConfig,
    identities: Arc<IdentityProfiles>,
    proxies: Arc<ProxyInventory>,
    routines: SiteRoutines,
    slots: RwLock<Vec<Option<Arc<BrowserInstance>>>>,
    /// Slots with a launch in flight; scale-up counts these as occupied.
    pending: Mutex<HashSet<usize>>,
    restarting: Mutex<HashSet<usize>>,
    shutdown: AtomicBool,
    weak: Weak<BrowserPool>,
}

impl BrowserPool {
    #[must_use]
    pub fn new(
        cfg: BrowserPoolConfig,
        identities: Arc<IdentityProfiles>,
        proxies: Arc<ProxyInventory>,
        routines: SiteRoutines,
    ) -> Arc<Self> {
        let max = cfg.max_browsers.max(1);
        Arc::new_cyclic(|weak| Self {
            cfg,
            identities,
            proxies,
            routines,
            slots: RwLock::new((0..max).map(|_| None).collect()),
            pending: Mutex::new(HashSet::new()),
            restarting: Mutex::new(HashSet::new()),
            shutdown: AtomicBool::new(false),
            weak: weak.clone(),
        })
    }

    /// Sweep leftover profiles and launch the minimum slot count.
    pub async fn start(&self) -> Result<()> {
        sweep_stale_profiles();
        for slot in 0..self.cfg.min_browsers.min(self.cfg.max_browsers) {
            if let Err(e) = self.launch_slot(slot).await {
                warn!(slot, "initial browser launch failed: {e}");
            }
        }
        let stats = self.stats();
        info!(active = stats.active, "browser pool started");
        Ok(())
    }

    // =========================================================================
    // Launch protocol
    // =========================================================================

    /// Launch one slot. Rejects duplicate launches for the same slot and
    /// closes any partially-launched browser on failure so no zombie
    /// process survives.
    pub async fn launch_slot(&self, slot: usize) -> Result<()> {
        if slot >= self.cfg.max_browsers {
            anyhow::bail!("slot {slot} out of range");
        }
        let occupied = { self.slots.read()[slot].is_some() };
        {
            let mut pending = self.pending.lock();
            if occupied || pending.contains(&slot) {
                anyhow::bail!("slot {slot} already occupied or launching");
            }
            pending.insert(slot);
        }

        let result = self.launch_slot_inner(slot).await;
        self.pending.lock().remove(&slot);
        result
    }

    async fn launch_slot_inner(&self, slot: usize) -> Result<()> {
        let identity = self.identities.random();

        let proxy = if self.cfg.slot_is_proxied(slot) {
            let acquired = self.proxies.acquire(None, None).await;
            if acquired.is_none() {
                warn!(slot, "no proxy available, launching proxied slot direct");
            }
            acquired
        } else {
            None
        };

        let launched = launch_browser(self.cfg.headless, &identity, proxy.as_ref()).await;
        let (browser, handler, user_data_dir) = match launched {
            Ok(parts) => parts,
            Err(e) => {
                self.identities.release(&identity);
                if let Some(p) = &proxy {
                    self.proxies.mark_bad(p).await;
                }
                return Err(e.context(format!("launching slot {slot}")));
            }
        };

        let credentials = proxy.as_ref().and_then(|p| {
            p.username
                .clone()
                .zip(p.password.clone())
        });

        let mut tabs: Vec<TabSlot> = Vec::with_capacity(self.cfg.tabs_per_browser);
        let mut tab_error: Option<anyhow::Error> = None;
        for index in 0..self.cfg.tabs_per_browser {
            match self
                .configure_tab(&browser, &identity, credentials.clone())
                .await
            {
                Ok(tab) => tabs.push(tab),
                Err(e) => {
                    warn!(slot, index, "tab configuration failed: {e}");
                    tab_error = Some(e);
                    break;
                }
            }
        }

        if tabs.len() < self.cfg.min_tabs.max(1) {
            // Partial launch: tear everything down before reporting.
            for tab in &tabs {
                tab.interceptor.abort();
            }
            handler.abort();
            let mut browser = browser;
            let _ = tokio::time::timeout(
                Duration::from_secs(self.cfg.close_timeout_secs),
                browser.close(),
            )
            .await;
            let _ = browser.wait().await;
            remove_profile_dir(&user_data_dir);
            self.identities.release(&identity);
            if let Some(p) = &proxy {
                self.proxies.mark_bad(p).await;
            }
            return Err(tab_error
                .unwrap_or_else(|| anyhow::anyhow!("no tabs came up"))
                .context(format!("launching slot {slot}")));
        }

        let instance = Arc::new(BrowserInstance {
            browser: tokio::sync::Mutex::new(browser),
            handler,
            identity: Mutex::new(identity),
            bound_proxy: proxy,
            tabs,
            consecutive_failures: AtomicU32::new(0),
            user_data_dir,
        });

        self.slots.write()[slot] = Some(instance);
        info!(slot, "browser slot active");
        Ok(())
    }

    async fn configure_tab(
        &self,
        browser: &Browser,
        identity: &Identity,
        credentials: Option<(String, String)>,
    ) -> Result<TabSlot> {
        let page = browser
            .new_page("about:blank")
            .await
            .context("opening tab")?;
        apply_identity(&page, identity).await?;
        let interceptor = install_interceptor(&page, credentials).await?;

        // Low-stakes warm-up so the first real navigation is not the
        // tab's first ever.
        page.goto("about:blank")
            .await
            .map_err(|e| anyhow::anyhow!("warm-up navigation: {e}"))?;

        Ok(TabSlot {
            page,
            interceptor,
            meta: Mutex::new(TabMeta {
                user_agent: identity.user_agent.clone(),
                fetch_count: 0,
                resting_until: None,
                current_job: None,
            }),
        })
    }

    // =========================================================================
    // Teardown / restart
    // =========================================================================

    async fn close_instance(&self, instance: Arc<BrowserInstance>) {
        for tab in &instance.tabs {
            tab.interceptor.abort();
        }
        instance.handler.abort();
        {
            let mut browser = instance.browser.lock().await;
            let closed = tokio::time::timeout(
                Duration::from_secs(self.cfg.close_timeout_secs),
                browser.close(),
            )
            .await;
            if closed.is_err() {
                warn!("browser close timed out, abandoning process handle");
            }
            let _ = browser.wait().await;
        }
        remove_profile_dir(&instance.user_data_dir);
    }

    async fn restart_slot_inner(&self, slot: usize) {
        {
            let mut restarting = self.restarting.lock();
            if !restarting.insert(slot) {
                return; // restart already in flight
            }
        }

        let instance = { self.slots.write()[slot].take() };
        if let Some(instance) = instance {
            if let Some(proxy) = &instance.bound_proxy {
                self.proxies.mark_bad(proxy).await;
            }
            let identity = instance.identity.lock().clone();
            self.identities.release(&identity);
            self.close_instance(instance).await;
        }

        // Cool off before relaunching so a flapping origin or proxy does
        // not see instant reconnects.
        let cooloff = {
            let mut rng = rand::rng();
            Duration::from_millis(rng.random_range(5000..=10_000))
        };
        tokio::time::sleep(cooloff).await;

        self.restarting.lock().remove(&slot);

        if self.shutdown.load(Ordering::Relaxed) {
            return;
        }
        if let Err(e) = self.launch_slot(slot).await {
            warn!(slot, "relaunch after restart failed: {e}");
        }
    }

    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let instances: Vec<Arc<BrowserInstance>> = {
            let mut slots = self.slots.write();
            slots.iter_mut().filter_map(Option::take).collect()
        };
        for instance in instances {
            self.close_instance(instance).await;
        }
        info!("browser pool shut down");
    }

    // =========================================================================
    // Lookup helpers
    // =========================================================================

    fn tab_session(&self, tab: TabRef) -> Option<TabSession> {
        let slots = self.slots.read();
        let instance = slots.get(tab.slot)?.as_ref()?;
        let slot = instance.tabs.get(tab.tab)?;
        let user_agent = slot.meta.lock().user_agent.clone();
        Some(TabSession {
            page: slot.page.clone(),
            user_agent,
            navigation_timeout: Duration::from_secs(self.cfg.navigation_timeout_secs),
        })
    }

    fn with_tab_meta<T>(&self, tab: TabRef, f: impl FnOnce(&mut TabMeta) -> T) -> Option<T> {
        let slots = self.slots.read();
        let instance = slots.get(tab.slot)?.as_ref()?;
        let slot = instance.tabs.get(tab.tab)?;
        Some(f(&mut slot.meta.lock()))
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let (active, proxied, tabs) = {
            let slots = self.slots.read();
            let active: Vec<&Arc<BrowserInstance>> = slots.iter().flatten().collect();
            (
                active.len(),
                active.iter().filter(|i| i.bound_proxy.is_some()).count(),
                active.iter().map(|i| i.tabs.len()).sum(),
            )
        };
        PoolStats {
            active,
            pending: self.pending.lock().len(),
            restarting: self.restarting.lock().len(),
            proxied,
            tabs,
        }
    }

    fn occupancy(&self) -> usize {
        let active = self.slots.read().iter().flatten().count();
        active + self.pending.lock().len() + self.restarting.lock().len()
    }

    /// Lowest slot id with nothing active, launching or restarting.
    fn free_slot(&self) -> Option<usize> {
        let occupied: Vec<bool> = self.slots.read().iter().map(Option::is_some).collect();
        let pending = self.pending.lock().clone();
        let restarting = self.restarting.lock().clone();
        (0..self.cfg.max_browsers)
            .find(|i| !occupied[*i] && !pending.contains(i) && !restarting.contains(i))
    }
}

// =============================================================================
// WorkerPool implementation
// =============================================================================

impl WorkerPool for BrowserPool {
    fn idle_tabs(&self) -> Vec<TabRef> {
        let now = Instant::now();
        let slots = self.slots.read();
        let mut out = Vec::new();
        for (slot_id, slot) in slots.iter().enumerate() {
            let Some(instance) = slot else { continue };
            for (tab_id, tab) in instance.tabs.iter().enumerate() {
                let mut meta = tab.meta.lock();
                if let Some(until) = meta.resting_until {
                    if until > now {
                        continue;
                    }
                    meta.resting_until = None;
                }
                out.push(TabRef::new(slot_id, tab_id));
            }
        }
        out
    }

    fn is_proxied(&self, slot: usize) -> bool {
        let slots = self.slots.read();
        match slots.get(slot).and_then(Option::as_ref) {
            // A proxied slot that came up without a proxy dispatches as
            // direct.
            Some(instance) => instance.bound_proxy.is_some(),
            None => self.cfg.slot_is_proxied(slot),
        }
    }

    fn bound_proxy(&self, slot: usize) -> Option<ProxyRecord> {
        let slots = self.slots.read();
        slots.get(slot)?.as_ref()?.bound_proxy.clone()
    }

    fn tab_user_agent(&self, tab: TabRef) -> Option<String> {
        self.with_tab_meta(tab, |meta| meta.user_agent.clone())
    }

    fn maybe_scale_up(&self, queue_len: usize) {
        if self.shutdown.load(Ordering::Relaxed) {
            return;
        }
        let occupancy = self.occupancy();
        if occupancy >= self.cfg.max_browsers {
            return;
        }
        let capacity = occupancy * self.cfg.tabs_per_browser;
        if occupancy != 0 && queue_len <= 2 * capacity {
            return;
        }
        let Some(slot) = self.free_slot() else { return };
        let Some(pool) = self.weak.upgrade() else { return };
        debug!(slot, queue_len, occupancy, "scaling up browser pool");
        // Fire and forget so the dispatcher never blocks on a launch.
        tokio::spawn(async move {
            if let Err(e) = pool.launch_slot(slot).await {
                warn!(slot, "scale-up launch failed: {e}");
            }
        });
    }

    fn execute<'a>(
        &'a self,
        tab: TabRef,
        kind: JobKind,
        url: String,
        progress: ProgressSink,
        cancel: CancelToken,
    ) -> BoxFuture<'a, FetchOutcome> {
        Box::pin(async move {
            let Some(session) = self.tab_session(tab) else {
                return FetchOutcome::Failure(format!("session closed: tab {tab} unavailable"));
            };
            self.with_tab_meta(tab, |meta| {
                meta.current_job = Some(url.clone());
            });

            let routine = self.routines.for_kind(kind);
            let outcome = routine.fetch(&session, &url, &progress, &cancel).await;

            let (limit, rest) = (self.cfg.tab_fetch_limit, self.cfg.tab_rest_secs);
            self.with_tab_meta(tab, |meta| {
                meta.current_job = None;
                meta.fetch_count += 1;
                if limit > 0 && meta.fetch_count % limit == 0 {
                    meta.resting_until = Some(Instant::now() + Duration::from_secs(rest));
                }
            });
            outcome
        })
    }

    fn rotate_identity<'a>(&'a self, tab: TabRef) -> BoxFuture<'a, Option<String>> {
        Box::pin(async move {
            let session = self.tab_session(tab)?;
            // Rotation runs because the origin rejected this identity;
            // keep it out of circulation.
            self.identities.mark_blocked(&session.user_agent);

            let fresh = self.identities.try_draw()?;
            if let Err(e) = apply_identity(&session.page, &fresh).await {
                warn!(%tab, "identity rotation failed: {e}");
                return None;
            }
            let ua = fresh.user_agent.clone();
            self.with_tab_meta(tab, |meta| {
                meta.user_agent = ua.clone();
            });
            {
                let slots = self.slots.read();
                if let Some(instance) = slots.get(tab.slot).and_then(Option::as_ref) {
                    *instance.identity.lock() = fresh;
                }
            }
            info!(%tab, "rotated tab identity in place");
            Some(ua)
        })
    }

    fn restart_slot<'a>(&'a self, slot: usize) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.restart_slot_inner(slot).await;
        })
    }

    fn park_tab<'a>(&'a self, tab: TabRef) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if let Some(session) = self.tab_session(tab)
                && let Err(e) = session.park().await
            {
                debug!(%tab, "failed to park tab: {e}");
            }
        })
    }

    fn record_slot_failure(&self, slot: usize) {
        let slots = self.slots.read();
        if let Some(instance) = slots.get(slot).and_then(Option::as_ref) {
            let n = instance.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(slot, consecutive_failures = n, "slot failure recorded");
        }
    }

    fn execute_ephemeral<'a>(
        &'a self,
        proxy_literal: String,
        kind: JobKind,
        url: String,
        progress: ProgressSink,
    ) -> BoxFuture<'a, FetchOutcome> {
        Box::pin(async move {
            let proxy = match ephemeral_record(&proxy_literal) {
                Ok(p) => p,
                Err(e) => return FetchOutcome::Failure(format!("invalid ephemeral proxy: {e}")),
            };
            let identity = self.identities.random();

            let (browser, handler, data_dir) =
                match launch_browser(self.cfg.headless, &identity, Some(&proxy)).await {
                    Ok(parts) => parts,
                    Err(e) => {
                        self.identities.release(&identity);
                        return FetchOutcome::Failure(format!("NETWORK: ephemeral launch: {e}"));
                    }
                };

            let credentials = proxy.username.clone().zip(proxy.password.clone());
            let outcome = match self.configure_tab(&browser, &identity, credentials).await {
                Ok(tab) => {
                    let session = TabSession {
                        page: tab.page.clone(),
                        user_agent: identity.user_agent.clone(),
                        navigation_timeout: Duration::from_secs(self.cfg.navigation_timeout_secs),
                    };
                    let routine = self.routines.for_kind(kind);
                    let cancel = CancelToken::new();
                    let outcome = routine.fetch(&session, &url, &progress, &cancel).await;
                    tab.interceptor.abort();
                    outcome
                }
                Err(e) => FetchOutcome::Failure(format!("NETWORK: ephemeral tab: {e}")),
            };

            handler.abort();
            let mut browser = browser;
            let _ = tokio::time::timeout(
                Duration::from_secs(self.cfg.close_timeout_secs),
                browser.close(),
            )
            .await;
            let _ = browser.wait().await;
            remove_profile_dir(&data_dir);
            self.identities.release(&identity);
            outcome
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxiedCount;
    use crate::fetch::FetchRoutine;

    struct NoopRoutine;

    impl FetchRoutine for NoopRoutine {
        fn fetch<'a>(
            &'a self,
            _tab: &'a TabSession,
            _url: &'a str,
            _progress: &'a ProgressSink,
            _cancel: &'a CancelToken,
        ) -> BoxFuture<'a, FetchOutcome> {
            Box::pin(async { FetchOutcome::Failure("unused".to_string()) })
        }
    }

    async fn test_pool(max_browsers: usize, proxied: ProxiedCount) -> Arc<BrowserPool> {
        let cfg = BrowserPoolConfig {
            max_browsers,
            proxied_count: proxied,
            ..Default::default()
        };
        let identities = Arc::new(IdentityProfiles::with_catalogue(vec![
            crate::identity::identity_from_user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.6478.61 Safari/537.36"),
        ]));
        let dir = tempfile::tempdir().unwrap().keep();
        let proxies = ProxyInventory::new(
            crate::config::ProxyConfig::default(),
            "https://shop.example.com".to_string(),
            dir,
        )
        .await
        .unwrap();
        let routines = SiteRoutines {
            product: Arc::new(NoopRoutine),
            store: Arc::new(NoopRoutine),
        };
        BrowserPool::new(cfg, identities, proxies, routines)
    }

    #[tokio::test]
    async fn empty_pool_has_no_tabs() {
        let pool = test_pool(2, ProxiedCount::Count(1)).await;
        assert!(pool.idle_tabs().is_empty());
        assert_eq!(pool.stats().active, 0);
    }

    #[tokio::test]
    async fn unlaunched_slots_report_configured_proxy_binding() {
        let pool = test_pool(4, ProxiedCount::Count(2)).await;
        assert!(!pool.is_proxied(0));
        assert!(!pool.is_proxied(1));
        assert!(pool.is_proxied(2));
        assert!(pool.is_proxied(3));
    }

    #[tokio::test]
    async fn free_slot_prefers_lowest_id() {
        let pool = test_pool(3, ProxiedCount::None).await;
        assert_eq!(pool.free_slot(), Some(0));
        pool.pending.lock().insert(0);
        assert_eq!(pool.free_slot(), Some(1));
    }

    #[tokio::test]
    async fn scale_up_is_noop_when_pending_fills_pool() {
        let pool = test_pool(1, ProxiedCount::None).await;
        pool.pending.lock().insert(0);
        // Occupancy (pending) == max_browsers, so nothing to do.
        pool.maybe_scale_up(100);
        assert_eq!(pool.occupancy(), 1);
        assert_eq!(pool.free_slot(), None);
    }

    #[tokio::test]
    async fn launch_slot_rejects_duplicates() {
        let pool = test_pool(2, ProxiedCount::None).await;
        pool.pending.lock().insert(1);
        let err = pool.launch_slot(1).await.unwrap_err();
        assert!(err.to_string().contains("already occupied or launching"));
    }
}
