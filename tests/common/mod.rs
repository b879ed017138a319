//! Shared test harness: a scripted worker pool standing in for the
//! browser layer, plus wiring helpers for queue scenarios.

use futures::future::BoxFuture;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use storescrape::config::{CacheConfig, ProxyConfig, QueueConfig};
use storescrape::fetch::{FetchOutcome, ProgressSink};
use storescrape::identity::IdentityProfiles;
use storescrape::orchestrator::{
    FetchQueue, FileStateStore, JobKind, StateStore, TabRef, WorkerPool,
};
use storescrape::proxy::{ProxyInventory, ProxyRecord};
use storescrape::results::ResultStore;
use storescrape::{CancelToken, Identity};

/// One scripted response for a URL. Responses are consumed in order;
/// when the script runs dry, executions succeed with a default payload.
#[allow(dead_code)]
pub enum Scripted {
    Succeed(Value),
    SucceedAfter(Duration, Value),
    /// Emit a partial through the progress sink, then succeed.
    SucceedWithProgress(Value, Value),
    Fail(String),
    /// Block until cancelled, then bail silently.
    Hang,
}

#[derive(Default)]
pub struct MockState {
    pub script: HashMap<String, VecDeque<Scripted>>,
    pub bound_proxies: HashMap<usize, ProxyRecord>,
    /// Proxies rebound to a slot by the next restart, in order.
    pub next_proxies: VecDeque<ProxyRecord>,
    pub executions: Vec<(TabRef, String)>,
    pub restarts: Vec<usize>,
    pub rotations: Vec<TabRef>,
    pub slot_failures: Vec<usize>,
    pub scale_calls: Vec<usize>,
    /// What rotate_identity returns; `None` simulates an exhausted pool.
    pub rotate_to: Option<String>,
}

pub struct MockPool {
    pub tabs: Vec<TabRef>,
    pub proxied_slots: HashSet<usize>,
    pub state: Mutex<MockState>,
}

#[allow(dead_code)]
impl MockPool {
    pub fn with_tabs(tabs: Vec<TabRef>) -> Arc<Self> {
        Arc::new(Self {
            tabs,
            proxied_slots: HashSet::new(),
            state: Mutex::new(MockState {
                rotate_to: Some("rotated-ua".to_string()),
                ..MockState::default()
            }),
        })
    }

    pub fn two_direct_slots() -> Arc<Self> {
        Self::with_tabs(vec![TabRef::new(0, 0), TabRef::new(1, 0)])
    }

    pub fn script(&self, url: &str, actions: Vec<Scripted>) {
        self.state
            .lock()
            .unwrap()
            .script
            .insert(url.to_string(), actions.into());
    }

    pub fn bind_proxy(&self, slot: usize, proxy: ProxyRecord) {
        self.state.lock().unwrap().bound_proxies.insert(slot, proxy);
    }

    pub fn executions(&self) -> Vec<(TabRef, String)> {
        self.state.lock().unwrap().executions.clone()
    }

    pub fn restarts(&self) -> Vec<usize> {
        self.state.lock().unwrap().restarts.clone()
    }

    pub fn rotations(&self) -> Vec<TabRef> {
        self.state.lock().unwrap().rotations.clone()
    }
}

impl WorkerPool for MockPool {
    fn idle_tabs(&self) -> Vec<TabRef> {
        self.tabs.clone()
    }

    fn is_proxied(&self, slot: usize) -> bool {
        self.proxied_slots.contains(&slot)
    }

    fn bound_proxy(&self, slot: usize) -> Option<ProxyRecord> {
        self.state.lock().unwrap().bound_proxies.get(&slot).cloned()
    }

    fn tab_user_agent(&self, _tab: TabRef) -> Option<String> {
        Some("mock-ua".to_string())
    }

    fn maybe_scale_up(&self, queue_len: usize) {
        self.state.lock().unwrap().scale_calls.push(queue_len);
    }

    fn execute<'a>(
        &'a self,
        tab: TabRef,
        _kind: JobKind,
        url: String,
        progress: ProgressSink,
        cancel: CancelToken,
    ) -> BoxFuture<'a, FetchOutcome> {
        Box::pin(async move {
            let action = {
                let mut state = self.state.lock().unwrap();
                state.executions.push((tab, url.clone()));
                state
                    .script
                    .get_mut(&url)
                    .and_then(VecDeque::pop_front)
                    .unwrap_or(Scripted::Succeed(json!({ "default": true })))
            };
            match action {
                Scripted::Succeed(value) => FetchOutcome::Success(value),
                Scripted::SucceedAfter(delay, value) => {
                    tokio::select! {
                        () = tokio::time::sleep(delay) => FetchOutcome::Success(value),
                        () = cancel.cancelled() => FetchOutcome::Failure("CANCELLED".to_string()),
                    }
                }
                Scripted::SucceedWithProgress(partial, value) => {
                    progress.emit(partial);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    FetchOutcome::Success(value)
                }
                Scripted::Fail(error) => FetchOutcome::Failure(error),
                Scripted::Hang => {
                    cancel.cancelled().await;
                    FetchOutcome::Failure("CANCELLED".to_string())
                }
            }
        })
    }

    fn rotate_identity<'a>(&'a self, tab: TabRef) -> BoxFuture<'a, Option<String>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.rotations.push(tab);
            state.rotate_to.clone()
        })
    }

    fn restart_slot<'a>(&'a self, slot: usize) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.restarts.push(slot);
            if let Some(next) = state.next_proxies.pop_front() {
                state.bound_proxies.insert(slot, next);
            } else {
                state.bound_proxies.remove(&slot);
            }
        })
    }

    fn park_tab<'a>(&'a self, _tab: TabRef) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }

    fn record_slot_failure(&self, slot: usize) {
        self.state.lock().unwrap().slot_failures.push(slot);
    }

    fn execute_ephemeral<'a>(
        &'a self,
        _proxy_literal: String,
        _kind: JobKind,
        url: String,
        progress: ProgressSink,
    ) -> BoxFuture<'a, FetchOutcome> {
        self.execute(
            TabRef::new(usize::MAX, 0),
            JobKind::Product,
            url,
            progress,
            CancelToken::new(),
        )
    }
}

/// Queue config tuned for tests: no sleep-based back-offs, maintenance
/// far in the future, hedging effectively disabled (tests exercising the
/// hedge lower the delay explicitly so scripted outcomes are consumed by
/// the attempts under test).
#[allow(dead_code)]
pub fn fast_queue_config() -> QueueConfig {
    QueueConfig {
        max_attempts: 3,
        hedge_delay_ms: 60_000,
        finished_retention_secs: 24 * 60 * 60,
        cleanup_interval_secs: 3600,
        flush_interval_secs: 3600,
        max_store_fanout: 50,
        retry_backoff_secs: 0,
        identity_backoff_secs: 0,
    }
}

#[allow(dead_code)]
pub struct Harness {
    pub queue: Arc<FetchQueue>,
    pub pool: Arc<MockPool>,
    pub proxies: Arc<ProxyInventory>,
    pub identities: Arc<IdentityProfiles>,
    pub results: Arc<ResultStore>,
    pub store: Arc<FileStateStore>,
    #[allow(dead_code)]
    pub dir: tempfile::TempDir,
}

#[allow(dead_code)]
pub fn test_identity() -> Identity {
    storescrape::identity::identity_from_user_agent(
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.6478.61 Safari/537.36",
    )
}

/// Build a queue over a mock pool with file-backed persistence in a
/// fresh temp dir.
#[allow(dead_code)]
pub async fn harness_with(pool: Arc<MockPool>, cfg: QueueConfig) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(FileStateStore::new(dir.path()));
    harness_with_store(pool, cfg, store, dir).await
}

#[allow(dead_code)]
pub async fn harness_with_store(
    pool: Arc<MockPool>,
    cfg: QueueConfig,
    store: Arc<FileStateStore>,
    dir: tempfile::TempDir,
) -> Harness {
    let identities = Arc::new(IdentityProfiles::with_catalogue(vec![test_identity()]));
    let results = Arc::new(ResultStore::new(&CacheConfig::default()));
    let proxies = ProxyInventory::new(
        ProxyConfig::default(),
        "https://shop.example.com".to_string(),
        dir.path().join("proxies"),
    )
    .await
    .expect("proxy inventory");

    let queue = FetchQueue::restore(
        cfg,
        pool.clone() as Arc<dyn WorkerPool>,
        proxies.clone(),
        identities.clone(),
        results.clone(),
        store.clone() as Arc<dyn StateStore>,
    )
    .await
    .expect("queue restore");

    Harness {
        queue,
        pool,
        proxies,
        identities,
        results,
        store,
        dir,
    }
}

/// Poll a job until the predicate holds or the deadline passes.
#[allow(dead_code)]
pub async fn wait_for_job(
    queue: &Arc<FetchQueue>,
    id: &str,
    deadline: Duration,
    predicate: impl Fn(&storescrape::Job) -> bool,
) -> storescrape::Job {
    let started = std::time::Instant::now();
    loop {
        if let Some(job) = queue.job(id).await
            && predicate(&job)
        {
            return job;
        }
        assert!(
            started.elapsed() < deadline,
            "job {id} did not reach expected state within {deadline:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
