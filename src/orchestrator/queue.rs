//! The fetch queue.
//!
//! One synchronization domain guards jobs, queue order, the busy set and
//! the dispatcher flag; nothing holds it across a suspension point. The
//! dispatcher assigns jobs to tabs direct-first, races a hedge attempt
//! when the first worker lags, classifies failures and persists every
//! state transition.

use futures::FutureExt;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::TabRef;
use super::classify::{ErrorClass, classify};
use super::job::{Job, JobId, JobKind, JobStatus, mark_partial, strip_partial};
use super::persistence::StateStore;
use crate::cancel::CancelToken;
use crate::config::QueueConfig;
use crate::fetch::{FetchOutcome, ProgressSink, codes};
use crate::identity::IdentityProfiles;
use crate::proxy::{ProxyInventory, ProxyRecord};
use crate::results::ResultStore;
use crate::urlnorm::normalize;

/// The worker surface the queue dispatches onto. The browser pool is the
/// production implementation; tests substitute scripted pools.
pub trait WorkerPool: Send + Sync + 'static {
    /// Tabs currently able to take work (active browser, not resting).
    /// The queue subtracts its own busy set.
    fn idle_tabs(&self) -> Vec<TabRef>;

    /// Whether the slot's browser was launched with a bound proxy.
    fn is_proxied(&self, slot: usize) -> bool;

    /// The proxy bound to a slot's browser, if any.
    fn bound_proxy(&self, slot: usize) -> Option<ProxyRecord>;

    /// User agent the tab currently wears.
    fn tab_user_agent(&self, tab: TabRef) -> Option<String>;

    /// Fire-and-forget scale-up under queue pressure.
    fn maybe_scale_up(&self, queue_len: usize);

    /// Run the per-kind fetch routine on a tab.
    fn execute<'a>(
        &'a self,
        tab: TabRef,
        kind: JobKind,
        url: String,
        progress: ProgressSink,
        cancel: CancelToken,
    ) -> BoxFuture<'a, FetchOutcome>;

    /// Swap the tab's identity in place. `None` means no usable identity
    /// was available and the caller should fall back to harder measures.
    fn rotate_identity<'a>(&'a self, tab: TabRef) -> BoxFuture<'a, Option<String>>;

    /// Tear the slot down and relaunch it.
    fn restart_slot<'a>(&'a self, slot: usize) -> BoxFuture<'a, ()>;

    /// Navigate the tab to a blank page between retries.
    fn park_tab<'a>(&'a self, tab: TabRef) -> BoxFuture<'a, ()>;

    /// Bump the slot's consecutive-failure metric.
    fn record_slot_failure(&self, slot: usize);

    /// One-shot execution on an ephemeral browser bound to the given
    /// proxy literal. The pool owns the browser's lifecycle.
    fn execute_ephemeral<'a>(
        &'a self,
        proxy_literal: String,
        kind: JobKind,
        url: String,
        progress: ProgressSink,
    ) -> BoxFuture<'a, FetchOutcome>;
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub queued: usize,
    pub busy_workers: usize,
}

struct QueueState {
    jobs: HashMap<JobId, Job>,
    queue: VecDeque<JobId>,
    /// One live job per normalized URL; the dedup invariant lives here.
    live_by_url: HashMap<String, JobId>,
    busy: HashSet<TabRef>,
    dispatching: bool,
}

/// Outcome of one (possibly hedged) attempt future.
enum AttemptEnd {
    Completed(Value),
    /// 204 from the origin; the job was already failed terminally.
    NoContent,
    /// Classification requeued the job at the head and scheduled
    /// remediation; nothing more to record here.
    Requeued,
    Failed(String),
    Cancelled,
}

pub struct FetchQueue {
    cfg: QueueConfig,
    state: Mutex<QueueState>,
    pool: Arc<dyn WorkerPool>,
    proxies: Arc<ProxyInventory>,
    identities: Arc<IdentityProfiles>,
    results: Arc<ResultStore>,
    store: Arc<dyn StateStore>,
    shutdown: AtomicBool,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl FetchQueue {
    /// Restore persisted state and start background maintenance. Crash
    /// recovery happens here: every `processing` job is demoted to
    /// `pending` and re-queued at the head, preserving relative order.
    pub async fn restore(
        cfg: QueueConfig,
        pool: Arc<dyn WorkerPool>,
        proxies: Arc<ProxyInventory>,
        identities: Arc<IdentityProfiles>,
        results: Arc<ResultStore>,
        store: Arc<dyn StateStore>,
    ) -> anyhow::Result<Arc<Self>> {
        let persisted = store.load().await?;

        let mut jobs: HashMap<JobId, Job> = HashMap::with_capacity(persisted.jobs.len());
        let mut demoted: Vec<Job> = Vec::new();
        for mut job in persisted.jobs {
            if job.status == JobStatus::Processing {
                job.status = JobStatus::Pending;
                job.touch();
                demoted.push(job.clone());
            }
            jobs.insert(job.id.clone(), job);
        }
        demoted.sort_by_key(|j| j.created_at);

        let mut queue: VecDeque<JobId> = VecDeque::new();
        let mut seen: HashSet<JobId> = HashSet::new();
        for job in &demoted {
            if seen.insert(job.id.clone()) {
                queue.push_back(job.id.clone());
            }
        }
        for id in persisted.queue {
            if jobs.get(&id).is_some_and(Job::is_live) && seen.insert(id.clone()) {
                queue.push_back(id);
            }
        }
        if !demoted.is_empty() {
            info!(
                recovered = demoted.len(),
                "demoted in-flight jobs to pending at queue head"
            );
        }

        let live_by_url: HashMap<String, JobId> = jobs
            .values()
            .filter(|j| j.is_live())
            .map(|j| (j.normalized_url.clone(), j.id.clone()))
            .collect();

        let queue_snapshot: Vec<JobId> = queue.iter().cloned().collect();
        let jobs_snapshot: Vec<Job> = jobs.values().cloned().collect();

        let this = Arc::new(Self {
            cfg,
            state: Mutex::new(QueueState {
                jobs,
                queue,
                live_by_url,
                busy: HashSet::new(),
                dispatching: false,
            }),
            pool,
            proxies,
            identities,
            results,
            store,
            shutdown: AtomicBool::new(false),
            background: Mutex::new(Vec::new()),
        });

        if let Err(e) = this.store.save_snapshot(&jobs_snapshot, &queue_snapshot).await {
            warn!("failed to persist recovered state: {e}");
        }

        this.spawn_maintenance();
        this.dispatch();
        Ok(this)
    }

    fn spawn_maintenance(self: &Arc<Self>) {
        let cleaner = Arc::clone(self);
        let cleanup = tokio::spawn(async move {
            let interval = Duration::from_secs(cleaner.cfg.cleanup_interval_secs);
            loop {
                tokio::time::sleep(interval).await;
                if cleaner.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                cleaner.sweep_finished().await;
            }
        });

        let flusher = Arc::clone(self);
        let flush = tokio::spawn(async move {
            let interval = Duration::from_secs(flusher.cfg.flush_interval_secs);
            loop {
                tokio::time::sleep(interval).await;
                if flusher.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                flusher.flush_snapshot().await;
            }
        });

        let mut background = self.background.lock();
        background.push(cleanup);
        background.push(flush);
    }

    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for handle in self.background.lock().drain(..) {
            handle.abort();
        }
        self.flush_snapshot().await;
        info!("fetch queue shut down");
    }

    // =========================================================================
    // Public operations
    // =========================================================================

    /// Enqueue a URL. If a live job for the normalized URL exists it is
    /// returned as-is; otherwise a new job is created, persisted, and the
    /// dispatcher kicked. An ephemeral proxy bypasses the main queue.
    pub fn enqueue<'a>(
        self: &'a Arc<Self>,
        url: &'a str,
        kind: JobKind,
        ephemeral_proxy: Option<String>,
    ) -> BoxFuture<'a, anyhow::Result<Job>> {
        async move {
            let normalized = normalize(url)?;

            let job = {
                let mut s = self.state.lock();
                if let Some(existing_id) = s.live_by_url.get(&normalized)
                    && let Some(existing) = s.jobs.get(existing_id)
                {
                    debug!(url = %normalized, id = %existing.id, "deduplicated enqueue");
                    return Ok(existing.clone());
                }

                let job = Job::new(normalized.clone(), kind, ephemeral_proxy.clone());
                s.live_by_url.insert(normalized, job.id.clone());
                s.jobs.insert(job.id.clone(), job.clone());
                if ephemeral_proxy.is_none() {
                    s.queue.push_back(job.id.clone());
                }
                job
            };

            self.persist_job(&job).await;
            self.persist_queue().await;

            match job.ephemeral_proxy.clone() {
                Some(proxy) => {
                    let this = Arc::clone(self);
                    let id = job.id.clone();
                    tokio::spawn(async move {
                        this.run_ephemeral(id, proxy).await;
                    });
                }
                None => self.dispatch(),
            }

            Ok(job)
        }
        .boxed()
    }

    /// Current snapshot of a job, refreshed from the persistent store
    /// when that copy is newer (a sibling process may be writing it).
    pub async fn job(&self, id: &str) -> Option<Job> {
        let in_memory = { self.state.lock().jobs.get(id).cloned() };
        let from_store = self.store.fetch_job(id).await.ok().flatten();
        match (in_memory, from_store) {
            (Some(mem), Some(stored)) if stored.updated_at > mem.updated_at => {
                let mut s = self.state.lock();
                s.jobs.insert(stored.id.clone(), stored.clone());
                Some(stored)
            }
            (Some(mem), _) => Some(mem),
            (None, stored) => stored,
        }
    }

    /// Most recent job for a URL: the live one if any, else the latest
    /// finished one.
    pub async fn job_by_url(&self, url: &str) -> Option<Job> {
        let normalized = normalize(url).ok()?;
        let s = self.state.lock();
        if let Some(id) = s.live_by_url.get(&normalized)
            && let Some(job) = s.jobs.get(id)
        {
            return Some(job.clone());
        }
        s.jobs
            .values()
            .filter(|j| j.normalized_url == normalized)
            .max_by_key(|j| j.created_at)
            .cloned()
    }

    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let s = self.state.lock();
        let mut stats = QueueStats {
            pending: 0,
            processing: 0,
            completed: 0,
            failed: 0,
            queued: s.queue.len(),
            busy_workers: s.busy.len(),
        };
        for job in s.jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    // =========================================================================
    // Dispatcher
    // =========================================================================

    /// Kick the dispatcher. Safe to call from anywhere; concurrent kicks
    /// collapse onto the single running cycle.
    pub fn dispatch(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.dispatch_cycle().await;
        });
    }

    async fn dispatch_cycle(self: Arc<Self>) {
        loop {
            {
                let mut s = self.state.lock();
                if s.dispatching {
                    return;
                }
                s.dispatching = true;
            }

            self.drain_queue().await;

            self.state.lock().dispatching = false;

            // Close the wakeup race: work and capacity may have appeared
            // while the flag was still set.
            let more = {
                let s = self.state.lock();
                !s.queue.is_empty() && self.has_free_worker(&s)
            };
            if !more || self.shutdown.load(Ordering::Relaxed) {
                return;
            }
        }
    }

    async fn drain_queue(self: &Arc<Self>) {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return;
            }
            let queue_len = { self.state.lock().queue.len() };
            if queue_len == 0 {
                return;
            }
            self.pool.maybe_scale_up(queue_len);

            let assignment = {
                let mut s = self.state.lock();
                let Some(job_id) = s.queue.pop_front() else {
                    return;
                };
                let Some(job) = s.jobs.get(&job_id) else {
                    continue; // swept while queued
                };
                if job.status == JobStatus::Processing || job.is_terminal() {
                    continue;
                }

                let mut tabs = self.pool.idle_tabs();
                tabs.retain(|t| !s.busy.contains(t));
                // Direct browsers first, then stable slot/tab order.
                tabs.sort_by_key(|t| (self.pool.is_proxied(t.slot), t.slot, t.tab));

                match tabs.first().copied() {
                    None => {
                        s.queue.push_front(job_id);
                        return; // no capacity; a release will re-kick
                    }
                    Some(worker) => {
                        s.busy.insert(worker);
                        if let Some(job) = s.jobs.get_mut(&job_id) {
                            job.status = JobStatus::Processing;
                            job.touch();
                        }
                        Some((job_id, worker))
                    }
                }
            };

            let Some((job_id, worker)) = assignment else {
                continue;
            };
            if let Some(job) = { self.state.lock().jobs.get(&job_id).cloned() } {
                self.persist_job(&job).await;
            }
            self.persist_queue().await;

            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.hedged_execute(job_id, worker).await;
            });
        }
    }

    fn has_free_worker(&self, s: &QueueState) -> bool {
        self.pool.idle_tabs().iter().any(|t| !s.busy.contains(t))
    }

    // =========================================================================
    // Hedged execution
    // =========================================================================

    async fn hedged_execute(self: Arc<Self>, job_id: JobId, first: TabRef) {
        let cancel = CancelToken::new();
        let mut attempts: FuturesUnordered<BoxFuture<'static, (TabRef, AttemptEnd)>> =
            FuturesUnordered::new();
        attempts.push(
            Arc::clone(&self)
                .run_attempt(job_id.clone(), first, cancel.clone())
                .map(move |end| (first, end))
                .boxed(),
        );

        let hedge_delay = Duration::from_millis(self.cfg.hedge_delay_ms);
        let mut hedge_armed = false;
        let mut recorded = false;
        let mut requeued = false;
        let mut last_error: Option<String> = None;

        loop {
            let next = if hedge_armed {
                attempts.next().await
            } else {
                tokio::select! {
                    done = attempts.next() => done,
                    () = tokio::time::sleep(hedge_delay) => {
                        hedge_armed = true;
                        if self.status_of(&job_id) == Some(JobStatus::Processing)
                            && let Some(second) = self.reserve_hedge_worker(first)
                        {
                            debug!(job = %job_id, first = %first, second = %second, "hedging slow attempt");
                            attempts.push(
                                Arc::clone(&self)
                                    .run_attempt(job_id.clone(), second, cancel.clone())
                                    .map(move |end| (second, end))
                                    .boxed(),
                            );
                        }
                        continue;
                    }
                }
            };

            let Some((worker, end)) = next else {
                break; // every attempt drained
            };
            self.release_worker(worker);

            match end {
                AttemptEnd::Completed(value) => {
                    if !recorded && self.complete_job(&job_id, value, Some(worker)).await {
                        recorded = true;
                    }
                    // First writer wins either way; silence the sibling.
                    cancel.cancel();
                }
                AttemptEnd::NoContent => {
                    recorded = true;
                    cancel.cancel();
                }
                AttemptEnd::Requeued => requeued = true,
                AttemptEnd::Failed(err) => last_error = Some(err),
                AttemptEnd::Cancelled => {}
            }
        }

        if !recorded && !requeued {
            let err = last_error.unwrap_or_else(|| "fetch failed".to_string());
            self.fail_job(&job_id, &err).await;
        }

        self.dispatch();
    }

    fn status_of(&self, job_id: &str) -> Option<JobStatus> {
        self.state.lock().jobs.get(job_id).map(|j| j.status)
    }

    fn reserve_hedge_worker(&self, first: TabRef) -> Option<TabRef> {
        let mut s = self.state.lock();
        let mut tabs = self.pool.idle_tabs();
        tabs.retain(|t| !s.busy.contains(t) && *t != first);
        // Prefer a different browser, then the usual direct-first order.
        tabs.sort_by_key(|t| {
            (
                t.slot == first.slot,
                self.pool.is_proxied(t.slot),
                t.slot,
                t.tab,
            )
        });
        let worker = tabs.first().copied()?;
        s.busy.insert(worker);
        Some(worker)
    }

    fn release_worker(&self, worker: TabRef) {
        self.state.lock().busy.remove(&worker);
    }

    // =========================================================================
    // Single attempt
    // =========================================================================

    async fn run_attempt(
        self: Arc<Self>,
        job_id: JobId,
        worker: TabRef,
        cancel: CancelToken,
    ) -> AttemptEnd {
        let Some((kind, url)) = ({
            let s = self.state.lock();
            s.jobs
                .get(&job_id)
                .map(|j| (j.kind, j.normalized_url.clone()))
        }) else {
            return AttemptEnd::Cancelled;
        };

        let mut attempt = 0u32;
        let mut last_err = String::from("no attempts made");

        while attempt < self.cfg.max_attempts {
            if cancel.is_cancelled() {
                return AttemptEnd::Cancelled;
            }

            let progress = self.progress_sink(&job_id);
            let outcome = self
                .pool
                .execute(worker, kind, url.clone(), progress, cancel.clone())
                .await;

            let err = match outcome {
                FetchOutcome::Success(value) => return AttemptEnd::Completed(value),
                FetchOutcome::Failure(err) => err,
            };

            if cancel.is_cancelled() {
                // The hedge sibling won; bail without side effects.
                return AttemptEnd::Cancelled;
            }

            match classify(&err) {
                ErrorClass::CriticalBrowser => {
                    warn!(job = %job_id, worker = %worker, "critical browser failure: {err}");
                    self.requeue_head(&job_id).await;
                    let pool = Arc::clone(&self.pool);
                    tokio::spawn(async move {
                        pool.restart_slot(worker.slot).await;
                    });
                    return AttemptEnd::Requeued;
                }
                ErrorClass::ProxyOrNetwork => {
                    warn!(job = %job_id, worker = %worker, "network-path failure: {err}");
                    if let Some(record) = self.pool.bound_proxy(worker.slot) {
                        self.proxies.mark_bad(&record).await;
                    }
                    self.pool.record_slot_failure(worker.slot);
                    self.requeue_head(&job_id).await;
                    let pool = Arc::clone(&self.pool);
                    tokio::spawn(async move {
                        pool.restart_slot(worker.slot).await;
                    });
                    return AttemptEnd::Requeued;
                }
                ErrorClass::NoContent => {
                    self.fail_job(&job_id, codes::NO_CONTENT).await;
                    return AttemptEnd::NoContent;
                }
                ErrorClass::UnsupportedBrowser => {
                    // Rotate in place; this never consumes a retry.
                    debug!(job = %job_id, worker = %worker, "origin rejected identity, rotating");
                    if self.pool.rotate_identity(worker).await.is_none() {
                        tokio::time::sleep(Duration::from_secs(self.cfg.identity_backoff_secs))
                            .await;
                    }
                    self.pool.park_tab(worker).await;
                }
                ErrorClass::Other => {
                    debug!(job = %job_id, attempt, "recoverable failure: {err}");
                    last_err = err;
                    self.pool.park_tab(worker).await;
                    tokio::time::sleep(Duration::from_secs(self.cfg.retry_backoff_secs)).await;
                    attempt += 1;
                }
            }
        }

        AttemptEnd::Failed(last_err)
    }

    fn progress_sink(self: &Arc<Self>, job_id: &str) -> ProgressSink {
        let this = Arc::clone(self);
        let id = job_id.to_string();
        ProgressSink::new(move |partial| {
            this.record_partial(&id, partial);
        })
    }

    /// Write a partial result onto a live job. Later partials overwrite
    /// earlier ones; a terminal job is never touched.
    fn record_partial(self: &Arc<Self>, job_id: &str, partial: Value) {
        let snapshot = {
            let mut s = self.state.lock();
            let Some(job) = s.jobs.get_mut(job_id) else {
                return;
            };
            if job.is_terminal() {
                return;
            }
            job.result = Some(mark_partial(partial));
            job.touch();
            job.clone()
        };

        let store = Arc::clone(&self.store);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = store.save_job(&snapshot).await {
                    warn!("failed to persist partial result: {e}");
                }
            });
        }
    }

    // =========================================================================
    // Job transitions
    // =========================================================================

    /// Record a final result. First writer wins: returns false when a
    /// sibling already completed (or terminally failed) the job.
    async fn complete_job(
        self: &Arc<Self>,
        job_id: &str,
        value: Value,
        worker: Option<TabRef>,
    ) -> bool {
        let final_payload = strip_partial(value);
        let completed = {
            let mut s = self.state.lock();
            let Some(job) = s.jobs.get_mut(job_id) else {
                return false;
            };
            if job.is_terminal() {
                return false;
            }
            job.status = JobStatus::Completed;
            job.result = Some(final_payload.clone());
            job.error = None;
            job.touch();
            let snapshot = job.clone();
            let url = snapshot.normalized_url.clone();
            s.live_by_url.remove(&url);
            s.queue.retain(|id| id != job_id);
            snapshot
        };

        info!(job = %job_id, url = %completed.normalized_url, "job completed");
        self.results
            .record_result(&completed.normalized_url, final_payload.clone());

        if let Some(worker) = worker {
            if let Some(ua) = self.pool.tab_user_agent(worker) {
                self.identities.mark_working(&ua);
            }
            if let Some(record) = self.pool.bound_proxy(worker.slot) {
                self.proxies.mark_working(&record);
            }
        }

        self.persist_job(&completed).await;
        self.persist_queue().await;

        if completed.kind == JobKind::Store {
            self.fanout_store(&completed.normalized_url, &final_payload)
                .await;
        }
        true
    }

    async fn fail_job(&self, job_id: &str, error: &str) {
        let snapshot = {
            let mut s = self.state.lock();
            let Some(job) = s.jobs.get_mut(job_id) else {
                return;
            };
            if job.is_terminal() {
                return;
            }
            job.status = JobStatus::Failed;
            job.error = Some(error.to_string());
            job.touch();
            let snapshot = job.clone();
            let url = snapshot.normalized_url.clone();
            s.live_by_url.remove(&url);
            s.queue.retain(|id| id != job_id);
            snapshot
        };
        warn!(job = %job_id, url = %snapshot.normalized_url, "job failed: {error}");
        self.persist_job(&snapshot).await;
        self.persist_queue().await;
    }

    /// Demote to pending and reinsert at the queue head, so recovered
    /// failures run before everything already waiting.
    async fn requeue_head(&self, job_id: &str) {
        let snapshot = {
            let mut s = self.state.lock();
            let Some(job) = s.jobs.get_mut(job_id) else {
                return;
            };
            if job.is_terminal() {
                return;
            }
            job.status = JobStatus::Pending;
            job.touch();
            let snapshot = job.clone();
            if !s.queue.contains(&snapshot.id) {
                s.queue.push_front(snapshot.id.clone());
            }
            snapshot
        };
        self.persist_job(&snapshot).await;
        self.persist_queue().await;
    }

    /// Schedule follow-up product jobs from a completed store payload,
    /// capped so one giant store cannot flood the queue.
    async fn fanout_store(self: &Arc<Self>, store_url: &str, payload: &Value) {
        let Some(ids) = payload.get("allProductIds").and_then(Value::as_array) else {
            return;
        };
        let total = ids.len();
        let capped: Vec<String> = ids
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .take(self.cfg.max_store_fanout)
            .collect();
        if total > capped.len() {
            warn!(
                store = %store_url,
                total,
                scheduled = capped.len(),
                "store fan-out capped"
            );
        }

        for product_id in capped {
            let url = format!("{store_url}/products/{product_id}");
            if let Err(e) = self.enqueue(&url, JobKind::Product, None).await {
                warn!(%url, "failed to schedule follow-up product job: {e}");
            }
        }
    }

    // =========================================================================
    // Ephemeral execution
    // =========================================================================

    async fn run_ephemeral(self: Arc<Self>, job_id: JobId, proxy_literal: String) {
        let Some((kind, url)) = ({
            let mut s = self.state.lock();
            s.jobs.get_mut(&job_id).map(|job| {
                job.status = JobStatus::Processing;
                job.touch();
                (job.kind, job.normalized_url.clone())
            })
        }) else {
            return;
        };
        if let Some(job) = { self.state.lock().jobs.get(&job_id).cloned() } {
            self.persist_job(&job).await;
        }

        let progress = self.progress_sink(&job_id);
        let outcome = self
            .pool
            .execute_ephemeral(proxy_literal, kind, url, progress)
            .await;

        match outcome {
            FetchOutcome::Success(value) => {
                self.complete_job(&job_id, value, None).await;
            }
            FetchOutcome::Failure(err) => {
                self.fail_job(&job_id, &err).await;
            }
        }
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Drop terminal jobs past the retention window.
    pub async fn sweep_finished(&self) {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::seconds(self.cfg.finished_retention_secs as i64);
        let removed: Vec<JobId> = {
            let mut s = self.state.lock();
            let doomed: Vec<JobId> = s
                .jobs
                .values()
                .filter(|j| j.is_terminal() && j.updated_at < cutoff)
                .map(|j| j.id.clone())
                .collect();
            for id in &doomed {
                s.jobs.remove(id);
            }
            s.queue.retain(|id| !doomed.contains(id));
            doomed
        };
        if removed.is_empty() {
            return;
        }
        info!(count = removed.len(), "swept finished jobs");
        for id in &removed {
            if let Err(e) = self.store.remove_job(id).await {
                warn!("failed to remove swept job {id}: {e}");
            }
        }
        self.persist_queue().await;
    }

    async fn flush_snapshot(&self) {
        let (jobs, queue) = {
            let s = self.state.lock();
            (
                s.jobs.values().cloned().collect::<Vec<_>>(),
                s.queue.iter().cloned().collect::<Vec<_>>(),
            )
        };
        if let Err(e) = self.store.save_snapshot(&jobs, &queue).await {
            warn!("periodic state flush failed: {e}");
        }
    }

    async fn persist_job(&self, job: &Job) {
        if let Err(e) = self.store.save_job(job).await {
            warn!(job = %job.id, "failed to persist job: {e}");
        }
    }

    async fn persist_queue(&self) {
        let queue: Vec<JobId> = {
            let s = self.state.lock();
            s.queue.iter().cloned().collect()
        };
        if let Err(e) = self.store.save_queue(&queue).await {
            warn!("failed to persist queue order: {e}");
        }
    }
}
