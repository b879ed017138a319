//! End-to-end queue scenarios over a scripted worker pool: dedup,
//! progressive results, hedged racing, remediation and fan-out.

mod common;

use common::{MockPool, Scripted, fast_queue_config, harness_with, wait_for_job};
use serde_json::json;
use std::time::Duration;
use storescrape::orchestrator::{JobKind, JobStatus, PARTIAL_FLAG, TabRef};
use storescrape::proxy::{ProxyProtocol, ProxyRecord};

const URL: &str = "https://shop.example.com/gadget-world/products/42";

#[tokio::test]
async fn enqueue_deduplicates_live_jobs() {
    let pool = MockPool::two_direct_slots();
    pool.script(URL, vec![Scripted::SucceedAfter(
        Duration::from_millis(300),
        json!({"name": "A"}),
    )]);
    let h = harness_with(pool, fast_queue_config()).await;

    let first = h.queue.enqueue(URL, JobKind::Product, None).await.unwrap();
    // Same URL modulo normalization noise: trailing slash, tracking params.
    let second = h
        .queue
        .enqueue(
            "https://shop.example.com/gadget-world/products/42/?utm_source=x",
            JobKind::Product,
            None,
        )
        .await
        .unwrap();
    assert_eq!(first.id, second.id, "live jobs dedupe by normalized URL");

    let by_url = h.queue.job_by_url(URL).await.unwrap();
    assert_eq!(by_url.id, first.id);

    let done = wait_for_job(&h.queue, &first.id, Duration::from_secs(5), |j| {
        j.status == JobStatus::Completed
    })
    .await;
    assert_eq!(done.result, Some(json!({"name": "A"})));

    // A finished job no longer dedupes: a refresh gets a new id.
    let third = h.queue.enqueue(URL, JobKind::Product, None).await.unwrap();
    assert_ne!(third.id, first.id);
}

#[tokio::test]
async fn progressive_partial_then_final() {
    let pool = MockPool::two_direct_slots();
    pool.script(URL, vec![Scripted::SucceedWithProgress(
        json!({"name": "A"}),
        json!({"name": "A", "price": 1200}),
    )]);
    let h = harness_with(pool, fast_queue_config()).await;

    let job = h.queue.enqueue(URL, JobKind::Product, None).await.unwrap();

    let partial = wait_for_job(&h.queue, &job.id, Duration::from_secs(2), |j| {
        j.result_is_partial()
    })
    .await;
    assert_eq!(partial.status, JobStatus::Processing);
    assert_eq!(partial.result.as_ref().unwrap()["name"], json!("A"));

    let done = wait_for_job(&h.queue, &job.id, Duration::from_secs(5), |j| {
        j.status == JobStatus::Completed
    })
    .await;
    let result = done.result.unwrap();
    assert!(result.get(PARTIAL_FLAG).is_none(), "final strips the marker");
    assert_eq!(result["price"], json!(1200));
}

#[tokio::test]
async fn hedged_race_first_writer_wins() {
    let pool = MockPool::two_direct_slots();
    // Attempt A stalls past the hedge delay; attempt B wins with P.
    pool.script(URL, vec![
        Scripted::Hang,
        Scripted::Succeed(json!({"winner": "B"})),
    ]);
    let cfg = storescrape::config::QueueConfig {
        hedge_delay_ms: 100,
        ..fast_queue_config()
    };
    let h = harness_with(pool.clone(), cfg).await;

    let job = h.queue.enqueue(URL, JobKind::Product, None).await.unwrap();
    let done = wait_for_job(&h.queue, &job.id, Duration::from_secs(5), |j| {
        j.status == JobStatus::Completed
    })
    .await;
    assert_eq!(done.result, Some(json!({"winner": "B"})));

    // Both workers ran, on different slots.
    let executions = pool.executions();
    assert_eq!(executions.len(), 2);
    assert_ne!(executions[0].0.slot, executions[1].0.slot);

    // The loser's cancellation must not overwrite the recorded result.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let still = h.queue.job(&job.id).await.unwrap();
    assert_eq!(still.result, Some(json!({"winner": "B"})));
}

#[tokio::test]
async fn proxy_failure_rotates_and_retries() {
    let pool = MockPool::with_tabs(vec![TabRef::new(0, 0)]);
    let bad = ProxyRecord::new("203.0.113.1", 8080, ProxyProtocol::Http);
    let good = ProxyRecord::new("203.0.113.2", 8080, ProxyProtocol::Http);
    pool.bind_proxy(0, bad.clone());
    pool.state
        .lock()
        .unwrap()
        .next_proxies
        .push_back(good.clone());
    pool.script(URL, vec![
        Scripted::Fail("HTTP_429: origin rate limited".to_string()),
        Scripted::Succeed(json!({"ok": true})),
    ]);

    let h = harness_with(pool.clone(), fast_queue_config()).await;
    h.proxies.seed_pool(vec![bad.clone(), good.clone()]);

    let job = h.queue.enqueue(URL, JobKind::Product, None).await.unwrap();
    let done = wait_for_job(&h.queue, &job.id, Duration::from_secs(5), |j| {
        j.status == JobStatus::Completed
    })
    .await;
    assert_eq!(done.result, Some(json!({"ok": true})));

    // The failing proxy was penalized and the slot's failure recorded.
    assert!(h.proxies.is_penalized(&bad.key()));
    assert_eq!(h.proxies.health_of(&bad.key()).unwrap().fail_count, 1);
    assert_eq!(pool.state.lock().unwrap().slot_failures, vec![0]);

    // The restart is fire-and-forget; wait for it, then confirm the slot
    // came back bound to a different proxy.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while pool.restarts().is_empty() {
        assert!(std::time::Instant::now() < deadline, "slot was never restarted");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(pool.restarts(), vec![0]);
    assert_eq!(
        pool.state.lock().unwrap().bound_proxies.get(&0).map(ProxyRecord::key),
        Some(good.key())
    );
}

#[tokio::test]
async fn unsupported_browser_rotates_without_burning_retries() {
    let pool = MockPool::two_direct_slots();
    pool.script(URL, vec![
        Scripted::Fail("UNSUPPORTED_BROWSER".to_string()),
        Scripted::Succeed(json!({"ok": true})),
    ]);
    // One attempt only: if rotation consumed the retry budget, the job
    // would fail instead of completing.
    let cfg = storescrape::config::QueueConfig {
        max_attempts: 1,
        ..fast_queue_config()
    };
    let h = harness_with(pool.clone(), cfg).await;

    let job = h.queue.enqueue(URL, JobKind::Product, None).await.unwrap();
    let done = wait_for_job(&h.queue, &job.id, Duration::from_secs(5), |j| {
        j.status == JobStatus::Completed
    })
    .await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(pool.rotations().len(), 1);
    assert!(pool.restarts().is_empty());
}

#[tokio::test]
async fn no_content_fails_terminally_without_retry() {
    let pool = MockPool::two_direct_slots();
    pool.script(URL, vec![
        Scripted::Fail("204_NO_CONTENT".to_string()),
        Scripted::Succeed(json!({"never": true})),
    ]);
    let h = harness_with(pool.clone(), fast_queue_config()).await;

    let job = h.queue.enqueue(URL, JobKind::Product, None).await.unwrap();
    let done = wait_for_job(&h.queue, &job.id, Duration::from_secs(5), |j| {
        j.status == JobStatus::Failed
    })
    .await;
    assert!(done.error.unwrap().contains("204_NO_CONTENT"));
    assert_eq!(pool.executions().len(), 1, "204 must not retry");
}

#[tokio::test]
async fn recoverable_errors_exhaust_retry_budget() {
    let pool = MockPool::two_direct_slots();
    pool.script(URL, vec![
        Scripted::Fail("something odd".to_string()),
        Scripted::Fail("something odd again".to_string()),
        Scripted::Fail("still odd".to_string()),
    ]);
    let h = harness_with(pool.clone(), fast_queue_config()).await;

    let job = h.queue.enqueue(URL, JobKind::Product, None).await.unwrap();
    let done = wait_for_job(&h.queue, &job.id, Duration::from_secs(5), |j| {
        j.status == JobStatus::Failed
    })
    .await;
    assert!(done.error.unwrap().contains("still odd"), "last error wins");
    assert_eq!(pool.executions().len(), 3);
}

#[tokio::test]
async fn store_completion_fans_out_product_jobs() {
    let store_url = "https://shop.example.com/gadget-world";
    let pool = MockPool::two_direct_slots();
    pool.script(store_url, vec![Scripted::Succeed(json!({
        "channelId": "ch-9",
        "allProductIds": ["1", "2", "3"],
        "productsMap": {"1": {"name": "a"}, "2": {"name": "b"}, "3": {"name": "c"}}
    }))]);
    let h = harness_with(pool.clone(), fast_queue_config()).await;

    let job = h
        .queue
        .enqueue(store_url, JobKind::Store, None)
        .await
        .unwrap();
    wait_for_job(&h.queue, &job.id, Duration::from_secs(5), |j| {
        j.status == JobStatus::Completed
    })
    .await;

    // Follow-up product jobs appear and complete (default script).
    for product in ["1", "2", "3"] {
        let url = format!("{store_url}/products/{product}");
        let follow_up = wait_for_job(
            &h.queue,
            &{
                let mut job = None;
                for _ in 0..100 {
                    job = h.queue.job_by_url(&url).await;
                    if job.is_some() {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                job.expect("follow-up product job scheduled").id
            },
            Duration::from_secs(5),
            |j| j.is_terminal(),
        )
        .await;
        assert_eq!(follow_up.kind, JobKind::Product);
    }
}

#[tokio::test]
async fn store_fanout_respects_cap() {
    let store_url = "https://shop.example.com/mega-store";
    let ids: Vec<String> = (0..20).map(|i| i.to_string()).collect();
    let pool = MockPool::two_direct_slots();
    pool.script(store_url, vec![Scripted::Succeed(json!({
        "channelId": "ch-9",
        "allProductIds": ids,
        "productsMap": {}
    }))]);
    let cfg = storescrape::config::QueueConfig {
        max_store_fanout: 5,
        ..fast_queue_config()
    };
    let h = harness_with(pool.clone(), cfg).await;

    let job = h
        .queue
        .enqueue(store_url, JobKind::Store, None)
        .await
        .unwrap();
    wait_for_job(&h.queue, &job.id, Duration::from_secs(5), |j| {
        j.status == JobStatus::Completed
    })
    .await;

    // Give the fan-out and its jobs time to settle, then count.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let stats = h.queue.stats();
    // The store job itself plus at most five follow-ups.
    assert!(
        stats.completed <= 6,
        "fan-out exceeded cap: {} jobs completed",
        stats.completed
    );
    assert!(stats.completed >= 2, "some follow-ups should have run");
}

#[tokio::test]
async fn ephemeral_proxy_bypasses_queue() {
    let pool = MockPool::with_tabs(vec![]); // no pool workers at all
    pool.script(URL, vec![Scripted::Succeed(json!({"via": "ephemeral"}))]);
    let h = harness_with(pool.clone(), fast_queue_config()).await;

    let job = h
        .queue
        .enqueue(URL, JobKind::Product, Some("socks5://1.2.3.4:1080".to_string()))
        .await
        .unwrap();
    let done = wait_for_job(&h.queue, &job.id, Duration::from_secs(5), |j| {
        j.status == JobStatus::Completed
    })
    .await;
    assert_eq!(done.result, Some(json!({"via": "ephemeral"})));
    assert_eq!(done.ephemeral_proxy.as_deref(), Some("socks5://1.2.3.4:1080"));
}

#[tokio::test]
async fn completed_result_lands_in_result_cache() {
    let pool = MockPool::two_direct_slots();
    pool.script(URL, vec![Scripted::Succeed(json!({"cached": "yes"}))]);
    let h = harness_with(pool, fast_queue_config()).await;

    let job = h.queue.enqueue(URL, JobKind::Product, None).await.unwrap();
    wait_for_job(&h.queue, &job.id, Duration::from_secs(5), |j| {
        j.status == JobStatus::Completed
    })
    .await;

    let normalized = storescrape::normalize(URL).unwrap();
    assert_eq!(
        h.results.cached_result(&normalized),
        Some(json!({"cached": "yes"}))
    );

    // An API front-end serves this payload without a new job; the job
    // table stays untouched by the lookup.
    let before = h.queue.stats();
    let _ = h.results.cached_result(&normalized);
    let after = h.queue.stats();
    assert_eq!(before.completed, after.completed);
    assert_eq!(before.pending, after.pending);
}

#[tokio::test]
async fn identity_marked_working_on_success() {
    let pool = MockPool::two_direct_slots();
    pool.script(URL, vec![Scripted::Succeed(json!({"ok": 1}))]);
    let h = harness_with(pool, fast_queue_config()).await;

    let job = h.queue.enqueue(URL, JobKind::Product, None).await.unwrap();
    wait_for_job(&h.queue, &job.id, Duration::from_secs(5), |j| {
        j.status == JobStatus::Completed
    })
    .await;
    assert!(h.identities.is_working("mock-ua"));
}
