//! Proxy inventory behavior across restarts, strategies and providers.

use std::sync::Arc;
use storescrape::config::{ProxyConfig, RotationStrategy};
use storescrape::proxy::{
    GatewayProviderConfig, IpType, ProviderConfig, ProxyInventory, ProxyProtocol, ProxyRecord,
};

fn record(host: &str, latency: u64) -> ProxyRecord {
    let mut p = ProxyRecord::new(host, 8080, ProxyProtocol::Http);
    p.latency_ms = Some(latency);
    p.last_validated = Some(chrono::Utc::now());
    p
}

async fn inventory(cfg: ProxyConfig, dir: &std::path::Path) -> Arc<ProxyInventory> {
    ProxyInventory::new(cfg, "https://shop.example.com".to_string(), dir.to_path_buf())
        .await
        .unwrap()
}

#[tokio::test]
async fn bad_set_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let doomed = record("203.0.113.1", 50);

    {
        let inv = inventory(ProxyConfig::default(), dir.path()).await;
        inv.seed_pool(vec![doomed.clone()]);
        for _ in 0..3 {
            inv.mark_bad(&doomed).await;
        }
        assert!(inv.is_bad(&doomed.key()));
    }

    // A fresh inventory over the same data dir must still refuse it.
    let inv = inventory(ProxyConfig::default(), dir.path()).await;
    inv.start().await;
    // Give the load a beat; start() reads the persisted documents first.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(inv.is_bad(&doomed.key()));
    inv.shutdown().await;
}

#[tokio::test]
async fn round_robin_cycles_through_candidates() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = ProxyConfig {
        rotation_strategy: RotationStrategy::RoundRobin,
        ..Default::default()
    };
    let inv = inventory(cfg, dir.path()).await;
    inv.seed_pool(vec![
        record("203.0.113.1", 10),
        record("203.0.113.2", 20),
        record("203.0.113.3", 30),
    ]);

    let mut seen = std::collections::HashSet::new();
    for _ in 0..3 {
        let p = inv.acquire(None, None).await.unwrap();
        seen.insert(p.key());
    }
    assert_eq!(seen.len(), 3, "LRU round-robin must touch every candidate");
}

#[tokio::test]
async fn latency_based_avoids_pinning_the_fastest() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = ProxyConfig {
        rotation_strategy: RotationStrategy::LatencyBased,
        ..Default::default()
    };
    let inv = inventory(cfg, dir.path()).await;
    inv.seed_pool(vec![
        record("203.0.113.1", 10),
        record("203.0.113.2", 20),
        record("203.0.113.3", 5000),
    ]);

    let first = inv.acquire(None, None).await.unwrap();
    let second = inv.acquire(None, None).await.unwrap();
    assert_ne!(
        first.key(),
        second.key(),
        "least-recently-used within the top set avoids stickiness"
    );
}

#[tokio::test]
async fn weighted_draw_returns_candidates() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = ProxyConfig {
        rotation_strategy: RotationStrategy::Weighted,
        ..Default::default()
    };
    let inv = inventory(cfg, dir.path()).await;
    inv.seed_pool(vec![record("203.0.113.1", 100), record("203.0.113.2", 2000)]);

    for _ in 0..10 {
        let p = inv.acquire(None, None).await.unwrap();
        assert!(p.key().starts_with("203.0.113."));
    }
}

#[tokio::test]
async fn gateway_provider_outranks_pool_and_falls_back() {
    let dir = tempfile::tempdir().unwrap();
    let inv = inventory(ProxyConfig::default(), dir.path()).await;
    inv.seed_pool(vec![record("203.0.113.9", 100)]);

    inv.add_rotating_provider(
        "gw",
        ProviderConfig::Gateway(GatewayProviderConfig {
            host: "gw.example.net".to_string(),
            port: 7000,
            protocol: ProxyProtocol::Http,
            username_prefix: "cust".to_string(),
            password: "pw".to_string(),
            country: None,
        }),
    )
    .await
    .unwrap();

    let p = inv.acquire(None, None).await.unwrap();
    assert_eq!(p.key(), "gw.example.net:7000", "provider wins");
    assert!(p.is_rotating);

    // Provider gone: the validated pool takes over.
    assert!(inv.remove_rotating_provider("gw").await);
    let p = inv.acquire(None, None).await.unwrap();
    assert_eq!(p.key(), "203.0.113.9:8080");
}

#[tokio::test]
async fn whitelist_outranks_lower_latency() {
    let dir = tempfile::tempdir().unwrap();
    let inv = inventory(ProxyConfig::default(), dir.path()).await;
    let fast = record("203.0.113.1", 10);
    let mut favored = record("203.0.113.2", 400);
    favored.ip_type = IpType::Datacenter;
    inv.seed_pool(vec![fast, favored.clone()]);
    inv.mark_working(&favored);

    let p = inv.acquire(None, None).await.unwrap();
    assert_eq!(p.key(), favored.key());
}

#[tokio::test]
async fn validation_cycle_ingests_sources() {
    // A TXT source served over HTTP; validation probes will fail (the
    // listed proxies are not reachable), so the cycle must simply not
    // add them while still completing cleanly.
    let mut server = mockito::Server::new_async().await;
    let body = "203.0.113.1:8080\n203.0.113.2:3128\n";
    let mock = server
        .mock("GET", "/proxies.txt")
        .with_status(200)
        .with_body(body)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let cfg = ProxyConfig {
        probe_timeout_secs: 1,
        batch_size: 4,
        ..Default::default()
    };
    let inv = inventory(cfg, dir.path()).await;
    inv.add_source("mock-list", &format!("{}/proxies.txt", server.url()))
        .unwrap();

    inv.run_validation_cycle().await;
    mock.assert_async().await;
    assert_eq!(inv.stats().pool_size, 0, "unreachable proxies are dropped");
}

#[tokio::test]
async fn source_payloads_parse_all_formats() {
    use storescrape::proxy::parse_payload;

    let json_objs = r#"{"proxies":[{"host":"203.0.113.1","port":9000,"protocol":"socks5"}]}"#;
    assert_eq!(parse_payload(json_objs, "s").len(), 1);

    let csv = "ip,port,type\n203.0.113.1,8080,http\n";
    assert_eq!(parse_payload(csv, "s").len(), 1);

    let txt = "http://u:p@203.0.113.1:8080\n203.0.113.2:1\n";
    let parsed = parse_payload(txt, "s");
    assert_eq!(parsed.len(), 2);
    assert!(parsed[0].has_credentials());
}
