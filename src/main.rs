// storescrape CLI: initialize the gateway, enqueue the URLs given on the
// command line, poll until every job settles, print payloads as JSON
// lines. Product/store kinds are inferred from the URL path unless
// prefixed with `store:` / `product:` / `category:`.

use anyhow::Result;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use storescrape::{FetchResponse, Gateway, GatewayConfig, JobKind, JobStatus};

fn parse_target(arg: &str) -> (JobKind, &str) {
    if let Some(url) = arg.strip_prefix("product:") {
        (JobKind::Product, url)
    } else if let Some(url) = arg.strip_prefix("store:") {
        (JobKind::Store, url)
    } else if let Some(url) = arg.strip_prefix("category:") {
        (JobKind::Category, url)
    } else if arg.contains("/products/") {
        (JobKind::Product, arg)
    } else {
        (JobKind::Store, arg)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let targets: Vec<String> = std::env::args().skip(1).collect();
    if targets.is_empty() {
        eprintln!("usage: storescrape [kind:]<url> [[kind:]<url> ...]");
        std::process::exit(2);
    }

    let gateway = Gateway::initialize(GatewayConfig::from_env()).await?;

    let mut pending: Vec<String> = Vec::new();
    for target in &targets {
        let (kind, url) = parse_target(target);
        match gateway.fetch(url, kind).await {
            Ok(FetchResponse::Cached(payload)) => {
                println!("{}", serde_json::json!({ "url": url, "cached": true, "result": payload }));
            }
            Ok(FetchResponse::Enqueued(job)) => {
                info!(url, id = %job.id, "enqueued");
                pending.push(job.id);
            }
            Err(e) => warn!(url, "enqueue failed: {e}"),
        }
    }

    while !pending.is_empty() {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let mut still_pending = Vec::new();
        for id in pending {
            match gateway.job(&id).await {
                Some(job) if matches!(job.status, JobStatus::Completed | JobStatus::Failed) => {
                    println!("{}", serde_json::to_string(&job)?);
                }
                Some(_) => still_pending.push(id),
                None => warn!(%id, "job disappeared"),
            }
        }
        pending = still_pending;
    }

    gateway.shutdown().await;
    Ok(())
}
