//! Proxy validation probes.
//!
//! Each candidate is tested two ways, concurrently: connectivity plus IP
//! classification against an IP-info endpoint, and origin reachability by
//! an HTTPS GET through the proxy (a CONNECT tunnel followed by a minimal
//! TLS request, which is exactly what the client does for https-over-proxy).

use anyhow::{Context, Result};
use chrono::Utc;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::types::{IpType, ProxyRecord};
use crate::config::ProxyConfig;

/// Org/ISP substrings that mark an address as datacenter space.
const DATACENTER_MARKERS: &[&str] = &[
    "amazon", "aws", "google", "gcp", "microsoft", "azure", "ovh", "hetzner", "digitalocean",
    "linode", "vultr", "alibaba", "oracle", "cloudflare", "hosting", "datacenter", "data center",
    "server", "colo", "vps",
];

#[derive(Debug, Deserialize)]
struct IpInfoBody {
    #[serde(default)]
    org: Option<String>,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    company: Option<IpInfoCompany>,
}

#[derive(Debug, Deserialize)]
struct IpInfoCompany {
    #[serde(default)]
    name: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

pub struct Validator {
    cfg: ProxyConfig,
    origin_url: String,
}

impl Validator {
    #[must_use]
    pub fn new(cfg: ProxyConfig, origin_url: String) -> Self {
        Self { cfg, origin_url }
    }

    /// Validate a batch with bounded parallelism. Records that fail any
    /// probe are dropped from the output; survivors carry fresh metadata.
    pub async fn validate_batch(&self, candidates: Vec<ProxyRecord>) -> Vec<ProxyRecord> {
        let semaphore = Arc::new(Semaphore::new(self.cfg.batch_size.max(1)));
        let mut tasks = FuturesUnordered::new();

        for record in candidates {
            let semaphore = Arc::clone(&semaphore);
            tasks.push(async move {
                let _permit = semaphore.acquire().await.ok()?;
                self.validate_one(record).await
            });
        }

        let mut validated = Vec::new();
        while let Some(result) = tasks.next().await {
            if let Some(record) = result {
                validated.push(record);
            }
        }
        validated
    }

    /// Probe one proxy. Rotating-provider records are never probed; the
    /// caller keeps them out of the batch.
    pub async fn validate_one(&self, mut record: ProxyRecord) -> Option<ProxyRecord> {
        let client = match self.proxied_client(&record) {
            Ok(c) => c,
            Err(e) => {
                debug!(proxy = %record.key(), "cannot build proxied client: {e}");
                return None;
            }
        };

        let (info, reach) = tokio::join!(self.probe_ipinfo(&client), self.probe_origin(&client));

        let (latency_ms, body) = match info {
            Ok(ok) => ok,
            Err(e) => {
                debug!(proxy = %record.key(), "ip-info probe failed: {e}");
                return None;
            }
        };
        if latency_ms > self.cfg.max_latency_ms {
            debug!(
                proxy = %record.key(),
                latency_ms,
                "proxy over latency ceiling"
            );
            return None;
        }

        record.latency_ms = Some(latency_ms);
        record.can_reach_origin = reach;
        record.org = body.org.clone();
        record.isp = body.company.as_ref().and_then(|c| c.name.clone());
        record.country = body.country;
        record.ip_type = classify_ip(
            body.org.as_deref(),
            body.company.as_ref().and_then(|c| c.kind.as_deref()),
        );
        record.last_validated = Some(Utc::now());
        Some(record)
    }

    fn proxied_client(&self, record: &ProxyRecord) -> Result<reqwest::Client> {
        let proxy = reqwest::Proxy::all(record.url()).context("invalid proxy URL")?;
        reqwest::Client::builder()
            .proxy(proxy)
            .timeout(Duration::from_secs(self.cfg.probe_timeout_secs))
            .danger_accept_invalid_certs(true)
            .build()
            .context("building proxied client")
    }

    /// Connectivity + classification probe. Returns measured latency and
    /// the parsed IP-info body.
    async fn probe_ipinfo(&self, client: &reqwest::Client) -> Result<(u64, IpInfoBody)> {
        let started = Instant::now();
        let response = client
            .get(&self.cfg.ipinfo_url)
            .send()
            .await
            .context("ip-info request")?;
        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let body: IpInfoBody = response.json().await.context("ip-info body")?;
        Ok((latency_ms, body))
    }

    /// Origin reachability. Any HTTP response through the tunnel counts:
    /// a 403 from the edge still proves the path works.
    async fn probe_origin(&self, client: &reqwest::Client) -> bool {
        match client.get(&self.origin_url).send().await {
            Ok(_) => true,
            Err(e) => {
                debug!("origin probe failed: {e}");
                false
            }
        }
    }
}

fn classify_ip(org: Option<&str>, company_kind: Option<&str>) -> IpType {
    if let Some(kind) = company_kind {
        match kind.to_ascii_lowercase().as_str() {
            "isp" | "residential" => return IpType::Residential,
            "hosting" | "business" => return IpType::Datacenter,
            _ => {}
        }
    }
    let Some(org) = org else {
        return IpType::Unknown;
    };
    let lower = org.to_ascii_lowercase();
    if DATACENTER_MARKERS.iter().any(|m| lower.contains(m)) {
        IpType::Datacenter
    } else if lower.contains("telecom")
        || lower.contains("communications")
        || lower.contains("broadband")
        || lower.contains("cable")
        || lower.contains("mobile")
    {
        IpType::Residential
    } else {
        IpType::Unknown
    }
}

/// Keep the best `max_size` records when the pool overflows, ranked by
/// success ratio `success / (fail + 1)`.
pub fn trim_pool(
    mut pool: Vec<ProxyRecord>,
    max_size: usize,
    ratio_of: impl Fn(&ProxyRecord) -> f64,
) -> Vec<ProxyRecord> {
    if pool.len() <= max_size {
        return pool;
    }
    pool.sort_by(|a, b| {
        ratio_of(b)
            .partial_cmp(&ratio_of(a))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let dropped = pool.len() - max_size;
    pool.truncate(max_size);
    warn!(dropped, "proxy pool over max size, dropped lowest-ratio records");
    pool
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::types::ProxyProtocol;

    #[test]
    fn classifies_datacenter_orgs() {
        assert_eq!(
            classify_ip(Some("AS16509 Amazon.com, Inc."), None),
            IpType::Datacenter
        );
        assert_eq!(classify_ip(Some("OVH SAS"), None), IpType::Datacenter);
    }

    #[test]
    fn classifies_residential_orgs() {
        assert_eq!(
            classify_ip(Some("AS7922 Comcast Cable Communications"), None),
            IpType::Residential
        );
        assert_eq!(classify_ip(None, Some("isp")), IpType::Residential);
    }

    #[test]
    fn unknown_when_no_signal() {
        assert_eq!(classify_ip(None, None), IpType::Unknown);
        assert_eq!(classify_ip(Some("AS0 Mystery Networks"), None), IpType::Unknown);
    }

    #[test]
    fn trim_keeps_best_ratio() {
        let mk = |host: &str| ProxyRecord::new(host, 1, ProxyProtocol::Http);
        let pool = vec![mk("a"), mk("b"), mk("c")];
        let trimmed = trim_pool(pool, 2, |p| match p.host.as_str() {
            "a" => 0.1,
            "b" => 0.9,
            _ => 0.5,
        });
        let hosts: Vec<&str> = trimmed.iter().map(|p| p.host.as_str()).collect();
        assert_eq!(hosts, vec!["b", "c"]);
    }
}
