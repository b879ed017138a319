//! Rotating proxy providers.
//!
//! Providers hand out proxies that are assumed live: their output skips
//! the validation loop and gets a synthetic "valid" record. Two shapes
//! exist: a list-mode provider that refreshes a cached list and rotates
//! through it, and a gateway-mode provider that always returns the same
//! endpoint with a per-call synthetic username, delegating rotation to
//! the upstream.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::types::{ProxyProtocol, ProxyRecord, parse_proxy_literal};
use crate::proxy::sources::parse_payload;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProviderStats {
    pub served: u64,
    pub failed: u64,
    pub last_refresh: Option<DateTime<Utc>>,
}

/// On-demand proxy provider. Object-safe; async methods return boxed
/// futures so implementations can live behind `Arc<dyn RotatingProvider>`.
pub trait RotatingProvider: Send + Sync {
    fn name(&self) -> &str;

    /// One-time setup (credential checks, first list refresh).
    fn initialize(&self) -> BoxFuture<'_, Result<()>>;

    /// Next proxy, or `None` when the provider currently has nothing;
    /// the inventory then falls back to the validated pool.
    fn acquire(&self) -> BoxFuture<'_, Option<ProxyRecord>>;

    /// A proxy from this provider failed downstream.
    fn mark_bad(&self, proxy: &ProxyRecord) -> BoxFuture<'_, ()>;

    fn stats(&self) -> ProviderStats;

    fn health_check(&self) -> BoxFuture<'_, bool>;

    fn shutdown(&self) -> BoxFuture<'_, ()>;
}

/// Configuration accepted by `add_rotating_provider`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ProviderConfig {
    List(ListProviderConfig),
    Gateway(GatewayProviderConfig),
}

pub fn build_provider(name: &str, config: ProviderConfig) -> Arc<dyn RotatingProvider> {
    match config {
        ProviderConfig::List(cfg) => Arc::new(ListModeProvider::new(name, cfg)),
        ProviderConfig::Gateway(cfg) => Arc::new(GatewayModeProvider::new(name, cfg)),
    }
}

// =============================================================================
// List-mode provider
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListProviderConfig {
    /// Endpoint serving the current proxy list (any ingestible format).
    pub refresh_url: String,
    /// Seconds between list refreshes.
    #[serde(default = "default_refresh_secs")]
    pub refresh_interval_secs: u64,
    #[serde(default)]
    pub protocol: ProxyProtocol,
}

fn default_refresh_secs() -> u64 {
    10 * 60
}

struct ListState {
    proxies: Vec<ProxyRecord>,
    cursor: usize,
    refreshed_at: Option<Instant>,
}

pub struct ListModeProvider {
    name: String,
    config: ListProviderConfig,
    client: reqwest::Client,
    state: Mutex<ListState>,
    served: AtomicU64,
    failed: AtomicU64,
    last_refresh: Mutex<Option<DateTime<Utc>>>,
}

impl ListModeProvider {
    #[must_use]
    pub fn new(name: &str, config: ListProviderConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            client: reqwest::Client::new(),
            state: Mutex::new(ListState {
                proxies: Vec::new(),
                cursor: 0,
                refreshed_at: None,
            }),
            served: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            last_refresh: Mutex::new(None),
        }
    }

    async fn refresh(&self) -> Result<()> {
        let payload = self
            .client
            .get(&self.config.refresh_url)
            .timeout(Duration::from_secs(15))
            .send()
            .await
            .context("provider list refresh request")?
            .text()
            .await
            .context("provider list refresh body")?;

        let mut proxies = parse_payload(&payload, &self.name);
        for p in &mut proxies {
            p.is_rotating = true;
            p.protocol = self.config.protocol;
            p.can_reach_origin = true;
            p.last_validated = Some(Utc::now());
        }

        info!(
            provider = %self.name,
            count = proxies.len(),
            "refreshed rotating provider list"
        );

        let mut state = self.state.lock();
        state.proxies = proxies;
        state.cursor = 0;
        state.refreshed_at = Some(Instant::now());
        *self.last_refresh.lock() = Some(Utc::now());
        Ok(())
    }

    fn needs_refresh(&self) -> bool {
        let state = self.state.lock();
        match state.refreshed_at {
            Some(at) => at.elapsed() >= Duration::from_secs(self.config.refresh_interval_secs),
            None => true,
        }
    }
}

impl RotatingProvider for ListModeProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.refresh().await })
    }

    fn acquire(&self) -> BoxFuture<'_, Option<ProxyRecord>> {
        Box::pin(async move {
            if self.needs_refresh()
                && let Err(e) = self.refresh().await
            {
                warn!(provider = %self.name, "list refresh failed: {e}");
            }

            let mut state = self.state.lock();
            if state.proxies.is_empty() {
                return None;
            }
            let idx = state.cursor % state.proxies.len();
            state.cursor = state.cursor.wrapping_add(1);
            self.served.fetch_add(1, Ordering::Relaxed);
            Some(state.proxies[idx].clone())
        })
    }

    fn mark_bad(&self, proxy: &ProxyRecord) -> BoxFuture<'_, ()> {
        let key = proxy.key();
        Box::pin(async move {
            self.failed.fetch_add(1, Ordering::Relaxed);
            let mut state = self.state.lock();
            let before = state.proxies.len();
            state.proxies.retain(|p| p.key() != key);
            if state.proxies.len() != before {
                debug!(provider = %self.name, proxy = %key, "dropped bad proxy from provider list");
            }
        })
    }

    fn stats(&self) -> ProviderStats {
        ProviderStats {
            served: self.served.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            last_refresh: *self.last_refresh.lock(),
        }
    }

    fn health_check(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move { !self.state.lock().proxies.is_empty() })
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.state.lock().proxies.clear();
        })
    }
}

// =============================================================================
// Gateway-mode provider
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayProviderConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: ProxyProtocol,
    /// Username prefix; a session id (and optional country) is appended
    /// per call, e.g. `cust-abc-session-9f2c41d0-country-de`.
    pub username_prefix: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

pub struct GatewayModeProvider {
    name: String,
    config: GatewayProviderConfig,
    served: AtomicU64,
    failed: AtomicU64,
}

impl GatewayModeProvider {
    #[must_use]
    pub fn new(name: &str, config: GatewayProviderConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            served: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    fn session_username(&self) -> String {
        let session: String = {
            let mut rng = rand::rng();
            (0..8)
                .map(|_| {
                    let n: u8 = rng.random_range(0..16);
                    char::from_digit(u32::from(n), 16).unwrap_or('0')
                })
                .collect()
        };
        match &self.config.country {
            Some(cc) => format!(
                "{}-session-{session}-country-{}",
                self.config.username_prefix,
                cc.to_ascii_lowercase()
            ),
            None => format!("{}-session-{session}", self.config.username_prefix),
        }
    }
}

impl RotatingProvider for GatewayModeProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { Ok(()) })
    }

    fn acquire(&self) -> BoxFuture<'_, Option<ProxyRecord>> {
        Box::pin(async move {
            self.served.fetch_add(1, Ordering::Relaxed);
            let mut record =
                ProxyRecord::new(self.config.host.clone(), self.config.port, self.config.protocol);
            record.username = Some(self.session_username());
            record.password = Some(self.config.password.clone());
            record.source = self.name.clone();
            record.is_rotating = true;
            record.can_reach_origin = true;
            record.last_validated = Some(Utc::now());
            Some(record)
        })
    }

    fn mark_bad(&self, _proxy: &ProxyRecord) -> BoxFuture<'_, ()> {
        // The upstream owns rotation; a bad session is simply not reused
        // since every acquire synthesizes a fresh one.
        Box::pin(async move {
            self.failed.fetch_add(1, Ordering::Relaxed);
        })
    }

    fn stats(&self) -> ProviderStats {
        ProviderStats {
            served: self.served.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            last_refresh: None,
        }
    }

    fn health_check(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move { !self.config.host.is_empty() })
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {})
    }
}

/// Parse an ephemeral proxy literal the way provider output is shaped:
/// rotating flag set, assumed reachable.
pub fn ephemeral_record(literal: &str) -> Result<ProxyRecord> {
    let mut record = parse_proxy_literal(literal, "ephemeral")?;
    record.can_reach_origin = true;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn gateway_provider_synthesizes_sessions() {
        let provider = GatewayModeProvider::new(
            "gw",
            GatewayProviderConfig {
                host: "gw.example.net".to_string(),
                port: 7777,
                protocol: ProxyProtocol::Http,
                username_prefix: "cust-abc".to_string(),
                password: "pw".to_string(),
                country: Some("DE".to_string()),
            },
        );

        let a = provider.acquire().await.unwrap();
        let b = provider.acquire().await.unwrap();

        assert_eq!(a.key(), "gw.example.net:7777");
        assert_eq!(a.key(), b.key());
        assert!(a.is_rotating);
        let user_a = a.username.unwrap();
        let user_b = b.username.unwrap();
        assert!(user_a.starts_with("cust-abc-session-"));
        assert!(user_a.ends_with("-country-de"));
        assert_ne!(user_a, user_b, "each call gets a fresh session id");
        assert_eq!(provider.stats().served, 2);
    }

    #[tokio::test]
    async fn list_provider_rotates_and_drops_bad() {
        let provider = ListModeProvider::new(
            "list",
            ListProviderConfig {
                refresh_url: "http://unused.invalid/list".to_string(),
                refresh_interval_secs: 3600,
                protocol: ProxyProtocol::Http,
            },
        );
        {
            let mut state = provider.state.lock();
            state.proxies = vec![
                ProxyRecord::new("203.0.113.1", 1, ProxyProtocol::Http),
                ProxyRecord::new("203.0.113.2", 2, ProxyProtocol::Http),
            ];
            state.refreshed_at = Some(Instant::now());
        }

        let first = provider.acquire().await.unwrap();
        let second = provider.acquire().await.unwrap();
        let third = provider.acquire().await.unwrap();
        assert_ne!(first.key(), second.key());
        assert_eq!(first.key(), third.key());

        provider.mark_bad(&first).await;
        let remaining = provider.acquire().await.unwrap();
        assert_eq!(remaining.key(), second.key());
        assert!(provider.health_check().await);
    }
}
