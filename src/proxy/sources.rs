//! Proxy source management and ingestion.
//!
//! A source is a URL or a local file in JSON, TXT or CSV form. The format
//! is auto-detected from the payload, not the name: JSON payloads may be
//! an array of objects, an array of strings, or `{"proxies": [...]}`;
//! TXT is one literal per line; CSV with or without a header.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::types::{ProxyProtocol, ProxyRecord, parse_proxy_literal};
use crate::config::PROXY_LIST_ENV;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySource {
    pub name: String,
    /// URL (`http(s)://...`) or local file path.
    pub location: String,
}

/// User-configured and default sources, persisted separately so user edits
/// survive upgrades that ship new defaults.
pub struct SourceBook {
    user: Vec<ProxySource>,
    defaults: Vec<ProxySource>,
    user_path: PathBuf,
    defaults_path: PathBuf,
}

impl SourceBook {
    pub async fn load(dir: &Path) -> Result<Self> {
        let user_path = dir.join("sources.json");
        let defaults_path = dir.join("default_sources.json");
        let user = read_sources(&user_path).await;
        let defaults = read_sources(&defaults_path).await;
        Ok(Self {
            user,
            defaults,
            user_path,
            defaults_path,
        })
    }

    #[must_use]
    pub fn all(&self) -> Vec<ProxySource> {
        let mut out = self.defaults.clone();
        for s in &self.user {
            if !out.iter().any(|d| d.name == s.name) {
                out.push(s.clone());
            }
        }
        out
    }

    pub fn add(&mut self, name: &str, location: &str) {
        self.user.retain(|s| s.name != name);
        self.user.push(ProxySource {
            name: name.to_string(),
            location: location.to_string(),
        });
        self.persist();
    }

    /// Remove a source by name. Returns whether anything was removed.
    pub fn delete(&mut self, name: &str) -> bool {
        let before = self.user.len() + self.defaults.len();
        self.user.retain(|s| s.name != name);
        self.defaults.retain(|s| s.name != name);
        let removed = self.user.len() + self.defaults.len() != before;
        if removed {
            self.persist();
        }
        removed
    }

    fn persist(&self) {
        write_sources(&self.user_path, &self.user);
        write_sources(&self.defaults_path, &self.defaults);
    }
}

async fn read_sources(path: &Path) -> Vec<ProxySource> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(sources) => sources,
            Err(e) => {
                warn!("malformed source file {}: {e}", path.display());
                Vec::new()
            }
        },
        Err(_) => Vec::new(),
    }
}

fn write_sources(path: &Path, sources: &[ProxySource]) {
    match serde_json::to_vec_pretty(sources) {
        Ok(bytes) => {
            if let Err(e) = std::fs::write(path, bytes) {
                warn!("failed to persist sources to {}: {e}", path.display());
            }
        }
        Err(e) => warn!("failed to serialize sources: {e}"),
    }
}

// =============================================================================
// Ingestion
// =============================================================================

/// Fetch one source and parse whatever it serves. Invalid lines are
/// skipped with a debug log rather than failing the source.
pub async fn fetch_source(client: &reqwest::Client, source: &ProxySource) -> Result<Vec<ProxyRecord>> {
    let payload = if source.location.starts_with("http://") || source.location.starts_with("https://")
    {
        client
            .get(&source.location)
            .send()
            .await
            .with_context(|| format!("fetching proxy source {}", source.name))?
            .text()
            .await
            .with_context(|| format!("reading proxy source {}", source.name))?
    } else {
        tokio::fs::read_to_string(&source.location)
            .await
            .with_context(|| format!("reading proxy source file {}", source.location))?
    };

    let records = parse_payload(&payload, &source.name);
    debug!(
        source = %source.name,
        count = records.len(),
        "ingested proxy source"
    );
    Ok(records)
}

/// Inline allow-list from the environment, parsed identically to source
/// lines. Source tag is `env`, which ranks above ordinary sources during
/// selection.
#[must_use]
pub fn parse_env_list() -> Vec<ProxyRecord> {
    let Ok(raw) = std::env::var(PROXY_LIST_ENV) else {
        return Vec::new();
    };
    raw.split(',')
        .filter(|s| !s.trim().is_empty())
        .filter_map(|literal| match parse_proxy_literal(literal, "env") {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("skipping invalid proxy in {PROXY_LIST_ENV}: {e}");
                None
            }
        })
        .collect()
}

/// Auto-detect and parse a source payload.
#[must_use]
pub fn parse_payload(payload: &str, source_name: &str) -> Vec<ProxyRecord> {
    let trimmed = payload.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            return parse_json(&value, source_name);
        }
        // Fall through: some TXT lists start with a bracketed comment.
    }

    if looks_like_csv(trimmed) {
        return parse_csv(trimmed, source_name);
    }

    parse_txt(trimmed, source_name)
}

fn parse_json(value: &Value, source_name: &str) -> Vec<ProxyRecord> {
    let items = match value {
        Value::Array(items) => items.as_slice(),
        Value::Object(obj) => match obj.get("proxies").and_then(Value::as_array) {
            Some(items) => items.as_slice(),
            None => return Vec::new(),
        },
        _ => return Vec::new(),
    };

    items
        .iter()
        .filter_map(|item| match item {
            Value::String(literal) => parse_proxy_literal(literal, source_name).ok(),
            Value::Object(_) => parse_json_object(item, source_name),
            _ => None,
        })
        .collect()
}

fn parse_json_object(item: &Value, source_name: &str) -> Option<ProxyRecord> {
    let host = item
        .get("host")
        .or_else(|| item.get("ip"))
        .and_then(Value::as_str)?;
    let port = match item.get("port") {
        Some(Value::Number(n)) => u16::try_from(n.as_u64()?).ok()?,
        Some(Value::String(s)) => s.parse().ok()?,
        _ => return None,
    };
    let protocol = item
        .get("protocol")
        .and_then(Value::as_str)
        .map(str::parse::<ProxyProtocol>)
        .transpose()
        .ok()?
        .unwrap_or_default();

    let mut record = ProxyRecord::new(host, port, protocol);
    record.source = source_name.to_string();
    record.username = item
        .get("username")
        .and_then(Value::as_str)
        .map(str::to_string);
    record.password = item
        .get("password")
        .and_then(Value::as_str)
        .map(str::to_string);
    record.country = item
        .get("country")
        .and_then(Value::as_str)
        .map(str::to_string);
    Some(record)
}

fn looks_like_csv(payload: &str) -> bool {
    // A comma on most non-empty lines means CSV; inline literals never
    // contain commas.
    let lines: Vec<&str> = payload.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.is_empty() {
        return false;
    }
    let with_comma = lines.iter().filter(|l| l.contains(',')).count();
    with_comma * 2 > lines.len()
}

fn parse_csv(payload: &str, source_name: &str) -> Vec<ProxyRecord> {
    let mut lines = payload.lines().filter(|l| !l.trim().is_empty()).peekable();

    // Header detection: a first line whose second column is not a number.
    let mut columns: Vec<String> = vec![
        "host".to_string(),
        "port".to_string(),
        "protocol".to_string(),
        "username".to_string(),
        "password".to_string(),
    ];
    if let Some(first) = lines.peek() {
        let cells: Vec<&str> = first.split(',').map(str::trim).collect();
        let second_is_port = cells.get(1).is_some_and(|c| c.parse::<u16>().is_ok());
        if !second_is_port {
            columns = cells.iter().map(|c| c.to_ascii_lowercase()).collect();
            lines.next();
        }
    }

    let col = |name: &str| columns.iter().position(|c| c == name);
    let host_idx = col("host").or_else(|| col("ip")).unwrap_or(0);
    let port_idx = col("port").unwrap_or(1);
    let proto_idx = col("protocol").or_else(|| col("type"));
    let user_idx = col("username").or_else(|| col("user"));
    let pass_idx = col("password").or_else(|| col("pass"));

    lines
        .filter_map(|line| {
            let cells: Vec<&str> = line.split(',').map(str::trim).collect();
            let host = cells.get(host_idx).filter(|h| !h.is_empty())?;
            let port: u16 = cells.get(port_idx)?.parse().ok()?;
            let protocol = proto_idx
                .and_then(|i| cells.get(i))
                .filter(|p| !p.is_empty())
                .map(|p| p.parse::<ProxyProtocol>())
                .transpose()
                .ok()?
                .unwrap_or_default();
            let mut record = ProxyRecord::new(*host, port, protocol);
            record.source = source_name.to_string();
            record.username = user_idx
                .and_then(|i| cells.get(i))
                .filter(|c| !c.is_empty())
                .map(|c| (*c).to_string());
            record.password = pass_idx
                .and_then(|i| cells.get(i))
                .filter(|c| !c.is_empty())
                .map(|c| (*c).to_string());
            Some(record)
        })
        .collect()
}

fn parse_txt(payload: &str, source_name: &str) -> Vec<ProxyRecord> {
    payload
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|line| match parse_proxy_literal(line, source_name) {
            Ok(record) => Some(record),
            Err(e) => {
                debug!("skipping unparsable proxy line: {e}");
                None
            }
        })
        .collect()
}

/// Validate a source location eagerly so `add_source` surfaces typos.
pub fn validate_location(location: &str) -> Result<()> {
    if location.starts_with("http://") || location.starts_with("https://") {
        url::Url::parse(location).context("invalid source URL")?;
        return Ok(());
    }
    if location.is_empty() {
        bail!("empty source location");
    }
    Ok(())
}
