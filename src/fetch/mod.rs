//! Per-kind fetch routines and the contract they expose to the
//! orchestrator.
//!
//! A routine drives one tab against the origin and reports
//! `{success, data}` or `{success: false, error}` where the error string
//! is one of the classified kinds the queue's remediation matrix
//! understands. Partial payloads stream out through the progress sink
//! before the terminal return.

pub mod extract;
pub mod product;
pub mod store;

use anyhow::{Context, Result};
use chromiumoxide::Page;
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::cancel::CancelToken;

/// Error codes the classifier recognizes. Routines report these verbatim
/// or as substrings of a longer message.
pub mod codes {
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const NETWORK: &str = "NETWORK";
    pub const HTTP_429: &str = "HTTP_429";
    pub const HTTP_403: &str = "HTTP_403";
    pub const NO_CONTENT: &str = "204_NO_CONTENT";
    pub const UNSUPPORTED_BROWSER: &str = "UNSUPPORTED_BROWSER";
    pub const CHANNEL_ID_NOT_FOUND: &str = "CHANNEL_ID_NOT_FOUND";
    pub const PROXY_ISSUE: &str = "PROXY_ISSUE";
    pub const CANCELLED: &str = "CANCELLED";
}

/// Terminal report of one routine invocation.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Success(Value),
    Failure(String),
}

impl FetchOutcome {
    #[must_use]
    pub fn failure(code: &str, detail: impl std::fmt::Display) -> Self {
        FetchOutcome::Failure(format!("{code}: {detail}"))
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, FetchOutcome::Success(_))
    }
}

/// Callback handed to routines for mid-flight partial results. Cheap to
/// clone; invocations are synchronous bookkeeping on the caller side.
#[derive(Clone)]
pub struct ProgressSink {
    inner: Arc<dyn Fn(Value) + Send + Sync>,
}

impl ProgressSink {
    pub fn new(f: impl Fn(Value) + Send + Sync + 'static) -> Self {
        Self { inner: Arc::new(f) }
    }

    /// Sink that drops everything, for callers without progressive needs.
    #[must_use]
    pub fn discard() -> Self {
        Self::new(|_| {})
    }

    pub fn emit(&self, partial: Value) {
        (self.inner)(partial);
    }
}

impl std::fmt::Debug for ProgressSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ProgressSink")
    }
}

/// The tab a routine drives: one isolated document context plus the
/// identity it currently wears.
#[derive(Clone)]
pub struct TabSession {
    pub page: Page,
    pub user_agent: String,
    pub navigation_timeout: Duration,
}

impl TabSession {
    /// Navigate and wait for the load to settle, with the session's
    /// timeout. Errors surface with classifier-friendly text.
    pub async fn navigate(&self, url: &str) -> Result<()> {
        let nav = async {
            self.page
                .goto(url)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            self.page
                .wait_for_navigation()
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            Ok::<(), anyhow::Error>(())
        };
        match tokio::time::timeout(self.navigation_timeout, nav).await {
            Ok(result) => result,
            Err(_) => anyhow::bail!(
                "{}: navigation to {url} exceeded {:?}",
                codes::TIMEOUT,
                self.navigation_timeout
            ),
        }
    }

    /// Evaluate an expression whose result is a JSON string, awaiting any
    /// promise, and parse it.
    pub async fn eval_json(&self, script: &str) -> Result<Value> {
        let params = EvaluateParams::builder()
            .expression(script)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(|e| anyhow::anyhow!("building evaluate params: {e}"))?;
        let result = self
            .page
            .evaluate(params)
            .await
            .context("script evaluation")?;
        let raw: String = result
            .into_value()
            .context("script result was not a string")?;
        serde_json::from_str(&raw).context("script result was not valid JSON")
    }

    /// In-page API request with an explicit referrer, returning
    /// `(status, body)`. Runs inside the document so the origin sees a
    /// first-party call with the tab's cookies and fingerprint.
    pub async fn api_get(&self, api_url: &str, referrer: &str) -> Result<(u16, Value)> {
        let script = format!(
            r#"(async () => {{
                try {{
                    const res = await fetch({api}, {{
                        headers: {{ accept: 'application/json' }},
                        referrer: {referrer},
                        credentials: 'include'
                    }});
                    let body = null;
                    if (res.status !== 204) {{
                        try {{ body = await res.json(); }} catch (e) {{ body = null; }}
                    }}
                    return JSON.stringify({{ status: res.status, body }});
                }} catch (e) {{
                    return JSON.stringify({{ status: 0, error: String(e) }});
                }}
            }})()"#,
            api = serde_json::to_string(api_url).unwrap_or_default(),
            referrer = serde_json::to_string(referrer).unwrap_or_default(),
        );

        let response = self.eval_json(&script).await?;
        let status = response
            .get("status")
            .and_then(Value::as_u64)
            .and_then(|s| u16::try_from(s).ok())
            .unwrap_or(0);
        if status == 0 {
            let detail = response
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("fetch failed");
            anyhow::bail!("{}: {detail}", codes::NETWORK);
        }
        let body = response.get("body").cloned().unwrap_or(Value::Null);
        Ok((status, body))
    }

    /// Clear the document to a blank page between retries.
    pub async fn park(&self) -> Result<()> {
        self.page
            .goto("about:blank")
            .await
            .map(|_| ())
            .map_err(|e| anyhow::anyhow!("{e}"))
    }
}

/// Fetch routine contract. Object-safe so routines can be swapped per
/// site behind `Arc<dyn FetchRoutine>`.
pub trait FetchRoutine: Send + Sync {
    fn fetch<'a>(
        &'a self,
        tab: &'a TabSession,
        url: &'a str,
        progress: &'a ProgressSink,
        cancel: &'a CancelToken,
    ) -> BoxFuture<'a, FetchOutcome>;
}

/// Routines keyed by job kind. Category URLs take the store path: a
/// category page embeds the same state shape a store page does.
#[derive(Clone)]
pub struct SiteRoutines {
    pub product: Arc<dyn FetchRoutine>,
    pub store: Arc<dyn FetchRoutine>,
}

impl SiteRoutines {
    #[must_use]
    pub fn for_kind(&self, kind: crate::orchestrator::JobKind) -> Arc<dyn FetchRoutine> {
        match kind {
            crate::orchestrator::JobKind::Product => Arc::clone(&self.product),
            crate::orchestrator::JobKind::Store | crate::orchestrator::JobKind::Category => {
                Arc::clone(&self.store)
            }
        }
    }
}

/// Map an HTTP status from the origin to a routine error code, or `None`
/// when the status is fine.
#[must_use]
pub fn status_error(status: u16) -> Option<String> {
    match status {
        200..=299 if status != 204 => None,
        204 => Some(codes::NO_CONTENT.to_string()),
        429 => Some(format!("{}: origin rate limited", codes::HTTP_429)),
        403 => Some(format!("{}: origin denied", codes::HTTP_403)),
        other => Some(format!("HTTP_{other}")),
    }
}
