//! Product fetch routine.
//!
//! Fast path first: when both the channel id and a preload for the target
//! product are cached, the preload streams out immediately and the direct
//! API is attempted. Anything else takes the bootstrap path: navigate the
//! store page, extract embedded state, cache it, then call the API with
//! the store page as referrer.

use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use super::extract;
use super::{FetchOutcome, FetchRoutine, ProgressSink, TabSession, codes, status_error};
use crate::cancel::CancelToken;
use crate::config::OriginConfig;
use crate::results::ResultStore;

pub struct ProductRoutine {
    results: Arc<ResultStore>,
    origin: OriginConfig,
}

impl ProductRoutine {
    #[must_use]
    pub fn new(results: Arc<ResultStore>, origin: OriginConfig) -> Self {
        Self { results, origin }
    }

    async fn run(
        &self,
        tab: &TabSession,
        url: &str,
        progress: &ProgressSink,
        cancel: &CancelToken,
    ) -> FetchOutcome {
        let Some((store_url, product_id)) = split_product_url(url) else {
            return FetchOutcome::Failure(format!("unrecognized product URL: {url}"));
        };

        let preload = self.results.preload_for(&store_url, &product_id);
        if let Some(partial) = &preload {
            debug!(product = %product_id, "serving preload partial");
            progress.emit(partial.clone());
        }

        // Direct API only when both cache halves are present; a cached
        // channel with no preload still needs the bootstrap navigation to
        // look organic to the origin.
        if let Some(channel) = self.results.channel_id(&store_url)
            && preload.is_some()
        {
            match self.direct_api(tab, &store_url, &channel, &product_id).await {
                DirectOutcome::Final(outcome) => return outcome,
                DirectOutcome::Bootstrap => {
                    debug!(product = %product_id, "direct API fell through to bootstrap");
                }
            }
        }

        if cancel.is_cancelled() {
            return FetchOutcome::Failure(codes::CANCELLED.to_string());
        }
        self.bootstrap(tab, &store_url, &product_id, progress, cancel)
            .await
    }

    async fn direct_api(
        &self,
        tab: &TabSession,
        store_url: &str,
        channel_id: &str,
        product_id: &str,
    ) -> DirectOutcome {
        let api_url = self.origin.product_api_url(channel_id, product_id);
        let (status, body) = match tab.api_get(&api_url, store_url).await {
            Ok(ok) => ok,
            Err(e) => return DirectOutcome::Final(FetchOutcome::Failure(e.to_string())),
        };

        match status {
            204 => DirectOutcome::Final(FetchOutcome::Failure(codes::NO_CONTENT.to_string())),
            404 => {
                // The cached channel id no longer resolves; rebuild it.
                warn!(channel = %channel_id, "cached channel id stale, bootstrapping");
                DirectOutcome::Bootstrap
            }
            500..=599 => DirectOutcome::Bootstrap,
            _ => match status_error(status) {
                None => DirectOutcome::Final(FetchOutcome::Success(body)),
                Some(err) => DirectOutcome::Final(FetchOutcome::Failure(err)),
            },
        }
    }

    async fn bootstrap(
        &self,
        tab: &TabSession,
        store_url: &str,
        product_id: &str,
        progress: &ProgressSink,
        cancel: &CancelToken,
    ) -> FetchOutcome {
        if let Err(e) = tab.navigate(store_url).await {
            return FetchOutcome::Failure(e.to_string());
        }
        if cancel.is_cancelled() {
            return FetchOutcome::Failure(codes::CANCELLED.to_string());
        }

        match probe_unsupported(tab).await {
            Ok(true) => return FetchOutcome::Failure(codes::UNSUPPORTED_BROWSER.to_string()),
            Ok(false) => {}
            Err(e) => return FetchOutcome::Failure(e.to_string()),
        }

        let state = match tab.eval_json(extract::EMBEDDED_STATE_SCRIPT).await {
            Ok(state) => state,
            Err(e) => return FetchOutcome::Failure(e.to_string()),
        };

        let Some(channel_id) = extract::channel_id(&state) else {
            return FetchOutcome::Failure(format!(
                "{}: store page carried no channel id",
                codes::CHANNEL_ID_NOT_FOUND
            ));
        };

        let preloads = extract::preload_map(&state);
        self.results.record_channel_id(store_url, &channel_id);
        self.results.record_preloads(store_url, &preloads);
        if let Some(partial) = preloads.get(product_id) {
            progress.emit(partial.clone());
        }

        if cancel.is_cancelled() {
            return FetchOutcome::Failure(codes::CANCELLED.to_string());
        }

        let api_url = self.origin.product_api_url(&channel_id, product_id);
        let (status, body) = match tab.api_get(&api_url, store_url).await {
            Ok(ok) => ok,
            Err(e) => return FetchOutcome::Failure(e.to_string()),
        };
        match status_error(status) {
            None => FetchOutcome::Success(body),
            Some(err) => FetchOutcome::Failure(err),
        }
    }
}

enum DirectOutcome {
    Final(FetchOutcome),
    Bootstrap,
}

impl FetchRoutine for ProductRoutine {
    fn fetch<'a>(
        &'a self,
        tab: &'a TabSession,
        url: &'a str,
        progress: &'a ProgressSink,
        cancel: &'a CancelToken,
    ) -> BoxFuture<'a, FetchOutcome> {
        Box::pin(self.run(tab, url, progress, cancel))
    }
}

async fn probe_unsupported(tab: &TabSession) -> anyhow::Result<bool> {
    let value = tab.eval_json(extract::UNSUPPORTED_MARKER_SCRIPT).await?;
    Ok(value.as_bool().unwrap_or(false))
}

/// Split a product URL into its store page and product id.
///
/// `https://host/gadget-world/products/42` →
/// (`https://host/gadget-world`, `42`).
#[must_use]
pub fn split_product_url(url: &str) -> Option<(String, String)> {
    let parsed = Url::parse(url).ok()?;
    let segments: Vec<&str> = parsed.path_segments()?.filter(|s| !s.is_empty()).collect();
    let marker = segments.iter().position(|s| *s == "products")?;
    let product_id = segments.get(marker + 1)?;
    if product_id.is_empty() {
        return None;
    }

    let origin = format!(
        "{}://{}",
        parsed.scheme(),
        parsed.host_str().map(|h| match parsed.port() {
            Some(port) => format!("{h}:{port}"),
            None => h.to_string(),
        })?
    );
    let store_path = segments[..marker].join("/");
    let store_url = if store_path.is_empty() {
        origin
    } else {
        format!("{origin}/{store_path}")
    };
    Some((store_url, (*product_id).to_string()))
}
