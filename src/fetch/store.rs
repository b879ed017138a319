//! Store (and category) fetch routine.
//!
//! Navigates the page, extracts the embedded state, caches the channel id
//! and preload map, and returns the store summary the orchestrator fans
//! out from: `{channelId, allProductIds, productsMap}`.

use futures::future::BoxFuture;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::debug;

use super::extract;
use super::{FetchOutcome, FetchRoutine, ProgressSink, TabSession, codes};
use crate::cancel::CancelToken;
use crate::results::ResultStore;

pub struct StoreRoutine {
    results: Arc<ResultStore>,
}

impl StoreRoutine {
    #[must_use]
    pub fn new(results: Arc<ResultStore>) -> Self {
        Self { results }
    }

    async fn run(
        &self,
        tab: &TabSession,
        url: &str,
        progress: &ProgressSink,
        cancel: &CancelToken,
    ) -> FetchOutcome {
        if let Err(e) = tab.navigate(url).await {
            return FetchOutcome::Failure(e.to_string());
        }
        if cancel.is_cancelled() {
            return FetchOutcome::Failure(codes::CANCELLED.to_string());
        }

        match tab.eval_json(extract::UNSUPPORTED_MARKER_SCRIPT).await {
            Ok(Value::Bool(true)) => {
                return FetchOutcome::Failure(codes::UNSUPPORTED_BROWSER.to_string());
            }
            Ok(_) => {}
            Err(e) => return FetchOutcome::Failure(e.to_string()),
        }

        let state = match tab.eval_json(extract::EMBEDDED_STATE_SCRIPT).await {
            Ok(state) => state,
            Err(e) => return FetchOutcome::Failure(e.to_string()),
        };

        let Some(channel_id) = extract::channel_id(&state) else {
            return FetchOutcome::Failure(format!(
                "{}: page carried no channel id",
                codes::CHANNEL_ID_NOT_FOUND
            ));
        };

        let products = extract::preload_map(&state);
        let ids: Vec<String> = products.keys().cloned().collect();
        debug!(channel = %channel_id, products = ids.len(), "extracted store state");

        self.results.record_channel_id(url, &channel_id);
        self.results.record_preloads(url, &products);

        // The summary doubles as a partial: callers polling the job see
        // the id list before follow-up product fetches land.
        let payload = json!({
            "channelId": channel_id,
            "allProductIds": ids,
            "productsMap": Value::Object(products),
        });
        progress.emit(payload.clone());

        FetchOutcome::Success(payload)
    }
}

impl FetchRoutine for StoreRoutine {
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
