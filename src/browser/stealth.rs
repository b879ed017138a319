//! Per-tab stealth configuration.
//!
//! Each tab gets a pre-document script pinning the navigator surface to
//! its identity, a user-agent override with matching client hints, and a
//! request interceptor that aborts tracker hosts and non-essential
//! resource kinds. The interceptor doubles as the proxy-auth responder,
//! since Chromium accepts no credentials in `--proxy-server`.

use anyhow::{Context, Result};
use chromiumoxide::Page;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::fetch::{
    AuthChallengeResponse, AuthChallengeResponseResponse, ContinueRequestParams,
    ContinueWithAuthParams, EventAuthRequired, EventRequestPaused, FailRequestParams,
};
use chromiumoxide::cdp::browser_protocol::network::{ErrorReason, ResourceType};
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::identity::Identity;

/// Hosts whose requests are aborted outright. Analytics beacons both leak
/// the crawl and slow the page down.
const BLOCKED_HOST_FRAGMENTS: &[&str] = &[
    "google-analytics.com",
    "googletagmanager.com",
    "doubleclick.net",
    "facebook.net",
    "facebook.com/tr",
    "hotjar.com",
    "segment.io",
    "segment.com",
    "sentry.io",
    "criteo.com",
    "amplitude.com",
    "braze.com",
    "mixpanel.com",
    "newrelic.com",
    "nr-data.net",
    "clarity.ms",
];

/// Build the pre-document script pinning the navigator surface to one
/// identity.
#[must_use]
pub fn identity_script(identity: &Identity) -> String {
    let languages =
        serde_json::to_string(&identity.languages).unwrap_or_else(|_| "[\"en-US\"]".to_string());
    format!(
        r#"(() => {{
    const pin = (obj, prop, value) => {{
        try {{
            Object.defineProperty(obj, prop, {{ get: () => value, configurable: true }});
        }} catch (e) {{}}
    }};
    pin(navigator, 'webdriver', false);
    pin(navigator, 'platform', '{platform}');
    pin(navigator, 'vendor', '{vendor}');
    pin(navigator, 'languages', {languages});
    pin(navigator, 'language', '{language}');
    pin(navigator, 'hardwareConcurrency', {cores});
    pin(navigator, 'deviceMemory', {memory});
    if (window.chrome === undefined) {{
        window.chrome = {{ runtime: {{}} }};
    }}
    const mockPlugins = [
        {{ name: 'PDF Viewer', filename: 'internal-pdf-viewer', description: 'Portable Document Format' }},
        {{ name: 'Chrome PDF Viewer', filename: 'internal-pdf-viewer', description: 'Portable Document Format' }},
        {{ name: 'Chromium PDF Viewer', filename: 'internal-pdf-viewer', description: 'Portable Document Format' }}
    ];
    pin(navigator, 'plugins', Object.assign(mockPlugins, {{
        item: i => mockPlugins[i] ?? null,
        namedItem: n => mockPlugins.find(p => p.name === n) ?? null,
        refresh: () => {{}}
    }}));
}})();"#,
        platform = identity.platform,
        vendor = identity.vendor,
        languages = languages,
        language = identity.languages.first().map_or("en-US", String::as_str),
        cores = identity.hardware_concurrency,
        memory = identity.device_memory,
    )
}

/// Apply the identity to a tab: pre-document pinning script, UA override
/// with client-hint language/platform, and the identity's viewport.
pub async fn apply_identity(page: &Page, identity: &Identity) -> Result<()> {
    page.execute(AddScriptToEvaluateOnNewDocumentParams {
        source: identity_script(identity),
        include_command_line_api: None,
        world_name: None,
        run_immediately: None,
    })
    .await
    .context("injecting identity script")?;

    page.execute(SetUserAgentOverrideParams {
        user_agent: identity.user_agent.clone(),
        accept_language: Some(identity.accept_language.clone()),
        platform: Some(identity.platform.clone()),
        user_agent_metadata: None,
    })
    .await
    .context("overriding user agent")?;

    let (width, height) = identity.viewport;
    let metrics = SetDeviceMetricsOverrideParams::builder()
        .width(i64::from(width))
        .height(i64::from(height))
        .device_scale_factor(1.0)
        .mobile(false)
        .build()
        .map_err(|e| anyhow::anyhow!("building device metrics: {e}"))?;
    page.execute(metrics).await.context("overriding viewport")?;

    debug!(ua = %identity.user_agent, "identity applied to tab");
    Ok(())
}

/// Resource kinds aborted by the interceptor.
fn is_blocked_kind(kind: &ResourceType) -> bool {
    matches!(
        kind,
        ResourceType::Image
            | ResourceType::Media
            | ResourceType::Font
            | ResourceType::Ping
            | ResourceType::CspViolationReport
    )
}

fn is_blocked_url(url: &str) -> bool {
    BLOCKED_HOST_FRAGMENTS.iter().any(|frag| url.contains(frag))
}

/// Enable request interception on a tab and spawn the responder task.
///
/// The task continues essential requests, aborts trackers and heavy
/// resource kinds, and answers proxy auth challenges with the given
/// credentials. It ends when the tab's event streams close; callers
/// abort it on teardown as well.
pub async fn install_interceptor(
    page: &Page,
    proxy_credentials: Option<(String, String)>,
) -> Result<JoinHandle<()>> {
    page.execute(
        chromiumoxide::cdp::browser_protocol::fetch::EnableParams::builder()
            .handle_auth_requests(true)
            .build(),
    )
    .await
    .context("enabling request interception")?;

    let mut paused = page
        .event_listener::<EventRequestPaused>()
        .await
        .context("listening for paused requests")?;
    let mut auth = page
        .event_listener::<EventAuthRequired>()
        .await
        .context("listening for auth challenges")?;

    let page = page.clone();
    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                event = paused.next() => {
                    let Some(event) = event else { break };
                    let request_id = event.request_id.clone();
                    let url = event.request.url.clone();
                    let abort = is_blocked_url(&url) || is_blocked_kind(&event.resource_type);
                    let result = if abort {
                        trace!(%url, "aborting intercepted request");
                        page.execute(FailRequestParams::new(request_id, ErrorReason::Aborted))
                            .await
                            .map(|_| ())
                    } else {
                        page.execute(ContinueRequestParams::new(request_id))
                            .await
                            .map(|_| ())
                    };
                    if let Err(e) = result {
                        // The tab is likely mid-teardown; stop quietly.
                        trace!("interceptor response failed: {e}");
                        break;
                    }
                }
                challenge = auth.next() => {
                    let Some(challenge) = challenge else { break };
                    let response = match &proxy_credentials {
                        Some((username, password)) => AuthChallengeResponse {
                            response: AuthChallengeResponseResponse::ProvideCredentials,
                            username: Some(username.clone()),
                            password: Some(password.clone()),
                        },
                        None => AuthChallengeResponse {
                            response: AuthChallengeResponseResponse::Default,
                            username: None,
                            password: None,
                        },
                    };
                    let params =
                        ContinueWithAuthParams::new(challenge.request_id.clone(), response);
                    if let Err(e) = page.execute(params).await {
                        warn!("failed to answer auth challenge: {e}");
                        break;
                    }
                }
            }
        }
        debug!("request interceptor task finished");
    });

    Ok(handle)
}
