//! Browser identity profiles.
//!
//! An [`Identity`] is the bundle of headers and scripted overrides that
//! makes a tab look like one specific desktop browser: user agent,
//! client-hint strings, viewport, platform constants. The pool mixes a
//! small static catalogue, a dynamic generator, and a persisted working
//! set of identities previously observed to get past the origin.

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Share of draws served from the persisted working set when it is
/// non-empty.
const WORKING_SET_BIAS: f64 = 0.8;

/// Chrome major versions the generator draws from.
const GENERATED_MAJOR_RANGE: std::ops::RangeInclusive<u32> = 124..=131;

// =============================================================================
// Identity record
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub user_agent: String,
    pub viewport: (u32, u32),
    pub platform: String,
    pub vendor: String,
    pub languages: Vec<String>,
    pub hardware_concurrency: u32,
    pub device_memory: u32,
    /// `sec-ch-ua` header value matching the user agent.
    pub sec_ch_ua: String,
    /// `sec-ch-ua-platform` header value.
    pub sec_ch_ua_platform: String,
    pub accept_language: String,
}

impl Identity {
    /// Client-hint header pairs for request configuration.
    #[must_use]
    pub fn client_hint_headers(&self) -> Vec<(String, String)> {
        vec![
            ("sec-ch-ua".to_string(), self.sec_ch_ua.clone()),
            ("sec-ch-ua-mobile".to_string(), "?0".to_string()),
            (
                "sec-ch-ua-platform".to_string(),
                self.sec_ch_ua_platform.clone(),
            ),
            ("accept-language".to_string(), self.accept_language.clone()),
        ]
    }
}

struct CatalogueEntry {
    name: &'static str,
    platform: &'static str,
    vendor: &'static str,
    sec_ch_platform: &'static str,
    ua_template: &'static str,
    viewport: (u32, u32),
    hardware_concurrency: u32,
    device_memory: u32,
}

/// Static catalogue of plausible desktop shapes. The generator fills in
/// the version triplet; `{major}` and `{build}` are substituted.
const CATALOGUE: &[CatalogueEntry] = &[
    CatalogueEntry {
        name: "chrome-win",
        platform: "Win32",
        vendor: "Google Inc.",
        sec_ch_platform: "\"Windows\"",
        ua_template: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{major}.0.{build} Safari/537.36",
        viewport: (1920, 1080),
        hardware_concurrency: 8,
        device_memory: 8,
    },
    CatalogueEntry {
        name: "chrome-mac",
        platform: "MacIntel",
        vendor: "Google Inc.",
        sec_ch_platform: "\"macOS\"",
        ua_template: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{major}.0.{build} Safari/537.36",
        viewport: (1728, 1117),
        hardware_concurrency: 10,
        device_memory: 8,
    },
    CatalogueEntry {
        name: "edge-win",
        platform: "Win32",
        vendor: "Google Inc.",
        sec_ch_platform: "\"Windows\"",
        ua_template: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{major}.0.{build} Safari/537.36 Edg/{major}.0.{build}",
        viewport: (1920, 1080),
        hardware_concurrency: 12,
        device_memory: 16,
    },
    CatalogueEntry {
        name: "chrome-linux",
        platform: "Linux x86_64",
        vendor: "Google Inc.",
        sec_ch_platform: "\"Linux\"",
        ua_template: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{major}.0.{build} Safari/537.36",
        viewport: (1920, 1080),
        hardware_concurrency: 16,
        device_memory: 8,
    },
];

fn materialize(entry: &CatalogueEntry, major: u32, build: u32) -> Identity {
    let build_str = format!("{}.{}", build, build % 100);
    let ua = entry
        .ua_template
        .replace("{major}", &major.to_string())
        .replace("{build}", &build_str);
    let brand = if entry.name.starts_with("edge") {
        "Microsoft Edge"
    } else {
        "Google Chrome"
    };
    Identity {
        name: format!("{}-{}", entry.name, major),
        user_agent: ua,
        viewport: entry.viewport,
        platform: entry.platform.to_string(),
        vendor: entry.vendor.to_string(),
        languages: vec!["en-US".to_string(), "en".to_string()],
        hardware_concurrency: entry.hardware_concurrency,
        device_memory: entry.device_memory,
        sec_ch_ua: format!(
            "\"Chromium\";v=\"{major}\", \"{brand}\";v=\"{major}\", \"Not-A.Brand\";v=\"99\""
        ),
        sec_ch_ua_platform: entry.sec_ch_platform.to_string(),
        accept_language: "en-US,en;q=0.9".to_string(),
    }
}

/// Reconstruct an identity from a bare user-agent string, used when the
/// persisted working set only carries UA strings.
#[must_use]
pub fn identity_from_user_agent(ua: &str) -> Identity {
    let entry = CATALOGUE
        .iter()
        .find(|e| {
            let probe = e.ua_template.split('{').next().unwrap_or("");
            !probe.is_empty() && ua.starts_with(probe) && ua.contains("Edg/") == e.name.starts_with("edge")
        })
        .unwrap_or(&CATALOGUE[0]);

    let major = ua
        .split("Chrome/")
        .nth(1)
        .and_then(|rest| rest.split('.').next())
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(*GENERATED_MAJOR_RANGE.start());

    let mut identity = materialize(entry, major, 6422);
    identity.user_agent = ua.to_string();
    identity
}

// =============================================================================
// Profile pool
// =============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct WorkingSetFile {
    working_user_agents: Vec<String>,
    last_updated: Option<DateTime<Utc>>,
}

struct ProfilesState {
    /// User agents observed to succeed against the origin.
    working: Vec<String>,
    /// User agents handed out since the last reset; avoids immediate reuse.
    used: HashSet<String>,
    /// User agents the origin rejected as unsupported.
    blocked: HashSet<String>,
}

/// Process-wide identity service.
pub struct IdentityProfiles {
    state: Mutex<ProfilesState>,
    store_path: Option<PathBuf>,
    /// Custom catalogue used by tests; disables the dynamic generator.
    custom: Option<Vec<Identity>>,
}

impl IdentityProfiles {
    /// Load the working set from `dir/identities.json` (missing file is an
    /// empty set).
    pub async fn load(dir: &std::path::Path) -> Result<Self> {
        let store_path = dir.join("identities.json");
        let working = match tokio::fs::read_to_string(&store_path).await {
            Ok(raw) => match serde_json::from_str::<WorkingSetFile>(&raw) {
                Ok(file) => {
                    info!(
                        count = file.working_user_agents.len(),
                        "loaded identity working set"
                    );
                    file.working_user_agents
                }
                Err(e) => {
                    warn!("malformed identity working set, starting empty: {e}");
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };

        Ok(Self {
            state: Mutex::new(ProfilesState {
                working,
                used: HashSet::new(),
                blocked: HashSet::new(),
            }),
            store_path: Some(store_path),
            custom: None,
        })
    }

    /// Pool over a fixed catalogue with the generator disabled. Test
    /// constructor; also useful for pinned-identity deployments.
    #[must_use]
    pub fn with_catalogue(identities: Vec<Identity>) -> Self {
        Self {
            state: Mutex::new(ProfilesState {
                working: Vec::new(),
                used: HashSet::new(),
                blocked: HashSet::new(),
            }),
            store_path: None,
            custom: Some(identities),
        }
    }

    /// Draw an identity; never fails. Working set is preferred ~80% of the
    /// time; the `used` set prevents immediate reuse until every candidate
    /// has been handed out, at which point it resets.
    #[must_use]
    pub fn random(&self) -> Identity {
        self.try_draw()
            .unwrap_or_else(|| self.generate_fresh())
    }

    /// Draw an identity, or `None` when every candidate is blocked.
    /// Callers treating `None` as "fall back to restart" rely on this
    /// being exhaustive rather than probabilistic.
    #[must_use]
    pub fn try_draw(&self) -> Option<Identity> {
        let mut state = self.state.lock();
        let mut rng = rand::rng();

        // Working-set draw first, with the configured bias.
        if !state.working.is_empty() && rng.random_bool(WORKING_SET_BIAS) {
            let candidates: Vec<String> = state
                .working
                .iter()
                .filter(|ua| !state.blocked.contains(*ua) && !state.used.contains(*ua))
                .cloned()
                .collect();
            if let Some(ua) = pick(&mut rng, &candidates) {
                state.used.insert(ua.clone());
                return Some(identity_from_user_agent(&ua));
            }
        }

        let pool = self.candidate_pool();
        let unused: Vec<Identity> = pool
            .iter()
            .filter(|i| !state.blocked.contains(&i.user_agent) && !state.used.contains(&i.user_agent))
            .cloned()
            .collect();

        if let Some(identity) = pick(&mut rng, &unused) {
            state.used.insert(identity.user_agent.clone());
            return Some(identity);
        }

        // Everything unblocked has been used once; reset the reuse guard.
        let usable: Vec<Identity> = pool
            .iter()
            .filter(|i| !state.blocked.contains(&i.user_agent))
            .cloned()
            .collect();
        if usable.is_empty() {
            debug!("identity pool exhausted: every candidate is blocked");
            return None;
        }
        state.used.clear();
        let identity = pick(&mut rng, &usable)?;
        state.used.insert(identity.user_agent.clone());
        Some(identity)
    }

    /// Return an identity to the pool, making it eligible for reuse.
    pub fn release(&self, identity: &Identity) {
        self.state.lock().used.remove(&identity.user_agent);
    }

    /// Record that the origin accepted this identity.
    pub fn mark_working(&self, user_agent: &str) {
        {
            let mut state = self.state.lock();
            if !state.working.iter().any(|ua| ua == user_agent) {
                state.working.push(user_agent.to_string());
                info!(ua = %user_agent, "identity added to working set");
            }
            state.blocked.remove(user_agent);
        }
        self.persist();
    }

    #[must_use]
    pub fn is_working(&self, user_agent: &str) -> bool {
        self.state.lock().working.iter().any(|ua| ua == user_agent)
    }

    /// Record that the origin rejected this identity as unsupported.
    pub fn mark_blocked(&self, user_agent: &str) {
        let mut state = self.state.lock();
        state.blocked.insert(user_agent.to_string());
        state.working.retain(|ua| ua != user_agent);
    }

    fn candidate_pool(&self) -> Vec<Identity> {
        if let Some(custom) = &self.custom {
            return custom.clone();
        }
        let mut rng = rand::rng();
        let mut pool: Vec<Identity> = CATALOGUE
            .iter()
            .map(|e| {
                materialize(
                    e,
                    rng.random_range(GENERATED_MAJOR_RANGE),
                    rng.random_range(6000..7000),
                )
            })
            .collect();
        pool.push(self.generate_fresh());
        pool
    }

    fn generate_fresh(&self) -> Identity {
        let mut rng = rand::rng();
        if let Some(custom) = &self.custom
            && let Some(identity) = pick(&mut rng, custom)
        {
            return identity;
        }
        let entry = &CATALOGUE[rng.random_range(0..CATALOGUE.len())];
        materialize(
            entry,
            rng.random_range(GENERATED_MAJOR_RANGE),
            rng.random_range(6000..7000),
        )
    }

    /// Write the working set to disk. Best-effort; a failed write is a
    /// warning, not an error.
    pub fn persist(&self) {
        let Some(path) = &self.store_path else {
            return;
        };
        let file = {
            let state = self.state.lock();
            WorkingSetFile {
                working_user_agents: state.working.clone(),
                last_updated: Some(Utc::now()),
            }
        };
        match serde_json::to_vec_pretty(&file) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(path, bytes) {
                    warn!("failed to persist identity working set: {e}");
                }
            }
            Err(e) => warn!("failed to serialize identity working set: {e}"),
        }
    }

    /// Snapshot for stats and tests: (working, used, blocked) sizes.
    #[must_use]
    pub fn counts(&self) -> (usize, usize, usize) {
        let state = self.state.lock();
        (state.working.len(), state.used.len(), state.blocked.len())
    }
}

fn pick<T: Clone, R: Rng>(rng: &mut R, items: &[T]) -> Option<T> {
    if items.is_empty() {
        return None;
    }
    Some(items[rng.random_range(0..items.len())].clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_identity(name: &str) -> Identity {
        let mut id = materialize(&CATALOGUE[0], 126, 6478);
        id.name = name.to_string();
        id.user_agent = format!("{} {}", id.user_agent, name);
        id
    }

    #[test]
    fn random_always_yields_for_builtin_pool() {
        let profiles = IdentityProfiles::with_catalogue(vec![test_identity("a")]);
        let identity = profiles.random();
        assert!(!identity.user_agent.is_empty());
    }

    #[test]
    fn no_immediate_reuse_until_exhausted() {
        let a = test_identity("a");
        let b = test_identity("b");
        let profiles = IdentityProfiles::with_catalogue(vec![a.clone(), b.clone()]);

        let first = profiles.try_draw().unwrap();
        let second = profiles.try_draw().unwrap();
        assert_ne!(first.user_agent, second.user_agent);

        // Pool exhausted; the guard resets and draws succeed again.
        let third = profiles.try_draw().unwrap();
        assert!(third.user_agent == a.user_agent || third.user_agent == b.user_agent);
    }

    #[test]
    fn try_draw_returns_none_when_all_blocked() {
        let a = test_identity("a");
        let b = test_identity("b");
        let profiles = IdentityProfiles::with_catalogue(vec![a.clone(), b.clone()]);
        profiles.mark_blocked(&a.user_agent);
        profiles.mark_blocked(&b.user_agent);
        assert!(profiles.try_draw().is_none());
    }

    #[test]
    fn mark_working_round_trips() {
        let profiles = IdentityProfiles::with_catalogue(vec![test_identity("a")]);
        assert!(!profiles.is_working("ua-x"));
        profiles.mark_working("ua-x");
        assert!(profiles.is_working("ua-x"));
    }

    #[test]
    fn blocking_removes_from_working_set() {
        let profiles = IdentityProfiles::with_catalogue(vec![test_identity("a")]);
        profiles.mark_working("ua-x");
        profiles.mark_blocked("ua-x");
        assert!(!profiles.is_working("ua-x"));
    }

    #[test]
    fn identity_from_user_agent_recovers_shape() {
        let ua = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/127.0.6533.88 Safari/537.36";
        let identity = identity_from_user_agent(ua);
        assert_eq!(identity.user_agent, ua);
        assert_eq!(identity.platform, "MacIntel");
        assert!(identity.sec_ch_ua.contains("v=\"127\""));
    }

    #[tokio::test]
    async fn working_set_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let profiles = IdentityProfiles::load(dir.path()).await.unwrap();
            profiles.mark_working("ua-persisted");
        }
        let reloaded = IdentityProfiles::load(dir.path()).await.unwrap();
        assert!(reloaded.is_working("ua-persisted"));
    }
}
