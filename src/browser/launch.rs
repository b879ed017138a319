//! Browser discovery, profile hygiene and launch.
//!
//! Every instance gets a UUID-named user-data directory under the system
//! temp dir so concurrent launches never fight over Chrome's
//! SingletonLock. Stale profiles from crashed runs are detected by
//! probing the PID encoded in the lock symlink and swept at startup.

use anyhow::{Context, Result};
use chromiumoxide::browser::{Browser, BrowserConfigBuilder, HeadlessMode};
use chromiumoxide::fetcher::{BrowserFetcher, BrowserFetcherOptions};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::identity::Identity;
use crate::proxy::ProxyRecord;

const PROFILE_PREFIX: &str = "storescrape_chrome_";

/// Find a Chrome/Chromium executable: `CHROMIUM_PATH` override first,
/// then platform install paths, then `which`.
pub async fn find_browser_executable() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("CHROMIUM_PATH") {
        let path = PathBuf::from(path);
        if path.exists() {
            info!("using browser from CHROMIUM_PATH: {}", path.display());
            return Ok(path);
        }
        warn!(
            "CHROMIUM_PATH points to a non-existent file: {}",
            path.display()
        );
    }

    let paths: &[&str] = if cfg!(target_os = "macos") {
        &[
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/opt/homebrew/bin/chromium",
        ]
    } else if cfg!(target_os = "windows") {
        &[
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files\Chromium\Application\chrome.exe",
        ]
    } else {
        &[
            "/usr/bin/google-chrome",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/snap/bin/chromium",
            "/opt/google/chrome/chrome",
        ]
    };

    for path_str in paths {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("found browser at {}", path.display());
            return Ok(path);
        }
    }

    if !cfg!(target_os = "windows") {
        for cmd in ["chromium", "chromium-browser", "google-chrome", "chrome"] {
            if let Ok(output) = Command::new("which").arg(cmd).output()
                && output.status.success()
            {
                let found = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !found.is_empty() {
                    info!("found browser via which: {found}");
                    return Ok(PathBuf::from(found));
                }
            }
        }
    }

    anyhow::bail!("no Chrome/Chromium executable found")
}

/// Download a managed Chromium into the cache directory when no system
/// browser exists.
pub async fn download_managed_browser() -> Result<PathBuf> {
    let cache_dir = dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("storescrape")
        .join("chromium");
    std::fs::create_dir_all(&cache_dir).context("creating browser cache directory")?;

    info!("downloading managed Chromium to {}", cache_dir.display());
    let fetcher = BrowserFetcher::new(
        BrowserFetcherOptions::builder()
            .with_path(&cache_dir)
            .build()
            .context("building fetcher options")?,
    );
    let revision = fetcher.fetch().await.context("fetching browser")?;
    Ok(revision.executable_path)
}

// =============================================================================
// Profile directories
// =============================================================================

/// Create a fresh UUID-named profile directory. `create_dir` (not
/// `create_dir_all`) so a UUID collision fails loudly instead of sharing
/// a profile.
pub fn create_profile_dir() -> Result<PathBuf> {
    let path = std::env::temp_dir().join(format!("{PROFILE_PREFIX}{}", Uuid::new_v4()));
    std::fs::create_dir(&path)
        .with_context(|| format!("creating profile directory {}", path.display()))?;
    debug!("created profile directory {}", path.display());
    Ok(path)
}

pub fn remove_profile_dir(path: &Path) {
    if path.exists()
        && let Err(e) = std::fs::remove_dir_all(path)
    {
        warn!("failed to remove profile directory {}: {e}", path.display());
    }
}

/// SingletonLock is a symlink targeting `{hostname}-{pid}`; the profile
/// is stale when that PID no longer exists.
#[cfg(unix)]
pub fn is_profile_stale(profile_dir: &Path) -> bool {
    let lock_path = profile_dir.join("SingletonLock");
    if !lock_path.exists() && !lock_path.is_symlink() {
        return true;
    }
    match std::fs::read_link(&lock_path) {
        Ok(target) => {
            let target = target.to_string_lossy();
            if let Some(pid_str) = target.rsplit('-').next()
                && let Ok(pid) = pid_str.parse::<i32>()
            {
                let alive = unsafe { libc::kill(pid, 0) == 0 };
                return !alive;
            }
            false
        }
        // Present but not a symlink: corrupted, treat as stale.
        Err(_) => lock_path.is_file(),
    }
}

#[cfg(not(unix))]
pub fn is_profile_stale(_profile_dir: &Path) -> bool {
    true
}

/// Sweep orphaned profile directories left by crashed runs.
pub fn sweep_stale_profiles() -> usize {
    let temp_dir = std::env::temp_dir();
    let Ok(entries) = std::fs::read_dir(&temp_dir) else {
        return 0;
    };
    let mut cleaned = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if let Some(name) = path.file_name().and_then(|n| n.to_str())
            && name.starts_with(PROFILE_PREFIX)
            && path.is_dir()
            && is_profile_stale(&path)
        {
            if let Err(e) = std::fs::remove_dir_all(&path) {
                warn!("failed to sweep stale profile {}: {e}", path.display());
            } else {
                cleaned += 1;
            }
        }
    }
    if cleaned > 0 {
        info!("swept {cleaned} stale browser profiles");
    }
    cleaned
}

// =============================================================================
// Launch
// =============================================================================

/// Launch one browser instance wearing the given identity, optionally
/// bound to a proxy at the process level. Returns the browser, the CDP
/// handler task, and the profile directory the caller must clean up.
pub async fn launch_browser(
    headless: bool,
    identity: &Identity,
    proxy: Option<&ProxyRecord>,
) -> Result<(Browser, JoinHandle<()>, PathBuf)> {
    let executable = match find_browser_executable().await {
        Ok(path) => path,
        Err(_) => download_managed_browser().await?,
    };

    let user_data_dir = create_profile_dir()?;
    let (width, height) = identity.viewport;

    let mut builder = BrowserConfigBuilder::default()
        .request_timeout(Duration::from_secs(30))
        .window_size(width, height)
        .user_data_dir(user_data_dir.clone())
        .chrome_executable(executable);

    if headless {
        builder = builder.headless_mode(HeadlessMode::default());
    } else {
        builder = builder.with_head();
    }

    builder = builder
        .arg(format!("--user-agent={}", identity.user_agent))
        .arg("--disable-blink-features=AutomationControlled")
        .arg("--disable-infobars")
        .arg("--disable-notifications")
        .arg("--disable-extensions")
        .arg("--disable-popup-blocking")
        .arg("--disable-background-networking")
        .arg("--disable-background-timer-throttling")
        .arg("--disable-backgrounding-occluded-windows")
        .arg("--disable-breakpad")
        .arg("--disable-hang-monitor")
        .arg("--disable-ipc-flooding-protection")
        .arg("--disable-prompt-on-repost")
        .arg("--metrics-recording-only")
        .arg("--password-store=basic")
        .arg("--use-mock-keychain")
        .arg("--hide-scrollbars")
        .arg("--mute-audio")
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--no-sandbox")
        .arg("--disable-setuid-sandbox")
        // The proxy may terminate TLS with its own certificate.
        .arg("--ignore-certificate-errors");

    if let Some(proxy) = proxy {
        // Chromium takes no credentials here; auth challenges are
        // answered over CDP by the interception task.
        builder = builder.arg(format!("--proxy-server={}", proxy.url_bare()));
    }

    let config = builder
        .build()
        .map_err(|e| anyhow::anyhow!("building browser config: {e}"))?;

    debug!(proxied = proxy.is_some(), "launching browser");
    let (browser, mut handler) = Browser::launch(config)
        .await
        .context("launching browser")?;

    let handler_task = task::spawn(async move {
        while let Some(event) = handler.next().await {
            if let Err(e) = event {
                let message = e.to_string();
                // Chrome emits CDP events chromiumoxide cannot decode;
                // those are noise, not faults.
                let benign = message
                    .contains("data did not match any variant of untagged enum Message")
                    || message.contains("Failed to deserialize WS response");
                if benign {
                    trace!("suppressed benign CDP error: {message}");
                } else {
                    error!("browser handler error: {message}");
                }
            }
        }
        debug!("browser handler task finished");
    });

    Ok((browser, handler_task, user_data_dir))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_dirs_are_unique() {
        let a = create_profile_dir().unwrap();
        let b = create_profile_dir().unwrap();
        assert_ne!(a, b);
        assert!(a.exists() && b.exists());
        remove_profile_dir(&a);
        remove_profile_dir(&b);
        assert!(!a.exists());
    }

    #[test]
    fn missing_lock_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        assert!(is_profile_stale(dir.path()));
    }

    #[cfg(unix)]
    #[test]
    fn dead_pid_lock_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("SingletonLock");
        // PID 1 is always alive; an absurd PID is not.
        std::os::unix::fs::symlink("host-999999999", &lock).unwrap();
        assert!(is_profile_stale(dir.path()));
    }
}
