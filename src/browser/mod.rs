//! Browser pool, launch plumbing and per-tab stealth configuration.

pub mod launch;
pub mod pool;
pub mod stealth;

pub use launch::{find_browser_executable, is_profile_stale, launch_browser, sweep_stale_profiles};
pub use pool::{BrowserPool, PoolStats};
pub use stealth::{apply_identity, identity_script, install_interceptor};
