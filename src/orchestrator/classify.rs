//! Error classification.
//!
//! The queue applies this to whatever error string a fetch routine (or the
//! browser layer underneath it) reports, and picks the remediation:
//! restart the slot, rotate the identity, penalize the proxy, or burn a
//! retry.

/// Remediation classes, ordered by how aggressively they intervene.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The browser or tab is gone; restart the slot and requeue at head.
    CriticalBrowser,
    /// The network path (usually the bound proxy) is the problem:
    /// penalize the proxy, restart the slot, requeue at head.
    ProxyOrNetwork,
    /// Origin answered 204: the target does not exist. Terminal.
    NoContent,
    /// Origin rejected the identity; rotate it in place, no retry burned.
    UnsupportedBrowser,
    /// Anything else: clear the tab, back off, burn a retry.
    Other,
}

const CRITICAL_MARKERS: &[&str] = &[
    "target closed",
    "session closed",
    "session with given id not found",
    "detached frame",
    "frame was detached",
    "execution context was destroyed",
    "execution_context_destroyed",
    "browser has disconnected",
    "websocket connection closed",
];

const PROXY_MARKERS: &[&str] = &[
    "http_429",
    "http_403",
    "status 429",
    "status 403",
    "network",
    "timeout",
    "timed out",
    "channel_id_not_found",
    "proxy_issue",
    "err_proxy",
    "err_tunnel",
    "err_connection",
    "err_timed_out",
    "err_name_not_resolved",
    "err_empty_response",
    "econnreset",
    "econnrefused",
    "connection refused",
    "connection reset",
];

/// Classify a routine-reported error string. Matching is substring-based
/// and case-insensitive; routines embed the canonical codes, browser
/// errors arrive as free text.
#[must_use]
pub fn classify(error: &str) -> ErrorClass {
    let lower = error.to_ascii_lowercase();

    if CRITICAL_MARKERS.iter().any(|m| lower.contains(m)) {
        return ErrorClass::CriticalBrowser;
    }
    if lower.contains("unsupported_browser") {
        return ErrorClass::UnsupportedBrowser;
    }
    if lower.contains("204_no_content") || lower.contains("204 no content") {
        return ErrorClass::NoContent;
    }
    if PROXY_MARKERS.iter().any(|m| lower.contains(m)) {
        return ErrorClass::ProxyOrNetwork;
    }
    ErrorClass::Other
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_browser_errors() {
        for msg in [
            "Target closed before response",
            "Session closed, cannot run command",
            "navigating frame was detached",
            "Execution context was destroyed, most likely because of a navigation",
        ] {
            assert_eq!(classify(msg), ErrorClass::CriticalBrowser, "{msg}");
        }
    }

    #[test]
    fn proxy_or_network_errors() {
        for msg in [
            "HTTP_429: origin rate limited",
            "HTTP_403: origin denied",
            "NETWORK: fetch failed",
            "TIMEOUT: navigation to https://x exceeded 25s",
            "CHANNEL_ID_NOT_FOUND: store page carried no channel id",
            "upstream marked PROXY_ISSUE",
            "net::ERR_TUNNEL_CONNECTION_FAILED",
            "net::ERR_CONNECTION_RESET",
        ] {
            assert_eq!(classify(msg), ErrorClass::ProxyOrNetwork, "{msg}");
        }
    }

    #[test]
    fn no_content_is_terminal_class() {
        assert_eq!(classify("204_NO_CONTENT"), ErrorClass::NoContent);
    }

    #[test]
    fn unsupported_browser_wins_over_other() {
        assert_eq!(
            classify("UNSUPPORTED_BROWSER"),
            ErrorClass::UnsupportedBrowser
        );
    }

    #[test]
    fn unknown_errors_are_other() {
        assert_eq!(classify("something odd happened"), ErrorClass::Other);
        assert_eq!(classify(""), ErrorClass::Other);
    }

    #[test]
    fn critical_takes_precedence_over_proxy_markers() {
        // A closed target often drags a timeout message along; the slot
        // restart is the right remediation, not a proxy penalty.
        assert_eq!(
            classify("Target closed while waiting: TIMEOUT"),
            ErrorClass::CriticalBrowser
        );
    }
}
