//! URL canonicalization for deduplication and cache lookups.
//!
//! Every queue and cache access goes through [`normalize`] so that
//! `https://Shop.example.com/gadgets/products/42/?utm_source=x` and
//! `https://shop.example.com/gadgets/products/42` land on the same key.

use anyhow::{Context, Result};
use url::Url;

/// Query parameters that survive normalization. Everything else is
/// tracking noise as far as the origin's payloads are concerned.
pub const ALLOWED_QUERY_KEYS: &[&str] = &["page", "sort", "size"];

/// Canonicalize a URL: lowercase host, strip the trailing slash, keep only
/// allow-listed query parameters, drop the fragment.
///
/// Idempotent: `normalize(normalize(u)) == normalize(u)`.
pub fn normalize(raw: &str) -> Result<String> {
    let mut url = Url::parse(raw.trim()).with_context(|| format!("invalid URL: {raw}"))?;

    if !matches!(url.scheme(), "http" | "https") {
        anyhow::bail!("unsupported URL scheme: {}", url.scheme());
    }
    if url.host_str().is_none() {
        anyhow::bail!("URL has no host: {raw}");
    }

    url.set_fragment(None);

    // Url::parse already lowercases the host; the path is case-sensitive
    // on the origin and is left alone apart from the trailing slash.
    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| ALLOWED_QUERY_KEYS.contains(&k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if kept.is_empty() {
        url.set_query(None);
    } else {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in &kept {
            serializer.append_pair(k, v);
        }
        url.set_query(Some(&serializer.finish()));
    }

    let mut out = url.to_string();
    // A bare origin serializes as `https://host/`; trim that too so the
    // root page has a single canonical key.
    if url.query().is_none() && out.ends_with('/') {
        out.pop();
    }

    Ok(out)
}

/// Best-effort host extraction, used for logging and per-host bookkeeping.
#[must_use]
pub fn host_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
}
