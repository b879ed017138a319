//! Embedded-state extraction.
//!
//! Store and category pages ship their data as a JSON blob on
//! `window.__PRELOADED_STATE__`. The payload shape shifts between origin
//! deployments, so extraction is tolerant: identifiers are located by key
//! wherever they sit in the tree.

use serde_json::{Map, Value};

/// Script returning the embedded state as a JSON string (`"null"` when
/// the page carries none).
pub const EMBEDDED_STATE_SCRIPT: &str =
    "(() => JSON.stringify(window.__PRELOADED_STATE__ ?? null))()";

/// Script probing for the origin's unsupported-browser interstitial.
pub const UNSUPPORTED_MARKER_SCRIPT: &str = r#"(() => {
    const text = (document.title + ' ' + (document.body ? document.body.innerText.slice(0, 500) : '')).toLowerCase();
    const hit = text.includes('unsupported browser') || text.includes('browser is not supported') || text.includes('please update your browser');
    return JSON.stringify(hit);
})()"#;

/// Locate the channel id. Checked in order: the documented paths, then a
/// bounded depth-first search for any `channelId` key.
#[must_use]
pub fn channel_id(state: &Value) -> Option<String> {
    for path in [
        &["channel", "channelId"][..],
        &["store", "channel", "channelId"][..],
        &["smartStoreV2", "channel", "channelId"][..],
    ] {
        if let Some(found) = at_path(state, path) {
            if let Some(id) = as_id(found) {
                return Some(id);
            }
        }
    }
    find_key(state, "channelId", 0).and_then(|v| as_id(&v))
}

/// Extract the product-id → partial-payload map embedded in a store page.
/// Every object carrying a product identifier becomes a preload entry.
#[must_use]
pub fn preload_map(state: &Value) -> Map<String, Value> {
    let mut out = Map::new();
    collect_products(state, &mut out, 0);
    out
}

fn at_path<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = value;
    for key in path {
        current = current.get(key)?;
    }
    Some(current)
}

fn as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

const MAX_DEPTH: usize = 12;

fn find_key(value: &Value, key: &str, depth: usize) -> Option<Value> {
    if depth > MAX_DEPTH {
        return None;
    }
    match value {
        Value::Object(map) => {
            if let Some(found) = map.get(key) {
                return Some(found.clone());
            }
            map.values().find_map(|v| find_key(v, key, depth + 1))
        }
        Value::Array(items) => items.iter().find_map(|v| find_key(v, key, depth + 1)),
        _ => None,
    }
}

fn collect_products(value: &Value, out: &mut Map<String, Value>, depth: usize) {
    if depth > MAX_DEPTH {
        return;
    }
    match value {
        Value::Object(map) => {
            let id = map
                .get("productNo")
                .or_else(|| map.get("productId"))
                .and_then(as_id);
            // An id plus at least one descriptive field makes this object
            // a usable partial; a bare reference does not.
            if let Some(id) = id
                && (map.contains_key("name") || map.contains_key("salePrice")
                    || map.contains_key("price"))
                && !out.contains_key(&id)
            {
                out.insert(id, value.clone());
            }
            for v in map.values() {
                collect_products(v, out, depth + 1);
            }
        }
        Value::Array(items) => {
            for v in items {
                collect_products(v, out, depth + 1);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_state() -> Value {
        json!({
            "smartStoreV2": {
                "channel": { "channelId": "ch-2049", "name": "Gadget World" }
            },
            "widgetContents": {
                "bestProducts": {
                    "A": [
                        { "productNo": 42, "name": "Widget", "salePrice": 1200 },
                        { "productNo": "43", "name": "Gizmo", "salePrice": 900 }
                    ]
                }
            },
            "unrelated": { "productNo": 99 }
        })
    }

    #[test]
    fn finds_channel_id_at_known_path() {
        assert_eq!(channel_id(&sample_state()).as_deref(), Some("ch-2049"));
    }

    #[test]
    fn finds_channel_id_anywhere() {
        let state = json!({ "deeply": { "nested": { "channelId": 777 } } });
        assert_eq!(channel_id(&state).as_deref(), Some("777"));
    }

    #[test]
    fn missing_channel_id_is_none() {
        assert!(channel_id(&json!({"a": 1})).is_none());
        assert!(channel_id(&Value::Null).is_none());
    }

    #[test]
    fn preload_map_collects_described_products() {
        let map = preload_map(&sample_state());
        assert_eq!(map.len(), 2, "bare references must not become preloads");
        assert_eq!(map["42"]["name"], json!("Widget"));
        assert_eq!(map["43"]["salePrice"], json!(900));
    }

    #[test]
    fn preload_map_deduplicates_repeated_ids() {
        let state = json!([
            { "productNo": 1, "name": "a" },
            { "productNo": 1, "name": "a-again" },
            { "productNo": 2, "price": 5 }
        ]);
        let map = preload_map(&state);
        assert_eq!(map.len(), 2);
        // First sighting wins; a later duplicate never overwrites it.
        assert_eq!(map["1"]["name"], json!("a"));
    }

    #[test]
    fn depth_bound_holds() {
        // Build a chain deeper than the search bound; must not recurse
        // forever nor find the buried id.
        let mut v = json!({ "channelId": "deep" });
        for _ in 0..20 {
            v = json!({ "wrap": v });
        }
        assert!(channel_id(&v).is_none());
    }
}
