//! Deterministic request fingerprints for cache keys.
//!
//! The fingerprint covers the request-shaping inputs: method, path,
//! normalized query pairs, and the endpoint's declared body fields. JSON
//! bodies are canonicalized by recursively sorting object keys, so clients
//! sending the same fields in different order land on the same cache entry.

use serde_json::Value;
use std::collections::BTreeMap;

/// Cache key for a request: `{service}:{endpoint}:{hash}`. Mutating
/// endpoints invalidate by the `{service}:{endpoint}:` prefix.
pub fn cache_key(
    service: &str,
    endpoint: &str,
    method: &str,
    path: &str,
    query: &BTreeMap<String, String>,
    body_fields: &[(&str, &Value)],
) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(method.as_bytes());
    hasher.update(b"\n");
    hasher.update(path.as_bytes());
    hasher.update(b"\n");
    for (key, value) in query {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"&");
    }
    hasher.update(b"\n");
    for (field, value) in body_fields {
        hasher.update(field.as_bytes());
        hasher.update(b":");
        hasher.update(canonical_json(value).as_bytes());
        hasher.update(b";");
    }
    format!("{service}:{endpoint}:{}", hasher.finalize().to_hex())
}

/// Prefix covering every entry an endpoint produces.
pub fn endpoint_prefix(service: &str, endpoint: &str) -> String {
    format!("{service}:{endpoint}:")
}

/// Render a JSON value with object keys sorted recursively. Arrays keep
/// their order; order is significant there.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            let parts: Vec<String> = sorted
                .into_iter()
                .map(|(k, v)| format!("{}:{}", serde_json::to_string(k).unwrap_or_default(), canonical_json(v)))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", parts.join(","))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn query(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn same_inputs_same_key() {
        let q = query(&[("x", "7")]);
        let a = cache_key("echo", "echo.get", "GET", "/echo", &q, &[]);
        let b = cache_key("echo", "echo.get", "GET", "/echo", &q, &[]);
        assert_eq!(a, b);
    }

    #[test]
    fn different_query_different_key() {
        let a = cache_key("echo", "echo.get", "GET", "/echo", &query(&[("x", "7")]), &[]);
        let b = cache_key("echo", "echo.get", "GET", "/echo", &query(&[("x", "8")]), &[]);
        assert_ne!(a, b);
    }

    #[test]
    fn body_key_order_does_not_matter() {
        let body_a = json!({"b": 2, "a": {"y": 1, "x": 0}});
        let body_b = json!({"a": {"x": 0, "y": 1}, "b": 2});
        let q = BTreeMap::new();
        let a = cache_key("m", "m.put", "POST", "/m", &q, &[("doc", &body_a)]);
        let b = cache_key("m", "m.put", "POST", "/m", &q, &[("doc", &body_b)]);
        assert_eq!(a, b);
    }

    #[test]
    fn array_order_does_matter() {
        let body_a = json!([1, 2]);
        let body_b = json!([2, 1]);
        let q = BTreeMap::new();
        let a = cache_key("m", "m.put", "POST", "/m", &q, &[("items", &body_a)]);
        let b = cache_key("m", "m.put", "POST", "/m", &q, &[("items", &body_b)]);
        assert_ne!(a, b);
    }

    #[test]
    fn key_carries_invalidation_prefix() {
        let q = BTreeMap::new();
        let key = cache_key("metadata", "video.get", "GET", "/v", &q, &[]);
        assert!(key.starts_with(&endpoint_prefix("metadata", "video.get")));
    }
}
