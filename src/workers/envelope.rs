//! Queue envelope parsing.
//!
//! Producers wrap tender data three ways: `{"tender": {...}}`,
//! `{"payload": {...}}`, or flat. One parser extracts the identifiers and
//! attributes from any accepted shape; `force_fetch` is authoritative if
//! truthy at any level.

use serde_json::{Map, Value};

#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub tender_id: Option<i64>,
    pub id_pncp: Option<String>,
    pub source: Option<String>,
    pub source_id: Option<String>,
    pub force_fetch: bool,
    /// Inner attribute map (the tender itself in whichever wrapping).
    pub tender: Map<String, Value>,
}

fn as_id(v: Option<&Value>) -> Option<i64> {
    match v? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_str(v: Option<&Value>) -> Option<String> {
    v.and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn truthy(v: Option<&Value>) -> bool {
    match v {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().map(|i| i != 0).unwrap_or(false),
        Some(Value::String(s)) => matches!(s.to_lowercase().as_str(), "true" | "1" | "yes"),
        _ => false,
    }
}

pub fn parse_envelope(payload: &Value) -> Envelope {
    let empty = Map::new();
    let outer = payload.as_object().unwrap_or(&empty);

    let inner_tender = outer.get("tender").and_then(|v| v.as_object());
    let inner_payload = outer.get("payload").and_then(|v| v.as_object());
    let tender = inner_tender.or(inner_payload).unwrap_or(outer).clone();

    let tender_id = as_id(tender.get("id"))
        .or_else(|| as_id(outer.get("tender_id")))
        .or_else(|| as_id(outer.get("id")));
    let id_pncp = as_str(tender.get("id_pncp")).or_else(|| as_str(outer.get("id_pncp")));
    let source = as_str(outer.get("source")).or_else(|| as_str(tender.get("source")));
    let source_id = as_str(outer.get("source_id")).or_else(|| as_str(tender.get("source_id")));

    let force_fetch = truthy(outer.get("force_fetch"))
        || truthy(tender.get("force_fetch"))
        || inner_payload.map(|p| truthy(p.get("force_fetch"))).unwrap_or(false)
        || inner_tender.map(|t| truthy(t.get("force_fetch"))).unwrap_or(false);

    Envelope {
        tender_id,
        id_pncp,
        source,
        source_id,
        force_fetch,
        tender,
    }
}

/// URL map resolution: the info map first, then the envelope's wrappers.
pub fn resolve_urls(info: &Map<String, Value>, payload: &Value) -> Value {
    if let Some(urls) = non_empty_urls(info.get("urls")) {
        return urls;
    }
    let empty = Map::new();
    let outer = payload.as_object().unwrap_or(&empty);
    for key in ["tender", "payload"] {
        if let Some(urls) = outer
            .get(key)
            .and_then(|v| v.as_object())
            .and_then(|o| non_empty_urls(o.get("urls")))
        {
            return urls;
        }
    }
    non_empty_urls(outer.get("urls")).unwrap_or_else(|| Value::Object(Map::new()))
}

fn non_empty_urls(v: Option<&Value>) -> Option<Value> {
    match v? {
        Value::Object(o) if !o.is_empty() => Some(Value::Object(o.clone())),
        // producers sometimes double-encode the map
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Object(o)) if !o.is_empty() => Some(Value::Object(o)),
            _ => {
                if s.trim().is_empty() {
                    None
                } else {
                    Some(serde_json::json!({ "raw": s }))
                }
            }
        },
        _ => None,
    }
}

/// Internal retry counter carried inside the message.
pub fn get_retries(payload: &Value) -> u32 {
    payload
        .get("_retries")
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as u32
}

pub fn with_retries(payload: &Value, retries: u32) -> Value {
    let mut out = payload.clone();
    if let Some(obj) = out.as_object_mut() {
        obj.insert("_retries".to_string(), serde_json::json!(retries));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_flat_shape() {
        let env = parse_envelope(&json!({"id": 7, "id_pncp": "pncp:7", "objeto": "x"}));
        assert_eq!(env.tender_id, Some(7));
        assert_eq!(env.id_pncp.as_deref(), Some("pncp:7"));
        assert_eq!(env.tender.get("objeto"), Some(&json!("x")));
    }

    #[test]
    fn parses_tender_wrapper() {
        let env = parse_envelope(&json!({"tender": {"id": 3, "id_pncp": "a"}, "source": "pncp"}));
        assert_eq!(env.tender_id, Some(3));
        assert_eq!(env.source.as_deref(), Some("pncp"));
    }

    #[test]
    fn parses_payload_wrapper_with_top_level_id() {
        let env = parse_envelope(&json!({"tender_id": "42", "payload": {"id_pncp": "b"}}));
        assert_eq!(env.tender_id, Some(42));
        assert_eq!(env.id_pncp.as_deref(), Some("b"));
    }

    #[test]
    fn force_fetch_truthy_anywhere_wins() {
        assert!(parse_envelope(&json!({"force_fetch": true})).force_fetch);
        assert!(parse_envelope(&json!({"tender": {"force_fetch": "1"}})).force_fetch);
        assert!(parse_envelope(&json!({"payload": {"force_fetch": 1}})).force_fetch);
        assert!(!parse_envelope(&json!({"force_fetch": false})).force_fetch);
    }

    #[test]
    fn urls_fallback_chain() {
        let info = json!({"urls": {"pncp": "http://a"}}).as_object().unwrap().clone();
        let urls = resolve_urls(&info, &json!({}));
        assert_eq!(urls["pncp"], "http://a");

        let urls = resolve_urls(
            &Map::new(),
            &json!({"payload": {"urls": {"url": "http://b"}}}),
        );
        assert_eq!(urls["url"], "http://b");

        let urls = resolve_urls(&Map::new(), &json!({"urls": "{\"pncp\": \"http://c\"}"}));
        assert_eq!(urls["pncp"], "http://c");
    }

    #[test]
    fn retry_counter_roundtrip() {
        let msg = json!({"tender_id": 1});
        assert_eq!(get_retries(&msg), 0);
        let bumped = with_retries(&msg, 2);
        assert_eq!(get_retries(&bumped), 2);
    }
}
