//! Stable metadata hashing and cross-source fingerprinting.
//!
//! Both hashes are sha-256 over canonical JSON: a fixed key whitelist,
//! sorted keys, compact separators, UTF-8 bytes. `serde_json` objects are
//! backed by a sorted map, so serializing the picked subset yields the
//! canonical form regardless of input key order.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Datetimes already arrive as ISO-8601 strings in the payload map; other
/// scalars pass through untouched.
fn pick(payload: &Map<String, Value>, key: &str) -> Value {
    payload.get(key).cloned().unwrap_or(Value::Null)
}

fn canonical_sha256(key: &Map<String, Value>) -> String {
    let raw = serde_json::to_string(key).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Hash over identity plus the core attributes; changes whenever any of the
/// whitelisted fields change.
pub fn hash_metadados(payload: &Map<String, Value>) -> String {
    let mut key = Map::new();
    for field in [
        "id_pncp",
        "source",
        "source_id",
        "orgao",
        "municipio",
        "uf",
        "modalidade",
        "objeto",
        "data_publicacao",
        "status",
        "urls",
    ] {
        key.insert(field.to_string(), pick(payload, field));
    }
    canonical_sha256(&key)
}

fn is_empty(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Identity-free hash used to collapse the same opportunity seen from
/// multiple upstream sources. `None` when every included field is empty.
pub fn fingerprint_tender(payload: &Map<String, Value>) -> Option<String> {
    let mut key = Map::new();
    for field in [
        "orgao_norm",
        "municipio_norm",
        "uf_norm",
        "modalidade_norm",
        "objeto_norm",
        "data_publicacao",
    ] {
        key.insert(field.to_string(), pick(payload, field));
    }
    if key.values().all(is_empty) {
        return None;
    }
    Some(canonical_sha256(&key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn hash_stable_under_key_order() {
        let a = obj(json!({
            "id_pncp": "pncp:1", "source": "pncp", "objeto": "limpeza",
            "uf": "SP", "extra_ignored": "x",
        }));
        let b = obj(json!({
            "uf": "SP", "objeto": "limpeza", "source": "pncp",
            "id_pncp": "pncp:1", "other_ignored": 42,
        }));
        assert_eq!(hash_metadados(&a), hash_metadados(&b));
    }

    #[test]
    fn hash_changes_on_attribute_change() {
        let a = obj(json!({"id_pncp": "pncp:1", "objeto": "limpeza"}));
        let b = obj(json!({"id_pncp": "pncp:1", "objeto": "vigilancia"}));
        assert_ne!(hash_metadados(&a), hash_metadados(&b));
    }

    #[test]
    fn fingerprint_ignores_identity() {
        let a = obj(json!({
            "id_pncp": "pncp:A", "source": "pncp", "status": "OPEN",
            "orgao_norm": "Prefeitura X", "objeto_norm": "Contratação X",
            "uf_norm": "SP", "data_publicacao": "2024-01-01T00:00:00Z",
        }));
        let b = obj(json!({
            "id_pncp": "compras:A", "source": "compras", "status": "CLOSED",
            "orgao_norm": "Prefeitura X", "objeto_norm": "Contratação X",
            "uf_norm": "SP", "data_publicacao": "2024-01-01T00:00:00Z",
        }));
        assert_eq!(fingerprint_tender(&a), fingerprint_tender(&b));
        assert!(fingerprint_tender(&a).is_some());
    }

    #[test]
    fn fingerprint_none_when_all_empty() {
        let empty = obj(json!({"id_pncp": "pncp:A", "orgao_norm": null, "objeto_norm": ""}));
        assert_eq!(fingerprint_tender(&empty), None);
    }
}
