//! Cheap rule-based scoring for incoming tenders.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

/// Keyword weights over the object text. Word-boundary matches only.
fn keyword_weights() -> &'static Vec<(&'static str, i64)> {
    static WEIGHTS: OnceLock<Vec<(&'static str, i64)>> = OnceLock::new();
    WEIGHTS.get_or_init(|| {
        vec![
            ("limpeza", 3),
            ("manutenção", 2),
            ("ti", 2),
            ("informática", 2),
            ("vigilância", 2),
            ("saúde", 2),
            ("médico", 2),
        ]
    })
}

/// Per-UF weights for the target footprint.
fn uf_weights() -> &'static HashMap<&'static str, i64> {
    static WEIGHTS: OnceLock<HashMap<&'static str, i64>> = OnceLock::new();
    WEIGHTS.get_or_init(|| HashMap::from([("SP", 1)]))
}

fn word_re(word: &str) -> Regex {
    Regex::new(&format!(r"\b{}\b", regex::escape(word))).unwrap_or_else(|_| Regex::new("$^").unwrap())
}

/// Score a tender info map; returns the score and the matched reasons.
pub fn score_tender(info: &Map<String, Value>) -> (i64, Vec<String>) {
    let mut score = 0;
    let mut reasons = Vec::new();

    let objeto = info
        .get("objeto")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_lowercase();
    for (kw, weight) in keyword_weights() {
        if word_re(kw).is_match(&objeto) {
            score += weight;
            reasons.push(format!("kw:{}+{}", kw, weight));
        }
    }

    let uf = info
        .get("uf")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_uppercase();
    if let Some(weight) = uf_weights().get(uf.as_str()) {
        score += weight;
        reasons.push(format!("uf:{}+{}", uf, weight));
    }

    let modalidade = info
        .get("modalidade")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_lowercase();
    if modalidade.contains("preg") {
        score += 1;
        reasons.push("modalidade:pregao+1".to_string());
    }

    (score, reasons)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn info(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn scores_keyword_uf_and_modality() {
        let t = info(json!({
            "objeto": "limpeza hospitalar",
            "uf": "SP",
            "modalidade": "pregão eletrônico",
        }));
        let (score, reasons) = score_tender(&t);
        assert!(score >= 3 + 1 + 1, "expected stacked score, got {} ({:?})", score, reasons);
        assert!(reasons.iter().any(|r| r.starts_with("kw:limpeza")));
        assert!(reasons.iter().any(|r| r.starts_with("uf:SP")));
        assert!(reasons.iter().any(|r| r.starts_with("modalidade:")));
    }

    #[test]
    fn keyword_requires_word_boundary() {
        // "ti" must not match inside "gestial"-like words
        let t = info(json!({"objeto": "gestao participativa", "uf": "RJ"}));
        let (score, reasons) = score_tender(&t);
        assert_eq!(score, 0, "{:?}", reasons);
    }

    #[test]
    fn empty_info_scores_zero() {
        let (score, reasons) = score_tender(&Map::new());
        assert_eq!(score, 0);
        assert!(reasons.is_empty());
    }
}
