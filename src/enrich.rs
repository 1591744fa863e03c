//! Classification oracle client.
//!
//! The oracle is a black-box HTTP endpoint that answers with JSON — often
//! wrapped in code fences, sometimes with unquoted keys or single quotes.
//! The parser digs the object out of whatever framing came back; labels are
//! then folded, length-capped and checked against the fixed allowlist.

use std::sync::OnceLock;
use std::time::Instant;

use regex::Regex;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::config::AgentConfig;
use crate::metrics::MetricsSink;
use crate::normalize::fold_accents;
use crate::repository::TenderRepository;

pub const MATERIA_ALLOWED: &[&str] = &[
    "saude",
    "educacao",
    "limpeza",
    "ti",
    "obras",
    "servicos",
    "materiais",
    "vigilancia",
    "manutencao",
    "alimentacao",
    "transporte",
    "seguranca",
    "administrativo",
    "outros",
];

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent disabled or not configured")]
    Disabled,
    #[error("connection error: {0}")]
    Connection(String),
    #[error("api error: {0}")]
    Api(String),
    #[error("unparseable agent output")]
    Parse,
}

/// Normalized classification labels.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnrichmentLabels {
    pub materia: Option<String>,
    pub categoria: Option<String>,
    pub confidence: Option<f64>,
    pub tags: Vec<String>,
}

impl EnrichmentLabels {
    pub fn is_empty(&self) -> bool {
        self.materia.is_none() && self.categoria.is_none() && self.tags.is_empty()
    }
}

pub struct AgentClient {
    config: AgentConfig,
    client: reqwest::Client,
}

impl AgentClient {
    pub fn new(config: AgentConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_s))
            .build()
            .expect("failed to build agent http client");
        Self { config, client }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Skip when disabled, text is too short, or labels already exist and no
    /// re-run was forced.
    pub fn should_skip(&self, text: &str, existing_labels: bool) -> bool {
        if !self.config.enabled || self.config.url.is_none() {
            return true;
        }
        if text.chars().count() < self.config.min_chars {
            return true;
        }
        existing_labels && !self.config.force
    }

    /// Raw oracle round trip: POST, then lenient-parse whatever came back.
    pub async fn ask(
        &self,
        tender_id: i32,
        text: &str,
        meta: &Value,
    ) -> Result<Map<String, Value>, AgentError> {
        let url = self.config.url.as_deref().ok_or(AgentError::Disabled)?;
        let payload = json!({
            "tender_id": tender_id,
            "text": truncate_chars_str(text.trim(), self.config.max_chars),
            "meta": meta,
        });
        let resp = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| AgentError::Connection(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(AgentError::Api(format!("HTTP {}", resp.status())));
        }
        let raw = resp
            .text()
            .await
            .map_err(|e| AgentError::Connection(e.to_string()))?;
        parse_lenient(&raw).ok_or(AgentError::Parse)
    }

    pub async fn classify(
        &self,
        tender_id: i32,
        text: &str,
        meta: &Value,
    ) -> Result<EnrichmentLabels, AgentError> {
        let obj = self.ask(tender_id, text, meta).await?;
        Ok(normalize_result(&obj))
    }
}

fn truncate_chars_str(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn unquoted_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"([,{]\s*)([A-Za-z_][A-Za-z0-9_]*)\s*:"#).unwrap())
}

fn try_parse_object(candidate: &str) -> Option<Map<String, Value>> {
    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(candidate) {
        return Some(obj);
    }
    let repaired = unquoted_key_re().replace_all(candidate, "$1\"$2\":");
    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(&repaired) {
        return Some(obj);
    }
    // last resort for single-quoted pseudo-JSON
    let requoted = repaired.replace('\'', "\"");
    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(&requoted) {
        return Some(obj);
    }
    None
}

/// Extract a JSON object from raw model output: the text itself, any fenced
/// block, then the widest `{…}` span, each with key repair.
pub fn parse_lenient(raw: &str) -> Option<Map<String, Value>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let mut candidates: Vec<String> = vec![raw.to_string()];
    if raw.contains("```") {
        for part in raw.split("```") {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let part = part.strip_prefix("json").unwrap_or(part).trim();
            candidates.push(part.to_string());
        }
    }
    if let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) {
        if end > start {
            candidates.push(raw[start..=end].to_string());
        }
    }
    candidates.iter().find_map(|c| try_parse_object(c))
}

fn clean_label(value: Option<&Value>) -> Option<String> {
    let raw = value?.as_str()?;
    let mut label = fold_accents(raw.trim()).to_lowercase();
    if let Some(first_line) = label.lines().next() {
        label = first_line.trim().to_string();
    }
    if label.is_empty() || label.len() > 80 {
        return None;
    }
    if !MATERIA_ALLOWED.contains(&label.as_str()) {
        return None;
    }
    Some(label)
}

/// Fold, cap and allowlist-check the raw oracle output.
pub fn normalize_result(raw: &Map<String, Value>) -> EnrichmentLabels {
    let materia = clean_label(
        raw.get("materia")
            .or_else(|| raw.get("category"))
            .or_else(|| raw.get("categoria")),
    );
    let categoria = clean_label(raw.get("categoria").or_else(|| raw.get("category")));
    let confidence = raw
        .get("confidence")
        .or_else(|| raw.get("conf"))
        .and_then(|v| {
            v.as_f64()
                .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
        });
    let tags = raw
        .get("tags")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|t| t.as_str())
                .map(|t| fold_accents(t.trim()).to_lowercase())
                .filter(|t| !t.is_empty() && t.len() <= 40)
                .take(10)
                .collect()
        })
        .unwrap_or_default();
    EnrichmentLabels {
        materia,
        categoria,
        confidence,
        tags,
    }
}

/// Dense-embedding oracle for segment vectors.
///
/// A response whose vector length disagrees with the configured dimension is
/// dropped rather than stored.
pub struct EmbeddingClient {
    config: crate::config::EmbeddingConfig,
    client: reqwest::Client,
}

impl EmbeddingClient {
    pub fn new(config: crate::config::EmbeddingConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_s))
            .build()
            .expect("failed to build embedding http client");
        Self { config, client }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub async fn embed(&self, text: &str) -> Option<Vec<f64>> {
        if !self.config.enabled || text.is_empty() {
            return None;
        }
        let url = format!("{}/api/embeddings", self.config.url);
        let payload = json!({"model": self.config.model, "prompt": text});
        let resp = self.client.post(&url).json(&payload).send().await.ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let data: Value = resp.json().await.ok()?;
        let vec: Vec<f64> = data
            .get("embedding")?
            .as_array()?
            .iter()
            .filter_map(|v| v.as_f64())
            .collect();
        if vec.len() != self.config.dim {
            debug!(got = vec.len(), want = self.config.dim, "embedding dimension mismatch");
            return None;
        }
        Some(vec)
    }
}

/// Classify and persist labels for one tender; counters only, no errors out.
pub async fn enrich_tender(
    agent: &AgentClient,
    tenders: &TenderRepository,
    metrics: &MetricsSink,
    tender_id: i32,
    text: &str,
    meta: &Value,
    existing_labels: bool,
) {
    if agent.should_skip(text, existing_labels) {
        metrics.incr("agent.enrich.skip_total").await;
        return;
    }
    let started = Instant::now();
    let outcome = agent.classify(tender_id, text, meta).await;
    let elapsed_ms = started.elapsed().as_millis() as f64;
    match outcome {
        Ok(labels) if !labels.is_empty() => {
            let persisted = tenders
                .update_labels(
                    tender_id,
                    labels.materia.clone(),
                    labels.categoria.clone(),
                    labels.confidence,
                    Some("agent".to_string()),
                    &labels.tags,
                )
                .await;
            match persisted {
                Ok(()) => metrics.incr("agent.enrich.ok_total").await,
                Err(e) => {
                    debug!(tender_id, error = %e, "label persist failed");
                    metrics.incr("agent.enrich.error_total").await;
                }
            }
        }
        Ok(_) => metrics.incr("agent.enrich.error_total").await,
        Err(e) => {
            debug!(tender_id, error = %e, "agent call failed");
            metrics.incr("agent.enrich.error_total").await;
        }
    }
    metrics
        .observe_histogram("agent.enrich_duration_ms", elapsed_ms)
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_json() {
        let obj = parse_lenient(r#"{"materia":"saude","confidence":0.9}"#).unwrap();
        assert_eq!(obj["materia"], "saude");
    }

    #[test]
    fn parses_fenced_json() {
        let raw = "Sure!\n```json\n{\"materia\": \"limpeza\"}\n```\nthanks";
        let obj = parse_lenient(raw).unwrap();
        assert_eq!(obj["materia"], "limpeza");
    }

    #[test]
    fn parses_unquoted_keys() {
        let obj = parse_lenient(r#"{materia:"ti", confidence: 0.5}"#).unwrap();
        assert_eq!(obj["materia"], "ti");
    }

    #[test]
    fn parses_largest_brace_span() {
        let raw = "the answer is {\"materia\":\"obras\"} hope it helps";
        let obj = parse_lenient(raw).unwrap();
        assert_eq!(obj["materia"], "obras");
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_lenient("no json here").is_none());
        assert!(parse_lenient("").is_none());
    }

    #[test]
    fn normalize_applies_allowlist_and_folding() {
        let obj = parse_lenient(r#"{"materia":"Saúde","categoria":"inventada","tags":["Obras","x"]}"#)
            .unwrap();
        let labels = normalize_result(&obj);
        assert_eq!(labels.materia.as_deref(), Some("saude"));
        assert_eq!(labels.categoria, None);
        assert_eq!(labels.tags, vec!["obras", "x"]);
    }

    #[test]
    fn normalize_caps_tags() {
        let tags: Vec<String> = (0..20).map(|i| format!("\"t{}\"", i)).collect();
        let raw = format!(r#"{{"materia":"ti","tags":[{}]}}"#, tags.join(","));
        let labels = normalize_result(&parse_lenient(&raw).unwrap());
        assert_eq!(labels.tags.len(), 10);
    }

    #[test]
    fn confidence_accepts_string_numbers() {
        let labels = normalize_result(&parse_lenient(r#"{"materia":"ti","confidence":"0.75"}"#).unwrap());
        assert_eq!(labels.confidence, Some(0.75));
    }
}
