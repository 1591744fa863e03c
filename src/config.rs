//! Environment-driven configuration.
//!
//! Every tunable is a named environment variable with a documented default,
//! grouped into one struct per concern. Workers construct their config once
//! at process start and pass it down; nothing reads the environment after
//! startup.

use std::env;

fn env_str(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_opt(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_u64(name: &str, default: u64) -> u64 {
    env_opt(name)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env_opt(name)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    env_opt(name)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    match env_opt(name).as_deref() {
        Some("1") | Some("true") | Some("True") => true,
        Some("0") | Some("false") | Some("False") => false,
        _ => default,
    }
}

/// Comma-separated list, empty entries dropped.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// `UF:chat_id` pairs, e.g. `SP:-100123,RJ:-100456`.
pub fn parse_uf_channels(raw: &str) -> std::collections::HashMap<String, String> {
    let mut out = std::collections::HashMap::new();
    for part in raw.split(',') {
        let part = part.trim();
        if let Some((uf, cid)) = part.split_once(':') {
            let uf = uf.trim().to_uppercase();
            let cid = cid.trim().to_string();
            if !uf.is_empty() && !cid.is_empty() {
                out.insert(uf, cid);
            }
        }
    }
    out
}

/// `name=threshold` pairs, e.g. `q:triage=500,q:parse=200`.
pub fn parse_thresholds(raw: &str) -> Vec<(String, i64)> {
    let mut out = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if let Some((k, v)) = part.split_once('=') {
            if let Ok(n) = v.trim().parse::<i64>() {
                if !k.trim().is_empty() {
                    out.push((k.trim().to_string(), n));
                }
            }
        }
    }
    out
}

/// Shared backing stores.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Redis URL for queues, metrics and the HTTP cache.
    pub redis_url: String,
    /// SQLite database path.
    pub database_path: String,
}

impl StoreConfig {
    pub fn from_env() -> Self {
        Self {
            redis_url: env_str("REDIS_URL", "redis://127.0.0.1:6379/0"),
            database_path: env_str("DATABASE_PATH", "licitaradar.db"),
        }
    }
}

/// Queue names and the shared length cap.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub triage_queue: String,
    pub fetch_queue: String,
    pub parse_queue: String,
    pub parse_smoke_queue: String,
    pub triage_dead_queue: String,
    pub fetch_dead_queue: String,
    pub parse_dead_queue: String,
    /// Hard cap per queue; 0 disables the check.
    pub max_len: usize,
}

impl QueueConfig {
    pub fn from_env() -> Self {
        Self {
            triage_queue: env_str("TRIAGE_QUEUE", "q:triage"),
            fetch_queue: env_str("FETCH_QUEUE", "q:fetch_parse"),
            parse_queue: env_str("PARSE_QUEUE", "q:parse"),
            parse_smoke_queue: env_str("PARSE_SMOKE_QUEUE", "q:parse_smoke"),
            triage_dead_queue: env_str("TRIAGE_DEAD_QUEUE", "q:dead_triage"),
            fetch_dead_queue: env_str("FETCH_DEAD_QUEUE", "q:dead_fetch_docs"),
            parse_dead_queue: env_str("PARSE_DEAD_QUEUE", "q:dead_parse"),
            max_len: env_usize("QUEUE_MAX_LEN", 10_000),
        }
    }

    /// Queues surfaced in health and metrics output.
    pub fn metrics_list(&self) -> Vec<String> {
        if let Some(raw) = env_opt("QUEUE_METRICS_LIST") {
            return split_list(&raw);
        }
        vec![
            self.triage_queue.clone(),
            self.fetch_queue.clone(),
            self.parse_queue.clone(),
            self.parse_smoke_queue.clone(),
            self.triage_dead_queue.clone(),
            self.fetch_dead_queue.clone(),
            self.parse_dead_queue.clone(),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub prefix: String,
    pub ttl_s: u64,
    /// Histogram bucket upper bounds, milliseconds.
    pub histogram_buckets_ms: Vec<f64>,
}

impl MetricsConfig {
    pub fn from_env() -> Self {
        let buckets = env_opt("METRICS_HISTOGRAM_BUCKETS_MS")
            .map(|raw| {
                split_list(&raw)
                    .iter()
                    .filter_map(|b| b.parse().ok())
                    .collect::<Vec<f64>>()
            })
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| vec![50.0, 100.0, 200.0, 500.0, 1000.0, 2000.0, 5000.0]);
        Self {
            enabled: env_bool("METRICS_ENABLED", true),
            prefix: env_str("METRICS_PREFIX", "metrics:v1"),
            ttl_s: env_u64("METRICS_TTL_S", 7 * 24 * 3600),
            histogram_buckets_ms: buckets,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventLogConfig {
    pub enabled: bool,
    /// Sampling ratio in [0, 1]; 1.0 logs everything.
    pub sample: f64,
}

impl EventLogConfig {
    pub fn from_env() -> Self {
        Self {
            enabled: env_bool("EVENT_LOG_ENABLED", true),
            sample: env_f64("EVENT_LOG_SAMPLE", 1.0).clamp(0.0, 1.0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub prefix: String,
    pub ttl_s: u64,
    /// JSON map of path prefix to TTL seconds; longest prefix wins.
    pub ttl_map: Option<String>,
    pub max_bytes: usize,
    pub metrics_ttl_s: u64,
    pub lock_ttl_s: u64,
    pub lock_wait_ms: u64,
}

impl CacheConfig {
    pub fn from_env() -> Self {
        Self {
            enabled: env_bool("CACHE_ENABLED", true),
            prefix: env_str("CACHE_PREFIX", "api-cache:v1"),
            ttl_s: env_u64("CACHE_TTL_S", 60),
            ttl_map: env_opt("CACHE_TTL_S_MAP"),
            max_bytes: env_usize("CACHE_MAX_BYTES", 512 * 1024),
            metrics_ttl_s: env_u64("CACHE_METRICS_TTL_S", 7 * 24 * 3600),
            lock_ttl_s: env_u64("CACHE_LOCK_TTL_S", 8),
            lock_wait_ms: env_u64("CACHE_LOCK_WAIT_MS", 200),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub auth_required: bool,
    pub api_keys: Vec<String>,
    pub public_paths: Vec<String>,
    pub rate_limit_enabled: bool,
    pub rate_limit_rpm: i64,
    pub rate_limit_bypass_keys: Vec<String>,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            host: env_str("API_HOST", "0.0.0.0"),
            port: env_u64("API_PORT", 8080) as u16,
            auth_required: env_bool("AUTH_REQUIRED", true),
            api_keys: split_list(&env_str("API_KEYS", "")),
            public_paths: split_list(&env_str(
                "AUTH_PUBLIC_PATHS",
                "/health,/health/cache,/health/queue,/metrics,/metrics/basic",
            )),
            rate_limit_enabled: env_bool("RATE_LIMIT_ENABLED", true),
            rate_limit_rpm: env_u64("RATE_LIMIT_RPM", 300) as i64,
            rate_limit_bypass_keys: split_list(&env_str("RATE_LIMIT_BYPASS_KEYS", "")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TriageConfig {
    pub min_score: i64,
    pub max_retries: u32,
    pub retry_backoff_s: f64,
    pub uf_allowlist: Vec<String>,
    pub municipio_allowlist: Vec<String>,
}

impl TriageConfig {
    pub fn from_env() -> Self {
        Self {
            min_score: env_u64("TRIAGE_MIN_SCORE", 1) as i64,
            max_retries: env_u64("TRIAGE_MAX_RETRIES", 3) as u32,
            retry_backoff_s: env_f64("TRIAGE_RETRY_BACKOFF_S", 2.0),
            uf_allowlist: split_list(&env_str("TRIAGE_UF_ALLOWLIST", ""))
                .iter()
                .map(|s| s.to_uppercase())
                .collect(),
            municipio_allowlist: split_list(&env_str("TRIAGE_MUNICIPIO_ALLOWLIST", ""))
                .iter()
                .map(|s| crate::normalize::fold_accents_lower(s))
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub max_bytes: usize,
    pub timeout_s: u64,
    pub max_retries: u32,
    pub retry_backoff_s: f64,
    pub user_agent: String,
    /// PNCP document-enumeration endpoint base.
    pub pncp_api_base_url: String,
    pub pncp_docs_enabled: bool,
    pub pncp_docs_timeout_s: u64,
}

impl FetchConfig {
    pub fn from_env() -> Self {
        Self {
            max_bytes: env_usize("FETCH_MAX_BYTES", 5 * 1024 * 1024),
            timeout_s: env_u64("FETCH_TIMEOUT_S", 20),
            max_retries: env_u64("FETCH_MAX_RETRIES", 3) as u32,
            retry_backoff_s: env_f64("FETCH_RETRY_BACKOFF_S", 2.0),
            user_agent: env_str("FETCH_USER_AGENT", "licitaradar/0.1 (+fetch_docs)"),
            pncp_api_base_url: env_str("PNCP_API_BASE_URL", "https://pncp.gov.br/api/pncp"),
            pncp_docs_enabled: env_bool("PNCP_DOCS_ENABLED", true),
            pncp_docs_timeout_s: env_u64("PNCP_DOCS_TIMEOUT_S", 20),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParseConfig {
    pub max_chars: usize,
    pub drop_body: bool,
    pub segment_chars: usize,
    pub segment_overlap: usize,
    pub max_retries: u32,
    pub retry_backoff_s: f64,
    pub smoke_disable_ocr: bool,
    pub smoke_disable_embeddings: bool,
    pub smoke_drop_body: bool,
    pub smoke_max_chars: usize,
    pub post_ocr_gate_enabled: bool,
    pub post_ocr_gate_keywords: Vec<String>,
    pub post_ocr_gate_regex: Option<String>,
    pub table_extract_enabled: bool,
    pub doc_convert_enabled: bool,
}

impl ParseConfig {
    pub fn from_env() -> Self {
        Self {
            max_chars: env_usize("PARSE_MAX_CHARS", 200_000),
            drop_body: env_bool("PARSE_DROP_BODY", true),
            segment_chars: env_usize("SEGMENT_CHARS", 800),
            segment_overlap: env_usize("SEGMENT_OVERLAP", 100),
            max_retries: env_u64("PARSE_MAX_RETRIES", 3) as u32,
            retry_backoff_s: env_f64("PARSE_RETRY_BACKOFF_S", 2.0),
            smoke_disable_ocr: env_bool("PARSE_SMOKE_DISABLE_OCR", true),
            smoke_disable_embeddings: env_bool("PARSE_SMOKE_DISABLE_EMBEDDINGS", true),
            smoke_drop_body: env_bool("PARSE_SMOKE_DROP_BODY", true),
            smoke_max_chars: env_usize("PARSE_SMOKE_MAX_CHARS", 20_000),
            post_ocr_gate_enabled: env_bool("POST_OCR_GATE_ENABLED", false),
            post_ocr_gate_keywords: split_list(&env_str("POST_OCR_GATE_KEYWORDS", ""))
                .iter()
                .map(|s| s.to_lowercase())
                .collect(),
            post_ocr_gate_regex: env_opt("POST_OCR_GATE_REGEX"),
            table_extract_enabled: env_bool("TABLE_EXTRACT_ENABLED", false),
            doc_convert_enabled: env_bool("DOC_CONVERT_ENABLED", false),
        }
    }
}

/// OCR mode selection for image-only PDFs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcrMode {
    /// Rasterize pages and run tesseract per page.
    Pages,
    /// One-shot ocrmypdf with sidecar text output.
    OcrMyPdf,
    /// ocrmypdf first, per-page fallback.
    Auto,
}

#[derive(Debug, Clone)]
pub struct OcrConfig {
    pub enabled: bool,
    pub min_text: usize,
    pub min_quality: f64,
    pub max_bytes: usize,
    pub timeout_s: u64,
    pub page_timeout_s: u64,
    pub lang: String,
    pub jobs: String,
    pub dpi: u32,
    pub max_pages: usize,
    pub mode: OcrMode,
    pub compress_pdf: bool,
    pub compress_pdf_min_bytes: usize,
}

impl OcrConfig {
    pub fn from_env() -> Self {
        let mode = match env_str("OCR_MODE", "pages").as_str() {
            "ocrmypdf" => OcrMode::OcrMyPdf,
            "auto" => OcrMode::Auto,
            _ => OcrMode::Pages,
        };
        Self {
            enabled: env_bool("PARSE_OCR", false),
            min_text: env_usize("OCR_MIN_TEXT", 200),
            min_quality: env_f64("OCR_MIN_QUALITY", 0.25),
            max_bytes: env_usize("OCR_MAX_BYTES", 20 * 1024 * 1024),
            timeout_s: env_u64("OCR_TIMEOUT_S", 120),
            page_timeout_s: env_u64("OCR_PAGE_TIMEOUT_S", 60),
            lang: env_str("OCR_LANG", "por+eng"),
            jobs: env_str("OCR_JOBS", "2"),
            dpi: env_u64("OCR_DPI", 150) as u32,
            max_pages: env_usize("OCR_MAX_PAGES", 12),
            mode,
            compress_pdf: env_bool("COMPRESS_PDF", false),
            compress_pdf_min_bytes: env_usize("COMPRESS_PDF_MIN_BYTES", 5 * 1024 * 1024),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub enabled: bool,
    pub url: String,
    pub model: String,
    pub dim: usize,
    pub timeout_s: u64,
}

impl EmbeddingConfig {
    pub fn from_env() -> Self {
        Self {
            enabled: env_bool("EMBEDDINGS_ENABLED", false),
            url: env_str("OLLAMA_URL", "http://127.0.0.1:11434"),
            model: env_str("OLLAMA_EMBED_MODEL", "nomic-embed-text"),
            dim: env_usize("EMBED_DIM", 768),
            timeout_s: env_u64("EMBED_TIMEOUT_S", 15),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub enabled: bool,
    pub url: Option<String>,
    pub timeout_s: u64,
    pub min_chars: usize,
    pub max_chars: usize,
    pub force: bool,
}

impl AgentConfig {
    pub fn from_env() -> Self {
        Self {
            enabled: env_bool("AGENT_ENABLED", false),
            url: env_opt("AGENT_URL"),
            timeout_s: env_u64("AGENT_TIMEOUT_S", 15),
            min_chars: env_usize("AGENT_MIN_CHARS", 300),
            max_chars: env_usize("AGENT_MAX_CHARS", 4000),
            force: env_bool("AGENT_FORCE", false),
        }
    }
}

/// Which pipeline stage triggers realtime chat notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyStage {
    Triage,
    Parse,
    Off,
}

#[derive(Debug, Clone)]
pub struct NotifyConfig {
    pub stage: NotifyStage,
    pub bot_token: Option<String>,
    pub bot_username: Option<String>,
    /// UF code to broadcast-channel chat id.
    pub uf_channels: std::collections::HashMap<String, String>,
}

impl NotifyConfig {
    pub fn from_env() -> Self {
        let stage = match env_str("TELEGRAM_NOTIFY_STAGE", "triage").to_lowercase().as_str() {
            "triage" => NotifyStage::Triage,
            "parse" => NotifyStage::Parse,
            _ => NotifyStage::Off,
        };
        Self {
            stage,
            bot_token: env_opt("TELEGRAM_BOT_TOKEN"),
            bot_username: env_opt("BOT_USERNAME"),
            uf_channels: parse_uf_channels(&env_str("TELEGRAM_UF_CHANNELS", "")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DailyConfig {
    pub poll_s: u64,
    pub lookback_h: i64,
    pub max_items: usize,
}

impl DailyConfig {
    pub fn from_env() -> Self {
        Self {
            poll_s: env_u64("DAILY_POLL_S", 3600),
            lookback_h: env_u64("DAILY_LOOKBACK_H", 24) as i64,
            max_items: env_usize("DAILY_MAX_ITEMS", 8),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AlertsConfig {
    pub enabled: bool,
    pub poll_s: u64,
    pub cooldown_s: u64,
    pub prefix: String,
    pub queue_thresholds: Vec<(String, i64)>,
    pub counter_thresholds: Vec<(String, i64)>,
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
}

impl AlertsConfig {
    pub fn from_env() -> Self {
        Self {
            enabled: env_bool("ALERTS_ENABLED", true),
            poll_s: env_u64("ALERTS_POLL_S", 60).max(5),
            cooldown_s: env_u64("ALERTS_COOLDOWN_S", 300),
            prefix: env_str("ALERTS_PREFIX", "alerts:v1"),
            queue_thresholds: parse_thresholds(&env_str(
                "ALERTS_QUEUE_THRESHOLDS",
                "q:triage=500,q:fetch_parse=200,q:parse=200,q:dead_triage=1,q:dead_fetch_docs=1,q:dead_parse=1",
            )),
            counter_thresholds: parse_thresholds(&env_str(
                "ALERTS_COUNTER_THRESHOLDS",
                "api.errors_5xx_total=5,worker.triage.dead_total=1,worker.fetch_docs.dead_total=1,worker.parse.dead_total=1",
            )),
            bot_token: env_opt("ALERTS_TELEGRAM_BOT_TOKEN").or_else(|| env_opt("TELEGRAM_BOT_TOKEN")),
            chat_id: env_opt("ALERTS_TELEGRAM_CHAT_ID").or_else(|| env_opt("TELEGRAM_CHAT_ID")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ComprasConfig {
    pub api_base: String,
    pub list_path: String,
    /// Detail endpoint with an `{id}` placeholder.
    pub detail_path: String,
    pub poll_s: f64,
    pub max_pages: usize,
    pub max_items: usize,
    /// Listing date filter field; `_min`/`_max` suffixes are appended.
    pub date_field: String,
    pub data_inicial: Option<String>,
    pub data_final: Option<String>,
    pub uasg: Option<String>,
    pub core_api_url: String,
    pub core_api_key: Option<String>,
}

impl ComprasConfig {
    pub fn from_env() -> Self {
        Self {
            api_base: env_str("COMPRAS_API_BASE", "https://compras.dados.gov.br")
                .trim_end_matches('/')
                .to_string(),
            list_path: env_str("COMPRAS_LIST_PATH", "/licitacoes/v1/licitacoes.json"),
            detail_path: env_str("COMPRAS_DETAIL_PATH", "/licitacoes/id/licitacao/{id}.json"),
            poll_s: env_f64("COMPRAS_POLL_S", 3600.0),
            max_pages: env_usize("COMPRAS_MAX_PAGES", 10),
            max_items: env_usize("COMPRAS_MAX_ITEMS", 500),
            date_field: env_str("COMPRAS_DATE_FIELD", "data_abertura_proposta"),
            data_inicial: env_opt("COMPRAS_DATA_INICIAL"),
            data_final: env_opt("COMPRAS_DATA_FINAL"),
            uasg: env_opt("COMPRAS_UASG"),
            core_api_url: env_str("CORE_API_URL", "http://127.0.0.1:8080"),
            core_api_key: env_opt("CORE_API_KEY").or_else(|| env_opt("API_KEY")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    pub base_url: String,
    pub modalidade_ids: Vec<String>,
    pub page_size: usize,
    pub page_size_min: usize,
    pub max_pages: usize,
    pub max_items: usize,
    pub sleep_s: f64,
    pub poll_s: f64,
    pub backoff_s: f64,
    pub uf: Option<String>,
    pub data_inicial: Option<String>,
    pub data_final: Option<String>,
    pub core_api_url: String,
    pub core_api_key: Option<String>,
}

impl CrawlerConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: env_str("PNCP_BASE_URL", "https://pncp.gov.br/api/consulta"),
            modalidade_ids: split_list(&env_str("PNCP_MODALIDADE_IDS", "8")),
            page_size: env_usize("PNCP_PAGE_SIZE", 50),
            page_size_min: env_usize("PNCP_PAGE_SIZE_MIN", 10),
            max_pages: env_usize("PNCP_MAX_PAGES", 20),
            max_items: env_usize("PNCP_MAX_ITEMS", 500),
            sleep_s: env_f64("PNCP_SLEEP_S", 1.0),
            poll_s: env_f64("PNCP_POLL_S", 3600.0),
            backoff_s: env_f64("PNCP_BACKOFF_S", 10.0),
            uf: env_opt("PNCP_UF"),
            data_inicial: env_opt("PNCP_DATA_INICIAL"),
            data_final: env_opt("PNCP_DATA_FINAL"),
            core_api_url: env_str("CORE_API_URL", "http://127.0.0.1:8080"),
            core_api_key: env_opt("CORE_API_KEY").or_else(|| env_opt("API_KEY")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_list_drops_empty_entries() {
        assert_eq!(split_list("a, b,,c "), vec!["a", "b", "c"]);
        assert!(split_list("").is_empty());
    }

    #[test]
    fn uf_channels_parse() {
        let m = parse_uf_channels("SP:-100123, RJ:-100456, bogus");
        assert_eq!(m.get("SP").map(String::as_str), Some("-100123"));
        assert_eq!(m.get("RJ").map(String::as_str), Some("-100456"));
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn thresholds_parse() {
        let t = parse_thresholds("q:triage=500,broken,x=notanum,q:parse=1");
        assert_eq!(t, vec![("q:triage".to_string(), 500), ("q:parse".to_string(), 1)]);
    }
}
