//! Fetch worker: resolve the tender, download the document, dedupe by
//! content hash, hand off to parse.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use super::envelope::{parse_envelope, resolve_urls, Envelope};
use super::{retry_or_dead, PipelineContext, POP_TIMEOUT_S};
use crate::config::FetchConfig;
use crate::repository::{prepare_payload, FetchedDocument};

fn pncp_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?P<cnpj>\d{14})-\d+-(?P<seq>\d+)/(?P<ano>\d{4})$").unwrap())
}

/// `cnpj-modality-seq/year` external ids are enumerable against the PNCP
/// document API; anything else simply is not.
fn parse_pncp_id(id_pncp: &str) -> Option<(String, String, String)> {
    let caps = pncp_id_re().captures(id_pncp.trim())?;
    let cnpj = caps.name("cnpj")?.as_str().to_string();
    let seq = caps.name("seq")?.as_str().trim_start_matches('0');
    let seq = if seq.is_empty() { "0".to_string() } else { seq.to_string() };
    let ano = caps.name("ano")?.as_str().to_string();
    Some((cnpj, ano, seq))
}

#[derive(Debug)]
struct FetchOutcome {
    status: Option<i32>,
    headers: Option<Value>,
    content_type: Option<String>,
    body: Vec<u8>,
    truncated: bool,
    error: Option<String>,
}

/// Streaming GET with a hard byte cap; network failure lands in `error`.
async fn fetch_url(client: &reqwest::Client, url: &str, max_bytes: usize) -> FetchOutcome {
    let failed = |e: String| FetchOutcome {
        status: None,
        headers: None,
        content_type: None,
        body: Vec::new(),
        truncated: false,
        error: Some(e),
    };
    let mut resp = match client.get(url).header("Accept", "*/*").send().await {
        Ok(resp) => resp,
        Err(e) => return failed(e.to_string()),
    };
    let status = resp.status().as_u16() as i32;
    let mut headers = serde_json::Map::new();
    for (name, value) in resp.headers() {
        if let Ok(v) = value.to_str() {
            headers.insert(name.to_string(), json!(v));
        }
    }
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.as_str())
        .map(String::from);

    let mut body: Vec<u8> = Vec::new();
    let mut truncated = false;
    loop {
        match resp.chunk().await {
            Ok(Some(chunk)) => {
                if body.len() + chunk.len() > max_bytes {
                    let remaining = max_bytes - body.len();
                    body.extend_from_slice(&chunk[..remaining]);
                    truncated = true;
                    break;
                }
                body.extend_from_slice(&chunk);
            }
            Ok(None) => break,
            Err(e) => return failed(e.to_string()),
        }
    }
    FetchOutcome {
        status: Some(status),
        headers: Some(Value::Object(headers)),
        content_type,
        body,
        truncated,
        error: None,
    }
}

/// Enumerate attached documents for a PNCP contracting process.
async fn pncp_list_docs(
    client: &reqwest::Client,
    config: &FetchConfig,
    cnpj: &str,
    ano: &str,
    seq: &str,
) -> Vec<String> {
    let url = format!(
        "{}/v1/orgaos/{}/compras/{}/{}/arquivos",
        config.pncp_api_base_url, cnpj, ano, seq
    );
    let resp = match client
        .get(&url)
        .header("Accept", "application/json")
        .timeout(std::time::Duration::from_secs(config.pncp_docs_timeout_s))
        .send()
        .await
    {
        Ok(resp) => resp,
        Err(_) => return Vec::new(),
    };
    let data: Value = match resp.json().await {
        Ok(data) => data,
        Err(_) => return Vec::new(),
    };
    let docs = match &data {
        Value::Array(items) => items.clone(),
        Value::Object(obj) => obj
            .get("documentos")
            .or_else(|| obj.get("Documentos"))
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default(),
        _ => Vec::new(),
    };
    docs.iter()
        .filter_map(|d| d.get("url").and_then(|v| v.as_str()))
        .map(String::from)
        .collect()
}

enum Resolution {
    Resolved(i32),
    Missing,
}

/// Resolve the tender id, lazily upserting from the embedded payload when
/// the row does not exist yet. `Err` means the store is unavailable.
async fn resolve_tender(
    ctx: &PipelineContext,
    env: &Envelope,
    payload: &Value,
) -> Result<Resolution, String> {
    if let Some(id) = env.tender_id {
        if ctx.tenders.exists(id as i32).await.map_err(|e| e.to_string())? {
            return Ok(Resolution::Resolved(id as i32));
        }
    }
    if let Some(ref id_pncp) = env.id_pncp {
        if let Some(record) = ctx
            .tenders
            .get_by_id_pncp(id_pncp)
            .await
            .map_err(|e| e.to_string())?
        {
            return Ok(Resolution::Resolved(record.id));
        }
    }
    if let (Some(ref source), Some(ref source_id)) = (&env.source, &env.source_id) {
        if let Some(record) = ctx
            .tenders
            .get_by_source(source, source_id)
            .await
            .map_err(|e| e.to_string())?
        {
            return Ok(Resolution::Resolved(record.id));
        }
    }
    let Some(ref id_pncp) = env.id_pncp else {
        return Ok(Resolution::Missing);
    };

    // lazy insert through the same normalize/hash/version/canonical path as
    // the ingest endpoint
    let mut raw = serde_json::Map::new();
    raw.insert("id_pncp".to_string(), json!(id_pncp));
    raw.insert("source".to_string(), json!(env.source));
    raw.insert("source_id".to_string(), json!(env.source_id));
    for key in ["orgao", "municipio", "uf", "modalidade", "objeto", "data_publicacao", "status"] {
        if let Some(v) = env.tender.get(key) {
            raw.insert(key.to_string(), v.clone());
        }
    }
    raw.insert("urls".to_string(), resolve_urls(&env.tender, payload));
    let prepared = prepare_payload(&raw);
    let saved = ctx
        .tenders
        .upsert(&prepared, None)
        .await
        .map_err(|e| e.to_string())?;
    Ok(Resolution::Resolved(saved.id))
}

pub async fn run(ctx: PipelineContext, config: FetchConfig) {
    let queue_name = ctx.queues.fetch_queue.clone();
    let client = reqwest::Client::builder()
        .user_agent(&config.user_agent)
        .timeout(std::time::Duration::from_secs(config.timeout_s))
        .gzip(true)
        .build()
        .expect("failed to build fetch http client");

    info!(queue = %queue_name, max_bytes = config.max_bytes, "fetch worker started");

    while !ctx.shutting_down() {
        let payload = match ctx.queue.pop_blocking(&queue_name, POP_TIMEOUT_S).await {
            Ok(Some(payload)) => payload,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "fetch pop failed");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                continue;
            }
        };
        ctx.metrics.incr("worker.fetch_docs.consumed_total").await;
        process(&ctx, &config, &client, &payload).await;
    }
    info!("fetch worker stopped");
}

async fn process(ctx: &PipelineContext, config: &FetchConfig, client: &reqwest::Client, payload: &Value) {
    let queue_name = ctx.queues.fetch_queue.clone();
    let dead_queue = ctx.queues.fetch_dead_queue.clone();
    let env = parse_envelope(payload);

    // url can ride at the top level, inside the wrapped payload, or in the
    // urls map
    let urls = resolve_urls(&env.tender, payload);
    let url: Option<String> = env
        .tender
        .get("url")
        .and_then(|v| v.as_str())
        .map(String::from)
        .or_else(|| payload.get("url").and_then(|v| v.as_str()).map(String::from))
        .or_else(|| urls.get("pncp").and_then(|v| v.as_str()).map(String::from))
        .or_else(|| urls.get("url").and_then(|v| v.as_str()).map(String::from));

    ctx.events
        .log(
            "fetch_docs",
            "consumed",
            env.tender_id.map(|id| id as i32),
            None,
            None,
            Some(&json!({
                "queue": queue_name,
                "id_pncp": env.id_pncp,
                "source": env.source,
                "source_id": env.source_id,
            })),
        )
        .await;
    info!(tender_id = env.tender_id, id_pncp = ?env.id_pncp, url = ?url, "fetch consumed");

    let tender_id = match resolve_tender(ctx, &env, payload).await {
        Ok(Resolution::Resolved(id)) => Some(id),
        Ok(Resolution::Missing) => None,
        Err(db_error) => {
            warn!(error = %db_error, "tender resolution hit unavailable store");
            retry_or_dead(
                ctx,
                "fetch_docs",
                &queue_name,
                &dead_queue,
                payload,
                config.max_retries,
                config.retry_backoff_s,
                "db_unavailable",
                &db_error,
                None,
                None,
            )
            .await;
            return;
        }
    };

    let (Some(tender_id), Some(url)) = (tender_id, url) else {
        // input-shape failure: retrying cannot fix a message with no target
        let _ = ctx
            .queue
            .push_dead(&dead_queue, "missing_tender_or_url", "missing_tender_or_url", payload)
            .await;
        ctx.metrics
            .incr("worker.fetch_docs.missing_tender_or_url_total")
            .await;
        ctx.metrics.incr("worker.fetch_docs.dead_total").await;
        ctx.events
            .log(
                "fetch_docs",
                "dead_missing_tender_or_url",
                None,
                None,
                None,
                Some(&json!({"queue": dead_queue, "id_pncp": env.id_pncp})),
            )
            .await;
        warn!(id_pncp = ?env.id_pncp, "dropping message without tender or url");
        return;
    };

    // detail pages are enumerated into their attached files instead of
    // fetching the HTML shell
    if config.pncp_docs_enabled && url.contains("pncp.gov.br/app/contratacoes") {
        if let Some((cnpj, ano, seq)) = env.id_pncp.as_deref().and_then(parse_pncp_id) {
            let doc_urls = pncp_list_docs(client, config, &cnpj, &ano, &seq).await;
            if !doc_urls.is_empty() {
                let total = doc_urls.len();
                for doc_url in doc_urls {
                    let msg = json!({
                        "tender_id": tender_id,
                        "id_pncp": env.id_pncp,
                        "url": doc_url.clone(),
                        "urls": {"pncp_doc": doc_url},
                        "queued_at": chrono::Utc::now().to_rfc3339(),
                    });
                    if let Err(e) = ctx.queue.push_unbounded(&queue_name, &msg).await {
                        warn!(error = %e, "failed to enqueue enumerated document");
                    }
                }
                info!(tender_id, total, "pncp documents enqueued");
                return;
            }
        }
    }

    let outcome = fetch_url(client, &url, config.max_bytes).await;
    if outcome.error.is_some() || outcome.status.is_none() {
        let error = outcome.error.unwrap_or_else(|| "no_status".to_string());
        ctx.metrics.incr("worker.fetch_docs.error_total").await;
        retry_or_dead(
            ctx,
            "fetch_docs",
            &queue_name,
            &dead_queue,
            payload,
            config.max_retries,
            config.retry_backoff_s,
            "fetch_failed",
            &error,
            Some(tender_id),
            None,
        )
        .await;
        return;
    }

    let sha256 = if outcome.body.is_empty() {
        None
    } else {
        let mut hasher = Sha256::new();
        hasher.update(&outcome.body);
        Some(format!("{:x}", hasher.finalize()))
    };

    if let Some(ref sha) = sha256 {
        match ctx.documents.exists_by_sha(tender_id, sha).await {
            Ok(true) => {
                info!(tender_id, %sha, "duplicate document skipped");
                ctx.metrics.incr("worker.fetch_docs.duplicate_total").await;
                ctx.events
                    .log(
                        "fetch_docs",
                        "duplicate_skip",
                        Some(tender_id),
                        None,
                        None,
                        Some(&json!({"sha256": sha, "url": url})),
                    )
                    .await;
                return;
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "dedupe probe failed, inserting anyway"),
        }
    }

    let size_bytes = outcome.body.len() as i32;
    let truncated = outcome.truncated;
    let http_status = outcome.status;
    let doc = FetchedDocument {
        tender_id,
        url: url.clone(),
        source: env.source.clone().unwrap_or_else(|| "unknown".to_string()),
        http_status,
        content_type: outcome.content_type,
        sha256: sha256.clone(),
        size_bytes,
        truncated,
        headers: outcome.headers.map(|h| h.to_string()),
        body: if outcome.body.is_empty() { None } else { Some(outcome.body) },
        error: None,
    };
    let doc_id = match ctx.documents.insert(doc).await {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "document insert failed");
            ctx.metrics.incr("worker.fetch_docs.error_total").await;
            retry_or_dead(
                ctx,
                "fetch_docs",
                &queue_name,
                &dead_queue,
                payload,
                config.max_retries,
                config.retry_backoff_s,
                "db_unavailable",
                &e.to_string(),
                Some(tender_id),
                None,
            )
            .await;
            return;
        }
    };

    info!(
        doc_id,
        status = ?http_status,
        bytes = size_bytes,
        truncated,
        "fetch ok"
    );
    ctx.metrics.incr("worker.fetch_docs.ok_total").await;
    ctx.events
        .log(
            "fetch_docs",
            "ok",
            Some(tender_id),
            Some(doc_id),
            None,
            Some(&json!({
                "http_status": http_status,
                "size_bytes": size_bytes,
                "truncated": truncated,
            })),
        )
        .await;

    ctx.cache
        .invalidate_path_prefixes(&[format!("/v1/documents/list?tender_id={}", tender_id)])
        .await;

    let msg = json!({
        "document_id": doc_id,
        "tender_id": tender_id,
        "id_pncp": env.id_pncp,
        "url": url,
        "sha256": sha256,
        "queued_at": chrono::Utc::now().to_rfc3339(),
    });
    if let Err(e) = ctx.queue.push_unbounded(&ctx.queues.parse_queue, &msg).await {
        warn!(error = %e, "failed to enqueue parse message");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pncp_id_parses_canonical_format() {
        let (cnpj, ano, seq) = parse_pncp_id("12345678000199-1-000042/2024").unwrap();
        assert_eq!(cnpj, "12345678000199");
        assert_eq!(ano, "2024");
        assert_eq!(seq, "42");
    }

    #[test]
    fn pncp_id_rejects_other_formats() {
        assert!(parse_pncp_id("compras:123").is_none());
        assert!(parse_pncp_id("12345-1-1/2024").is_none());
        assert!(parse_pncp_id("").is_none());
    }
}
