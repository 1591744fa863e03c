//! Parse worker: text extraction, OCR gating, enrichment, artifacts and
//! segment indexing.
//!
//! Pops from the smoke queue ahead of the main queue; a message arriving on
//! the smoke queue runs in smoke mode, which turns off OCR and embeddings
//! and shrinks the text cap so synthetic health checks stay fast.

use std::sync::Arc;

use regex::RegexBuilder;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use super::{retry_or_dead, PipelineContext, POP_TIMEOUT_S};
use crate::config::{NotifyStage, ParseConfig, TriageConfig};
use crate::enrich::{enrich_tender, AgentClient, EmbeddingClient};
use crate::extract::{
    detect_kind, extract_text, segment_text, text_quality, zip_first_pdf, DocKind, OcrEngine,
};
use crate::normalize::fold_accents_lower;
use crate::notify::{Notifier, Subscription};
use crate::repository::models::DocumentRecord;
use crate::repository::{tender_info, NewSegment};

pub struct ParseWorker {
    pub config: ParseConfig,
    pub triage: TriageConfig,
    pub ocr: Arc<OcrEngine>,
    pub agent: Arc<AgentClient>,
    pub embeddings: Arc<EmbeddingClient>,
    pub notifier: Notifier,
}

pub async fn run(ctx: PipelineContext, worker: ParseWorker) {
    let queues = vec![
        ctx.queues.parse_smoke_queue.clone(),
        ctx.queues.parse_queue.clone(),
    ];
    info!(queues = ?queues, max_chars = worker.config.max_chars, "parse worker started");

    while !ctx.shutting_down() {
        let (queue_name, payload) = match ctx.queue.pop_blocking_any(&queues, POP_TIMEOUT_S).await {
            Ok(Some(item)) => item,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "parse pop failed");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                continue;
            }
        };
        ctx.metrics.incr("worker.parse.consumed_total").await;
        let is_smoke = queue_name == ctx.queues.parse_smoke_queue;
        if let Err(error) = process(&ctx, &worker, &payload, is_smoke).await {
            warn!(error = %error, "parse processing failed");
            ctx.metrics.incr("worker.parse.error_total").await;
            let document_id = payload
                .get("document_id")
                .and_then(|v| v.as_i64())
                .map(|id| id as i32);
            retry_or_dead(
                &ctx,
                "parse",
                &queue_name,
                &ctx.queues.parse_dead_queue,
                &payload,
                worker.config.max_retries,
                worker.config.retry_backoff_s,
                "parse_failed",
                &error,
                None,
                document_id,
            )
            .await;
        }
    }
    info!("parse worker stopped");
}

fn post_ocr_gate(config: &ParseConfig, text: &str) -> bool {
    if !config.post_ocr_gate_enabled {
        return true;
    }
    if text.is_empty() {
        return false;
    }
    let text_lower = text.to_lowercase();
    for kw in &config.post_ocr_gate_keywords {
        if text_lower.contains(kw) {
            return true;
        }
    }
    if let Some(ref pattern) = config.post_ocr_gate_regex {
        let matched = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .multi_line(true)
            .build()
            .map(|re| re.is_match(text))
            .unwrap_or(false);
        if matched {
            return true;
        }
    }
    false
}

/// Column-layout heuristic over layout-preserved text: lines with two or
/// more cells separated by wide gaps, grouped into contiguous blocks.
fn extract_tables_from_text(text: &str) -> Vec<Value> {
    let mut tables: Vec<Value> = Vec::new();
    let mut rows: Vec<Vec<String>> = Vec::new();
    for line in text.lines() {
        let cells: Vec<String> = line
            .split("  ")
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        if cells.len() >= 2 {
            rows.push(cells);
        } else {
            if rows.len() >= 2 {
                tables.push(json!({ "page": null, "rows": rows }));
            }
            rows = Vec::new();
        }
    }
    if rows.len() >= 2 {
        tables.push(json!({ "page": null, "rows": rows }));
    }
    tables
}

async fn process(
    ctx: &PipelineContext,
    worker: &ParseWorker,
    payload: &Value,
    is_smoke: bool,
) -> Result<(), String> {
    let config = &worker.config;
    let ocr_active = worker.ocr.config().enabled && !(is_smoke && config.smoke_disable_ocr);
    let embed_active = worker.embeddings.enabled() && !(is_smoke && config.smoke_disable_embeddings);
    let drop_body = config.drop_body || (is_smoke && config.smoke_drop_body);
    let max_chars = if is_smoke {
        config.max_chars.min(config.smoke_max_chars)
    } else {
        config.max_chars
    };

    let document_id = payload.get("document_id").and_then(|v| v.as_i64());
    ctx.events
        .log(
            "parse",
            "consumed",
            None,
            document_id.map(|id| id as i32),
            None,
            Some(&json!({"queue": if is_smoke { &ctx.queues.parse_smoke_queue } else { &ctx.queues.parse_queue }})),
        )
        .await;
    let Some(document_id) = document_id.map(|id| id as i32) else {
        warn!("parse message without document_id");
        ctx.metrics.incr("worker.parse.error_total").await;
        ctx.events
            .log("parse", "error_missing_document_id", None, None, None, None)
            .await;
        return Ok(());
    };

    let Some(row) = ctx
        .documents
        .get(document_id)
        .await
        .map_err(|e| e.to_string())?
    else {
        warn!(document_id, "document not found");
        return Ok(());
    };

    let (text, ocr_used, body_present) = extract_document_text(worker, &row, ocr_active, max_chars).await;
    let quality = text_quality(&text);

    if body_present {
        ctx.documents
            .update_parsed(document_id, &text, quality, ocr_used, drop_body)
            .await
            .map_err(|e| e.to_string())?;
    }

    if !post_ocr_gate(config, &text) {
        ctx.events
            .log(
                "parse",
                "drop_post_ocr_gate",
                Some(row.tender_id),
                Some(row.id),
                None,
                Some(&json!({"reason": "post_ocr_gate"})),
            )
            .await;
        info!(document_id, tender_id = row.tender_id, "dropped by post-ocr gate");
        return Ok(());
    }

    let tender = ctx
        .tenders
        .get(row.tender_id)
        .await
        .unwrap_or(None);

    if !is_smoke && !text.is_empty() {
        if let Some(ref tender) = tender {
            let meta = json!({
                "id_pncp": tender.id_pncp,
                "source": tender.source,
                "source_id": tender.source_id,
                "orgao": tender.orgao,
                "municipio": tender.municipio,
                "uf": tender.uf,
                "modalidade": tender.modalidade,
                "objeto": tender.objeto,
            });
            let existing_labels = tender.materia.is_some() || tender.categoria.is_some();
            enrich_tender(
                &worker.agent,
                &ctx.tenders,
                &ctx.metrics,
                tender.id,
                &text,
                &meta,
                existing_labels,
            )
            .await;
        }

        if worker.notifier.config().stage == NotifyStage::Parse {
            if let Some(ref tender) = tender {
                let info_map = tender_info(tender);
                if allowed_by_triage_lists(&worker.triage, &info_map) {
                    let subs = ctx
                        .users
                        .active_subscriptions(None)
                        .await
                        .unwrap_or_default()
                        .iter()
                        .map(Subscription::from_record)
                        .collect::<Vec<_>>();
                    let sent = worker.notifier.fan_out("parse", &info_map, &subs, None).await;
                    if sent > 0 {
                        ctx.metrics.incr_by("notifier.sent_total", sent as i64).await;
                    }
                }
            }
        }
    }

    if !is_smoke && !text.is_empty() {
        let kind = detect_kind(row.content_type.as_deref(), row.body.as_deref().unwrap_or(&[]));
        if config.table_extract_enabled && kind == DocKind::Pdf {
            let tables = extract_tables_from_text(&text);
            if !tables.is_empty() {
                let _ = ctx
                    .documents
                    .store_artifact(document_id, "tables", &Value::Array(tables))
                    .await;
            }
        }
        if config.doc_convert_enabled {
            let conv = json!({ "markdown": text });
            let _ = ctx.documents.store_artifact(document_id, "doc_convert", &conv).await;
        }
    }

    let segs = segment_text(&text, config.segment_chars, config.segment_overlap);
    if !segs.is_empty() {
        let mut new_segments = Vec::with_capacity(segs.len());
        for (i, seg) in segs.iter().enumerate() {
            let embedding = if embed_active {
                worker
                    .embeddings
                    .embed(seg)
                    .await
                    .and_then(|vec| serde_json::to_string(&vec).ok())
            } else {
                None
            };
            new_segments.push(NewSegment {
                idx: i as i32,
                text: seg.clone(),
                tsv: fold_accents_lower(seg),
                embedding,
            });
        }
        ctx.documents
            .replace_segments(document_id, row.tender_id, new_segments)
            .await
            .map_err(|e| e.to_string())?;
    }

    info!(
        document_id,
        tender_id = row.tender_id,
        chars = text.chars().count(),
        "parse ok"
    );
    ctx.metrics.incr("worker.parse.ok_total").await;
    ctx.events
        .log(
            "parse",
            "ok",
            Some(row.tender_id),
            Some(row.id),
            None,
            Some(&json!({"chars": text.chars().count()})),
        )
        .await;
    Ok(())
}

/// Extraction plus the OCR gate, on the blocking pool — both the secondary
/// extractor and OCR shell out to external tools.
async fn extract_document_text(
    worker: &ParseWorker,
    row: &DocumentRecord,
    ocr_active: bool,
    max_chars: usize,
) -> (String, bool, bool) {
    // body already dropped by a prior parse: reuse the stored text
    if row.body.is_none() {
        if let Some(ref prior) = row.texto_extraido {
            if !prior.is_empty() {
                return (prior.clone(), false, false);
            }
        }
        return (String::new(), false, false);
    }

    let body = row.body.clone().unwrap_or_default();
    let content_type = row.content_type.clone();
    let ocr = worker.ocr.clone();
    let result = tokio::task::spawn_blocking(move || {
        let text = extract_text(&body, content_type.as_deref(), max_chars);
        let quality = text_quality(&text);
        let kind = detect_kind(content_type.as_deref(), &body);
        let gated = matches!(kind, DocKind::Pdf | DocKind::Zip);
        let mut ocr_used = false;
        let mut final_text = text;

        if ocr_active && ocr.should_ocr(gated, &final_text, quality) {
            let mut ocr_body = if kind == DocKind::Zip {
                zip_first_pdf(&body).unwrap_or_default()
            } else {
                body.clone()
            };
            if !ocr_body.is_empty() {
                if let Some(compressed) = ocr.compress_pdf_light(&ocr_body) {
                    ocr_body = compressed;
                }
                let ocr_text = ocr.ocr(&ocr_body, max_chars);
                if !ocr_text.is_empty() {
                    final_text = ocr_text;
                    ocr_used = true;
                }
            }
        }
        (final_text, ocr_used)
    })
    .await;

    match result {
        Ok((text, ocr_used)) => (text, ocr_used, true),
        Err(e) => {
            warn!(error = %e, "extraction task panicked");
            (String::new(), false, true)
        }
    }
}

/// Parse-stage notifications respect the same UF/municipality allowlists as
/// triage.
fn allowed_by_triage_lists(config: &TriageConfig, info: &Map<String, Value>) -> bool {
    let uf = info
        .get("uf")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_uppercase();
    if !config.uf_allowlist.is_empty() && !config.uf_allowlist.contains(&uf) {
        return false;
    }
    if !config.municipio_allowlist.is_empty() {
        let mun = fold_accents_lower(info.get("municipio").and_then(|v| v.as_str()).unwrap_or(""));
        if !mun.is_empty() && !config.municipio_allowlist.contains(&mun) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate_config(keywords: &[&str], regex: Option<&str>, enabled: bool) -> ParseConfig {
        ParseConfig {
            max_chars: 1000,
            drop_body: true,
            segment_chars: 800,
            segment_overlap: 100,
            max_retries: 3,
            retry_backoff_s: 0.0,
            smoke_disable_ocr: true,
            smoke_disable_embeddings: true,
            smoke_drop_body: true,
            smoke_max_chars: 100,
            post_ocr_gate_enabled: enabled,
            post_ocr_gate_keywords: keywords.iter().map(|s| s.to_string()).collect(),
            post_ocr_gate_regex: regex.map(String::from),
            table_extract_enabled: false,
            doc_convert_enabled: false,
        }
    }

    #[test]
    fn gate_disabled_passes_everything() {
        let c = gate_config(&[], None, false);
        assert!(post_ocr_gate(&c, ""));
        assert!(post_ocr_gate(&c, "anything"));
    }

    #[test]
    fn gate_requires_keyword_or_regex() {
        let c = gate_config(&["edital"], Some(r"preg[aã]o"), true);
        assert!(post_ocr_gate(&c, "EDITAL de convocação"));
        assert!(post_ocr_gate(&c, "modalidade pregão"));
        assert!(!post_ocr_gate(&c, "irrelevant text"));
        assert!(!post_ocr_gate(&c, ""));
    }

    #[test]
    fn tables_heuristic_groups_columnar_blocks() {
        let text = "Item  Quantidade  Valor\n01  10  5,00\n02  20  9,00\nprose line here\n";
        let tables = extract_tables_from_text(text);
        assert_eq!(tables.len(), 1);
        let rows = tables[0]["rows"].as_array().unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0][0], "Item");
    }

    #[test]
    fn tables_heuristic_ignores_prose() {
        let tables = extract_tables_from_text("just a paragraph\nwith lines\n");
        assert!(tables.is_empty());
    }
}
