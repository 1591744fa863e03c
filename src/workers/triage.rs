//! Triage worker: score, gate, notify, route to fetch.

use serde_json::{json, Map, Value};
use tracing::{info, warn};

use super::envelope::{parse_envelope, resolve_urls};
use super::{retry_or_dead, PipelineContext, POP_TIMEOUT_S};
use crate::config::{NotifyStage, TriageConfig};
use crate::normalize::fold_accents_lower;
use crate::notify::{pick_url, Notifier, Subscription};
use crate::repository::tender_info;
use crate::triage::score_tender;

pub async fn run(ctx: PipelineContext, config: TriageConfig, notifier: Notifier) {
    let queue_name = ctx.queues.triage_queue.clone();
    info!(queue = %queue_name, "triage worker started");

    while !ctx.shutting_down() {
        let payload = match ctx.queue.pop_blocking(&queue_name, POP_TIMEOUT_S).await {
            Ok(Some(payload)) => payload,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "triage pop failed");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                continue;
            }
        };

        ctx.metrics.incr("worker.triage.consumed_total").await;
        if let Err(error) = process(&ctx, &config, &notifier, &payload).await {
            warn!(error = %error, "triage processing failed");
            ctx.metrics.incr("worker.triage.error_total").await;
            let env = parse_envelope(&payload);
            retry_or_dead(
                &ctx,
                "triage",
                &queue_name,
                &ctx.queues.triage_dead_queue,
                &payload,
                config.max_retries,
                config.retry_backoff_s,
                "triage_failed",
                &error,
                env.tender_id.map(|id| id as i32),
                None,
            )
            .await;
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
    }
    info!("triage worker stopped");
}

async fn process(
    ctx: &PipelineContext,
    config: &TriageConfig,
    notifier: &Notifier,
    payload: &Value,
) -> Result<(), String> {
    let env = parse_envelope(payload);
    let mut info_map: Map<String, Value> = env.tender.clone();

    ctx.events
        .log(
            "triage",
            "consumed",
            env.tender_id.map(|id| id as i32),
            None,
            None,
            Some(&json!({"queue": ctx.queues.triage_queue, "id_pncp": env.id_pncp})),
        )
        .await;

    // complete missing fields from the store when identifiers resolve
    let record = if let Some(id) = env.tender_id {
        ctx.tenders.get(id as i32).await.unwrap_or(None)
    } else if let Some(ref id_pncp) = env.id_pncp {
        ctx.tenders.get_by_id_pncp(id_pncp).await.unwrap_or(None)
    } else if let (Some(ref source), Some(ref source_id)) = (env.source.clone(), env.source_id.clone()) {
        ctx.tenders.get_by_source(source, source_id).await.unwrap_or(None)
    } else {
        None
    };
    if let Some(ref record) = record {
        for (k, v) in tender_info(record) {
            info_map.insert(k, v);
        }
    }

    let (score, reasons) = score_tender(&info_map);
    let tender_id = info_map
        .get("id")
        .and_then(|v| v.as_i64())
        .or(env.tender_id);

    let uf = info_map
        .get("uf")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_uppercase();
    if !config.uf_allowlist.is_empty() && !config.uf_allowlist.contains(&uf) && !env.force_fetch {
        ctx.events
            .log(
                "triage",
                "drop_uf_allowlist",
                tender_id.map(|id| id as i32),
                None,
                None,
                Some(&json!({"uf": uf, "allowlist": config.uf_allowlist})),
            )
            .await;
        info!(tender_id, %uf, "dropped by uf allowlist");
        return Ok(());
    }
    if !config.municipio_allowlist.is_empty() && !env.force_fetch {
        let mun_norm = fold_accents_lower(
            info_map
                .get("municipio")
                .and_then(|v| v.as_str())
                .unwrap_or(""),
        );
        if !mun_norm.is_empty() && !config.municipio_allowlist.contains(&mun_norm) {
            ctx.events
                .log(
                    "triage",
                    "drop_municipio_allowlist",
                    tender_id.map(|id| id as i32),
                    None,
                    None,
                    Some(&json!({
                        "municipio": info_map.get("municipio"),
                        "allowlist": config.municipio_allowlist,
                    })),
                )
                .await;
            info!(tender_id, municipio = %mun_norm, "dropped by municipio allowlist");
            return Ok(());
        }
    }

    info!(tender_id, score, ?reasons, "triage consumed");

    if notifier.config().stage == NotifyStage::Triage {
        let subs = ctx
            .users
            .active_subscriptions(None)
            .await
            .unwrap_or_default()
            .iter()
            .map(Subscription::from_record)
            .collect::<Vec<_>>();
        let sent = notifier.fan_out("triage", &info_map, &subs, Some(score)).await;
        if sent > 0 {
            ctx.metrics.incr_by("notifier.sent_total", sent as i64).await;
        }
    }

    let urls = resolve_urls(&info_map, payload);
    let picked = pick_url(&urls);

    if (env.force_fetch || score >= config.min_score) && picked.is_some() {
        let pncp_url = urls.get("pncp").and_then(|v| v.as_str()).map(String::from);
        let fetch_payload = json!({
            "force_fetch": env.force_fetch,
            "tender_id": tender_id,
            "id_pncp": info_map.get("id_pncp").and_then(|v| v.as_str()).or(env.id_pncp.as_deref()),
            "source": info_map.get("source").and_then(|v| v.as_str()).or(env.source.as_deref()),
            "source_id": info_map.get("source_id").and_then(|v| v.as_str()).or(env.source_id.as_deref()),
            "urls": urls,
            "score": score,
            "reasons": reasons,
            "url": pncp_url.or(picked),
            "queued_at": chrono::Utc::now().to_rfc3339(),
        });
        ctx.queue
            .push_unbounded(&ctx.queues.fetch_queue, &fetch_payload)
            .await
            .map_err(|e| e.to_string())?;
        ctx.metrics.incr("worker.triage.enqueued_fetch_total").await;
        ctx.events
            .log(
                "triage",
                "enqueued_fetch",
                tender_id.map(|id| id as i32),
                None,
                None,
                Some(&json!({"queue": ctx.queues.fetch_queue, "score": score})),
            )
            .await;
        info!(tender_id, queue = %ctx.queues.fetch_queue, "enqueued for fetch");
    }
    Ok(())
}
