//! Route handlers.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::AppState;
use crate::normalize::fold_accents_lower;
use crate::queue::QueueError;
use crate::repository::models::SubscriptionRecord;
use crate::repository::{prepare_payload, run_blocking, SavedTender, UserUpsert};

pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    fn internal(detail: impl std::fmt::Display) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, detail.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/ingest/tender", post(ingest_tender))
        .route("/v1/tenders/upsert", post(tenders_upsert))
        .route("/v1/users/upsert", post(users_upsert))
        .route("/v1/users/follow", post(users_follow))
        .route("/v1/users/unfollow", post(users_unfollow))
        .route("/v1/subscriptions/list", get(subscriptions_list))
        .route("/v1/subscriptions/create", post(subscriptions_create))
        .route("/v1/subscriptions/update", post(subscriptions_update))
        .route("/v1/subscriptions/pause_all", post(subscriptions_pause_all))
        .route("/v1/subscriptions/set_frequency", post(subscriptions_set_frequency))
        .route("/v1/segments/search", post(segments_search))
        .route("/v1/insights/summary", post(insights_summary))
        .route("/v1/insights/extract", post(insights_extract))
        .route("/v1/insights/checklist", post(insights_checklist))
        .route("/v1/insights/qa", post(insights_qa))
        .route("/health", get(health))
        .route("/health/cache", get(health_cache))
        .route("/health/queue", get(health_queue))
        .route("/metrics", get(metrics_prometheus))
        .route("/metrics/basic", get(metrics_basic))
        .with_state(state)
}

fn truthy(v: Option<&Value>) -> bool {
    match v {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().map(|i| i != 0).unwrap_or(false),
        Some(Value::String(s)) => matches!(s.to_lowercase().as_str(), "true" | "1" | "yes"),
        _ => false,
    }
}

/// Shared upsert front half: prepare, validate, write.
async fn do_upsert(
    state: &AppState,
    raw: &Map<String, Value>,
) -> Result<(SavedTender, Map<String, Value>), ApiError> {
    let mut input = raw.clone();
    input.remove("force_fetch");
    let source_payload = input.remove("source_payload");
    let prepared = prepare_payload(&input);
    let id_ok = prepared
        .get("id_pncp")
        .and_then(|v| v.as_str())
        .map(|s| s.len() >= 3)
        .unwrap_or(false);
    if !id_ok {
        return Err(ApiError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "id_pncp is required (min length 3)",
        ));
    }
    let saved = state
        .tenders
        .upsert(&prepared, source_payload.as_ref())
        .await
        .map_err(ApiError::internal)?;
    Ok((saved, prepared))
}

async fn ingest_tender(State(state): State<AppState>, Json(body): Json<Value>) -> ApiResult {
    let raw = body
        .as_object()
        .cloned()
        .ok_or_else(|| ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, "expected a JSON object"))?;
    let (saved, prepared) = do_upsert(&state, &raw).await?;

    let force_fetch = truthy(raw.get("force_fetch"));
    let mut queue_payload = prepared;
    if force_fetch {
        queue_payload.insert("force_fetch".to_string(), json!(true));
    }
    if let Some(sp) = raw.get("source_payload") {
        queue_payload.insert("source_payload".to_string(), sp.clone());
    }

    let message = json!({
        "tender_id": saved.id,
        "id_pncp": saved.id_pncp,
        "source": saved.source,
        "source_id": saved.source_id,
        "force_fetch": force_fetch,
        "payload": queue_payload,
        "queued_at": chrono::Utc::now().to_rfc3339(),
    });
    match state.queue.push(&state.queues.triage_queue, &message).await {
        Ok(()) => {}
        Err(QueueError::Full) => {
            state.metrics.incr("api.ingest.queue_full_total").await;
            return Err(ApiError::new(StatusCode::TOO_MANY_REQUESTS, "queue_full"));
        }
        Err(e) => {
            state.metrics.incr("api.ingest.error_total").await;
            return Err(ApiError::internal(e));
        }
    }
    state.metrics.incr("api.ingest.queued_total").await;

    Ok(Json(json!({
        "ok": true,
        "queued": state.queues.triage_queue,
        "tender": saved.to_json(),
        "force_fetch": force_fetch,
    })))
}

async fn tenders_upsert(State(state): State<AppState>, Json(body): Json<Value>) -> ApiResult {
    let raw = body
        .as_object()
        .cloned()
        .ok_or_else(|| ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, "expected a JSON object"))?;
    let (saved, _) = do_upsert(&state, &raw).await?;
    state
        .cache
        .invalidate_path_prefixes(&["/v1/tenders".to_string()])
        .await;
    Ok(Json(saved.to_json()))
}

#[derive(Deserialize)]
struct UserIn {
    telegram_user_id: i64,
    username: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    language_code: Option<String>,
}

async fn users_upsert(State(state): State<AppState>, Json(body): Json<UserIn>) -> ApiResult {
    if body.telegram_user_id < 1 {
        return Err(ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, "invalid telegram_user_id"));
    }
    let record = state
        .users
        .upsert_user(UserUpsert {
            telegram_user_id: body.telegram_user_id,
            username: body.username,
            first_name: body.first_name,
            last_name: body.last_name,
            language_code: body.language_code,
        })
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(json!({
        "id": record.id,
        "telegram_user_id": record.telegram_user_id,
        "username": record.username,
        "first_name": record.first_name,
        "last_name": record.last_name,
        "language_code": record.language_code,
        "created_at": record.created_at,
        "updated_at": record.updated_at,
    })))
}

#[derive(Deserialize)]
struct FollowIn {
    telegram_user_id: i64,
    tender_id: i32,
}

async fn find_user(state: &AppState, telegram_user_id: i64) -> Result<i32, ApiError> {
    state
        .users
        .find_by_telegram_id(telegram_user_id)
        .await
        .map_err(ApiError::internal)?
        .map(|u| u.id)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "user_not_found"))
}

async fn users_follow(State(state): State<AppState>, Json(body): Json<FollowIn>) -> ApiResult {
    let user_id = find_user(&state, body.telegram_user_id).await?;
    state
        .users
        .follow(user_id, body.tender_id)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(json!({ "ok": true })))
}

async fn users_unfollow(State(state): State<AppState>, Json(body): Json<FollowIn>) -> ApiResult {
    let user_id = find_user(&state, body.telegram_user_id).await?;
    state
        .users
        .unfollow(user_id, body.tender_id)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(json!({ "ok": true })))
}

fn subscription_json(record: &SubscriptionRecord) -> Value {
    let filters: Value = serde_json::from_str(&record.filters).unwrap_or(Value::Null);
    let delivery: Value = serde_json::from_str(&record.delivery).unwrap_or(Value::Null);
    json!({
        "id": record.id,
        "user_id": record.user_id,
        "filters": filters,
        "delivery": delivery,
        "frequency": record.frequency,
        "is_active": record.is_active != 0,
        "created_at": record.created_at,
        "updated_at": record.updated_at,
    })
}

#[derive(Deserialize)]
struct ListParams {
    telegram_user_id: i64,
}

async fn subscriptions_list(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult {
    let user = state
        .users
        .find_by_telegram_id(params.telegram_user_id)
        .await
        .map_err(ApiError::internal)?;
    let Some(user) = user else {
        return Ok(Json(json!({ "items": [] })));
    };
    let subs = state
        .users
        .list_subscriptions(user.id)
        .await
        .map_err(ApiError::internal)?;
    let items: Vec<Value> = subs.iter().map(subscription_json).collect();
    Ok(Json(json!({ "items": items })))
}

async fn invalidate_subscription_list(state: &AppState, telegram_user_id: i64) {
    state
        .cache
        .invalidate_path_prefixes(&[format!(
            "/v1/subscriptions/list?telegram_user_id={}",
            telegram_user_id
        )])
        .await;
}

#[derive(Deserialize)]
struct SubscriptionCreateIn {
    telegram_user_id: i64,
    #[serde(default)]
    filters: Option<Value>,
    #[serde(default)]
    delivery: Option<Value>,
    #[serde(default)]
    frequency: Option<String>,
}

async fn subscriptions_create(
    State(state): State<AppState>,
    Json(body): Json<SubscriptionCreateIn>,
) -> ApiResult {
    let user_id = find_user(&state, body.telegram_user_id).await?;
    let filters = body.filters.unwrap_or_else(|| json!({}));
    let delivery = body
        .delivery
        .unwrap_or_else(|| json!({"pv": true, "channel": true}));
    let frequency = body.frequency.unwrap_or_else(|| "realtime".to_string());
    let record = state
        .users
        .create_subscription(
            user_id,
            &filters.to_string(),
            &delivery.to_string(),
            &frequency,
        )
        .await
        .map_err(ApiError::internal)?;
    invalidate_subscription_list(&state, body.telegram_user_id).await;
    Ok(Json(subscription_json(&record)))
}

#[derive(Deserialize)]
struct SubscriptionUpdateIn {
    id: i32,
    #[serde(default)]
    filters: Option<Value>,
    #[serde(default)]
    delivery: Option<Value>,
    #[serde(default)]
    frequency: Option<String>,
    #[serde(default)]
    is_active: Option<bool>,
}

async fn subscriptions_update(
    State(state): State<AppState>,
    Json(body): Json<SubscriptionUpdateIn>,
) -> ApiResult {
    let record = state
        .users
        .update_subscription(
            body.id,
            body.filters.map(|v| v.to_string()),
            body.delivery.map(|v| v.to_string()),
            body.frequency,
            body.is_active,
        )
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "not_found"))?;
    state
        .cache
        .invalidate_path_prefixes(&["/v1/subscriptions/list".to_string()])
        .await;
    Ok(Json(subscription_json(&record)))
}

#[derive(Deserialize)]
struct PauseAllIn {
    telegram_user_id: i64,
    #[serde(default = "default_true")]
    is_active: bool,
}

fn default_true() -> bool {
    true
}

async fn subscriptions_pause_all(
    State(state): State<AppState>,
    Json(body): Json<PauseAllIn>,
) -> ApiResult {
    let user_id = find_user(&state, body.telegram_user_id).await?;
    state
        .users
        .set_all_active(user_id, body.is_active)
        .await
        .map_err(ApiError::internal)?;
    invalidate_subscription_list(&state, body.telegram_user_id).await;
    Ok(Json(json!({ "ok": true, "is_active": body.is_active })))
}

#[derive(Deserialize)]
struct SetFrequencyIn {
    telegram_user_id: i64,
    frequency: String,
}

async fn subscriptions_set_frequency(
    State(state): State<AppState>,
    Json(body): Json<SetFrequencyIn>,
) -> ApiResult {
    if body.frequency.len() < 3 {
        return Err(ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, "invalid frequency"));
    }
    let user_id = find_user(&state, body.telegram_user_id).await?;
    state
        .users
        .set_frequency(user_id, &body.frequency)
        .await
        .map_err(ApiError::internal)?;
    invalidate_subscription_list(&state, body.telegram_user_id).await;
    Ok(Json(json!({ "ok": true, "frequency": body.frequency })))
}

#[derive(Deserialize)]
struct SegmentsSearchIn {
    q: String,
    #[serde(default)]
    tender_id: Option<i32>,
    #[serde(default)]
    limit: Option<i64>,
}

async fn segments_search(
    State(state): State<AppState>,
    Json(body): Json<SegmentsSearchIn>,
) -> ApiResult {
    let q = fold_accents_lower(body.q.trim());
    if q.is_empty() {
        return Err(ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, "empty query"));
    }
    let limit = body.limit.unwrap_or(20).clamp(1, 100);
    let segments = state
        .documents
        .search_segments(&q, body.tender_id, limit)
        .await
        .map_err(ApiError::internal)?;
    let items: Vec<Value> = segments
        .iter()
        .map(|s| {
            json!({
                "id": s.id,
                "document_id": s.document_id,
                "tender_id": s.tender_id,
                "idx": s.idx,
                "text": s.text,
            })
        })
        .collect();
    Ok(Json(json!({ "items": items })))
}

#[derive(Deserialize)]
struct InsightSummaryIn {
    tender_id: i32,
    #[serde(default)]
    limit: Option<i64>,
}

#[derive(Deserialize)]
struct InsightChecklistIn {
    tender_id: i32,
}

#[derive(Deserialize)]
struct InsightQaIn {
    tender_id: i32,
    question: String,
    #[serde(default)]
    limit: Option<i64>,
}

/// Bullets out of the oracle's JSON, when the anchored patterns found
/// nothing; errors and malformed output just fall through.
async fn oracle_bullets(state: &AppState, tender_id: i32, raw: &str) -> Vec<String> {
    if !state.agent.config().enabled {
        return Vec::new();
    }
    let meta = json!({"insight": "summary"});
    let Ok(result) = state.agent.ask(tender_id, raw, &meta).await else {
        return Vec::new();
    };
    let lines: Vec<String> = result
        .get("bullets")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.trim_start_matches(['-', '•']).trim())
                .filter(|s| !s.is_empty())
                .map(|s| s.chars().take(220).collect())
                .take(10)
                .collect()
        })
        .unwrap_or_default();
    // a single giant block is a failed summarization, not bullets
    if lines.len() == 1 && lines[0].chars().count() > 300 {
        return Vec::new();
    }
    lines
}

async fn insights_summary(
    State(state): State<AppState>,
    Json(body): Json<InsightSummaryIn>,
) -> ApiResult {
    let limit = body.limit.unwrap_or(8).clamp(3, 20);
    // prefer segments carrying summary signals (objeto/valor/datas...)
    let mut rows = state
        .documents
        .segments_with_signals(body.tender_id, limit)
        .await
        .map_err(ApiError::internal)?;
    if rows.is_empty() {
        rows = state
            .documents
            .segments_for_tender(body.tender_id, limit)
            .await
            .map_err(ApiError::internal)?;
    }
    let raw = rows
        .iter()
        .take(6)
        .map(|r| r.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    let fields = crate::insights::extract_structured(&raw);
    let mut bullets: Vec<String> = Vec::new();
    let mut push_field = |label: &str, value: &Option<String>| {
        if let Some(v) = value {
            bullets.push(format!("{}: {}", label, v));
        }
    };
    push_field("Objeto", &fields.objeto);
    push_field("Valor", &fields.valor);
    push_field("Sessao", &fields.sessao);
    push_field("Prazo proposta", &fields.prazo_proposta);
    push_field("Modalidade", &fields.modalidade);
    push_field("Orgao", &fields.orgao);

    if bullets.is_empty() {
        bullets = oracle_bullets(&state, body.tender_id, &raw).await;
    }
    if !bullets.is_empty() && !crate::insights::summary_looks_useful(&bullets) {
        bullets.clear();
    }
    if bullets.is_empty() {
        bullets = crate::insights::heuristic_summary(&raw);
    }
    if bullets.is_empty() {
        // lean fallback instead of dumping raw text
        bullets = rows
            .iter()
            .map(|r| crate::insights::first_line_short(&r.text, 220))
            .filter(|l| !l.is_empty())
            .collect();
    }

    let quality = state
        .documents
        .tender_quality(body.tender_id)
        .await
        .map_err(ApiError::internal)?;
    let confidence =
        crate::insights::summary_confidence(fields.field_hits(), quality.avg_quality, quality.max_chars);
    Ok(Json(json!({
        "tender_id": body.tender_id,
        "bullets": bullets,
        "confidence": confidence,
        "quality": quality.to_json(),
    })))
}

async fn insights_extract(
    State(state): State<AppState>,
    Json(body): Json<InsightSummaryIn>,
) -> ApiResult {
    let limit = body.limit.unwrap_or(8).clamp(3, 20);
    let rows = state
        .documents
        .segments_with_signals(body.tender_id, limit)
        .await
        .map_err(ApiError::internal)?;
    let raw = rows
        .iter()
        .map(|r| r.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    let fields = crate::insights::extract_structured(&raw);
    let quality = state
        .documents
        .tender_quality(body.tender_id)
        .await
        .map_err(ApiError::internal)?;
    let confidence =
        crate::insights::summary_confidence(fields.field_hits(), quality.avg_quality, quality.max_chars);
    Ok(Json(json!({
        "tender_id": body.tender_id,
        "fields": fields.to_json(),
        "confidence": confidence,
        "quality": quality.to_json(),
    })))
}

async fn insights_checklist(
    State(_state): State<AppState>,
    Json(body): Json<InsightChecklistIn>,
) -> ApiResult {
    // baseline checklist; extraction-driven items come later
    Ok(Json(json!({
        "tender_id": body.tender_id,
        "items": crate::insights::checklist_items(),
    })))
}

async fn insights_qa(State(state): State<AppState>, Json(body): Json<InsightQaIn>) -> ApiResult {
    if body.question.trim().chars().count() < 3 {
        return Err(ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, "question too short"));
    }
    let limit = body.limit.unwrap_or(5).clamp(1, 10);
    let question_l = body.question.to_lowercase();

    // targeted patterns for the common question families
    let pattern = if question_l.contains("sess") && question_l.contains("data") {
        Some("%data da sess%")
    } else if question_l.contains("valor") {
        Some("%valor%estimado%")
    } else if question_l.contains("objeto") {
        Some("%objeto%")
    } else {
        None
    };
    let mut rows = match pattern {
        Some(pattern) => state
            .documents
            .segments_matching_pattern(body.tender_id, pattern, limit)
            .await
            .map_err(ApiError::internal)?,
        None => Vec::new(),
    };
    let targeted = rows.len();

    if rows.is_empty() {
        // fall back to word matches over the folded column
        let stopwords = ["qual", "quais", "quando", "onde", "como", "para", "pelo", "pela"];
        let words: Vec<String> = fold_accents_lower(&body.question)
            .split_whitespace()
            .map(String::from)
            .filter(|w| w.chars().count() > 3 && !stopwords.contains(&w.as_str()))
            .collect();
        for word in words {
            let more = state
                .documents
                .segments_matching_pattern(body.tender_id, &format!("%{}%", word), limit)
                .await
                .map_err(ApiError::internal)?;
            for seg in more {
                if rows.iter().all(|r| r.id != seg.id) {
                    rows.push(seg);
                }
            }
            if rows.len() as i64 >= limit {
                break;
            }
        }
        rows.truncate(limit as usize);
    }

    if rows.is_empty() {
        return Ok(Json(json!({
            "tender_id": body.tender_id,
            "answer": "Não encontrei trechos relevantes.",
            "evidence": [],
        })));
    }

    let evidence: Vec<Value> = rows
        .iter()
        .enumerate()
        .map(|(i, s)| {
            json!({
                "id": s.id,
                "document_id": s.document_id,
                "tender_id": s.tender_id,
                "idx": s.idx,
                "text": s.text,
                "score": if i < targeted { json!(1.0) } else { Value::Null },
            })
        })
        .collect();
    let texts: Vec<String> = rows.iter().map(|s| s.text.clone()).collect();

    let mut answer = crate::insights::heuristic_answer(&body.question, &texts);
    if answer.is_none() && state.agent.config().enabled {
        // oracle as secondary fallback over the gathered evidence
        let joined = texts
            .iter()
            .take(3)
            .map(|t| t.chars().take(400).collect::<String>())
            .collect::<Vec<_>>()
            .join("\n\n---\n\n");
        let meta = json!({"insight": "qa", "question": body.question});
        if let Ok(result) = state.agent.ask(body.tender_id, &joined, &meta).await {
            answer = result
                .get("answer")
                .and_then(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty());
        }
    }
    let answer =
        answer.unwrap_or_else(|| "Encontrei trechos relacionados. Revise os destaques abaixo.".to_string());

    Ok(Json(json!({
        "tender_id": body.tender_id,
        "answer": answer,
        "evidence": evidence,
    })))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let mut checks = Map::new();
    let mut ok = true;

    let db = run_blocking(state.pool.clone(), |conn| {
        use diesel::prelude::*;
        diesel::sql_query("SELECT 1").execute(conn)?;
        Ok(())
    })
    .await;
    match db {
        Ok(()) => {
            checks.insert("db".to_string(), json!("ok"));
        }
        Err(e) => {
            checks.insert("db".to_string(), json!(format!("error:{}", e)));
            ok = false;
        }
    }

    let redis_ok: redis::RedisResult<String> = async {
        let mut conn = state.redis.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async(&mut conn).await
    }
    .await;
    match redis_ok {
        Ok(_) => {
            checks.insert("redis".to_string(), json!("ok"));
        }
        Err(e) => {
            checks.insert("redis".to_string(), json!(format!("error:{}", e)));
            ok = false;
        }
    }

    Json(json!({ "ok": ok, "checks": checks }))
}

async fn health_cache(State(state): State<AppState>) -> Json<Value> {
    Json(state.cache.metrics().await)
}

async fn health_queue(State(state): State<AppState>) -> Json<Value> {
    let lengths = state.metrics.get_queue_lengths(&state.queues.metrics_list()).await;
    Json(serde_json::to_value(lengths).unwrap_or_else(|_| json!({})))
}

async fn metrics_basic(State(state): State<AppState>) -> Json<Value> {
    Json(state.metrics.snapshot_basic(&state.queues.metrics_list()).await)
}

async fn metrics_prometheus(State(state): State<AppState>) -> Response {
    let body = state
        .metrics
        .render_prometheus(&state.queues.metrics_list())
        .await;
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}
