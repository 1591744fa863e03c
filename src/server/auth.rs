//! Authentication, fixed-window rate limiting and request metrics.

use std::time::Instant;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use redis::AsyncCommands;

use super::AppState;

fn extract_api_key(req: &Request) -> Option<String> {
    if let Some(key) = req.headers().get("x-api-key").and_then(|v| v.to_str().ok()) {
        let key = key.trim();
        if !key.is_empty() {
            return Some(key.to_string());
        }
    }
    let auth = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())?;
    let (scheme, rest) = auth.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") {
        let key = rest.trim();
        if !key.is_empty() {
            return Some(key.to_string());
        }
    }
    None
}

/// Fixed-window counter: `ratelimit:v1:<key>:<minute>` with a 2-minute TTL.
/// Store failures admit the request.
async fn rate_limit_ok(state: &AppState, key: &str) -> bool {
    if !state.config.rate_limit_enabled {
        return true;
    }
    if state.config.rate_limit_bypass_keys.iter().any(|k| k == key) {
        return true;
    }
    let bucket = chrono::Utc::now().timestamp() / 60;
    let rate_key = format!("ratelimit:v1:{}:{}", key, bucket);
    let res: redis::RedisResult<i64> = async {
        let mut conn = state.redis.get_multiplexed_async_connection().await?;
        let count: i64 = conn.incr(&rate_key, 1).await?;
        let _: bool = conn.expire(&rate_key, 120).await?;
        Ok(count)
    }
    .await;
    match res {
        Ok(count) => count <= state.config.rate_limit_rpm,
        Err(_) => true,
    }
}

fn plain(status: StatusCode, body: &'static str) -> Response {
    Response::builder()
        .status(status)
        .body(Body::from(body))
        .unwrap_or_default()
}

pub async fn auth_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if !state.config.auth_required {
        return next.run(req).await;
    }
    let path = req.uri().path().to_string();
    if state.config.public_paths.iter().any(|p| p == &path) {
        return next.run(req).await;
    }
    let Some(key) = extract_api_key(&req) else {
        return plain(StatusCode::UNAUTHORIZED, "unauthorized");
    };
    if !state.config.api_keys.contains(&key) {
        return plain(StatusCode::UNAUTHORIZED, "unauthorized");
    }
    if !rate_limit_ok(&state, &key).await {
        return plain(StatusCode::TOO_MANY_REQUESTS, "rate_limited");
    }
    next.run(req).await
}

pub async fn metrics_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let started = Instant::now();
    let route = req.uri().path().to_string();
    let response = next.run(req).await;
    let status = response.status().as_u16();
    let elapsed_ms = started.elapsed().as_millis() as f64;

    state.metrics.incr("api.requests_total").await;
    if status >= 500 {
        state.metrics.incr("api.errors_5xx_total").await;
    } else if status >= 400 {
        state.metrics.incr("api.errors_4xx_total").await;
    }
    state.metrics.set_gauge("api.last_request_ms", elapsed_ms).await;
    state
        .metrics
        .observe_histogram("api.request_duration_ms", elapsed_ms)
        .await;
    state
        .metrics
        .incr_labeled(
            "api.requests_by_route_total",
            &[
                ("route".to_string(), route),
                ("status".to_string(), status.to_string()),
            ],
        )
        .await;
    response
}
