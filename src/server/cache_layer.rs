//! Response-cache middleware with single-flight fills.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{HeaderValue, CONTENT_TYPE, SET_COOKIE};
use axum::middleware::Next;
use axum::response::Response;

use super::AppState;
use crate::cache::CachedResponse;

fn header_str(req: &Request, name: &str) -> String {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

fn query_pairs(req: &Request) -> Vec<(String, String)> {
    let raw = req.uri().query().unwrap_or("");
    url::form_urlencoded::parse(raw.as_bytes())
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn bypass(req: &Request, pairs: &[(String, String)]) -> bool {
    if req.method() != axum::http::Method::GET {
        return true;
    }
    for header in ["x-cache-bypass", "authorization", "cookie"] {
        let value = header_str(req, header);
        if header == "x-cache-bypass" {
            if matches!(value.as_str(), "1" | "true" | "True") {
                return true;
            }
        } else if !value.is_empty() {
            return true;
        }
    }
    pairs
        .iter()
        .any(|(k, v)| k == "cache" && matches!(v.as_str(), "0" | "false"))
}

fn respond(cached: CachedResponse, cache_state: &'static str) -> Response {
    let mut builder = Response::builder().status(cached.status);
    if let Some(ref ct) = cached.content_type {
        builder = builder.header(CONTENT_TYPE, ct);
    }
    builder = builder.header("x-cache", cache_state);
    builder.body(Body::from(cached.body)).unwrap_or_default()
}

pub async fn cache_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let pairs = query_pairs(&req);
    if !state.cache.enabled() || bypass(&req, &pairs) {
        return next.run(req).await;
    }

    let key = state.cache.key(
        req.method().as_str(),
        req.uri().path(),
        &pairs,
        &header_str(&req, "accept"),
        &header_str(&req, "accept-language"),
    );
    let path = req.uri().path().to_string();

    if let Some(cached) = state.cache.get(&key).await {
        state.cache.incr_metric("hit").await;
        return respond(cached, "hit");
    }
    state.cache.incr_metric("miss").await;

    let lock_acquired = state.cache.try_lock(&key).await;
    if !lock_acquired {
        // someone else is filling; wait them out and re-read
        if let Some(filled) = state.cache.wait_for_fill(&key).await {
            state.cache.incr_metric("hit").await;
            return respond(filled, "hit");
        }
    }

    let response = next.run(req).await;
    let (parts, body) = response.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .unwrap_or_default();

    if lock_acquired {
        let content_type = parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let has_set_cookie = parts.headers.contains_key(SET_COOKIE);
        let skip = parts
            .headers
            .get("x-cache-skip")
            .and_then(|v| v.to_str().ok())
            .map(|v| matches!(v, "1" | "true" | "True"))
            .unwrap_or(false);
        if state.cache.should_store(
            parts.status.as_u16(),
            content_type.as_deref(),
            has_set_cookie,
            bytes.len(),
            skip,
        ) {
            let cached = CachedResponse {
                status: parts.status.as_u16(),
                content_type,
                body: bytes.to_vec(),
            };
            state.cache.store(&key, &path, &cached).await;
        }
        state.cache.release_lock(&key).await;
    }

    let mut response = Response::from_parts(parts, Body::from(bytes));
    response
        .headers_mut()
        .insert("x-cache", HeaderValue::from_static("miss"));
    response
}
