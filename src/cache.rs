//! Shared HTTP response cache with single-flight fills.
//!
//! Keys vary on method, path, sorted query string and the two
//! representation headers. Only small JSON 200s are stored. Concurrent
//! misses on one key coalesce behind a SET-NX lock: the holder fills the
//! cache, waiters sleep a bounded interval and re-read. Store failures fail
//! open — the request is served uncached.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use redis::AsyncCommands;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::CacheConfig;

/// Stored response envelope.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Clone)]
pub struct CacheStore {
    client: redis::Client,
    config: CacheConfig,
    /// Longest-prefix TTL overrides parsed from the config map.
    ttl_prefixes: Vec<(String, u64)>,
}

/// Sorted `k=v` joined by `&`; the canonical query-string form.
pub fn normalize_query(pairs: &[(String, String)]) -> String {
    let mut items: Vec<(String, String)> = pairs.to_vec();
    items.sort();
    items
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

impl CacheStore {
    pub fn new(redis_url: &str, config: CacheConfig) -> redis::RedisResult<Self> {
        let ttl_prefixes = config
            .ttl_map
            .as_deref()
            .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
            .and_then(|v| v.as_object().cloned())
            .map(|map| {
                map.iter()
                    .filter_map(|(prefix, ttl)| ttl.as_u64().map(|t| (prefix.clone(), t.max(1))))
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            config,
            ttl_prefixes,
        })
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    async fn conn(&self) -> redis::RedisResult<redis::aio::MultiplexedConnection> {
        self.client.get_multiplexed_async_connection().await
    }

    /// Derive the cache key for a GET-shaped request.
    pub fn key(
        &self,
        method: &str,
        path: &str,
        query_pairs: &[(String, String)],
        accept: &str,
        accept_language: &str,
    ) -> String {
        format!(
            "{}:{}:{}?{}|a={}|l={}",
            self.config.prefix,
            method.to_uppercase(),
            path,
            normalize_query(query_pairs),
            accept.to_lowercase(),
            accept_language.to_lowercase(),
        )
    }

    fn lock_key(key: &str) -> String {
        format!("{}:lock", key)
    }

    /// Per-path TTL; longest configured prefix wins, else the global default.
    pub fn ttl_for_path(&self, path: &str) -> u64 {
        let mut best: Option<(&str, u64)> = None;
        for (prefix, ttl) in &self.ttl_prefixes {
            if path.starts_with(prefix.as_str()) {
                match best {
                    Some((b, _)) if b.len() >= prefix.len() => {}
                    _ => best = Some((prefix, *ttl)),
                }
            }
        }
        best.map(|(_, ttl)| ttl).unwrap_or(self.config.ttl_s)
    }

    pub async fn get(&self, key: &str) -> Option<CachedResponse> {
        if !self.config.enabled {
            return None;
        }
        let mut conn = self.conn().await.ok()?;
        let raw: Option<String> = conn.get(key).await.ok()?;
        let envelope: Value = serde_json::from_str(&raw?).ok()?;
        let status = envelope.get("status")?.as_u64()? as u16;
        let content_type = envelope
            .get("headers")
            .and_then(|h| h.get("content-type"))
            .and_then(|v| v.as_str())
            .map(String::from);
        let body = BASE64.decode(envelope.get("body_b64")?.as_str()?).ok()?;
        Some(CachedResponse {
            status,
            content_type,
            body,
        })
    }

    /// Store policy: only small JSON 200s without cookies or an explicit
    /// skip marker.
    pub fn should_store(
        &self,
        status: u16,
        content_type: Option<&str>,
        has_set_cookie: bool,
        body_len: usize,
        skip_marker: bool,
    ) -> bool {
        if !self.config.enabled || status != 200 || has_set_cookie || skip_marker {
            return false;
        }
        if body_len > self.config.max_bytes {
            return false;
        }
        content_type
            .map(|c| c.to_lowercase().contains("application/json"))
            .unwrap_or(false)
    }

    pub async fn store(&self, key: &str, path: &str, response: &CachedResponse) {
        if !self.config.enabled {
            return;
        }
        let envelope = json!({
            "status": response.status,
            "headers": { "content-type": response.content_type },
            "body_b64": BASE64.encode(&response.body),
        });
        let ttl = self.ttl_for_path(path);
        let res: redis::RedisResult<()> = async {
            let mut conn = self.conn().await?;
            let _: () = conn.set_ex(key, envelope.to_string(), ttl).await?;
            Ok(())
        }
        .await;
        if let Err(e) = res {
            debug!(error = %e, "cache store failed");
        }
    }

    /// SET NX EX on the key's lock; true when this caller is the filler.
    pub async fn try_lock(&self, key: &str) -> bool {
        if !self.config.enabled {
            return false;
        }
        let lock = Self::lock_key(key);
        let ttl = self.config.lock_ttl_s;
        let res: redis::RedisResult<Option<String>> = async {
            let mut conn = self.conn().await?;
            redis::cmd("SET")
                .arg(&lock)
                .arg("1")
                .arg("NX")
                .arg("EX")
                .arg(ttl)
                .query_async(&mut conn)
                .await
        }
        .await;
        matches!(res, Ok(Some(_)))
    }

    pub async fn release_lock(&self, key: &str) {
        if !self.config.enabled {
            return;
        }
        let lock = Self::lock_key(key);
        let res: redis::RedisResult<()> = async {
            let mut conn = self.conn().await?;
            let _: i64 = conn.del(&lock).await?;
            Ok(())
        }
        .await;
        if let Err(e) = res {
            debug!(error = %e, "cache lock release failed");
        }
    }

    /// Coalesced miss: wait out the filler, then re-read once.
    pub async fn wait_for_fill(&self, key: &str) -> Option<CachedResponse> {
        if !self.config.enabled {
            return None;
        }
        tokio::time::sleep(std::time::Duration::from_millis(self.config.lock_wait_ms)).await;
        self.get(key).await
    }

    pub async fn incr_metric(&self, name: &str) {
        if !self.config.enabled {
            return;
        }
        let key = format!("{}:metrics:{}", self.config.prefix, name);
        let ttl = self.config.metrics_ttl_s as i64;
        let res: redis::RedisResult<()> = async {
            let mut conn = self.conn().await?;
            let _: i64 = conn.incr(&key, 1).await?;
            let _: bool = conn.expire(&key, ttl).await?;
            Ok(())
        }
        .await;
        if let Err(e) = res {
            debug!(error = %e, "cache metric write failed");
        }
    }

    pub async fn metrics(&self) -> Value {
        if !self.config.enabled {
            return json!({"enabled": false, "hit": 0, "miss": 0});
        }
        let (hit, miss) = match self.conn().await {
            Ok(mut conn) => {
                let hit: Option<String> = conn
                    .get(format!("{}:metrics:hit", self.config.prefix))
                    .await
                    .unwrap_or(None);
                let miss: Option<String> = conn
                    .get(format!("{}:metrics:miss", self.config.prefix))
                    .await
                    .unwrap_or(None);
                (
                    hit.and_then(|v| v.parse::<i64>().ok()).unwrap_or(0),
                    miss.and_then(|v| v.parse::<i64>().ok()).unwrap_or(0),
                )
            }
            Err(_) => (0, 0),
        };
        json!({"enabled": true, "hit": hit, "miss": miss})
    }

    /// Delete every cached GET entry under the given path prefixes.
    pub async fn invalidate_path_prefixes(&self, prefixes: &[String]) -> usize {
        let patterns: Vec<String> = prefixes
            .iter()
            .map(|p| format!("{}:GET:{}*", self.config.prefix, p))
            .collect();
        self.invalidate_patterns(&patterns).await
    }

    /// Delete keys matching raw SCAN patterns.
    pub async fn invalidate_patterns(&self, patterns: &[String]) -> usize {
        if !self.config.enabled || patterns.is_empty() {
            return 0;
        }
        let mut deleted = 0usize;
        let mut conn = match self.conn().await {
            Ok(c) => c,
            Err(_) => return 0,
        };
        for pattern in patterns {
            let mut cursor: u64 = 0;
            loop {
                let scanned: redis::RedisResult<(u64, Vec<String>)> = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(pattern)
                    .arg("COUNT")
                    .arg(500)
                    .query_async(&mut conn)
                    .await;
                let (next, keys) = match scanned {
                    Ok(v) => v,
                    Err(_) => return deleted,
                };
                for key in keys {
                    let removed: i64 = conn.del(&key).await.unwrap_or(0);
                    deleted += removed as usize;
                }
                cursor = next;
                if cursor == 0 {
                    break;
                }
            }
        }
        deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;

    fn store_with(ttl_map: Option<&str>) -> CacheStore {
        let config = CacheConfig {
            enabled: true,
            prefix: "api-cache:v1".to_string(),
            ttl_s: 60,
            ttl_map: ttl_map.map(String::from),
            max_bytes: 1024,
            metrics_ttl_s: 3600,
            lock_ttl_s: 8,
            lock_wait_ms: 200,
        };
        CacheStore::new("redis://127.0.0.1:6379/0", config).unwrap()
    }

    #[test]
    fn key_varies_only_on_inputs() {
        let store = store_with(None);
        let q1 = vec![("b".to_string(), "2".to_string()), ("a".to_string(), "1".to_string())];
        let q2 = vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())];
        let k1 = store.key("GET", "/v1/tenders", &q1, "application/json", "");
        let k2 = store.key("get", "/v1/tenders", &q2, "APPLICATION/JSON", "");
        assert_eq!(k1, k2);
        assert_eq!(k1, "api-cache:v1:GET:/v1/tenders?a=1&b=2|a=application/json|l=");

        let k3 = store.key("GET", "/v1/tenders", &q1, "text/html", "");
        assert_ne!(k1, k3);
    }

    #[test]
    fn ttl_longest_prefix_wins() {
        let store = store_with(Some(r#"{"/v1": 10, "/v1/documents": 120}"#));
        assert_eq!(store.ttl_for_path("/v1/documents/list"), 120);
        assert_eq!(store.ttl_for_path("/v1/tenders"), 10);
        assert_eq!(store.ttl_for_path("/health"), 60);
    }

    #[test]
    fn store_policy() {
        let store = store_with(None);
        assert!(store.should_store(200, Some("application/json; charset=utf-8"), false, 100, false));
        assert!(!store.should_store(404, Some("application/json"), false, 100, false));
        assert!(!store.should_store(200, Some("text/html"), false, 100, false));
        assert!(!store.should_store(200, Some("application/json"), true, 100, false));
        assert!(!store.should_store(200, Some("application/json"), false, 4096, false));
        assert!(!store.should_store(200, Some("application/json"), false, 100, true));
    }
}
