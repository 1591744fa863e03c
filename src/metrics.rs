//! Pipeline metrics in the shared Redis store.
//!
//! Counters, labeled counters, gauges and fixed-bucket histograms live under
//! a versioned key prefix with a TTL refreshed on every write, so abandoned
//! metrics age out. Every operation fails open: an unreachable store means
//! no metrics for that write, never an error surfaced to the pipeline.

use std::collections::HashMap;

use redis::AsyncCommands;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::MetricsConfig;

/// Counters pre-registered for exposition.
pub const DEFAULT_COUNTERS: &[&str] = &[
    "api.requests_total",
    "api.errors_4xx_total",
    "api.errors_5xx_total",
    "api.exceptions_total",
    "api.ingest.queued_total",
    "api.ingest.queue_full_total",
    "api.ingest.error_total",
    "agent.enrich.ok_total",
    "agent.enrich.error_total",
    "agent.enrich.skip_total",
    "notifier.sent_total",
    "notifier.errors_total",
    "crawler.batch_ok_total",
    "crawler.batch_error_total",
    "crawler.items_total",
    "crawler.ingest_ok_total",
    "crawler.ingest_error_total",
    "worker.compras_fetch.batch_ok_total",
    "worker.compras_fetch.batch_error_total",
    "worker.compras_fetch.items_total",
    "worker.compras_fetch.ingest_ok_total",
    "worker.compras_fetch.ingest_error_total",
    "data.normalization.error_total",
    "worker.triage.consumed_total",
    "worker.triage.enqueued_fetch_total",
    "worker.triage.retry_total",
    "worker.triage.error_total",
    "worker.triage.dead_total",
    "worker.fetch_docs.consumed_total",
    "worker.fetch_docs.ok_total",
    "worker.fetch_docs.retry_total",
    "worker.fetch_docs.error_total",
    "worker.fetch_docs.dead_total",
    "worker.fetch_docs.duplicate_total",
    "worker.fetch_docs.missing_tender_or_url_total",
    "worker.parse.consumed_total",
    "worker.parse.ok_total",
    "worker.parse.retry_total",
    "worker.parse.error_total",
    "worker.parse.dead_total",
];

pub const DEFAULT_GAUGES: &[&str] = &["api.last_request_ms"];

pub const DEFAULT_LABELED_COUNTERS: &[&str] = &["api.requests_by_route_total"];

pub const DEFAULT_HISTOGRAMS: &[&str] = &["api.request_duration_ms", "agent.enrich_duration_ms"];

#[derive(Clone)]
pub struct MetricsSink {
    client: redis::Client,
    config: MetricsConfig,
    /// Cache-store prefix, read for the hit/miss snapshot in exposition.
    cache_prefix: String,
}

impl MetricsSink {
    pub fn new(redis_url: &str, config: MetricsConfig, cache_prefix: &str) -> redis::RedisResult<Self> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            config,
            cache_prefix: cache_prefix.to_string(),
        })
    }

    async fn conn(&self) -> redis::RedisResult<redis::aio::MultiplexedConnection> {
        self.client.get_multiplexed_async_connection().await
    }

    fn counter_key(&self, name: &str) -> String {
        format!("{}:c:{}", self.config.prefix, name)
    }

    fn gauge_key(&self, name: &str) -> String {
        format!("{}:g:{}", self.config.prefix, name)
    }

    fn bucket_key(&self, name: &str, le: &str) -> String {
        format!("{}:h:{}:bucket:{}", self.config.prefix, name, le)
    }

    pub async fn incr(&self, name: &str) {
        self.incr_by(name, 1).await;
    }

    pub async fn incr_by(&self, name: &str, value: i64) {
        if !self.config.enabled {
            return;
        }
        let key = self.counter_key(name);
        let ttl = self.config.ttl_s as i64;
        let res: redis::RedisResult<()> = async {
            let mut conn = self.conn().await?;
            let _: i64 = conn.incr(&key, value).await?;
            let _: bool = conn.expire(&key, ttl).await?;
            Ok(())
        }
        .await;
        if let Err(e) = res {
            debug!(metric = name, error = %e, "counter write failed");
        }
    }

    /// Sorted `k=v` pairs joined by commas; the canonical label tuple key.
    fn labels_key(labels: &[(String, String)]) -> String {
        let mut pairs: Vec<(String, String)> = labels.to_vec();
        pairs.sort();
        pairs
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }

    pub async fn incr_labeled(&self, name: &str, labels: &[(String, String)]) {
        if !self.config.enabled {
            return;
        }
        let labels_key = Self::labels_key(labels);
        let set_key = format!("{}:clset:{}", self.config.prefix, name);
        let key = format!("{}:cl:{}:{}", self.config.prefix, name, labels_key);
        let ttl = self.config.ttl_s as i64;
        let res: redis::RedisResult<()> = async {
            let mut conn = self.conn().await?;
            let _: i64 = conn.sadd(&set_key, &labels_key).await?;
            let _: i64 = conn.incr(&key, 1).await?;
            let _: bool = conn.expire(&key, ttl).await?;
            let _: bool = conn.expire(&set_key, ttl).await?;
            Ok(())
        }
        .await;
        if let Err(e) = res {
            debug!(metric = name, error = %e, "labeled counter write failed");
        }
    }

    pub async fn set_gauge(&self, name: &str, value: f64) {
        if !self.config.enabled {
            return;
        }
        let key = self.gauge_key(name);
        let ttl = self.config.ttl_s as i64;
        let res: redis::RedisResult<()> = async {
            let mut conn = self.conn().await?;
            let _: () = conn.set(&key, value.to_string()).await?;
            let _: bool = conn.expire(&key, ttl).await?;
            Ok(())
        }
        .await;
        if let Err(e) = res {
            debug!(metric = name, error = %e, "gauge write failed");
        }
    }

    pub async fn observe_histogram(&self, name: &str, value_ms: f64) {
        if !self.config.enabled {
            return;
        }
        let ttl = self.config.ttl_s as i64;
        let buckets = self.config.histogram_buckets_ms.clone();
        let res: redis::RedisResult<()> = async {
            let mut conn = self.conn().await?;
            for b in &buckets {
                if value_ms <= *b {
                    let key = self.bucket_key(name, &b.to_string());
                    let _: i64 = conn.incr(&key, 1).await?;
                    let _: bool = conn.expire(&key, ttl).await?;
                }
            }
            let inf_key = self.bucket_key(name, "+Inf");
            let _: i64 = conn.incr(&inf_key, 1).await?;
            let _: bool = conn.expire(&inf_key, ttl).await?;
            let sum_key = format!("{}:h:{}:sum", self.config.prefix, name);
            let _: f64 = conn.incr(&sum_key, value_ms).await?;
            let _: bool = conn.expire(&sum_key, ttl).await?;
            let count_key = format!("{}:h:{}:count", self.config.prefix, name);
            let _: i64 = conn.incr(&count_key, 1).await?;
            let _: bool = conn.expire(&count_key, ttl).await?;
            Ok(())
        }
        .await;
        if let Err(e) = res {
            debug!(metric = name, error = %e, "histogram write failed");
        }
    }

    pub async fn get_counters(&self, names: &[&str]) -> HashMap<String, i64> {
        if !self.config.enabled || names.is_empty() {
            return HashMap::new();
        }
        let keys: Vec<String> = names.iter().map(|n| self.counter_key(n)).collect();
        let values: Vec<Option<String>> = match self.conn().await {
            Ok(mut conn) => conn.mget(&keys).await.unwrap_or_default(),
            Err(_) => return HashMap::new(),
        };
        names
            .iter()
            .zip(values.into_iter().chain(std::iter::repeat(None)))
            .map(|(name, val)| {
                (
                    name.to_string(),
                    val.and_then(|v| v.parse().ok()).unwrap_or(0),
                )
            })
            .collect()
    }

    pub async fn get_gauges(&self, names: &[&str]) -> HashMap<String, Option<f64>> {
        if !self.config.enabled || names.is_empty() {
            return HashMap::new();
        }
        let keys: Vec<String> = names.iter().map(|n| self.gauge_key(n)).collect();
        let values: Vec<Option<String>> = match self.conn().await {
            Ok(mut conn) => conn.mget(&keys).await.unwrap_or_default(),
            Err(_) => return HashMap::new(),
        };
        names
            .iter()
            .zip(values.into_iter().chain(std::iter::repeat(None)))
            .map(|(name, val)| (name.to_string(), val.and_then(|v| v.parse().ok())))
            .collect()
    }

    pub async fn get_labeled_counters(&self, name: &str) -> HashMap<String, i64> {
        if !self.config.enabled {
            return HashMap::new();
        }
        let set_key = format!("{}:clset:{}", self.config.prefix, name);
        let mut conn = match self.conn().await {
            Ok(c) => c,
            Err(_) => return HashMap::new(),
        };
        let labels: Vec<String> = conn.smembers(&set_key).await.unwrap_or_default();
        if labels.is_empty() {
            return HashMap::new();
        }
        let keys: Vec<String> = labels
            .iter()
            .map(|l| format!("{}:cl:{}:{}", self.config.prefix, name, l))
            .collect();
        let values: Vec<Option<String>> = conn.mget(&keys).await.unwrap_or_default();
        labels
            .into_iter()
            .zip(values.into_iter().chain(std::iter::repeat(None)))
            .map(|(label, val)| (label, val.and_then(|v| v.parse().ok()).unwrap_or(0)))
            .collect()
    }

    pub async fn get_histogram(&self, name: &str) -> Option<HistogramSnapshot> {
        if !self.config.enabled {
            return None;
        }
        let mut conn = self.conn().await.ok()?;
        let mut les: Vec<String> = self
            .config
            .histogram_buckets_ms
            .iter()
            .map(|b| b.to_string())
            .collect();
        les.push("+Inf".to_string());
        let keys: Vec<String> = les.iter().map(|le| self.bucket_key(name, le)).collect();
        let values: Vec<Option<String>> = conn.mget(&keys).await.ok()?;
        let sum: Option<String> = conn
            .get(format!("{}:h:{}:sum", self.config.prefix, name))
            .await
            .ok()?;
        let count: Option<String> = conn
            .get(format!("{}:h:{}:count", self.config.prefix, name))
            .await
            .ok()?;
        let buckets = les
            .into_iter()
            .zip(values.into_iter().chain(std::iter::repeat(None)))
            .map(|(le, val)| (le, val.and_then(|v| v.parse().ok()).unwrap_or(0)))
            .collect();
        Some(HistogramSnapshot {
            buckets,
            sum: sum.and_then(|v| v.parse().ok()).unwrap_or(0.0),
            count: count.and_then(|v| v.parse().ok()).unwrap_or(0),
        })
    }

    pub async fn get_queue_lengths(&self, queues: &[String]) -> HashMap<String, Option<i64>> {
        if !self.config.enabled || queues.is_empty() {
            return HashMap::new();
        }
        let mut conn = match self.conn().await {
            Ok(c) => c,
            Err(_) => return HashMap::new(),
        };
        let mut out = HashMap::new();
        for q in queues {
            let len: Option<i64> = conn.llen(q.as_str()).await.ok();
            out.insert(q.clone(), len);
        }
        out
    }

    pub async fn get_cache_snapshot(&self) -> HashMap<String, i64> {
        if !self.config.enabled {
            return HashMap::new();
        }
        let mut conn = match self.conn().await {
            Ok(c) => c,
            Err(_) => return HashMap::new(),
        };
        let hit: Option<String> = conn
            .get(format!("{}:metrics:hit", self.cache_prefix))
            .await
            .unwrap_or(None);
        let miss: Option<String> = conn
            .get(format!("{}:metrics:miss", self.cache_prefix))
            .await
            .unwrap_or(None);
        let mut out = HashMap::new();
        out.insert(
            "cache_hit_total".to_string(),
            hit.and_then(|v| v.parse().ok()).unwrap_or(0),
        );
        out.insert(
            "cache_miss_total".to_string(),
            miss.and_then(|v| v.parse().ok()).unwrap_or(0),
        );
        out
    }

    /// JSON snapshot for `/metrics/basic`.
    pub async fn snapshot_basic(&self, queues: &[String]) -> Value {
        let counters = self.get_counters(DEFAULT_COUNTERS).await;
        let gauges = self.get_gauges(DEFAULT_GAUGES).await;
        let queue_lengths = self.get_queue_lengths(queues).await;
        let cache = self.get_cache_snapshot().await;
        json!({
            "counters": counters,
            "gauges": gauges,
            "queues": queue_lengths,
            "cache": cache,
        })
    }

    /// Prometheus text exposition.
    pub async fn render_prometheus(&self, queues: &[String]) -> String {
        let counters = self.get_counters(DEFAULT_COUNTERS).await;
        let gauges = self.get_gauges(DEFAULT_GAUGES).await;
        let queue_lengths = self.get_queue_lengths(queues).await;
        let cache = self.get_cache_snapshot().await;

        let mut lines: Vec<String> = Vec::new();
        let mut counter_names: Vec<&String> = counters.keys().collect();
        counter_names.sort();
        for name in counter_names {
            let metric = sanitize(name);
            lines.push(format!("# TYPE {} counter", metric));
            lines.push(format!("{} {}", metric, counters[name]));
        }
        let mut gauge_names: Vec<&String> = gauges.keys().collect();
        gauge_names.sort();
        for name in gauge_names {
            let metric = sanitize(name);
            lines.push(format!("# TYPE {} gauge", metric));
            if let Some(val) = gauges[name] {
                lines.push(format!("{} {}", metric, val));
            }
        }
        if !queue_lengths.is_empty() {
            lines.push("# TYPE queue_length gauge".to_string());
            let mut qnames: Vec<&String> = queue_lengths.keys().collect();
            qnames.sort();
            for q in qnames {
                if let Some(len) = queue_lengths[q] {
                    lines.push(format!("queue_length{{queue=\"{}\"}} {}", escape_label(q), len));
                }
            }
        }
        let mut cache_names: Vec<&String> = cache.keys().collect();
        cache_names.sort();
        for name in cache_names {
            let metric = sanitize(name);
            lines.push(format!("# TYPE {} counter", metric));
            lines.push(format!("{} {}", metric, cache[name]));
        }
        for name in DEFAULT_LABELED_COUNTERS {
            let items = self.get_labeled_counters(name).await;
            if items.is_empty() {
                continue;
            }
            let metric = sanitize(name);
            lines.push(format!("# TYPE {} counter", metric));
            let mut label_keys: Vec<&String> = items.keys().collect();
            label_keys.sort();
            for label_key in label_keys {
                if label_key.is_empty() {
                    continue;
                }
                let pairs: Vec<String> = label_key
                    .split(',')
                    .filter_map(|pair| pair.split_once('='))
                    .map(|(k, v)| format!("{}=\"{}\"", sanitize(k), escape_label(v)))
                    .collect();
                lines.push(format!("{}{{{}}} {}", metric, pairs.join(","), items[label_key]));
            }
        }
        for name in DEFAULT_HISTOGRAMS {
            let Some(h) = self.get_histogram(name).await else {
                continue;
            };
            if h.buckets.is_empty() {
                continue;
            }
            let metric = sanitize(name);
            lines.push(format!("# TYPE {} histogram", metric));
            for (le, val) in &h.buckets {
                lines.push(format!("{}_bucket{{le=\"{}\"}} {}", metric, le, val));
            }
            lines.push(format!("{}_sum {}", metric, h.sum));
            lines.push(format!("{}_count {}", metric, h.count));
        }
        lines.join("\n") + "\n"
    }
}

#[derive(Debug, Clone)]
pub struct HistogramSnapshot {
    /// (le, count) in bucket order, `+Inf` last.
    pub buckets: Vec<(String, i64)>,
    pub sum: f64,
    pub count: i64,
}

/// Metric-name characters outside `[A-Za-z0-9_]` become underscores.
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Escape backslash, double quote and newline for label values.
pub fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_punctuation() {
        assert_eq!(sanitize("api.requests_total"), "api_requests_total");
        assert_eq!(sanitize("worker.fetch-docs"), "worker_fetch_docs");
    }

    #[test]
    fn escape_handles_specials() {
        assert_eq!(escape_label("a\"b"), "a\\\"b");
        assert_eq!(escape_label("a\\b"), "a\\\\b");
        assert_eq!(escape_label("a\nb"), "a\\nb");
    }

    #[test]
    fn labels_key_is_sorted() {
        let key = MetricsSink::labels_key(&[
            ("status".to_string(), "200".to_string()),
            ("route".to_string(), "/health".to_string()),
        ]);
        assert_eq!(key, "route=/health,status=200");
    }
}
