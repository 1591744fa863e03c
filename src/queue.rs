//! Bounded work queues over Redis lists.
//!
//! Producers push to the head, the sole consumer pops from the tail, so a
//! queue drains in push order. `push` enforces the configured length cap and
//! fails with [`QueueError::Full`] at the cap — the only way a producer
//! observes saturation. Dead-letter pushes wrap the original message in a
//! `{reason, error, payload}` envelope and are never capped.

use redis::AsyncCommands;
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    /// Queue length is at or above the configured cap.
    #[error("queue_full")]
    Full,
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Clone)]
pub struct QueueClient {
    client: redis::Client,
    max_len: usize,
}

impl QueueClient {
    pub fn new(redis_url: &str, max_len: usize) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client, max_len })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    pub async fn len(&self, queue: &str) -> Result<usize, QueueError> {
        let mut conn = self.conn().await?;
        let n: usize = conn.llen(queue).await?;
        Ok(n)
    }

    /// Push a message, honoring the queue cap.
    pub async fn push(&self, queue: &str, payload: &Value) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        if self.max_len > 0 {
            let size: usize = conn.llen(queue).await?;
            if size >= self.max_len {
                return Err(QueueError::Full);
            }
        }
        let raw = serde_json::to_string(payload)?;
        let _: () = conn.lpush(queue, raw).await?;
        Ok(())
    }

    /// Blocking pop from a single queue. `None` on timeout.
    pub async fn pop_blocking(&self, queue: &str, timeout_s: f64) -> Result<Option<Value>, QueueError> {
        let mut conn = self.conn().await?;
        let item: Option<(String, String)> = conn.brpop(queue, timeout_s).await?;
        match item {
            Some((_q, raw)) => Ok(Some(decode(&raw))),
            None => Ok(None),
        }
    }

    /// Blocking pop across several queues; earlier entries in `queues` win
    /// when more than one has items. Returns the source queue name.
    pub async fn pop_blocking_any(
        &self,
        queues: &[String],
        timeout_s: f64,
    ) -> Result<Option<(String, Value)>, QueueError> {
        let mut conn = self.conn().await?;
        let item: Option<(String, String)> = conn.brpop(queues, timeout_s).await?;
        match item {
            Some((q, raw)) => Ok(Some((q, decode(&raw)))),
            None => Ok(None),
        }
    }

    /// Uncapped push for intra-pipeline handoffs and retries. Backpressure
    /// is applied at ingest only; a message already admitted must not be
    /// lost to a full downstream queue.
    pub async fn push_unbounded(&self, queue: &str, payload: &Value) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let raw = serde_json::to_string(payload)?;
        let _: () = conn.lpush(queue, raw).await?;
        Ok(())
    }

    /// Move a poisoned message to a dead-letter queue. Not capped: losing a
    /// DLQ entry is worse than an oversized list.
    pub async fn push_dead(
        &self,
        queue: &str,
        reason: &str,
        error: &str,
        payload: &Value,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let envelope = json!({
            "reason": reason,
            "error": error,
            "payload": payload,
        });
        let raw = serde_json::to_string(&envelope)?;
        let _: () = conn.lpush(queue, raw).await?;
        Ok(())
    }
}

/// Malformed messages are preserved under `_raw` instead of being dropped.
fn decode(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| json!({ "_raw": raw }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_preserves_malformed_payloads() {
        let v = decode("not json");
        assert_eq!(v["_raw"], "not json");
        let v = decode("{\"tender_id\":7}");
        assert_eq!(v["tender_id"], 7);
    }
}
