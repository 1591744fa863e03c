//! Operator alerting: queue depth and counter-delta thresholds.
//!
//! Polls the shared store, compares against configured thresholds and sends
//! a chat message per tripped signal, rate-limited by a per-signal cooldown
//! key so a stuck queue does not page every minute.

use redis::AsyncCommands;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::AlertsConfig;
use crate::notify::telegram::TelegramClient;

pub struct AlertsWorker {
    config: AlertsConfig,
    metrics_prefix: String,
    redis: redis::Client,
    telegram: TelegramClient,
}

impl AlertsWorker {
    pub fn new(redis_url: &str, config: AlertsConfig, metrics_prefix: &str) -> redis::RedisResult<Self> {
        Ok(Self {
            telegram: TelegramClient::new(config.bot_token.clone()),
            metrics_prefix: metrics_prefix.to_string(),
            redis: redis::Client::open(redis_url)?,
            config,
        })
    }

    async fn conn(&self) -> redis::RedisResult<redis::aio::MultiplexedConnection> {
        self.redis.get_multiplexed_async_connection().await
    }

    /// Per-signal cooldown; fail open so alerting survives store hiccups.
    async fn cooldown_ok(&self, signal: &str) -> bool {
        let key = format!("{}:cooldown:{}", self.config.prefix, signal);
        let res: redis::RedisResult<Option<String>> = async {
            let mut conn = self.conn().await?;
            redis::cmd("SET")
                .arg(&key)
                .arg("1")
                .arg("NX")
                .arg("EX")
                .arg(self.config.cooldown_s)
                .query_async(&mut conn)
                .await
        }
        .await;
        match res {
            Ok(set) => set.is_some(),
            Err(_) => true,
        }
    }

    async fn check_queues(&self) -> Vec<String> {
        let mut alerts = Vec::new();
        let Ok(mut conn) = self.conn().await else {
            return alerts;
        };
        for (queue, limit) in &self.config.queue_thresholds {
            let size: i64 = conn.llen(queue.as_str()).await.unwrap_or(-1);
            if size >= *limit && self.cooldown_ok(&format!("queue:{}", queue)).await {
                alerts.push(format!(
                    "ALERTA: fila {} com {} itens (limite {})",
                    queue, size, limit
                ));
            }
        }
        alerts
    }

    async fn check_counters(&self) -> Vec<String> {
        let mut alerts = Vec::new();
        let Ok(mut conn) = self.conn().await else {
            return alerts;
        };
        for (name, limit) in &self.config.counter_thresholds {
            let counter_key = format!("{}:c:{}", self.metrics_prefix, name);
            let now_val: i64 = conn
                .get::<_, Option<String>>(&counter_key)
                .await
                .ok()
                .flatten()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            let prev_key = format!("{}:last:{}", self.config.prefix, name);
            let prev_val: i64 = conn
                .get::<_, Option<String>>(&prev_key)
                .await
                .ok()
                .flatten()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            let delta = (now_val - prev_val).max(0);
            let _: Result<(), _> = conn
                .set_ex(&prev_key, now_val.to_string(), self.config.cooldown_s * 2)
                .await;
            if delta >= *limit && self.cooldown_ok(&format!("counter:{}", name)).await {
                alerts.push(format!("ALERTA: {} subiu +{} (limite {})", name, delta, limit));
            }
        }
        alerts
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("alerts worker disabled");
            return;
        }
        info!(poll_s = self.config.poll_s, "alerts worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let mut alerts = self.check_queues().await;
            alerts.extend(self.check_counters().await);
            if !alerts.is_empty() {
                let message = alerts.join("\n");
                match self.config.chat_id {
                    Some(ref chat_id) => {
                        self.telegram.send_message(chat_id, &message, None).await;
                    }
                    None => warn!(%message, "operator alert with no chat configured"),
                }
            }
            let sleep = tokio::time::sleep(std::time::Duration::from_secs(self.config.poll_s));
            tokio::select! {
                _ = sleep => {}
                _ = shutdown.changed() => {}
            }
        }
        info!("alerts worker stopped");
    }
}
