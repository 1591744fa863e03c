//! Append-only pipeline audit log.
//!
//! Writes are sampling-gated and best-effort: the pipeline never blocks on,
//! or fails because of, an audit insert.

use chrono::Utc;
use diesel::prelude::*;
use rand::Rng;
use serde_json::Value;
use tracing::debug;

use crate::config::EventLogConfig;
use crate::repository::pool::{run_blocking, SqlitePool};
use crate::schema::pipeline_event;

#[derive(Clone)]
pub struct EventLog {
    pool: SqlitePool,
    config: EventLogConfig,
}

impl EventLog {
    pub fn new(pool: SqlitePool, config: EventLogConfig) -> Self {
        Self { pool, config }
    }

    fn should_log(&self) -> bool {
        if !self.config.enabled {
            return false;
        }
        if self.config.sample >= 1.0 {
            return true;
        }
        rand::thread_rng().gen::<f64>() <= self.config.sample
    }

    pub async fn log(
        &self,
        stage: &str,
        status: &str,
        tender_id: Option<i32>,
        document_id: Option<i32>,
        message: Option<&str>,
        payload: Option<&Value>,
    ) {
        if !self.should_log() {
            return;
        }
        let stage = stage.to_string();
        let status = status.to_string();
        let message = message.map(String::from);
        let payload = payload
            .map(|v| serde_json::to_string(v).unwrap_or_else(|_| "{}".to_string()))
            .unwrap_or_else(|| "{}".to_string());
        let now = Utc::now().to_rfc3339();
        let pool = self.pool.clone();
        let res = run_blocking(pool, move |conn| {
            diesel::insert_into(pipeline_event::table)
                .values((
                    pipeline_event::tender_id.eq(tender_id),
                    pipeline_event::document_id.eq(document_id),
                    pipeline_event::stage.eq(&stage),
                    pipeline_event::status.eq(&status),
                    pipeline_event::message.eq(&message),
                    pipeline_event::payload.eq(&payload),
                    pipeline_event::created_at.eq(&now),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await;
        if let Err(e) = res {
            debug!(error = %e, "event log insert failed");
        }
    }
}
