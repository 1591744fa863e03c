//! Long-running pipeline workers.
//!
//! Each worker is a loop over a blocking queue pop with a finite timeout, so
//! the shutdown flag is observed between messages: the in-flight message is
//! always finished, no new pop is started afterwards.

pub mod alerts;
pub mod daily;
pub mod envelope;
pub mod fetch;
pub mod parse;
pub mod triage;

use serde_json::Value;
use tokio::sync::watch;
use tracing::warn;

use crate::cache::CacheStore;
use crate::events::EventLog;
use crate::metrics::MetricsSink;
use crate::queue::QueueClient;
use crate::repository::{DocumentRepository, TenderRepository, UserRepository};

/// Pop timeout; bounds how long shutdown waits on an idle worker.
pub const POP_TIMEOUT_S: f64 = 5.0;

/// Shared handles wired at process start and injected into every worker.
#[derive(Clone)]
pub struct PipelineContext {
    pub queue: QueueClient,
    pub queues: crate::config::QueueConfig,
    pub metrics: MetricsSink,
    pub events: EventLog,
    pub cache: CacheStore,
    pub tenders: TenderRepository,
    pub documents: DocumentRepository,
    pub users: UserRepository,
    pub shutdown: watch::Receiver<bool>,
}

impl PipelineContext {
    pub fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Linear-backoff retry with dead-letter exhaustion.
///
/// Returns `true` when the message was re-queued, `false` when it went to
/// the DLQ (or was lost because even that failed).
#[allow(clippy::too_many_arguments)]
pub async fn retry_or_dead(
    ctx: &PipelineContext,
    stage: &str,
    queue_name: &str,
    dead_queue: &str,
    payload: &Value,
    max_retries: u32,
    backoff_s: f64,
    reason: &str,
    error: &str,
    tender_id: Option<i32>,
    document_id: Option<i32>,
) -> bool {
    let retries = envelope::get_retries(payload);
    if retries < max_retries {
        let delay = backoff_s * (retries as f64 + 1.0);
        tokio::time::sleep(std::time::Duration::from_secs_f64(delay)).await;
        let bumped = envelope::with_retries(payload, retries + 1);
        match ctx.queue.push_unbounded(queue_name, &bumped).await {
            Ok(()) => {
                ctx.metrics.incr(&format!("worker.{}.retry_total", stage)).await;
                ctx.events
                    .log(
                        stage,
                        "retry",
                        tender_id,
                        document_id,
                        None,
                        Some(&serde_json::json!({
                            "queue": queue_name,
                            "retries": retries + 1,
                            "error": error,
                        })),
                    )
                    .await;
                return true;
            }
            Err(e) => {
                warn!(stage, error = %e, "retry requeue failed, dead-lettering");
            }
        }
    }
    if let Err(e) = ctx.queue.push_dead(dead_queue, reason, error, payload).await {
        warn!(stage, error = %e, "dead-letter push failed, message lost");
        return false;
    }
    ctx.metrics.incr(&format!("worker.{}.dead_total", stage)).await;
    ctx.events
        .log(
            stage,
            "dead",
            tender_id,
            document_id,
            None,
            Some(&serde_json::json!({ "queue": dead_queue, "error": error })),
        )
        .await;
    false
}
