//! HTTP surface: ingest, write endpoints, health and metrics.
//!
//! Middleware order (outermost first): auth + rate limit, request metrics,
//! response cache. The cache layer wraps only the routes, so public
//! endpoints still pay their way through metrics.

mod auth;
mod cache_layer;
mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::middleware;
use tokio::sync::watch;

use crate::cache::CacheStore;
use crate::config::{QueueConfig, ServerConfig};
use crate::enrich::AgentClient;
use crate::metrics::MetricsSink;
use crate::queue::QueueClient;
use crate::repository::{DocumentRepository, SqlitePool, TenderRepository, UserRepository};

/// Shared state for the HTTP process.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub queues: Arc<QueueConfig>,
    pub pool: SqlitePool,
    pub queue: QueueClient,
    pub metrics: MetricsSink,
    pub cache: CacheStore,
    pub tenders: TenderRepository,
    pub documents: DocumentRepository,
    pub users: UserRepository,
    pub agent: Arc<AgentClient>,
    pub redis: redis::Client,
}

pub fn build_router(state: AppState) -> axum::Router {
    routes::router(state.clone())
        .layer(middleware::from_fn_with_state(state.clone(), cache_layer::cache_middleware))
        .layer(middleware::from_fn_with_state(state.clone(), auth::metrics_middleware))
        .layer(middleware::from_fn_with_state(state, auth::auth_middleware))
}

/// Serve until the shutdown flag flips.
pub async fn serve(state: AppState, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", state.config.host, state.config.port).parse()?;
    let app = build_router(state);

    tracing::info!(%addr, "api listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}
