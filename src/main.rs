use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use licitaradar::cache::CacheStore;
use licitaradar::config::{
    AgentConfig, AlertsConfig, CacheConfig, ComprasConfig, CrawlerConfig, DailyConfig,
    EmbeddingConfig, EventLogConfig, FetchConfig, MetricsConfig, NotifyConfig, OcrConfig,
    ParseConfig, QueueConfig, ServerConfig, StoreConfig, TriageConfig,
};
use licitaradar::crawler::{ComprasCrawler, PncpCrawler};
use licitaradar::enrich::{AgentClient, EmbeddingClient};
use licitaradar::events::EventLog;
use licitaradar::extract::OcrEngine;
use licitaradar::metrics::MetricsSink;
use licitaradar::notify::Notifier;
use licitaradar::queue::QueueClient;
use licitaradar::repository::{
    create_pool, init_schema, DocumentRepository, TenderRepository, UserRepository,
};
use licitaradar::server::{self, AppState};
use licitaradar::workers::{self, alerts::AlertsWorker, parse::ParseWorker, PipelineContext};

#[derive(Parser)]
#[command(name = "licitaradar", version, about = "Procurement notice pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API.
    Serve,
    /// Apply the database schema and exit.
    InitDb,
    /// Run the triage worker.
    WorkerTriage,
    /// Run the document fetch worker.
    WorkerFetch,
    /// Run the parse worker.
    WorkerParse,
    /// Run the daily digest worker.
    WorkerDaily,
    /// Run the operator alerts worker.
    WorkerAlerts,
    /// Run the PNCP catalog crawler.
    CrawlerPncp,
    /// Run the compras.dados.gov.br catalog crawler.
    CrawlerCompras,
}

/// Flip the shutdown flag on ctrl-c; workers finish the in-flight message
/// and exit.
fn spawn_signal_handler() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            let _ = tx.send(true);
        }
    });
    rx
}

async fn build_context(shutdown: watch::Receiver<bool>) -> anyhow::Result<PipelineContext> {
    let store = StoreConfig::from_env();
    let queues = QueueConfig::from_env();
    let cache_config = CacheConfig::from_env();

    let pool = create_pool(Path::new(&store.database_path)).context("creating sqlite pool")?;
    init_schema(pool.clone()).await.context("applying schema")?;

    let queue = QueueClient::new(&store.redis_url, queues.max_len)?;
    let metrics = MetricsSink::new(&store.redis_url, MetricsConfig::from_env(), &cache_config.prefix)?;
    let cache = CacheStore::new(&store.redis_url, cache_config)?;
    let events = EventLog::new(pool.clone(), EventLogConfig::from_env());

    Ok(PipelineContext {
        queue,
        queues,
        metrics,
        events,
        cache,
        tenders: TenderRepository::new(pool.clone()),
        documents: DocumentRepository::new(pool.clone()),
        users: UserRepository::new(pool),
        shutdown,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(std::env::var("LOG_LEVEL").unwrap_or_default().to_lowercase()))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let shutdown = spawn_signal_handler();
    let store = StoreConfig::from_env();

    match cli.command {
        Command::InitDb => {
            let pool = create_pool(Path::new(&store.database_path))?;
            init_schema(pool).await?;
            println!("DB_INIT_OK");
        }
        Command::Serve => {
            let queues = QueueConfig::from_env();
            let cache_config = CacheConfig::from_env();
            let pool = create_pool(Path::new(&store.database_path)).context("creating sqlite pool")?;
            init_schema(pool.clone()).await.context("applying schema")?;
            let state = AppState {
                config: Arc::new(ServerConfig::from_env()),
                queue: QueueClient::new(&store.redis_url, queues.max_len)?,
                queues: Arc::new(queues),
                metrics: MetricsSink::new(&store.redis_url, MetricsConfig::from_env(), &cache_config.prefix)?,
                cache: CacheStore::new(&store.redis_url, cache_config)?,
                tenders: TenderRepository::new(pool.clone()),
                documents: DocumentRepository::new(pool.clone()),
                users: UserRepository::new(pool.clone()),
                pool,
                agent: Arc::new(AgentClient::new(AgentConfig::from_env())),
                redis: redis::Client::open(store.redis_url.as_str())?,
            };
            server::serve(state, shutdown).await?;
        }
        Command::WorkerTriage => {
            let ctx = build_context(shutdown).await?;
            let notifier = Notifier::new(&store.redis_url, NotifyConfig::from_env())?;
            workers::triage::run(ctx, TriageConfig::from_env(), notifier).await;
        }
        Command::WorkerFetch => {
            let ctx = build_context(shutdown).await?;
            workers::fetch::run(ctx, FetchConfig::from_env()).await;
        }
        Command::WorkerParse => {
            let ctx = build_context(shutdown).await?;
            let worker = ParseWorker {
                config: ParseConfig::from_env(),
                triage: TriageConfig::from_env(),
                ocr: Arc::new(OcrEngine::new(OcrConfig::from_env())),
                agent: Arc::new(AgentClient::new(AgentConfig::from_env())),
                embeddings: Arc::new(EmbeddingClient::new(EmbeddingConfig::from_env())),
                notifier: Notifier::new(&store.redis_url, NotifyConfig::from_env())?,
            };
            workers::parse::run(ctx, worker).await;
        }
        Command::WorkerDaily => {
            let ctx = build_context(shutdown).await?;
            let notifier = Notifier::new(&store.redis_url, NotifyConfig::from_env())?;
            workers::daily::run(ctx, DailyConfig::from_env(), notifier).await;
        }
        Command::WorkerAlerts => {
            let metrics_prefix = MetricsConfig::from_env().prefix;
            let worker = AlertsWorker::new(&store.redis_url, AlertsConfig::from_env(), &metrics_prefix)?;
            worker.run(shutdown).await;
        }
        Command::CrawlerPncp => {
            let cache_prefix = CacheConfig::from_env().prefix;
            let metrics = MetricsSink::new(&store.redis_url, MetricsConfig::from_env(), &cache_prefix)?;
            let crawler = PncpCrawler::new(CrawlerConfig::from_env(), metrics);
            crawler.run(shutdown).await;
        }
        Command::CrawlerCompras => {
            let cache_prefix = CacheConfig::from_env().prefix;
            let metrics = MetricsSink::new(&store.redis_url, MetricsConfig::from_env(), &cache_prefix)?;
            let crawler = ComprasCrawler::new(ComprasConfig::from_env(), metrics);
            crawler.run(shutdown).await;
        }
    }
    Ok(())
}
