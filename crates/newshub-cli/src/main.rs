use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use newshub_adapters::{NewsApiClient, NewsApiConfig};
use newshub_storage::{ArticleStore, MemoryArticleStore, PgArticleStore, StoreConfig};
use newshub_sync::{build_scheduler, IngestionJob, RunOutcome, SyncConfig};
use newshub_web::{AppState, WebConfig};
use tracing::{info, warn};
use tracing_subscriber::{fmt as tfmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "newshub")]
#[command(about = "News Hub ingestion job and article API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the API and run the hourly ingestion job.
    Serve {
        /// Keep articles in process memory instead of Postgres.
        #[arg(long)]
        memory: bool,
    },
    /// Run one ingestion pass and exit.
    Sync,
    /// Create the articles table if it does not exist.
    Migrate,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_timer(tfmt::time::UtcTime::rfc_3339())
        .init();
}

async fn open_store(memory: bool) -> Result<Arc<dyn ArticleStore>> {
    if memory {
        warn!("using in-memory article store; nothing will survive a restart");
        return Ok(Arc::new(MemoryArticleStore::new()));
    }
    let config = StoreConfig::from_env();
    let store = PgArticleStore::connect(&config)
        .await
        .with_context(|| format!("connecting to postgres ({config:?})"))?;
    Ok(Arc::new(store))
}

fn build_job(sync_config: &SyncConfig, store: Arc<dyn ArticleStore>) -> Result<IngestionJob> {
    let api_config = NewsApiConfig::from_env();
    if api_config.api_key.is_empty() {
        warn!("NEWS_API_KEY is not set; upstream requests will be rejected");
    }
    let source = NewsApiClient::new(api_config).context("building news api client")?;
    let topics = sync_config.ingest_config().context("loading topic configuration")?;
    Ok(IngestionJob::new(topics, Arc::new(source), store))
}

async fn serve(memory: bool) -> Result<()> {
    let store = open_store(memory).await?;
    store.init_schema().await.context("initializing articles schema")?;

    let sync_config = SyncConfig::from_env();
    let job = Arc::new(build_job(&sync_config, store.clone())?);

    let web_config = WebConfig::from_env();
    if web_config.trigger_secret.is_none() {
        warn!("TRIGGER_SECRET is not set; /api/trigger-fetch will reject every request");
    }

    let mut scheduler = build_scheduler(Arc::clone(&job), &sync_config).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
    }

    info!("running initial news fetch on server start");
    drop(job.trigger());

    let state = AppState::new(store, job, web_config.trigger_secret.clone());
    let served = newshub_web::serve(&web_config, state).await;

    if let Some(sched) = scheduler.as_mut() {
        if let Err(err) = sched.shutdown().await {
            warn!(error = %err, "scheduler did not shut down cleanly");
        }
    }
    served
}

async fn sync_once() -> Result<()> {
    let store = open_store(false).await?;
    store.init_schema().await.context("initializing articles schema")?;
    let job = build_job(&SyncConfig::from_env(), store)?;

    match job.run_once().await {
        RunOutcome::Completed(summary) => {
            println!(
                "sync complete: run_id={} topics={} inserted={} failed_topics={}",
                summary.run_id,
                summary.topics.len(),
                summary.inserted(),
                summary.failed_topics()
            );
            for topic in &summary.topics {
                println!(
                    "  {} -> {}: fetched={} inserted={} duplicates={} skipped={} failed={}{}",
                    topic.topic,
                    topic.category,
                    topic.fetched,
                    topic.inserted,
                    topic.duplicates,
                    topic.skipped,
                    topic.failed,
                    topic
                        .upstream_error
                        .as_deref()
                        .map(|e| format!(" error={e}"))
                        .unwrap_or_default()
                );
            }
        }
        RunOutcome::AlreadyRunning => println!("sync skipped: another run is in progress"),
    }
    Ok(())
}

async fn migrate() -> Result<()> {
    let store = open_store(false).await?;
    store.init_schema().await.context("initializing articles schema")?;
    println!("articles schema ready");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine; real deployments set the environment directly.
    let _ = dotenv::dotenv();
    init_tracing();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve { memory: false }) {
        Commands::Serve { memory } => serve(memory).await,
        Commands::Sync => sync_once().await,
        Commands::Migrate => migrate().await,
    }
}
