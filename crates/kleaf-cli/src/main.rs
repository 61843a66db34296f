use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kleaf_catalog::{
    build_ingest_scheduler, connect_options_from_env, ingest_with_timeout, CatalogIngestor,
    IngestConfig, IngestReport, KeyValueLoader, PgCatalogStore, RedisTitleSet, TitleSink,
};
use kleaf_core::env_or;
use kleaf_trivia::{build_title_source, TriviaConfig, TriviaService};
use kleaf_web::{AppState, WebConfig};
use kleaf_wiki::{open_dump_file, DumpReader, EncyclopediaClient, WikiClientConfig, WikipediaClient};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "kleaf=info,tower_http=info";

#[derive(Debug, Parser)]
#[command(name = "kleaf")]
#[command(about = "Knowledge Leaf trivia service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the HTTP API.
    Serve,
    /// Load the title dump into the Postgres catalog.
    Ingest {
        /// Read a local dump instead of downloading it.
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Load the title dump into the Redis title set.
    LoadKv {
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Run catalog ingestion on the configured cron schedule until interrupted.
    Schedule,
    /// Apply database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve().await?,
        Commands::Ingest { file } => {
            let store = PgCatalogStore::connect(connect_options_from_env()?).await?;
            let ingestor = CatalogIngestor::new(Arc::new(store));
            let report = run_ingest(file, &ingestor).await?;
            print_report(&ingestor, &report);
        }
        Commands::LoadKv { file } => {
            let config = TriviaConfig::from_env()?;
            let set =
                RedisTitleSet::connect(&config.redis_dsn, config.redis_key.clone(), config.redis_set_kind)
                    .await?;
            let loader = KeyValueLoader::new(Arc::new(set));
            let report = run_ingest(file, &loader).await?;
            print_report(&loader, &report);
        }
        Commands::Schedule => {
            let mut config = IngestConfig::from_env();
            config.scheduler_enabled = true;
            let Some(mut sched) = scheduler(config).await? else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!("ingestion scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Migrate => {
            let store = PgCatalogStore::connect(connect_options_from_env()?).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let registry = tracing_subscriber::registry().with(filter);
    if env_or("LOG_FORMAT", "text").eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn serve() -> Result<()> {
    let trivia_config = TriviaConfig::from_env()?;
    let source = build_title_source(&trivia_config).await?;
    let client = Arc::new(WikipediaClient::new(WikiClientConfig::from_env())?);
    let trivia = TriviaService::new(source, client);

    // Optional in-process ingestion alongside the API.
    let ingest_config = IngestConfig::from_env();
    let sched = if ingest_config.scheduler_enabled {
        scheduler(ingest_config).await?
    } else {
        None
    };
    if let Some(sched) = &sched {
        sched.start().await.context("starting scheduler")?;
    }

    kleaf_web::serve(AppState::new(Arc::new(trivia)), WebConfig::from_env()).await?;

    if let Some(mut sched) = sched {
        sched.shutdown().await.context("stopping scheduler")?;
    }
    Ok(())
}

async fn scheduler(config: IngestConfig) -> Result<Option<tokio_cron_scheduler::JobScheduler>> {
    let store = PgCatalogStore::connect(connect_options_from_env()?).await?;
    let ingestor = CatalogIngestor::new(Arc::new(store));
    let client = Arc::new(WikipediaClient::new(WikiClientConfig::from_env())?);
    let run_config = config.clone();

    build_ingest_scheduler(&config, move || {
        let ingestor = ingestor.clone();
        let client = client.clone();
        let config = run_config.clone();
        async move {
            let reader = client.dump().await.context("opening dump stream")?;
            ingest_with_timeout(reader, &ingestor, &config).await
        }
    })
    .await
}

async fn run_ingest(file: Option<PathBuf>, sink: &dyn TitleSink) -> Result<IngestReport> {
    let config = IngestConfig::from_env();
    let reader: DumpReader = match file {
        Some(path) => open_dump_file(&path).await?,
        None => {
            let client = WikipediaClient::new(WikiClientConfig::from_env())?;
            info!(url = %client.config().dump_url, "downloading dump");
            client.dump().await.context("opening dump stream")?
        }
    };
    ingest_with_timeout(reader, sink, &config).await
}

fn print_report(sink: &dyn TitleSink, report: &IngestReport) {
    println!(
        "ingest complete: sink={} lines={} accepted={} rejected={} batches={} inserted={}",
        sink.name(),
        report.lines_read,
        report.accepted,
        report.rejected,
        report.batches,
        report.inserted
    );
}
