use analytics_dataplane::config::{PublisherConfig, QueryConfig};
use analytics_dataplane::db::{init_pool, PostgresBackend, PostgresConfig};
use analytics_dataplane::execution::{QueryExecution, QueryExecutor};
use analytics_dataplane::ingestion::{
    BulkLoader, Event, EventEnvelope, EventStore, MemorySink, MemoryStream, StreamPublisher,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dataplane")]
#[command(about = "Analytics data plane: event ingestion and SQL query execution")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a query and print the typed result as JSON
    Query {
        sql: String,

        /// Cancel the query if it has not finished in time
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Run a statement for its side effect (DDL, DML)
    Update {
        sql: String,

        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Publish JSON-lines events through the in-process stream
    Ingest {
        file: PathBuf,

        /// Use the direct bulk path instead of the stream
        #[arg(long)]
        bulk: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Query { sql, timeout_ms } => {
            let executor = connect_executor().await?;
            finish(executor.execute_raw(&sql), timeout_ms).await
        }
        Commands::Update { sql, timeout_ms } => {
            let executor = connect_executor().await?;
            finish(executor.execute_update(&sql), timeout_ms).await
        }
        Commands::Ingest { file, bulk } => ingest(&file, bulk).await,
    }
}

async fn connect_executor() -> Result<QueryExecutor> {
    let pg_config = PostgresConfig::from_env()?;
    let pool = init_pool(&pg_config)
        .await
        .context("Failed to connect to Postgres")?;
    let query_config = QueryConfig::from_env()?;
    Ok(QueryExecutor::new(Arc::new(PostgresBackend::new(pool)), &query_config))
}

/// Wait for the result, killing the query if the deadline passes first.
async fn finish(execution: QueryExecution, timeout_ms: Option<u64>) -> Result<()> {
    info!("Query {} submitted", execution.id());

    let result = match timeout_ms {
        Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), execution.get_result()).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Query {} timed out after {} ms, cancelling", execution.id(), ms);
                execution.kill().await;
                execution.get_result().await
            }
        },
        None => execution.get_result().await,
    };

    println!("{}", serde_json::to_string_pretty(result.as_ref())?);
    if let Some(error) = result.error() {
        anyhow::bail!("Query failed: {}", error.message);
    }
    Ok(())
}

async fn ingest(file: &Path, bulk: bool) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let events = content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(number, line)| -> Result<Event> {
            let envelope: EventEnvelope = serde_json::from_str(line)
                .with_context(|| format!("Invalid event on line {}", number + 1))?;
            envelope
                .into_event()
                .with_context(|| format!("Invalid event on line {}", number + 1))
        })
        .collect::<Result<Vec<_>>>()?;

    let config = PublisherConfig::from_env()?;
    let stream_name = config.stream_name.clone();
    let stream = Arc::new(MemoryStream::new());
    let sink = Arc::new(MemorySink::new());
    let publisher = StreamPublisher::new(stream.clone(), Arc::new(BulkLoader::new(sink.clone())), config)?;

    if bulk {
        publisher.store_bulk(&events).await?;
        info!("Bulk loaded {} events in {} batches", sink.row_count(), sink.batches().len());
        return Ok(());
    }

    let failed = publisher.store_batch(&events).await?;
    info!(
        "Published {} events to {} ({} stored, {} failed)",
        events.len(),
        stream_name,
        stream.record_count(&stream_name),
        failed.len()
    );
    println!("{}", serde_json::json!({ "failed": failed }));
    Ok(())
}
