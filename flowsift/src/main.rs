use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flow_filter::Filter;
use flowsift_core::CancelToken;
use importer::{ImportOptions, ImportRequest};
use retention::RetentionController;
use std::path::PathBuf;
use std::sync::Arc;
use telemetry_store::HttpStore;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

mod config;

#[derive(Debug, Parser)]
#[command(name = "flowsift", version, about = "Zeek log import and retention for a columnar store")]
struct Cli {
    /// Optional config file (YAML). If omitted, loads ./flowsift.yaml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print version information
    Version,
    /// Import a directory of Zeek JSON logs into a dataset
    Import {
        /// Directory holding conn/http/ssl/dns log files
        dir: PathBuf,
        /// Dataset (database) name to import into
        dataset: String,
        /// Mark this import as part of a rolling dataset; assigns retention tiers
        #[arg(long)]
        rolling: bool,
        /// Drop the dataset and its bookkeeping before importing
        #[arg(long)]
        rebuild: bool,
    },
    /// Run a retention pass: force merges so aged rows are deleted
    Retention {
        /// Datasets to cover; defaults to everything the metadatabase knows
        #[arg(long = "dataset")]
        datasets: Vec<String>,
        /// Restrict the metadata pass to a single table
        #[arg(long)]
        only_meta_table: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = config::load_config(cli.config.as_deref()).unwrap_or_default();

    let cancel = CancelToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, stopping");
                cancel.cancel();
            }
        })
    };

    let connection = config
        .db_connection
        .clone()
        .unwrap_or_else(|| "http://localhost:8123".to_string());

    let result = match cli.command {
        Commands::Version => {
            println!("flowsift {}", flowsift_core::version());
            Ok(())
        }
        Commands::Import { dir, dataset, rolling, rebuild } => {
            let filter = Filter::from_spec(&config.filter).context("invalid filter configuration")?;
            let store = HttpStore::new(&connection).context("store connection")?;
            let tuning = config.import.clone().unwrap_or_default();
            let defaults = ImportOptions::default();
            let opts = ImportOptions {
                batch_size: tuning.batch_size.unwrap_or(defaults.batch_size),
                writers: tuning.writers.unwrap_or(defaults.writers),
                queue_depth: tuning.queue_depth.unwrap_or(defaults.queue_depth),
            };
            let import_time_micros =
                (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000) as i64;
            let request = ImportRequest { dir, dataset, import_time_micros, rolling, rebuild };
            let summary = importer::run_import(
                Arc::new(store),
                Arc::new(filter),
                request,
                opts,
                cancel.clone(),
            )
            .await?;
            println!(
                "import {} finished: {} files, {} records, {} parse errors",
                summary.import_id,
                summary.files_imported,
                summary.records_written,
                summary.parse_errors
            );
            Ok(())
        }
        Commands::Retention { datasets, only_meta_table } => {
            let store = HttpStore::new(&connection).context("store connection")?;
            let controller = RetentionController::new(store);
            let datasets = if datasets.is_empty() {
                controller.known_datasets(&cancel).await?
            } else {
                datasets
            };
            let report = controller.run(&datasets, only_meta_table.as_deref(), &cancel).await?;
            println!(
                "retention pass finished: {} metadata tables, {} dataset tables",
                report.metadata_tables, report.dataset_tables
            );
            Ok(())
        }
    };

    watcher.abort();
    result
}
