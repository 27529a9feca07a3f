//! Botica vault command line entry point
//!
//! Seals sales exports into the encrypted store and runs the
//! extract/transform/aggregate pipeline over them, printing only
//! aggregated results and processing reports.

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use botica_vault::{
    config::VaultConfig,
    key_provider::{generate_key_hex, KeyProvider},
    AggregateResult, DatasetOutcome, MetricsCollector, PipelineOrchestrator, SealedStore,
};

/// Botica vault command line interface
#[derive(Parser)]
#[command(name = "botica")]
#[command(about = "Encrypted storage and analytics pipeline for pharmacy sales exports")]
#[command(version = "0.1.0")]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (overrides the configuration file)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long)]
    json_logs: bool,

    /// Subcommand
    #[command(subcommand)]
    command: Commands,
}

/// Available commands
#[derive(Subcommand)]
enum Commands {
    /// Generate a new hex-encoded encryption key
    Keygen,

    /// Seal one plaintext export as a dataset
    Seal {
        /// Dataset id
        #[arg(short, long)]
        dataset: String,

        /// Plaintext export to seal
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Seal every export of a directory, one dataset per file
    Ingest {
        /// Directory holding plaintext exports
        #[arg(short, long)]
        source: PathBuf,

        /// Extension of the exports to seal
        #[arg(short, long, default_value = "csv")]
        extension: String,
    },

    /// List sealed datasets
    List,

    /// Run the pipeline and print outcomes as JSON
    Process {
        /// Datasets to process
        datasets: Vec<String>,

        /// Process every sealed dataset
        #[arg(long)]
        all: bool,

        /// Include the combined result of the datasets that finished
        #[arg(long)]
        combined: bool,

        /// Write the JSON to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,
    },

    /// Process every sealed dataset and export the pipeline metrics
    Metrics {
        /// Output format (json, prometheus)
        #[arg(short, long, default_value = "prometheus")]
        format: String,
    },
}

/// JSON document printed by `process`
#[derive(Serialize)]
struct ProcessOutput<'a> {
    batch_id: Uuid,
    outcomes: &'a [DatasetOutcome],
    #[serde(skip_serializing_if = "Option::is_none")]
    combined: Option<&'a AggregateResult>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load_configuration(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {:#}", e);
            process::exit(1);
        }
    };

    if let Err(e) = initialize_logging(&cli, &config) {
        eprintln!("Failed to initialize logging: {:#}", e);
        process::exit(1);
    }

    let result = match &cli.command {
        Commands::Keygen => keygen(),
        Commands::Seal { dataset, input } => seal(&config, dataset, input),
        Commands::Ingest { source, extension } => ingest(&config, source, extension),
        Commands::List => list(&config),
        Commands::Process { datasets, all, combined, output } => {
            process_datasets(&config, datasets, *all, *combined, output.as_deref()).await
        }
        Commands::Config { show } => handle_config(&config, *show),
        Commands::Metrics { format } => export_metrics(&config, format).await,
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        process::exit(1);
    }
}

/// Initialize logging from the CLI flags and configuration
fn initialize_logging(cli: &Cli, config: &VaultConfig) -> Result<()> {
    let requested = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    let log_level = match requested.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("botica_vault={}", log_level).parse()?)
        .add_directive(format!("botica={}", log_level).parse()?)
        .add_directive("tokio=warn".parse()?);

    // Logs go to stderr so that JSON results on stdout stay parseable.
    if cli.json_logs || config.logging.format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }

    Ok(())
}

/// Load configuration: explicit file, then default location, then defaults
fn load_configuration(cli: &Cli) -> Result<VaultConfig> {
    if let Some(path) = &cli.config {
        if !path.exists() {
            bail!("configuration file not found: {}", path.display());
        }
    }

    let path = cli
        .config
        .clone()
        .or_else(|| VaultConfig::default_config_path().ok());

    VaultConfig::load_with_fallback(path).context("invalid configuration")
}

fn open_store(config: &VaultConfig) -> Result<SealedStore> {
    let keys = Arc::new(KeyProvider::from_config(&config.key));
    SealedStore::new(config.storage.clone(), keys)
        .with_context(|| format!("cannot open sealed directory {}", config.storage.sealed_dir.display()))
}

/// Print a fresh key for provisioning the key source
fn keygen() -> Result<()> {
    let key = generate_key_hex();
    println!("{}", key.as_str());
    eprintln!("Store this value in the configured key source; it is not saved anywhere.");
    Ok(())
}

fn seal(config: &VaultConfig, dataset: &str, input: &Path) -> Result<()> {
    let store = open_store(config)?;
    let plaintext = zeroize::Zeroizing::new(
        std::fs::read(input).with_context(|| format!("cannot read {}", input.display()))?,
    );

    let path = store.store(dataset, &plaintext)?;
    println!("Sealed {} -> {}", dataset, path.display());
    Ok(())
}

fn ingest(config: &VaultConfig, source: &Path, extension: &str) -> Result<()> {
    let store = open_store(config)?;
    let report = store.ingest_directory(source, extension)?;

    for (dataset, path) in &report.sealed {
        println!("sealed  {:<20} {}", dataset, path.display());
    }
    for failure in &report.failed {
        println!("failed  {:<20} {}", failure.source.display(), failure.reason);
    }

    if report.sealed.is_empty() && !report.failed.is_empty() {
        bail!("no dataset could be sealed");
    }
    Ok(())
}

fn list(config: &VaultConfig) -> Result<()> {
    let store = open_store(config)?;
    for dataset in store.list_datasets()? {
        println!("{}", dataset);
    }
    Ok(())
}

/// Cancel `token` on Ctrl-C
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling batch");
            token.cancel();
        }
    });
}

async fn process_datasets(
    config: &VaultConfig,
    datasets: &[String],
    all: bool,
    combined: bool,
    output: Option<&Path>,
) -> Result<()> {
    if all == !datasets.is_empty() {
        bail!("either name the datasets to process or pass --all");
    }

    let store = Arc::new(open_store(config)?);
    let pipeline = PipelineOrchestrator::new(store, config);

    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());

    let batch = if all {
        pipeline.run_all(cancel).await?
    } else {
        pipeline.run_batch(datasets, cancel).await
    };

    let document = ProcessOutput {
        batch_id: batch.batch_id,
        outcomes: &batch.outcomes,
        combined: if combined { batch.combined.as_ref() } else { None },
    };
    let json = serde_json::to_string_pretty(&document)?;

    match output {
        Some(path) => {
            std::fs::write(path, json).with_context(|| format!("cannot write {}", path.display()))?;
            info!("Results written to {}", path.display());
        }
        None => println!("{}", json),
    }

    info!(done = batch.done_count(), failed = batch.failed_count(), "Processing finished");
    Ok(())
}

/// Handle configuration commands
fn handle_config(config: &VaultConfig, show: bool) -> Result<()> {
    if show {
        println!("Effective configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    } else {
        config.validate()?;
        println!("Configuration is valid");
    }

    Ok(())
}

async fn export_metrics(config: &VaultConfig, format: &str) -> Result<()> {
    let metrics = Arc::new(MetricsCollector::new()?);
    let store = Arc::new(open_store(config)?.with_metrics(metrics.clone()));
    let pipeline = PipelineOrchestrator::new(store, config).with_metrics(metrics.clone());

    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());
    pipeline.run_all(cancel).await?;

    println!("{}", metrics.export_metrics(format)?);
    Ok(())
}
