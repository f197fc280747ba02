//! vaultflow - batched vault tokenization and bulk deletion
//!
//! # Usage
//!
//! ```bash
//! # Tokenize newline-delimited values from stdin
//! vaultflow -c vaultflow.yaml tokenize --table persons --column email < emails.txt
//!
//! # Detokenize tokens from a file
//! vaultflow detokenize --input tokens.txt
//!
//! # Drain the configured tables (or the ones given)
//! vaultflow delete --table persons --table cards
//!
//! # Validate configuration
//! vaultflow -c vaultflow.yaml validate
//! ```
//!
//! Results are written to stdout as JSON lines; logs go to stderr.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vaultflow_core::{
    AppConfig, BatchEngine, BulkDeleteController, BulkDeleteOptions, Destination, DrainState,
    EngineOptions, HttpVaultClient, RunReport,
};

#[derive(Parser)]
#[command(name = "vaultflow")]
#[command(version, about = "Batched, retrying vault tokenization and bulk deletion")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "vaultflow.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Tokenize newline-delimited values
    Tokenize {
        /// Destination table
        #[arg(long)]
        table: String,
        /// Destination column
        #[arg(long)]
        column: String,
        /// Input file (default: stdin)
        #[arg(long)]
        input: Option<PathBuf>,
    },
    /// Detokenize newline-delimited tokens
    Detokenize {
        /// Input file (default: stdin)
        #[arg(long)]
        input: Option<PathBuf>,
    },
    /// Delete every record from the given tables (default: from config)
    Delete {
        #[arg(long = "table")]
        tables: Vec<String>,
    },
    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
    init_logging(cli.verbose, &config.log_level);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received shutdown signal (Ctrl+C), cancelling");
            trigger.cancel();
        }
    });

    match cli.command {
        Commands::Tokenize {
            table,
            column,
            input,
        } => tokenize(&config, &table, &column, input.as_deref(), &cancel).await,
        Commands::Detokenize { input } => detokenize(&config, input.as_deref(), &cancel).await,
        Commands::Delete { tables } => delete(&config, tables, &cancel).await,
        Commands::Validate => validate_config(&config),
    }
}

/// `-v` forces debug; otherwise `RUST_LOG`, then the configured level
fn init_logging(verbose: bool, log_level: &str) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn build_engine(config: &AppConfig) -> Result<BatchEngine> {
    let client = HttpVaultClient::from_app_config(config).context("Failed to create vault client")?;
    Ok(BatchEngine::new(
        Arc::new(client),
        EngineOptions::from_config(&config.engine),
    ))
}

/// Non-empty lines from `input`, or stdin
fn read_lines(input: Option<&Path>) -> Result<Vec<String>> {
    let reader: Box<dyn BufRead> = match input {
        Some(path) => Box::new(BufReader::new(
            std::fs::File::open(path)
                .with_context(|| format!("Failed to open {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(std::io::stdin())),
    };

    let mut lines = Vec::new();
    for line in reader.lines() {
        let line = line.context("Failed to read input")?;
        let line = line.trim_end_matches('\r');
        if !line.is_empty() {
            lines.push(line.to_string());
        }
    }
    Ok(lines)
}

/// Write one JSON line per result to stdout
fn print_results(report: &RunReport, value_field: &str) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for result in &report.results {
        let line = match (&result.outcome, result.value()) {
            (Ok(_), Some(value)) => serde_json::json!({
                "index": result.index,
                value_field: value,
            }),
            (Ok(value), None) => serde_json::json!({
                "index": result.index,
                value_field: format!("{:?}", value),
            }),
            (Err(e), _) => serde_json::json!({
                "index": result.index,
                "error": e.message,
                "kind": e.kind.as_str(),
            }),
        };
        writeln!(out, "{}", line)?;
    }
    out.flush()?;
    Ok(())
}

fn summarize(report: &RunReport) -> Result<()> {
    let stats = &report.stats;
    info!(
        "Done in {:?}: {} succeeded ({} after retry), {} failed, {} cancelled, {} rate limited",
        report.elapsed,
        stats.succeeded,
        stats.retried_succeeded,
        stats.failed,
        stats.cancelled,
        stats.rate_limited
    );
    if report.timed_out {
        warn!("Submission timeout reached before all batches finished");
    }
    if report.auth_failed {
        anyhow::bail!("Vault rejected the bearer token (HTTP 401)");
    }
    Ok(())
}

async fn tokenize(
    config: &AppConfig,
    table: &str,
    column: &str,
    input: Option<&Path>,
    cancel: &CancellationToken,
) -> Result<()> {
    let values = read_lines(input)?;
    info!("Tokenizing {} values into {}.{}", values.len(), table, column);

    let engine = build_engine(config)?;
    let destination = Destination::new(&config.vault.vault_id, table, column);
    let report = engine.tokenize_values(values, &destination, cancel).await?;

    print_results(&report, "token")?;
    summarize(&report)
}

async fn detokenize(
    config: &AppConfig,
    input: Option<&Path>,
    cancel: &CancellationToken,
) -> Result<()> {
    let tokens = read_lines(input)?;
    info!("Detokenizing {} tokens", tokens.len());

    let engine = build_engine(config)?;
    let destination = Destination::new(&config.vault.vault_id, "detokenize", "token");
    let report = engine.detokenize_tokens(tokens, &destination, cancel).await?;

    print_results(&report, "value")?;
    summarize(&report)
}

async fn delete(config: &AppConfig, tables: Vec<String>, cancel: &CancellationToken) -> Result<()> {
    let tables = if tables.is_empty() {
        config.bulk_delete.tables.clone()
    } else {
        tables
    };
    if tables.is_empty() {
        anyhow::bail!("No tables given; pass --table or set bulk_delete.tables");
    }

    let client = HttpVaultClient::from_app_config(config).context("Failed to create vault client")?;
    let controller =
        BulkDeleteController::new(Arc::new(client), BulkDeleteOptions::from_config(config));

    info!("Draining {} table(s): {}", tables.len(), tables.join(", "));
    let reports = controller.drain_all(&tables, cancel).await?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for report in &reports {
        writeln!(out, "{}", serde_json::to_string(report)?)?;
    }
    out.flush()?;

    let unclean: Vec<_> = reports
        .iter()
        .filter(|r| {
            matches!(
                r.state,
                DrainState::AbortedAuthFailure
                    | DrainState::ExhaustedWithFailures
                    | DrainState::Cancelled
            )
        })
        .collect();
    for report in &unclean {
        error!("{}: {}", report.resource, report.state);
    }
    if !unclean.is_empty() || reports.len() < tables.len() {
        anyhow::bail!(
            "{} of {} table(s) did not drain cleanly",
            tables.len() - (reports.len() - unclean.len()),
            tables.len()
        );
    }
    Ok(())
}

fn validate_config(config: &AppConfig) -> Result<()> {
    println!("✓ Configuration valid!\n");

    println!("Vault:");
    println!("  URL: {}", config.vault.url);
    println!("  Vault ID: {}", config.vault.vault_id);
    println!("  Bearer token: {}", config.vault.bearer_token);
    println!("  Log level: {}", config.log_level);

    let engine = &config.engine;
    println!("\nEngine:");
    println!("  Batch size: {}", engine.batch_size);
    println!(
        "  Workers: {} (queue depth {})",
        engine.worker_count,
        engine.queue_depth()
    );
    println!(
        "  Retries: {} attempts, base delay {}ms, max delay {}ms",
        engine.max_retries, engine.base_delay_ms, engine.max_delay_ms
    );
    println!(
        "  Connections: {} max, {} idle",
        engine.max_connections, engine.max_idle_connections
    );
    if let Some(timeout) = engine.submission_timeout_ms {
        println!("  Submission timeout: {}ms", timeout);
    }

    let bulk = &config.bulk_delete;
    println!("\nBulk delete:");
    println!(
        "  Fetch: {} workers × {} records",
        bulk.fetch_workers, bulk.fetch_limit
    );
    println!(
        "  Delete: {} workers × {} ids per batch",
        bulk.delete_workers, bulk.delete_batch_size
    );
    match bulk.max_records_per_resource {
        Some(max) => println!("  Ceiling: {} records per table", max),
        None => println!("  Ceiling: none"),
    }
    if bulk.tables.is_empty() {
        println!("  Tables: (none configured)");
    } else {
        println!("  Tables:");
        for table in &bulk.tables {
            println!("    - {}", table);
        }
    }

    Ok(())
}
