//! rivven-shard - Operator tooling for shard migrations
//!
//! # Usage
//!
//! ```bash
//! # Check filters and configuration
//! rivven-shard -c shard.yaml validate
//!
//! # Post the configured lock / unlock webhooks by hand
//! rivven-shard -c shard.yaml lock
//! rivven-shard -c shard.yaml unlock
//! ```
//!
//! A migration that aborts after taking the write lock leaves it held.
//! `unlock` is how an operator releases it once the situation is understood.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rivven_shard::{FilterCell, HttpCallback, ShardingConfig};

#[derive(Parser)]
#[command(name = "rivven-shard")]
#[command(version, about = "Live single-shard migration for Rivven")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "shard.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate configuration file and filters
    Validate,
    /// Post the cutover lock webhook
    Lock,
    /// Post the cutover unlock webhook
    Unlock,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = ShardingConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    match cli.command {
        Commands::Validate => validate_config(&config),
        Commands::Lock => post_webhook("cutover_lock", &config.cutover_lock).await,
        Commands::Unlock => post_webhook("cutover_unlock", &config.cutover_unlock).await,
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

fn validate_config(config: &ShardingConfig) -> Result<()> {
    let filters = FilterCell::build(config).context("Failed to build shard filters")?;

    println!("✓ Configuration valid!\n");

    println!("Shard:");
    println!("  Source: {}", config.source_db);
    println!("  Target: {}", config.target_db);
    println!(
        "  Sharding key: {} = {}",
        config.sharding_key,
        filters.row_filter().sharding_value()
    );
    println!();

    println!("Tables:");
    let mut joined: Vec<_> = config.joined_tables.iter().collect();
    joined.sort_by(|a, b| a.0.cmp(b.0));
    for (table, joins) in joined {
        let refs: Vec<String> = joins
            .iter()
            .map(|j| format!("{}.{}", j.table_name, j.join_column))
            .collect();
        println!("  Joined: {} <- {}", table, refs.join(", "));
    }
    for table in &config.primary_key_tables {
        println!("  Primary key: {}", table);
    }
    for pattern in &config.ignored_tables {
        println!("  Ignored: /{}/", pattern);
    }
    println!();

    println!("Copy:");
    println!("  Batch size: {}", config.data_iteration_batch_size);
    println!("  Read retries: {}", config.db_read_retries);
    println!("  Concurrency: {}", config.data_iteration_concurrency);
    println!("  Verifier concurrency: {}", config.verifier_concurrency());
    match &config.throttle {
        Some(throttle) => println!(
            "  Throttle: max lag {}s, checked every {}ms",
            throttle.max_lag_secs, throttle.update_interval_ms
        ),
        None => println!("  Throttle: disabled"),
    }
    println!();

    println!("Cutover:");
    println!("  Lock: {}", config.cutover_lock.uri);
    println!("  Unlock: {}", config.cutover_unlock.uri);
    if let Some(callback) = &config.error_callback {
        println!("  Error callback: {}", callback.uri);
    }

    Ok(())
}

async fn post_webhook(name: &str, callback: &HttpCallback) -> Result<()> {
    info!(webhook = name, uri = %callback.uri, "posting webhook");

    let client = reqwest::Client::new();
    callback
        .post(&client)
        .await
        .with_context(|| format!("{} webhook {} failed", name, callback.uri))?;

    println!("✓ {} accepted by {}", name, callback.uri);
    Ok(())
}
