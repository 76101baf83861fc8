//! changefeed-migrator - replay a source container's change feed into a destination container.

use anyhow::Context;
use changefeed_migrator::connection::{connect, container_namespace, ping};
use changefeed_migrator::lease::now_ms;
use changefeed_migrator::resilience::RetryConfig;
use changefeed_migrator::{
    LeaseStore, MigrationConfig, MigrationEngine, RedisChangeFeed, RedisDestination, SqliteLeaseStore,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Continuous change-feed migration between partitioned containers
#[derive(Parser, Debug)]
#[command(name = "changefeed-migrator")]
#[command(author, version, about)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "migration.yaml", global = true)]
    config: PathBuf,

    /// Enable debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the migration until Ctrl-C (default)
    Run,

    /// Load and validate the configuration, then exit
    Validate,

    /// Print the lease table
    Leases {
        /// Also print records skipped as permanently rejected
        #[arg(long)]
        skipped: bool,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "changefeed_migrator=debug,info"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => cmd_run(&cli.config).await,
        Commands::Validate => cmd_validate(&cli.config),
        Commands::Leases { skipped } => cmd_leases(&cli.config, skipped).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("changefeed-migrator failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<MigrationConfig> {
    MigrationConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
}

// ── Run ─────────────────────────────────────────────────────────────

async fn cmd_run(path: &Path) -> anyhow::Result<()> {
    let config = load_config(path)?;

    let mut conn = connect(&config.connection, &RetryConfig::startup())
        .await
        .context("connecting to account")?;
    let latency = ping(&mut conn).await.context("pinging account")?;
    info!(latency_ms = latency.as_millis() as u64, "Account reachable");

    let database = &config.connection.database_name;
    let feed = RedisChangeFeed::new(
        conn.clone(),
        container_namespace(database, &config.target.source_container),
        config.target.source_partition_key_path.clone(),
    );
    let destination = RedisDestination::new(
        conn,
        container_namespace(database, &config.target.destination_container),
        config.destination.max_item_bytes,
    );
    let lease_store = Arc::new(
        SqliteLeaseStore::open(&config.lease, &config.processor_name)
            .await
            .context("opening lease store")?,
    );

    let mut engine = MigrationEngine::new(
        config,
        Arc::new(feed),
        Arc::clone(&lease_store) as Arc<dyn LeaseStore>,
        Arc::new(destination),
    );
    engine.start().await.context("starting migration engine")?;

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Ctrl-C received, shutting down");

    engine.shutdown().await;
    lease_store.close().await;
    Ok(())
}

// ── Validate ────────────────────────────────────────────────────────

fn cmd_validate(path: &Path) -> anyhow::Result<()> {
    let config = load_config(path)?;
    println!(
        "{}: ok (instance {}, {} -> {}, lease store {})",
        path.display(),
        config.instance_name,
        config.target.source_container,
        config.target.destination_container,
        config.lease.sqlite_path
    );
    Ok(())
}

// ── Leases ──────────────────────────────────────────────────────────

async fn cmd_leases(path: &Path, show_skipped: bool) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let store = SqliteLeaseStore::open(&config.lease, &config.processor_name)
        .await
        .context("opening lease store")?;
    store.initialize().await?;

    let leases = store.read_all().await?;
    let now = now_ms();
    println!("{:<24} {:<24} {:>8} {:>12}  CONTINUATION", "PARTITION", "OWNER", "VERSION", "EXPIRES_IN");
    for lease in &leases {
        let expires = if lease.is_live(now) {
            format!("{}s", (lease.expires_at_ms - now) / 1000)
        } else {
            "-".to_string()
        };
        println!(
            "{:<24} {:<24} {:>8} {:>12}  {}",
            lease.partition_id,
            lease.owner.as_deref().unwrap_or("-"),
            lease.version,
            expires,
            lease.continuation.as_ref().map(|t| t.as_str()).unwrap_or("<start>")
        );
    }
    println!("{} lease(s)", leases.len());

    if show_skipped {
        let skipped = store.skipped().await?;
        println!();
        println!("{:<24} {:<32} {:<16}  REASON", "PARTITION", "RECORD", "PARTITION_KEY");
        for record in &skipped {
            println!(
                "{:<24} {:<32} {:<16}  {}",
                record.partition_id,
                record.record_id,
                record.partition_key.as_deref().unwrap_or("-"),
                record.reason
            );
        }
        println!("{} skipped record(s)", skipped.len());
    }

    store.close().await;
    Ok(())
}
