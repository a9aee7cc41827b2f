mod api;
mod config;
mod metrics;
mod pipelines;
mod serve;

use clap::{Parser, Subcommand};

use gantry_db::config::DbConfig;
use gantry_db::pool;

use config::BrokerConfig;

#[derive(Parser)]
#[command(name = "gantry", about = "Service broker for managed runtimes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the broker: recovery, worker queues, and the HTTP surface
    Serve,
    /// Create the gantry database and run migrations
    DbInit,
}

/// Execute the `gantry db-init` command: create database and run
/// migrations.
async fn cmd_db_init() -> anyhow::Result<()> {
    let db_config = DbConfig::from_env();

    println!("Initializing gantry database...");

    pool::ensure_database_exists(&db_config).await?;
    let db_pool = pool::create_pool(&db_config).await?;
    pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;
    db_pool.close().await;

    println!("gantry db-init complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => {
            let config = BrokerConfig::from_env()?;
            serve::run_serve(config).await?;
        }
        Commands::DbInit => {
            cmd_db_init().await?;
        }
    }

    Ok(())
}
