use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use vpo_sync::{maybe_build_scheduler, runtime_from_env, SyncConfig};

#[derive(Debug, Parser)]
#[command(name = "vpo-cli")]
#[command(about = "Vehicle purchase offers: lead sync, maintenance and admin API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull ready leads from the partner API into inspection entries.
    Sync {
        /// Replay pages from a JSON fixture instead of calling the partner API.
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
    /// Run the follow-up, unassigned-alert and auto-unassignment passes.
    Scheduled,
    /// Serve the admin API, plus cron jobs when VPO_SCHEDULER_ENABLED is set.
    Serve,
    /// Apply pending database migrations.
    Migrate,
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .context("building log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|err| anyhow::anyhow!("installing tracing subscriber: {err}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing()?;
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { fixture: None }) {
        Commands::Sync { fixture } => {
            let summary = vpo_sync::run_sync_once_from_env(fixture).await?;
            println!("{}", serde_json_line(&summary)?);
        }
        Commands::Scheduled => {
            let summary = vpo_sync::run_scheduled_once_from_env().await?;
            println!("{}", serde_json_line(&summary)?);
        }
        Commands::Serve => {
            let config = SyncConfig::from_env();
            let _scheduler = if config.scheduler_enabled {
                let runtime = runtime_from_env(&config, None).await?;
                match maybe_build_scheduler(&config, &runtime).await? {
                    Some(sched) => {
                        sched.start().await.context("starting scheduler")?;
                        tracing::info!(
                            sync_cron = %config.sync_cron,
                            scheduled_cron = %config.scheduled_cron,
                            "scheduler started"
                        );
                        Some(sched)
                    }
                    None => None,
                }
            } else {
                None
            };
            vpo_web::serve_from_env().await?;
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let pool = vpo_storage::postgres::connect(&config.database_url).await?;
            vpo_storage::postgres::migrate(&pool).await?;
            tracing::info!("migrations applied");
        }
    }

    Ok(())
}

fn serde_json_line<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("serializing command summary")
}
