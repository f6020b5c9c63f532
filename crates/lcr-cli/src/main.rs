use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lcr_storage::{load_license_type_seeds, PgStore};
use lcr_sync::{build_scheduler, maybe_build_scheduler, runner_from_config, SyncConfig, SyncRunner};
use lcr_web::AppState;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "lcr")]
#[command(about = "Licensed company registry sync")]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one full re-ingestion and print the tally.
    Sync,
    /// Create the company and reference tables.
    InitDb,
    /// Load the closed set of license types from a YAML file.
    SeedLicenseTypes {
        #[arg(default_value = "seeds/license_types.yaml")]
        path: PathBuf,
    },
    /// Serve the HTTP trigger (and the weekly schedule when enabled).
    Serve,
    /// Run only the weekly schedule.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "lcr_sync=debug,lcr_adapters=debug,lcr_storage=debug,lcr_web=debug,lcr_cli=debug"
    } else {
        "lcr_sync=info,lcr_adapters=info,lcr_storage=info,lcr_web=info,lcr_cli=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = SyncConfig::from_env();
    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let runner = Arc::new(runner_from_config(config)?);
            cancel_on_ctrl_c(Arc::clone(&runner));
            let summary = runner.trigger().await.context("sync run aborted")?;
            println!(
                "sync complete: run_id={} loaded={} inserted={} updated={} errors={} skipped_ungeocoded={} elapsed_ms={}",
                summary.run_id,
                summary.loaded,
                summary.inserted,
                summary.updated,
                summary.errors,
                summary.skipped_ungeocoded,
                summary.elapsed_ms
            );
            if let Some((expected, received)) = summary.count_mismatch() {
                println!("warning: expected {expected} records, received {received}");
            }
        }
        Commands::InitDb => {
            let store = PgStore::connect_lazy(&config.database_url)?;
            store.init_schema().await?;
            println!("schema ready");
        }
        Commands::SeedLicenseTypes { path } => {
            let seeds = load_license_type_seeds(&path)?;
            let store = PgStore::connect_lazy(&config.database_url)?;
            let written = store.seed_license_types(&seeds).await?;
            println!("seeded {written} license types from {}", path.display());
        }
        Commands::Serve => {
            let port = config.web_port;
            let runner = Arc::new(runner_from_config(config)?);
            let mut scheduler = maybe_build_scheduler(Arc::clone(&runner)).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!("weekly sync scheduled");
            }

            let shutdown_runner = Arc::clone(&runner);
            lcr_web::serve(AppState::new(runner), port, async move {
                wait_for_ctrl_c().await;
                shutdown_runner.shutdown();
            })
            .await?;

            if let Some(sched) = scheduler.as_mut() {
                sched.shutdown().await.context("stopping scheduler")?;
            }
        }
        Commands::Schedule => {
            let cron = config.sync_cron.clone();
            let runner = Arc::new(runner_from_config(config)?);
            let mut sched = build_scheduler(Arc::clone(&runner), &cron).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %cron, "weekly sync scheduled; waiting for ctrl-c");
            wait_for_ctrl_c().await;
            runner.shutdown();
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

async fn wait_for_ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "ctrl-c handler unavailable");
        std::future::pending::<()>().await;
    }
}

fn cancel_on_ctrl_c(runner: Arc<SyncRunner>) {
    tokio::spawn(async move {
        wait_for_ctrl_c().await;
        warn!("ctrl-c received; stopping at the next page or write");
        runner.shutdown();
    });
}
