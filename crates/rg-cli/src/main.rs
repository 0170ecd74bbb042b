use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rg_engine::{maybe_build_scheduler, EngineConfig, RateGuardianEngine, RunRequest};
use rg_storage::PgStore;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rg-cli")]
#[command(about = "Rate Guardian command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the engine once.
    Run {
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        contact_id: Option<String>,
        #[arg(long)]
        email: Option<String>,
    },
    /// Retry delivery of undelivered alerts.
    Relay,
    /// Classify recorded alerts against their loan profiles.
    Classify,
    Migrate,
    Serve,
    /// Run the engine on RG_ENGINE_CRON until interrupted.
    Schedule,
}

fn init_tracing() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if std::env::var("RG_LOG_FORMAT").as_deref() == Ok("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run {
        limit: None,
        contact_id: None,
        email: None,
    }) {
        Commands::Run {
            limit,
            contact_id,
            email,
        } => {
            let result = rg_engine::run_engine_once_from_env(RunRequest {
                limit,
                contact_id,
                email,
            })
            .await?;
            println!(
                "run complete: run_id={} status={} contacts={} opportunities={} alerts={}",
                result.run_id,
                result.status.as_str(),
                result.contacts_processed,
                result.opportunities_found,
                result.alerts_sent
            );
            if let Some(err) = result.last_error {
                println!("last_error: {err}");
            }
        }
        Commands::Relay => {
            let engine = engine_from_env()?;
            let summary = engine.relay_pending_alerts().await?;
            println!("relay complete: sent={} failed={}", summary.sent, summary.failed);
        }
        Commands::Classify => {
            let engine = engine_from_env()?;
            let inserted = engine.classify_pending().await?;
            println!("classification complete: inserted={inserted}");
        }
        Commands::Migrate => {
            let config = EngineConfig::from_env()?;
            let settings = config.store.require().context("store configuration")?;
            let store = PgStore::connect(&settings.database_url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            rg_web::serve_from_env().await?;
        }
        Commands::Schedule => {
            let mut config = EngineConfig::from_env()?;
            config.scheduler_enabled = true;
            let engine = Arc::new(RateGuardianEngine::from_config(&config)?);
            let Some(sched) = maybe_build_scheduler(engine, &config).await? else {
                anyhow::bail!("scheduler was not built");
            };
            sched.start().await?;
            info!(stage = "scheduler:start", cron = %config.engine_cron, "scheduler running");
            tokio::signal::ctrl_c().await?;
            info!(stage = "scheduler:stop", "shutting down");
        }
    }

    Ok(())
}

fn engine_from_env() -> Result<RateGuardianEngine> {
    let config = EngineConfig::from_env()?;
    RateGuardianEngine::from_config(&config)
}
