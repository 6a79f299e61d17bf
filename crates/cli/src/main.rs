mod cli;
mod runtime;

use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use rebound_core::config::{load_dotenv, Config};
use rebound_ingest::{yesterday_in, JobRun, JobScheduler};
use rebound_storage::WatermarkStore;
use tracing::{error, info, warn};

use crate::cli::{CliArgs, Command, WatermarkCommand};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();
    match run(args).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: CliArgs) -> Result<u8> {
    load_dotenv();
    let config = match &args.profile {
        Some(profile) => Config::for_profile(profile),
        None => Config::from_env(),
    };
    config.validate().context("invalid configuration")?;

    match args.command {
        Command::Config => {
            let mut summary = config.redacted_summary();
            summary["available_profiles"] = serde_json::json!(Config::available_profiles());
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(0)
        }
        Command::RunDaily { date, dry_run } => {
            config.log_summary();
            let scheduler = scheduler(&config, args.manifest.as_deref(), dry_run).await?;
            let target = match date {
                Some(date) => date,
                None => yesterday_in(scheduler.settings().timezone, Utc::now()),
            };
            let run = scheduler.run_daily_for(target).await?;
            report(&run)
        }
        Command::RunBackfill(backfill) => {
            config.log_summary();
            let request = runtime::backfill_request(&backfill)?;
            let scheduler = scheduler(&config, args.manifest.as_deref(), backfill.dry_run).await?;
            let run = scheduler.run_backfill(request).await?;
            report(&run)
        }
        Command::Watermark(command) => {
            let store = runtime::open_store(&config, false).await?;
            let watermarks = WatermarkStore::new(store);
            let marker = config.scheduler.backfill_marker()?;
            match command {
                WatermarkCommand::List { stage } => {
                    let rows = watermarks.list(stage.as_deref()).await?;
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                }
                WatermarkCommand::Get { stage, key } => {
                    let stage = runtime::stage_for(&stage, marker)?;
                    match watermarks.get(&stage, &key).await? {
                        Some(wm) => println!("{} (updated {})", wm.position, wm.updated_at.to_rfc3339()),
                        None => println!("not set"),
                    }
                }
                WatermarkCommand::Set { stage, key, value } => {
                    let stage = runtime::stage_for(&stage, marker)?;
                    let position = watermarks.force_set(&stage, &key, &value).await?;
                    println!("{}/{key} = {position}", stage.name);
                }
            }
            Ok(0)
        }
    }
}

async fn scheduler(
    config: &Config,
    manifest: Option<&std::path::Path>,
    dry_run: bool,
) -> Result<JobScheduler> {
    let manifest = runtime::load_manifest(config, manifest)?;
    let store = runtime::open_store(config, dry_run).await?;
    let scheduler = runtime::build_scheduler(config, &manifest, store)?;

    let token = scheduler.cancellation_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("Shutdown requested; finishing in-flight units");
        token.cancel();
    });
    Ok(scheduler)
}

/// Print the run summary and turn its failure count into the exit code.
fn report(run: &JobRun) -> Result<u8> {
    println!("{}", serde_json::to_string_pretty(&run.summary())?);
    info!(
        failures = run.failures(),
        cancelled = run.cancelled,
        halted = run.halted,
        exit_code = run.exit_code(),
        "Done"
    );
    Ok(run.exit_code())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to register SIGTERM handler");
                if ctrl_c.await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = ctrl_c.await {
            warn!(error = %e, "failed to listen for ctrl_c");
            std::future::pending::<()>().await;
        }
    }
}
