/*
newsbrief - weekly digest runner
Runs one digest cycle and exits, or stays up in daemon mode and runs at the configured weekly slot.
*/

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use common::{init_db_pool, Config};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use newsbrief::pipeline::Pipeline;
use newsbrief::report::RunReport;
use newsbrief::schedule::WeeklySlot;
use newsbrief::setup::build_pipeline;
use newsbrief::storage::{ensure_schema, sync_topics, SqliteStore};

#[derive(Parser, Debug)]
#[command(name = "newsbrief", about = "Weekly per-topic news digest pipeline")]
struct Args {
    /// Path to config.toml
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (info, debug, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Stay running and execute the cycle every week at the [scheduler] slot
    #[arg(long)]
    daemon: bool,

    /// Write the run report JSON here instead of stdout
    #[arg(long, value_name = "FILE")]
    report: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Secrets may live in a local .env file
    dotenv::dotenv().ok();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let config = load_config(args.config.as_deref()).await?;

    let db_path_abs = match tokio::fs::canonicalize(&config.database.path).await {
        Ok(p) => p.to_string_lossy().to_string(),
        Err(_) => config.database.path.clone(),
    };
    info!(db_path = %db_path_abs, "resolved DB path");

    let db_pool = match init_db_pool(&db_path_abs).await {
        Ok(p) => p,
        Err(e) => {
            error!(%e, db_path = %db_path_abs, "failed to initialize database pool");
            return Err(e);
        }
    };
    ensure_schema(&db_pool).await?;
    sync_topics(&config, &db_pool).await?;

    let pipeline = build_pipeline(&config, SqliteStore::new(db_pool))
        .context("failed to set up the digest pipeline")?;

    if !args.daemon {
        let report = pipeline.run().await;
        emit_report(&report, args.report.as_deref()).await?;
        return Ok(());
    }

    let slot = WeeklySlot::from_config(&config.scheduler)?;
    let shutdown_notify = Arc::new(Notify::new());
    let notifier = shutdown_notify.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, stopping scheduler");
            notifier.notify_one();
        }
    });

    run_scheduler(&pipeline, slot, shutdown_notify, args.report.as_deref()).await;
    info!("Shutdown complete");
    Ok(())
}

async fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let default_path = PathBuf::from("config.default.toml");

    let override_path = if let Some(p) = explicit {
        if !p.exists() {
            error!(path = ?p, "specified config file not found");
            return Err(anyhow::anyhow!("Config file not found: {}", p.display()));
        }
        Some(p.to_path_buf())
    } else {
        let p = PathBuf::from("config.toml");
        if p.exists() {
            Some(p)
        } else {
            None
        }
    };

    let config = Config::load_with_defaults(
        if default_path.exists() { Some(&default_path) } else { None },
        override_path.as_deref(),
    )
    .await
    .map_err(|e| {
        error!(%e, "failed to load configuration");
        e
    })?;
    info!(default = ?default_path, override_path = ?override_path, topics = config.topics.len(), "configuration loaded");
    Ok(config)
}

/// Sleep until the next weekly slot, run the cycle, repeat until shutdown is signalled.
async fn run_scheduler(pipeline: &Pipeline, slot: WeeklySlot, shutdown_notify: Arc<Notify>, report_path: Option<&Path>) {
    loop {
        let now = Utc::now();
        let next = slot.next_after(now);
        let wait = (next - now).to_std().unwrap_or_default();
        info!(next_run = %next, "scheduler: waiting for next weekly slot");

        tokio::select! {
            _ = shutdown_notify.notified() => {
                info!("scheduler: shutdown requested");
                return;
            }
            _ = tokio::time::sleep(wait) => {}
        }

        let report = pipeline.run().await;
        if let Err(e) = emit_report(&report, report_path).await {
            error!(%e, "scheduler: failed to write run report");
        }
    }
}

async fn emit_report(report: &RunReport, path: Option<&Path>) -> Result<()> {
    let totals = report.totals();
    info!(
        run_id = %report.run_id,
        topics = totals.topics,
        topics_failed = totals.topics_failed,
        emails_sent = totals.emails_sent,
        emails_failed = totals.emails_failed,
        "run complete"
    );
    for (id, topic) in &report.topics {
        info!(topic = %id, status = %topic.status, sent = topic.emails_sent, "topic result");
    }
    if report.needs_attention() {
        warn!(run_id = %report.run_id, "run finished with failures, see the report");
    }

    let json = serde_json::to_string_pretty(report).context("failed to serialize run report")?;
    match path {
        Some(p) => {
            tokio::fs::write(p, json)
                .await
                .with_context(|| format!("failed to write run report to {}", p.display()))?;
            info!(path = %p.display(), "run report written");
        }
        None => println!("{}", json),
    }
    Ok(())
}
