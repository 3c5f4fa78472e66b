use std::path::PathBuf;
use std::time::Duration;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use runtrack::{api, config::TrackerCfg, postgres::PgStore, store, Tracker};

const DEFAULT_BIND: &str = "127.0.0.1:8787";
const SHUTDOWN_WITHIN: Duration = Duration::from_secs(10);
const STREAM_CLOSE_WITHIN: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "runtrack", version, about = "Track background job runs and stream their output")]
struct Cli {
    /// YAML config file; environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the run API and event streams.
    Serve {
        #[arg(long)]
        bind: Option<String>,
    },
    /// Print a run's durable event log in order.
    Replay {
        run_id: String,
        /// Only events after this sequence id.
        #[arg(long, default_value_t = 0)]
        after: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "runtrack=info,tower_http=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let cfg = TrackerCfg::load(cli.config.as_deref()).await.context("Failed to load config")?;

    match cli.command {
        Command::Serve { bind } => serve(cfg, bind).await,
        Command::Replay { run_id, after } => replay(cfg, &run_id, after).await,
    }
}

async fn serve(cfg: TrackerCfg, bind: Option<String>) -> Result<()> {
    let bind = bind
        .or_else(|| cfg.bind.clone())
        .unwrap_or_else(|| DEFAULT_BIND.to_string());
    let tracker = Tracker::open(cfg).await.context("Failed to open event store")?;
    let pruner = tracker.registry.spawn_pruner();

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let state = tracker.app_state();
    let mut server = tokio::spawn(async move {
        api::serve(&bind, state, async move {
            let _ = stop_rx.changed().await;
        })
        .await
    });

    tokio::select! {
        joined = &mut server => {
            pruner.abort();
            joined??;
            tracing::warn!("server exited on its own");
            tracker.shutdown(SHUTDOWN_WITHIN).await;
            return Ok(());
        }
        sig = tokio::signal::ctrl_c() => {
            sig.context("Failed to listen for ctrl-c")?;
        }
    }

    tracing::info!("shutdown requested");
    let _ = stop_tx.send(true);
    tracker.shutdown(SHUTDOWN_WITHIN).await;
    pruner.abort();

    // streams following runs owned elsewhere never end on their own
    match tokio::time::timeout(STREAM_CLOSE_WITHIN, server).await {
        Ok(joined) => joined??,
        Err(_) => tracing::warn!("open streams did not close in time"),
    }
    Ok(())
}

async fn replay(cfg: TrackerCfg, run_id: &str, after: i64) -> Result<()> {
    let Some(url) = cfg.database_url.as_deref() else {
        bail!("replay reads the durable log; set DATABASE_URL or database_url in the config");
    };
    let pg = PgStore::connect(url).await.context("Failed to connect to database")?;

    let Some(summary) = store::EventStore::run_summary(&pg, run_id).await? else {
        bail!("run not found: {run_id}");
    };
    let events = store::durable_log(&pg, run_id, after, cfg.stream.page_size).await?;
    for ev in &events {
        println!("{}\t{}\t{}", ev.seq, ev.wire_name(), ev.wire_data());
    }
    println!(
        "-- {} status={} exit_code={} events={}",
        summary.id,
        summary.status.as_str(),
        summary.exit_code.map_or_else(|| "-".to_string(), |c| c.to_string()),
        events.len(),
    );
    Ok(())
}
