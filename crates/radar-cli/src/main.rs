use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use radar_engine::{
    EngineConfig, OpportunityEngine, SourceRegistry, DEFAULT_SCAN_POLL_INTERVAL,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "radar-cli")]
#[command(about = "Crypto alpha opportunity radar")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one aggregation cycle and print its summary.
    Scan,
    /// Poll continuously and report published snapshots until ctrl-c.
    Watch {
        /// Poll interval override in milliseconds.
        #[arg(long)]
        interval_ms: Option<u64>,
        /// Use the fast token-scan cadence (60s) instead of the airdrop
        /// cadence (5m).
        #[arg(long)]
        scan_cadence: bool,
    },
    /// Serve the JSON query API.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env();
    let registry = SourceRegistry::load(config.workspace_root.join("sources.yaml"))
        .context("loading source registry")?;
    let engine = Arc::new(OpportunityEngine::new(config, &registry)?);

    match cli.command.unwrap_or(Commands::Scan) {
        Commands::Scan => {
            let d = engine.run_cycle().await;
            println!(
                "cycle complete: cycle_id={} fetched={} normalized={} failed_sources={} cache={}",
                d.cycle_id,
                d.records_fetched,
                d.records_normalized,
                d.sources_failed.len(),
                d.cache_size
            );
            for failure in &d.sources_failed {
                eprintln!("  source {} failed: {}", failure.source_id, failure.error);
            }
        }
        Commands::Watch {
            interval_ms,
            scan_cadence,
        } => {
            let interval = match interval_ms {
                Some(ms) => Duration::from_millis(ms),
                None if scan_cadence => DEFAULT_SCAN_POLL_INTERVAL,
                None => engine.config().poll_interval,
            };

            let scheduler = engine.maybe_build_scheduler().await?;
            if let Some(scheduler) = &scheduler {
                scheduler.start().await.context("starting rescan scheduler")?;
            }

            let mut subscription = engine.subscribe();
            engine.start(interval);
            info!(interval_ms = interval.as_millis() as u64, "watching");

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        engine.stop();
                        break;
                    }
                    snapshot = subscription.next() => match snapshot {
                        Some(snapshot) => info!(count = snapshot.len(), "snapshot published"),
                        None => break,
                    }
                }
            }
        }
        Commands::Serve => {
            radar_web::serve_from_env(engine).await?;
        }
    }

    Ok(())
}
