//! scheduler - distributed job scheduler backed by Redis.
//!
//! Usage:
//!   scheduler [--config <path>] [--instance-id <id>]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use scheduler_core::SchedulerConfig;
use scheduler_engine::{JobDefaults, JobRegistry, Keyspace, SchedulerEngine};
use scheduler_store::{RedisStore, Store};
use tracing::{info, warn};

mod heartbeat;

/// scheduler - runs registered jobs exactly once across all instances
#[derive(Parser)]
#[command(name = "scheduler")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (default: $SCHEDULER_CONFIG, then ./scheduler.toml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Instance id reported in leases and results (default: generated)
    #[arg(long)]
    instance_id: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scheduler_service=info,scheduler_engine=info,scheduler_store=info".into()),
        )
        .init();

    let cli = Cli::parse();

    let mut config = SchedulerConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(id) = cli.instance_id {
        config.dispatch.instance_id = Some(id);
    }
    config.validate().context("invalid configuration")?;
    let instance_id = config.dispatch.resolve_instance_id();

    // validate() guarantees a URL is present.
    let url = config.store.url.clone().unwrap_or_default();
    let store: Arc<dyn Store> = Arc::new(
        RedisStore::connect(&url)
            .await
            .context("connecting to the schedule store")?,
    );

    let mut registry = JobRegistry::new(JobDefaults::from(&config.dispatch));
    if config.heartbeat.enabled {
        let interval = Duration::from_secs(config.heartbeat.interval_seconds.max(1));
        let keys = Keyspace::new(&config.store.namespace);
        registry.register(
            heartbeat::Heartbeat::definition(interval),
            Arc::new(heartbeat::Heartbeat::new(store.clone(), &keys, &instance_id, interval)),
        )?;
    } else {
        warn!("heartbeat job disabled; no jobs registered in this process");
    }

    let engine = SchedulerEngine::builder(config, store, registry)
        .instance_id(instance_id.clone())
        .build();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, shutting down");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for ctrl-c");
                // Dropping the sender would stop the engine.
                std::future::pending::<()>().await;
            }
        }
    });

    info!(instance = %instance_id, "scheduler starting");
    engine.run(shutdown_rx).await;
    info!(instance = %instance_id, "scheduler exited cleanly");
    Ok(())
}
