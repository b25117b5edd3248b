//! Gatehouse entry point.
//!
//! One binary, two roles. Launched plainly it loads the configured main
//! section and runs it (supervising workers when a cluster block is
//! enabled). Launched by a supervising primary, signalled through the
//! worker-group environment variable, it becomes a worker whose stdio is
//! the RMI channel.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gatehouse::cluster::{self, WORKER_GROUP_ENV};
use gatehouse::component::{loader, Registry, Role, StartContext};
use gatehouse::config::AppConfig;
use gatehouse::error::Result;

#[derive(Parser)]
#[command(name = "gatehouse", version, about = "Configurable reverse proxy / gateway")]
struct Args {
    /// Path to the configuration file (TOML or JSON).
    #[arg(short, long)]
    config: PathBuf,

    /// Validate the configuration and exit without serving.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() {
    // Diagnostics go to stderr unconditionally: a worker's stdout is the
    // RMI channel and must stay clean.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gatehouse=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "startup failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();
    let config = AppConfig::load(&args.config)?;

    if let Ok(group) = std::env::var(WORKER_GROUP_ENV) {
        return cluster::worker::run(&group, &config, args.config).await;
    }

    let section = config.main.clone();
    let mut registry = Registry::builtin();
    let blocks = config.section(&section)?;
    let created = loader::construct_and_load(&mut registry, blocks, None, &Role::Main)?;

    if args.check {
        println!(
            "configuration ok: section {:?}, {} component(s)",
            section,
            created.len()
        );
        return Ok(());
    }

    let registry = Arc::new(registry);
    let ctx = StartContext {
        registry: registry.clone(),
        rmi: None,
        role: Role::Main,
        config_path: args.config.clone(),
    };
    loader::start_components(&created, &ctx).await?;
    tracing::info!(
        section = %section,
        components = created.len(),
        "gatehouse started"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    Ok(())
}
