//! runnergridd — the runnergrid daemon.
//!
//! Single binary that assembles the scheduling core:
//! - State store (redb)
//! - Runner pools (dry-run container runtime)
//! - Routing engine + container assignment
//! - Autoscaler
//! - Status reporter (GitHub check runs)
//!
//! # Usage
//!
//! ```text
//! runnergridd --config /etc/runnergrid/runnergrid.toml run
//! runnergridd rules
//! runnergridd test-rule --rule '{"name":"gpu","conditions":{"labels":["gpu"]}}' \
//!     --job '{"id":"1","repository":"acme/api","workflow":"ci","ref":"main","labels":["gpu"]}'
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use runnergrid_core::GridConfig;
use runnergrid_pool::{DryRunRuntime, PoolDefaults, StatePool};
use runnergrid_routing::{RoutingEngine, RuleDefinition};
use runnergrid_state::{JobRequest, StateStore};
use runnergridd::Grid;

const DEFAULT_FILTER: &str = "info,runnergrid=debug,runnergridd=debug";

#[derive(Parser)]
#[command(name = "runnergridd", about = "runnergrid daemon", version)]
struct Cli {
    /// Path to runnergrid.toml. Built-in defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Start every background loop until Ctrl-C.
    Run,
    /// List persisted routing rules in evaluation order.
    Rules,
    /// Dry-run a rule against a sample job and the current pool.
    TestRule {
        /// Rule definition as JSON.
        #[arg(long)]
        rule: String,
        /// Sample job as JSON.
        #[arg(long)]
        job: String,
    },
    /// Print the effective configuration.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = match &cli.config {
        Some(path) => GridConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => GridConfig::default(),
    };

    match cli.command {
        Command::Run => run(config).await,
        Command::Rules => list_rules(config),
        Command::TestRule { rule, job } => test_rule(config, &rule, &job).await,
        Command::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run(config: GridConfig) -> anyhow::Result<()> {
    info!("runnergrid daemon starting");

    let grid = Arc::new(Grid::open(config)?);

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let handles = grid.start(shutdown_rx).await?;
    info!(tasks = handles.len(), "background loops started");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c");
    }
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        let _ = handle.await;
    }

    let health = grid.reporter.health().await;
    info!(
        pending = health.queue_size,
        failed_reports = health.failed_reports,
        "runnergrid daemon stopped"
    );
    Ok(())
}

fn open_routing(config: &GridConfig) -> anyhow::Result<RoutingEngine> {
    let state = StateStore::open(&config.state.path)
        .with_context(|| format!("failed to open state store {}", config.state.path.display()))?;
    let pools = Arc::new(StatePool::new(
        state.clone(),
        Arc::new(DryRunRuntime::new()),
        PoolDefaults::from(&config.pool),
    ));
    Ok(RoutingEngine::new(state, pools))
}

fn list_rules(config: GridConfig) -> anyhow::Result<()> {
    let routing = open_routing(&config)?;
    let rules = routing.list_routing_rules()?;
    println!("{}", serde_json::to_string_pretty(&rules)?);
    Ok(())
}

async fn test_rule(config: GridConfig, rule: &str, job: &str) -> anyhow::Result<()> {
    let definition: RuleDefinition = serde_json::from_str(rule).context("invalid --rule JSON")?;
    let job: JobRequest = serde_json::from_str(job).context("invalid --job JSON")?;

    let routing = open_routing(&config)?;
    let result = routing.test_routing_rule(&definition, &job).await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
