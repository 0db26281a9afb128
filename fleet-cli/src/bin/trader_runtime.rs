//! Live trading runtime: runs the trader fleet against the configured
//! upstream, reloads configuration on SIGHUP and stops gracefully on
//! SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{error, info};

use fleet_broker::LiveBroker;
use fleet_cli::telemetry::{init_tracing, verbosity_filter};
use fleet_cli::{connect_transport, fleet_config_from};
use fleet_config::load_config;
use fleet_core::ShutdownSignal;
use fleet_engine::{NoopHistory, TraderManager};
use fleet_storage::SqliteStorage;
use fleet_strategy::register_builtin_strategies;

const WAIT_ON_PANIC: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(author, version, about = "Fleet live trading runtime")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "fleet.yaml")]
    config: PathBuf,
    /// Increases logging verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Also write JSON logs to this file
    #[arg(long)]
    log_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(verbosity_filter(cli.verbose), cli.log_path.as_deref())?;

    let cfg = load_config(&cli.config)
        .with_context(|| format!("cannot read config at {}", cli.config.display()))?;
    let Some(trader_section) = cfg.trader.as_ref() else {
        bail!("no TRADER section in config");
    };
    if trader_section.traders.is_empty() {
        bail!("no traders specified in config");
    }

    register_builtin_strategies();

    let shutdown = ShutdownSignal::new();
    let transport = connect_transport(&cfg).await?;
    let broker = Arc::new(LiveBroker::new(transport, shutdown.clone()));
    let storage = Arc::new(
        SqliteStorage::open(&cfg.database_path)
            .with_context(|| format!("cannot open database at {}", cfg.database_path.display()))?,
    );

    let manager = Arc::new(TraderManager::new(
        shutdown.clone(),
        WAIT_ON_PANIC,
        broker,
        storage,
        Arc::new(NoopHistory),
    ));
    manager
        .update_traders_with_config(&fleet_config_from(trader_section))
        .await;

    spawn_sighup_reload(manager.clone(), cli.config.clone(), shutdown.clone());

    info!("service started");
    manager.wait().await;
    info!("service stopped");
    Ok(())
}

/// Re-read the configuration and reconcile the fleet on every SIGHUP.
/// Reload failures are logged, never fatal.
#[cfg(unix)]
fn spawn_sighup_reload(manager: Arc<TraderManager>, config_path: PathBuf, shutdown: ShutdownSignal) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(stream) => stream,
            Err(err) => {
                error!(error = %err, "failed installing SIGHUP handler");
                return;
            }
        };
        loop {
            tokio::select! {
                _ = shutdown.wait() => return,
                _ = hangup.recv() => {
                    info!("SIGHUP received; reloading configuration");
                    match load_config(&config_path) {
                        Ok(cfg) => match cfg.trader {
                            Some(section) => {
                                manager
                                    .update_traders_with_config(&fleet_config_from(&section))
                                    .await;
                            }
                            None => error!("reloaded config has no TRADER section"),
                        },
                        Err(err) => error!(error = %err, "failed reloading configuration"),
                    }
                }
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_sighup_reload(
    _manager: Arc<TraderManager>,
    _config_path: PathBuf,
    _shutdown: ShutdownSignal,
) {
}
