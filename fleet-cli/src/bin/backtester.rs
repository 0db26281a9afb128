//! Deterministic back-tests: one replayed trader per BACKTESTER entry,
//! with a per-run summary printed at the end.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;

use fleet_backtest::{summarize, BacktestBroker, BacktestStorage};
use fleet_broker::Broker;
use fleet_cli::telemetry::{init_tracing, verbosity_filter};
use fleet_config::{load_config, parse_date, BacktestRun};
use fleet_core::{CandleInterval, ShutdownSignal};
use fleet_engine::{NoopHistory, TraderCfg, TraderService};
use fleet_storage::{SqliteStorage, Storage};
use fleet_strategy::{register_builtin_strategies, resolve_strategy, StrategyDeps};

#[derive(Parser)]
#[command(author, version, about = "Fleet strategy backtester")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "fleet.yaml")]
    config: PathBuf,
    /// Increases logging verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(verbosity_filter(cli.verbose), None)?;

    let cfg = load_config(&cli.config)
        .with_context(|| format!("cannot read config at {}", cli.config.display()))?;
    if cfg.backtester.is_empty() {
        println!("BACKTESTER list is empty");
        return Ok(());
    }

    register_builtin_strategies();
    let sql = Arc::new(SqliteStorage::open(&cfg.database_path)?);
    let shutdown = ShutdownSignal::new();
    let started = Instant::now();

    let mut runs = Vec::with_capacity(cfg.backtester.len());
    for run in &cfg.backtester {
        runs.push(start_run(run, &sql, &shutdown).await?);
    }

    let mut results = Vec::with_capacity(runs.len());
    for run in runs {
        results.push(run.await?);
    }
    for line in &results {
        println!("{line}");
    }
    println!("Time: {:?}", started.elapsed());
    Ok(())
}

async fn start_run(
    run: &BacktestRun,
    sql: &Arc<SqliteStorage>,
    shutdown: &ShutdownSignal,
) -> Result<tokio::task::JoinHandle<String>> {
    let from = parse_date(&run.from)?;
    let to = parse_date(&run.to)?;
    let interval: CandleInterval = run.interval.parse().map_err(|err| anyhow!("{err}"))?;

    let instrument = sql
        .instrument_by_uid(&run.uid)
        .with_context(|| format!("instrument '{}' must be loaded before backtesting", run.uid))?;
    let candles = sql
        .candles(&instrument, interval, from, to)
        .with_context(|| format!("no candle history for '{}'", run.uid))?;

    let storage = Arc::new(BacktestStorage::new(candles));
    storage.add_instrument(&instrument)?;

    let (done_tx, mut done_rx) = mpsc::channel(1);
    let broker = Arc::new(BacktestBroker::new(
        run.start_deposit,
        run.commission_percent / 100.0,
        storage.clone(),
        run.unique_trader_id.clone(),
        done_tx,
    ));

    let deps = StrategyDeps {
        storage: storage.clone(),
        trader_id: run.unique_trader_id.clone(),
    };
    let strategy = resolve_strategy(&run.strategy_cfg, &deps)?;

    let trader_cfg = TraderCfg {
        instrument,
        trader_id: run.unique_trader_id.clone(),
        account_id: "TEST_ACCOUNT".into(),
        tick_delay: Duration::ZERO,
        on_trading_error_delay: Duration::from_secs(1),
        on_orders_error_delay: Duration::from_secs(1),
    };
    let trader = TraderService::new(
        shutdown,
        broker.clone() as Arc<dyn Broker>,
        storage.clone(),
        Arc::new(NoopHistory),
        strategy,
        trader_cfg,
    )
    .await?;

    info!(
        trader = %run.unique_trader_id,
        from = %from.date_naive(),
        to = %to.date_naive(),
        interval = %interval,
        "backtest started"
    );

    let run_shutdown = shutdown.clone();
    let trader_id = run.unique_trader_id.clone();
    let start_deposit = run.start_deposit;
    Ok(tokio::spawn(async move {
        let runner = tokio::spawn(trader.clone().run_trading());
        tokio::select! {
            _ = run_shutdown.wait() => {}
            _ = done_rx.recv() => {}
        }
        trader.stop().await;
        let _ = runner.await;
        summarize(&trader_id, start_deposit, &broker, &storage).to_string()
    }))
}
