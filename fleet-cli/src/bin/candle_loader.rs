//! Polite bulk loader for historical candles: walks month windows per
//! configured instrument, rate-limited against the upstream API.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Months, Utc};
use clap::Parser;
use governor::{Quota, RateLimiter};
use tokio::sync::Semaphore;
use tracing::{error, info};

use fleet_broker::MarketDataTransport;
use fleet_cli::telemetry::{init_tracing, verbosity_filter};
use fleet_cli::connect_transport;
use fleet_config::{load_config, parse_date, LoaderJob};
use fleet_core::CandleInterval;
use fleet_storage::{SqliteStorage, Storage};

/// Parallel jobs in flight.
const LOAD_POOL_SIZE: usize = 2;
/// Minimum spacing between upstream history requests.
const REQUEST_PERIOD: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(author, version, about = "Fleet historical candle loader")]
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
    if cfg.history_candles_loader.is_empty() {
        println!("HISTORY_CANDLES_LOADER list is empty");
        return Ok(());
    }
    info!(jobs = cfg.history_candles_loader.len(), "instruments to load candles");

    let transport = connect_transport(&cfg).await?;
    let storage = Arc::new(SqliteStorage::open(&cfg.database_path)?);
    let limiter = Arc::new(RateLimiter::direct(
        Quota::with_period(REQUEST_PERIOD).expect("non-zero request period"),
    ));
    let pool = Arc::new(Semaphore::new(LOAD_POOL_SIZE));

    let mut handles = Vec::with_capacity(cfg.history_candles_loader.len());
    for job in cfg.history_candles_loader {
        let transport = transport.clone();
        let storage = storage.clone();
        let limiter = limiter.clone();
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            let _permit = pool.acquire().await.expect("loader pool closed");
            if let Err(err) = load_job(&job, transport, storage, limiter).await {
                error!(ticker = %job.ticker, error = %err, "candle load failed");
            }
        }));
    }
    for handle in handles {
        handle.await?;
    }
    Ok(())
}

type Limiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

async fn load_job(
    job: &LoaderJob,
    transport: Arc<dyn MarketDataTransport>,
    storage: Arc<SqliteStorage>,
    limiter: Arc<Limiter>,
) -> Result<()> {
    let mut instrument = transport.find_instrument(&job.uid).await?;
    instrument.id = storage.add_instrument(&instrument)?;

    let mut from = parse_date(&job.from)?;
    let to = parse_date(&job.to)?;
    let interval: CandleInterval = job.interval.parse().map_err(|err| anyhow!("{err}"))?;

    // The exchange has nothing before the instrument's first candle.
    if from < instrument.first_candle_date {
        from = instrument.first_candle_date;
    }

    info!(ticker = %job.ticker, "start loading");
    let mut window_start = from;
    while window_start < to {
        let window_end = next_window_end(window_start, to);
        limiter.until_ready().await;

        let candles = transport
            .historic_candles(&instrument.uid, interval, window_start, window_end)
            .await?;
        storage.add_candles(&instrument, &candles, interval)?;

        info!(
            ticker = %instrument.ticker,
            interval = %interval,
            from = %window_start.date_naive(),
            to = %window_end.date_naive(),
            count = candles.len(),
            "candles loaded"
        );
        window_start = window_end;
    }
    Ok(())
}

fn next_window_end(start: DateTime<Utc>, limit: DateTime<Utc>) -> DateTime<Utc> {
    start
        .checked_add_months(Months::new(1))
        .map_or(limit, |next| next.min(limit))
}
