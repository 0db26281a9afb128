//! Layered configuration loading for the fleet binaries.
//!
//! One YAML file (original upper-case section keys accepted) merged with
//! `FLEET__`-prefixed environment overrides. Empty trader ids are filled
//! with generated UUIDs and empty account ids inherit the top-level
//! account before the configuration is handed to the engine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

mod dates;
pub mod deserializer;

pub use dates::parse_date;

/// Failure variants surfaced while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed loading configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration value: {0}")]
    Invalid(String),
}

/// Root application configuration.
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(alias = "APP_NAME", default = "default_app_name")]
    pub app_name: String,
    #[serde(alias = "UPSTREAM_ADDRESS", default)]
    pub upstream_address: String,
    #[serde(alias = "UPSTREAM_TOKEN", default)]
    pub upstream_token: String,
    /// Transport-registry key selecting the upstream driver.
    #[serde(alias = "UPSTREAM_DRIVER", default = "default_upstream_driver")]
    pub upstream_driver: String,
    #[serde(alias = "ACCOUNT_ID", default)]
    pub account_id: String,
    #[serde(alias = "DATABASE_PATH", default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(alias = "TRADER", default)]
    pub trader: Option<TraderSection>,
    #[serde(alias = "BACKTESTER", default)]
    pub backtester: Vec<BacktestRun>,
    #[serde(alias = "HISTORY_CANDLES_LOADER", default)]
    pub history_candles_loader: Vec<LoaderJob>,
}

/// Live-trading section: fleet-global delays plus the trader list.
#[derive(Debug, Deserialize)]
pub struct TraderSection {
    #[serde(
        deserialize_with = "deserializer::duration::deserialize",
        default = "default_trading_delay"
    )]
    pub trading_delay: Duration,
    #[serde(
        deserialize_with = "deserializer::duration::deserialize",
        default = "default_error_delay"
    )]
    pub on_trading_error_delay: Duration,
    #[serde(
        deserialize_with = "deserializer::duration::deserialize",
        default = "default_error_delay"
    )]
    pub on_orders_operating_error_delay: Duration,
    #[serde(default)]
    pub traders: Vec<TraderEntry>,
}

/// One trader in the live fleet.
#[derive(Debug, Deserialize)]
pub struct TraderEntry {
    #[serde(default)]
    pub unique_trader_id: String,
    pub uid: String,
    #[serde(default)]
    pub account_id: String,
    /// Opaque strategy parameters dispatched by their `name` key.
    #[serde(default)]
    pub strategy_cfg: serde_json::Value,
}

/// One deterministic back-test run.
#[derive(Debug, Deserialize)]
pub struct BacktestRun {
    #[serde(default)]
    pub unique_trader_id: String,
    pub uid: String,
    pub from: String,
    pub to: String,
    pub interval: String,
    pub start_deposit: f64,
    pub commission_percent: f64,
    #[serde(default)]
    pub strategy_cfg: serde_json::Value,
}

/// One historical-candle bulk-load job.
#[derive(Debug, Deserialize)]
pub struct LoaderJob {
    pub ticker: String,
    pub uid: String,
    pub from: String,
    pub to: String,
    pub interval: String,
}

fn default_app_name() -> String {
    "fleet".to_string()
}

fn default_upstream_driver() -> String {
    "invest-grpc".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./fleet.db")
}

fn default_trading_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_error_delay() -> Duration {
    Duration::from_secs(10)
}

/// Load the configuration file and apply environment overrides
/// (`FLEET__`-prefixed, `__` as the section separator).
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    let mut cfg: AppConfig = Config::builder()
        .add_source(
            File::from(path.to_path_buf())
                .format(FileFormat::Yaml)
                .required(true),
        )
        .add_source(
            Environment::with_prefix("FLEET")
                .separator("__")
                .ignore_empty(true),
        )
        .build()?
        .try_deserialize()?;

    let account_id = cfg.account_id.clone();
    if let Some(trader) = cfg.trader.as_mut() {
        for entry in &mut trader.traders {
            if entry.unique_trader_id.is_empty() {
                entry.unique_trader_id = Uuid::new_v4().to_string();
            }
            if entry.account_id.is_empty() {
                entry.account_id = account_id.clone();
            }
        }
    }
    for run in &mut cfg.backtester {
        if run.unique_trader_id.is_empty() {
            run.unique_trader_id = Uuid::new_v4().to_string();
        }
    }

    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn loads_a_full_config_with_uppercase_sections() {
        let (_dir, path) = write_config(
            r#"
APP_NAME: fleet-test
UPSTREAM_ADDRESS: exchange.example:443
UPSTREAM_TOKEN: secret-token
ACCOUNT_ID: acc-main
TRADER:
  trading_delay: 2s
  on_trading_error_delay: 30s
  traders:
    - unique_trader_id: t1
      uid: uid-1
      account_id: acc-override
      strategy_cfg:
        name: btdstf
        max_depth: 5
    - uid: uid-2
BACKTESTER:
  - uid: uid-3
    from: "2023-01-01"
    to: now
    interval: 1hour
    start_deposit: 100000
    commission_percent: 0.05
    strategy_cfg:
      name: btdstf
HISTORY_CANDLES_LOADER:
  - ticker: SBER
    uid: uid-1
    from: "-12"
    to: now
    interval: 1min
"#,
        );

        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.app_name, "fleet-test");
        assert_eq!(cfg.upstream_driver, "invest-grpc");
        assert_eq!(cfg.database_path, PathBuf::from("./fleet.db"));

        let trader = cfg.trader.expect("trader section present");
        assert_eq!(trader.trading_delay, Duration::from_secs(2));
        assert_eq!(trader.on_trading_error_delay, Duration::from_secs(30));
        assert_eq!(trader.on_orders_operating_error_delay, Duration::from_secs(10));
        assert_eq!(trader.traders.len(), 2);

        let first = &trader.traders[0];
        assert_eq!(first.unique_trader_id, "t1");
        assert_eq!(first.account_id, "acc-override");
        assert_eq!(first.strategy_cfg["name"], "btdstf");

        // Missing ids are generated, missing accounts inherit the top level.
        let second = &trader.traders[1];
        assert!(!second.unique_trader_id.is_empty());
        assert_eq!(second.account_id, "acc-main");

        assert_eq!(cfg.backtester.len(), 1);
        assert!(!cfg.backtester[0].unique_trader_id.is_empty());
        assert_eq!(cfg.history_candles_loader.len(), 1);
    }

    #[test]
    fn sections_are_optional() {
        let (_dir, path) = write_config("APP_NAME: tiny\n");
        let cfg = load_config(&path).unwrap();
        assert!(cfg.trader.is_none());
        assert!(cfg.backtester.is_empty());
        assert!(cfg.history_candles_loader.is_empty());
    }

    #[test]
    fn a_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.yaml");
        assert!(load_config(&missing).is_err());
    }
}
