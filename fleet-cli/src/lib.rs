//! Shared plumbing for the fleet binaries.

use std::sync::Arc;

use anyhow::{anyhow, Result};

use fleet_broker::{get_transport_factory, registered_drivers, MarketDataTransport, TransportConfig};
use fleet_config::{AppConfig, TraderSection};
use fleet_engine::{FleetConfig, TraderSpec};

pub mod telemetry;

/// Resolve the configured upstream driver from the transport registry and
/// connect it. Missing drivers are a startup error, never a panic.
pub async fn connect_transport(cfg: &AppConfig) -> Result<Arc<dyn MarketDataTransport>> {
    let factory = get_transport_factory(&cfg.upstream_driver).ok_or_else(|| {
        anyhow!(
            "transport driver '{}' is not registered (available: {:?})",
            cfg.upstream_driver,
            registered_drivers()
        )
    })?;
    let transport = factory
        .connect(&TransportConfig {
            app_name: cfg.app_name.clone(),
            address: cfg.upstream_address.clone(),
            token: cfg.upstream_token.clone(),
            account_id: cfg.account_id.clone(),
        })
        .await?;
    Ok(transport)
}

/// Map the configuration file's trader section onto the engine's input.
#[must_use]
pub fn fleet_config_from(section: &TraderSection) -> FleetConfig {
    FleetConfig {
        tick_delay: section.trading_delay,
        on_trading_error_delay: section.on_trading_error_delay,
        on_orders_error_delay: section.on_orders_operating_error_delay,
        traders: section
            .traders
            .iter()
            .map(|entry| TraderSpec {
                trader_id: entry.unique_trader_id.clone(),
                uid: entry.uid.clone(),
                account_id: entry.account_id.clone(),
                strategy_cfg: entry.strategy_cfg.clone(),
            })
            .collect(),
    }
}
