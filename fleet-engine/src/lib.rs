//! Per-trader control loops and the fleet reconciliation manager.

use thiserror::Error;

use fleet_broker::BrokerError;

mod history;
mod manager;
mod trader;

pub use history::{HistoryError, HistorySink, HistoryTopic, NoopHistory};
pub use manager::{FleetConfig, TraderManager, TraderSpec};
pub use trader::{TraderCfg, TraderService};

/// Convenience alias for engine results.
pub type EngineResult<T> = Result<T, EngineError>;

/// Failure variants surfaced by the trader service and the manager.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The trader configuration is unusable.
    #[error("invalid trader config: {0}")]
    InvalidConfig(String),
    /// A trader with this id is already running.
    #[error("trader with id '{0}' already exists; id must be unique")]
    DuplicateTrader(String),
    /// A broker call failed during construction or reconfiguration.
    #[error(transparent)]
    Broker(#[from] BrokerError),
}
