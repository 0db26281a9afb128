//! Strategy trait definitions, shared registry and the reference strategy.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use thiserror::Error;

use fleet_core::{Instrument, LastPrice};
use fleet_storage::{Storage, StorageError};

mod btdstf;

pub use btdstf::{Btdstf, BtdstfConfig};

/// Result alias used within strategy implementations.
pub type StrategyResult<T> = Result<T, StrategyError>;

/// Failure variants surfaced by strategies.
#[derive(Debug, Error)]
pub enum StrategyError {
    /// The strategy's configuration cannot be parsed or is invalid.
    #[error("configuration is invalid: {0}")]
    InvalidConfig(String),
    /// No factory is registered under the requested name.
    #[error("unknown strategy: {0}")]
    UnknownStrategy(String),
    /// The order ledger could not be consulted or updated.
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
}

/// What a single action tells the trader to do.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ActionKind {
    Buy,
    Hold,
    Sell,
}

impl ActionKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Hold => "HOLD",
            Self::Sell => "SELL",
        }
    }
}

/// Compensation attached to a non-HOLD action. Invoked exactly once when the
/// broker rejects the action; rolls back whatever the strategy pre-inserted.
pub type Compensation = Box<dyn FnOnce() -> Result<(), StorageError> + Send + Sync>;

/// A BUY/SELL/HOLD directive produced by a strategy for a single tick.
pub struct StrategyAction {
    pub action: ActionKind,
    pub lots: i64,
    /// Client idempotency key forwarded to the broker.
    pub request_id: String,
    pub on_error: Option<Compensation>,
}

impl StrategyAction {
    #[must_use]
    pub fn hold() -> Self {
        Self {
            action: ActionKind::Hold,
            lots: 0,
            request_id: String::new(),
            on_error: None,
        }
    }
}

/// Per-tick decision contract.
///
/// `decide` must be pure on its inputs and the storage snapshot; the caller
/// executes the returned actions in emission order.
pub trait Strategy: Send + Sync {
    /// Stable identifier for this strategy type.
    fn name(&self) -> &'static str;

    /// Produce the actions for one last-price tick.
    fn decide(
        &self,
        trader_id: &str,
        instrument: &Instrument,
        last_price: &LastPrice,
    ) -> StrategyResult<Vec<StrategyAction>>;

    /// Swap the runtime parameters. A concurrent `decide` observes either
    /// the old or the new configuration, never a mix.
    fn update_config(&self, params: &serde_json::Value) -> StrategyResult<()>;
}

/// Collaborators handed to strategy factories.
pub struct StrategyDeps {
    pub storage: Arc<dyn Storage>,
    pub trader_id: String,
}

/// Factory contract used to construct strategies from configuration.
pub trait StrategyFactory: Send + Sync {
    /// Canonical, user-facing identifier (the `name` key in `strategy_cfg`).
    fn name(&self) -> &'static str;

    /// Build and configure a strategy instance.
    fn build(
        &self,
        params: &serde_json::Value,
        deps: &StrategyDeps,
    ) -> StrategyResult<Arc<dyn Strategy>>;
}

static STRATEGY_REGISTRY: Lazy<RwLock<HashMap<String, Arc<dyn StrategyFactory>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Register a strategy factory with the global registry.
pub fn register_strategy_factory(factory: Arc<dyn StrategyFactory>) {
    let mut registry = STRATEGY_REGISTRY.write().expect("strategy registry poisoned");
    let name = normalize_name(factory.name());
    if registry.insert(name.clone(), factory).is_some() {
        tracing::warn!(
            strategy = name,
            "duplicate strategy registration detected; overriding previous factory"
        );
    }
}

/// Make sure the built-in strategies are available. Safe to call repeatedly.
pub fn register_builtin_strategies() {
    static ONCE: Lazy<()> = Lazy::new(|| {
        register_strategy_factory(Arc::new(btdstf::BtdstfFactory));
    });
    Lazy::force(&ONCE);
}

/// Resolve a strategy from an opaque `strategy_cfg` map. The `name` key
/// dispatches to a registered factory; unknown names are configuration
/// errors, never panics.
pub fn resolve_strategy(
    strategy_cfg: &serde_json::Value,
    deps: &StrategyDeps,
) -> StrategyResult<Arc<dyn Strategy>> {
    let name = strategy_cfg
        .get("name")
        .and_then(|value| value.as_str())
        .ok_or_else(|| {
            StrategyError::InvalidConfig("strategy_cfg is missing the 'name' key".into())
        })?;
    let factory = {
        let registry = STRATEGY_REGISTRY.read().expect("strategy registry poisoned");
        registry.get(&normalize_name(name)).cloned()
    }
    .ok_or_else(|| StrategyError::UnknownStrategy(name.to_string()))?;
    factory.build(strategy_cfg, deps)
}

/// Sorted list of registered strategy names.
#[must_use]
pub fn registered_strategies() -> Vec<String> {
    let registry = STRATEGY_REGISTRY.read().expect("strategy registry poisoned");
    let mut names: Vec<String> = registry.keys().cloned().collect();
    names.sort_unstable();
    names
}

fn normalize_name(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}
