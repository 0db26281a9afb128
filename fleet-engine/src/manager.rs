//! Reconciles the running trader fleet against external configuration.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::{EngineError, EngineResult, HistorySink, TraderCfg, TraderService};
use fleet_broker::Broker;
use fleet_core::ShutdownSignal;
use fleet_storage::Storage;
use fleet_strategy::{resolve_strategy, StrategyDeps};

/// One trader entry from configuration.
#[derive(Clone, Debug)]
pub struct TraderSpec {
    pub trader_id: String,
    pub uid: String,
    pub account_id: String,
    pub strategy_cfg: serde_json::Value,
}

/// Fleet-wide configuration applied by [`TraderManager::update_traders_with_config`].
#[derive(Clone, Debug)]
pub struct FleetConfig {
    pub tick_delay: Duration,
    pub on_trading_error_delay: Duration,
    pub on_orders_error_delay: Duration,
    pub traders: Vec<TraderSpec>,
}

/// Owns the fleet directory and one supervisor task per trader.
pub struct TraderManager {
    shutdown: ShutdownSignal,
    wait_on_panic: Duration,
    traders: RwLock<HashMap<String, Arc<TraderService>>>,
    supervisors: Mutex<Vec<JoinHandle<()>>>,
    broker: Arc<dyn Broker>,
    storage: Arc<dyn Storage>,
    history: Arc<dyn HistorySink>,
}

impl TraderManager {
    pub fn new(
        shutdown: ShutdownSignal,
        wait_on_panic: Duration,
        broker: Arc<dyn Broker>,
        storage: Arc<dyn Storage>,
        history: Arc<dyn HistorySink>,
    ) -> Self {
        Self {
            shutdown,
            wait_on_panic,
            traders: RwLock::new(HashMap::new()),
            supervisors: Mutex::new(Vec::new()),
            broker,
            storage,
            history,
        }
    }

    /// Bring the running fleet in line with `cfg`: start new traders, update
    /// changed ones in place, stop the ones the configuration dropped.
    /// Offending entries are skipped; running siblings are unaffected.
    pub async fn update_traders_with_config(&self, cfg: &FleetConfig) {
        if cfg.traders.is_empty() {
            error!("no traders in new config");
            return;
        }

        for spec in &cfg.traders {
            let mut instrument = match self.broker.find_instrument(&spec.uid).await {
                Ok(instrument) => instrument,
                Err(err) => {
                    error!(uid = %spec.uid, error = %err, "failed getting instrument from broker");
                    continue;
                }
            };
            match self.storage.add_instrument(&instrument) {
                Ok(db_id) => instrument.id = db_id,
                Err(err) => {
                    error!(uid = %spec.uid, error = %err, "failed adding instrument to database");
                    continue;
                }
            }
            instrument.instance_id = Uuid::new_v4();

            let deps = StrategyDeps {
                storage: self.storage.clone(),
                trader_id: spec.trader_id.clone(),
            };
            let strategy = match resolve_strategy(&spec.strategy_cfg, &deps) {
                Ok(strategy) => strategy,
                Err(err) => {
                    error!(trader = %spec.trader_id, error = %err, "failed resolving strategy");
                    continue;
                }
            };

            let trader_cfg = TraderCfg {
                instrument,
                trader_id: spec.trader_id.clone(),
                account_id: spec.account_id.clone(),
                tick_delay: cfg.tick_delay,
                on_trading_error_delay: cfg.on_trading_error_delay,
                on_orders_error_delay: cfg.on_orders_error_delay,
            };

            if let Some(existing) = self.find_trader(&spec.trader_id) {
                let current = existing.strategy();
                if current.name() == strategy.name() {
                    if let Err(err) = current.update_config(&spec.strategy_cfg) {
                        error!(trader = %spec.trader_id, error = %err, "failed updating strategy config");
                        continue;
                    }
                    info!(trader = %spec.trader_id, "strategy config updated");
                } else {
                    existing.update_strategy(strategy);
                    info!(trader = %spec.trader_id, "strategy updated");
                }

                if let Err(err) = existing.update_config(trader_cfg).await {
                    error!(trader = %spec.trader_id, error = %err, "failed updating trader config");
                    continue;
                }
                info!(trader = %spec.trader_id, "trader config updated");
                continue;
            }

            let trader = match TraderService::new(
                &self.shutdown,
                self.broker.clone(),
                self.storage.clone(),
                self.history.clone(),
                strategy,
                trader_cfg,
            )
            .await
            {
                Ok(trader) => trader,
                Err(err) => {
                    error!(trader = %spec.trader_id, error = %err, "failed creating trader");
                    continue;
                }
            };
            if let Err(err) = self.go_new_one_trader(trader) {
                error!(trader = %spec.trader_id, error = %err, "failed starting trader");
            }
        }

        self.stop_missing_traders(cfg).await;
    }

    /// Insert the trader into the directory and spawn its supervisor. The
    /// supervisor is the only place in the process that swallows panics: a
    /// panicking trader is logged, parked for `wait_on_panic` and re-entered;
    /// siblings never notice.
    fn go_new_one_trader(&self, trader: Arc<TraderService>) -> EngineResult<()> {
        self.add_trader(trader.clone())?;

        let shutdown = self.shutdown.clone();
        let wait_on_panic = self.wait_on_panic;
        let handle = tokio::spawn(async move {
            let trader_id = trader.config().trader_id;
            info!(trader = %trader_id, "trader started");
            loop {
                let run = AssertUnwindSafe(trader.clone().run_trading()).catch_unwind();
                match run.await {
                    Ok(()) => break,
                    Err(payload) => {
                        error!(
                            trader = %trader_id,
                            panic = panic_message(payload.as_ref()),
                            delay = ?wait_on_panic,
                            "panic recovered in trader; removed from execution during back-off"
                        );
                        shutdown.sleep(wait_on_panic).await;
                    }
                }
            }
        });
        self.supervisors.lock().unwrap().push(handle);
        Ok(())
    }

    fn add_trader(&self, trader: Arc<TraderService>) -> EngineResult<()> {
        let trader_id = trader.config().trader_id;
        let mut traders = self.traders.write().expect("fleet directory poisoned");
        if traders.contains_key(&trader_id) {
            return Err(EngineError::DuplicateTrader(trader_id));
        }
        traders.insert(trader_id, trader);
        Ok(())
    }

    /// Look a running trader up by id.
    #[must_use]
    pub fn find_trader(&self, trader_id: &str) -> Option<Arc<TraderService>> {
        self.traders
            .read()
            .expect("fleet directory poisoned")
            .get(trader_id)
            .cloned()
    }

    /// Number of traders currently in the directory.
    #[must_use]
    pub fn trader_count(&self) -> usize {
        self.traders.read().expect("fleet directory poisoned").len()
    }

    async fn stop_missing_traders(&self, cfg: &FleetConfig) {
        let stale: Vec<(String, Arc<TraderService>)> = {
            let traders = self.traders.read().expect("fleet directory poisoned");
            traders
                .iter()
                .filter(|(trader_id, _)| {
                    !cfg.traders.iter().any(|spec| &spec.trader_id == *trader_id)
                })
                .map(|(trader_id, trader)| (trader_id.clone(), trader.clone()))
                .collect()
        };

        for (trader_id, trader) in stale {
            trader.stop().await;
            self.traders
                .write()
                .expect("fleet directory poisoned")
                .remove(&trader_id);
            info!(trader = %trader_id, "trader removed from execution");
        }
    }

    /// Block until every supervisor task has returned.
    pub async fn wait(&self) {
        loop {
            let handle = self.supervisors.lock().unwrap().pop();
            match handle {
                Some(handle) => {
                    let _ = handle.await;
                }
                None => return,
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
