//! One trader: a named control loop tying an instrument, a strategy and a
//! brokerage account together.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::{EngineError, EngineResult, HistorySink, HistoryTopic};
use fleet_broker::Broker;
use fleet_core::{Instrument, LastPrice, Order, OrderUpdate, ShutdownSignal, TradingAvailability};
use fleet_storage::Storage;
use fleet_strategy::{ActionKind, Strategy, StrategyAction};

/// Per-trader runtime configuration.
#[derive(Clone)]
pub struct TraderCfg {
    pub instrument: Instrument,
    pub trader_id: String,
    pub account_id: String,
    /// Pacing between ticks of the main loop.
    pub tick_delay: Duration,
    /// Back-off after a failed tick.
    pub on_trading_error_delay: Duration,
    /// Back-off after a failed order-update receive or persist.
    pub on_orders_error_delay: Duration,
}

struct TraderState {
    cfg: TraderCfg,
    strategy: Arc<dyn Strategy>,
}

/// A running trader. Owns a child shutdown signal so the manager can stop it
/// without affecting siblings.
pub struct TraderService {
    state: RwLock<TraderState>,
    shutdown: ShutdownSignal,
    broker: Arc<dyn Broker>,
    storage: Arc<dyn Storage>,
    history: Arc<dyn HistorySink>,
}

impl TraderService {
    /// Validate the configuration, register both stream recipients and spawn
    /// the order-update consumer.
    pub async fn new(
        parent: &ShutdownSignal,
        broker: Arc<dyn Broker>,
        storage: Arc<dyn Storage>,
        history: Arc<dyn HistorySink>,
        strategy: Arc<dyn Strategy>,
        cfg: TraderCfg,
    ) -> EngineResult<Arc<Self>> {
        if cfg.trader_id.is_empty() {
            return Err(EngineError::InvalidConfig("empty unique trader id".into()));
        }

        broker
            .register_order_state_recipient(&cfg.instrument, &cfg.account_id)
            .await?;
        broker.register_last_price_recipient(&cfg.instrument).await?;

        let service = Arc::new(Self {
            state: RwLock::new(TraderState { cfg, strategy }),
            shutdown: parent.child(),
            broker,
            storage,
            history,
        });

        tokio::spawn(Self::run_orders_operating(service.clone()));

        Ok(service)
    }

    /// Snapshot of the current configuration.
    #[must_use]
    pub fn config(&self) -> TraderCfg {
        self.state.read().expect("trader state poisoned").cfg.clone()
    }

    /// Handle to the current strategy.
    #[must_use]
    pub fn strategy(&self) -> Arc<dyn Strategy> {
        self.state
            .read()
            .expect("trader state poisoned")
            .strategy
            .clone()
    }

    /// Swap the strategy instance. The next tick decides with the new one.
    pub fn update_strategy(&self, strategy: Arc<dyn Strategy>) {
        self.state.write().expect("trader state poisoned").strategy = strategy;
    }

    /// Swap the trader configuration: register the new recipients first, and
    /// only then drop the old ones, so the upstream subscription never gaps.
    pub async fn update_config(&self, new_cfg: TraderCfg) -> EngineResult<()> {
        self.broker
            .register_order_state_recipient(&new_cfg.instrument, &new_cfg.account_id)
            .await?;
        info!(trader = %new_cfg.trader_id, "registered new order state recipient");
        self.broker
            .register_last_price_recipient(&new_cfg.instrument)
            .await?;
        info!(trader = %new_cfg.trader_id, "registered new last price recipient");

        let old_cfg = {
            let mut state = self.state.write().expect("trader state poisoned");
            std::mem::replace(&mut state.cfg, new_cfg)
        };

        if let Err(err) = self
            .broker
            .unregister_order_state_recipient(&old_cfg.instrument, &old_cfg.account_id)
            .await
        {
            error!(trader = %old_cfg.trader_id, error = %err, "failed unregistering old order state recipient");
        }
        if let Err(err) = self
            .broker
            .unregister_last_price_recipient(&old_cfg.instrument)
            .await
        {
            error!(trader = %old_cfg.trader_id, error = %err, "failed unregistering old last price recipient");
        }
        Ok(())
    }

    /// Cancel the trader's context and release both subscriptions.
    /// Idempotent.
    pub async fn stop(&self) {
        self.shutdown.trigger();
        let cfg = self.config();
        if let Err(err) = self
            .broker
            .unregister_order_state_recipient(&cfg.instrument, &cfg.account_id)
            .await
        {
            error!(trader = %cfg.trader_id, error = %err, "failed unregistering order state recipient");
        }
        if let Err(err) = self
            .broker
            .unregister_last_price_recipient(&cfg.instrument)
            .await
        {
            error!(trader = %cfg.trader_id, error = %err, "failed unregistering last price recipient");
        }
    }

    /// Consumer loop persisting broker-reported order state transitions.
    /// Runs concurrently with the main loop; exits with the trader's signal.
    async fn run_orders_operating(self: Arc<Self>) {
        loop {
            if self.shutdown.triggered() {
                info!("orders listener: context is done");
                return;
            }
            let cfg = self.config();
            match self
                .broker
                .receive_orders_update(&self.shutdown, &cfg.instrument, &cfg.account_id)
                .await
            {
                Ok(update) => {
                    if update.created_at.is_none() {
                        continue;
                    }
                    let order = ledger_order(&cfg, &update);
                    if let Err(err) =
                        self.storage.update_order(&cfg.trader_id, &cfg.instrument, &order)
                    {
                        error!(
                            trader = %cfg.trader_id,
                            error = %err,
                            delay = ?cfg.on_orders_error_delay,
                            "operating orders update failed"
                        );
                        self.shutdown.sleep(cfg.on_orders_error_delay).await;
                    }
                }
                Err(err) => {
                    if self.shutdown.triggered() {
                        info!("orders listener: context is done");
                        return;
                    }
                    error!(
                        trader = %cfg.trader_id,
                        error = %err,
                        delay = ?cfg.on_orders_error_delay,
                        "operating orders update failed"
                    );
                    self.shutdown.sleep(cfg.on_orders_error_delay).await;
                }
            }
        }
    }

    /// Main control loop: tick pacing, availability check, decision,
    /// action execution with compensation on failure.
    pub async fn run_trading(self: Arc<Self>) {
        let mut failed = false;
        loop {
            let cfg = self.config();

            if failed {
                self.shutdown.sleep(cfg.on_trading_error_delay).await;
                failed = false;
            }
            if self.shutdown.triggered() {
                info!(trader = %cfg.trader_id, "context is done");
                return;
            }

            self.shutdown.sleep(cfg.tick_delay).await;

            let last_price = match self
                .broker
                .receive_last_price(&self.shutdown, &cfg.instrument)
                .await
            {
                Ok(price) => price,
                Err(err) => {
                    error!(uid = %cfg.instrument.uid, error = %err, "failed receiving last price");
                    failed = true;
                    continue;
                }
            };
            let tick_started = Instant::now();

            match self.broker.trading_availability(&cfg.instrument).await {
                Ok(TradingAvailability::Available) => {}
                Ok(TradingAvailability::NotAvailableViaApi) => {
                    error!(
                        ticker = %cfg.instrument.ticker,
                        trader = %cfg.trader_id,
                        "instrument not available via API"
                    );
                    continue;
                }
                Ok(TradingAvailability::NotAvailableNow) => continue,
                Ok(TradingAvailability::Undefined) => {
                    failed = true;
                    continue;
                }
                Err(err) => {
                    error!(uid = %cfg.instrument.uid, error = %err, "failed getting trading availability");
                    failed = true;
                    continue;
                }
            }

            self.write_price_sample(&cfg, &last_price);

            let actions = match self.strategy().decide(&cfg.trader_id, &cfg.instrument, &last_price)
            {
                Ok(actions) => actions,
                Err(err) => {
                    error!(uid = %cfg.instrument.uid, error = %err, "failed getting action decision");
                    failed = true;
                    continue;
                }
            };

            for mut action in actions {
                let compensation = action.on_error.take();
                match self.make_action(&cfg, &action, tick_started).await {
                    Ok(()) => {}
                    Err(err) => {
                        error!(
                            trader = %cfg.trader_id,
                            action = action.action.as_str(),
                            lots = action.lots,
                            ticker = %cfg.instrument.ticker,
                            error = %err,
                            "failed making action"
                        );
                        if let Some(compensation) = compensation {
                            if let Err(err) = compensation() {
                                error!(
                                    trader = %cfg.trader_id,
                                    error = %err,
                                    "fatal: failed executing on-error compensation"
                                );
                            }
                        }
                        failed = true;
                        break;
                    }
                }
            }
        }
    }

    async fn make_action(
        &self,
        cfg: &TraderCfg,
        action: &StrategyAction,
        tick_started: Instant,
    ) -> EngineResult<()> {
        let result = match action.action {
            ActionKind::Hold => return Ok(()),
            ActionKind::Buy => {
                self.broker
                    .make_buy_order(
                        &cfg.instrument,
                        action.lots,
                        &action.request_id,
                        &cfg.account_id,
                    )
                    .await?
            }
            ActionKind::Sell => {
                self.broker
                    .make_sell_order(
                        &cfg.instrument,
                        action.lots,
                        &action.request_id,
                        &cfg.account_id,
                    )
                    .await?
            }
        };

        info!(
            trader = %cfg.trader_id,
            instrument = %cfg.instrument.name,
            direction = action.action.as_str(),
            status = %result.status,
            lots_requested = action.lots,
            price = result.executed_price.to_f64(),
            commission = result.executed_commission.to_f64(),
            elapsed = ?tick_started.elapsed(),
            "order placed"
        );
        let record = [
            ("trader_id", cfg.trader_id.clone()),
            ("order_id", result.order_id.clone()),
            ("uid", cfg.instrument.uid.clone()),
            ("direction", action.action.as_str().to_string()),
            ("status", result.status.clone()),
            ("lots", action.lots.to_string()),
            ("price", result.executed_price.to_string()),
            ("commission", result.executed_commission.to_string()),
        ];
        if let Err(err) = self.history.write(HistoryTopic::OrdersHistory, &record) {
            warn!(trader = %cfg.trader_id, error = %err, "failed writing order history event");
        }
        Ok(())
    }

    fn write_price_sample(&self, cfg: &TraderCfg, last_price: &LastPrice) {
        let record = [
            ("trader_id", cfg.trader_id.clone()),
            ("uid", last_price.uid.clone()),
            ("price", last_price.price.to_string()),
            ("time", last_price.time.to_rfc3339()),
        ];
        if let Err(err) = self.history.write(HistoryTopic::PriceHistory, &record) {
            warn!(trader = %cfg.trader_id, error = %err, "failed writing price history sample");
        }
    }
}

fn ledger_order(cfg: &TraderCfg, update: &OrderUpdate) -> Order {
    Order {
        id: 0,
        created_at: update.created_at,
        completion_time: update.completion_time,
        order_id: update.order_id.clone(),
        order_id_ref: None,
        direction: update.direction,
        status: update.status,
        price: update.price,
        lots_requested: update.lots_requested,
        lots_executed: update.lots_executed,
        trader_id: cfg.trader_id.clone(),
        instrument_id: cfg.instrument.id,
    }
}
