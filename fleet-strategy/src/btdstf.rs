//! "Buy the dip, sell the fix" reference strategy.
//!
//! Keeps up to `max_depth` concurrently open buys in the ledger. A drop of
//! `pct_down_to_buy` below the reference order price buys another tranche; a
//! rise of `pct_up_to_sell` above the cheapest open buy sells it. When the
//! ledger is full and the price keeps falling, the most expensive open buy is
//! discarded to make room.

use std::sync::{Arc, RwLock};

use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    ActionKind, Strategy, StrategyAction, StrategyDeps, StrategyError, StrategyFactory,
    StrategyResult,
};
use fleet_core::{Direction, Instrument, LastPrice, Order, OrderStatus};
use fleet_storage::Storage;

const NAME: &str = "btdstf";

/// Runtime parameters, reconfigurable between ticks.
#[derive(Clone, Debug, Deserialize)]
pub struct BtdstfConfig {
    /// Maximum number of concurrently open buys.
    pub max_depth: i64,
    /// Base lot unit per buy tranche.
    pub lots_to_buy: i64,
    /// Fractional drop below the reference price that triggers a buy.
    pub pct_down_to_buy: f64,
    /// Fractional rise above the cheapest open buy that triggers a sell.
    pub pct_up_to_sell: f64,
}

impl BtdstfConfig {
    fn parse(params: &serde_json::Value) -> StrategyResult<Self> {
        let cfg: Self = serde_json::from_value(params.clone()).map_err(|err| {
            StrategyError::InvalidConfig(format!("failed to parse btdstf config: {err}"))
        })?;
        if cfg.max_depth < 1 {
            return Err(StrategyError::InvalidConfig(
                "max_depth must be at least 1".into(),
            ));
        }
        if cfg.lots_to_buy < 1 {
            return Err(StrategyError::InvalidConfig(
                "lots_to_buy must be at least 1".into(),
            ));
        }
        if cfg.pct_down_to_buy < 0.0 || cfg.pct_up_to_sell < 0.0 {
            return Err(StrategyError::InvalidConfig(
                "percentage thresholds must not be negative".into(),
            ));
        }
        Ok(cfg)
    }
}

pub struct Btdstf {
    cfg: RwLock<BtdstfConfig>,
    storage: Arc<dyn Storage>,
}

impl Btdstf {
    pub fn new(cfg: BtdstfConfig, storage: Arc<dyn Storage>) -> Self {
        Self {
            cfg: RwLock::new(cfg),
            storage,
        }
    }

    /// Insert the tentative NEW row for a non-HOLD directive and wire the
    /// compensation that rolls it back on broker failure.
    fn finalize(
        &self,
        trader_id: &str,
        instrument: &Instrument,
        last_price: &LastPrice,
        directive: Directive,
    ) -> StrategyResult<StrategyAction> {
        let lots = directive.lots.max(1);
        let request_id = Uuid::new_v4().to_string();
        let order = Order {
            id: 0,
            created_at: Some(Utc::now()),
            completion_time: None,
            order_id: request_id.clone(),
            order_id_ref: directive.matched_buy,
            direction: match directive.kind {
                ActionKind::Sell => Direction::Sell,
                _ => Direction::Buy,
            },
            status: OrderStatus::New,
            price: last_price.price,
            lots_requested: lots,
            lots_executed: 0,
            trader_id: trader_id.to_string(),
            instrument_id: instrument.id,
        };
        self.storage.make_new_order(instrument, &order)?;

        let storage = self.storage.clone();
        let rollback_instrument = instrument.clone();
        Ok(StrategyAction {
            action: directive.kind,
            lots,
            request_id,
            on_error: Some(Box::new(move || {
                storage.remove_order(&rollback_instrument, &order)
            })),
        })
    }
}

struct Directive {
    kind: ActionKind,
    lots: i64,
    matched_buy: Option<String>,
}

impl Strategy for Btdstf {
    fn name(&self) -> &'static str {
        NAME
    }

    fn decide(
        &self,
        trader_id: &str,
        instrument: &Instrument,
        last_price: &LastPrice,
    ) -> StrategyResult<Vec<StrategyAction>> {
        let cfg = self.cfg.read().expect("btdstf config poisoned").clone();

        let mut unsold = self.storage.unsold_buy_count(trader_id, instrument)?;
        let lowest_buy = self.storage.lowest_filled_buy(trader_id, instrument)?;
        let bought = lowest_buy.is_some();
        let reference = match lowest_buy {
            Some(order) => Some(order),
            None => self.storage.latest_filled_sell(trader_id, instrument)?,
        };

        let Some(reference) = reference else {
            // Fresh ledger: open the full tranche at once.
            let directive = Directive {
                kind: ActionKind::Buy,
                lots: cfg.lots_to_buy * (cfg.max_depth - unsold),
                matched_buy: None,
            };
            return Ok(vec![self.finalize(trader_id, instrument, last_price, directive)?]);
        };

        let reference_price = reference.price.to_f64();
        let price = last_price.price.to_f64();
        let down_to_buy = price * (1.0 + cfg.pct_down_to_buy) < reference_price;
        let up_to_sell = reference_price * (1.0 + cfg.pct_up_to_sell) < price;
        let all_sold = !bought;

        let mut directives = Vec::new();
        if down_to_buy || all_sold {
            if unsold >= cfg.max_depth {
                // Ledger full on a falling price: discard the worst buy.
                if let Some(worst) = self.storage.highest_filled_buy(trader_id, instrument)? {
                    directives.push(Directive {
                        kind: ActionKind::Sell,
                        lots: worst.lots_executed,
                        matched_buy: Some(worst.order_id),
                    });
                    unsold -= 1;
                }
            }
            directives.push(Directive {
                kind: ActionKind::Buy,
                lots: cfg.lots_to_buy * (cfg.max_depth - unsold),
                matched_buy: None,
            });
        } else if up_to_sell && bought {
            directives.push(Directive {
                kind: ActionKind::Sell,
                lots: reference.lots_executed,
                matched_buy: Some(reference.order_id),
            });
        } else {
            return Ok(vec![StrategyAction::hold()]);
        }

        let mut actions = Vec::with_capacity(directives.len());
        for directive in directives {
            actions.push(self.finalize(trader_id, instrument, last_price, directive)?);
        }
        Ok(actions)
    }

    fn update_config(&self, params: &serde_json::Value) -> StrategyResult<()> {
        let cfg = BtdstfConfig::parse(params)?;
        *self.cfg.write().expect("btdstf config poisoned") = cfg;
        Ok(())
    }
}

pub(crate) struct BtdstfFactory;

impl StrategyFactory for BtdstfFactory {
    fn name(&self) -> &'static str {
        NAME
    }

    fn build(
        &self,
        params: &serde_json::Value,
        deps: &StrategyDeps,
    ) -> StrategyResult<Arc<dyn Strategy>> {
        let cfg = BtdstfConfig::parse(params)?;
        Ok(Arc::new(Btdstf::new(cfg, deps.storage.clone())))
    }
}
