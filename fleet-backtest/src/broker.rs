//! Candle-replay broker with an instantly-filling virtual account.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::mpsc;

use crate::BacktestStorage;
use fleet_broker::{Broker, BrokerError, BrokerResult};
use fleet_core::{
    Direction, Instrument, LastPrice, Order, OrderStatus, OrderUpdate, PostOrderResult,
    Quotation, ShutdownSignal, TradingAvailability,
};
use fleet_storage::Storage;

struct AccountState {
    account: f64,
    min_account: f64,
    max_account: f64,
    last_price: f64,
    offset: usize,
    clock: DateTime<Utc>,
    done_tx: Option<mpsc::Sender<String>>,
}

/// Broker replacement replaying a candle buffer and filling orders at the
/// last replayed close.
pub struct BacktestBroker {
    state: Mutex<AccountState>,
    commission_rate: f64,
    trader_id: String,
    storage: Arc<BacktestStorage>,
}

impl BacktestBroker {
    /// `commission_rate` is a fraction of the order notional (0.0005 means
    /// 0.05 %). `done_tx` fires once, when the candle buffer is exhausted.
    pub fn new(
        start_deposit: f64,
        commission_rate: f64,
        storage: Arc<BacktestStorage>,
        trader_id: impl Into<String>,
        done_tx: mpsc::Sender<String>,
    ) -> Self {
        Self {
            state: Mutex::new(AccountState {
                account: start_deposit,
                min_account: start_deposit,
                max_account: start_deposit,
                last_price: 0.0,
                offset: 0,
                clock: Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap(),
                done_tx: Some(done_tx),
            }),
            commission_rate,
            trader_id: trader_id.into(),
            storage,
        }
    }

    #[must_use]
    pub fn account(&self) -> f64 {
        self.state.lock().unwrap().account
    }

    #[must_use]
    pub fn min_account(&self) -> f64 {
        self.state.lock().unwrap().min_account
    }

    #[must_use]
    pub fn max_account(&self) -> f64 {
        self.state.lock().unwrap().max_account
    }

    fn fill_order(
        &self,
        instrument: &Instrument,
        lots: i64,
        request_id: &str,
        direction: Direction,
    ) -> BrokerResult<PostOrderResult> {
        if lots < 1 {
            return Err(BrokerError::InvalidRequest(format!(
                "incorrect lots to make order: {lots}"
            )));
        }

        let mut state = self.state.lock().unwrap();
        let notional = state.last_price * lots as f64 * f64::from(instrument.lot);
        let commission = notional * self.commission_rate;
        match direction {
            Direction::Buy => {
                state.account -= notional + commission;
                if state.account < state.min_account {
                    state.min_account = state.account;
                }
            }
            Direction::Sell => {
                state.account += notional - commission;
                if state.account > state.max_account {
                    state.max_account = state.account;
                }
            }
        }

        let filled_at = state.clock;
        state.clock = state.clock + chrono::Duration::seconds(1);
        let executed_price = Quotation::from_f64(state.last_price);
        drop(state);

        let order = Order {
            id: 0,
            created_at: Some(filled_at),
            completion_time: Some(filled_at),
            order_id: request_id.to_string(),
            order_id_ref: None,
            direction,
            status: OrderStatus::Fill,
            price: executed_price,
            lots_requested: lots,
            lots_executed: lots,
            trader_id: self.trader_id.clone(),
            instrument_id: instrument.id,
        };
        self.storage
            .put_order(&self.trader_id, instrument, &order)
            .map_err(|err| BrokerError::Other(err.to_string()))?;

        Ok(PostOrderResult {
            order_id: request_id.to_string(),
            instrument_uid: instrument.uid.clone(),
            executed_price,
            executed_commission: Quotation::from_f64(commission),
            lots_executed: lots,
            status: OrderStatus::Fill.as_str().to_string(),
        })
    }
}

#[async_trait]
impl Broker for BacktestBroker {
    async fn find_instrument(&self, identifier: &str) -> BrokerResult<Instrument> {
        Ok(Instrument {
            id: 1,
            uid: identifier.to_string(),
            isin: "ISIN".into(),
            figi: "FIGI".into(),
            ticker: "TICKER".into(),
            class_code: "CLASSCODE".into(),
            name: "NAME".into(),
            lot: 1,
            available_api: true,
            for_quals: false,
            first_candle_date: Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap(),
            instance_id: uuid::Uuid::new_v4(),
        })
    }

    async fn trading_availability(
        &self,
        _instrument: &Instrument,
    ) -> BrokerResult<TradingAvailability> {
        Ok(TradingAvailability::Available)
    }

    async fn register_last_price_recipient(&self, _instrument: &Instrument) -> BrokerResult<()> {
        Ok(())
    }

    async fn unregister_last_price_recipient(&self, _instrument: &Instrument) -> BrokerResult<()> {
        Ok(())
    }

    async fn register_order_state_recipient(
        &self,
        _instrument: &Instrument,
        _account_id: &str,
    ) -> BrokerResult<()> {
        Ok(())
    }

    async fn unregister_order_state_recipient(
        &self,
        _instrument: &Instrument,
        _account_id: &str,
    ) -> BrokerResult<()> {
        Ok(())
    }

    async fn receive_last_price(
        &self,
        _shutdown: &ShutdownSignal,
        instrument: &Instrument,
    ) -> BrokerResult<LastPrice> {
        let mut state = self.state.lock().unwrap();
        let candle = self.storage.candle_at(state.offset);
        state.offset += 1;
        match candle {
            Some(candle) => {
                state.last_price = candle.close.to_f64();
                Ok(LastPrice {
                    uid: instrument.uid.clone(),
                    figi: instrument.figi.clone(),
                    price: candle.close,
                    time: candle.timestamp,
                })
            }
            None => {
                // One-shot termination signal for the harness.
                if let Some(done) = state.done_tx.take() {
                    let _ = done.try_send("candle history exhausted".to_string());
                }
                Err(BrokerError::StreamClosed("candle history exhausted".into()))
            }
        }
    }

    async fn receive_orders_update(
        &self,
        shutdown: &ShutdownSignal,
        instrument: &Instrument,
        _account_id: &str,
    ) -> BrokerResult<OrderUpdate> {
        // Fills are written straight into storage; this stream stays silent
        // until the run is cancelled.
        shutdown.wait().await;
        Err(BrokerError::Cancelled(format!(
            "backtest order stream for {}",
            instrument.ticker
        )))
    }

    async fn make_buy_order(
        &self,
        instrument: &Instrument,
        lots: i64,
        request_id: &str,
        _account_id: &str,
    ) -> BrokerResult<PostOrderResult> {
        self.fill_order(instrument, lots, request_id, Direction::Buy)
    }

    async fn make_sell_order(
        &self,
        instrument: &Instrument,
        lots: i64,
        request_id: &str,
        _account_id: &str,
    ) -> BrokerResult<PostOrderResult> {
        self.fill_order(instrument, lots, request_id, Direction::Sell)
    }
}
