//! In-memory storage with the same ledger semantics as the SQL adapter.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use fleet_core::{Candle, CandleInterval, Direction, Instrument, Order, OrderStatus};
use fleet_storage::{Storage, StorageError, StorageResult};

struct Inner {
    instrument: Option<Instrument>,
    candles: Vec<Candle>,
    orders: HashMap<String, Order>,
}

/// Candle buffer plus order ledger, shared by the back-test broker and the
/// strategy under test.
pub struct BacktestStorage {
    inner: Mutex<Inner>,
}

impl BacktestStorage {
    #[must_use]
    pub fn new(candles: Vec<Candle>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                instrument: None,
                candles,
                orders: HashMap::new(),
            }),
        }
    }

    /// Candle at the replay offset, if the buffer still has one.
    #[must_use]
    pub fn candle_at(&self, offset: usize) -> Option<Candle> {
        self.inner.lock().unwrap().candles.get(offset).cloned()
    }

    /// Ledger row by its idempotency key.
    #[must_use]
    pub fn order_by_id(&self, order_id: &str) -> Option<Order> {
        self.inner.lock().unwrap().orders.get(order_id).cloned()
    }

    /// Number of ledger rows.
    #[must_use]
    pub fn order_count(&self) -> usize {
        self.inner.lock().unwrap().orders.len()
    }

    /// Purchase-price value of the unmatched filled buys, in account
    /// currency.
    #[must_use]
    pub fn in_instruments_value(&self) -> f64 {
        let inner = self.inner.lock().unwrap();
        let lot = inner
            .instrument
            .as_ref()
            .map_or(1.0, |instrument| f64::from(instrument.lot));
        inner
            .orders
            .values()
            .filter(|order| is_unmatched_filled_buy(&inner.orders, order))
            .map(|order| order.price.to_f64() * order.lots_executed as f64 * lot)
            .sum()
    }
}

fn is_unmatched_filled_buy(orders: &HashMap<String, Order>, order: &Order) -> bool {
    order.direction == Direction::Buy
        && order.status == OrderStatus::Fill
        && !orders.values().any(|other| {
            other.direction == Direction::Sell
                && other.order_id_ref.as_deref() == Some(order.order_id.as_str())
        })
}

fn apply_update(existing: &mut Order, update: &Order) {
    existing.completion_time = update.completion_time;
    existing.direction = update.direction;
    existing.status = update.status;
    existing.price = update.price;
    existing.lots_executed = update.lots_executed;
}

impl Storage for BacktestStorage {
    fn add_instrument(&self, instrument: &Instrument) -> StorageResult<i64> {
        let mut inner = self.inner.lock().unwrap();
        let id = if instrument.id > 0 { instrument.id } else { 1 };
        inner.instrument = Some(instrument.clone());
        Ok(id)
    }

    fn instrument_by_uid(&self, uid: &str) -> StorageResult<Instrument> {
        let inner = self.inner.lock().unwrap();
        inner
            .instrument
            .as_ref()
            .filter(|instrument| instrument.uid == uid)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("instrument '{uid}'")))
    }

    fn add_candles(
        &self,
        _instrument: &Instrument,
        candles: &[Candle],
        _interval: CandleInterval,
    ) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.candles.extend_from_slice(candles);
        Ok(())
    }

    fn candles(
        &self,
        instrument: &Instrument,
        interval: CandleInterval,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<Candle>> {
        let inner = self.inner.lock().unwrap();
        let mut matching: Vec<Candle> = inner
            .candles
            .iter()
            .filter(|candle| candle.timestamp >= from && candle.timestamp <= to)
            .cloned()
            .collect();
        matching.sort_by_key(|candle| candle.timestamp);
        if matching.is_empty() {
            return Err(StorageError::NotFound(format!(
                "no '{}' candles for instrument {} in the requested range",
                interval, instrument.ticker
            )));
        }
        Ok(matching)
    }

    fn put_order(
        &self,
        _trader_id: &str,
        _instrument: &Instrument,
        order: &Order,
    ) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.orders.get_mut(&order.order_id) {
            Some(existing) => apply_update(existing, order),
            None => {
                inner.orders.insert(order.order_id.clone(), order.clone());
            }
        }
        Ok(())
    }

    fn update_order(
        &self,
        trader_id: &str,
        instrument: &Instrument,
        order: &Order,
    ) -> StorageResult<()> {
        self.put_order(trader_id, instrument, order)
    }

    fn make_new_order(&self, _instrument: &Instrument, order: &Order) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if order.direction == Direction::Sell {
            if let Some(matched_buy) = order.order_id_ref.clone() {
                if let Some(buy) = inner.orders.get_mut(&matched_buy) {
                    buy.order_id_ref = Some(order.order_id.clone());
                }
            }
        }
        inner.orders.insert(order.order_id.clone(), order.clone());
        Ok(())
    }

    fn remove_order(&self, _instrument: &Instrument, order: &Order) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.orders.remove(&order.order_id);
        for other in inner.orders.values_mut() {
            if other.order_id_ref.as_deref() == Some(order.order_id.as_str()) {
                other.order_id_ref = None;
            }
        }
        Ok(())
    }

    fn lowest_filled_buy(
        &self,
        _trader_id: &str,
        _instrument: &Instrument,
    ) -> StorageResult<Option<Order>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .orders
            .values()
            .filter(|order| is_unmatched_filled_buy(&inner.orders, order))
            .min_by_key(|order| order.price.as_nanos())
            .cloned())
    }

    fn highest_filled_buy(
        &self,
        _trader_id: &str,
        _instrument: &Instrument,
    ) -> StorageResult<Option<Order>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .orders
            .values()
            .filter(|order| is_unmatched_filled_buy(&inner.orders, order))
            .max_by_key(|order| order.price.as_nanos())
            .cloned())
    }

    fn latest_filled_sell(
        &self,
        _trader_id: &str,
        _instrument: &Instrument,
    ) -> StorageResult<Option<Order>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .orders
            .values()
            .filter(|order| {
                order.direction == Direction::Sell && order.status == OrderStatus::Fill
            })
            .max_by_key(|order| order.completion_time)
            .cloned())
    }

    fn unsold_buy_count(&self, _trader_id: &str, _instrument: &Instrument) -> StorageResult<i64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .orders
            .values()
            .filter(|order| is_unmatched_filled_buy(&inner.orders, order))
            .count() as i64)
    }
}
