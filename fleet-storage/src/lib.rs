//! Persistence contract for instruments, candles and the order ledger.

use chrono::{DateTime, Utc};
use thiserror::Error;

use fleet_core::{Candle, CandleInterval, Instrument, Order};

pub mod migrations;
mod sqlite;

pub use sqlite::SqliteStorage;

/// Convenience alias for storage results.
pub type StorageResult<T> = Result<T, StorageError>;

/// Failure variants surfaced by storage implementations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested row does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// The underlying database rejected the operation.
    #[error("database error: {0}")]
    Database(String),
    /// A stored value could not be decoded into its domain type.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

/// Storage operations the engine, the strategies and the loaders consume.
///
/// Implementations may block: storage calls are permitted suspension points.
pub trait Storage: Send + Sync {
    /// Insert the instrument if absent by `(uid, isin, figi, ticker)` and
    /// return its persistent id.
    fn add_instrument(&self, instrument: &Instrument) -> StorageResult<i64>;

    /// Look an instrument up by uid.
    fn instrument_by_uid(&self, uid: &str) -> StorageResult<Instrument>;

    /// Batched candle upsert; conflicts on `(instrument_id, timestamp,
    /// interval)` are ignored. One transaction per invocation.
    fn add_candles(
        &self,
        instrument: &Instrument,
        candles: &[Candle],
        interval: CandleInterval,
    ) -> StorageResult<()>;

    /// Inclusive candle range sorted ascending by timestamp. An empty result
    /// is an error.
    fn candles(
        &self,
        instrument: &Instrument,
        interval: CandleInterval,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<Candle>>;

    /// Upsert an order row by `(instrument_id, order_id)`.
    fn put_order(&self, trader_id: &str, instrument: &Instrument, order: &Order)
        -> StorageResult<()>;

    /// Apply a broker-reported state transition to an existing row; inserts
    /// the row when the update outruns the tentative insert. Only the mutable
    /// columns change: completion time, direction, status, price, lots
    /// executed.
    fn update_order(
        &self,
        trader_id: &str,
        instrument: &Instrument,
        order: &Order,
    ) -> StorageResult<()>;

    /// Insert a tentative NEW row emitted by a strategy. A SELL row carrying
    /// `order_id_ref` also writes the symmetric back-link onto the matched
    /// BUY row.
    fn make_new_order(&self, instrument: &Instrument, order: &Order) -> StorageResult<()>;

    /// Delete a tentative row whose broker action failed, clearing any
    /// back-links that point at it.
    fn remove_order(&self, instrument: &Instrument, order: &Order) -> StorageResult<()>;

    /// Cheapest unmatched filled buy, if any.
    fn lowest_filled_buy(
        &self,
        trader_id: &str,
        instrument: &Instrument,
    ) -> StorageResult<Option<Order>>;

    /// Most expensive unmatched filled buy, if any.
    fn highest_filled_buy(
        &self,
        trader_id: &str,
        instrument: &Instrument,
    ) -> StorageResult<Option<Order>>;

    /// Most recently completed filled sell, if any.
    fn latest_filled_sell(
        &self,
        trader_id: &str,
        instrument: &Instrument,
    ) -> StorageResult<Option<Order>>;

    /// Number of unmatched filled buys.
    fn unsold_buy_count(&self, trader_id: &str, instrument: &Instrument) -> StorageResult<i64>;
}
