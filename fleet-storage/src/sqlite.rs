//! SQLite-backed storage adapter.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::{migrations, Storage, StorageError, StorageResult};
use fleet_core::{Candle, CandleInterval, Direction, Instrument, Order, OrderStatus, Quotation};

/// Storage implementation over a single SQLite connection.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open (or create) the database at `path` and bring the schema up to
    /// date.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        migrations::up(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database, used by tests and throwaway runs.
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        migrations::up(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn ranked_filled_buy(
        &self,
        trader_id: &str,
        instrument: &Instrument,
        order_clause: &str,
    ) -> StorageResult<Option<Order>> {
        let conn = self.conn.lock().unwrap();
        let query = format!(
            "SELECT {ORDER_COLUMNS} FROM orders o
             WHERE o.trader_id = ?1 AND o.instrument_id = ?2
               AND o.direction = 'BUY' AND o.status = 'FILL'
               AND NOT EXISTS (
                   SELECT 1 FROM orders s
                   WHERE s.instrument_id = o.instrument_id
                     AND s.direction = 'SELL'
                     AND s.order_id_ref = o.order_id
               )
             ORDER BY {order_clause}
             LIMIT 1"
        );
        let order = conn
            .query_row(&query, params![trader_id, instrument.id], order_from_row)
            .optional()?;
        order.transpose().map_err(Into::into)
    }
}

const ORDER_COLUMNS: &str = "o.id, o.created_at, o.completion_time, o.order_id, o.order_id_ref, \
     o.direction, o.status, o.price_units, o.price_nano, o.lots_requested, o.lots_executed, \
     o.trader_id, o.instrument_id";

impl Storage for SqliteStorage {
    fn add_instrument(&self, instrument: &Instrument) -> StorageResult<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO instruments
                 (uid, isin, figi, ticker, class_code, name, lot, available_api, for_quals,
                  first_candle_date)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT (uid, isin, figi, ticker) DO NOTHING",
            params![
                instrument.uid,
                instrument.isin,
                instrument.figi,
                instrument.ticker,
                instrument.class_code,
                instrument.name,
                instrument.lot,
                instrument.available_api,
                instrument.for_quals,
                instrument.first_candle_date.timestamp(),
            ],
        )?;
        let id = conn.query_row(
            "SELECT id FROM instruments
             WHERE uid = ?1 AND isin = ?2 AND figi = ?3 AND ticker = ?4",
            params![instrument.uid, instrument.isin, instrument.figi, instrument.ticker],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(id)
    }

    fn instrument_by_uid(&self, uid: &str) -> StorageResult<Instrument> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, uid, isin, figi, ticker, class_code, name, lot, available_api,
                    for_quals, first_candle_date
             FROM instruments WHERE uid = ?1",
            params![uid],
            |row| {
                Ok(Instrument {
                    id: row.get(0)?,
                    uid: row.get(1)?,
                    isin: row.get(2)?,
                    figi: row.get(3)?,
                    ticker: row.get(4)?,
                    class_code: row.get(5)?,
                    name: row.get(6)?,
                    lot: row.get(7)?,
                    available_api: row.get(8)?,
                    for_quals: row.get(9)?,
                    first_candle_date: decode_timestamp(row.get(10)?),
                    instance_id: Uuid::nil(),
                })
            },
        )
        .optional()?
        .ok_or_else(|| StorageError::NotFound(format!("instrument '{uid}'")))
    }

    fn add_candles(
        &self,
        instrument: &Instrument,
        candles: &[Candle],
        interval: CandleInterval,
    ) -> StorageResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO candles
                     (instrument_id, ts, interval, open_units, open_nano, high_units, high_nano,
                      low_units, low_nano, close_units, close_nano, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT (instrument_id, ts, interval) DO NOTHING",
            )?;
            for candle in candles {
                stmt.execute(params![
                    instrument.id,
                    candle.timestamp.timestamp(),
                    interval.as_str(),
                    candle.open.units,
                    candle.open.nano,
                    candle.high.units,
                    candle.high.nano,
                    candle.low.units,
                    candle.low.nano,
                    candle.close.units,
                    candle.close.nano,
                    candle.volume,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn candles(
        &self,
        instrument: &Instrument,
        interval: CandleInterval,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<Candle>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT ts, open_units, open_nano, high_units, high_nano, low_units, low_nano,
                    close_units, close_nano, volume
             FROM candles
             WHERE instrument_id = ?1 AND interval = ?2 AND ts >= ?3 AND ts <= ?4
             ORDER BY ts ASC",
        )?;
        let instrument_id = instrument.id;
        let rows = stmt.query_map(
            params![instrument_id, interval.as_str(), from.timestamp(), to.timestamp()],
            move |row| {
                Ok(Candle {
                    instrument_id,
                    timestamp: decode_timestamp(row.get(0)?),
                    interval,
                    open: Quotation::new(row.get(1)?, row.get(2)?),
                    high: Quotation::new(row.get(3)?, row.get(4)?),
                    low: Quotation::new(row.get(5)?, row.get(6)?),
                    close: Quotation::new(row.get(7)?, row.get(8)?),
                    volume: row.get(9)?,
                })
            },
        )?;
        let mut candles = Vec::new();
        for row in rows {
            candles.push(row?);
        }
        if candles.is_empty() {
            return Err(StorageError::NotFound(format!(
                "no '{}' candles for instrument {} in the requested range",
                interval, instrument.ticker
            )));
        }
        Ok(candles)
    }

    fn put_order(
        &self,
        trader_id: &str,
        instrument: &Instrument,
        order: &Order,
    ) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        upsert_order(&conn, trader_id, instrument.id, order)
    }

    fn update_order(
        &self,
        trader_id: &str,
        instrument: &Instrument,
        order: &Order,
    ) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        upsert_order(&conn, trader_id, instrument.id, order)
    }

    fn make_new_order(&self, instrument: &Instrument, order: &Order) -> StorageResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO orders
                 (created_at, completion_time, order_id, order_id_ref, direction, status,
                  price_units, price_nano, lots_requested, lots_executed, trader_id,
                  instrument_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                order.created_at.map(|t| t.timestamp()),
                order.completion_time.map(|t| t.timestamp()),
                order.order_id,
                order.order_id_ref,
                order.direction.as_str(),
                order.status.as_str(),
                order.price.units,
                order.price.nano,
                order.lots_requested,
                order.lots_executed,
                order.trader_id,
                instrument.id,
            ],
        )?;
        if order.direction == Direction::Sell {
            if let Some(matched_buy) = &order.order_id_ref {
                tx.execute(
                    "UPDATE orders SET order_id_ref = ?1
                     WHERE instrument_id = ?2 AND order_id = ?3",
                    params![order.order_id, instrument.id, matched_buy],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn remove_order(&self, instrument: &Instrument, order: &Order) -> StorageResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM orders WHERE instrument_id = ?1 AND order_id = ?2",
            params![instrument.id, order.order_id],
        )?;
        tx.execute(
            "UPDATE orders SET order_id_ref = NULL
             WHERE instrument_id = ?1 AND order_id_ref = ?2",
            params![instrument.id, order.order_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn lowest_filled_buy(
        &self,
        trader_id: &str,
        instrument: &Instrument,
    ) -> StorageResult<Option<Order>> {
        self.ranked_filled_buy(trader_id, instrument, "o.price_units ASC, o.price_nano ASC")
    }

    fn highest_filled_buy(
        &self,
        trader_id: &str,
        instrument: &Instrument,
    ) -> StorageResult<Option<Order>> {
        self.ranked_filled_buy(trader_id, instrument, "o.price_units DESC, o.price_nano DESC")
    }

    fn latest_filled_sell(
        &self,
        trader_id: &str,
        instrument: &Instrument,
    ) -> StorageResult<Option<Order>> {
        let conn = self.conn.lock().unwrap();
        let query = format!(
            "SELECT {ORDER_COLUMNS} FROM orders o
             WHERE o.trader_id = ?1 AND o.instrument_id = ?2
               AND o.direction = 'SELL' AND o.status = 'FILL'
             ORDER BY o.completion_time DESC
             LIMIT 1"
        );
        let order = conn
            .query_row(&query, params![trader_id, instrument.id], order_from_row)
            .optional()?;
        order.transpose().map_err(Into::into)
    }

    fn unsold_buy_count(&self, trader_id: &str, instrument: &Instrument) -> StorageResult<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM orders o
             WHERE o.trader_id = ?1 AND o.instrument_id = ?2
               AND o.direction = 'BUY' AND o.status = 'FILL'
               AND NOT EXISTS (
                   SELECT 1 FROM orders s
                   WHERE s.instrument_id = o.instrument_id
                     AND s.direction = 'SELL'
                     AND s.order_id_ref = o.order_id
               )",
            params![trader_id, instrument.id],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(count)
    }
}

fn upsert_order(
    conn: &Connection,
    trader_id: &str,
    instrument_id: i64,
    order: &Order,
) -> StorageResult<()> {
    conn.execute(
        "INSERT INTO orders
             (created_at, completion_time, order_id, order_id_ref, direction, status,
              price_units, price_nano, lots_requested, lots_executed, trader_id, instrument_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT (instrument_id, order_id) DO UPDATE SET
             completion_time = excluded.completion_time,
             direction = excluded.direction,
             status = excluded.status,
             price_units = excluded.price_units,
             price_nano = excluded.price_nano,
             lots_executed = excluded.lots_executed",
        params![
            order.created_at.map(|t| t.timestamp()),
            order.completion_time.map(|t| t.timestamp()),
            order.order_id,
            order.order_id_ref,
            order.direction.as_str(),
            order.status.as_str(),
            order.price.units,
            order.price.nano,
            order.lots_requested,
            order.lots_executed,
            trader_id,
            instrument_id,
        ],
    )?;
    Ok(())
}

fn decode_timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or_default()
}

type RowResult = Result<Order, StorageError>;

fn order_from_row(row: &Row<'_>) -> rusqlite::Result<RowResult> {
    let direction: String = row.get(5)?;
    let status: String = row.get(6)?;
    Ok(build_order(row, &direction, &status))
}

fn build_order(row: &Row<'_>, direction: &str, status: &str) -> RowResult {
    Ok(Order {
        id: row.get(0).map_err(StorageError::from)?,
        created_at: row
            .get::<_, Option<i64>>(1)
            .map_err(StorageError::from)?
            .map(decode_timestamp),
        completion_time: row
            .get::<_, Option<i64>>(2)
            .map_err(StorageError::from)?
            .map(decode_timestamp),
        order_id: row.get(3).map_err(StorageError::from)?,
        order_id_ref: row.get(4).map_err(StorageError::from)?,
        direction: direction
            .parse::<Direction>()
            .map_err(StorageError::Corrupt)?,
        status: status
            .parse::<OrderStatus>()
            .map_err(StorageError::Corrupt)?,
        price: Quotation::new(
            row.get(7).map_err(StorageError::from)?,
            row.get(8).map_err(StorageError::from)?,
        ),
        lots_requested: row.get(9).map_err(StorageError::from)?,
        lots_executed: row.get(10).map_err(StorageError::from)?,
        trader_id: row.get(11).map_err(StorageError::from)?,
        instrument_id: row.get(12).map_err(StorageError::from)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_instrument(id: i64) -> Instrument {
        Instrument {
            id,
            uid: "uid-1".into(),
            isin: "RU000A0JX0J2".into(),
            figi: "BBG004730N88".into(),
            ticker: "SBER".into(),
            class_code: "TQBR".into(),
            name: "Sberbank".into(),
            lot: 10,
            available_api: true,
            for_quals: false,
            first_candle_date: Utc.with_ymd_and_hms(2018, 3, 7, 0, 0, 0).unwrap(),
            instance_id: Uuid::new_v4(),
        }
    }

    fn stored_instrument(storage: &SqliteStorage) -> Instrument {
        let mut instrument = test_instrument(0);
        instrument.id = storage.add_instrument(&instrument).unwrap();
        instrument
    }

    fn candle(instrument_id: i64, minute: u32, close: i64) -> Candle {
        Candle {
            instrument_id,
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, 0).unwrap(),
            interval: CandleInterval::OneMinute,
            open: Quotation::from_units(close - 1),
            high: Quotation::from_units(close + 1),
            low: Quotation::from_units(close - 2),
            close: Quotation::from_units(close),
            volume: 100,
        }
    }

    fn filled_buy(trader_id: &str, instrument_id: i64, order_id: &str, price: i64) -> Order {
        Order {
            id: 0,
            created_at: Some(Utc::now()),
            completion_time: Some(Utc::now()),
            order_id: order_id.to_string(),
            order_id_ref: None,
            direction: Direction::Buy,
            status: OrderStatus::Fill,
            price: Quotation::from_units(price),
            lots_requested: 1,
            lots_executed: 1,
            trader_id: trader_id.to_string(),
            instrument_id,
        }
    }

    #[test]
    fn instrument_insert_is_idempotent() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let instrument = test_instrument(0);
        let first = storage.add_instrument(&instrument).unwrap();
        let second = storage.add_instrument(&instrument).unwrap();
        assert_eq!(first, second);

        let loaded = storage.instrument_by_uid("uid-1").unwrap();
        assert_eq!(loaded.id, first);
        assert_eq!(loaded.ticker, "SBER");
        assert!(storage.instrument_by_uid("missing").is_err());
    }

    #[test]
    fn candle_upsert_is_idempotent() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let instrument = stored_instrument(&storage);
        let batch = vec![
            candle(instrument.id, 2, 101),
            candle(instrument.id, 0, 100),
            candle(instrument.id, 1, 102),
        ];
        storage
            .add_candles(&instrument, &batch, CandleInterval::OneMinute)
            .unwrap();
        storage
            .add_candles(&instrument, &batch, CandleInterval::OneMinute)
            .unwrap();

        let from = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2024, 5, 1, 10, 5, 0).unwrap();
        let loaded = storage
            .candles(&instrument, CandleInterval::OneMinute, from, to)
            .unwrap();
        assert_eq!(loaded.len(), 3);
        assert!(loaded.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert_eq!(loaded[0].close, Quotation::from_units(100));
    }

    #[test]
    fn empty_candle_range_is_an_error() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let instrument = stored_instrument(&storage);
        let from = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let result = storage.candles(&instrument, CandleInterval::OneDay, from, from);
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[test]
    fn ranking_queries_respect_the_unmatched_filter() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let instrument = stored_instrument(&storage);
        let trader = "t1";

        storage
            .put_order(trader, &instrument, &filled_buy(trader, instrument.id, "b1", 100))
            .unwrap();
        storage
            .put_order(trader, &instrument, &filled_buy(trader, instrument.id, "b2", 95))
            .unwrap();
        storage
            .put_order(trader, &instrument, &filled_buy(trader, instrument.id, "b3", 110))
            .unwrap();

        assert_eq!(storage.unsold_buy_count(trader, &instrument).unwrap(), 3);
        let lowest = storage.lowest_filled_buy(trader, &instrument).unwrap().unwrap();
        assert_eq!(lowest.order_id, "b2");
        let highest = storage.highest_filled_buy(trader, &instrument).unwrap().unwrap();
        assert_eq!(highest.order_id, "b3");

        // A pending sell referencing b2 takes it out of the unmatched pool.
        let mut sell = filled_buy(trader, instrument.id, "s1", 120);
        sell.direction = Direction::Sell;
        sell.status = OrderStatus::New;
        sell.order_id_ref = Some("b2".into());
        storage.make_new_order(&instrument, &sell).unwrap();

        assert_eq!(storage.unsold_buy_count(trader, &instrument).unwrap(), 2);
        let lowest = storage.lowest_filled_buy(trader, &instrument).unwrap().unwrap();
        assert_eq!(lowest.order_id, "b1");

        // The matched buy carries the symmetric back-link.
        let matched = storage
            .latest_filled_sell(trader, &instrument)
            .unwrap();
        assert!(matched.is_none(), "sell is still NEW");
    }

    #[test]
    fn remove_order_restores_the_unmatched_buy() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let instrument = stored_instrument(&storage);
        let trader = "t1";

        storage
            .put_order(trader, &instrument, &filled_buy(trader, instrument.id, "b1", 100))
            .unwrap();
        let mut sell = filled_buy(trader, instrument.id, "s1", 120);
        sell.direction = Direction::Sell;
        sell.status = OrderStatus::New;
        sell.order_id_ref = Some("b1".into());
        storage.make_new_order(&instrument, &sell).unwrap();
        assert_eq!(storage.unsold_buy_count(trader, &instrument).unwrap(), 0);

        // Broker rejected the sell: compensation removes the tentative row.
        storage.remove_order(&instrument, &sell).unwrap();
        assert_eq!(storage.unsold_buy_count(trader, &instrument).unwrap(), 1);
        let lowest = storage.lowest_filled_buy(trader, &instrument).unwrap().unwrap();
        assert_eq!(lowest.order_id, "b1");
        assert_eq!(lowest.order_id_ref, None, "dangling back-link cleared");
    }

    #[test]
    fn update_order_touches_only_mutable_columns() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let instrument = stored_instrument(&storage);
        let trader = "t1";

        let mut tentative = filled_buy(trader, instrument.id, "b1", 100);
        tentative.status = OrderStatus::New;
        tentative.completion_time = None;
        tentative.order_id_ref = Some("keep-me".into());
        storage.make_new_order(&instrument, &tentative).unwrap();

        let mut update = filled_buy(trader, instrument.id, "b1", 101);
        update.status = OrderStatus::Fill;
        update.lots_executed = 1;
        update.order_id_ref = None;
        storage.update_order(trader, &instrument, &update).unwrap();

        let stored = storage.lowest_filled_buy(trader, &instrument).unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Fill);
        assert_eq!(stored.price, Quotation::from_units(101));
        assert_eq!(
            stored.order_id_ref.as_deref(),
            Some("keep-me"),
            "reference column survives broker updates"
        );
    }

    #[test]
    fn reopen_preserves_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.db");
        let instrument = {
            let storage = SqliteStorage::open(&path).unwrap();
            let instrument = stored_instrument(&storage);
            storage
                .put_order("t1", &instrument, &filled_buy("t1", instrument.id, "b1", 100))
                .unwrap();
            instrument
        };

        let storage = SqliteStorage::open(&path).unwrap();
        assert_eq!(storage.unsold_buy_count("t1", &instrument).unwrap(), 1);
    }

    #[test]
    fn latest_filled_sell_orders_by_completion_time() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let instrument = stored_instrument(&storage);
        let trader = "t1";

        for (order_id, hour) in [("s1", 10), ("s2", 14), ("s3", 12)] {
            let mut sell = filled_buy(trader, instrument.id, order_id, 100);
            sell.direction = Direction::Sell;
            sell.completion_time = Some(Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap());
            storage.put_order(trader, &instrument, &sell).unwrap();
        }

        let latest = storage.latest_filled_sell(trader, &instrument).unwrap().unwrap();
        assert_eq!(latest.order_id, "s2");
    }
}
