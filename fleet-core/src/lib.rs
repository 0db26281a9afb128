//! Fundamental data types shared across the entire workspace.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod quotation;
mod shutdown;

pub use quotation::Quotation;
pub use shutdown::ShutdownSignal;

/// Candle aggregation granularity.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum CandleInterval {
    OneMinute,
    TwoMinutes,
    ThreeMinutes,
    FiveMinutes,
    TenMinutes,
    FifteenMinutes,
    ThirtyMinutes,
    OneHour,
    TwoHours,
    FourHours,
    OneDay,
    OneWeek,
    OneMonth,
}

impl CandleInterval {
    /// Canonical string used in storage and configuration. Round-trips
    /// through [`FromStr`] exactly.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OneMinute => "1min",
            Self::TwoMinutes => "2min",
            Self::ThreeMinutes => "3min",
            Self::FiveMinutes => "5min",
            Self::TenMinutes => "10min",
            Self::FifteenMinutes => "15min",
            Self::ThirtyMinutes => "30min",
            Self::OneHour => "1hour",
            Self::TwoHours => "2hour",
            Self::FourHours => "4hour",
            Self::OneDay => "1day",
            Self::OneWeek => "1week",
            Self::OneMonth => "1month",
        }
    }
}

impl fmt::Display for CandleInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CandleInterval {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "1min" | "1m" => Ok(Self::OneMinute),
            "2min" | "2m" => Ok(Self::TwoMinutes),
            "3min" | "3m" => Ok(Self::ThreeMinutes),
            "5min" | "5m" => Ok(Self::FiveMinutes),
            "10min" | "10m" => Ok(Self::TenMinutes),
            "15min" | "15m" => Ok(Self::FifteenMinutes),
            "30min" | "30m" => Ok(Self::ThirtyMinutes),
            "1hour" | "1h" => Ok(Self::OneHour),
            "2hour" | "2h" => Ok(Self::TwoHours),
            "4hour" | "4h" => Ok(Self::FourHours),
            "1day" | "1d" => Ok(Self::OneDay),
            "1week" | "1w" => Ok(Self::OneWeek),
            "1month" | "1mo" => Ok(Self::OneMonth),
            other => Err(format!("unsupported candle interval '{other}'")),
        }
    }
}

/// Immutable metadata describing a tradable instrument.
///
/// `instance_id` is a per-process subscription token identifying one
/// subscriber among many for the same instrument; it is never persisted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Instrument {
    pub id: i64,
    pub uid: String,
    pub isin: String,
    pub figi: String,
    pub ticker: String,
    pub class_code: String,
    pub name: String,
    pub lot: i32,
    pub available_api: bool,
    pub for_quals: bool,
    pub first_candle_date: DateTime<Utc>,
    #[serde(skip)]
    pub instance_id: Uuid,
}

impl Instrument {
    /// Copy of this instrument carrying a fresh subscription token.
    #[must_use]
    pub fn with_new_instance(&self) -> Self {
        let mut copy = self.clone();
        copy.instance_id = Uuid::new_v4();
        copy
    }
}

/// Aggregated OHLCV bar, immutable once stored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub instrument_id: i64,
    pub timestamp: DateTime<Utc>,
    pub interval: CandleInterval,
    pub open: Quotation,
    pub high: Quotation,
    pub low: Quotation,
    pub close: Quotation,
    pub volume: i64,
}

/// Most recent trade price emitted by the market-data stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LastPrice {
    pub uid: String,
    pub figi: String,
    pub price: Quotation,
    pub time: DateTime<Utc>,
}

/// The side of an order.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "BUY" => Ok(Self::Buy),
            "SELL" => Ok(Self::Sell),
            other => Err(format!("unknown direction '{other}'")),
        }
    }
}

/// Execution report status of a ledger order. Partial fills stay distinct
/// from full fills.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    Fill,
    PartiallyFill,
    Cancelled,
}

impl OrderStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Fill => "FILL",
            Self::PartiallyFill => "PARTIALLY_FILL",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "NEW" => Ok(Self::New),
            "FILL" => Ok(Self::Fill),
            "PARTIALLY_FILL" => Ok(Self::PartiallyFill),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(format!("unknown order status '{other}'")),
        }
    }
}

/// One row of the persistent order ledger.
///
/// `order_id` is the client-chosen idempotency key; `order_id_ref` is the
/// nullable back-pointer linking a SELL to the BUY it closes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
    pub order_id: String,
    pub order_id_ref: Option<String>,
    pub direction: Direction,
    pub status: OrderStatus,
    pub price: Quotation,
    pub lots_requested: i64,
    pub lots_executed: i64,
    pub trader_id: String,
    pub instrument_id: i64,
}

/// Message carried by the order-state stream. The account and instrument
/// identifiers route the update; the remaining fields update the ledger row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub account_id: String,
    pub instrument_uid: String,
    pub order_id: String,
    pub created_at: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
    pub direction: Direction,
    pub status: OrderStatus,
    pub price: Quotation,
    pub lots_requested: i64,
    pub lots_executed: i64,
}

/// Whether an instrument can currently be traded.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum TradingAvailability {
    Available,
    NotAvailableViaApi,
    NotAvailableNow,
    Undefined,
}

/// Result of a synchronous order placement.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PostOrderResult {
    pub order_id: String,
    pub instrument_uid: String,
    pub executed_price: Quotation,
    pub executed_commission: Quotation,
    pub lots_executed: i64,
    pub status: String,
}
