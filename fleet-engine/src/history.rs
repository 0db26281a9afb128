//! Optional write-only export of trading events.
//!
//! The trader writes per-tick price samples and per-order events through
//! this seam. Writes are best-effort: a sink failure produces a log line and
//! never aborts trading.

use thiserror::Error;

/// Topics accepted by a history sink.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HistoryTopic {
    PriceHistory,
    OrdersHistory,
    Logs,
}

impl HistoryTopic {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PriceHistory => "price_history",
            Self::OrdersHistory => "orders_history",
            Self::Logs => "logs",
        }
    }
}

#[derive(Debug, Error)]
#[error("history sink failure: {0}")]
pub struct HistoryError(pub String);

/// Write-only stream of key-value records.
pub trait HistorySink: Send + Sync {
    fn write(&self, topic: HistoryTopic, fields: &[(&str, String)]) -> Result<(), HistoryError>;
}

/// Sink used when no history export is configured.
pub struct NoopHistory;

impl HistorySink for NoopHistory {
    fn write(&self, _topic: HistoryTopic, _fields: &[(&str, String)]) -> Result<(), HistoryError> {
        Ok(())
    }
}
