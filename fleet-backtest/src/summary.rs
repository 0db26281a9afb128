//! Per-run report printed after a back-test finishes.

use std::fmt;

use crate::{BacktestBroker, BacktestStorage};

/// Final account figures of one back-test run.
pub struct BacktestSummary {
    pub trader_id: String,
    pub account: f64,
    pub min_account: f64,
    pub max_account: f64,
    pub in_instruments: f64,
    pub rate: f64,
    pub total: f64,
    pub total_rate: f64,
}

/// Collect the summary from the broker's account and the unsold ledger rows.
#[must_use]
pub fn summarize(
    trader_id: &str,
    start_deposit: f64,
    broker: &BacktestBroker,
    storage: &BacktestStorage,
) -> BacktestSummary {
    let account = broker.account();
    let in_instruments = storage.in_instruments_value();
    let total = account + in_instruments;
    BacktestSummary {
        trader_id: trader_id.to_string(),
        account,
        min_account: broker.min_account(),
        max_account: broker.max_account(),
        in_instruments,
        rate: account / start_deposit * 100.0,
        total,
        total_rate: total / start_deposit * 100.0,
    }
}

impl fmt::Display for BacktestSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Result for {}. account: {:.2}; max: {:.2}; min: {:.2}; in instr: {:.2}; \
             rate: {:.2}; total: {:.2}; total rate: {:.2}",
            self.trader_id,
            self.account,
            self.max_account,
            self.min_account,
            self.in_instruments,
            self.rate,
            self.total,
            self.total_rate,
        )
    }
}
