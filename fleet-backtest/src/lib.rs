//! Deterministic in-memory replacements for the live broker and storage.
//!
//! The broker replays a pre-loaded candle series: every `receive_last_price`
//! advances one candle and returns its close. Orders fill instantly at the
//! last replayed price on a virtual clock that advances one second per
//! order, so completion-time ordering stays strict.

mod broker;
mod storage;
mod summary;

pub use broker::BacktestBroker;
pub use storage::BacktestStorage;
pub use summary::{summarize, BacktestSummary};
