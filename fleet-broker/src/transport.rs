//! Seam between the broker and the upstream exchange RPC library.
//!
//! The actual wire client (connection management, retries, authentication)
//! lives outside this workspace; concrete adapters register themselves here
//! under a driver name and binaries resolve them from configuration.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use tokio::sync::mpsc;

use crate::BrokerResult;
use fleet_core::{
    Candle, CandleInterval, Direction, Instrument, LastPrice, OrderUpdate, PostOrderResult,
    TradingAvailability,
};

/// Parameters of a synchronous order placement.
#[derive(Clone, Debug)]
pub struct PostOrderRequest {
    pub instrument_uid: String,
    pub lots: i64,
    pub direction: Direction,
    pub account_id: String,
    /// Client-chosen idempotency key. The transport must not place a second
    /// order for a retransmission carrying the same key.
    pub request_id: String,
}

/// Handle to one upstream streaming subscription (last-price or order-state).
///
/// Messages flow through the receiver returned when the stream is opened;
/// this trait only manages the subscription set and the connection lifecycle.
#[async_trait]
pub trait UpstreamStream: Send + Sync {
    /// Add instruments to the upstream subscription.
    async fn subscribe(&self, uids: &[String]) -> BrokerResult<()>;

    /// Remove instruments from the upstream subscription.
    async fn unsubscribe(&self, uids: &[String]) -> BrokerResult<()>;

    /// Drive the stream, blocking until it ends or fails.
    async fn listen(&self) -> BrokerResult<()>;

    /// Tear the stream down; `listen` returns shortly after.
    fn stop(&self);
}

/// Client of the upstream exchange API.
#[async_trait]
pub trait MarketDataTransport: Send + Sync {
    /// Resolve an instrument by uid, figi, ticker or isin.
    async fn find_instrument(&self, identifier: &str) -> BrokerResult<Instrument>;

    /// Current trading status of the instrument.
    async fn trading_status(&self, uid: &str) -> BrokerResult<TradingAvailability>;

    /// Fetch a page of historical candles.
    async fn historic_candles(
        &self,
        uid: &str,
        interval: CandleInterval,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> BrokerResult<Vec<Candle>>;

    /// Place an order synchronously.
    async fn post_order(&self, request: PostOrderRequest) -> BrokerResult<PostOrderResult>;

    /// Open the process-wide last-price stream.
    async fn open_last_price_stream(
        &self,
    ) -> BrokerResult<(Arc<dyn UpstreamStream>, mpsc::Receiver<LastPrice>)>;

    /// Open the process-wide order-state stream.
    async fn open_order_state_stream(
        &self,
    ) -> BrokerResult<(Arc<dyn UpstreamStream>, mpsc::Receiver<OrderUpdate>)>;
}

/// Connection parameters handed to a transport factory.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub app_name: String,
    pub address: String,
    pub token: String,
    pub account_id: String,
}

/// Builds a concrete transport from configuration.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Driver name used in configuration to select this transport.
    fn driver(&self) -> &'static str;

    /// Connect and return a ready transport.
    async fn connect(&self, config: &TransportConfig)
        -> BrokerResult<Arc<dyn MarketDataTransport>>;
}

static TRANSPORT_REGISTRY: Lazy<RwLock<HashMap<String, Arc<dyn TransportFactory>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Register a transport factory under its driver name.
pub fn register_transport_factory(factory: Arc<dyn TransportFactory>) {
    let mut registry = TRANSPORT_REGISTRY.write().expect("transport registry poisoned");
    let driver = factory.driver().to_ascii_lowercase();
    if registry.insert(driver.clone(), factory).is_some() {
        tracing::warn!(driver, "duplicate transport registration; overriding previous factory");
    }
}

/// Look a factory up by driver name.
#[must_use]
pub fn get_transport_factory(driver: &str) -> Option<Arc<dyn TransportFactory>> {
    let registry = TRANSPORT_REGISTRY.read().expect("transport registry poisoned");
    registry.get(&driver.to_ascii_lowercase()).cloned()
}

/// Sorted list of registered driver names.
#[must_use]
pub fn registered_drivers() -> Vec<String> {
    let registry = TRANSPORT_REGISTRY.read().expect("transport registry poisoned");
    let mut drivers: Vec<String> = registry.keys().cloned().collect();
    drivers.sort_unstable();
    drivers
}
