//! Exchange-agnostic broker contract consumed by traders and strategies.

use async_trait::async_trait;
use thiserror::Error;

use fleet_core::{
    Instrument, LastPrice, OrderUpdate, PostOrderResult, ShutdownSignal, TradingAvailability,
};

mod mux;
pub mod transport;

pub use mux::LiveBroker;
pub use transport::{
    get_transport_factory, register_transport_factory, registered_drivers, MarketDataTransport,
    PostOrderRequest, TransportConfig, TransportFactory, UpstreamStream,
};

/// Convenience alias for broker results.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Common error type returned by broker implementations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Transport-level failures (network, timeouts, stream errors).
    #[error("transport error: {0}")]
    Transport(String),
    /// The requested entity does not exist upstream.
    #[error("not found: {0}")]
    NotFound(String),
    /// The request parameters are invalid for the upstream exchange.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Exchange responded with a business error (e.g., order rejected).
    #[error("exchange error: {0}")]
    Exchange(String),
    /// A receive was attempted on a subscription that is not registered.
    #[error("recipient not registered: {0}")]
    NotRegistered(String),
    /// The upstream stream closed the subscriber's channel.
    #[error("stream closed: {0}")]
    StreamClosed(String),
    /// The surrounding shutdown signal fired while blocked.
    #[error("cancelled: {0}")]
    Cancelled(String),
    /// A catch-all branch for other issues.
    #[error("unexpected error: {0}")]
    Other(String),
}

/// Operations the trader control loop and the fleet manager consume.
///
/// Order requests carry a client-chosen idempotency key (`request_id`);
/// retransmissions with the same key must not place a second order. That
/// guarantee is owned by the upstream transport.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Resolve an instrument by uid, figi, ticker or isin.
    async fn find_instrument(&self, identifier: &str) -> BrokerResult<Instrument>;

    /// Whether the instrument can be traded right now.
    async fn trading_availability(
        &self,
        instrument: &Instrument,
    ) -> BrokerResult<TradingAvailability>;

    /// Allocate a last-price subscription for this instrument instance.
    async fn register_last_price_recipient(&self, instrument: &Instrument) -> BrokerResult<()>;

    /// Release the last-price subscription for this instrument instance.
    async fn unregister_last_price_recipient(&self, instrument: &Instrument) -> BrokerResult<()>;

    /// Allocate an order-state subscription for this instrument instance.
    async fn register_order_state_recipient(
        &self,
        instrument: &Instrument,
        account_id: &str,
    ) -> BrokerResult<()>;

    /// Release the order-state subscription for this instrument instance.
    async fn unregister_order_state_recipient(
        &self,
        instrument: &Instrument,
        account_id: &str,
    ) -> BrokerResult<()>;

    /// Block until the next last-price update for this instance arrives.
    async fn receive_last_price(
        &self,
        shutdown: &ShutdownSignal,
        instrument: &Instrument,
    ) -> BrokerResult<LastPrice>;

    /// Block until the next order-state update for this instance arrives.
    async fn receive_orders_update(
        &self,
        shutdown: &ShutdownSignal,
        instrument: &Instrument,
        account_id: &str,
    ) -> BrokerResult<OrderUpdate>;

    /// Place a market buy order for `lots` lots.
    async fn make_buy_order(
        &self,
        instrument: &Instrument,
        lots: i64,
        request_id: &str,
        account_id: &str,
    ) -> BrokerResult<PostOrderResult>;

    /// Place a market sell order for `lots` lots.
    async fn make_sell_order(
        &self,
        instrument: &Instrument,
        lots: i64,
        request_id: &str,
        account_id: &str,
    ) -> BrokerResult<PostOrderResult>;
}
