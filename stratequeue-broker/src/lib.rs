//! Adapter traits the runtime consumes for broker and market-data access.
//!
//! Implementations register themselves with the factory registries at startup
//! and are resolved by name at deploy time; the core never loads code
//! dynamically.

use std::any::Any;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stratequeue_core::{
    Bar, BrokerCapabilities, BrokerOrderId, Granularity, OrderState, OrderType, Position, Price,
    Quantity, Side, Symbol, TimeInForce,
};
use thiserror::Error;

mod registry;

pub use registry::{
    broker_factory, data_provider_factory, register_broker_factory, register_data_provider_factory,
    registered_brokers, registered_data_providers, BrokerFactory, DataProviderFactory,
};

/// Convenience alias for broker results.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Common error type returned by broker implementations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Transport-level failures (network, timeouts, 5xx responses).
    #[error("transport error: {0}")]
    Transport(String),
    /// Authentication failed or credentials are missing.
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// The request parameters are invalid for the target broker.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The broker rejected the order for a business reason.
    #[error("order rejected: {0}")]
    Rejected(String),
    /// Serialization or parsing failure on the wire.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// A catch-all branch for other issues.
    #[error("unexpected error: {0}")]
    Other(String),
}

impl BrokerError {
    /// Whether a retry with backoff is worthwhile.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Desired order placement parameters handed to a broker adapter.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Quantity,
    pub limit_price: Option<Price>,
    pub stop_price: Option<Price>,
    pub time_in_force: Option<TimeInForce>,
    pub client_order_id: Option<String>,
}

/// Acknowledgement returned by the broker on submission.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OrderAck {
    pub broker_order_id: BrokerOrderId,
    pub state: OrderState,
}

/// A fill as reported by the broker, before local attribution.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BrokerFill {
    pub broker_order_id: BrokerOrderId,
    /// Sequence number within the order; combined with the broker order id
    /// this identifies the fill exactly once.
    pub sequence: u64,
    pub qty: Quantity,
    pub price: Price,
    pub fee: Price,
    pub ts: DateTime<Utc>,
}

/// Point-in-time view of an order as the broker knows it.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BrokerOrderStatus {
    pub broker_order_id: BrokerOrderId,
    pub state: OrderState,
    pub fills: Vec<BrokerFill>,
}

/// Asynchronous update pushed by the broker between explicit calls.
#[derive(Clone, Debug)]
pub enum BrokerEvent {
    Fill(BrokerFill),
    OrderUpdate {
        broker_order_id: BrokerOrderId,
        state: OrderState,
        reason: Option<String>,
    },
}

/// Execution interface the order gateway talks to. One instance per broker
/// endpoint; paper/live is a property of the instance configuration, not of
/// the call sites.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    /// Human-friendly connector name used in logs.
    fn name(&self) -> &str;

    /// Static trading constraints for this broker instance.
    fn capabilities(&self) -> BrokerCapabilities;

    /// Current account equity in the reporting currency.
    async fn account_equity(&self) -> BrokerResult<Price>;

    /// Place a new order.
    async fn place_order(&self, request: OrderRequest) -> BrokerResult<OrderAck>;

    /// Cancel an existing order by broker identifier.
    async fn cancel_order(&self, broker_order_id: &BrokerOrderId, symbol: &str)
        -> BrokerResult<()>;

    /// Fetch the broker's authoritative view of one order.
    async fn order_status(&self, broker_order_id: &BrokerOrderId)
        -> BrokerResult<BrokerOrderStatus>;

    /// Look up an order by the client identifier supplied at submission.
    /// Used to adopt orders whose submission acknowledgement timed out.
    async fn order_by_client_id(
        &self,
        _client_order_id: &str,
    ) -> BrokerResult<Option<BrokerOrderStatus>> {
        Ok(None)
    }

    /// All orders the broker still considers open.
    async fn open_orders(&self) -> BrokerResult<Vec<BrokerOrderStatus>>;

    /// Current open positions at the broker.
    async fn positions(&self) -> BrokerResult<Vec<Position>>;

    /// Await the next pushed event, `None` when the broker has nothing
    /// buffered. Pull-only brokers may always return `None`; the gateway's
    /// polling backstop covers them.
    async fn next_event(&self) -> BrokerResult<Option<BrokerEvent>>;

    /// Observe market data the runtime is processing. Real brokers ignore
    /// this; simulated endpoints use it to price and trigger fills.
    fn on_market_data(&self, _bar: &Bar) {}

    /// Helper for downcasting to a concrete type in tests.
    fn as_any(&self) -> &dyn Any;
}

/// Result alias for data-provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Error type surfaced by data-provider implementations.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Network-level failure; the data manager retries with backoff.
    #[error("transport error: {0}")]
    Transport(String),
    /// The provider does not serve this symbol. Fatal per subscription.
    #[error("symbol rejected by provider: {0}")]
    RejectedSymbol(Symbol),
    /// The provider does not serve this granularity.
    #[error("granularity {0} not supported")]
    UnsupportedGranularity(Granularity),
    /// A catch-all branch for other issues.
    #[error("unexpected error: {0}")]
    Other(String),
}

impl ProviderError {
    /// Whether a reconnect with backoff is worthwhile.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Live feed of bars for one `(symbol, granularity)` subscription.
#[async_trait]
pub trait BarFeed: Send {
    /// Await the next bar. `Ok(None)` signals an orderly end of stream.
    async fn next_bar(&mut self) -> ProviderResult<Option<Bar>>;
}

/// Market-data interface the data manager owns. One instance per provider;
/// subscriptions across strategies are de-duplicated above this trait.
#[async_trait]
pub trait DataProviderAdapter: Send + Sync {
    /// Human-friendly provider name used in logs.
    fn name(&self) -> &str;

    /// Fetch up to `lookback` most recent bars, oldest first. Providers with
    /// a shorter retention window return what they have.
    async fn fetch_history(
        &self,
        symbol: &str,
        granularity: Granularity,
        lookback: usize,
    ) -> ProviderResult<Vec<Bar>>;

    /// Open a realtime feed for the symbol.
    async fn subscribe(
        &self,
        symbol: &str,
        granularity: Granularity,
    ) -> ProviderResult<Box<dyn BarFeed>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_transient() {
        assert!(BrokerError::Transport("timeout".into()).is_transient());
        assert!(!BrokerError::Rejected("insufficient margin".into()).is_transient());
        assert!(ProviderError::Transport("reset".into()).is_transient());
        assert!(!ProviderError::RejectedSymbol("NOPE".into()).is_transient());
    }
}
