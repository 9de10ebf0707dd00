//! Exchange-agnostic traits used by the rest of the framework.
//!
//! A venue is split into two capabilities: [`Feeder`] serves market data and
//! [`Broker`] routes orders. Live adapters, the CSV feed and the paper wallet
//! all speak these traits; [`Exchange`] is the combination required by the
//! bot orchestrator.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;

use vela_core::{Account, AssetInfo, Candle, Order, Price, Quantity, Side, TimeFrame};

/// Convenience alias for broker results.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Common error type returned by broker and feeder implementations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The pair symbol cannot be split into a known asset/quote combination.
    #[error("invalid pair: {0}")]
    InvalidPair(String),
    /// An asset symbol is unknown to the venue.
    #[error("invalid asset: {0}")]
    InvalidAsset(String),
    /// Zero or otherwise nonsensical order quantity.
    #[error("invalid quantity")]
    InvalidQuantity,
    /// Not enough free funds to create the order.
    #[error("insufficient funds or locked: {quantity} {pair}")]
    InsufficientFunds { pair: String, quantity: Quantity },
    /// No order with the given exchange identifier exists.
    #[error("order {0} not found")]
    OrderNotFound(i64),
    /// The market data source cannot serve the request.
    #[error("feed unavailable: {0}")]
    FeedUnavailable(String),
    /// Fewer candles are cached than the warm-up requires.
    #[error("insufficient data: {0}")]
    InsufficientData(String),
    /// The surrounding operation was cancelled before completion.
    #[error("operation cancelled")]
    Cancelled,
    /// Venue responded with a business error.
    #[error("exchange error: {0}")]
    Exchange(String),
    /// Persistence-layer failure surfaced through the broker facade.
    #[error("storage error: {0}")]
    Storage(String),
}

/// Streaming handle returned by [`Feeder::candles_subscription`].
///
/// Candles may arrive as partial updates (same `time`, `complete = false`)
/// followed by a final update with `complete = true`. The channel closing
/// signals the end of the stream.
pub struct CandleSubscription {
    pub candles: mpsc::Receiver<Candle>,
    pub errors: mpsc::Receiver<BrokerError>,
}

/// Market data capabilities of a venue.
#[async_trait]
pub trait Feeder: Send + Sync {
    /// Exchange filters for the pair (lot step, precisions, bounds).
    fn assets_info(&self, pair: &str) -> AssetInfo;

    /// Latest traded price for the pair.
    async fn last_quote(&self, pair: &str) -> BrokerResult<Price>;

    /// Historical candles covering `[start, end]`.
    async fn candles_by_period(
        &self,
        pair: &str,
        timeframe: TimeFrame,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> BrokerResult<Vec<Candle>>;

    /// The next `limit` historical candles, consumed from the cached window.
    async fn candles_by_limit(
        &self,
        pair: &str,
        timeframe: TimeFrame,
        limit: usize,
    ) -> BrokerResult<Vec<Candle>>;

    /// Subscribe to the live candle stream for `(pair, timeframe)`.
    async fn candles_subscription(
        &self,
        pair: &str,
        timeframe: TimeFrame,
    ) -> BrokerResult<CandleSubscription>;
}

/// Order routing capabilities of a venue.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Current balances.
    async fn account(&self) -> BrokerResult<Account>;

    /// Net `(asset, quote)` position for a pair, locks included.
    async fn position(&self, pair: &str) -> BrokerResult<(Quantity, Quantity)>;

    /// Look up an order by its exchange identifier.
    async fn order(&self, pair: &str, exchange_id: i64) -> BrokerResult<Order>;

    /// Place an OCO pair: a limit-maker leg and a stop leg sharing a group.
    async fn create_order_oco(
        &self,
        side: Side,
        pair: &str,
        size: Quantity,
        price: Price,
        stop: Price,
        stop_limit: Price,
    ) -> BrokerResult<Vec<Order>>;

    async fn create_order_limit(
        &self,
        side: Side,
        pair: &str,
        size: Quantity,
        limit: Price,
    ) -> BrokerResult<Order>;

    async fn create_order_market(
        &self,
        side: Side,
        pair: &str,
        size: Quantity,
    ) -> BrokerResult<Order>;

    /// Market order sized in the quote currency at the latest close.
    async fn create_order_market_quote(
        &self,
        side: Side,
        pair: &str,
        quote: Quantity,
    ) -> BrokerResult<Order>;

    /// Sell-side stop-loss-limit order at the given trigger price.
    async fn create_order_stop(
        &self,
        pair: &str,
        quantity: Quantity,
        limit: Price,
    ) -> BrokerResult<Order>;

    async fn cancel(&self, order: &Order) -> BrokerResult<()>;
}

/// Full venue contract: market data plus order routing.
pub trait Exchange: Broker + Feeder {}

impl<T: Broker + Feeder> Exchange for T {}
