//! Fundamental data types shared across the entire workspace.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

mod series;
pub use series::{Dataframe, Series};

/// Alias for price precision.
pub type Price = f64;
/// Alias for quantity precision.
pub type Quantity = f64;
/// Alias used for human-readable market symbols (e.g., `BTCUSDT`).
pub type Pair = String;

/// Quote currencies recognized when splitting a pair symbol, longest first.
const QUOTE_ASSETS: &[&str] = &[
    "USDT", "BUSD", "USDC", "TUSD", "BTC", "ETH", "BNB", "EUR", "BRL", "GBP", "AUD", "DAI", "USD",
];

/// Split a pair symbol into its base asset and quote currency.
///
/// Returns `None` when the symbol does not end in a recognized quote or the
/// base part would be empty.
#[must_use]
pub fn split_asset_quote(pair: &str) -> Option<(&str, &str)> {
    for quote in QUOTE_ASSETS {
        if let Some(asset) = pair.strip_suffix(quote) {
            if !asset.is_empty() {
                return Some((asset, quote));
            }
        }
    }
    None
}

/// The side of an order or position.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Returns the opposite side (buy <-> sell).
    #[must_use]
    pub fn inverse(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "BUY" => Ok(Self::Buy),
            "SELL" => Ok(Self::Sell),
            other => Err(format!("unsupported side '{other}'")),
        }
    }
}

/// Order execution style.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Limit,
    Market,
    LimitMaker,
    StopLoss,
    StopLossLimit,
    TakeProfit,
    TakeProfitLimit,
}

impl OrderType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Limit => "LIMIT",
            Self::Market => "MARKET",
            Self::LimitMaker => "LIMIT_MAKER",
            Self::StopLoss => "STOP_LOSS",
            Self::StopLossLimit => "STOP_LOSS_LIMIT",
            Self::TakeProfit => "TAKE_PROFIT",
            Self::TakeProfitLimit => "TAKE_PROFIT_LIMIT",
        }
    }

    /// Whether the order triggers on its stop price rather than its limit price.
    #[must_use]
    pub fn is_stop(self) -> bool {
        matches!(self, Self::StopLoss | Self::StopLossLimit)
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "LIMIT" => Ok(Self::Limit),
            "MARKET" => Ok(Self::Market),
            "LIMIT_MAKER" => Ok(Self::LimitMaker),
            "STOP_LOSS" => Ok(Self::StopLoss),
            "STOP_LOSS_LIMIT" => Ok(Self::StopLossLimit),
            "TAKE_PROFIT" => Ok(Self::TakeProfit),
            "TAKE_PROFIT_LIMIT" => Ok(Self::TakeProfitLimit),
            other => Err(format!("unsupported order type '{other}'")),
        }
    }
}

/// Lifecycle state of an order; transitions only move forward.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    PendingCancel,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// Terminal statuses never transition back to an open state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Canceled | Self::Rejected | Self::Expired
        )
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::PartiallyFilled => "PARTIALLY_FILLED",
            Self::Filled => "FILLED",
            Self::Canceled => "CANCELED",
            Self::PendingCancel => "PENDING_CANCEL",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
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
            "PARTIALLY_FILLED" => Ok(Self::PartiallyFilled),
            "FILLED" => Ok(Self::Filled),
            "CANCELED" => Ok(Self::Canceled),
            "PENDING_CANCEL" => Ok(Self::PendingCancel),
            "REJECTED" => Ok(Self::Rejected),
            "EXPIRED" => Ok(Self::Expired),
            other => Err(format!("unsupported order status '{other}'")),
        }
    }
}

/// Order representation shared by the journal, the broker layer and the simulator.
///
/// `id` is the journal-assigned identity; `exchange_id` is the venue-assigned
/// identity used for reconciliation lookups.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Order {
    pub id: i64,
    pub exchange_id: i64,
    pub pair: Pair,
    pub side: Side,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub price: Price,
    pub quantity: Quantity,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Trigger price, present on stop orders and the stop leg of an OCO pair.
    #[serde(default)]
    pub stop: Option<Price>,
    /// Binds the two legs of an OCO pair.
    #[serde(default)]
    pub group_id: Option<i64>,
    /// Close price of the pair at creation time.
    #[serde(default)]
    pub ref_price: Price,
    #[serde(default)]
    pub profit_pct: f64,
    #[serde(default)]
    pub profit_value: f64,
}

impl Order {
    /// Effective execution price: the stop price for stop orders, otherwise the limit price.
    #[must_use]
    pub fn fill_price(&self) -> Price {
        if self.order_type.is_stop() {
            self.stop.unwrap_or(self.price)
        } else {
            self.price
        }
    }
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} | ID: {}, Type: {}, {} x ${} (~${:.0})",
            self.status,
            self.side,
            self.pair,
            self.id,
            self.order_type,
            self.quantity,
            self.price,
            self.quantity * self.price
        )
    }
}

/// OHLCV bar for a fixed time interval on one symbol.
///
/// `complete` marks a closed bar; otherwise the candle is a partial update of
/// the currently-forming bar. `metadata` carries additional columns from CSV
/// inputs.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Candle {
    pub pair: Pair,
    pub time: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub open: Price,
    pub close: Price,
    pub low: Price,
    pub high: Price,
    pub volume: f64,
    pub complete: bool,
    #[serde(default)]
    pub metadata: HashMap<String, f64>,
}

impl Candle {
    /// Lexicographic ordering key used by the candle priority queue.
    #[must_use]
    pub fn sort_key(&self) -> (DateTime<Utc>, DateTime<Utc>, &str) {
        (self.time, self.updated_at, self.pair.as_str())
    }

    /// Compare two candles by `(time, updated_at, pair)`.
    #[must_use]
    pub fn chronological_cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }

    /// Smooth this candle into its Heikin-Ashi form using the running state.
    #[must_use]
    pub fn to_heikin_ashi(&self, ha: &mut HeikinAshi) -> Candle {
        ha.smooth(self)
    }
}

/// Running state for Heikin-Ashi smoothing: each output bar depends on the
/// previous smoothed bar.
#[derive(Clone, Debug, Default)]
pub struct HeikinAshi {
    previous: Option<(Price, Price)>,
}

impl HeikinAshi {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn smooth(&mut self, candle: &Candle) -> Candle {
        let (prev_open, prev_close) = self.previous.unwrap_or((candle.open, candle.close));
        let open = (prev_open + prev_close) / 2.0;
        let close = (candle.open + candle.high + candle.low + candle.close) / 4.0;
        self.previous = Some((open, close));

        Candle {
            open,
            close,
            high: candle.high.max(open.max(close)),
            low: candle.low.min(open.min(close)),
            ..candle.clone()
        }
    }
}

/// Per-asset balance tracked by an account.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Balance {
    pub asset: String,
    pub free: f64,
    pub lock: f64,
    pub leverage: f64,
}

/// Snapshot of an account's balances.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Account {
    pub balances: Vec<Balance>,
}

impl Account {
    /// Look up the balances of an asset/quote pair in a single pass.
    #[must_use]
    pub fn balance(&self, asset: &str, quote: &str) -> (Balance, Balance) {
        let mut asset_balance = Balance::default();
        let mut quote_balance = Balance::default();
        for balance in &self.balances {
            if balance.asset == asset {
                asset_balance = balance.clone();
            } else if balance.asset == quote {
                quote_balance = balance.clone();
            }
        }
        (asset_balance, quote_balance)
    }

    /// Sum of free and locked amounts over every asset.
    #[must_use]
    pub fn equity(&self) -> f64 {
        self.balances.iter().map(|b| b.free + b.lock).sum()
    }
}

/// Exchange filters for one tradable pair.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AssetInfo {
    pub base_asset: String,
    pub quote_asset: String,
    pub min_price: f64,
    pub max_price: f64,
    pub min_quantity: f64,
    pub max_quantity: f64,
    pub step_size: f64,
    pub tick_size: f64,
    pub quote_precision: u32,
    pub base_asset_precision: u32,
}

/// Truncate a quantity down to the nearest multiple of the exchange lot step.
#[must_use]
pub fn round_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    (value / step).floor() * step
}

/// Interval granularity of a candle series.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Hash, Serialize)]
pub enum TimeFrame {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "10m")]
    TenMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "30m")]
    ThirtyMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "2h")]
    TwoHours,
    #[serde(rename = "4h")]
    FourHours,
    #[serde(rename = "12h")]
    TwelveHours,
    #[serde(rename = "1d")]
    OneDay,
    #[serde(rename = "1w")]
    OneWeek,
}

impl TimeFrame {
    /// Convert the timeframe into a chrono `Duration`.
    #[must_use]
    pub fn duration(self) -> Duration {
        match self {
            Self::OneMinute => Duration::minutes(1),
            Self::FiveMinutes => Duration::minutes(5),
            Self::TenMinutes => Duration::minutes(10),
            Self::FifteenMinutes => Duration::minutes(15),
            Self::ThirtyMinutes => Duration::minutes(30),
            Self::OneHour => Duration::hours(1),
            Self::TwoHours => Duration::hours(2),
            Self::FourHours => Duration::hours(4),
            Self::TwelveHours => Duration::hours(12),
            Self::OneDay => Duration::days(1),
            Self::OneWeek => Duration::weeks(1),
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OneMinute => "1m",
            Self::FiveMinutes => "5m",
            Self::TenMinutes => "10m",
            Self::FifteenMinutes => "15m",
            Self::ThirtyMinutes => "30m",
            Self::OneHour => "1h",
            Self::TwoHours => "2h",
            Self::FourHours => "4h",
            Self::TwelveHours => "12h",
            Self::OneDay => "1d",
            Self::OneWeek => "1w",
        }
    }

    /// Whether a source bar at `time` is the final sub-bar of its enclosing
    /// period at this (target) timeframe. Boundaries are wall-clock aligned
    /// in UTC; weeks close at midnight Sunday.
    #[must_use]
    pub fn closes_at(self, time: DateTime<Utc>, source: TimeFrame) -> bool {
        if self == source {
            return true;
        }
        let next = time + source.duration();
        match self {
            Self::OneMinute => next.second() == 0,
            Self::FiveMinutes => next.minute() % 5 == 0,
            Self::TenMinutes => next.minute() % 10 == 0,
            Self::FifteenMinutes => next.minute() % 15 == 0,
            Self::ThirtyMinutes => next.minute() % 30 == 0,
            Self::OneHour => next.minute() == 0,
            Self::TwoHours => next.minute() == 0 && next.hour() % 2 == 0,
            Self::FourHours => next.minute() == 0 && next.hour() % 4 == 0,
            Self::TwelveHours => next.minute() == 0 && next.hour() % 12 == 0,
            Self::OneDay => next.minute() == 0 && next.hour() == 0,
            Self::OneWeek => {
                next.minute() == 0 && next.hour() == 0 && next.weekday() == Weekday::Sun
            }
        }
    }

    /// Whether a source bar at `time` opens a new period at this timeframe,
    /// i.e. the previous source bar closed the preceding period.
    #[must_use]
    pub fn opens_at(self, time: DateTime<Utc>, source: TimeFrame) -> bool {
        self.closes_at(time - source.duration(), source)
    }
}

impl fmt::Display for TimeFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeFrame {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "1m" => Ok(Self::OneMinute),
            "5m" => Ok(Self::FiveMinutes),
            "10m" => Ok(Self::TenMinutes),
            "15m" => Ok(Self::FifteenMinutes),
            "30m" => Ok(Self::ThirtyMinutes),
            "1h" | "60m" => Ok(Self::OneHour),
            "2h" => Ok(Self::TwoHours),
            "4h" => Ok(Self::FourHours),
            "12h" => Ok(Self::TwelveHours),
            "1d" => Ok(Self::OneDay),
            "1w" => Ok(Self::OneWeek),
            other => Err(format!("invalid timeframe: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candle(pair: &str, ts: i64, updated: i64) -> Candle {
        Candle {
            pair: pair.into(),
            time: Utc.timestamp_opt(ts, 0).unwrap(),
            updated_at: Utc.timestamp_opt(updated, 0).unwrap(),
            complete: true,
            ..Candle::default()
        }
    }

    #[test]
    fn split_known_quotes() {
        assert_eq!(split_asset_quote("BTCUSDT"), Some(("BTC", "USDT")));
        assert_eq!(split_asset_quote("ETHBTC"), Some(("ETH", "BTC")));
        assert_eq!(split_asset_quote("USDT"), None);
        assert_eq!(split_asset_quote("FOOBAR"), None);
    }

    #[test]
    fn candle_chronological_order() {
        let a = candle("BTCUSDT", 100, 100);
        let b = candle("BTCUSDT", 200, 200);
        let c = candle("ETHUSDT", 100, 100);
        assert_eq!(a.chronological_cmp(&b), Ordering::Less);
        assert_eq!(b.chronological_cmp(&a), Ordering::Greater);
        // Same time: tie broken by pair.
        assert_eq!(a.chronological_cmp(&c), Ordering::Less);

        let mut later_update = candle("BTCUSDT", 100, 150);
        later_update.complete = false;
        assert_eq!(a.chronological_cmp(&later_update), Ordering::Less);
    }

    #[test]
    fn terminal_statuses() {
        for status in [
            OrderStatus::Filled,
            OrderStatus::Canceled,
            OrderStatus::Rejected,
            OrderStatus::Expired,
        ] {
            assert!(status.is_terminal());
        }
        for status in [
            OrderStatus::New,
            OrderStatus::PartiallyFilled,
            OrderStatus::PendingCancel,
        ] {
            assert!(!status.is_terminal());
        }
    }

    #[test]
    fn order_serde_round_trip() {
        let order = Order {
            id: 1,
            exchange_id: 42,
            pair: "BTCUSDT".into(),
            side: Side::Sell,
            order_type: OrderType::StopLossLimit,
            status: OrderStatus::New,
            price: 95.0,
            quantity: 10.0,
            created_at: Utc.timestamp_opt(1_600_000_000, 0).unwrap(),
            updated_at: Utc.timestamp_opt(1_600_000_000, 0).unwrap(),
            stop: Some(95.0),
            group_id: Some(7),
            ref_price: 100.0,
            profit_pct: 0.0,
            profit_value: 0.0,
        };
        let encoded = serde_json::to_string(&order).unwrap();
        assert!(encoded.contains("\"STOP_LOSS_LIMIT\""));
        let decoded: Order = serde_json::from_str(&encoded).unwrap();
        assert_eq!(order, decoded);
    }

    #[test]
    fn account_balance_lookup_and_equity() {
        let account = Account {
            balances: vec![
                Balance {
                    asset: "BTC".into(),
                    free: 1.0,
                    lock: 0.5,
                    leverage: 0.0,
                },
                Balance {
                    asset: "USDT".into(),
                    free: 100.0,
                    lock: 0.0,
                    leverage: 0.0,
                },
            ],
        };
        let (asset, quote) = account.balance("BTC", "USDT");
        assert_eq!(asset.free, 1.0);
        assert_eq!(quote.free, 100.0);
        assert_eq!(account.equity(), 101.5);
    }

    #[test]
    fn round_to_step_truncates() {
        assert!((round_to_step(0.123_456_789, 0.001) - 0.123).abs() < 1e-12);
        assert_eq!(round_to_step(5.0, 0.0), 5.0);
        assert_eq!(round_to_step(7.9, 0.5), 7.5);
    }

    #[test]
    fn timeframe_boundaries() {
        let tf: TimeFrame = "4h".parse().unwrap();
        assert_eq!(tf, TimeFrame::FourHours);
        let t = Utc.with_ymd_and_hms(2022, 3, 1, 3, 0, 0).unwrap();
        // 1h bar at 03:00 closes the 00:00-04:00 period.
        assert!(tf.closes_at(t, TimeFrame::OneHour));
        assert!(!tf.closes_at(
            Utc.with_ymd_and_hms(2022, 3, 1, 2, 0, 0).unwrap(),
            TimeFrame::OneHour
        ));
        // 1h bar at 00:00 opens a 4h period.
        assert!(tf.opens_at(
            Utc.with_ymd_and_hms(2022, 3, 1, 0, 0, 0).unwrap(),
            TimeFrame::OneHour
        ));

        let week = TimeFrame::OneWeek;
        // 2022-03-05 is a Saturday; the daily bar there closes the week.
        assert!(week.closes_at(
            Utc.with_ymd_and_hms(2022, 3, 5, 0, 0, 0).unwrap(),
            TimeFrame::OneDay
        ));
    }

    #[test]
    fn heikin_ashi_smoothing() {
        let mut ha = HeikinAshi::new();
        let first = Candle {
            open: 10.0,
            high: 12.0,
            low: 9.0,
            close: 11.0,
            ..Candle::default()
        };
        let smoothed = first.to_heikin_ashi(&mut ha);
        assert_eq!(smoothed.open, 10.5);
        assert_eq!(smoothed.close, (10.0 + 12.0 + 9.0 + 11.0) / 4.0);
        assert!(smoothed.high >= smoothed.open.max(smoothed.close));
        assert!(smoothed.low <= smoothed.open.min(smoothed.close));
    }
}
