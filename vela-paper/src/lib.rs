//! Simulated exchange: a paper wallet with deterministic bar-driven matching.
//!
//! The wallet keeps per-asset free/locked balances, long/short average prices,
//! OCO groups and equity time series, and fills resting orders against each
//! incoming candle. It implements both [`Broker`] and [`Feeder`], delegating
//! market data to the wrapped feeder, so the bot can run against it exactly
//! as it would against a live venue.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use vela_broker::{
    Broker, BrokerError, BrokerResult, CandleSubscription, Feeder,
};
use vela_core::{
    round_to_step, split_asset_quote, Account, AssetInfo, Balance, Candle, Order, OrderStatus,
    OrderType, Price, Quantity, Side, TimeFrame,
};

/// One point of an equity or per-asset value curve.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AssetValue {
    pub time: DateTime<Utc>,
    pub value: f64,
}

/// Peak-to-trough window over the equity curve.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Drawdown {
    /// Fractional decline relative to the window start (negative).
    pub value: f64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Default)]
struct AssetState {
    free: f64,
    lock: f64,
}

/// Funds moved out of `free` when a resting order was accepted; keyed by the
/// order's exchange id, or by group id for OCO pairs sharing one reserve.
#[derive(Clone, Copy, Debug, Default)]
struct Reserve {
    asset: f64,
    quote: f64,
}

#[derive(Default)]
struct WalletInner {
    counter: i64,
    assets: HashMap<String, AssetState>,
    avg_long_price: HashMap<String, f64>,
    avg_short_price: HashMap<String, f64>,
    orders: Vec<Order>,
    reserves: HashMap<i64, Reserve>,
    volume: HashMap<String, f64>,
    first_candle: HashMap<String, Candle>,
    last_candle: HashMap<String, Candle>,
    asset_values: HashMap<String, Vec<AssetValue>>,
    equity_values: Vec<AssetValue>,
}

impl WalletInner {
    fn next_id(&mut self) -> i64 {
        self.counter += 1;
        self.counter
    }

    fn asset_mut(&mut self, symbol: &str) -> &mut AssetState {
        self.assets.entry(symbol.to_string()).or_default()
    }
}

/// Builder for [`PaperWallet`] construction options.
pub struct PaperWalletBuilder {
    base_coin: String,
    feeder: Arc<dyn Feeder>,
    assets: Vec<(String, f64)>,
    maker_fee: f64,
    taker_fee: f64,
    strict_fees: bool,
}

impl PaperWalletBuilder {
    /// Seed an asset balance.
    #[must_use]
    pub fn with_asset(mut self, asset: impl Into<String>, amount: f64) -> Self {
        self.assets.push((asset.into(), amount));
        self
    }

    /// Record maker/taker fee rates. Rates are only deducted from fills when
    /// [`PaperWalletBuilder::strict_fees`] is enabled.
    #[must_use]
    pub fn with_fee(mut self, maker: f64, taker: f64) -> Self {
        self.maker_fee = maker;
        self.taker_fee = taker;
        self
    }

    /// Deduct the recorded fee rates from the quote asset on every fill.
    #[must_use]
    pub fn strict_fees(mut self, enabled: bool) -> Self {
        self.strict_fees = enabled;
        self
    }

    #[must_use]
    pub fn build(self) -> PaperWallet {
        let mut inner = WalletInner::default();
        for (asset, amount) in &self.assets {
            inner.assets.insert(
                asset.clone(),
                AssetState {
                    free: *amount,
                    lock: 0.0,
                },
            );
        }
        let initial_value = inner
            .assets
            .get(&self.base_coin)
            .map(|asset| asset.free)
            .unwrap_or_default();
        info!(
            base_coin = %self.base_coin,
            initial_value,
            "using paper wallet"
        );
        PaperWallet {
            base_coin: self.base_coin,
            feeder: self.feeder,
            maker_fee: self.maker_fee,
            taker_fee: self.taker_fee,
            strict_fees: self.strict_fees,
            initial_value,
            inner: Mutex::new(inner),
        }
    }
}

/// In-process simulated exchange.
pub struct PaperWallet {
    base_coin: String,
    feeder: Arc<dyn Feeder>,
    maker_fee: f64,
    taker_fee: f64,
    strict_fees: bool,
    initial_value: f64,
    inner: Mutex<WalletInner>,
}

impl PaperWallet {
    #[must_use]
    pub fn builder(base_coin: impl Into<String>, feeder: Arc<dyn Feeder>) -> PaperWalletBuilder {
        PaperWalletBuilder {
            base_coin: base_coin.into(),
            feeder,
            assets: Vec::new(),
            maker_fee: 0.0,
            taker_fee: 0.0,
            strict_fees: false,
        }
    }

    /// All asset symbols currently held, pairs and coins alike.
    #[must_use]
    pub fn pairs(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("wallet poisoned");
        inner.assets.keys().cloned().collect()
    }

    #[must_use]
    pub fn asset_values(&self, asset: &str) -> Vec<AssetValue> {
        let inner = self.inner.lock().expect("wallet poisoned");
        inner.asset_values.get(asset).cloned().unwrap_or_default()
    }

    /// Equity curve sampled at every complete candle.
    #[must_use]
    pub fn equity_values(&self) -> Vec<AssetValue> {
        let inner = self.inner.lock().expect("wallet poisoned");
        inner.equity_values.clone()
    }

    /// Maximum drawdown over the equity curve: the consecutive-decrease
    /// window with the most negative sum, relative to its start value.
    #[must_use]
    pub fn max_drawdown(&self) -> Option<Drawdown> {
        let inner = self.inner.lock().expect("wallet poisoned");
        let equity = &inner.equity_values;
        if equity.len() < 2 {
            return None;
        }

        let mut local_sum = f64::MAX;
        let mut local_base = equity[0].value;
        let mut local_start = equity[0].time;
        let mut local_end = equity[0].time;

        let mut global = Drawdown {
            value: 0.0,
            start: local_start,
            end: local_end,
        };
        let mut global_sum = 0.0;
        let mut global_base = local_base;

        for window in equity.windows(2) {
            let diff = window[1].value - window[0].value;
            if local_sum > 0.0 {
                // The running delta turned positive: start a new local minimum.
                local_sum = diff;
                local_base = window[0].value;
                local_start = window[0].time;
                local_end = window[1].time;
            } else {
                local_sum += diff;
                local_end = window[1].time;
            }
            if local_sum < global_sum {
                global_sum = local_sum;
                global_base = local_base;
                global.start = local_start;
                global.end = local_end;
            }
        }

        global.value = if global_base != 0.0 {
            global_sum / global_base
        } else {
            0.0
        };
        Some(global)
    }

    /// Feed a candle through the matcher and, on complete bars, append an
    /// equity snapshot.
    pub fn on_candle(&self, candle: &Candle) {
        let mut inner = self.inner.lock().expect("wallet poisoned");
        inner
            .last_candle
            .insert(candle.pair.clone(), candle.clone());
        inner
            .first_candle
            .entry(candle.pair.clone())
            .or_insert_with(|| candle.clone());

        for index in 0..inner.orders.len() {
            let order = inner.orders[index].clone();
            if order.pair != candle.pair || order.status != OrderStatus::New {
                continue;
            }
            let Some((asset, quote)) = split_pair(&order.pair) else {
                continue;
            };

            match order.side {
                Side::Buy => {
                    // Conservative: a buy fills at its limit when price falls
                    // to or below it within the bar.
                    if order.price >= candle.close {
                        self.fill(&mut inner, index, order.price, candle, &asset, &quote);
                    }
                }
                Side::Sell => {
                    let fill_price = match order.order_type {
                        OrderType::Limit
                        | OrderType::LimitMaker
                        | OrderType::TakeProfit
                        | OrderType::TakeProfitLimit
                            if candle.high >= order.price =>
                        {
                            Some(order.price)
                        }
                        OrderType::StopLoss | OrderType::StopLossLimit => order
                            .stop
                            .filter(|stop| candle.low <= *stop),
                        _ => None,
                    };
                    if let Some(price) = fill_price {
                        self.fill(&mut inner, index, price, candle, &asset, &quote);
                    }
                }
            }
        }

        if candle.complete {
            self.snapshot_equity(&mut inner, candle.time);
        }
    }

    fn fill(
        &self,
        inner: &mut WalletInner,
        index: usize,
        price: Price,
        candle: &Candle,
        asset: &str,
        quote: &str,
    ) {
        let (side, order_type, quantity) = {
            let order = &mut inner.orders[index];
            order.status = OrderStatus::Filled;
            order.updated_at = candle.time;
            (order.side, order.order_type, order.quantity)
        };
        *inner.volume.entry(candle.pair.clone()).or_default() += price * quantity;

        // The fill consumes the reserve; the surviving OCO leg is canceled
        // without re-crediting it.
        let filled = inner.orders[index].clone();
        self.cancel_group_siblings(inner, &filled, candle.time);
        let reserve_key = filled.group_id.unwrap_or(filled.exchange_id);
        inner.reserves.remove(&reserve_key);

        self.update_average_price(inner, side, &candle.pair, quantity, price);
        match side {
            Side::Buy => {
                inner.asset_mut(asset).free += quantity;
                inner.asset_mut(quote).lock -= price * quantity;
            }
            Side::Sell => {
                inner.asset_mut(asset).lock -= quantity;
                inner.asset_mut(quote).free += quantity * price;
            }
        }
        self.apply_fee(inner, quote, price * quantity, self.fill_fee_rate(order_type));
        debug!(
            pair = %candle.pair,
            side = %side,
            price,
            quantity,
            "paper order filled"
        );
    }

    fn fill_fee_rate(&self, order_type: OrderType) -> f64 {
        match order_type {
            OrderType::Market | OrderType::StopLoss | OrderType::StopLossLimit => self.taker_fee,
            _ => self.maker_fee,
        }
    }

    fn apply_fee(&self, inner: &mut WalletInner, quote: &str, notional: f64, rate: f64) {
        if !self.strict_fees || rate <= 0.0 {
            return;
        }
        inner.asset_mut(quote).free -= notional.abs() * rate;
    }

    fn cancel_group_siblings(&self, inner: &mut WalletInner, order: &Order, time: DateTime<Utc>) {
        let Some(group_id) = order.group_id else {
            return;
        };
        for sibling in &mut inner.orders {
            if sibling.group_id == Some(group_id)
                && sibling.exchange_id != order.exchange_id
                && sibling.status == OrderStatus::New
            {
                sibling.status = OrderStatus::Canceled;
                sibling.updated_at = time;
            }
        }
    }

    fn snapshot_equity(&self, inner: &mut WalletInner, time: DateTime<Utc>) {
        let mut total = 0.0;
        let assets: Vec<(String, AssetState)> = inner
            .assets
            .iter()
            .map(|(symbol, state)| (symbol.clone(), *state))
            .collect();
        for (symbol, state) in assets {
            if symbol == self.base_coin {
                continue;
            }
            let amount = state.free + state.lock;
            let pair = format!("{}{}", symbol.to_uppercase(), self.base_coin);
            let close = inner
                .last_candle
                .get(&pair)
                .map(|candle| candle.close)
                .unwrap_or_default();
            if amount < 0.0 {
                let size = amount.abs();
                let avg_short = inner.avg_short_price.get(&pair).copied().unwrap_or_default();
                total += 2.0 * size * avg_short - size * close;
            } else {
                total += amount * close;
            }
            inner
                .asset_values
                .entry(symbol)
                .or_default()
                .push(AssetValue {
                    time,
                    value: amount * close,
                });
        }

        let base = inner
            .assets
            .get(&self.base_coin)
            .copied()
            .unwrap_or_default();
        inner.equity_values.push(AssetValue {
            time,
            value: total + base.free + base.lock,
        });
    }

    /// Check available funds for an order and move the required amounts out
    /// of `free`. When `fill` is set the order executes immediately and the
    /// balances settle; otherwise the reserve is returned so it can be
    /// tracked until the order fills or is canceled.
    fn validate_funds(
        &self,
        inner: &mut WalletInner,
        side: Side,
        pair: &str,
        amount: Quantity,
        value: Price,
        fill: bool,
    ) -> BrokerResult<Option<Reserve>> {
        let (asset, quote) = split_pair(pair)
            .ok_or_else(|| BrokerError::InvalidPair(pair.to_string()))?;
        inner.asset_mut(&asset);
        inner.asset_mut(&quote);

        let asset_free = inner.assets[&asset].free;
        let mut funds = inner.assets[&quote].free;

        match side {
            Side::Sell => {
                if asset_free > 0.0 {
                    funds += asset_free * value;
                }
                if funds < amount * value {
                    return Err(BrokerError::InsufficientFunds {
                        pair: pair.to_string(),
                        quantity: amount,
                    });
                }

                // A sell against an existing long delivers held units; the
                // part exceeding the long shorts against quote collateral.
                let locked_asset = asset_free.max(0.0).min(amount);
                let locked_quote = (amount - locked_asset) * value;
                inner.asset_mut(&asset).free -= locked_asset;
                inner.asset_mut(&quote).free -= locked_quote;

                if fill {
                    self.update_average_price(inner, side, pair, amount, value);
                    if locked_quote > 0.0 {
                        // Entering a short position: only the excess over the
                        // delivered long goes negative.
                        inner.asset_mut(&asset).free -= amount - locked_asset;
                    } else {
                        // Liquidating a long position.
                        inner.asset_mut(&quote).free += amount * value;
                    }
                    self.apply_fee(inner, &quote, amount * value, self.taker_fee);
                    Ok(None)
                } else {
                    inner.asset_mut(&asset).lock += locked_asset;
                    inner.asset_mut(&quote).lock += locked_quote;
                    debug!(
                        asset = %asset,
                        lock = inner.assets[&asset].lock,
                        free = inner.assets[&asset].free,
                        "reserved sell funds"
                    );
                    Ok(Some(Reserve {
                        asset: locked_asset,
                        quote: locked_quote,
                    }))
                }
            }
            Side::Buy => {
                let mut liquid_short_value = 0.0;
                if asset_free < 0.0 {
                    let size = asset_free.abs();
                    let avg_short = inner
                        .avg_short_price
                        .get(pair)
                        .copied()
                        .unwrap_or_default();
                    // Cash realized by buying back the short at `value`.
                    liquid_short_value = 2.0 * size * avg_short - size * value;
                    funds += liquid_short_value;
                }

                let amount_to_buy = if asset_free < 0.0 {
                    amount + asset_free
                } else {
                    amount
                };
                if funds < amount_to_buy * value {
                    return Err(BrokerError::InsufficientFunds {
                        pair: pair.to_string(),
                        quantity: amount,
                    });
                }

                let locked_asset = (-asset_free.min(0.0)).min(amount);
                let locked_quote = (amount - locked_asset) * value - liquid_short_value;
                inner.asset_mut(&asset).free += locked_asset;
                inner.asset_mut(&quote).free -= locked_quote;

                if fill {
                    self.update_average_price(inner, side, pair, amount, value);
                    inner.asset_mut(&asset).free += amount - locked_asset;
                    self.apply_fee(inner, &quote, amount * value, self.taker_fee);
                    Ok(None)
                } else {
                    inner.asset_mut(&asset).lock += locked_asset;
                    inner.asset_mut(&quote).lock += locked_quote;
                    debug!(
                        asset = %asset,
                        lock = inner.assets[&asset].lock,
                        free = inner.assets[&asset].free,
                        "reserved buy funds"
                    );
                    Ok(Some(Reserve {
                        asset: locked_asset,
                        quote: locked_quote,
                    }))
                }
            }
        }
    }

    /// Average-price bookkeeping over the signed free quantity. Realized P&L
    /// on closing fills is logged here; persistent realization accounting
    /// belongs to the order controller.
    fn update_average_price(
        &self,
        inner: &mut WalletInner,
        side: Side,
        pair: &str,
        amount: Quantity,
        value: Price,
    ) {
        let actual_qty = split_pair(pair)
            .and_then(|(asset, _)| inner.assets.get(&asset))
            .map(|state| state.free)
            .unwrap_or_default();

        if actual_qty == 0.0 {
            match side {
                Side::Buy => inner.avg_long_price.insert(pair.to_string(), value),
                Side::Sell => inner.avg_short_price.insert(pair.to_string(), value),
            };
            return;
        }

        if actual_qty > 0.0 && side == Side::Buy {
            let avg = inner.avg_long_price.entry(pair.to_string()).or_default();
            *avg = (*avg * actual_qty + amount * value) / (actual_qty + amount);
            return;
        }

        if actual_qty > 0.0 && side == Side::Sell {
            let avg_long = inner.avg_long_price.get(pair).copied().unwrap_or_default();
            let profit = amount * value - amount.min(actual_qty) * avg_long;
            let percent = if avg_long > 0.0 {
                profit / (amount * avg_long) * 100.0
            } else {
                0.0
            };
            info!(pair, profit, percent, "realized long profit");

            if amount > actual_qty {
                // The excess flips the position short.
                inner.avg_short_price.insert(pair.to_string(), value);
            }
            return;
        }

        if actual_qty < 0.0 && side == Side::Sell {
            let avg = inner.avg_short_price.entry(pair.to_string()).or_default();
            *avg = (*avg * -actual_qty + amount * value) / (-actual_qty + amount);
            return;
        }

        // actual short + order buy
        let avg_short = inner.avg_short_price.get(pair).copied().unwrap_or_default();
        let profit = amount.min(-actual_qty) * avg_short - amount * value;
        let percent = if avg_short > 0.0 {
            profit / (amount * avg_short) * 100.0
        } else {
            0.0
        };
        info!(pair, profit, percent, "realized short profit");

        if amount > -actual_qty {
            inner.avg_long_price.insert(pair.to_string(), value);
        }
    }

    fn create_market(
        &self,
        inner: &mut WalletInner,
        side: Side,
        pair: &str,
        size: Quantity,
    ) -> BrokerResult<Order> {
        if size == 0.0 {
            return Err(BrokerError::InvalidQuantity);
        }
        let last = inner
            .last_candle
            .get(pair)
            .cloned()
            .ok_or_else(|| BrokerError::FeedUnavailable(format!("no candle seen for {pair}")))?;
        self.validate_funds(inner, side, pair, size, last.close, true)?;
        *inner.volume.entry(pair.to_string()).or_default() += last.close * size;

        let order = Order {
            id: 0,
            exchange_id: inner.next_id(),
            pair: pair.to_string(),
            side,
            order_type: OrderType::Market,
            status: OrderStatus::Filled,
            price: last.close,
            quantity: size,
            created_at: last.time,
            updated_at: last.time,
            stop: None,
            group_id: None,
            ref_price: last.close,
            profit_pct: 0.0,
            profit_value: 0.0,
        };
        inner.orders.push(order.clone());
        Ok(order)
    }

    /// Formatted end-of-run wallet report.
    #[must_use]
    pub fn summary(&self) -> String {
        let inner = self.inner.lock().expect("wallet poisoned");
        let mut out = String::new();
        let mut total = 0.0;
        let mut market_change = 0.0;

        let _ = writeln!(out, "----- FINAL WALLET -----");
        for (pair, last) in &inner.last_candle {
            let Some((asset, quote)) = split_pair(pair) else {
                continue;
            };
            let Some(state) = inner.assets.get(&asset) else {
                continue;
            };
            let quantity = state.free + state.lock;
            let value = if quantity < 0.0 {
                let avg_short = inner.avg_short_price.get(pair).copied().unwrap_or_default();
                (2.0 * avg_short * quantity - last.close * quantity).abs()
            } else {
                quantity * last.close
            };
            total += value;
            if let Some(first) = inner.first_candle.get(pair) {
                market_change += (last.close - first.close) / first.close;
            }
            let _ = writeln!(out, "{quantity:.4} {asset} = {total:.4} {quote}");
        }

        let base = inner
            .assets
            .get(&self.base_coin)
            .copied()
            .unwrap_or_default();
        let base_value = base.free + base.lock;
        let profit = total + base_value - self.initial_value;
        let avg_market_change = if inner.last_candle.is_empty() {
            0.0
        } else {
            market_change / inner.last_candle.len() as f64
        };
        let _ = writeln!(out, "{base_value:.4} {}", self.base_coin);
        let _ = writeln!(out);
        let _ = writeln!(out, "----- RETURNS -----");
        let _ = writeln!(
            out,
            "START PORTFOLIO     = {:.2} {}",
            self.initial_value, self.base_coin
        );
        let _ = writeln!(
            out,
            "FINAL PORTFOLIO     = {:.2} {}",
            total + base_value,
            self.base_coin
        );
        let _ = writeln!(
            out,
            "GROSS PROFIT        = {profit:.4} {} ({:.2}%)",
            self.base_coin,
            if self.initial_value != 0.0 {
                profit / self.initial_value * 100.0
            } else {
                0.0
            }
        );
        let _ = writeln!(out, "MARKET CHANGE (B&H) = {:.2}%", avg_market_change * 100.0);
        drop(inner);
        let _ = writeln!(out);
        let _ = writeln!(out, "------ RISK -------");
        let drawdown = self.max_drawdown().map(|d| d.value).unwrap_or_default();
        let _ = writeln!(out, "MAX DRAWDOWN = {:.2} %", drawdown * 100.0);

        let inner = self.inner.lock().expect("wallet poisoned");
        let _ = writeln!(out);
        let _ = writeln!(out, "------ VOLUME -----");
        let mut volume = 0.0;
        for (pair, pair_volume) in &inner.volume {
            volume += pair_volume;
            let _ = writeln!(out, "{pair} = {pair_volume:.2} {}", self.base_coin);
        }
        let _ = writeln!(out, "TOTAL = {volume:.2} {}", self.base_coin);
        out
    }
}

fn split_pair(pair: &str) -> Option<(String, String)> {
    split_asset_quote(pair).map(|(asset, quote)| (asset.to_string(), quote.to_string()))
}

#[async_trait]
impl Broker for PaperWallet {
    async fn account(&self) -> BrokerResult<Account> {
        let inner = self.inner.lock().expect("wallet poisoned");
        let balances = inner
            .assets
            .iter()
            .map(|(asset, state)| Balance {
                asset: asset.clone(),
                free: state.free,
                lock: state.lock,
                leverage: 1.0,
            })
            .collect();
        Ok(Account { balances })
    }

    async fn position(&self, pair: &str) -> BrokerResult<(Quantity, Quantity)> {
        let (asset, quote) =
            split_pair(pair).ok_or_else(|| BrokerError::InvalidPair(pair.to_string()))?;
        let account = self.account().await?;
        let (asset_balance, quote_balance) = account.balance(&asset, &quote);
        Ok((
            asset_balance.free + asset_balance.lock,
            quote_balance.free + quote_balance.lock,
        ))
    }

    async fn order(&self, _pair: &str, exchange_id: i64) -> BrokerResult<Order> {
        let inner = self.inner.lock().expect("wallet poisoned");
        inner
            .orders
            .iter()
            .find(|order| order.exchange_id == exchange_id)
            .cloned()
            .ok_or(BrokerError::OrderNotFound(exchange_id))
    }

    async fn create_order_oco(
        &self,
        side: Side,
        pair: &str,
        size: Quantity,
        price: Price,
        stop: Price,
        stop_limit: Price,
    ) -> BrokerResult<Vec<Order>> {
        let mut inner = self.inner.lock().expect("wallet poisoned");
        if size == 0.0 {
            return Err(BrokerError::InvalidQuantity);
        }
        let reserve = self.validate_funds(&mut inner, side, pair, size, price, false)?;

        let last = inner.last_candle.get(pair).cloned().unwrap_or_default();
        let group_id = inner.next_id();
        if let Some(reserve) = reserve {
            inner.reserves.insert(group_id, reserve);
        }
        let limit_maker = Order {
            id: 0,
            exchange_id: inner.next_id(),
            pair: pair.to_string(),
            side,
            order_type: OrderType::LimitMaker,
            status: OrderStatus::New,
            price,
            quantity: size,
            created_at: last.time,
            updated_at: last.time,
            stop: None,
            group_id: Some(group_id),
            ref_price: last.close,
            profit_pct: 0.0,
            profit_value: 0.0,
        };
        let stop_order = Order {
            id: 0,
            exchange_id: inner.next_id(),
            pair: pair.to_string(),
            side,
            order_type: OrderType::StopLoss,
            status: OrderStatus::New,
            price: stop_limit,
            quantity: size,
            created_at: last.time,
            updated_at: last.time,
            stop: Some(stop),
            group_id: Some(group_id),
            ref_price: last.close,
            profit_pct: 0.0,
            profit_value: 0.0,
        };
        inner.orders.push(limit_maker.clone());
        inner.orders.push(stop_order.clone());
        Ok(vec![limit_maker, stop_order])
    }

    async fn create_order_limit(
        &self,
        side: Side,
        pair: &str,
        size: Quantity,
        limit: Price,
    ) -> BrokerResult<Order> {
        let mut inner = self.inner.lock().expect("wallet poisoned");
        if size == 0.0 {
            return Err(BrokerError::InvalidQuantity);
        }
        let reserve = self.validate_funds(&mut inner, side, pair, size, limit, false)?;
        let last = inner.last_candle.get(pair).cloned().unwrap_or_default();
        let order = Order {
            id: 0,
            exchange_id: inner.next_id(),
            pair: pair.to_string(),
            side,
            order_type: OrderType::Limit,
            status: OrderStatus::New,
            price: limit,
            quantity: size,
            created_at: last.time,
            updated_at: last.time,
            stop: None,
            group_id: None,
            ref_price: last.close,
            profit_pct: 0.0,
            profit_value: 0.0,
        };
        if let Some(reserve) = reserve {
            inner.reserves.insert(order.exchange_id, reserve);
        }
        inner.orders.push(order.clone());
        Ok(order)
    }

    async fn create_order_market(
        &self,
        side: Side,
        pair: &str,
        size: Quantity,
    ) -> BrokerResult<Order> {
        let mut inner = self.inner.lock().expect("wallet poisoned");
        self.create_market(&mut inner, side, pair, size)
    }

    async fn create_order_market_quote(
        &self,
        side: Side,
        pair: &str,
        quote: Quantity,
    ) -> BrokerResult<Order> {
        let mut inner = self.inner.lock().expect("wallet poisoned");
        let last_close = inner
            .last_candle
            .get(pair)
            .map(|candle| candle.close)
            .ok_or_else(|| BrokerError::FeedUnavailable(format!("no candle seen for {pair}")))?;
        let info = Feeder::assets_info(self, pair);
        let size = round_to_step(quote / last_close, info.step_size);
        self.create_market(&mut inner, side, pair, size)
    }

    async fn create_order_stop(
        &self,
        pair: &str,
        quantity: Quantity,
        limit: Price,
    ) -> BrokerResult<Order> {
        let mut inner = self.inner.lock().expect("wallet poisoned");
        if quantity == 0.0 {
            return Err(BrokerError::InvalidQuantity);
        }
        let reserve =
            self.validate_funds(&mut inner, Side::Sell, pair, quantity, limit, false)?;
        let last = inner.last_candle.get(pair).cloned().unwrap_or_default();
        let order = Order {
            id: 0,
            exchange_id: inner.next_id(),
            pair: pair.to_string(),
            side: Side::Sell,
            order_type: OrderType::StopLossLimit,
            status: OrderStatus::New,
            price: limit,
            quantity,
            created_at: last.time,
            updated_at: last.time,
            stop: Some(limit),
            group_id: None,
            ref_price: last.close,
            profit_pct: 0.0,
            profit_value: 0.0,
        };
        if let Some(reserve) = reserve {
            inner.reserves.insert(order.exchange_id, reserve);
        }
        inner.orders.push(order.clone());
        Ok(order)
    }

    async fn cancel(&self, order: &Order) -> BrokerResult<()> {
        let mut inner = self.inner.lock().expect("wallet poisoned");
        let Some(index) = inner
            .orders
            .iter()
            .position(|stored| stored.exchange_id == order.exchange_id)
        else {
            return Err(BrokerError::OrderNotFound(order.exchange_id));
        };
        if inner.orders[index].status != OrderStatus::New {
            return Ok(());
        }
        inner.orders[index].status = OrderStatus::Canceled;

        // Release the reserve unless a sibling OCO leg still rides on it.
        let stored = inner.orders[index].clone();
        let reserve_key = stored.group_id.unwrap_or(stored.exchange_id);
        let sibling_open = stored.group_id.is_some()
            && inner.orders.iter().any(|other| {
                other.group_id == stored.group_id
                    && other.exchange_id != stored.exchange_id
                    && other.status == OrderStatus::New
            });
        if !sibling_open {
            if let Some(reserve) = inner.reserves.remove(&reserve_key) {
                if let Some((asset, quote)) = split_pair(&stored.pair) {
                    let asset_state = inner.asset_mut(&asset);
                    asset_state.lock -= reserve.asset;
                    asset_state.free += reserve.asset;
                    let quote_state = inner.asset_mut(&quote);
                    quote_state.lock -= reserve.quote;
                    quote_state.free += reserve.quote;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Feeder for PaperWallet {
    fn assets_info(&self, pair: &str) -> AssetInfo {
        let (base, quote) = split_asset_quote(pair).unwrap_or(("", ""));
        AssetInfo {
            base_asset: base.to_string(),
            quote_asset: quote.to_string(),
            min_price: 0.0,
            max_price: f64::MAX,
            min_quantity: 0.0,
            max_quantity: f64::MAX,
            step_size: 1e-8,
            tick_size: 1e-8,
            quote_precision: 8,
            base_asset_precision: 8,
        }
    }

    async fn last_quote(&self, pair: &str) -> BrokerResult<Price> {
        self.feeder.last_quote(pair).await
    }

    async fn candles_by_period(
        &self,
        pair: &str,
        timeframe: TimeFrame,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> BrokerResult<Vec<Candle>> {
        self.feeder
            .candles_by_period(pair, timeframe, start, end)
            .await
    }

    async fn candles_by_limit(
        &self,
        pair: &str,
        timeframe: TimeFrame,
        limit: usize,
    ) -> BrokerResult<Vec<Candle>> {
        self.feeder.candles_by_limit(pair, timeframe, limit).await
    }

    async fn candles_subscription(
        &self,
        pair: &str,
        timeframe: TimeFrame,
    ) -> BrokerResult<CandleSubscription> {
        self.feeder.candles_subscription(pair, timeframe).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    struct NullFeeder;

    #[async_trait]
    impl Feeder for NullFeeder {
        fn assets_info(&self, _pair: &str) -> AssetInfo {
            unimplemented!("unused in wallet tests")
        }

        async fn last_quote(&self, _pair: &str) -> BrokerResult<Price> {
            Err(BrokerError::FeedUnavailable("null feeder".into()))
        }

        async fn candles_by_period(
            &self,
            _pair: &str,
            _timeframe: TimeFrame,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
        ) -> BrokerResult<Vec<Candle>> {
            Ok(Vec::new())
        }

        async fn candles_by_limit(
            &self,
            _pair: &str,
            _timeframe: TimeFrame,
            _limit: usize,
        ) -> BrokerResult<Vec<Candle>> {
            Ok(Vec::new())
        }

        async fn candles_subscription(
            &self,
            _pair: &str,
            _timeframe: TimeFrame,
        ) -> BrokerResult<CandleSubscription> {
            Err(BrokerError::FeedUnavailable("null feeder".into()))
        }
    }

    fn wallet(initial_usdt: f64) -> PaperWallet {
        PaperWallet::builder("USDT", Arc::new(NullFeeder))
            .with_asset("USDT", initial_usdt)
            .build()
    }

    fn candle(ts: i64, close: f64) -> Candle {
        Candle {
            pair: "BTCUSDT".into(),
            time: Utc.timestamp_opt(ts, 0).unwrap(),
            updated_at: Utc.timestamp_opt(ts, 0).unwrap(),
            open: close,
            close,
            low: close,
            high: close,
            volume: 1.0,
            complete: true,
            metadata: HashMap::new(),
        }
    }

    async fn balances(wallet: &PaperWallet, asset: &str) -> Balance {
        wallet
            .account()
            .await
            .unwrap()
            .balances
            .into_iter()
            .find(|balance| balance.asset == asset)
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn long_round_trip() {
        let wallet = wallet(10_000.0);
        wallet.on_candle(&candle(60, 100.0));

        let order = wallet
            .create_order_market(Side::Buy, "BTCUSDT", 10.0)
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.price, 100.0);
        assert_eq!(balances(&wallet, "BTC").await.free, 10.0);
        assert_eq!(balances(&wallet, "USDT").await.free, 9_000.0);

        wallet.on_candle(&candle(120, 120.0));
        wallet
            .create_order_market(Side::Sell, "BTCUSDT", 10.0)
            .await
            .unwrap();
        assert_eq!(balances(&wallet, "BTC").await.free, 0.0);
        assert_eq!(balances(&wallet, "USDT").await.free, 10_200.0);
    }

    #[tokio::test]
    async fn oco_limit_leg_fills_and_cancels_stop() {
        let wallet = wallet(10_000.0);
        wallet.on_candle(&candle(60, 100.0));
        wallet
            .create_order_market(Side::Buy, "BTCUSDT", 10.0)
            .await
            .unwrap();

        let legs = wallet
            .create_order_oco(Side::Sell, "BTCUSDT", 10.0, 110.0, 95.0, 95.0)
            .await
            .unwrap();
        assert_eq!(legs.len(), 2);
        assert_eq!(legs[0].group_id, legs[1].group_id);
        assert_eq!(balances(&wallet, "BTC").await.lock, 10.0);

        let mut bar = candle(120, 110.0);
        bar.high = 112.0;
        bar.low = 108.0;
        wallet.on_candle(&bar);

        let limit = wallet.order("BTCUSDT", legs[0].exchange_id).await.unwrap();
        let stop = wallet.order("BTCUSDT", legs[1].exchange_id).await.unwrap();
        assert_eq!(limit.status, OrderStatus::Filled);
        assert_eq!(stop.status, OrderStatus::Canceled);
        assert_eq!(stop.updated_at, bar.time);
        assert_eq!(balances(&wallet, "USDT").await.free, 9_000.0 + 1_100.0);
        assert_eq!(balances(&wallet, "BTC").await.lock, 0.0);
    }

    #[tokio::test]
    async fn short_via_oversell_and_buy_back() {
        let wallet = wallet(10_000.0);
        wallet.on_candle(&candle(60, 100.0));

        wallet
            .create_order_market(Side::Sell, "BTCUSDT", 1.0)
            .await
            .unwrap();
        let btc = balances(&wallet, "BTC").await;
        assert_eq!(btc.free, -1.0);
        // Quote collateral is withheld rather than credited while short.
        assert_eq!(balances(&wallet, "USDT").await.free, 9_900.0);

        wallet.on_candle(&candle(120, 80.0));
        wallet
            .create_order_market(Side::Buy, "BTCUSDT", 1.0)
            .await
            .unwrap();
        assert_eq!(balances(&wallet, "BTC").await.free, 0.0);
        // Realized short profit of +20 lands back in quote.
        assert_eq!(balances(&wallet, "USDT").await.free, 10_020.0);
    }

    #[tokio::test]
    async fn oversell_flips_long_to_short() {
        let wallet = wallet(10_000.0);
        wallet.on_candle(&candle(60, 100.0));
        wallet
            .create_order_market(Side::Buy, "BTCUSDT", 1.0)
            .await
            .unwrap();

        wallet.on_candle(&candle(120, 110.0));
        wallet
            .create_order_market(Side::Sell, "BTCUSDT", 3.0)
            .await
            .unwrap();

        let btc = balances(&wallet, "BTC").await;
        assert_eq!(btc.free, -2.0);
        let inner = wallet.inner.lock().unwrap();
        assert_eq!(inner.avg_short_price["BTCUSDT"], 110.0);
    }

    #[tokio::test]
    async fn rejects_orders_beyond_available_funds() {
        let wallet = wallet(100.0);
        wallet.on_candle(&candle(60, 100.0));

        let err = wallet
            .create_order_market(Side::Buy, "BTCUSDT", 2.0)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InsufficientFunds { .. }));
        // A failed validation must not leak partial balance mutations.
        assert_eq!(balances(&wallet, "USDT").await.free, 100.0);

        let err = wallet
            .create_order_market(Side::Buy, "BTCUSDT", 0.0)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidQuantity));
    }

    #[tokio::test]
    async fn limit_buy_fills_when_price_reaches_level() {
        let wallet = wallet(10_000.0);
        wallet.on_candle(&candle(60, 100.0));

        let order = wallet
            .create_order_limit(Side::Buy, "BTCUSDT", 5.0, 90.0)
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::New);
        assert_eq!(balances(&wallet, "USDT").await.lock, 450.0);

        // Above the limit: stays resting.
        wallet.on_candle(&candle(120, 95.0));
        assert_eq!(
            wallet
                .order("BTCUSDT", order.exchange_id)
                .await
                .unwrap()
                .status,
            OrderStatus::New
        );

        wallet.on_candle(&candle(180, 88.0));
        let filled = wallet.order("BTCUSDT", order.exchange_id).await.unwrap();
        assert_eq!(filled.status, OrderStatus::Filled);
        assert_eq!(balances(&wallet, "BTC").await.free, 5.0);
        assert_eq!(balances(&wallet, "USDT").await.lock, 0.0);
    }

    #[tokio::test]
    async fn stop_order_fills_at_stop_price() {
        let wallet = wallet(10_000.0);
        wallet.on_candle(&candle(60, 100.0));
        wallet
            .create_order_market(Side::Buy, "BTCUSDT", 1.0)
            .await
            .unwrap();

        let stop = wallet
            .create_order_stop("BTCUSDT", 1.0, 95.0)
            .await
            .unwrap();
        assert_eq!(stop.order_type, OrderType::StopLossLimit);
        assert_eq!(stop.stop, Some(95.0));

        let mut bar = candle(120, 96.0);
        bar.low = 94.0;
        wallet.on_candle(&bar);
        let filled = wallet.order("BTCUSDT", stop.exchange_id).await.unwrap();
        assert_eq!(filled.status, OrderStatus::Filled);
        // Fill settles at the stop price, not the close.
        assert_eq!(balances(&wallet, "USDT").await.free, 9_900.0 + 95.0);
    }

    #[tokio::test]
    async fn cancel_releases_reserved_funds() {
        let wallet = wallet(10_000.0);
        wallet.on_candle(&candle(60, 100.0));

        let order = wallet
            .create_order_limit(Side::Buy, "BTCUSDT", 5.0, 90.0)
            .await
            .unwrap();
        assert_eq!(balances(&wallet, "USDT").await.lock, 450.0);

        wallet.cancel(&order).await.unwrap();
        let usdt = balances(&wallet, "USDT").await;
        assert_eq!(usdt.lock, 0.0);
        assert_eq!(usdt.free, 10_000.0);
        assert_eq!(
            wallet
                .order("BTCUSDT", order.exchange_id)
                .await
                .unwrap()
                .status,
            OrderStatus::Canceled
        );
    }

    #[tokio::test]
    async fn canceling_one_oco_leg_keeps_shared_reserve() {
        let wallet = wallet(10_000.0);
        wallet.on_candle(&candle(60, 100.0));
        wallet
            .create_order_market(Side::Buy, "BTCUSDT", 10.0)
            .await
            .unwrap();
        let legs = wallet
            .create_order_oco(Side::Sell, "BTCUSDT", 10.0, 110.0, 95.0, 95.0)
            .await
            .unwrap();

        wallet.cancel(&legs[0]).await.unwrap();
        assert_eq!(balances(&wallet, "BTC").await.lock, 10.0);

        wallet.cancel(&legs[1]).await.unwrap();
        let btc = balances(&wallet, "BTC").await;
        assert_eq!(btc.lock, 0.0);
        assert_eq!(btc.free, 10.0);
    }

    #[tokio::test]
    async fn equity_curve_and_drawdown() {
        let wallet = wallet(10_000.0);
        wallet.on_candle(&candle(60, 100.0));
        wallet
            .create_order_market(Side::Buy, "BTCUSDT", 10.0)
            .await
            .unwrap();

        for (ts, close) in [(120, 110.0), (180, 90.0), (240, 80.0), (300, 95.0)] {
            wallet.on_candle(&candle(ts, close));
        }

        let equity = wallet.equity_values();
        assert_eq!(equity.len(), 5);
        // 10 BTC marked at the close plus remaining quote.
        assert_eq!(equity[1].value, 9_000.0 + 10.0 * 110.0);

        let drawdown = wallet.max_drawdown().unwrap();
        // Decline from the 110 peak (10100) down to the 80 trough (9800).
        assert!((drawdown.value - (9_800.0 - 10_100.0) / 10_100.0).abs() < 1e-9);
        assert_eq!(drawdown.start, Utc.timestamp_opt(120, 0).unwrap());
        assert_eq!(drawdown.end, Utc.timestamp_opt(240, 0).unwrap());
    }

    #[tokio::test]
    async fn strict_fees_debit_the_quote_asset() {
        let wallet = PaperWallet::builder("USDT", Arc::new(NullFeeder))
            .with_asset("USDT", 10_000.0)
            .with_fee(0.001, 0.002)
            .strict_fees(true)
            .build();
        wallet.on_candle(&candle(60, 100.0));
        wallet
            .create_order_market(Side::Buy, "BTCUSDT", 10.0)
            .await
            .unwrap();
        // Taker fee on 1000 notional.
        assert_eq!(balances(&wallet, "USDT").await.free, 9_000.0 - 2.0);
    }

    #[tokio::test]
    async fn market_quote_sizes_by_last_close() {
        let wallet = wallet(10_000.0);
        wallet.on_candle(&candle(60, 100.0));
        let order = wallet
            .create_order_market_quote(Side::Buy, "BTCUSDT", 1_000.0)
            .await
            .unwrap();
        assert!((order.quantity - 10.0).abs() < 1e-6);
    }
}
