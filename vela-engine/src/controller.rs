//! Broker-facing order controller: serialized order routing, position
//! tracking, realized P&L aggregation and periodic order reconciliation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{error, info};

use vela_broker::{Broker, BrokerError, BrokerResult, Exchange};
use vela_core::{
    split_asset_quote, Account, Candle, Order, OrderStatus, Price, Quantity, Side,
};
use vela_journal::{Journal, OrderQuery};

use crate::order_feed::{OrderFeed, OrderSubscriber};
use crate::position::Position;
use crate::summary::Summary;

/// Observer for human-facing notifications (orders, profits, errors).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: String);
    async fn on_order(&self, order: Order);
    async fn on_error(&self, error: String);
}

/// Adapter subscribing a notifier to the order feed.
pub struct NotifierSubscriber(pub Arc<dyn Notifier>);

#[async_trait]
impl OrderSubscriber for NotifierSubscriber {
    async fn on_order(&self, order: Order) {
        self.0.on_order(order).await;
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ControllerStatus {
    Running,
    Stopped,
}

#[derive(Default)]
struct ControllerState {
    results: HashMap<String, Summary>,
    positions: HashMap<String, Position>,
    last_price: HashMap<String, Price>,
}

/// Serializes order creation, cancellation and reconciliation against one
/// exchange. Read-only queries bypass the serialization and hit the exchange
/// directly.
pub struct OrderController {
    exchange: Arc<dyn Exchange>,
    journal: Arc<dyn Journal>,
    order_feed: Arc<OrderFeed>,
    notifier: Mutex<Option<Arc<dyn Notifier>>>,
    state: AsyncMutex<ControllerState>,
    status: Mutex<ControllerStatus>,
    ticker_interval: Duration,
    shutdown: watch::Sender<bool>,
}

impl OrderController {
    #[must_use]
    pub fn new(
        exchange: Arc<dyn Exchange>,
        journal: Arc<dyn Journal>,
        order_feed: Arc<OrderFeed>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            exchange,
            journal,
            order_feed,
            notifier: Mutex::new(None),
            state: AsyncMutex::new(ControllerState::default()),
            status: Mutex::new(ControllerStatus::Stopped),
            ticker_interval: Duration::from_secs(1),
            shutdown,
        }
    }

    pub fn set_notifier(&self, notifier: Arc<dyn Notifier>) {
        *self.notifier.lock().expect("controller poisoned") = Some(notifier);
    }

    #[must_use]
    pub fn status(&self) -> ControllerStatus {
        *self.status.lock().expect("controller poisoned")
    }

    /// Track the latest close used for position valuation.
    pub async fn on_candle(&self, candle: &Candle) {
        let mut state = self.state.lock().await;
        state.last_price.insert(candle.pair.clone(), candle.close);
    }

    /// Snapshot of the per-pair summaries.
    pub async fn results(&self) -> HashMap<String, Summary> {
        self.state.lock().await.results.clone()
    }

    pub async fn last_quote(&self, pair: &str) -> BrokerResult<Price> {
        self.exchange.last_quote(pair).await
    }

    /// Marked value of the current asset position.
    pub async fn position_value(&self, pair: &str) -> BrokerResult<f64> {
        let (asset, _) = self.exchange.position(pair).await?;
        let state = self.state.lock().await;
        Ok(asset * state.last_price.get(pair).copied().unwrap_or_default())
    }

    /// Start the reconciliation ticker.
    pub fn start(self: &Arc<Self>) {
        let mut status = self.status.lock().expect("controller poisoned");
        if *status == ControllerStatus::Running {
            return;
        }
        *status = ControllerStatus::Running;
        drop(status);

        let controller = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(controller.ticker_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => controller.update_orders().await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        info!("bot started");
    }

    /// Stop the ticker, flushing one final reconciliation pass first.
    pub async fn stop(&self) {
        {
            let mut status = self.status.lock().expect("controller poisoned");
            if *status != ControllerStatus::Running {
                return;
            }
            *status = ControllerStatus::Stopped;
        }
        self.update_orders().await;
        let _ = self.shutdown.send(true);
        info!("bot stopped");
    }

    /// Poll the exchange for every open journaled order and replay status
    /// changes through position tracking and the order feed. Errors on a
    /// single order are logged and skipped.
    pub async fn update_orders(&self) {
        let mut state = self.state.lock().await;
        let open = match self.journal.orders(&OrderQuery::new().with_status_in([
            OrderStatus::New,
            OrderStatus::PartiallyFilled,
            OrderStatus::PendingCancel,
        ])) {
            Ok(orders) => orders,
            Err(err) => {
                self.notify_error(format!("order reconciliation query failed: {err}"));
                return;
            }
        };

        let mut updated = Vec::new();
        for order in open {
            let mut exchange_order =
                match self.exchange.order(&order.pair, order.exchange_id).await {
                    Ok(found) => found,
                    Err(err) => {
                        error!(id = order.exchange_id, %err, "order lookup failed");
                        continue;
                    }
                };
            if exchange_order.status == order.status {
                continue;
            }

            exchange_order.id = order.id;
            if let Err(err) = self.journal.update_order(&exchange_order) {
                self.notify_error(format!("order update failed: {err}"));
                continue;
            }
            info!(status = %exchange_order.status, order = %exchange_order, "order updated");
            updated.push(exchange_order);
        }

        for mut order in updated {
            self.process_trade(&mut state, &mut order);
            self.order_feed.publish(order);
        }
    }

    /// Record a filled order: pair volume plus the position state machine.
    fn process_trade(&self, state: &mut ControllerState, order: &mut Order) {
        if order.status != OrderStatus::Filled {
            return;
        }

        let summary = state
            .results
            .entry(order.pair.clone())
            .or_insert_with(|| Summary::new(order.pair.clone()));
        summary.volume += order.price * order.quantity;

        self.update_position(state, order);
    }

    fn update_position(&self, state: &mut ControllerState, order: &mut Order) {
        let Some(position) = state.positions.get_mut(&order.pair) else {
            state
                .positions
                .insert(order.pair.clone(), Position::open(order));
            return;
        };

        let (result, closed) = position.update(order);
        if closed {
            state.positions.remove(&order.pair);
        }

        if let Some(result) = result {
            let summary = state
                .results
                .entry(order.pair.clone())
                .or_insert_with(|| Summary::new(order.pair.clone()));
            summary.add_result(&result);

            let quote = split_asset_quote(&order.pair)
                .map(|(_, quote)| quote)
                .unwrap_or_default();
            self.notify(format!(
                "[PROFIT] {:.4} {} ({:.2} %)\n{}",
                result.profit_value,
                quote,
                result.profit_pct * 100.0,
                summary
            ));
        }
    }

    fn notify(&self, message: String) {
        info!("{message}");
        let notifier = self.notifier.lock().expect("controller poisoned").clone();
        if let Some(notifier) = notifier {
            tokio::spawn(async move { notifier.notify(message).await });
        }
    }

    fn notify_error(&self, message: String) {
        error!("{message}");
        let notifier = self.notifier.lock().expect("controller poisoned").clone();
        if let Some(notifier) = notifier {
            tokio::spawn(async move { notifier.on_error(message).await });
        }
    }

    fn journal_create(&self, order: &mut Order) -> BrokerResult<()> {
        self.journal.create_order(order).map_err(|err| {
            self.notify_error(format!("order persistence failed: {err}"));
            BrokerError::Storage(err.to_string())
        })
    }
}

#[async_trait]
impl Broker for OrderController {
    async fn account(&self) -> BrokerResult<Account> {
        self.exchange.account().await
    }

    async fn position(&self, pair: &str) -> BrokerResult<(Quantity, Quantity)> {
        self.exchange.position(pair).await
    }

    async fn order(&self, pair: &str, exchange_id: i64) -> BrokerResult<Order> {
        self.exchange.order(pair, exchange_id).await
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
        let _state = self.state.lock().await;
        info!(pair, "creating OCO order");
        let mut orders = match self
            .exchange
            .create_order_oco(side, pair, size, price, stop, stop_limit)
            .await
        {
            Ok(orders) => orders,
            Err(err) => {
                self.notify_error(format!("OCO order failed: {err}"));
                return Err(err);
            }
        };
        for order in &mut orders {
            self.journal_create(order)?;
            self.order_feed.publish(order.clone());
        }
        Ok(orders)
    }

    async fn create_order_limit(
        &self,
        side: Side,
        pair: &str,
        size: Quantity,
        limit: Price,
    ) -> BrokerResult<Order> {
        let _state = self.state.lock().await;
        info!(pair, side = %side, "creating LIMIT order");
        let mut order = match self
            .exchange
            .create_order_limit(side, pair, size, limit)
            .await
        {
            Ok(order) => order,
            Err(err) => {
                self.notify_error(format!("limit order failed: {err}"));
                return Err(err);
            }
        };
        self.journal_create(&mut order)?;
        self.order_feed.publish(order.clone());
        info!(order = %order, "order created");
        Ok(order)
    }

    async fn create_order_market(
        &self,
        side: Side,
        pair: &str,
        size: Quantity,
    ) -> BrokerResult<Order> {
        let mut state = self.state.lock().await;
        info!(pair, side = %side, "creating MARKET order");
        let mut order = match self.exchange.create_order_market(side, pair, size).await {
            Ok(order) => order,
            Err(err) => {
                self.notify_error(format!("market order failed: {err}"));
                return Err(err);
            }
        };
        self.journal_create(&mut order)?;
        // Market orders fill synchronously; record the trade immediately.
        self.process_trade(&mut state, &mut order);
        self.order_feed.publish(order.clone());
        info!(order = %order, "order created");
        Ok(order)
    }

    async fn create_order_market_quote(
        &self,
        side: Side,
        pair: &str,
        quote: Quantity,
    ) -> BrokerResult<Order> {
        let mut state = self.state.lock().await;
        info!(pair, side = %side, "creating MARKET (quote) order");
        let mut order = match self
            .exchange
            .create_order_market_quote(side, pair, quote)
            .await
        {
            Ok(order) => order,
            Err(err) => {
                self.notify_error(format!("market order failed: {err}"));
                return Err(err);
            }
        };
        self.journal_create(&mut order)?;
        self.process_trade(&mut state, &mut order);
        self.order_feed.publish(order.clone());
        info!(order = %order, "order created");
        Ok(order)
    }

    async fn create_order_stop(
        &self,
        pair: &str,
        quantity: Quantity,
        limit: Price,
    ) -> BrokerResult<Order> {
        let _state = self.state.lock().await;
        info!(pair, "creating STOP order");
        let mut order = match self.exchange.create_order_stop(pair, quantity, limit).await {
            Ok(order) => order,
            Err(err) => {
                self.notify_error(format!("stop order failed: {err}"));
                return Err(err);
            }
        };
        self.journal_create(&mut order)?;
        self.order_feed.publish(order.clone());
        info!(order = %order, "order created");
        Ok(order)
    }

    async fn cancel(&self, order: &Order) -> BrokerResult<()> {
        let _state = self.state.lock().await;
        info!(pair = %order.pair, "cancelling order");
        self.exchange.cancel(order).await?;

        let mut pending = order.clone();
        pending.status = OrderStatus::PendingCancel;
        pending.updated_at = Utc::now();
        if let Err(err) = self.journal.update_order(&pending) {
            self.notify_error(format!("cancel persistence failed: {err}"));
            return Err(BrokerError::Storage(err.to_string()));
        }
        info!(order = %pending, "order canceled");
        Ok(())
    }
}
