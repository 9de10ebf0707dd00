//! Publish/subscribe fan-out of order updates to observers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use vela_core::Order;

/// Observer of order lifecycle events (notifier, charts, statistics).
#[async_trait]
pub trait OrderSubscriber: Send + Sync {
    async fn on_order(&self, order: Order);
}

struct PairChannel {
    sender: mpsc::UnboundedSender<Order>,
    receiver: Option<mpsc::UnboundedReceiver<Order>>,
    subscribers: Vec<Arc<dyn OrderSubscriber>>,
}

/// Per-pair order channels; one dispatcher task per subscribed pair drains
/// the channel to its observers once started.
#[derive(Default)]
pub struct OrderFeed {
    channels: Mutex<HashMap<String, PairChannel>>,
}

impl OrderFeed {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer for a pair, creating its channel when absent.
    pub fn subscribe(&self, pair: &str, subscriber: Arc<dyn OrderSubscriber>) {
        let mut channels = self.channels.lock().expect("order feed poisoned");
        let channel = channels.entry(pair.to_string()).or_insert_with(|| {
            let (sender, receiver) = mpsc::unbounded_channel();
            PairChannel {
                sender,
                receiver: Some(receiver),
                subscribers: Vec::new(),
            }
        });
        channel.subscribers.push(subscriber);
    }

    /// Publish an order update. Pairs without subscribers are skipped.
    pub fn publish(&self, order: Order) {
        let channels = self.channels.lock().expect("order feed poisoned");
        if let Some(channel) = channels.get(&order.pair) {
            debug!(pair = %order.pair, status = %order.status, "publishing order");
            let _ = channel.sender.send(order);
        }
    }

    /// Spawn the dispatcher task of every subscribed pair.
    pub fn start(&self) {
        let mut channels = self.channels.lock().expect("order feed poisoned");
        for (pair, channel) in channels.iter_mut() {
            let Some(mut receiver) = channel.receiver.take() else {
                continue;
            };
            let subscribers = channel.subscribers.clone();
            let pair = pair.clone();
            tokio::spawn(async move {
                while let Some(order) = receiver.recv().await {
                    for subscriber in &subscribers {
                        subscriber.on_order(order.clone()).await;
                    }
                }
                debug!(pair, "order feed dispatcher finished");
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use vela_core::{OrderStatus, OrderType, Side};

    struct CountingSubscriber {
        seen: Mutex<Vec<Order>>,
    }

    #[async_trait]
    impl OrderSubscriber for CountingSubscriber {
        async fn on_order(&self, order: Order) {
            self.seen.lock().unwrap().push(order);
        }
    }

    fn order(pair: &str) -> Order {
        Order {
            id: 1,
            exchange_id: 1,
            pair: pair.into(),
            side: Side::Buy,
            order_type: OrderType::Market,
            status: OrderStatus::Filled,
            price: 10.0,
            quantity: 1.0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            stop: None,
            group_id: None,
            ref_price: 10.0,
            profit_pct: 0.0,
            profit_value: 0.0,
        }
    }

    #[tokio::test]
    async fn delivers_to_subscribers_of_the_pair() {
        let feed = OrderFeed::new();
        let subscriber = Arc::new(CountingSubscriber {
            seen: Mutex::new(Vec::new()),
        });
        feed.subscribe("BTCUSDT", subscriber.clone());
        feed.start();

        feed.publish(order("BTCUSDT"));
        // No channel for this pair: dropped silently.
        feed.publish(order("ETHUSDT"));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let seen = subscriber.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].pair, "BTCUSDT");
    }
}
