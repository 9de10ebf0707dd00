//! Candle pipeline: ingest from heterogeneous feeds, fan-out to consumers and
//! chronological ordering for the bot run loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use vela_broker::Feeder;
use vela_core::{Candle, TimeFrame};

pub mod csv;
pub mod queue;

pub use crate::csv::{CsvFeed, PairFeed};
pub use crate::queue::CandleQueue;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Consumer of candle events delivered by the data feed.
#[async_trait]
pub trait CandleSink: Send + Sync {
    async fn on_candle(&self, candle: Candle);
}

struct Subscription {
    on_candle_close: bool,
    consumer: Arc<dyn CandleSink>,
}

/// Manages candle subscriptions for one venue: registration, warm-up replay
/// and one reader task per `(pair, timeframe)` stream.
pub struct DataFeedSubscription {
    feeder: Arc<dyn Feeder>,
    feeds: Vec<(String, TimeFrame)>,
    subscriptions: HashMap<String, Vec<Subscription>>,
}

fn feed_key(pair: &str, timeframe: TimeFrame) -> String {
    format!("{pair}--{timeframe}")
}

impl DataFeedSubscription {
    #[must_use]
    pub fn new(feeder: Arc<dyn Feeder>) -> Self {
        Self {
            feeder,
            feeds: Vec::new(),
            subscriptions: HashMap::new(),
        }
    }

    /// Register a consumer for `(pair, timeframe)`. When `on_candle_close` is
    /// set, partial candles are suppressed for this consumer.
    pub fn subscribe(
        &mut self,
        pair: &str,
        timeframe: TimeFrame,
        consumer: Arc<dyn CandleSink>,
        on_candle_close: bool,
    ) {
        let key = feed_key(pair, timeframe);
        if !self.feeds.iter().any(|(p, tf)| p == pair && *tf == timeframe) {
            self.feeds.push((pair.to_string(), timeframe));
        }
        self.subscriptions.entry(key).or_default().push(Subscription {
            on_candle_close,
            consumer,
        });
    }

    /// Replay a bootstrap batch synchronously to every registered consumer
    /// before streaming begins. Only complete bars are delivered.
    pub async fn preload(&self, pair: &str, timeframe: TimeFrame, candles: &[Candle]) {
        info!(
            pair,
            timeframe = %timeframe,
            count = candles.len(),
            "preloading candles"
        );
        let key = feed_key(pair, timeframe);
        let Some(subscriptions) = self.subscriptions.get(&key) else {
            return;
        };
        for candle in candles {
            if !candle.complete {
                continue;
            }
            for subscription in subscriptions {
                subscription.consumer.on_candle(candle.clone()).await;
            }
        }
    }

    /// Connect every registered feed and spawn its reader task.
    ///
    /// With `load_sync` (backtest) each reader performs a single pass and
    /// terminates when its stream ends. Otherwise the stream is supervised:
    /// disconnects and errors are logged and the subscription reconnects with
    /// exponential backoff (100ms doubling up to 1s, reset on success).
    pub fn start(mut self, load_sync: bool, shutdown: watch::Receiver<bool>) -> FeedHandle {
        let mut tasks = Vec::new();
        for (pair, timeframe) in std::mem::take(&mut self.feeds) {
            let key = feed_key(&pair, timeframe);
            let subscriptions = self.subscriptions.remove(&key).unwrap_or_default();
            let feeder = Arc::clone(&self.feeder);
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(run_feed(
                feeder,
                pair,
                timeframe,
                subscriptions,
                load_sync,
                shutdown,
            )));
        }
        info!("data feed connected");
        FeedHandle { tasks }
    }
}

/// Join handle over the spawned feed reader tasks.
pub struct FeedHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl FeedHandle {
    /// Wait for every reader to finish (backtest mode: streams are finite).
    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }

    /// Abort all reader tasks.
    pub fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn run_feed(
    feeder: Arc<dyn Feeder>,
    pair: String,
    timeframe: TimeFrame,
    subscriptions: Vec<Subscription>,
    load_sync: bool,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match feeder.candles_subscription(&pair, timeframe).await {
            Ok(mut stream) => {
                let mut errors_open = true;
                loop {
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                return;
                            }
                        }
                        candle = stream.candles.recv() => match candle {
                            Some(candle) => {
                                backoff = INITIAL_BACKOFF;
                                for subscription in &subscriptions {
                                    if subscription.on_candle_close && !candle.complete {
                                        continue;
                                    }
                                    subscription.consumer.on_candle(candle.clone()).await;
                                }
                            }
                            None => break,
                        },
                        err = stream.errors.recv(), if errors_open => match err {
                            Some(err) => error!(pair, %err, "data feed stream error"),
                            None => errors_open = false,
                        },
                    }
                }
            }
            Err(err) => error!(pair, %err, "data feed subscription failed"),
        }

        if load_sync || *shutdown.borrow() {
            return;
        }
        warn!(
            pair,
            backoff_ms = backoff.as_millis() as u64,
            "data feed disconnected, reconnecting"
        );
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chrono::{TimeZone, Utc};
    use vela_broker::{BrokerError, BrokerResult, CandleSubscription};
    use vela_core::AssetInfo;

    struct RecordingSink {
        seen: Mutex<Vec<Candle>>,
    }

    #[async_trait]
    impl CandleSink for RecordingSink {
        async fn on_candle(&self, candle: Candle) {
            self.seen.lock().unwrap().push(candle);
        }
    }

    struct ScriptedFeeder {
        candles: Vec<Candle>,
    }

    #[async_trait]
    impl Feeder for ScriptedFeeder {
        fn assets_info(&self, _pair: &str) -> AssetInfo {
            unimplemented!("not used in feed tests")
        }

        async fn last_quote(&self, _pair: &str) -> BrokerResult<f64> {
            Err(BrokerError::FeedUnavailable("scripted".into()))
        }

        async fn candles_by_period(
            &self,
            _pair: &str,
            _timeframe: TimeFrame,
            _start: chrono::DateTime<Utc>,
            _end: chrono::DateTime<Utc>,
        ) -> BrokerResult<Vec<Candle>> {
            Ok(self.candles.clone())
        }

        async fn candles_by_limit(
            &self,
            _pair: &str,
            _timeframe: TimeFrame,
            limit: usize,
        ) -> BrokerResult<Vec<Candle>> {
            Ok(self.candles.iter().take(limit).cloned().collect())
        }

        async fn candles_subscription(
            &self,
            _pair: &str,
            _timeframe: TimeFrame,
        ) -> BrokerResult<CandleSubscription> {
            let (candle_tx, candle_rx) = tokio::sync::mpsc::channel(16);
            let (_error_tx, error_rx) = tokio::sync::mpsc::channel(1);
            let candles = self.candles.clone();
            tokio::spawn(async move {
                for candle in candles {
                    if candle_tx.send(candle).await.is_err() {
                        break;
                    }
                }
            });
            Ok(CandleSubscription {
                candles: candle_rx,
                errors: error_rx,
            })
        }
    }

    fn candle(ts: i64, complete: bool) -> Candle {
        Candle {
            pair: "BTCUSDT".into(),
            time: Utc.timestamp_opt(ts, 0).unwrap(),
            updated_at: Utc.timestamp_opt(ts, 0).unwrap(),
            complete,
            ..Candle::default()
        }
    }

    fn completes(sink: &RecordingSink) -> Vec<bool> {
        sink.seen.lock().unwrap().iter().map(|c| c.complete).collect()
    }

    #[tokio::test]
    async fn dispatches_and_suppresses_partial_candles() {
        let feeder = Arc::new(ScriptedFeeder {
            candles: vec![candle(60, false), candle(60, true), candle(120, true)],
        });
        let mut feed = DataFeedSubscription::new(feeder);
        let all = Arc::new(RecordingSink {
            seen: Mutex::new(Vec::new()),
        });
        let closed_only = Arc::new(RecordingSink {
            seen: Mutex::new(Vec::new()),
        });
        feed.subscribe("BTCUSDT", TimeFrame::OneMinute, all.clone(), false);
        feed.subscribe("BTCUSDT", TimeFrame::OneMinute, closed_only.clone(), true);

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        feed.start(true, shutdown_rx).join().await;

        assert_eq!(completes(&all), vec![false, true, true]);
        assert_eq!(completes(&closed_only), vec![true, true]);
    }

    #[tokio::test]
    async fn preload_replays_only_complete_bars() {
        let feeder = Arc::new(ScriptedFeeder { candles: vec![] });
        let mut feed = DataFeedSubscription::new(feeder);
        let sink = Arc::new(RecordingSink {
            seen: Mutex::new(Vec::new()),
        });
        feed.subscribe("BTCUSDT", TimeFrame::OneMinute, sink.clone(), false);

        feed.preload(
            "BTCUSDT",
            TimeFrame::OneMinute,
            &[candle(60, true), candle(120, false), candle(180, true)],
        )
        .await;

        assert_eq!(sink.seen.lock().unwrap().len(), 2);
    }
}
