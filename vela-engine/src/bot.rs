//! Bot orchestrator: wires feeds, strategy controllers, the order controller
//! and the chronological queue into a single run loop.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indicatif::ProgressBar;
use itertools::Itertools;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;

use vela_broker::{Broker, BrokerResult, CandleSubscription, Exchange, Feeder};
use vela_core::{split_asset_quote, AssetInfo, Candle, Price, TimeFrame};
use vela_feed::{CandleQueue, CandleSink, DataFeedSubscription};
use vela_journal::{Journal, SqliteJournal};
use vela_metrics::{bootstrap, mean, payoff, profit_factor};
use vela_paper::PaperWallet;
use vela_strategy::{Strategy, StrategyController};

use crate::controller::{Notifier, NotifierSubscriber, OrderController};
use crate::order_feed::{OrderFeed, OrderSubscriber};

const DEFAULT_DATABASE: &str = "vela.db";
const BOOTSTRAP_ITERATIONS: usize = 10_000;
const BOOTSTRAP_CONFIDENCE: f64 = 0.95;
const BOOTSTRAP_SEED: u64 = 0x76656c61;

/// Static bot configuration.
#[derive(Clone, Debug, Default)]
pub struct Settings {
    pub pairs: Vec<String>,
}

/// Verbosity of the installed log subscriber.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    fn filter(self) -> LevelFilter {
        match self {
            Self::Debug => LevelFilter::DEBUG,
            Self::Info => LevelFilter::INFO,
            Self::Warn => LevelFilter::WARN,
            // There is no fatal level; both map to the error filter.
            Self::Error | Self::Fatal => LevelFilter::ERROR,
        }
    }
}

/// Candle consumer pushing into the chronological queue.
struct QueueSink(Arc<CandleQueue>);

#[async_trait]
impl CandleSink for QueueSink {
    async fn on_candle(&self, candle: Candle) {
        self.0.push(candle);
    }
}

/// Feeder view over a shared exchange handle.
struct ExchangeFeeder(Arc<dyn Exchange>);

#[async_trait]
impl Feeder for ExchangeFeeder {
    fn assets_info(&self, pair: &str) -> AssetInfo {
        self.0.assets_info(pair)
    }

    async fn last_quote(&self, pair: &str) -> BrokerResult<Price> {
        self.0.last_quote(pair).await
    }

    async fn candles_by_period(
        &self,
        pair: &str,
        timeframe: TimeFrame,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> BrokerResult<Vec<Candle>> {
        self.0.candles_by_period(pair, timeframe, start, end).await
    }

    async fn candles_by_limit(
        &self,
        pair: &str,
        timeframe: TimeFrame,
        limit: usize,
    ) -> BrokerResult<Vec<Candle>> {
        self.0.candles_by_limit(pair, timeframe, limit).await
    }

    async fn candles_subscription(
        &self,
        pair: &str,
        timeframe: TimeFrame,
    ) -> BrokerResult<CandleSubscription> {
        self.0.candles_subscription(pair, timeframe).await
    }
}

/// Construction options for [`Bot`].
pub struct BotBuilder {
    settings: Settings,
    exchange: Arc<dyn Exchange>,
    strategy: Arc<dyn Strategy>,
    journal: Option<Arc<dyn Journal>>,
    paper_wallet: Option<Arc<PaperWallet>>,
    backtest: bool,
    notifier: Option<Arc<dyn Notifier>>,
    candle_subscribers: Vec<Arc<dyn CandleSink>>,
    order_subscribers: Vec<Arc<dyn OrderSubscriber>>,
    log_level: Option<LogLevel>,
}

impl BotBuilder {
    /// Backtest mode: binds the paper wallet and enables the strict-ordering
    /// drain over pre-enqueued candles.
    #[must_use]
    pub fn with_backtest(mut self, wallet: Arc<PaperWallet>) -> Self {
        self.backtest = true;
        self.paper_wallet = Some(wallet);
        self
    }

    /// Bind a paper wallet for live simulation.
    #[must_use]
    pub fn with_paper_wallet(mut self, wallet: Arc<PaperWallet>) -> Self {
        self.paper_wallet = Some(wallet);
        self
    }

    /// Inject a journal; the default is an on-disk store at `./vela.db`.
    #[must_use]
    pub fn with_storage(mut self, journal: Arc<dyn Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Subscribe a notifier to order events, realized profits and errors.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    #[must_use]
    pub fn with_candle_subscription(mut self, subscriber: Arc<dyn CandleSink>) -> Self {
        self.candle_subscribers.push(subscriber);
        self
    }

    #[must_use]
    pub fn with_order_subscription(mut self, subscriber: Arc<dyn OrderSubscriber>) -> Self {
        self.order_subscribers.push(subscriber);
        self
    }

    #[must_use]
    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = Some(level);
        self
    }

    /// Validate configuration and assemble the bot.
    pub fn build(self) -> anyhow::Result<Bot> {
        if let Some(level) = self.log_level {
            let _ = tracing_subscriber::fmt()
                .with_max_level(level.filter())
                .try_init();
        }

        for pair in &self.settings.pairs {
            if split_asset_quote(pair).is_none() {
                bail!("invalid pair: {pair}");
            }
        }

        let journal = match self.journal {
            Some(journal) => journal,
            None => Arc::new(
                SqliteJournal::open(DEFAULT_DATABASE)
                    .with_context(|| format!("failed to open journal {DEFAULT_DATABASE}"))?,
            ),
        };

        let order_feed = Arc::new(OrderFeed::new());
        let controller = Arc::new(OrderController::new(
            self.exchange.clone(),
            journal,
            order_feed.clone(),
        ));
        let data_feed =
            DataFeedSubscription::new(Arc::new(ExchangeFeeder(self.exchange.clone())));
        let (shutdown, _) = watch::channel(false);

        Ok(Bot {
            settings: self.settings,
            exchange: self.exchange,
            strategy: self.strategy,
            paper_wallet: self.paper_wallet,
            backtest: self.backtest,
            controller,
            order_feed,
            data_feed: Some(data_feed),
            queue: Arc::new(CandleQueue::new()),
            strategy_controllers: HashMap::new(),
            candle_subscribers: self.candle_subscribers,
            order_subscribers: self.order_subscribers,
            notifier: self.notifier,
            shutdown,
        })
    }
}

/// The trading bot: one strategy over a set of pairs against one exchange.
pub struct Bot {
    settings: Settings,
    exchange: Arc<dyn Exchange>,
    strategy: Arc<dyn Strategy>,
    paper_wallet: Option<Arc<PaperWallet>>,
    backtest: bool,
    controller: Arc<OrderController>,
    order_feed: Arc<OrderFeed>,
    data_feed: Option<DataFeedSubscription>,
    queue: Arc<CandleQueue>,
    strategy_controllers: HashMap<String, StrategyController>,
    candle_subscribers: Vec<Arc<dyn CandleSink>>,
    order_subscribers: Vec<Arc<dyn OrderSubscriber>>,
    notifier: Option<Arc<dyn Notifier>>,
    shutdown: watch::Sender<bool>,
}

impl Bot {
    #[must_use]
    pub fn builder(
        settings: Settings,
        exchange: Arc<dyn Exchange>,
        strategy: Arc<dyn Strategy>,
    ) -> BotBuilder {
        BotBuilder {
            settings,
            exchange,
            strategy,
            journal: None,
            paper_wallet: None,
            backtest: false,
            notifier: None,
            candle_subscribers: Vec::new(),
            order_subscribers: Vec::new(),
            log_level: None,
        }
    }

    /// Broker facade the strategies trade through.
    #[must_use]
    pub fn controller(&self) -> Arc<OrderController> {
        self.controller.clone()
    }

    /// Request cooperative termination of the run loop and all feed tasks.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Initialize strategy controllers, preload warm-up data, start all
    /// background tasks and drive the candle pipeline to completion.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let mut data_feed = self.data_feed.take().context("bot already ran")?;
        let timeframe = self.strategy.timeframe();

        for pair in &self.settings.pairs {
            for subscriber in &self.candle_subscribers {
                data_feed.subscribe(pair, timeframe, subscriber.clone(), false);
            }
        }
        if let Some(notifier) = &self.notifier {
            self.controller.set_notifier(notifier.clone());
            for pair in &self.settings.pairs {
                self.order_feed
                    .subscribe(pair, Arc::new(NotifierSubscriber(notifier.clone())));
            }
        }
        for pair in &self.settings.pairs {
            for subscriber in &self.order_subscribers {
                self.order_feed.subscribe(pair, subscriber.clone());
            }
        }

        for pair in self.settings.pairs.clone() {
            let broker: Arc<dyn Broker> = self.controller.clone();
            let mut controller =
                StrategyController::new(&pair, self.strategy.clone(), broker);

            if !self.backtest {
                // Warm indicators from history before any streaming begins.
                let candles = self
                    .exchange
                    .candles_by_limit(&pair, timeframe, self.strategy.warmup_period())
                    .await
                    .with_context(|| format!("failed to preload warm-up candles for {pair}"))?;
                for candle in &candles {
                    if let Some(wallet) = &self.paper_wallet {
                        wallet.on_candle(candle);
                    }
                    controller.on_partial_candle(candle).await;
                    if candle.complete {
                        controller.on_candle(candle).await;
                        self.controller.on_candle(candle).await;
                    }
                }
                data_feed.preload(&pair, timeframe, &candles).await;
            }

            data_feed.subscribe(
                &pair,
                timeframe,
                Arc::new(QueueSink(self.queue.clone())),
                false,
            );
            controller.start();
            self.strategy_controllers.insert(pair, controller);
        }

        self.order_feed.start();
        self.controller.start();

        if self.backtest {
            // All candles are enqueued before draining, so the pop sequence
            // is strictly ordered by (time, updated_at, pair).
            data_feed.start(true, self.shutdown.subscribe()).join().await;
            self.backtest_candles().await;
        } else {
            let mut drain = self.queue.pop_stream();
            let handle = data_feed.start(false, self.shutdown.subscribe());
            let mut shutdown = self.shutdown.subscribe();
            loop {
                tokio::select! {
                    candle = drain.recv() => match candle {
                        Some(candle) => self.process_candle(&candle).await,
                        None => break,
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            handle.abort();
        }

        self.controller.stop().await;
        Ok(())
    }

    async fn backtest_candles(&mut self) {
        info!("starting backtesting");
        let progress = ProgressBar::new(self.queue.len() as u64);
        while let Some(candle) = self.queue.pop() {
            self.process_candle(&candle).await;
            progress.inc(1);
        }
        progress.finish_and_clear();
    }

    async fn process_candle(&mut self, candle: &Candle) {
        if let Some(wallet) = &self.paper_wallet {
            wallet.on_candle(candle);
        }

        let Some(controller) = self.strategy_controllers.get_mut(&candle.pair) else {
            return;
        };
        controller.on_partial_candle(candle).await;
        if candle.complete {
            controller.on_candle(candle).await;
            self.controller.on_candle(candle).await;
        }
    }

    /// Render all trades, per-pair metrics, bootstrap confidence intervals
    /// and the wallet report.
    pub async fn summary(&self) -> String {
        let results = self.controller.results().await;
        let mut out = String::new();

        let _ = writeln!(
            out,
            "{:<10} {:>7} {:>5} {:>5} {:>8} {:>8} {:>8} {:>6} {:>12} {:>12}",
            "Pair", "Trades", "Win", "Loss", "% Win", "Payoff", "Pr.Fact", "SQN", "Profit", "Volume"
        );
        let mut total_profit = 0.0;
        let mut total_volume = 0.0;
        let mut wins = 0;
        let mut losses = 0;
        let mut weighted_payoff = 0.0;
        let mut weighted_profit_factor = 0.0;
        let mut sqn_sum = 0.0;

        for summary in results.values().sorted_by(|a, b| a.pair.cmp(&b.pair)) {
            let trades = summary.trades();
            let _ = writeln!(
                out,
                "{:<10} {:>7} {:>5} {:>5} {:>7.1}% {:>8.3} {:>8.3} {:>6.1} {:>12.2} {:>12.2}",
                summary.pair,
                trades,
                summary.win().len(),
                summary.lose().len(),
                summary.win_percentage(),
                summary.payoff(),
                summary.profit_factor(),
                summary.sqn(),
                summary.profit(),
                summary.volume,
            );
            total_profit += summary.profit();
            total_volume += summary.volume;
            wins += summary.win().len();
            losses += summary.lose().len();
            weighted_payoff += summary.payoff() * trades as f64;
            weighted_profit_factor += summary.profit_factor() * trades as f64;
            sqn_sum += summary.sqn();
        }

        let trades = wins + losses;
        if trades > 0 {
            let _ = writeln!(
                out,
                "{:<10} {:>7} {:>5} {:>5} {:>7.1}% {:>8.3} {:>8.3} {:>6.1} {:>12.2} {:>12.2}",
                "TOTAL",
                trades,
                wins,
                losses,
                wins as f64 / trades as f64 * 100.0,
                weighted_payoff / trades as f64,
                weighted_profit_factor / trades as f64,
                sqn_sum / results.len().max(1) as f64,
                total_profit,
                total_volume,
            );
        }

        let _ = writeln!(out);
        let _ = writeln!(out, "------ CONFIDENCE INTERVAL (95%) ------");
        for summary in results.values().sorted_by(|a, b| a.pair.cmp(&b.pair)) {
            let returns = summary.returns();
            let return_interval = bootstrap(
                &returns,
                mean,
                BOOTSTRAP_ITERATIONS,
                BOOTSTRAP_CONFIDENCE,
                BOOTSTRAP_SEED,
            );
            let payoff_interval = bootstrap(
                &returns,
                payoff,
                BOOTSTRAP_ITERATIONS,
                BOOTSTRAP_CONFIDENCE,
                BOOTSTRAP_SEED,
            );
            let profit_factor_interval = bootstrap(
                &returns,
                profit_factor,
                BOOTSTRAP_ITERATIONS,
                BOOTSTRAP_CONFIDENCE,
                BOOTSTRAP_SEED,
            );
            let _ = writeln!(out, "| {} |", summary.pair);
            let _ = writeln!(
                out,
                "RETURN:      {:.2}% ({:.2}% ~ {:.2}%)",
                return_interval.mean * 100.0,
                return_interval.lower * 100.0,
                return_interval.upper * 100.0
            );
            let _ = writeln!(
                out,
                "PAYOFF:      {:.2} ({:.2} ~ {:.2})",
                payoff_interval.mean, payoff_interval.lower, payoff_interval.upper
            );
            let _ = writeln!(
                out,
                "PROF.FACTOR: {:.2} ({:.2} ~ {:.2})",
                profit_factor_interval.mean,
                profit_factor_interval.lower,
                profit_factor_interval.upper
            );
        }

        if let Some(wallet) = &self.paper_wallet {
            let _ = writeln!(out);
            out.push_str(&wallet.summary());
        }
        out
    }

    /// Write one returns file per pair into `output_dir`.
    pub async fn save_returns(&self, output_dir: impl AsRef<Path>) -> anyhow::Result<()> {
        let results = self.controller.results().await;
        for summary in results.values() {
            let path = output_dir.as_ref().join(format!("{}.csv", summary.pair));
            summary
                .save_returns(&path)
                .with_context(|| format!("failed to save returns to {}", path.display()))?;
        }
        Ok(())
    }
}
