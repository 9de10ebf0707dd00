//! Strategy trait definitions, the per-pair controller and reference strategies.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, warn};

use vela_broker::Broker;
use vela_core::{Candle, Dataframe, Series, TimeFrame};

pub mod indicators;

mod cross;
pub use cross::CrossSma;

/// Rendering style for an indicator metric on a chart.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MetricStyle {
    Bar,
    Scatter,
    Line,
    Histogram,
    Waterfall,
}

/// One plotted line/series of a chart indicator.
#[derive(Clone, Debug)]
pub struct IndicatorMetric {
    pub name: String,
    pub color: String,
    pub style: MetricStyle,
    pub values: Series<f64>,
}

/// A named indicator group a strategy exposes for charting.
#[derive(Clone, Debug)]
pub struct ChartIndicator {
    pub time: Vec<chrono::DateTime<chrono::Utc>>,
    pub metrics: Vec<IndicatorMetric>,
    pub overlay: bool,
    pub group_name: String,
    pub warmup: usize,
}

/// Behavioral contract of a user strategy.
///
/// `indicators` runs on every candle once warm-up is met, before the trading
/// hook, and fills `dataframe.metadata` with named series. `on_candle` runs
/// only after the controller has been started, so preloaded history warms the
/// indicators without triggering trades.
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Interval the strategy operates on, e.g. 1h or 1d.
    fn timeframe(&self) -> TimeFrame;

    /// Number of bars required before trading decisions may be taken,
    /// measured in [`Strategy::timeframe`] units.
    fn warmup_period(&self) -> usize;

    /// Compute indicator series over the sampled dataframe.
    fn indicators(&self, dataframe: &mut Dataframe) -> Vec<ChartIndicator>;

    /// Trading hook, invoked after each closed candle.
    async fn on_candle(&self, dataframe: &Dataframe, broker: &dyn Broker);

    /// High-frequency capability: opt in to receive partial candles.
    fn high_frequency(&self) -> bool {
        false
    }

    /// Hook for partial (mid-bar) updates; only called when
    /// [`Strategy::high_frequency`] returns true.
    async fn on_partial_candle(&self, _dataframe: &Dataframe, _broker: &dyn Broker) {}
}

/// Drives one strategy instance over one pair's dataframe.
pub struct StrategyController {
    strategy: Arc<dyn Strategy>,
    broker: Arc<dyn Broker>,
    dataframe: Dataframe,
    started: bool,
}

impl StrategyController {
    #[must_use]
    pub fn new(pair: impl Into<String>, strategy: Arc<dyn Strategy>, broker: Arc<dyn Broker>) -> Self {
        Self {
            strategy,
            broker,
            dataframe: Dataframe::new(pair),
            started: false,
        }
    }

    /// Enable the trading hook. Candles processed before this only warm up
    /// indicators.
    pub fn start(&mut self) {
        self.started = true;
    }

    #[must_use]
    pub fn dataframe(&self) -> &Dataframe {
        &self.dataframe
    }

    /// Mid-bar update: refresh the in-flight slot and invoke the
    /// high-frequency hook when the strategy supports it.
    pub async fn on_partial_candle(&mut self, candle: &Candle) {
        if candle.complete || self.dataframe.close.len() < self.strategy.warmup_period() {
            return;
        }
        if !self.strategy.high_frequency() {
            return;
        }
        self.dataframe.apply(candle);
        self.strategy.indicators(&mut self.dataframe);
        self.strategy
            .on_partial_candle(&self.dataframe, self.broker.as_ref())
            .await;
    }

    /// Closed-bar update: rejects late candles, folds the bar in, and once
    /// warm-up is reached runs indicators (and the trading hook if started)
    /// over a tail sample of exactly the warm-up length.
    pub async fn on_candle(&mut self, candle: &Candle) {
        if let Some(last) = self.dataframe.last_time() {
            if candle.time < last {
                error!(
                    pair = %candle.pair,
                    time = %candle.time,
                    last = %last,
                    "late candle received, dropping"
                );
                return;
            }
        }

        self.dataframe.apply(candle);

        if self.dataframe.close.len() >= self.strategy.warmup_period() {
            let mut sample = self.dataframe.sample(self.strategy.warmup_period());
            self.strategy.indicators(&mut sample);
            if self.started {
                self.strategy.on_candle(&sample, self.broker.as_ref()).await;
            }
        } else {
            warn!(
                pair = %candle.pair,
                have = self.dataframe.close.len(),
                need = self.strategy.warmup_period(),
                "warming up"
            );
        }
    }
}
