//! Reference moving-average crossover strategy.

use async_trait::async_trait;
use tracing::error;

use vela_broker::Broker;
use vela_core::{Dataframe, Side, TimeFrame};

use crate::indicators::{ema, sma};
use crate::{ChartIndicator, IndicatorMetric, MetricStyle, Strategy};

/// Buys the full quote balance when the fast EMA crosses over the slow SMA
/// and liquidates the position on the cross under.
pub struct CrossSma {
    timeframe: TimeFrame,
    fast_period: usize,
    slow_period: usize,
    /// Minimum quote balance required before entering a trade.
    min_quote: f64,
}

impl CrossSma {
    #[must_use]
    pub fn new(timeframe: TimeFrame, fast_period: usize, slow_period: usize) -> Self {
        Self {
            timeframe,
            fast_period,
            slow_period,
            min_quote: 10.0,
        }
    }
}

impl Default for CrossSma {
    fn default() -> Self {
        Self::new(TimeFrame::FourHours, 8, 21)
    }
}

#[async_trait]
impl Strategy for CrossSma {
    fn timeframe(&self) -> TimeFrame {
        self.timeframe
    }

    fn warmup_period(&self) -> usize {
        self.slow_period + 1
    }

    fn indicators(&self, dataframe: &mut Dataframe) -> Vec<ChartIndicator> {
        let fast = ema(&dataframe.close, self.fast_period);
        let slow = sma(&dataframe.close, self.slow_period);
        dataframe.metadata.insert("ema_fast".into(), fast.clone());
        dataframe.metadata.insert("sma_slow".into(), slow.clone());

        vec![ChartIndicator {
            overlay: true,
            group_name: "MA's".into(),
            time: dataframe.time.clone(),
            warmup: self.slow_period,
            metrics: vec![
                IndicatorMetric {
                    name: format!("EMA {}", self.fast_period),
                    color: "red".into(),
                    style: MetricStyle::Line,
                    values: fast,
                },
                IndicatorMetric {
                    name: format!("SMA {}", self.slow_period),
                    color: "blue".into(),
                    style: MetricStyle::Line,
                    values: slow,
                },
            ],
        }]
    }

    async fn on_candle(&self, dataframe: &Dataframe, broker: &dyn Broker) {
        let close = dataframe.close.last(0);
        let (asset_position, quote_position) = match broker.position(&dataframe.pair).await {
            Ok(position) => position,
            Err(err) => {
                error!(pair = %dataframe.pair, %err, "position lookup failed");
                return;
            }
        };

        let fast = &dataframe.metadata["ema_fast"];
        let slow = &dataframe.metadata["sma_slow"];

        if quote_position >= self.min_quote && fast.crossover(slow) {
            let amount = quote_position / close;
            if let Err(err) = broker
                .create_order_market(Side::Buy, &dataframe.pair, amount)
                .await
            {
                error!(pair = %dataframe.pair, %err, "entry order failed");
            }
            return;
        }

        if asset_position > 0.0 && fast.crossunder(slow) {
            if let Err(err) = broker
                .create_order_market(Side::Sell, &dataframe.pair, asset_position)
                .await
            {
                error!(pair = %dataframe.pair, %err, "exit order failed");
            }
        }
    }
}
