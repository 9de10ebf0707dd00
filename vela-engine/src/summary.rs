//! Per-pair trade statistics accumulated from realized results.

use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use vela_core::Side;

use crate::position::TradeResult;

/// Win/Lose × Long/Short classification of realized trades, plus the
/// aggregate metrics derived from them.
#[derive(Clone, Debug, Default)]
pub struct Summary {
    pub pair: String,
    win_long: Vec<f64>,
    win_long_pct: Vec<f64>,
    win_short: Vec<f64>,
    win_short_pct: Vec<f64>,
    lose_long: Vec<f64>,
    lose_long_pct: Vec<f64>,
    lose_short: Vec<f64>,
    lose_short_pct: Vec<f64>,
    pub volume: f64,
}

impl Summary {
    #[must_use]
    pub fn new(pair: impl Into<String>) -> Self {
        Self {
            pair: pair.into(),
            ..Self::default()
        }
    }

    /// Slot a realized result into its Win/Lose × Long/Short bucket.
    pub fn add_result(&mut self, result: &TradeResult) {
        let (values, percents) = match (result.profit_pct >= 0.0, result.side) {
            (true, Side::Buy) => (&mut self.win_long, &mut self.win_long_pct),
            (true, Side::Sell) => (&mut self.win_short, &mut self.win_short_pct),
            (false, Side::Buy) => (&mut self.lose_long, &mut self.lose_long_pct),
            (false, Side::Sell) => (&mut self.lose_short, &mut self.lose_short_pct),
        };
        values.push(result.profit_value);
        percents.push(result.profit_pct);
    }

    #[must_use]
    pub fn win(&self) -> Vec<f64> {
        [self.win_long.as_slice(), self.win_short.as_slice()].concat()
    }

    #[must_use]
    pub fn win_percent(&self) -> Vec<f64> {
        [self.win_long_pct.as_slice(), self.win_short_pct.as_slice()].concat()
    }

    #[must_use]
    pub fn lose(&self) -> Vec<f64> {
        [self.lose_long.as_slice(), self.lose_short.as_slice()].concat()
    }

    #[must_use]
    pub fn lose_percent(&self) -> Vec<f64> {
        [self.lose_long_pct.as_slice(), self.lose_short_pct.as_slice()].concat()
    }

    /// All percent returns, wins first.
    #[must_use]
    pub fn returns(&self) -> Vec<f64> {
        [self.win_percent(), self.lose_percent()].concat()
    }

    #[must_use]
    pub fn trades(&self) -> usize {
        self.win_long.len() + self.win_short.len() + self.lose_long.len() + self.lose_short.len()
    }

    #[must_use]
    pub fn profit(&self) -> f64 {
        self.win().iter().sum::<f64>() + self.lose().iter().sum::<f64>()
    }

    #[must_use]
    pub fn win_percentage(&self) -> f64 {
        if self.trades() == 0 {
            return 0.0;
        }
        self.win().len() as f64 / self.trades() as f64 * 100.0
    }

    #[must_use]
    pub fn payoff(&self) -> f64 {
        vela_metrics::payoff(&self.returns())
    }

    #[must_use]
    pub fn profit_factor(&self) -> f64 {
        vela_metrics::profit_factor(&self.returns())
    }

    #[must_use]
    pub fn sqn(&self) -> f64 {
        let profits = [self.win(), self.lose()].concat();
        vela_metrics::sqn(&profits)
    }

    /// Write the percent returns, one per line to four decimals, winning
    /// returns first.
    pub fn save_returns(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        for value in self.win_percent() {
            writeln!(writer, "{value:.4}")?;
        }
        for value in self.lose_percent() {
            writeln!(writer, "{value:.4}")?;
        }
        writer.flush()
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<10} {}", "Coin", self.pair)?;
        writeln!(f, "{:<10} {}", "Trades", self.trades())?;
        writeln!(f, "{:<10} {}", "Win", self.win().len())?;
        writeln!(f, "{:<10} {}", "Loss", self.lose().len())?;
        writeln!(f, "{:<10} {:.1}", "% Win", self.win_percentage())?;
        writeln!(f, "{:<10} {:.3}", "Payoff", self.payoff())?;
        writeln!(f, "{:<10} {:.3}", "Pr.Fact", self.profit_factor())?;
        writeln!(f, "{:<10} {:.1}", "SQN", self.sqn())?;
        writeln!(f, "{:<10} {:.4}", "Profit", self.profit())?;
        writeln!(f, "{:<10} {:.4}", "Volume", self.volume)
    }
}
