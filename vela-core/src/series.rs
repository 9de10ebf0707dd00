//! Ordered value series and the per-pair dataframe consumed by strategies.

use std::collections::HashMap;
use std::ops::{Index, IndexMut};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Candle, Pair};

/// A time-ordered sequence of values; index 0 in `last` is the most recent.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Series<T>(Vec<T>);

impl<T: Copy + PartialOrd> Series<T> {
    #[must_use]
    pub fn new() -> Self {
        Self(Vec::new())
    }

    #[must_use]
    pub fn values(&self) -> &[T] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, value: T) {
        self.0.push(value);
    }

    /// The value `position` steps back from the end (0 = most recent).
    ///
    /// Panics when the series holds fewer than `position + 1` values.
    #[must_use]
    pub fn last(&self, position: usize) -> T {
        self.0[self.0.len() - 1 - position]
    }

    /// The trailing `size` values, or the whole series when shorter.
    #[must_use]
    pub fn last_values(&self, size: usize) -> Series<T> {
        let len = self.0.len();
        if len > size {
            Series(self.0[len - size..].to_vec())
        } else {
            self.clone()
        }
    }

    /// True when this series closed above the reference on the latest bar
    /// after being at or below it on the previous bar.
    #[must_use]
    pub fn crossover(&self, reference: &Series<T>) -> bool {
        if self.len() < 2 || reference.len() < 2 {
            return false;
        }
        self.last(0) > reference.last(0) && self.last(1) <= reference.last(1)
    }

    /// Mirror of [`Series::crossover`] with reversed comparisons.
    #[must_use]
    pub fn crossunder(&self, reference: &Series<T>) -> bool {
        if self.len() < 2 || reference.len() < 2 {
            return false;
        }
        self.last(0) <= reference.last(0) && self.last(1) > reference.last(1)
    }

    /// True when the two series crossed in either direction on the latest bar.
    #[must_use]
    pub fn cross(&self, reference: &Series<T>) -> bool {
        self.crossover(reference) || self.crossunder(reference)
    }
}

impl<T> From<Vec<T>> for Series<T> {
    fn from(values: Vec<T>) -> Self {
        Self(values)
    }
}

impl<T> Index<usize> for Series<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        &self.0[index]
    }
}

impl<T> IndexMut<usize> for Series<T> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        &mut self.0[index]
    }
}

impl<T: Copy + PartialOrd> FromIterator<T> for Series<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Per-pair view of the candle history as parallel columns, plus named
/// indicator series under `metadata`.
///
/// Invariant: every column (and every metadata series) has the same length as
/// `time` at any observation point.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Dataframe {
    pub pair: Pair,
    pub open: Series<f64>,
    pub close: Series<f64>,
    pub high: Series<f64>,
    pub low: Series<f64>,
    pub volume: Series<f64>,
    pub time: Vec<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
    pub metadata: HashMap<String, Series<f64>>,
}

impl Dataframe {
    #[must_use]
    pub fn new(pair: impl Into<Pair>) -> Self {
        Self {
            pair: pair.into(),
            open: Series::new(),
            close: Series::new(),
            high: Series::new(),
            low: Series::new(),
            volume: Series::new(),
            time: Vec::new(),
            last_update: None,
            metadata: HashMap::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.time.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// Timestamp of the most recent stored bar.
    #[must_use]
    pub fn last_time(&self) -> Option<DateTime<Utc>> {
        self.time.last().copied()
    }

    /// Fold a candle into the frame: a timestamp equal to the stored tail
    /// overwrites the in-flight slot, a greater one appends. Callers reject
    /// strictly older candles before reaching here.
    pub fn apply(&mut self, candle: &Candle) {
        if self.last_time() == Some(candle.time) {
            let last = self.len() - 1;
            self.open[last] = candle.open;
            self.close[last] = candle.close;
            self.high[last] = candle.high;
            self.low[last] = candle.low;
            self.volume[last] = candle.volume;
            self.time[last] = candle.time;
            for (key, value) in &candle.metadata {
                let series = self.metadata_column(key);
                let last = series.len() - 1;
                series[last] = *value;
            }
        } else {
            self.open.push(candle.open);
            self.close.push(candle.close);
            self.high.push(candle.high);
            self.low.push(candle.low);
            self.volume.push(candle.volume);
            self.time.push(candle.time);
            self.last_update = Some(candle.time);
            for (key, value) in &candle.metadata {
                let len = self.time.len();
                let series = self.metadata_entry(key, len);
                series.push(*value);
            }
        }
    }

    /// Tail sample of the last `positions` bars, metadata included.
    #[must_use]
    pub fn sample(&self, positions: usize) -> Dataframe {
        if self.len() <= positions {
            return self.clone();
        }
        let start = self.len() - positions;
        let mut metadata = HashMap::new();
        for (key, series) in &self.metadata {
            metadata.insert(key.clone(), series.last_values(positions));
        }
        Dataframe {
            pair: self.pair.clone(),
            open: self.open.last_values(positions),
            close: self.close.last_values(positions),
            high: self.high.last_values(positions),
            low: self.low.last_values(positions),
            volume: self.volume.last_values(positions),
            time: self.time[start..].to_vec(),
            last_update: self.last_update,
            metadata,
        }
    }

    // Metadata columns may appear mid-stream; pad with NaN so they stay
    // aligned with the time column.
    fn metadata_entry(&mut self, key: &str, target_len: usize) -> &mut Series<f64> {
        let series = self
            .metadata
            .entry(key.to_string())
            .or_insert_with(Series::new);
        while series.len() + 1 < target_len {
            series.push(f64::NAN);
        }
        series
    }

    fn metadata_column(&mut self, key: &str) -> &mut Series<f64> {
        let len = self.time.len();
        let series = self
            .metadata
            .entry(key.to_string())
            .or_insert_with(Series::new);
        while series.len() < len {
            series.push(f64::NAN);
        }
        series
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candle_at(ts: i64, close: f64) -> Candle {
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

    #[test]
    fn last_is_counted_from_the_end() {
        let series: Series<f64> = vec![1.0, 2.0, 3.0].into();
        assert_eq!(series.last(0), 3.0);
        assert_eq!(series.last(1), 2.0);
        assert_eq!(series.last_values(2).values(), &[2.0, 3.0]);
    }

    #[test]
    fn crossover_excludes_crossunder() {
        let fast: Series<f64> = vec![1.0, 3.0].into();
        let slow: Series<f64> = vec![2.0, 2.0].into();
        assert!(fast.crossover(&slow));
        assert!(!fast.crossunder(&slow));
        assert!(slow.crossunder(&fast));
        assert!(fast.cross(&slow));
    }

    #[test]
    fn crossover_requires_two_bars() {
        let fast: Series<f64> = vec![3.0].into();
        let slow: Series<f64> = vec![2.0].into();
        assert!(!fast.crossover(&slow));
    }

    #[test]
    fn apply_appends_and_overwrites() {
        let mut df = Dataframe::new("BTCUSDT");
        df.apply(&candle_at(60, 10.0));
        df.apply(&candle_at(120, 11.0));
        assert_eq!(df.len(), 2);

        // Same timestamp replaces the in-flight bar.
        df.apply(&candle_at(120, 12.5));
        assert_eq!(df.len(), 2);
        assert_eq!(df.close.last(0), 12.5);
    }

    #[test]
    fn apply_tracks_metadata_columns() {
        let mut df = Dataframe::new("BTCUSDT");
        df.apply(&candle_at(60, 10.0));

        let mut with_meta = candle_at(120, 11.0);
        with_meta.metadata.insert("rsi".into(), 55.0);
        df.apply(&with_meta);

        let rsi = &df.metadata["rsi"];
        assert_eq!(rsi.len(), 2);
        assert!(rsi.last(1).is_nan());
        assert_eq!(rsi.last(0), 55.0);
    }

    #[test]
    fn sample_keeps_tail() {
        let mut df = Dataframe::new("BTCUSDT");
        for i in 0..5 {
            df.apply(&candle_at(60 * (i + 1), i as f64));
        }
        let sample = df.sample(3);
        assert_eq!(sample.len(), 3);
        assert_eq!(sample.close.values(), &[2.0, 3.0, 4.0]);
        assert_eq!(sample.time.len(), 3);
    }
}
