//! CSV-backed historical feed with timeframe resampling.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use csv::ReaderBuilder;
use tracing::debug;

use vela_broker::{BrokerError, BrokerResult, CandleSubscription, Feeder};
use vela_core::{
    split_asset_quote, AssetInfo, Candle, HeikinAshi, Price, TimeFrame,
};

const REQUIRED_COLUMNS: [&str; 6] = ["time", "open", "close", "low", "high", "volume"];

/// One CSV input bound to a pair and its source timeframe.
#[derive(Clone, Debug)]
pub struct PairFeed {
    pub pair: String,
    pub file: PathBuf,
    pub timeframe: TimeFrame,
    /// Replace raw bars with their Heikin-Ashi smoothed form.
    pub heikin_ashi: bool,
}

impl PairFeed {
    pub fn new(pair: impl Into<String>, file: impl Into<PathBuf>, timeframe: TimeFrame) -> Self {
        Self {
            pair: pair.into(),
            file: file.into(),
            timeframe,
            heikin_ashi: false,
        }
    }
}

/// Historical feed serving per-`(pair, timeframe)` candle caches loaded from
/// CSV files, including a series resampled to the strategy's timeframe.
pub struct CsvFeed {
    feeds: HashMap<String, PairFeed>,
    candles: Mutex<HashMap<String, Vec<Candle>>>,
}

fn feed_key(pair: &str, timeframe: TimeFrame) -> String {
    format!("{pair}--{timeframe}")
}

impl CsvFeed {
    /// Load every input file and resample each series to `target_timeframe`.
    pub fn new(target_timeframe: TimeFrame, feeds: Vec<PairFeed>) -> Result<Self> {
        let mut candle_map = HashMap::new();
        let mut feed_map = HashMap::new();
        for feed in feeds {
            let candles = load_file(&feed)
                .with_context(|| format!("failed to load candles from {}", feed.file.display()))?;
            debug!(
                pair = %feed.pair,
                timeframe = %feed.timeframe,
                rows = candles.len(),
                "loaded csv feed"
            );
            let resampled = resample(&candles, feed.timeframe, target_timeframe);
            candle_map.insert(feed_key(&feed.pair, feed.timeframe), candles);
            candle_map.insert(feed_key(&feed.pair, target_timeframe), resampled);
            feed_map.insert(feed.pair.clone(), feed);
        }
        Ok(Self {
            feeds: feed_map,
            candles: Mutex::new(candle_map),
        })
    }

    /// Restrict every cached series to the trailing `duration` window.
    #[must_use]
    pub fn limit(self, duration: Duration) -> Self {
        {
            let mut candles = self.candles.lock().expect("csv feed poisoned");
            for series in candles.values_mut() {
                let Some(last) = series.last() else { continue };
                let start = last.time - duration;
                series.retain(|candle| candle.time > start);
            }
        }
        self
    }

    #[must_use]
    pub fn pairs(&self) -> Vec<String> {
        self.feeds.keys().cloned().collect()
    }
}

/// Persist candles in the loader's column order, header included.
pub fn write_csv(path: impl AsRef<std::path::Path>, candles: &[Candle]) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .from_path(path.as_ref())
        .with_context(|| format!("failed to create {}", path.as_ref().display()))?;
    writer.write_record(REQUIRED_COLUMNS)?;
    for candle in candles {
        writer.write_record([
            candle.time.timestamp().to_string(),
            candle.open.to_string(),
            candle.close.to_string(),
            candle.low.to_string(),
            candle.high.to_string(),
            candle.volume.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn load_file(feed: &PairFeed) -> Result<Vec<Candle>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(&feed.file)
        .with_context(|| format!("failed to open {}", feed.file.display()))?;

    let mut rows = reader.records();
    let first = rows
        .next()
        .ok_or_else(|| anyhow!("empty csv file {}", feed.file.display()))?
        .context("invalid first row")?;

    // The first row is a header iff its first token is not numeric.
    let mut columns: HashMap<String, usize> = REQUIRED_COLUMNS
        .iter()
        .enumerate()
        .map(|(idx, name)| (name.to_string(), idx))
        .collect();
    let mut extra_columns = Vec::new();
    let has_header = first
        .get(0)
        .map(|token| token.trim().parse::<i64>().is_err())
        .unwrap_or(false);
    let mut records = Vec::new();
    if has_header {
        columns.clear();
        for (idx, name) in first.iter().enumerate() {
            let name = name.trim().to_string();
            if !REQUIRED_COLUMNS.contains(&name.as_str()) {
                extra_columns.push(name.clone());
            }
            columns.insert(name, idx);
        }
        for required in REQUIRED_COLUMNS {
            if !columns.contains_key(required) {
                bail!("missing column '{required}' in {}", feed.file.display());
            }
        }
    } else {
        records.push(first);
    }
    for row in rows {
        records.push(row.context("invalid csv row")?);
    }

    let mut candles = Vec::with_capacity(records.len());
    let mut ha = HeikinAshi::new();
    for record in &records {
        let field = |name: &str| -> Result<&str> {
            let idx = columns[name];
            record
                .get(idx)
                .ok_or_else(|| anyhow!("missing '{name}' value in {}", feed.file.display()))
        };
        let timestamp: i64 = field("time")?
            .trim()
            .parse()
            .context("invalid unix timestamp")?;
        let time = Utc
            .timestamp_opt(timestamp, 0)
            .single()
            .ok_or_else(|| anyhow!("timestamp {timestamp} out of range"))?;

        let parse = |name: &str| -> Result<f64> {
            field(name)?
                .trim()
                .parse()
                .with_context(|| format!("invalid '{name}' value at {time}"))
        };
        let mut candle = Candle {
            pair: feed.pair.clone(),
            time,
            updated_at: time,
            open: parse("open")?,
            close: parse("close")?,
            low: parse("low")?,
            high: parse("high")?,
            volume: parse("volume")?,
            complete: true,
            metadata: HashMap::new(),
        };
        for name in &extra_columns {
            candle.metadata.insert(name.clone(), parse(name)?);
        }
        if feed.heikin_ashi {
            candle = candle.to_heikin_ashi(&mut ha);
        }
        candles.push(candle);
    }
    Ok(candles)
}

/// Derive a coarser series: running bars of a target period merge open, high,
/// low and volume, and only the final sub-bar carries `complete = true`.
fn resample(source: &[Candle], source_tf: TimeFrame, target_tf: TimeFrame) -> Vec<Candle> {
    let mut start = 0;
    while start < source.len() && !target_tf.opens_at(source[start].time, source_tf) {
        start += 1;
    }

    let mut candles: Vec<Candle> = Vec::with_capacity(source.len() - start);
    for bar in &source[start..] {
        let mut candle = bar.clone();
        candle.complete = target_tf.closes_at(candle.time, source_tf);
        if let Some(previous) = candles.last() {
            if !previous.complete {
                candle.time = previous.time;
                candle.open = previous.open;
                candle.high = previous.high.max(candle.high);
                candle.low = previous.low.min(candle.low);
                candle.volume += previous.volume;
            }
        }
        candles.push(candle);
    }

    if candles.last().is_some_and(|candle| !candle.complete) {
        candles.pop();
    }
    candles
}

#[async_trait]
impl Feeder for CsvFeed {
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

    async fn last_quote(&self, _pair: &str) -> BrokerResult<Price> {
        Err(BrokerError::FeedUnavailable(
            "csv feed has no live quotes".into(),
        ))
    }

    async fn candles_by_period(
        &self,
        pair: &str,
        timeframe: TimeFrame,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> BrokerResult<Vec<Candle>> {
        let candles = self.candles.lock().expect("csv feed poisoned");
        Ok(candles
            .get(&feed_key(pair, timeframe))
            .map(|series| {
                series
                    .iter()
                    .filter(|candle| candle.time >= start && candle.time <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn candles_by_limit(
        &self,
        pair: &str,
        timeframe: TimeFrame,
        limit: usize,
    ) -> BrokerResult<Vec<Candle>> {
        let mut candles = self.candles.lock().expect("csv feed poisoned");
        let series = candles
            .get_mut(&feed_key(pair, timeframe))
            .ok_or_else(|| BrokerError::InsufficientData(pair.to_string()))?;
        if series.len() < limit {
            return Err(BrokerError::InsufficientData(pair.to_string()));
        }
        // The warm-up window is consumed so a later subscription starts
        // right after it.
        Ok(series.drain(..limit).collect())
    }

    async fn candles_subscription(
        &self,
        pair: &str,
        timeframe: TimeFrame,
    ) -> BrokerResult<CandleSubscription> {
        let series = {
            let candles = self.candles.lock().expect("csv feed poisoned");
            candles
                .get(&feed_key(pair, timeframe))
                .cloned()
                .unwrap_or_default()
        };
        let (candle_tx, candle_rx) = tokio::sync::mpsc::channel(512);
        let (_error_tx, error_rx) = tokio::sync::mpsc::channel(1);
        tokio::spawn(async move {
            for candle in series {
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_fixture(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn hourly_rows() -> String {
        // Four complete 1h candles starting at 00:00 UTC.
        let mut rows = String::new();
        let opens = [10.0, 11.0, 12.0, 13.0];
        let highs = [12.0, 14.0, 13.0, 15.0];
        let lows = [9.0, 10.0, 11.0, 12.0];
        let closes = [11.0, 12.0, 13.0, 14.0];
        for i in 0..4 {
            rows.push_str(&format!(
                "{},{},{},{},{},1\n",
                1_641_600_000 + i * 3600,
                opens[i as usize],
                closes[i as usize],
                lows[i as usize],
                highs[i as usize],
            ));
        }
        rows
    }

    #[tokio::test]
    async fn loads_headerless_file() {
        let file = write_fixture("1641600000,10,11,9,12,5\n1641603600,11,12,10,14,6\n");
        let feed = CsvFeed::new(
            TimeFrame::OneHour,
            vec![PairFeed::new("BTCUSDT", file.path(), TimeFrame::OneHour)],
        )
        .unwrap();
        let candles = feed
            .candles_by_limit("BTCUSDT", TimeFrame::OneHour, 2)
            .await
            .unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].open, 10.0);
        assert_eq!(candles[0].close, 11.0);
        assert_eq!(candles[0].low, 9.0);
        assert_eq!(candles[0].high, 12.0);
        assert_eq!(candles[0].volume, 5.0);
        assert!(candles[0].complete);
    }

    #[tokio::test]
    async fn header_columns_in_any_order_plus_metadata() {
        let file = write_fixture(
            "open,close,low,high,volume,time,rsi\n10,11,9,12,5,1641600000,61.5\n",
        );
        let feed = CsvFeed::new(
            TimeFrame::OneHour,
            vec![PairFeed::new("BTCUSDT", file.path(), TimeFrame::OneHour)],
        )
        .unwrap();
        let candles = feed
            .candles_by_limit("BTCUSDT", TimeFrame::OneHour, 1)
            .await
            .unwrap();
        assert_eq!(candles[0].open, 10.0);
        assert_eq!(candles[0].metadata["rsi"], 61.5);
    }

    #[test]
    fn missing_required_column_is_fatal() {
        let file = write_fixture("time,open,close,low,high\n1641600000,10,11,9,12\n");
        let result = CsvFeed::new(
            TimeFrame::OneHour,
            vec![PairFeed::new("BTCUSDT", file.path(), TimeFrame::OneHour)],
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn resamples_one_hour_to_four_hours() {
        let file = write_fixture(&hourly_rows());
        let feed = CsvFeed::new(
            TimeFrame::FourHours,
            vec![PairFeed::new("BTCUSDT", file.path(), TimeFrame::OneHour)],
        )
        .unwrap();

        let candles = feed
            .candles_by_period(
                "BTCUSDT",
                TimeFrame::FourHours,
                Utc.timestamp_opt(0, 0).unwrap(),
                Utc.timestamp_opt(2_000_000_000, 0).unwrap(),
            )
            .await
            .unwrap();
        let closed = candles.last().unwrap();
        assert!(closed.complete);
        assert_eq!(closed.open, 10.0);
        assert_eq!(closed.high, 15.0);
        assert_eq!(closed.low, 9.0);
        assert_eq!(closed.close, 14.0);
        assert_eq!(closed.volume, 4.0);
        assert_eq!(closed.time, Utc.timestamp_opt(1_641_600_000, 0).unwrap());
        // Intermediate bars of the running period stay partial.
        assert!(candles[..candles.len() - 1].iter().all(|c| !c.complete));
    }

    #[tokio::test]
    async fn candles_by_limit_drains_the_window() {
        let file = write_fixture(&hourly_rows());
        let feed = CsvFeed::new(
            TimeFrame::OneHour,
            vec![PairFeed::new("BTCUSDT", file.path(), TimeFrame::OneHour)],
        )
        .unwrap();
        let warmup = feed
            .candles_by_limit("BTCUSDT", TimeFrame::OneHour, 3)
            .await
            .unwrap();
        assert_eq!(warmup.len(), 3);

        let mut sub = feed
            .candles_subscription("BTCUSDT", TimeFrame::OneHour)
            .await
            .unwrap();
        let next = sub.candles.recv().await.unwrap();
        assert_eq!(next.open, 13.0);
        assert!(sub.candles.recv().await.is_none());
    }

    #[tokio::test]
    async fn candles_by_limit_requires_enough_rows() {
        let file = write_fixture(&hourly_rows());
        let feed = CsvFeed::new(
            TimeFrame::OneHour,
            vec![PairFeed::new("BTCUSDT", file.path(), TimeFrame::OneHour)],
        )
        .unwrap();
        let err = feed
            .candles_by_limit("BTCUSDT", TimeFrame::OneHour, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InsufficientData(_)));
    }

    #[tokio::test]
    async fn write_then_read_is_identity() {
        let source = write_fixture(&hourly_rows());
        let feed = CsvFeed::new(
            TimeFrame::OneHour,
            vec![PairFeed::new("BTCUSDT", source.path(), TimeFrame::OneHour)],
        )
        .unwrap();
        let original = feed
            .candles_by_limit("BTCUSDT", TimeFrame::OneHour, 4)
            .await
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roundtrip.csv");
        write_csv(&path, &original).unwrap();

        let reloaded = CsvFeed::new(
            TimeFrame::OneHour,
            vec![PairFeed::new("BTCUSDT", &path, TimeFrame::OneHour)],
        )
        .unwrap()
        .candles_by_limit("BTCUSDT", TimeFrame::OneHour, 4)
        .await
        .unwrap();
        assert_eq!(original, reloaded);
    }

    #[tokio::test]
    async fn limit_keeps_the_trailing_window() {
        let file = write_fixture(&hourly_rows());
        let feed = CsvFeed::new(
            TimeFrame::OneHour,
            vec![PairFeed::new("BTCUSDT", file.path(), TimeFrame::OneHour)],
        )
        .unwrap()
        .limit(Duration::hours(2));
        let candles = feed
            .candles_by_limit("BTCUSDT", TimeFrame::OneHour, 2)
            .await
            .unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].open, 12.0);
    }
}
