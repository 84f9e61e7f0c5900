// =============================================================================
// Candle aggregation
// =============================================================================
//
// Maintains one in-progress candle per (symbol, interval) keyed by an aligned
// open-time, plus a bounded ring of recently closed candles for in-memory
// reads (strategy handlers, backtests). A candle closes exactly when a price
// update lands past its interval boundary; closed candles are immutable and
// are handed back to the caller for persistence.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

/// Supported aggregation intervals as (label, milliseconds).
pub const INTERVALS: &[(&str, i64)] = &[
    ("1m", 60_000),
    ("5m", 300_000),
    ("15m", 900_000),
    ("1h", 3_600_000),
    ("4h", 14_400_000),
    ("1D", 86_400_000),
];

/// Millisecond length of a named interval, if recognised.
pub fn interval_ms(label: &str) -> Option<i64> {
    INTERVALS.iter().find(|(l, _)| *l == label).map(|(_, ms)| *ms)
}

/// One OHLCV bar. `open_time` is aligned to the interval boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub interval: String,
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
struct SeriesKey {
    symbol: String,
    interval: &'static str,
}

/// Multi-interval aggregator with bounded closed-candle retention.
pub struct CandleAggregator {
    current: HashMap<SeriesKey, Candle>,
    closed: HashMap<SeriesKey, VecDeque<Candle>>,
    max_closed: usize,
}

impl CandleAggregator {
    pub fn new(max_closed: usize) -> Self {
        Self {
            current: HashMap::new(),
            closed: HashMap::new(),
            max_closed,
        }
    }

    /// Fold one trade/tick into every interval series for `symbol`.
    ///
    /// Returns the candles that closed as a result of this update, ready for
    /// persistence. The in-progress candle is never returned here.
    pub fn update(&mut self, symbol: &str, price: f64, volume_delta: f64, ts_ms: i64) -> Vec<Candle> {
        let mut rolled = Vec::new();

        for (label, ms) in INTERVALS {
            let open_time = ts_ms - ts_ms.rem_euclid(*ms);
            let key = SeriesKey {
                symbol: symbol.to_string(),
                interval: label,
            };

            match self.current.get_mut(&key) {
                Some(candle) if candle.open_time == open_time => {
                    candle.high = candle.high.max(price);
                    candle.low = candle.low.min(price);
                    candle.close = price;
                    candle.volume += volume_delta;
                }
                Some(candle) => {
                    // Boundary crossed: retire the old bar, open a fresh one.
                    let finished = std::mem::replace(
                        candle,
                        fresh_candle(symbol, label, open_time, price, volume_delta),
                    );
                    self.push_closed(&key, finished.clone());
                    rolled.push(finished);
                }
                None => {
                    self.current.insert(
                        key,
                        fresh_candle(symbol, label, open_time, price, volume_delta),
                    );
                }
            }
        }

        rolled
    }

    /// The in-flight candle for a series, without mutating anything.
    pub fn current(&self, symbol: &str, interval: &str) -> Option<Candle> {
        let label = INTERVALS.iter().find(|(l, _)| *l == interval)?.0;
        self.current
            .get(&SeriesKey {
                symbol: symbol.to_string(),
                interval: label,
            })
            .cloned()
    }

    /// The most recent `count` closed candles, oldest first.
    pub fn recent_closed(&self, symbol: &str, interval: &str, count: usize) -> Vec<Candle> {
        let Some(label) = INTERVALS.iter().find(|(l, _)| *l == interval).map(|(l, _)| *l) else {
            return Vec::new();
        };
        match self.closed.get(&SeriesKey {
            symbol: symbol.to_string(),
            interval: label,
        }) {
            Some(ring) => {
                let start = ring.len().saturating_sub(count);
                ring.iter().skip(start).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    fn push_closed(&mut self, key: &SeriesKey, candle: Candle) {
        let ring = self
            .closed
            .entry(key.clone())
            .or_insert_with(|| VecDeque::with_capacity(self.max_closed + 1));
        ring.push_back(candle);
        while ring.len() > self.max_closed {
            ring.pop_front();
        }
    }
}

fn fresh_candle(symbol: &str, interval: &str, open_time: i64, price: f64, volume: f64) -> Candle {
    Candle {
        symbol: symbol.to_string(),
        interval: interval.to_string(),
        open_time,
        open: price,
        high: price,
        low: price,
        close: price,
        volume,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_time_is_interval_aligned() {
        let mut agg = CandleAggregator::new(10);
        agg.update("MERX", 100.0, 5.0, 61_500);
        let c = agg.current("MERX", "1m").unwrap();
        assert_eq!(c.open_time, 60_000);
        let c5 = agg.current("MERX", "5m").unwrap();
        assert_eq!(c5.open_time, 0);
    }

    #[test]
    fn rollover_closes_and_restarts() {
        let mut agg = CandleAggregator::new(10);
        assert!(agg.update("MERX", 100.0, 1.0, 0).is_empty());
        assert!(agg.update("MERX", 102.0, 1.0, 30_000).is_empty());

        // Crossing the 1m boundary closes exactly the 1m bar.
        let rolled = agg.update("MERX", 101.0, 1.0, 60_000);
        assert_eq!(rolled.len(), 1);
        let closed = &rolled[0];
        assert_eq!(closed.interval, "1m");
        assert_eq!(closed.open, 100.0);
        assert_eq!(closed.high, 102.0);
        assert_eq!(closed.close, 102.0);
        assert_eq!(closed.volume, 2.0);

        let fresh = agg.current("MERX", "1m").unwrap();
        assert_eq!(fresh.open_time, 60_000);
        assert_eq!(fresh.open, 101.0);
    }

    #[test]
    fn high_low_track_extremes() {
        let mut agg = CandleAggregator::new(10);
        agg.update("MERX", 100.0, 0.0, 0);
        agg.update("MERX", 97.5, 0.0, 1_000);
        agg.update("MERX", 103.2, 0.0, 2_000);
        let c = agg.current("MERX", "1m").unwrap();
        assert_eq!(c.low, 97.5);
        assert_eq!(c.high, 103.2);
        assert_eq!(c.close, 103.2);
    }

    #[test]
    fn closed_ring_is_bounded() {
        let mut agg = CandleAggregator::new(3);
        for i in 0..6 {
            agg.update("MERX", 100.0 + i as f64, 1.0, i * 60_000);
        }
        let recent = agg.recent_closed("MERX", "1m", 100);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent.last().unwrap().open, 104.0);
    }

    #[test]
    fn unknown_interval_reads_empty() {
        let agg = CandleAggregator::new(3);
        assert!(agg.recent_closed("MERX", "7m", 10).is_empty());
        assert!(agg.current("MERX", "7m").is_none());
    }
}
