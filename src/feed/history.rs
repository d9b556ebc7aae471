//! Rolling per-symbol price window

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::types::PricePoint;

/// Keeps the last `window` of spot prices for every symbol seen.
///
/// Points arrive in timestamp order per symbol. Eviction runs on every update,
/// measured back from the newest point, so the front of each deque is always
/// inside the window.
#[derive(Debug, Clone)]
pub struct PriceHistoryTracker {
    window: Duration,
    windows: HashMap<String, VecDeque<PricePoint>>,
}

impl PriceHistoryTracker {
    pub fn new(window_seconds: u64) -> Self {
        Self {
            window: Duration::seconds(window_seconds as i64),
            windows: HashMap::new(),
        }
    }

    pub fn window_seconds(&self) -> i64 {
        self.window.num_seconds()
    }

    /// Append a price. Returns `Ok(false)` when the point is older than the
    /// newest retained one and was dropped.
    pub fn update(
        &mut self,
        symbol: &str,
        price: f64,
        timestamp: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let point = PricePoint::new(symbol, price, timestamp);
        self.push(point)
    }

    pub fn push(&mut self, point: PricePoint) -> EngineResult<bool> {
        if !point.is_valid() {
            return Err(EngineError::InvalidPrice {
                context: point.symbol,
                value: point.price,
            });
        }

        let window = self.window;
        let deque = self.windows.entry(point.symbol.clone()).or_default();

        if let Some(newest) = deque.back() {
            if point.timestamp < newest.timestamp {
                debug!(
                    symbol = %point.symbol,
                    newest = %newest.timestamp,
                    got = %point.timestamp,
                    "Dropping out-of-order price"
                );
                return Ok(false);
            }
        }

        let cutoff = point.timestamp - window;
        deque.push_back(point);
        while deque.front().map_or(false, |p| p.timestamp < cutoff) {
            deque.pop_front();
        }

        Ok(true)
    }

    /// Evict against wall-clock time. Symbols left empty keep their entry so
    /// they are still "known" to `snapshot`.
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.window;
        let mut evicted = 0;
        for deque in self.windows.values_mut() {
            while deque.front().map_or(false, |p| p.timestamp < cutoff) {
                deque.pop_front();
                evicted += 1;
            }
        }
        evicted
    }

    /// Current ordered window, oldest first
    pub fn snapshot(&self, symbol: &str) -> EngineResult<Vec<PricePoint>> {
        self.windows
            .get(symbol)
            .map(|d| d.iter().cloned().collect())
            .ok_or_else(|| EngineError::UnknownSymbol(symbol.to_string()))
    }

    pub(crate) fn window(&self, symbol: &str) -> EngineResult<&VecDeque<PricePoint>> {
        self.windows
            .get(symbol)
            .ok_or_else(|| EngineError::UnknownSymbol(symbol.to_string()))
    }

    pub fn latest(&self, symbol: &str) -> Option<&PricePoint> {
        self.windows.get(symbol).and_then(|d| d.back())
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.windows.keys().map(String::as_str)
    }

    pub fn len(&self, symbol: &str) -> usize {
        self.windows.get(symbol).map_or(0, VecDeque::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn never_retains_points_older_than_window() {
        let mut tracker = PriceHistoryTracker::new(30);
        for s in 0..=100 {
            tracker.update("BTC/USDT", 50_000.0 + s as f64, t(s)).unwrap();
            let window = tracker.snapshot("BTC/USDT").unwrap();
            let newest = window.last().unwrap().timestamp;
            assert!(window
                .iter()
                .all(|p| newest - p.timestamp <= Duration::seconds(30)));
        }
        assert_eq!(tracker.len("BTC/USDT"), 31);
        assert_eq!(tracker.snapshot("BTC/USDT").unwrap()[0].timestamp, t(70));
    }

    #[test]
    fn rejects_invalid_and_out_of_order() {
        let mut tracker = PriceHistoryTracker::new(30);
        assert!(tracker.update("ETH/USDT", 0.0, t(0)).is_err());
        assert!(tracker.update("ETH/USDT", f64::NAN, t(0)).is_err());

        assert!(tracker.update("ETH/USDT", 2500.0, t(10)).unwrap());
        assert!(!tracker.update("ETH/USDT", 2501.0, t(5)).unwrap());
        assert_eq!(tracker.len("ETH/USDT"), 1);
        assert_eq!(tracker.latest("ETH/USDT").unwrap().price, 2500.0);
    }

    #[test]
    fn unknown_symbol_snapshot_fails() {
        let tracker = PriceHistoryTracker::new(30);
        assert!(matches!(
            tracker.snapshot("DOGE/USDT"),
            Err(EngineError::UnknownSymbol(_))
        ));
    }

    #[test]
    fn prune_evicts_quiet_symbols() {
        let mut tracker = PriceHistoryTracker::new(30);
        tracker.update("BTC/USDT", 50_000.0, t(0)).unwrap();
        tracker.update("BTC/USDT", 50_010.0, t(5)).unwrap();
        assert_eq!(tracker.prune(t(20)), 0);
        assert_eq!(tracker.prune(t(34)), 1);
        assert_eq!(tracker.prune(t(100)), 1);
        assert!(tracker.snapshot("BTC/USDT").unwrap().is_empty());
        assert!(tracker.latest("BTC/USDT").is_none());
    }
}
