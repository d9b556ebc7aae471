//! Spike detection over a short sub-window of the price history

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::history::PriceHistoryTracker;
use crate::error::EngineResult;
use crate::types::{at_or_above, Direction};

/// A rapid relative move in a spot price
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spike {
    pub symbol: String,
    pub direction: Direction,
    /// |current - baseline| / baseline
    pub magnitude: f64,
    pub baseline_price: f64,
    pub current_price: f64,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SpikeDetector {
    threshold: f64,
    window: Duration,
}

impl SpikeDetector {
    pub fn new(threshold: f64, window_seconds: u64) -> Self {
        Self {
            threshold,
            window: Duration::seconds(window_seconds as i64),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Compare the newest point against the oldest point still inside the
    /// sub-window.
    pub fn detect(
        &self,
        tracker: &PriceHistoryTracker,
        symbol: &str,
    ) -> EngineResult<Option<Spike>> {
        self.detect_within(tracker, symbol, self.window)
    }

    pub fn detect_within(
        &self,
        tracker: &PriceHistoryTracker,
        symbol: &str,
        window: Duration,
    ) -> EngineResult<Option<Spike>> {
        let points = tracker.window(symbol)?;
        let Some(current) = points.back() else {
            return Ok(None);
        };

        let cutoff = current.timestamp - window;
        let Some(baseline) = points.iter().find(|p| p.timestamp >= cutoff) else {
            return Ok(None);
        };

        // Baseline and current must be two distinct points
        if std::ptr::eq(baseline, current) || baseline.price == 0.0 {
            return Ok(None);
        }

        let change = (current.price - baseline.price) / baseline.price;
        let magnitude = change.abs();
        if !at_or_above(magnitude, self.threshold) {
            return Ok(None);
        }

        let spike = Spike {
            symbol: symbol.to_string(),
            direction: Direction::from_change(change),
            magnitude,
            baseline_price: baseline.price,
            current_price: current.price,
            detected_at: current.timestamp,
        };

        debug!(
            symbol = %spike.symbol,
            direction = %spike.direction,
            magnitude = spike.magnitude,
            baseline = spike.baseline_price,
            current = spike.current_price,
            "Spike detected"
        );

        Ok(Some(spike))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn two_percent_move_is_an_up_spike() {
        let mut tracker = PriceHistoryTracker::new(30);
        tracker.update("BTC/USDT", 100.0, t(0)).unwrap();
        tracker.update("BTC/USDT", 101.0, t(4)).unwrap();
        tracker.update("BTC/USDT", 102.0, t(8)).unwrap();

        let detector = SpikeDetector::new(0.015, 10);
        let spike = detector.detect(&tracker, "BTC/USDT").unwrap().unwrap();
        assert_eq!(spike.direction, Direction::Up);
        assert!((spike.magnitude - 0.02).abs() < 1e-12);
        assert_eq!(spike.baseline_price, 100.0);
        assert_eq!(spike.detected_at, t(8));
    }

    #[test]
    fn down_move_and_baseline_outside_subwindow() {
        let mut tracker = PriceHistoryTracker::new(30);
        // 110 is 20s before the newest point, outside a 10s sub-window
        tracker.update("ETH/USDT", 110.0, t(0)).unwrap();
        tracker.update("ETH/USDT", 100.0, t(12)).unwrap();
        tracker.update("ETH/USDT", 97.0, t(20)).unwrap();

        let detector = SpikeDetector::new(0.015, 10);
        let spike = detector.detect(&tracker, "ETH/USDT").unwrap().unwrap();
        assert_eq!(spike.direction, Direction::Down);
        assert_eq!(spike.baseline_price, 100.0);
        assert!((spike.magnitude - 0.03).abs() < 1e-12);
    }

    #[test]
    fn small_moves_and_single_points_do_not_fire() {
        let mut tracker = PriceHistoryTracker::new(30);
        tracker.update("BTC/USDT", 100.0, t(0)).unwrap();

        let detector = SpikeDetector::new(0.015, 10);
        assert!(detector.detect(&tracker, "BTC/USDT").unwrap().is_none());

        tracker.update("BTC/USDT", 101.0, t(5)).unwrap();
        assert!(detector.detect(&tracker, "BTC/USDT").unwrap().is_none());

        // Only the newest point is inside the sub-window
        tracker.update("BTC/USDT", 110.0, t(25)).unwrap();
        assert!(detector.detect(&tracker, "BTC/USDT").unwrap().is_none());
    }

    #[test]
    fn unknown_symbol_is_an_error() {
        let tracker = PriceHistoryTracker::new(30);
        let detector = SpikeDetector::new(0.015, 10);
        assert!(matches!(
            detector.detect(&tracker, "SOL/USDT"),
            Err(EngineError::UnknownSymbol(_))
        ));
    }
}
