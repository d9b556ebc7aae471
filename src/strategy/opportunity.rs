//! Divergence scoring of a spike against a market quote

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::feed::Spike;
use crate::types::{at_or_above, is_valid_quote, Direction};

/// Divergence at which confidence saturates
const CONFIDENCE_DIVERGENCE_SCALE: f64 = 0.2;

/// A spike the market has not priced in yet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub symbol: String,
    pub market_id: String,
    pub direction: Direction,
    pub divergence: f64,
    /// Quote units, net of fee
    pub expected_profit: f64,
    /// 0..1, informational only
    pub confidence: f64,
    pub quote_at_detection: f64,
    pub spike: Spike,
}

impl Opportunity {
    pub fn key(&self) -> (String, String, Direction) {
        (self.symbol.clone(), self.market_id.clone(), self.direction)
    }
}

#[derive(Debug, Clone)]
pub struct OpportunityEngine {
    divergence_threshold: f64,
    min_profit_threshold: f64,
    fee_rate: f64,
}

impl OpportunityEngine {
    pub fn new(divergence_threshold: f64, min_profit_threshold: f64, fee_rate: f64) -> Self {
        Self {
            divergence_threshold,
            min_profit_threshold,
            fee_rate,
        }
    }

    /// How far the quote still has to travel for the spike direction
    pub fn divergence(direction: Direction, magnitude: f64, quote: f64) -> f64 {
        match direction {
            Direction::Up => magnitude * (1.0 - quote),
            Direction::Down => magnitude * quote,
        }
    }

    /// Gap between the quote and resolution in the spike direction, net of fee
    pub fn expected_profit(&self, direction: Direction, quote: f64) -> f64 {
        let gap = match direction {
            Direction::Up => 1.0 - quote,
            Direction::Down => quote,
        };
        (gap - self.fee_rate).max(0.0)
    }

    pub fn confidence(divergence: f64, quote: f64) -> f64 {
        let div_part = (divergence / CONFIDENCE_DIVERGENCE_SCALE).min(1.0);
        let extremity = (quote - 0.5).abs() * 2.0;
        (0.7 * div_part + 0.3 * extremity).clamp(0.0, 1.0)
    }

    /// Score a spike against a market. `Ok(None)` when either gate fails.
    pub fn evaluate(
        &self,
        spike: &Spike,
        market_id: &str,
        quote: Option<f64>,
    ) -> EngineResult<Option<Opportunity>> {
        let quote = match quote {
            Some(q) if is_valid_quote(q) => q,
            _ => {
                return Err(EngineError::MissingQuote {
                    market_id: market_id.to_string(),
                })
            }
        };

        let divergence = Self::divergence(spike.direction, spike.magnitude, quote);
        let expected_profit = self.expected_profit(spike.direction, quote);

        if !at_or_above(divergence, self.divergence_threshold) {
            debug!(
                symbol = %spike.symbol,
                market = market_id,
                divergence,
                threshold = self.divergence_threshold,
                "Divergence below threshold"
            );
            return Ok(None);
        }
        if !at_or_above(expected_profit, self.min_profit_threshold) {
            debug!(
                symbol = %spike.symbol,
                market = market_id,
                expected_profit,
                "Expected profit below threshold"
            );
            return Ok(None);
        }

        Ok(Some(Opportunity {
            symbol: spike.symbol.clone(),
            market_id: market_id.to_string(),
            direction: spike.direction,
            divergence,
            expected_profit,
            confidence: Self::confidence(divergence, quote),
            quote_at_detection: quote,
            spike: spike.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn spike(direction: Direction, magnitude: f64) -> Spike {
        Spike {
            symbol: "BTC/USDT".to_string(),
            direction,
            magnitude,
            baseline_price: 50_000.0,
            current_price: 50_000.0 * (1.0 + direction.sign() * magnitude),
            detected_at: Utc::now(),
        }
    }

    #[test]
    fn divergence_by_direction() {
        let up = OpportunityEngine::divergence(Direction::Up, 0.05, 0.30);
        let down = OpportunityEngine::divergence(Direction::Down, 0.05, 0.30);
        assert!((up - 0.035).abs() < 1e-12);
        assert!((down - 0.015).abs() < 1e-12);
    }

    #[test]
    fn emits_when_both_gates_pass() {
        let engine = OpportunityEngine::new(0.02, 0.02, 0.02);
        let opp = engine
            .evaluate(&spike(Direction::Up, 0.05), "btc-updown-15m", Some(0.30))
            .unwrap()
            .unwrap();
        assert_eq!(opp.direction, Direction::Up);
        assert!((opp.expected_profit - 0.68).abs() < 1e-12);
        assert!(opp.confidence > 0.0 && opp.confidence <= 1.0);
        assert_eq!(opp.quote_at_detection, 0.30);

        // Down spike at the same quote: 0.015 < 0.02
        assert!(engine
            .evaluate(&spike(Direction::Down, 0.05), "btc-updown-15m", Some(0.30))
            .unwrap()
            .is_none());
    }

    #[test]
    fn expected_profit_gate_and_floor() {
        let engine = OpportunityEngine::new(0.001, 0.05, 0.02);
        // Quote near resolution: gap 0.03 minus fee leaves 0.01
        assert!(engine
            .evaluate(&spike(Direction::Up, 0.5), "m", Some(0.97))
            .unwrap()
            .is_none());
        assert_eq!(engine.expected_profit(Direction::Down, 0.01), 0.0);
    }

    #[test]
    fn missing_or_invalid_quote_is_an_error() {
        let engine = OpportunityEngine::new(0.02, 0.02, 0.02);
        let s = spike(Direction::Up, 0.05);
        for quote in [None, Some(1.2), Some(-0.1), Some(f64::NAN)] {
            assert!(matches!(
                engine.evaluate(&s, "m", quote),
                Err(EngineError::MissingQuote { .. })
            ));
        }
    }

    #[test]
    fn confidence_formula() {
        let c = OpportunityEngine::confidence(0.1, 0.3);
        assert!((c - (0.7 * 0.5 + 0.3 * 0.4)).abs() < 1e-12);
        assert_eq!(OpportunityEngine::confidence(0.5, 1.0), 1.0);
    }
}
