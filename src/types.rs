//! Core types used throughout polyspike
//!
//! Defines the shared vocabulary: directions, price points, exit reasons.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tolerance for threshold comparisons on ratios built from decimal inputs.
pub const THRESHOLD_EPSILON: f64 = 1e-9;

/// `value >= threshold`, tolerant to float rounding
pub fn at_or_above(value: f64, threshold: f64) -> bool {
    value >= threshold - THRESHOLD_EPSILON
}

/// `value <= threshold`, tolerant to float rounding
pub fn at_or_below(value: f64, threshold: f64) -> bool {
    value <= threshold + THRESHOLD_EPSILON
}

/// Direction of a spike, and of the position taken on it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

impl Default for Direction {
    fn default() -> Self {
        Direction::Up
    }
}

impl Direction {
    /// +1.0 for up, -1.0 for down. Applied to quote moves to get position P&L.
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Up => 1.0,
            Direction::Down => -1.0,
        }
    }

    pub fn from_change(change: f64) -> Self {
        if change >= 0.0 {
            Direction::Up
        } else {
            Direction::Down
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" | "yes" | "long" => Some(Direction::Up),
            "down" | "no" | "short" => Some(Direction::Down),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => write!(f, "UP"),
            Direction::Down => write!(f, "DOWN"),
        }
    }
}

/// A single observed spot price
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub symbol: String,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

impl PricePoint {
    pub fn new(symbol: impl Into<String>, price: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            timestamp,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.price.is_finite() && self.price > 0.0
    }
}

/// Lifecycle status of a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionStatus::Open => write!(f, "OPEN"),
            PositionStatus::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Why a position was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    MaxHoldTime,
    EmergencyShutdown,
    Manual,
}

impl ExitReason {
    pub const ALL: [ExitReason; 5] = [
        ExitReason::TakeProfit,
        ExitReason::StopLoss,
        ExitReason::MaxHoldTime,
        ExitReason::EmergencyShutdown,
        ExitReason::Manual,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::TakeProfit => "take_profit",
            ExitReason::StopLoss => "stop_loss",
            ExitReason::MaxHoldTime => "max_hold_time",
            ExitReason::EmergencyShutdown => "emergency_shutdown",
            ExitReason::Manual => "manual",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quote-space values are probabilities
pub fn is_valid_quote(quote: f64) -> bool {
    quote.is_finite() && (0.0..=1.0).contains(&quote)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_helpers_absorb_rounding() {
        // (0.57 - 0.30) / 0.30 lands just under 0.9 in f64
        let pct = (0.57 - 0.30) / 0.30;
        assert!(at_or_above(pct, 0.90));
        assert!(!at_or_above(0.89, 0.90));
        assert!(at_or_below(-0.15, -0.15));
    }

    #[test]
    fn direction_parsing_and_sign() {
        assert_eq!(Direction::parse("UP"), Some(Direction::Up));
        assert_eq!(Direction::parse("no"), Some(Direction::Down));
        assert_eq!(Direction::parse("sideways"), None);
        assert_eq!(Direction::from_change(-0.01), Direction::Down);
        assert_eq!(Direction::Down.sign(), -1.0);
    }

    #[test]
    fn exit_reason_serializes_snake_case() {
        let json = serde_json::to_string(&ExitReason::MaxHoldTime).unwrap();
        assert_eq!(json, "\"max_hold_time\"");
    }
}
