//! Position ledger - OPEN -> CLOSED state machine
//!
//! The ledger is the only owner of position records. It is passed `&mut`
//! through each engine tick; closes are crate-private and driven by the
//! risk controller.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult, RejectReason};
use crate::strategy::Opportunity;
use crate::types::{at_or_below, is_valid_quote, Direction, ExitReason, PositionStatus};

/// Closed positions kept in memory for reporting
const MAX_CLOSED_HISTORY: usize = 1000;

/// A simulated stake on one market outcome. Prices are quote-space [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub position_id: String,
    pub symbol: String,
    pub market_id: String,
    pub direction: Direction,
    pub size_usd: f64,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub status: PositionStatus,
    pub exit_price: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
    pub realized_pnl: Option<f64>,
    pub exit_reason: Option<ExitReason>,
    #[serde(default)]
    pub fee_usd: f64,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    pub fn key(&self) -> (&str, &str, Direction) {
        (&self.symbol, &self.market_id, self.direction)
    }

    /// Relative move in the position's favour
    pub fn pnl_pct(&self, quote: f64) -> f64 {
        self.direction.sign() * (quote - self.entry_price) / self.entry_price
    }

    /// Mark-to-market, before fee
    pub fn unrealized_pnl(&self, quote: f64) -> f64 {
        self.size_usd * self.pnl_pct(quote)
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.entry_time
    }
}

/// P&L booked at close: signed relative move on the stake, minus fee
pub fn realized_pnl(
    direction: Direction,
    size_usd: f64,
    entry_price: f64,
    exit_price: f64,
    fee_usd: f64,
) -> f64 {
    direction.sign() * size_usd * (exit_price - entry_price) / entry_price - fee_usd
}

/// Capacity limits enforced on open
#[derive(Debug, Clone)]
pub struct LedgerLimits {
    pub max_positions: usize,
    pub max_position_size_usd: f64,
    pub cooldown_seconds: u64,
    pub fee_rate: f64,
}

#[derive(Debug)]
pub struct PositionLedger {
    limits: LedgerLimits,
    open: HashMap<String, Position>,
    closed: VecDeque<Position>,
}

impl PositionLedger {
    pub fn new(limits: LedgerLimits) -> Self {
        Self {
            limits,
            open: HashMap::new(),
            closed: VecDeque::new(),
        }
    }

    pub fn fee_for(&self, size_usd: f64) -> f64 {
        self.limits.fee_rate * size_usd
    }

    /// Open a position at the opportunity's quote
    pub fn open(
        &mut self,
        opportunity: &Opportunity,
        size_usd: f64,
        now: DateTime<Utc>,
    ) -> EngineResult<Position> {
        if self.open.len() >= self.limits.max_positions {
            return Err(EngineError::CapacityExceeded(RejectReason::MaxPositions));
        }
        if !at_or_below(size_usd, self.limits.max_position_size_usd) {
            return Err(EngineError::CapacityExceeded(RejectReason::PositionTooLarge));
        }
        if !(size_usd.is_finite() && size_usd > 0.0) {
            return Err(EngineError::InvalidPrice {
                context: "position size".to_string(),
                value: size_usd,
            });
        }

        let entry_price = opportunity.quote_at_detection;
        if !is_valid_quote(entry_price) || entry_price <= 0.0 {
            return Err(EngineError::InvalidPrice {
                context: format!("entry quote for {}", opportunity.market_id),
                value: entry_price,
            });
        }

        let cooldown = Duration::seconds(self.limits.cooldown_seconds as i64);
        let duplicate = self.open.values().any(|p| {
            p.key()
                == (
                    opportunity.symbol.as_str(),
                    opportunity.market_id.as_str(),
                    opportunity.direction,
                )
                && now - p.entry_time < cooldown
        });
        if duplicate {
            return Err(EngineError::CapacityExceeded(RejectReason::DuplicateKey));
        }

        let position = Position {
            position_id: uuid::Uuid::new_v4().to_string(),
            symbol: opportunity.symbol.clone(),
            market_id: opportunity.market_id.clone(),
            direction: opportunity.direction,
            size_usd,
            entry_price,
            entry_time: now,
            status: PositionStatus::Open,
            exit_price: None,
            exit_time: None,
            realized_pnl: None,
            exit_reason: None,
            fee_usd: 0.0,
        };

        info!(
            id = %position.position_id,
            symbol = %position.symbol,
            market = %position.market_id,
            direction = %position.direction,
            size = position.size_usd,
            entry = position.entry_price,
            "📈 Position opened"
        );

        self.open
            .insert(position.position_id.clone(), position.clone());
        Ok(position)
    }

    /// Close an OPEN position. pnl is computed here and nowhere else.
    pub(crate) fn close(
        &mut self,
        position_id: &str,
        exit_price: f64,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> EngineResult<Position> {
        if !is_valid_quote(exit_price) {
            return Err(EngineError::InvalidPrice {
                context: format!("exit quote for {}", position_id),
                value: exit_price,
            });
        }

        let Some(mut position) = self.open.remove(position_id) else {
            if self.closed.iter().any(|p| p.position_id == position_id) {
                return Err(EngineError::PositionClosed(position_id.to_string()));
            }
            return Err(EngineError::PositionNotFound(position_id.to_string()));
        };

        let fee = self.fee_for(position.size_usd);
        let pnl = realized_pnl(
            position.direction,
            position.size_usd,
            position.entry_price,
            exit_price,
            fee,
        );

        position.status = PositionStatus::Closed;
        position.exit_price = Some(exit_price);
        position.exit_time = Some(now);
        position.realized_pnl = Some(pnl);
        position.exit_reason = Some(reason);
        position.fee_usd = fee;

        let emoji = if pnl >= 0.0 { "✅" } else { "❌" };
        info!(
            id = %position.position_id,
            market = %position.market_id,
            reason = %reason,
            entry = position.entry_price,
            exit = exit_price,
            pnl,
            "{} Position closed",
            emoji
        );

        self.push_closed(position.clone());
        Ok(position)
    }

    /// Re-admit a persisted position after restart. Returns false if the id
    /// is already known.
    pub fn restore(&mut self, position: Position) -> bool {
        let id = position.position_id.clone();
        if self.open.contains_key(&id) || self.closed.iter().any(|p| p.position_id == id) {
            return false;
        }
        debug!(id = %id, status = %position.status, "Restoring position");
        if position.is_open() {
            self.open.insert(id, position);
        } else {
            self.push_closed(position);
        }
        true
    }

    fn push_closed(&mut self, position: Position) {
        self.closed.push_back(position);
        while self.closed.len() > MAX_CLOSED_HISTORY {
            self.closed.pop_front();
        }
    }

    /// Open positions, oldest first
    pub fn open_positions(&self) -> Vec<Position> {
        let mut positions: Vec<Position> = self.open.values().cloned().collect();
        positions.sort_by(|a, b| {
            a.entry_time
                .cmp(&b.entry_time)
                .then_with(|| a.position_id.cmp(&b.position_id))
        });
        positions
    }

    pub fn open_ids(&self) -> Vec<String> {
        self.open_positions()
            .into_iter()
            .map(|p| p.position_id)
            .collect()
    }

    pub fn get(&self, position_id: &str) -> Option<&Position> {
        self.open
            .get(position_id)
            .or_else(|| self.closed.iter().find(|p| p.position_id == position_id))
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn closed_history(&self) -> impl Iterator<Item = &Position> {
        self.closed.iter()
    }

    /// Mark-to-market of every open position that has a quote
    pub fn unrealized_pnl(&self, quotes: &HashMap<String, f64>) -> f64 {
        self.open
            .values()
            .filter_map(|p| quotes.get(&p.market_id).map(|q| p.unrealized_pnl(*q)))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::Spike;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn limits() -> LedgerLimits {
        LedgerLimits {
            max_positions: 2,
            max_position_size_usd: 500.0,
            cooldown_seconds: 60,
            fee_rate: 0.02,
        }
    }

    fn opp(market: &str, direction: Direction, quote: f64) -> Opportunity {
        Opportunity {
            symbol: "BTC/USDT".to_string(),
            market_id: market.to_string(),
            direction,
            divergence: 0.03,
            expected_profit: 0.5,
            confidence: 0.5,
            quote_at_detection: quote,
            spike: Spike {
                symbol: "BTC/USDT".to_string(),
                direction,
                magnitude: 0.02,
                baseline_price: 50_000.0,
                current_price: 51_000.0,
                detected_at: t(0),
            },
        }
    }

    #[test]
    fn open_then_close_books_pnl_once() {
        let mut ledger = PositionLedger::new(limits());
        let pos = ledger
            .open(&opp("btc-updown-15m", Direction::Up, 0.35), 100.0, t(0))
            .unwrap();
        assert!(pos.is_open());
        assert_eq!(ledger.open_count(), 1);

        let closed = ledger
            .close(&pos.position_id, 0.70, ExitReason::TakeProfit, t(30))
            .unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert!((closed.realized_pnl.unwrap() - 98.0).abs() < 1e-9);
        assert_eq!(closed.fee_usd, 2.0);

        // Second close must not recompute
        let err = ledger
            .close(&pos.position_id, 0.10, ExitReason::Manual, t(40))
            .unwrap_err();
        assert!(matches!(err, EngineError::PositionClosed(_)));
        assert_eq!(
            ledger.get(&pos.position_id).unwrap().realized_pnl,
            closed.realized_pnl
        );
    }

    #[test]
    fn down_position_profits_when_quote_falls() {
        let mut ledger = PositionLedger::new(limits());
        let pos = ledger
            .open(&opp("m", Direction::Down, 0.60), 100.0, t(0))
            .unwrap();
        let closed = ledger
            .close(&pos.position_id, 0.30, ExitReason::TakeProfit, t(10))
            .unwrap();
        assert!((closed.realized_pnl.unwrap() - 48.0).abs() < 1e-9);
    }

    #[test]
    fn capacity_limits() {
        let mut ledger = PositionLedger::new(limits());
        let err = ledger
            .open(&opp("a", Direction::Up, 0.4), 600.0, t(0))
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::CapacityExceeded(RejectReason::PositionTooLarge)
        ));

        ledger.open(&opp("a", Direction::Up, 0.4), 100.0, t(0)).unwrap();
        let err = ledger
            .open(&opp("a", Direction::Up, 0.4), 100.0, t(10))
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::CapacityExceeded(RejectReason::DuplicateKey)
        ));

        // Same key after the cooldown is allowed while under max_positions
        ledger.open(&opp("a", Direction::Up, 0.4), 100.0, t(61)).unwrap();
        let err = ledger
            .open(&opp("b", Direction::Up, 0.4), 100.0, t(62))
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::CapacityExceeded(RejectReason::MaxPositions)
        ));
    }

    #[test]
    fn close_rejects_bad_exit_and_unknown_id() {
        let mut ledger = PositionLedger::new(limits());
        let pos = ledger.open(&opp("a", Direction::Up, 0.4), 100.0, t(0)).unwrap();
        assert!(matches!(
            ledger.close(&pos.position_id, 51_000.0, ExitReason::Manual, t(1)),
            Err(EngineError::InvalidPrice { .. })
        ));
        assert!(ledger.get(&pos.position_id).unwrap().is_open());
        assert!(matches!(
            ledger.close("nope", 0.5, ExitReason::Manual, t(1)),
            Err(EngineError::PositionNotFound(_))
        ));
    }

    #[test]
    fn restore_is_idempotent() {
        let mut ledger = PositionLedger::new(limits());
        let pos = ledger.open(&opp("a", Direction::Up, 0.4), 100.0, t(0)).unwrap();

        let mut fresh = PositionLedger::new(limits());
        assert!(fresh.restore(pos.clone()));
        assert!(!fresh.restore(pos));
        assert_eq!(fresh.open_count(), 1);
    }
}
