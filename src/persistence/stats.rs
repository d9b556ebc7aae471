//! Performance statistics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ledger::Position;
use crate::types::ExitReason;

/// Aggregate counters written to the stats CSV
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingStats {
    pub timestamp: DateTime<Utc>,
    pub balance: f64,
    pub equity: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub trade_count: u64,
    pub wins: u64,
    pub losses: u64,
    /// Percent, 0..100
    pub win_rate: f64,
    pub open_positions: usize,
}

/// Running performance of closed positions against a paper balance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsTracker {
    initial_balance: f64,
    realized_pnl: f64,
    total_fees: f64,
    trade_count: u64,
    wins: u64,
    losses: u64,
    largest_win: f64,
    largest_loss: f64,
    exit_counts: BTreeMap<String, u64>,
}

impl StatsTracker {
    pub fn new(initial_balance: f64) -> Self {
        Self {
            initial_balance,
            realized_pnl: 0.0,
            total_fees: 0.0,
            trade_count: 0,
            wins: 0,
            losses: 0,
            largest_win: 0.0,
            largest_loss: 0.0,
            exit_counts: BTreeMap::new(),
        }
    }

    pub fn record_close(&mut self, position: &Position) {
        let Some(pnl) = position.realized_pnl else {
            return;
        };

        self.trade_count += 1;
        self.realized_pnl += pnl;
        self.total_fees += position.fee_usd;
        if pnl > 0.0 {
            self.wins += 1;
            self.largest_win = self.largest_win.max(pnl);
        } else {
            self.losses += 1;
            self.largest_loss = self.largest_loss.min(pnl);
        }
        if let Some(reason) = position.exit_reason {
            *self.exit_counts.entry(reason.as_str().to_string()).or_insert(0) += 1;
        }
    }

    pub fn balance(&self) -> f64 {
        self.initial_balance + self.realized_pnl
    }

    pub fn realized_pnl(&self) -> f64 {
        self.realized_pnl
    }

    pub fn trade_count(&self) -> u64 {
        self.trade_count
    }

    pub fn win_rate(&self) -> f64 {
        if self.trade_count == 0 {
            0.0
        } else {
            self.wins as f64 / self.trade_count as f64 * 100.0
        }
    }

    pub fn average_pnl(&self) -> f64 {
        if self.trade_count == 0 {
            0.0
        } else {
            self.realized_pnl / self.trade_count as f64
        }
    }

    pub fn exit_count(&self, reason: ExitReason) -> u64 {
        self.exit_counts.get(reason.as_str()).copied().unwrap_or(0)
    }

    pub fn snapshot(
        &self,
        unrealized_pnl: f64,
        open_positions: usize,
        now: DateTime<Utc>,
    ) -> TradingStats {
        let balance = self.balance();
        TradingStats {
            timestamp: now,
            balance,
            equity: balance + unrealized_pnl,
            realized_pnl: self.realized_pnl,
            unrealized_pnl,
            trade_count: self.trade_count,
            wins: self.wins,
            losses: self.losses,
            win_rate: self.win_rate(),
            open_positions,
        }
    }

    /// One-line summary for status logs
    pub fn summary(&self) -> String {
        let exits = ExitReason::ALL
            .iter()
            .map(|r| format!("{}={}", r, self.exit_count(*r)))
            .collect::<Vec<_>>()
            .join(" ");
        format!(
            concat!(
                "trades={} W/L={}/{} winrate={:.1}% pnl=${:.2} avg=${:.2} ",
                "fees=${:.2} best=${:.2} worst=${:.2} balance=${:.2} [{}]"
            ),
            self.trade_count,
            self.wins,
            self.losses,
            self.win_rate(),
            self.realized_pnl,
            self.average_pnl(),
            self.total_fees,
            self.largest_win,
            self.largest_loss,
            self.balance(),
            exits
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, PositionStatus};
    use chrono::Utc;

    fn closed(pnl: f64, reason: ExitReason) -> Position {
        Position {
            position_id: uuid::Uuid::new_v4().to_string(),
            symbol: "BTC/USDT".to_string(),
            market_id: "btc-updown-15m".to_string(),
            direction: Direction::Up,
            size_usd: 100.0,
            entry_price: 0.4,
            entry_time: Utc::now(),
            status: PositionStatus::Closed,
            exit_price: Some(0.5),
            exit_time: Some(Utc::now()),
            realized_pnl: Some(pnl),
            exit_reason: Some(reason),
            fee_usd: 2.0,
        }
    }

    #[test]
    fn tracks_wins_losses_and_exits() {
        let mut stats = StatsTracker::new(1000.0);
        stats.record_close(&closed(50.0, ExitReason::TakeProfit));
        stats.record_close(&closed(-20.0, ExitReason::StopLoss));
        stats.record_close(&closed(10.0, ExitReason::TakeProfit));

        assert_eq!(stats.trade_count(), 3);
        assert!((stats.balance() - 1040.0).abs() < 1e-9);
        assert!((stats.win_rate() - 66.666_666).abs() < 1e-3);
        assert_eq!(stats.exit_count(ExitReason::TakeProfit), 2);
        assert_eq!(stats.exit_count(ExitReason::MaxHoldTime), 0);

        let snap = stats.snapshot(5.0, 1, Utc::now());
        assert!((snap.equity - 1045.0).abs() < 1e-9);
        assert_eq!(snap.wins, 2);
        assert!(stats.summary().contains("take_profit=2"));
    }

    #[test]
    fn round_trips_through_json() {
        let mut stats = StatsTracker::new(1000.0);
        stats.record_close(&closed(-5.0, ExitReason::MaxHoldTime));
        let json = serde_json::to_string(&stats).unwrap();
        let back: StatsTracker = serde_json::from_str(&json).unwrap();
        assert_eq!(back, stats);
    }
}
